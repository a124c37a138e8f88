use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use xft::transfer::FALLBACK_FILE_NAME;
use xft::{Client, EngineEvent, EventOptions, ReceivedFile};

use super::SESSION_KEY;
use crate::cli::ListenArgs;
use crate::error::Result;
use crate::output;

#[derive(Debug, Default, Serialize)]
pub struct ListenSummary {
	pub events: usize,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub saved: Vec<PathBuf>,
}

/// Streams events as JSON lines until Ctrl-C or `--count` is reached.
pub async fn execute(client: &Client, args: ListenArgs) -> Result<ListenSummary> {
	let options = EventOptions::default()
		.with_session_timeout(Duration::from_secs(args.session_timeout))
		.with_raw_stanzas(args.raw);
	let mut events = client.events(SESSION_KEY, options)?;
	if let Some(dir) = &args.save_dir {
		tokio::fs::create_dir_all(dir)
			.await
			.with_context(|| format!("creating {}", dir.display()))?;
	}

	let mut summary = ListenSummary::default();
	let ctrl_c = tokio::signal::ctrl_c();
	tokio::pin!(ctrl_c);

	while args.count.is_none_or(|limit| summary.events < limit) {
		let event = tokio::select! {
			event = events.recv() => match event {
				Some(event) => event,
				None => break,
			},
			_ = &mut ctrl_c => {
				tracing::info!("interrupted, stopping");
				break;
			}
		};
		summary.events += 1;

		if let (EngineEvent::FileReceived(file), Some(dir)) = (&event, &args.save_dir) {
			let path = save(dir, file).await?;
			tracing::info!(sid = %file.sid, path = %path.display(), "file saved");
			summary.saved.push(path);
		}
		output::print_event(&event.to_json());
	}

	Ok(summary)
}

/// Writes `file` into `dir` under its announced name, never outside `dir`
/// and never over an existing file.
async fn save(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
	let name = Path::new(&file.file_name)
		.file_name()
		.and_then(|name| name.to_str())
		.unwrap_or(FALLBACK_FILE_NAME);

	let mut path = dir.join(name);
	if tokio::fs::try_exists(&path).await? {
		path = dir.join(format!("{}-{name}", file.sid));
	}
	let bytes = file.decode()?;
	tokio::fs::write(&path, bytes)
		.await
		.with_context(|| format!("writing {}", path.display()))?;
	Ok(path)
}
