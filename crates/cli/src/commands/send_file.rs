use std::path::Path;
use std::time::Duration;

use xft::transfer::FALLBACK_FILE_NAME;
use xft::{Client, TransferReport};

use super::{SESSION_KEY, parse_address};
use crate::cli::SendFileArgs;
use crate::error::Result;

pub async fn execute(client: &Client, args: SendFileArgs) -> Result<TransferReport> {
	let to = parse_address(&args.to)?;
	let bytes = tokio::fs::read(&args.path).await?;
	let name = args.name.unwrap_or_else(|| announced_name(&args.path));

	let options = client
		.transfers()
		.options()
		.clone()
		.with_block_size(args.block_size)
		.with_stanza(args.stanza.into())
		.with_handshake_timeout(Duration::from_millis(args.timeout_ms));

	tracing::info!(to = %to, file = %name, size = bytes.len(), "sending file");
	let report = client
		.transfers()
		.send_file_with(SESSION_KEY, &to, &name, &bytes, &options)
		.await?;
	tracing::info!(sid = %report.sid, blocks = report.blocks, "file sent");
	Ok(report)
}

fn announced_name(path: &Path) -> String {
	path.file_name()
		.and_then(|name| name.to_str())
		.map_or_else(|| FALLBACK_FILE_NAME.to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;

	#[test]
	fn announced_name_strips_directories() {
		assert_eq!(announced_name(&PathBuf::from("/tmp/out/report.pdf")), "report.pdf");
		assert_eq!(announced_name(&PathBuf::from("/")), FALLBACK_FILE_NAME);
	}
}
