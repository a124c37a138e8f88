mod listen;
mod resolve;
mod send_file;
mod send_message;

use std::time::Instant;

use xft::{Client, Jid};

use crate::cli::{Cli, Commands};
use crate::config::{Profile, Settings};
use crate::error::{CliError, Result};
use crate::output::{self, OutputFormat, ResultBuilder};

/// Registry key of the single session the CLI opens.
pub const SESSION_KEY: &str = "cli";

pub async fn dispatch(cli: Cli, format: OutputFormat) -> Result<()> {
	let started = Instant::now();
	let profile = match &cli.config {
		Some(path) => Profile::load(path)?,
		None => Profile::default(),
	};
	let settings = Settings::resolve(&cli.connection, profile)?;
	let name = cli.command.name();

	let client = Client::new();
	let outcome = match cli.command {
		// listen treats Ctrl-C as a normal stop
		command @ Commands::Listen(_) => execute(&client, &settings, command).await,
		command => {
			tokio::select! {
				result = execute(&client, &settings, command) => result,
				_ = tokio::signal::ctrl_c() => Err(CliError::Interrupted),
			}
		}
	};
	client.shutdown().await;

	let data = outcome?;
	output::print_result(&ResultBuilder::new(name).started_at(started).data(data).build(), format);
	Ok(())
}

async fn execute(client: &Client, settings: &Settings, command: Commands) -> Result<serde_json::Value> {
	let session = client.connect(SESSION_KEY, settings.session_options()).await?;
	tracing::info!(jid = ?session.jid().map(|j| j.to_string()), "connected");

	let data = match command {
		Commands::SendMessage { to, body } => serde_json::to_value(send_message::execute(client, &to, &body)?)?,
		Commands::SendFile(args) => serde_json::to_value(send_file::execute(client, args).await?)?,
		Commands::Resolve { address, timeout_ms } => {
			serde_json::to_value(resolve::execute(client, &address, timeout_ms).await?)?
		}
		Commands::Listen(args) => serde_json::to_value(listen::execute(client, args).await?)?,
	};
	Ok(data)
}

pub(crate) fn parse_address(address: &str) -> Result<Jid> {
	Jid::parse(address).map_err(|e| CliError::InvalidAddress {
		address: address.to_string(),
		reason: e.to_string(),
	})
}
