use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "xft")]
#[command(about = "XMPP chat and in-band file transfer from the command line")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Output format: json (default), ndjson, or text
	#[arg(short = 'f', long, global = true, value_enum, default_value = "json")]
	pub format: OutputFormat,

	/// TOML profile with connection settings; flags and env override it
	#[arg(short, long, global = true, value_name = "FILE", env = "XFT_CONFIG")]
	pub config: Option<PathBuf>,

	#[command(flatten)]
	pub connection: ConnectionArgs,

	#[command(subcommand)]
	pub command: Commands,
}

/// Account settings. Every field may also come from the profile file.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
	/// WebSocket endpoint, e.g. wss://chat.example.org/xmpp-websocket
	#[arg(long, global = true, env = "XFT_SERVICE", value_name = "URL")]
	pub service: Option<String>,

	/// Server domain
	#[arg(long, global = true, env = "XFT_DOMAIN")]
	pub domain: Option<String>,

	/// Account address (or its local part)
	#[arg(long, global = true, env = "XFT_JID")]
	pub jid: Option<String>,

	/// Account password
	#[arg(long, global = true, env = "XFT_PASSWORD", hide_env_values = true)]
	pub password: Option<String>,

	/// Resource to bind (random when omitted)
	#[arg(long, global = true, env = "XFT_RESOURCE")]
	pub resource: Option<String>,

	/// Presence priority
	#[arg(long, global = true, allow_negative_numbers = true)]
	pub priority: Option<i8>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Send a chat message
	#[command(alias = "msg")]
	SendMessage {
		/// Recipient address
		to: String,
		/// Message body
		body: String,
	},

	/// Send a file over an in-band bytestream
	SendFile(SendFileArgs),

	/// Resolve a bare address to its best online resource
	Resolve {
		/// Bare address to resolve
		address: String,
		/// How long to collect presence replies
		#[arg(long, default_value_t = 1200, value_name = "MS")]
		timeout_ms: u64,
	},

	/// Print incoming messages and transfers as JSON lines
	Listen(ListenArgs),
}

#[derive(Args, Debug)]
pub struct SendFileArgs {
	/// Recipient address; bare addresses are resolved first
	pub to: String,

	/// File to send
	pub path: PathBuf,

	/// Name announced to the recipient (defaults to the file's name)
	#[arg(long)]
	pub name: Option<String>,

	/// Bytes per data block
	#[arg(long, default_value_t = 2048)]
	pub block_size: u32,

	/// Stanza kind carrying the data blocks
	#[arg(long, value_enum, default_value = "message")]
	pub stanza: StanzaArg,

	/// Deadline for the whole handshake
	#[arg(long, default_value_t = 30_000, value_name = "MS")]
	pub timeout_ms: u64,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
	/// Write received files into this directory
	#[arg(long, value_name = "DIR")]
	pub save_dir: Option<PathBuf>,

	/// Stop after this many events
	#[arg(long)]
	pub count: Option<usize>,

	/// Idle time before an unfinished transfer is dropped
	#[arg(long, default_value_t = 120, value_name = "SECS")]
	pub session_timeout: u64,

	/// Also emit every inbound stanza as a `raw-stanza` event
	#[arg(long)]
	pub raw: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StanzaArg {
	#[default]
	Message,
	Iq,
}

impl From<StanzaArg> for xft::Carrier {
	fn from(arg: StanzaArg) -> Self {
		match arg {
			StanzaArg::Message => xft::Carrier::Message,
			StanzaArg::Iq => xft::Carrier::Iq,
		}
	}
}

impl Commands {
	pub fn name(&self) -> &'static str {
		match self {
			Commands::SendMessage { .. } => "send-message",
			Commands::SendFile(_) => "send-file",
			Commands::Resolve { .. } => "resolve",
			Commands::Listen(_) => "listen",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_send_file_defaults() {
		let cli = Cli::try_parse_from(["xft", "send-file", "bob@example.org", "notes.txt"]).unwrap();
		let Commands::SendFile(args) = cli.command else {
			panic!("expected send-file");
		};
		assert_eq!(args.to, "bob@example.org");
		assert_eq!(args.path, PathBuf::from("notes.txt"));
		assert_eq!(args.block_size, 2048);
		assert_eq!(args.stanza, StanzaArg::Message);
		assert_eq!(args.timeout_ms, 30_000);
		assert_eq!(cli.format, OutputFormat::Json);
	}

	#[test]
	fn global_flags_after_subcommand() {
		let cli = Cli::try_parse_from([
			"xft",
			"send-message",
			"bob@example.org",
			"hi",
			"--jid",
			"alice@example.org",
			"-vv",
			"--priority",
			"-1",
		])
		.unwrap();
		assert_eq!(cli.verbose, 2);
		assert_eq!(cli.connection.jid.as_deref(), Some("alice@example.org"));
		assert_eq!(cli.connection.priority, Some(-1));
		assert_eq!(cli.command.name(), "send-message");
	}

	#[test]
	fn iq_stanza_maps_to_carrier() {
		let cli = Cli::try_parse_from(["xft", "send-file", "b@x", "f", "--stanza", "iq"]).unwrap();
		let Commands::SendFile(args) = cli.command else {
			panic!("expected send-file");
		};
		assert_eq!(xft::Carrier::from(args.stanza), xft::Carrier::Iq);
	}

	#[test]
	fn listen_raw_is_opt_in() {
		let cli = Cli::try_parse_from(["xft", "listen"]).unwrap();
		let Commands::Listen(args) = cli.command else {
			panic!("expected listen");
		};
		assert!(!args.raw);
		assert_eq!(args.session_timeout, 120);

		let cli = Cli::try_parse_from(["xft", "listen", "--raw", "--count", "3"]).unwrap();
		let Commands::Listen(args) = cli.command else {
			panic!("expected listen");
		};
		assert!(args.raw);
		assert_eq!(args.count, Some(3));
	}

	#[test]
	fn missing_subcommand_is_an_error() {
		assert!(Cli::try_parse_from(["xft"]).is_err());
	}
}
