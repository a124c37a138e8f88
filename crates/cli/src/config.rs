//! Connection profile.
//!
//! A TOML file supplies defaults, command line flags (and their `XFT_*`
//! environment fallbacks) override it field by field:
//!
//! ```toml
//! service = "wss://chat.example.org/xmpp-websocket"
//! domain = "example.org"
//! jid = "alice@example.org"
//! password = "secret"
//! resource = "cli"
//! priority = 5
//! ```

use std::path::Path;

use serde::Deserialize;
use xft::SessionOptions;

use crate::cli::ConnectionArgs;
use crate::error::{CliError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
	pub service: Option<String>,
	pub domain: Option<String>,
	pub jid: Option<String>,
	pub password: Option<String>,
	pub resource: Option<String>,
	pub priority: Option<i8>,
}

impl Profile {
	pub fn load(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).map_err(|e| CliError::Config(format!("{}: {e}", path.display())))?;
		Self::parse(&text).map_err(|e| CliError::Config(format!("{}: {e}", path.display())))
	}

	pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
		toml::from_str(text)
	}
}

/// Fully resolved connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
	pub service: String,
	pub domain: String,
	pub jid: String,
	pub password: String,
	pub resource: Option<String>,
	pub priority: i8,
}

impl Settings {
	/// Flags first, then the profile. Missing required fields are an error.
	pub fn resolve(args: &ConnectionArgs, profile: Profile) -> Result<Self> {
		let jid = pick(&args.jid, profile.jid).ok_or(CliError::MissingSetting("jid"))?;
		let domain = match pick(&args.domain, profile.domain) {
			Some(domain) => domain,
			None => domain_of(&jid).ok_or(CliError::MissingSetting("domain"))?,
		};
		Ok(Self {
			service: pick(&args.service, profile.service).ok_or(CliError::MissingSetting("service"))?,
			password: pick(&args.password, profile.password).ok_or(CliError::MissingSetting("password"))?,
			resource: pick(&args.resource, profile.resource),
			priority: args.priority.or(profile.priority).unwrap_or(0),
			domain,
			jid,
		})
	}

	pub fn session_options(&self) -> SessionOptions {
		let options = SessionOptions::new(&self.service, &self.domain, &self.jid, &self.password)
			.with_priority(self.priority);
		match &self.resource {
			Some(resource) => options.with_resource(resource),
			None => options,
		}
	}
}

fn pick(flag: &Option<String>, profile: Option<String>) -> Option<String> {
	flag.clone().or(profile).filter(|value| !value.is_empty())
}

fn domain_of(jid: &str) -> Option<String> {
	let (_, rest) = jid.split_once('@')?;
	let domain = rest.split('/').next()?;
	(!domain.is_empty()).then(|| domain.to_string())
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn args() -> ConnectionArgs {
		ConnectionArgs::default()
	}

	#[test]
	fn profile_fills_missing_flags() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(
			file,
			"service = \"wss://chat.example.org/ws\"\njid = \"alice@example.org\"\npassword = \"pw\"\npriority = 3"
		)
		.unwrap();

		let profile = Profile::load(file.path()).unwrap();
		let settings = Settings::resolve(&args(), profile).unwrap();
		assert_eq!(settings.service, "wss://chat.example.org/ws");
		assert_eq!(settings.domain, "example.org");
		assert_eq!(settings.priority, 3);
		assert_eq!(settings.resource, None);
	}

	#[test]
	fn flags_override_profile() {
		let profile = Profile::parse(
			"service = \"wss://a/ws\"\ndomain = \"a.org\"\njid = \"alice@a.org\"\npassword = \"pw\"\nresource = \"desk\"",
		)
		.unwrap();
		let args = ConnectionArgs {
			jid: Some("bob@b.org".into()),
			resource: Some("cli".into()),
			priority: Some(-2),
			..ConnectionArgs::default()
		};

		let settings = Settings::resolve(&args, profile).unwrap();
		assert_eq!(settings.jid, "bob@b.org");
		assert_eq!(settings.domain, "a.org");
		assert_eq!(settings.resource.as_deref(), Some("cli"));
		assert_eq!(settings.priority, -2);

		let options = settings.session_options();
		assert_eq!(options.resource.as_deref(), Some("cli"));
		assert_eq!(options.priority, -2);
	}

	#[test]
	fn missing_password_is_reported() {
		let args = ConnectionArgs {
			service: Some("wss://a/ws".into()),
			jid: Some("alice@a.org".into()),
			..ConnectionArgs::default()
		};
		let err = Settings::resolve(&args, Profile::default()).unwrap_err();
		assert!(matches!(err, CliError::MissingSetting("password")));
	}

	#[test]
	fn unknown_profile_keys_are_rejected() {
		assert!(Profile::parse("user = \"alice\"").is_err());
	}

	#[test]
	fn unreadable_profile_is_a_config_error() {
		let dir = tempfile::tempdir().unwrap();
		let err = Profile::load(&dir.path().join("absent.toml")).unwrap_err();
		assert!(matches!(err, CliError::Config(_)));
	}

	#[test]
	fn domain_from_address() {
		assert_eq!(domain_of("alice@example.org/pc").as_deref(), Some("example.org"));
		assert_eq!(domain_of("alice"), None);
	}
}
