use thiserror::Error;

use crate::output::{CommandError, ErrorCode};

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
	#[error("configuration error: {0}")]
	Config(String),

	#[error("missing setting '{0}': pass --{0}, set XFT_{upper}, or add it to the profile", upper = .0.to_uppercase())]
	MissingSetting(&'static str),

	#[error("invalid address '{address}': {reason}")]
	InvalidAddress { address: String, reason: String },

	#[error("interrupted")]
	Interrupted,

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Xft(#[from] xft::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

impl CliError {
	/// Convert this error to a CommandError for structured output
	pub fn to_command_error(&self) -> CommandError {
		let (code, details) = match self {
			CliError::Config(_) | CliError::MissingSetting(_) => (ErrorCode::ConfigError, None),
			CliError::InvalidAddress { address, .. } => {
				(ErrorCode::InvalidInput, Some(serde_json::json!({ "address": address })))
			}
			CliError::Interrupted => (ErrorCode::Interrupted, None),
			CliError::Io(_) => (ErrorCode::IoError, None),
			CliError::Json(_) | CliError::Anyhow(_) => (ErrorCode::InternalError, None),
			CliError::Xft(err) => classify(err),
		};

		CommandError {
			code,
			message: self.to_string(),
			details,
		}
	}
}

fn classify(err: &xft::Error) -> (ErrorCode, Option<serde_json::Value>) {
	use xft::Error;

	match err {
		Error::AuthenticationFailed(_) => (ErrorCode::AuthError, None),
		Error::ConnectionFailed(_) | Error::TransportError(_) | Error::ChannelClosed => {
			(ErrorCode::ConnectionFailed, None)
		}
		Error::NotConnected { key } => (ErrorCode::ConnectionFailed, Some(serde_json::json!({ "key": key }))),
		Error::HandshakeTimeout { sid, timeout_ms } => (
			ErrorCode::Timeout,
			Some(serde_json::json!({ "sid": sid, "timeout_ms": timeout_ms })),
		),
		Error::Timeout(_) => (ErrorCode::Timeout, None),
		Error::Stanza { condition, kind, .. } => (
			ErrorCode::RemoteError,
			Some(serde_json::json!({ "condition": condition, "type": kind })),
		),
		Error::InvalidJid(_) | Error::InvalidArgument(_) => (ErrorCode::InvalidInput, None),
		Error::Io(_) => (ErrorCode::IoError, None),
		Error::ProtocolError(_) | Error::Xml(_) | Error::UnknownSession { .. } => (ErrorCode::ProtocolError, None),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn remote_error_carries_condition() {
		let err = CliError::from(xft::Error::Stanza {
			condition: "not-acceptable".into(),
			kind: "cancel".into(),
			text: None,
		});
		let cmd = err.to_command_error();
		assert_eq!(cmd.code, ErrorCode::RemoteError);
		assert_eq!(cmd.details.unwrap()["condition"], "not-acceptable");
	}

	#[test]
	fn missing_setting_names_flag_and_env() {
		let cmd = CliError::MissingSetting("password").to_command_error();
		assert_eq!(cmd.code, ErrorCode::ConfigError);
		assert!(cmd.message.contains("--password"));
		assert!(cmd.message.contains("XFT_PASSWORD"));
	}

	#[test]
	fn auth_failure_is_auth_error() {
		let cmd = CliError::from(xft::Error::AuthenticationFailed("not-authorized".into())).to_command_error();
		assert_eq!(cmd.code, ErrorCode::AuthError);
	}

	#[test]
	fn handshake_timeout_details() {
		let cmd = CliError::from(xft::Error::HandshakeTimeout {
			sid: "sid-1".into(),
			timeout_ms: 30_000,
		})
		.to_command_error();
		assert_eq!(cmd.code, ErrorCode::Timeout);
		assert_eq!(cmd.details.unwrap()["timeout_ms"], 30_000);
	}
}
