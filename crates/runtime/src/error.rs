//! Error types for the xft runtime.

use thiserror::Error;
use xft_protocol::{JidError, ParseError};

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the xft runtime.
#[derive(Debug, Error)]
pub enum Error {
	/// Transport, stream negotiation or resource binding could not complete.
	#[error("Failed to connect: {0}")]
	ConnectionFailed(String),

	/// The server rejected the credentials.
	#[error("Authentication failed: {0}")]
	AuthenticationFailed(String),

	/// No online session exists for the key.
	#[error("Not connected: no online session for key '{key}'")]
	NotConnected { key: String },

	/// Timeout waiting for an operation.
	#[error("Timeout: {0}")]
	Timeout(String),

	/// File transfer handshake did not finish in time.
	#[error("Transfer {sid} did not complete within {timeout_ms}ms")]
	HandshakeTimeout { sid: String, timeout_ms: u64 },

	/// Transfer session not present in the table.
	#[error("Unknown transfer session: {sid}")]
	UnknownSession { sid: String },

	/// Peer or server answered with an error reply.
	#[error("Remote error: {condition} ({kind}){}", text.as_ref().map(|t| format!(": {t}")).unwrap_or_default())]
	Stanza {
		/// Defined condition element name (e.g. `service-unavailable`)
		condition: String,
		/// Error type attribute (`cancel`, `modify`, `auth`, `wait`)
		kind: String,
		/// Optional human-readable text
		text: Option<String>,
	},

	/// Transport-level error (WebSocket I/O).
	#[error("Transport error: {0}")]
	TransportError(String),

	/// Protocol-level error (unexpected frame or negotiation failure).
	#[error("Protocol error: {0}")]
	ProtocolError(String),

	/// A frame could not be parsed.
	#[error("XML error: {0}")]
	Xml(#[from] ParseError),

	/// An address could not be parsed.
	#[error("Invalid address: {0}")]
	InvalidJid(#[from] JidError),

	/// Invalid argument provided to method.
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	/// Channel closed unexpectedly.
	#[error("Channel closed unexpectedly")]
	ChannelClosed,

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl Error {
	/// Returns true for the errors `acquire` reports when a session cannot be
	/// established.
	pub fn is_connection_error(&self) -> bool {
		matches!(self, Error::ConnectionFailed(_) | Error::AuthenticationFailed(_))
	}

	/// Returns true if this is a timeout error.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout(_) | Error::HandshakeTimeout { .. })
	}

	/// Returns the defined condition if this is a remote error reply.
	pub fn condition(&self) -> Option<&str> {
		match self {
			Error::Stanza { condition, .. } => Some(condition),
			_ => None,
		}
	}
}

impl From<xft_protocol::StanzaError> for Error {
	fn from(err: xft_protocol::StanzaError) -> Self {
		Error::Stanza {
			condition: err.condition,
			kind: err.kind,
			text: err.text,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_connection_error_classification() {
		assert!(Error::ConnectionFailed("refused".into()).is_connection_error());
		assert!(Error::AuthenticationFailed("not-authorized".into()).is_connection_error());
		assert!(!Error::Timeout("x".into()).is_connection_error());
	}

	#[test]
	fn test_stanza_error_display() {
		let err = Error::Stanza {
			condition: "service-unavailable".into(),
			kind: "cancel".into(),
			text: None,
		};
		assert_eq!(err.to_string(), "Remote error: service-unavailable (cancel)");
		assert_eq!(err.condition(), Some("service-unavailable"));

		let err = Error::HandshakeTimeout {
			sid: "sid-1".into(),
			timeout_ms: 30000,
		};
		assert!(err.is_timeout());
	}
}
