//! File transfer over stream initiation and in-band bytestreams.
//!
//! # Outbound
//!
//! ```text
//! initiator                                 responder
//!    | iq set  <si> offer (IBB only)  ------>  |
//!    | <------------------  iq result <si> accept
//!    | iq set  <open sid block-size stanza> -> |
//!    | <------------------------------  iq result
//!    | <data seq=0..n> (message or iq)  -----> |
//!    | iq set  <close sid>  -----------------> |
//! ```
//!
//! # Inbound
//!
//! [`TransferEngine::listen`] answers the responder side for one session and
//! publishes [`TransferEvent`]s. Unfinished transfers are discarded after
//! [`InboundOptions::session_timeout`] of inactivity.

mod inbound;
mod outbound;
mod table;

use xft_protocol::Jid;
use xft_runtime::{Error, Result, SessionManager};

pub use inbound::{FALLBACK_FILE_NAME, FileOffer, InboundOptions, InboundTransfers, ReceivedFile, TransferEvent};
pub use outbound::{TransferOptions, TransferReport, new_sid};
pub use table::{TransferPhase, TransferSession, TransferTable};

use crate::presence::PresenceResolver;

/// Sends and receives files on registered sessions.
#[derive(Debug, Clone)]
pub struct TransferEngine {
	sessions: SessionManager,
	resolver: PresenceResolver,
	options: TransferOptions,
}

impl TransferEngine {
	pub fn new(sessions: SessionManager, resolver: PresenceResolver, options: TransferOptions) -> Self {
		Self {
			sessions,
			resolver,
			options,
		}
	}

	pub fn options(&self) -> &TransferOptions {
		&self.options
	}

	/// Sends `bytes` as `file_name` to `destination` from session `key`.
	///
	/// A bare destination is resolved to its best resource first; when that
	/// fails the bare address is used as is.
	pub async fn send_file(
		&self,
		key: &str,
		destination: &Jid,
		file_name: &str,
		bytes: &[u8],
	) -> Result<TransferReport> {
		self.send_file_with(key, destination, file_name, bytes, &self.options).await
	}

	/// [`send_file`](Self::send_file) with per-call options.
	pub async fn send_file_with(
		&self,
		key: &str,
		destination: &Jid,
		file_name: &str,
		bytes: &[u8],
		options: &TransferOptions,
	) -> Result<TransferReport> {
		let session = self
			.sessions
			.session(key)
			.ok_or_else(|| Error::NotConnected { key: key.to_string() })?;

		let to = if destination.is_full() {
			destination.clone()
		} else {
			match self.resolver.resolve(key, destination, options.resolve_timeout).await {
				Some(full) => full,
				None => {
					tracing::warn!(key, to = %destination, "sending to bare address");
					destination.clone()
				}
			}
		};

		outbound::send(&session, &to, file_name, bytes, options).await
	}

	/// Starts answering inbound transfers on session `key`.
	pub fn listen(&self, key: &str, options: InboundOptions) -> Result<InboundTransfers> {
		let session = self
			.sessions
			.session(key)
			.ok_or_else(|| Error::NotConnected { key: key.to_string() })?;
		Ok(InboundTransfers::listen(&session, options))
	}
}
