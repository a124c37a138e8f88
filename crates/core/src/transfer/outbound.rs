//! Initiator side of a transfer.

use std::time::Duration;

use serde::Serialize;
use xft_protocol::{Carrier, Frame, Jid, stanza};
use xft_runtime::{Error, Result, Session};

use crate::presence::DEFAULT_RESOLVE_TIMEOUT;

#[derive(Debug, Clone)]
pub struct TransferOptions {
	/// Raw bytes per data frame.
	pub block_size: u32,
	/// Stanza kind announced in the open request and used for data.
	pub stanza: Carrier,
	/// Bound on offer through close.
	pub handshake_timeout: Duration,
	/// Probe window when resolving a bare destination.
	pub resolve_timeout: Duration,
}

impl Default for TransferOptions {
	fn default() -> Self {
		Self {
			block_size: stanza::DEFAULT_BLOCK_SIZE as u32,
			stanza: Carrier::Message,
			handshake_timeout: Duration::from_secs(30),
			resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
		}
	}
}

impl TransferOptions {
	pub fn with_block_size(mut self, block_size: u32) -> Self {
		self.block_size = block_size;
		self
	}

	pub fn with_stanza(mut self, stanza: Carrier) -> Self {
		self.stanza = stanza;
		self
	}

	pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
		self.handshake_timeout = timeout;
		self
	}

	pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
		self.resolve_timeout = timeout;
		self
	}
}

/// Outcome of a completed send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
	pub sid: String,
	pub to: Jid,
	pub file_name: String,
	pub size: u64,
	pub blocks: usize,
}

/// Fresh stream id.
pub fn new_sid() -> String {
	format!("sid-{}", uuid::Uuid::new_v4())
}

/// Runs offer, open, data and close against `to`, bounded by the handshake
/// timeout. On expiry the transfer is abandoned and the session stays open.
pub(crate) async fn send(
	session: &Session,
	to: &Jid,
	file_name: &str,
	bytes: &[u8],
	options: &TransferOptions,
) -> Result<TransferReport> {
	if options.block_size == 0 {
		return Err(Error::InvalidArgument("block size must be positive".to_string()));
	}

	let sid = new_sid();
	let exchange = handshake(session, to, &sid, file_name, bytes, options);

	match tokio::time::timeout(options.handshake_timeout, exchange).await {
		Ok(result) => result,
		Err(_) => {
			tracing::warn!(%sid, to = %to, "transfer handshake timed out");
			Err(Error::HandshakeTimeout {
				sid,
				timeout_ms: options.handshake_timeout.as_millis() as u64,
			})
		}
	}
}

async fn handshake(
	session: &Session,
	to: &Jid,
	sid: &str,
	file_name: &str,
	bytes: &[u8],
	options: &TransferOptions,
) -> Result<TransferReport> {
	let size = bytes.len() as u64;
	tracing::info!(%sid, to = %to, file = file_name, size, "offering file");

	let reply = session
		.send_and_await(stanza::si_offer(to, &session.next_id("offer"), sid, file_name, size))
		.await?;
	match Frame::classify(&reply) {
		Frame::Accept(accept) if accept.selects_ibb() => {}
		Frame::Accept(accept) => {
			return Err(Error::ProtocolError(format!(
				"peer selected unsupported stream method {:?}",
				accept.method
			)));
		}
		_ => {
			return Err(Error::ProtocolError("offer reply carries no stream method".to_string()));
		}
	}

	session
		.send_and_await(stanza::ibb_open(
			to,
			&session.next_id("open"),
			sid,
			options.block_size,
			options.stanza,
		))
		.await?;
	tracing::debug!(%sid, block_size = options.block_size, carrier = options.stanza.as_str(), "bytestream open");

	let blocks = stanza::encode_blocks(bytes, options.block_size as usize);
	for (index, block) in blocks.iter().enumerate() {
		let seq = (index % (usize::from(u16::MAX) + 1)) as u16;
		let id = session.next_id("data");
		match options.stanza {
			Carrier::Message => session.write(stanza::ibb_data_message(to, &id, sid, seq, block)).await?,
			Carrier::Iq => {
				session
					.send_and_await(stanza::ibb_data_iq(to, &id, sid, seq, block))
					.await?;
			}
		}
	}

	let close = stanza::ibb_close(to, &session.next_id("close"), sid);
	match options.stanza {
		Carrier::Message => session.write(close).await?,
		Carrier::Iq => {
			session.send_and_await(close).await?;
		}
	}

	tracing::info!(%sid, to = %to, blocks = blocks.len(), "file sent");
	Ok(TransferReport {
		sid: sid.to_string(),
		to: to.clone(),
		file_name: file_name.to_string(),
		size,
		blocks: blocks.len(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_sid_shape() {
		let sid = new_sid();
		assert!(sid.starts_with("sid-"));
		assert_eq!(sid.len(), 4 + 36);
		assert_ne!(new_sid(), sid);
	}

	#[test]
	fn test_default_options() {
		let options = TransferOptions::default();
		assert_eq!(options.block_size, 2048);
		assert_eq!(options.stanza, Carrier::Message);
		assert_eq!(options.handshake_timeout, Duration::from_secs(30));
		assert_eq!(options.resolve_timeout, Duration::from_millis(1200));
	}
}
