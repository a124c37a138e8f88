//! Chat messages.

use xft_protocol::{Jid, stanza};
use xft_runtime::{Result, Session};

/// Sends a `type="chat"` message and returns its frame id.
///
/// Delivery is not confirmed; the message is queued on the session's
/// connection. A bare `to` is routed by the server.
pub fn send_message(session: &Session, to: &Jid, body: &str) -> Result<String> {
	let id = session.next_id("msg");
	session.send(stanza::chat_message(to, &id, body))?;
	tracing::debug!(key = session.key(), to = %to, %id, len = body.len(), "message sent");
	Ok(id)
}
