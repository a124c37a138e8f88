use serde::Serialize;
use xft::{Client, Jid};

use super::{SESSION_KEY, parse_address};
use crate::error::Result;

#[derive(Debug, Serialize)]
pub struct MessageSent {
	pub id: String,
	pub to: Jid,
}

pub fn execute(client: &Client, to: &str, body: &str) -> Result<MessageSent> {
	let to = parse_address(to)?;
	let id = client.send_message(SESSION_KEY, &to, body)?;
	Ok(MessageSent { id, to })
}
