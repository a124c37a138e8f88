use std::time::Duration;

use serde::Serialize;
use xft::{Client, Jid};

use super::{SESSION_KEY, parse_address};
use crate::error::Result;

#[derive(Debug, Serialize)]
pub struct Resolved {
	pub address: Jid,
	/// `null` when no online resource answered.
	pub resolved: Option<Jid>,
}

pub async fn execute(client: &Client, address: &str, timeout_ms: u64) -> Result<Resolved> {
	let address = parse_address(address)?;
	let resolved = client
		.resolver()
		.resolve(SESSION_KEY, &address, Duration::from_millis(timeout_ms))
		.await;
	Ok(Resolved { address, resolved })
}
