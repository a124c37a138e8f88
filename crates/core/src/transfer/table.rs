//! In-flight inbound transfers keyed by sid.
//!
//! Every entry carries an expiry timer. Re-arming bumps the entry's
//! generation and replaces the timer task; a timer only removes the entry if
//! the generation it was armed with is still current, so a stale expiry can
//! never discard a transfer that was just extended.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use xft_protocol::{Carrier, Jid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
	Offered,
	Open,
}

/// State of one inbound transfer.
#[derive(Debug, Clone)]
pub struct TransferSession {
	pub sid: String,
	pub initiator: Option<Jid>,
	pub recipient: Option<Jid>,
	pub file_name: Option<String>,
	/// Initiator-declared size; never checked against the payload.
	pub declared_size: Option<u64>,
	pub block_size: Option<u32>,
	pub carrier: Carrier,
	pub phase: TransferPhase,
	/// Base64 chunks in arrival order.
	pub chunks: Vec<String>,
	pub next_seq: u16,
	pub created: Instant,
}

impl TransferSession {
	pub fn offered(sid: impl Into<String>) -> Self {
		Self {
			sid: sid.into(),
			initiator: None,
			recipient: None,
			file_name: None,
			declared_size: None,
			block_size: None,
			carrier: Carrier::default(),
			phase: TransferPhase::Offered,
			chunks: Vec::new(),
			next_seq: 0,
			created: Instant::now(),
		}
	}

	/// Received bytes re-encoded as one base64 string. Chunks are decoded
	/// one by one since each carries its own padding.
	pub fn payload(&self) -> String {
		let bytes: Vec<u8> = self
			.chunks
			.iter()
			.filter_map(|chunk| STANDARD.decode(chunk).ok())
			.flatten()
			.collect();
		STANDARD.encode(bytes)
	}
}

struct Slot {
	session: TransferSession,
	generation: u64,
	timer: AbortHandle,
}

type Slots = Mutex<HashMap<String, Slot>>;

/// Transfer table with per-entry expiry. Must be used inside a tokio runtime.
pub struct TransferTable {
	slots: Arc<Slots>,
	timeout: Duration,
}

impl std::fmt::Debug for TransferTable {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TransferTable")
			.field("len", &self.len())
			.field("timeout", &self.timeout)
			.finish()
	}
}

impl TransferTable {
	pub fn new(timeout: Duration) -> Self {
		Self {
			slots: Arc::new(Mutex::new(HashMap::new())),
			timeout,
		}
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Adds a transfer and arms its timer. Returns `false` if the sid is
	/// already live; the existing entry is left untouched.
	pub fn insert(&self, session: TransferSession) -> bool {
		let mut slots = self.slots.lock();
		if slots.contains_key(&session.sid) {
			return false;
		}
		let sid = session.sid.clone();
		let timer = self.arm(&sid, 0);
		slots.insert(
			sid,
			Slot {
				session,
				generation: 0,
				timer,
			},
		);
		true
	}

	/// Mutates a live transfer and re-arms its timer.
	pub fn update<R>(&self, sid: &str, f: impl FnOnce(&mut TransferSession) -> R) -> Option<R> {
		let mut slots = self.slots.lock();
		let slot = slots.get_mut(sid)?;
		let result = f(&mut slot.session);

		slot.generation += 1;
		slot.timer.abort();
		slot.timer = self.arm(sid, slot.generation);
		Some(result)
	}

	/// Removes a transfer and cancels its timer.
	pub fn remove(&self, sid: &str) -> Option<TransferSession> {
		let slot = self.slots.lock().remove(sid)?;
		slot.timer.abort();
		Some(slot.session)
	}

	pub fn get(&self, sid: &str) -> Option<TransferSession> {
		self.slots.lock().get(sid).map(|slot| slot.session.clone())
	}

	pub fn contains(&self, sid: &str) -> bool {
		self.slots.lock().contains_key(sid)
	}

	pub fn len(&self) -> usize {
		self.slots.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.lock().is_empty()
	}

	/// Drops every transfer and cancels all timers.
	pub fn clear(&self) {
		for (_, slot) in self.slots.lock().drain() {
			slot.timer.abort();
		}
	}

	fn arm(&self, sid: &str, generation: u64) -> AbortHandle {
		let slots: Weak<Slots> = Arc::downgrade(&self.slots);
		let sid = sid.to_string();
		let timeout = self.timeout;

		tokio::spawn(async move {
			tokio::time::sleep(timeout).await;
			let Some(slots) = slots.upgrade() else {
				return;
			};
			let mut slots = slots.lock();
			if slots.get(&sid).is_some_and(|slot| slot.generation == generation) {
				slots.remove(&sid);
				tracing::debug!(sid, timeout_ms = timeout.as_millis() as u64, "transfer timed out, discarded");
			}
		})
		.abort_handle()
	}
}

impl Drop for TransferTable {
	fn drop(&mut self) {
		self.clear();
	}
}
