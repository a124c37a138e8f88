//! Responder side of a transfer.
//!
//! [`InboundTransfers`] subscribes to a session's raw frames and drives each
//! offered sid through offer, open, data and close. Replies are queued with
//! [`Session::send`] from inside the dispatch loop, never awaited.

use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tokio::sync::broadcast;
use xft_protocol::{Element, Frame, IbbClose, IbbData, IbbOpen, Jid, StreamOffer, stanza};
use xft_runtime::{Error, Result, Session, Subscription};

use super::table::{TransferPhase, TransferSession, TransferTable};

/// File name reported when the offer did not carry one.
pub const FALLBACK_FILE_NAME: &str = "file.bin";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct InboundOptions {
	/// Idle time after which an unfinished transfer is discarded.
	pub session_timeout: Duration,
}

impl Default for InboundOptions {
	fn default() -> Self {
		Self {
			session_timeout: Duration::from_secs(120),
		}
	}
}

impl InboundOptions {
	pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
		self.session_timeout = timeout;
		self
	}
}

/// Offer accepted on behalf of the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOffer {
	pub sid: String,
	pub sender: Option<Jid>,
	pub file_name: Option<String>,
	pub declared_size: Option<u64>,
}

/// Completed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceivedFile {
	pub sid: String,
	pub sender: Option<Jid>,
	pub file_name: String,
	pub declared_size: Option<u64>,
	/// Received bytes in chunk arrival order, base64 encoded.
	pub base64_payload: String,
}

impl ReceivedFile {
	pub fn decode(&self) -> Result<Vec<u8>> {
		STANDARD
			.decode(self.base64_payload.as_bytes())
			.map_err(|e| Error::ProtocolError(format!("transfer {} payload is not base64: {e}", self.sid)))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
	FileOffered(FileOffer),
	FileReceived(ReceivedFile),
}

/// Frame handling state shared with the relay subscription.
struct Responder {
	table: TransferTable,
	events: broadcast::Sender<TransferEvent>,
}

impl Responder {
	/// Handles one inbound frame. Returns the reply to send, if any.
	fn handle(&self, frame: Frame) -> Option<Element> {
		match frame {
			Frame::Offer(offer) => self.on_offer(offer),
			Frame::Open(open) => self.on_open(open),
			Frame::Data(data) => self.on_data(data),
			Frame::Close(close) => self.on_close(close),
			_ => None,
		}
	}

	fn on_offer(&self, offer: StreamOffer) -> Option<Element> {
		let from = offer.envelope.from.clone()?;
		let id = offer.envelope.id.clone()?;

		if !offer.offers_ibb() {
			tracing::debug!(sid = %offer.sid, from = %from, "offer without in-band bytestream, rejecting");
			return Some(stanza::iq_error(Some(&from), &id, "cancel", "bad-request"));
		}

		let mut session = TransferSession::offered(offer.sid.clone());
		session.initiator = Some(from.clone());
		session.recipient = offer.envelope.to.clone();
		session.file_name = offer.file_name.clone();
		session.declared_size = offer.file_size;

		if !self.table.insert(session) {
			tracing::debug!(sid = %offer.sid, "duplicate offer for live transfer ignored");
			return None;
		}
		tracing::info!(sid = %offer.sid, from = %from, file = ?offer.file_name, size = ?offer.file_size, "file offered");

		let _ = self.events.send(TransferEvent::FileOffered(FileOffer {
			sid: offer.sid,
			sender: Some(from.clone()),
			file_name: offer.file_name,
			declared_size: offer.file_size,
		}));
		Some(stanza::si_accept(&from, &id))
	}

	fn on_open(&self, open: IbbOpen) -> Option<Element> {
		let opened = self.table.update(&open.sid, |session| {
			if session.phase != TransferPhase::Offered {
				return false;
			}
			session.phase = TransferPhase::Open;
			session.block_size = open.block_size;
			session.carrier = open.stanza;
			true
		});
		match opened {
			Some(true) => {
				tracing::debug!(sid = %open.sid, block_size = ?open.block_size, carrier = open.stanza.as_str(), "transfer opened");
				ack(&open.envelope.from, &open.envelope.id)
			}
			Some(false) => {
				tracing::debug!(sid = %open.sid, "repeated open ignored");
				None
			}
			None => {
				tracing::debug!(sid = %open.sid, "open for unknown sid ignored");
				None
			}
		}
	}

	fn on_data(&self, data: IbbData) -> Option<Element> {
		if STANDARD.decode(data.payload.as_bytes()).is_err() {
			tracing::debug!(sid = %data.sid, "data chunk is not base64, ignored");
			return None;
		}
		let appended = self.table.update(&data.sid, |session| {
			if session.phase != TransferPhase::Open {
				return false;
			}
			if let Some(seq) = data.seq {
				if seq != session.next_seq {
					tracing::debug!(sid = %session.sid, expected = session.next_seq, got = seq, "out of sequence chunk");
				}
			}
			session.next_seq = session.next_seq.wrapping_add(1);
			session.chunks.push(data.payload.clone());
			true
		});
		if appended != Some(true) {
			tracing::debug!(sid = %data.sid, "data for unknown or unopened sid ignored");
			return None;
		}

		match data.carrier {
			xft_protocol::Carrier::Iq => ack(&data.envelope.from, &data.envelope.id),
			xft_protocol::Carrier::Message => None,
		}
	}

	fn on_close(&self, close: IbbClose) -> Option<Element> {
		let Some(session) = self.table.remove(&close.sid) else {
			tracing::debug!(sid = %close.sid, "close for unknown sid ignored");
			return None;
		};

		if session.phase == TransferPhase::Open {
			let payload = session.payload();
			tracing::info!(
				sid = %session.sid,
				chunks = session.chunks.len(),
				encoded_len = payload.len(),
				"file received"
			);
			let _ = self.events.send(TransferEvent::FileReceived(ReceivedFile {
				file_name: session
					.file_name
					.clone()
					.unwrap_or_else(|| FALLBACK_FILE_NAME.to_string()),
				sid: session.sid,
				sender: session.initiator,
				declared_size: session.declared_size,
				base64_payload: payload,
			}));
		} else {
			tracing::debug!(sid = %session.sid, "closed before open, discarded");
		}
		ack(&close.envelope.from, &close.envelope.id)
	}
}

fn ack(to: &Option<Jid>, id: &Option<String>) -> Option<Element> {
	let id = id.as_deref()?;
	Some(stanza::iq_result(to.as_ref(), id))
}

/// Live responder for one session. Dropping it unsubscribes and discards
/// every unfinished transfer.
pub struct InboundTransfers {
	key: String,
	responder: Arc<Responder>,
	_subscription: Subscription,
}

impl std::fmt::Debug for InboundTransfers {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("InboundTransfers")
			.field("key", &self.key)
			.field("table", &self.responder.table)
			.finish()
	}
}

impl InboundTransfers {
	/// Starts answering transfers on `session`.
	pub fn listen(session: &Arc<Session>, options: InboundOptions) -> Self {
		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		let responder = Arc::new(Responder {
			table: TransferTable::new(options.session_timeout),
			events,
		});

		let weak_session: Weak<Session> = Arc::downgrade(session);
		let weak_responder = Arc::downgrade(&responder);
		let subscription = session.relay().on_raw_frame(move |element: Arc<Element>| {
			let session = weak_session.clone();
			let responder = weak_responder.clone();
			async move {
				let (Some(session), Some(responder)) = (session.upgrade(), responder.upgrade()) else {
					return Ok(());
				};
				if let Some(reply) = responder.handle(Frame::classify(&element)) {
					session.send(reply)?;
				}
				Ok(())
			}
		});

		tracing::debug!(key = session.key(), timeout_ms = options.session_timeout.as_millis() as u64, "listening for transfers");
		Self {
			key: session.key().to_string(),
			responder,
			_subscription: subscription,
		}
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	/// Receiver for offers and completed files. Events published before the
	/// call are not replayed.
	pub fn events(&self) -> broadcast::Receiver<TransferEvent> {
		self.responder.events.subscribe()
	}

	/// Snapshot of an in-flight transfer.
	pub fn session(&self, sid: &str) -> Option<TransferSession> {
		self.responder.table.get(sid)
	}

	/// Number of in-flight transfers.
	pub fn active(&self) -> usize {
		self.responder.table.len()
	}
}

impl Drop for InboundTransfers {
	fn drop(&mut self) {
		self.responder.table.clear();
	}
}

#[cfg(test)]
mod tests {
	use xft_protocol::{Carrier, ns};

	use super::*;

	const ALICE: &str = "alice@example.org/pc";
	const BOB: &str = "bob@example.org/laptop";

	fn responder(timeout: Duration) -> Responder {
		let (events, _) = broadcast::channel(16);
		Responder {
			table: TransferTable::new(timeout),
			events,
		}
	}

	fn inbound(mut el: Element) -> Frame {
		el.set_attr("from", ALICE);
		Frame::classify(&el)
	}

	fn bob() -> Jid {
		Jid::parse(BOB).unwrap()
	}

	fn offer(sid: &str) -> Frame {
		inbound(stanza::si_offer(&bob(), "offer-1", sid, "notes.txt", 6))
	}

	#[tokio::test]
	async fn test_full_exchange_emits_file() {
		let responder = responder(Duration::from_secs(60));
		let mut events = responder.events.subscribe();

		let accept = responder.handle(offer("s1")).unwrap();
		assert_eq!(accept.attr("type"), Some("result"));
		assert_eq!(accept.attr("to"), Some(ALICE));
		assert!(accept.has_child("si", ns::SI));

		let ack = responder
			.handle(inbound(stanza::ibb_open(&bob(), "open-1", "s1", 2048, Carrier::Message)))
			.unwrap();
		assert_eq!(ack.attr("id"), Some("open-1"));

		assert!(responder
			.handle(inbound(stanza::ibb_data_message(&bob(), "d0", "s1", 0, "aGVs")))
			.is_none());
		assert!(responder
			.handle(inbound(stanza::ibb_data_message(&bob(), "d1", "s1", 1, "bG8h")))
			.is_none());

		let ack = responder.handle(inbound(stanza::ibb_close(&bob(), "close-1", "s1"))).unwrap();
		assert_eq!(ack.attr("id"), Some("close-1"));
		assert!(responder.table.is_empty());

		let TransferEvent::FileOffered(offered) = events.try_recv().unwrap() else {
			panic!("expected offer first");
		};
		assert_eq!(offered.file_name.as_deref(), Some("notes.txt"));

		let TransferEvent::FileReceived(file) = events.try_recv().unwrap() else {
			panic!("expected file");
		};
		assert_eq!(file.base64_payload, "aGVsbG8h");
		assert_eq!(file.decode().unwrap(), b"hello!");
		assert_eq!(file.declared_size, Some(6));
		assert_eq!(file.sender.unwrap().to_string(), ALICE);
	}

	#[tokio::test]
	async fn test_iq_carried_data_is_acknowledged() {
		let responder = responder(Duration::from_secs(60));
		responder.handle(offer("s1"));
		responder.handle(inbound(stanza::ibb_open(&bob(), "o", "s1", 4096, Carrier::Iq)));

		let ack = responder
			.handle(inbound(stanza::ibb_data_iq(&bob(), "d0", "s1", 0, "AA==")))
			.unwrap();
		assert_eq!(ack.attr("id"), Some("d0"));
		assert_eq!(responder.table.get("s1").unwrap().carrier, Carrier::Iq);
		assert_eq!(responder.table.get("s1").unwrap().block_size, Some(4096));
	}

	#[tokio::test]
	async fn test_unknown_sid_is_ignored_everywhere() {
		let responder = responder(Duration::from_secs(60));

		assert!(responder
			.handle(inbound(stanza::ibb_open(&bob(), "o", "nope", 2048, Carrier::Message)))
			.is_none());
		assert!(responder
			.handle(inbound(stanza::ibb_data_iq(&bob(), "d", "nope", 0, "AA==")))
			.is_none());
		assert!(responder.handle(inbound(stanza::ibb_close(&bob(), "c", "nope"))).is_none());
	}

	#[tokio::test]
	async fn test_data_before_open_is_ignored() {
		let responder = responder(Duration::from_secs(60));
		responder.handle(offer("s1"));

		responder.handle(inbound(stanza::ibb_data_message(&bob(), "d", "s1", 0, "AA==")));
		assert!(responder.table.get("s1").unwrap().chunks.is_empty());
	}

	#[tokio::test]
	async fn test_duplicate_offer_is_ignored() {
		let responder = responder(Duration::from_secs(60));
		assert!(responder.handle(offer("s1")).is_some());
		assert!(responder.handle(offer("s1")).is_none());
		assert_eq!(responder.table.len(), 1);
	}

	#[tokio::test]
	async fn test_close_before_open_discards_without_event() {
		let responder = responder(Duration::from_secs(60));
		let mut events = responder.events.subscribe();
		responder.handle(offer("s1"));
		let _ = events.try_recv();

		let ack = responder.handle(inbound(stanza::ibb_close(&bob(), "c", "s1")));
		assert!(ack.is_some());
		assert!(responder.table.is_empty());
		assert!(events.try_recv().is_err());
	}

	#[tokio::test]
	async fn test_out_of_sequence_chunks_kept_in_arrival_order() {
		let responder = responder(Duration::from_secs(60));
		responder.handle(offer("s1"));
		responder.handle(inbound(stanza::ibb_open(&bob(), "o", "s1", 2048, Carrier::Message)));

		responder.handle(inbound(stanza::ibb_data_message(&bob(), "a", "s1", 1, "Qg==")));
		responder.handle(inbound(stanza::ibb_data_message(&bob(), "b", "s1", 0, "QQ==")));

		assert_eq!(responder.table.get("s1").unwrap().chunks, vec!["Qg==", "QQ=="]);
	}

	#[tokio::test]
	async fn test_offer_without_ibb_is_rejected() {
		let responder = responder(Duration::from_secs(60));
		let xml = format!(
			r#"<iq xmlns="jabber:client" type="set" id="o1" from="{ALICE}"><si xmlns="{}" id="s9"><file xmlns="{}" name="a" size="1"/><feature xmlns="{}"><x xmlns="{}" type="form"><field var="stream-method" type="list-single"><option><value>http://jabber.org/protocol/bytestreams</value></option></field></x></feature></si></iq>"#,
			ns::SI,
			ns::SI_FILE_TRANSFER,
			ns::FEATURE_NEG,
			ns::DATA_FORMS
		);
		let reply = responder
			.handle(Frame::classify(&Element::parse(&xml).unwrap()))
			.unwrap();
		assert_eq!(reply.attr("type"), Some("error"));
		assert!(responder.table.is_empty());
	}

	#[tokio::test]
	async fn test_timeout_discards_and_later_close_is_ignored() {
		let responder = responder(Duration::from_millis(50));
		let mut events = responder.events.subscribe();
		responder.handle(offer("s1"));
		responder.handle(inbound(stanza::ibb_open(&bob(), "o", "s1", 2048, Carrier::Message)));
		let _ = events.try_recv();

		tokio::time::sleep(Duration::from_millis(120)).await;
		assert!(!responder.table.contains("s1"));

		assert!(responder.handle(inbound(stanza::ibb_close(&bob(), "c", "s1"))).is_none());
		assert!(events.try_recv().is_err());
	}

	proptest::proptest! {
		#![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]

		#[test]
		fn reassembly_matches_sent_bytes(
			bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..6000),
			block_size in 1usize..3000,
		) {
			let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
			let received = runtime.block_on(async {
				let responder = responder(Duration::from_secs(60));
				let mut events = responder.events.subscribe();
				responder.handle(offer("p1"));
				responder.handle(inbound(stanza::ibb_open(&bob(), "o", "p1", block_size as u32, Carrier::Message)));
				for (seq, block) in stanza::encode_blocks(&bytes, block_size).iter().enumerate() {
					responder.handle(inbound(stanza::ibb_data_message(&bob(), "d", "p1", seq as u16, block)));
				}
				responder.handle(inbound(stanza::ibb_close(&bob(), "c", "p1")));
				let _ = events.try_recv();
				match events.try_recv() {
					Ok(TransferEvent::FileReceived(file)) => file.decode().unwrap(),
					other => panic!("expected file, got {other:?}"),
				}
			});
			proptest::prop_assert_eq!(received, bytes);
		}
	}
}
