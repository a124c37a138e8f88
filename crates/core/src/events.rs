//! Events handed to the surrounding workflow engine.
//!
//! Serialized as `{"type": "...", "payload": {...}}`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use xft_protocol::Element;
use xft_runtime::relay::now_ms;
use xft_runtime::{Session, Subscription, TextMessage};

use crate::transfer::{FileOffer, InboundOptions, InboundTransfers, ReceivedFile, TransferEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum EngineEvent {
	TextMessage(TextMessage),
	FileOffer(FileOffer),
	FileReceived(ReceivedFile),
	RawStanza(RawStanza),
}

/// An inbound frame as received, for debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawStanza {
	pub name: String,
	pub from: Option<String>,
	pub to: Option<String>,
	pub id: Option<String>,
	/// Serialized element.
	pub stanza: String,
	pub timestamp_ms: u64,
}

impl RawStanza {
	pub fn of(element: &Element) -> Self {
		Self {
			name: element.name().to_string(),
			from: element.attr("from").map(str::to_string),
			to: element.attr("to").map(str::to_string),
			id: element.attr("id").map(str::to_string),
			stanza: element.to_xml(),
			timestamp_ms: now_ms(),
		}
	}
}

/// What an [`EngineEvents`] stream carries.
#[derive(Debug, Clone, Default)]
pub struct EventOptions {
	pub inbound: InboundOptions,
	/// Also emit every inbound frame as a `raw-stanza` event. Verbose.
	pub raw_stanzas: bool,
}

impl EventOptions {
	pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
		self.inbound = self.inbound.with_session_timeout(timeout);
		self
	}

	pub fn with_raw_stanzas(mut self, enabled: bool) -> Self {
		self.raw_stanzas = enabled;
		self
	}
}

impl From<InboundOptions> for EventOptions {
	fn from(inbound: InboundOptions) -> Self {
		Self {
			inbound,
			raw_stanzas: false,
		}
	}
}

impl EngineEvent {
	pub fn kind(&self) -> &'static str {
		match self {
			Self::TextMessage(_) => "text-message",
			Self::FileOffer(_) => "file-offer",
			Self::FileReceived(_) => "file-received",
			Self::RawStanza(_) => "raw-stanza",
		}
	}

	pub fn to_json(&self) -> serde_json::Value {
		serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
	}
}

impl From<TextMessage> for EngineEvent {
	fn from(message: TextMessage) -> Self {
		Self::TextMessage(message)
	}
}

impl From<TransferEvent> for EngineEvent {
	fn from(event: TransferEvent) -> Self {
		match event {
			TransferEvent::FileOffered(offer) => Self::FileOffer(offer),
			TransferEvent::FileReceived(file) => Self::FileReceived(file),
		}
	}
}

/// Text messages and inbound transfer events of one session as a single
/// stream, optionally preceded per frame by its raw form. Dropping it stops
/// listening.
pub struct EngineEvents {
	rx: mpsc::UnboundedReceiver<EngineEvent>,
	transfers: InboundTransfers,
	forward: JoinHandle<()>,
	_messages: Subscription,
	_raw: Option<Subscription>,
}

impl EngineEvents {
	pub(crate) fn listen(session: &Arc<Session>, options: EventOptions) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();

		let raw = options.raw_stanzas.then(|| {
			let tx = tx.clone();
			session.relay().on_raw_frame(move |element: Arc<Element>| {
				let _ = tx.send(EngineEvent::RawStanza(RawStanza::of(&element)));
				async { Ok(()) }
			})
		});

		let messages = {
			let tx = tx.clone();
			session.relay().on_text_message(move |message| {
				let _ = tx.send(EngineEvent::from(message));
				async { Ok(()) }
			})
		};

		let transfers = InboundTransfers::listen(session, options.inbound);
		let mut transfer_rx = transfers.events();
		let forward = tokio::spawn(async move {
			loop {
				match transfer_rx.recv().await {
					Ok(event) => {
						if tx.send(EngineEvent::from(event)).is_err() {
							break;
						}
					}
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						tracing::warn!(skipped, "transfer events dropped");
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});

		Self {
			rx,
			transfers,
			forward,
			_messages: messages,
			_raw: raw,
		}
	}

	/// Next event, or `None` once the stream has ended.
	pub async fn recv(&mut self) -> Option<EngineEvent> {
		self.rx.recv().await
	}

	pub fn transfers(&self) -> &InboundTransfers {
		&self.transfers
	}
}

impl Drop for EngineEvents {
	fn drop(&mut self) {
		self.forward.abort();
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use xft_protocol::Jid;

	use super::*;

	#[test]
	fn test_text_message_envelope() {
		let event = EngineEvent::from(TextMessage {
			sender: Some(Jid::parse("bob@example.org/pc").unwrap()),
			body: "hi".into(),
			timestamp_ms: 42,
		});
		assert_eq!(event.kind(), "text-message");
		assert_eq!(
			event.to_json(),
			json!({
				"type": "text-message",
				"payload": {"sender": "bob@example.org/pc", "body": "hi", "timestamp_ms": 42}
			})
		);
	}

	#[test]
	fn test_file_received_envelope() {
		let event = EngineEvent::from(TransferEvent::FileReceived(ReceivedFile {
			sid: "sid-1".into(),
			sender: None,
			file_name: "a.bin".into(),
			declared_size: Some(3),
			base64_payload: "AQID".into(),
		}));
		let value = event.to_json();
		assert_eq!(value["type"], "file-received");
		assert_eq!(value["payload"]["base64_payload"], "AQID");
		assert_eq!(value["payload"]["declared_size"], 3);
		assert_eq!(value["payload"]["sender"], serde_json::Value::Null);
	}

	#[test]
	fn test_raw_stanza_envelope() {
		let element = Element::parse(
			r#"<message xmlns="jabber:client" from="bob@example.org/pc" to="alice@example.org/pc" id="m-1"><body>hi</body></message>"#,
		)
		.unwrap();
		let value = EngineEvent::RawStanza(RawStanza::of(&element)).to_json();

		assert_eq!(value["type"], "raw-stanza");
		assert_eq!(value["payload"]["name"], "message");
		assert_eq!(value["payload"]["from"], "bob@example.org/pc");
		assert_eq!(value["payload"]["to"], "alice@example.org/pc");
		assert_eq!(value["payload"]["id"], "m-1");
		assert!(value["payload"]["stanza"].as_str().unwrap().contains("<body>hi</body>"));
		assert!(value["payload"]["timestamp_ms"].as_u64().unwrap() > 0);
	}

	#[test]
	fn test_event_options_from_inbound() {
		let options = EventOptions::from(InboundOptions::default().with_session_timeout(Duration::from_secs(5)));
		assert!(!options.raw_stanzas);
		assert_eq!(options.inbound.session_timeout, Duration::from_secs(5));
		assert!(options.with_raw_stanzas(true).raw_stanzas);
	}

	#[test]
	fn test_file_offer_kind() {
		let event = EngineEvent::from(TransferEvent::FileOffered(FileOffer {
			sid: "s".into(),
			sender: None,
			file_name: Some("x".into()),
			declared_size: None,
		}));
		assert_eq!(event.to_json()["type"], event.kind());
	}
}
