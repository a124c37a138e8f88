//! Per-session event bus.
//!
//! The connection hands every inbound element to [`EventRelay`], which
//! republishes it as a raw frame and, for chat messages with a body, as a
//! [`TextMessage`]. Session state changes arrive as [`ConnectivityEvent`]s.
//! The relay belongs to the session, not the connection, so subscriptions
//! survive reconnects.
//!
//! Handlers run one event at a time in registration order. A handler
//! removed while an event is being delivered is not invoked for it.

use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use xft_protocol::{Element, Frame, Jid};

use crate::error::Result;
use crate::handlers::{HandlerEntry, HandlerFn, HandlerId, HandlerMap, Subscription, handler_fn, register};
use crate::session::SessionState;

/// Event channels a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	RawFrame,
	TextMessage,
	Connectivity,
}

/// Chat message with a body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextMessage {
	pub sender: Option<Jid>,
	pub body: String,
	pub timestamp_ms: u64,
}

/// Session state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityEvent {
	pub key: String,
	pub state: SessionState,
	pub jid: Option<Jid>,
}

/// Handler for one relay channel, for callers that pick the channel at
/// runtime.
pub enum RelayHandler {
	RawFrame(HandlerFn<Arc<Element>>),
	TextMessage(HandlerFn<TextMessage>),
	Connectivity(HandlerFn<ConnectivityEvent>),
}

impl RelayHandler {
	pub fn raw_frame<F, Fut>(f: F) -> Self
	where
		F: Fn(Arc<Element>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		Self::RawFrame(handler_fn(f))
	}

	pub fn text_message<F, Fut>(f: F) -> Self
	where
		F: Fn(TextMessage) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		Self::TextMessage(handler_fn(f))
	}

	pub fn connectivity<F, Fut>(f: F) -> Self
	where
		F: Fn(ConnectivityEvent) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		Self::Connectivity(handler_fn(f))
	}

	pub fn kind(&self) -> EventKind {
		match self {
			Self::RawFrame(_) => EventKind::RawFrame,
			Self::TextMessage(_) => EventKind::TextMessage,
			Self::Connectivity(_) => EventKind::Connectivity,
		}
	}
}

#[derive(Default)]
pub struct EventRelay {
	raw: HandlerMap<Arc<Element>>,
	text: HandlerMap<TextMessage>,
	connectivity: HandlerMap<ConnectivityEvent>,
}

impl std::fmt::Debug for EventRelay {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventRelay")
			.field("raw", &self.raw.lock().len())
			.field("text", &self.text.lock().len())
			.field("connectivity", &self.connectivity.lock().len())
			.finish()
	}
}

impl EventRelay {
	pub fn new() -> Self {
		Self::default()
	}

	/// Subscribes to every inbound frame.
	pub fn on_raw_frame<F, Fut>(&self, handler: F) -> Subscription
	where
		F: Fn(Arc<Element>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		register(&self.raw, handler_fn(handler))
	}

	/// Subscribes to chat messages that carry a body.
	pub fn on_text_message<F, Fut>(&self, handler: F) -> Subscription
	where
		F: Fn(TextMessage) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		register(&self.text, handler_fn(handler))
	}

	/// Subscribes to session state changes.
	pub fn on_connectivity<F, Fut>(&self, handler: F) -> Subscription
	where
		F: Fn(ConnectivityEvent) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		register(&self.connectivity, handler_fn(handler))
	}

	/// Registers an already-boxed handler on its channel.
	pub fn subscribe(&self, handler: RelayHandler) -> Subscription {
		match handler {
			RelayHandler::RawFrame(f) => register(&self.raw, f),
			RelayHandler::TextMessage(f) => register(&self.text, f),
			RelayHandler::Connectivity(f) => register(&self.connectivity, f),
		}
	}

	/// Removes a handler by id. Returns `false` if it was already gone.
	pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
		match kind {
			EventKind::RawFrame => self.raw.lock().shift_remove(&id).is_some(),
			EventKind::TextMessage => self.text.lock().shift_remove(&id).is_some(),
			EventKind::Connectivity => self.connectivity.lock().shift_remove(&id).is_some(),
		}
	}

	pub fn handler_count(&self, kind: EventKind) -> usize {
		match kind {
			EventKind::RawFrame => self.raw.lock().len(),
			EventKind::TextMessage => self.text.lock().len(),
			EventKind::Connectivity => self.connectivity.lock().len(),
		}
	}

	/// Publishes an inbound element. `frame` is its classification.
	pub(crate) async fn publish_frame(&self, element: Arc<Element>, frame: &Frame) {
		deliver(&self.raw, element, "raw-frame").await;

		if let Frame::Chat(chat) = frame {
			let message = TextMessage {
				sender: chat.envelope.from.clone(),
				body: chat.body.clone(),
				timestamp_ms: now_ms(),
			};
			deliver(&self.text, message, "text-message").await;
		}
	}

	pub(crate) async fn publish_connectivity(&self, event: ConnectivityEvent) {
		deliver(&self.connectivity, event, "connectivity").await;
	}
}

async fn deliver<E: Clone>(handlers: &HandlerMap<E>, event: E, kind: &'static str) {
	let snapshot: Vec<HandlerEntry<E>> = handlers.lock().values().cloned().collect();

	for entry in snapshot {
		if !handlers.lock().contains_key(&entry.id) {
			continue;
		}
		if let Err(e) = (entry.handler)(event.clone()).await {
			tracing::warn!(kind, handler = entry.id, error = %e, "event handler failed");
		}
	}
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or_default()
}
