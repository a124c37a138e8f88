//! Stream connection: request/reply correlation and inbound dispatch.
//!
//! # Frame flow
//!
//! 1. [`Connection::establish`] negotiates the stream over the raw transport
//! 2. A writer task drains the outbound queue in `send` order
//! 3. The dispatch loop parses each inbound frame, resolves the pending
//!    request whose id matches an iq result or error, answers server pings,
//!    and hands the frame to the session's [`EventRelay`]
//! 4. When the transport ends, pending requests fail with
//!    [`Error::ChannelClosed`] and [`Connection::closed`] resolves
//!
//! Relay handlers run inside the dispatch loop. They may call
//! [`Connection::send`] but must not await a reply, which would need the
//! loop they are blocking.

pub mod negotiate;
pub mod sasl;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex as ParkingLotMutex;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use xft_protocol::{Element, Frame, IqKind, Jid, StanzaError, ns, stanza};

pub use self::negotiate::StreamParams;
use crate::error::{Error, Result};
use crate::relay::EventRelay;
use crate::transport::{TransportParts, TransportSender};

/// Pending request callbacks keyed by frame id.
type CallbackMap = Arc<TokioMutex<HashMap<String, oneshot::Sender<Result<Element>>>>>;

/// RAII guard ensuring callback cleanup when a request future is dropped.
struct CancelGuard {
	id: String,
	callbacks: CallbackMap,
	completed: bool,
}

impl CancelGuard {
	fn new(id: String, callbacks: CallbackMap) -> Self {
		Self {
			id,
			callbacks,
			completed: false,
		}
	}

	fn complete(&mut self) {
		self.completed = true;
	}
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}

		let id = std::mem::take(&mut self.id);
		let callbacks = Arc::clone(&self.callbacks);

		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				if callbacks.lock().await.remove(&id).is_some() {
					tracing::debug!(%id, "removed abandoned reply slot");
				}
			});
		}
	}
}

/// Future returned by [`Connection::send_and_await`].
struct ReplyFuture {
	rx: oneshot::Receiver<Result<Element>>,
	guard: CancelGuard,
}

impl Future for ReplyFuture {
	type Output = Result<Element>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.complete();
				Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

struct AbortOnDrop(Option<AbortHandle>);

impl AbortOnDrop {
	fn disarm(mut self) -> Option<AbortHandle> {
		self.0.take()
	}
}

impl Drop for AbortOnDrop {
	fn drop(&mut self) {
		if let Some(handle) = self.0.take() {
			handle.abort();
		}
	}
}

/// Completion of one transport write.
type WriteAck = oneshot::Sender<Result<()>>;

enum Outbound {
	Frame(String, Option<WriteAck>),
	Close,
}

/// Negotiated stream to the server.
pub struct Connection {
	jid: Jid,
	callbacks: CallbackMap,
	outbound_tx: mpsc::UnboundedSender<Outbound>,
	relay: Arc<EventRelay>,
	reader: ParkingLotMutex<Option<AbortHandle>>,
	closed: watch::Sender<bool>,
}

impl fmt::Debug for Connection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Connection")
			.field("jid", &self.jid)
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl Connection {
	/// Negotiates the stream on `parts` and starts the writer and dispatch
	/// tasks.
	pub async fn establish(parts: TransportParts, params: &StreamParams, relay: Arc<EventRelay>) -> Result<Arc<Self>> {
		let TransportParts {
			mut sender,
			receiver,
			mut frame_rx,
		} = parts;

		let reader = tokio::spawn(async move {
			if let Err(e) = receiver.run().await {
				tracing::debug!(error = %e, "transport read error");
			}
		});
		// Aborts the reader if negotiation fails or this future is dropped.
		let reader = AbortOnDrop(Some(reader.abort_handle()));

		let jid = match negotiate::negotiate(sender.as_mut(), &mut frame_rx, params).await {
			Ok(jid) => jid,
			Err(e) => {
				let _ = sender.close().await;
				return Err(e);
			}
		};

		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let (closed, _) = watch::channel(false);

		let connection = Arc::new(Self {
			jid,
			callbacks: Arc::new(TokioMutex::new(HashMap::new())),
			outbound_tx,
			relay,
			reader: ParkingLotMutex::new(reader.disarm()),
			closed,
		});

		// A failed write takes the whole stream down so the session notices.
		let writer = Arc::downgrade(&connection);
		tokio::spawn(async move {
			if write_loop(sender, outbound_rx).await.is_err() {
				if let Some(connection) = writer.upgrade() {
					connection.disconnect();
				}
			}
		});

		let dispatcher = Arc::clone(&connection);
		tokio::spawn(async move { dispatcher.run(frame_rx).await });

		Ok(connection)
	}

	/// Full address bound during negotiation.
	pub fn jid(&self) -> &Jid {
		&self.jid
	}

	pub fn is_closed(&self) -> bool {
		*self.closed.borrow()
	}

	/// Resolves once the inbound stream has ended.
	pub async fn closed(&self) {
		let mut rx = self.closed.subscribe();
		let _ = rx.wait_for(|closed| *closed).await;
	}

	/// Queues a frame for the writer task.
	pub fn send(&self, frame: Element) -> Result<()> {
		if self.is_closed() {
			return Err(Error::ChannelClosed);
		}
		tracing::trace!(frame = %frame, "queue");
		self.outbound_tx
			.send(Outbound::Frame(frame.to_xml(), None))
			.map_err(|_| Error::ChannelClosed)
	}

	/// Sends a frame and resolves once the transport has written it.
	///
	/// Write errors are returned to the caller. Frames queued earlier with
	/// [`send`](Self::send) are written first.
	pub async fn write(&self, frame: Element) -> Result<()> {
		if self.is_closed() {
			return Err(Error::ChannelClosed);
		}
		tracing::trace!(frame = %frame, "write");
		let (ack, written) = oneshot::channel();
		self.outbound_tx
			.send(Outbound::Frame(frame.to_xml(), Some(ack)))
			.map_err(|_| Error::ChannelClosed)?;
		written.await.map_err(|_| Error::ChannelClosed)?
	}

	/// Sends a request and resolves with the iq result or error carrying the
	/// same id. An error reply becomes [`Error::Stanza`].
	pub async fn send_and_await(&self, frame: Element) -> Result<Element> {
		let id = frame
			.attr("id")
			.ok_or_else(|| Error::InvalidArgument("request frame has no id".to_string()))?
			.to_string();

		let (tx, rx) = oneshot::channel();
		self.callbacks.lock().await.insert(id.clone(), tx);
		let guard = CancelGuard::new(id.clone(), Arc::clone(&self.callbacks));

		tracing::debug!(%id, name = frame.name(), "awaiting reply");
		self.send(frame)?;

		ReplyFuture { rx, guard }.await
	}

	/// [`send_and_await`](Self::send_and_await) bounded by `timeout`.
	pub async fn request(&self, frame: Element, timeout: Duration) -> Result<Element> {
		let id = frame.attr("id").unwrap_or_default().to_string();
		tokio::time::timeout(timeout, self.send_and_await(frame))
			.await
			.map_err(|_| Error::Timeout(format!("no reply to '{id}' within {}ms", timeout.as_millis())))?
	}

	/// Ends the stream gracefully, waiting briefly for the server to close.
	pub async fn close(&self) {
		let _ = self.outbound_tx.send(Outbound::Close);
		if tokio::time::timeout(Duration::from_secs(2), self.closed()).await.is_err() {
			self.disconnect();
		}
	}

	/// Drops the transport immediately.
	pub fn disconnect(&self) {
		let _ = self.outbound_tx.send(Outbound::Close);
		if let Some(reader) = self.reader.lock().take() {
			reader.abort();
		}
	}

	/// Run the inbound dispatch loop until the transport ends.
	async fn run(self: &Arc<Self>, mut frame_rx: mpsc::UnboundedReceiver<String>) {
		while let Some(text) = frame_rx.recv().await {
			let element = match Element::parse(&text) {
				Ok(element) => element,
				Err(e) => {
					tracing::debug!(error = %e, "ignoring unparseable frame");
					continue;
				}
			};
			if self.dispatch_internal(element).await.is_break() {
				break;
			}
		}

		self.closed.send_replace(true);
		self.callbacks.lock().await.clear();
		self.disconnect();
		tracing::debug!(jid = %self.jid, "stream closed");
	}

	/// Dispatch an inbound element (test-only public version)
	#[cfg(test)]
	pub async fn dispatch(self: &Arc<Self>, element: Element) -> ControlFlow<()> {
		self.dispatch_internal(element).await
	}

	async fn dispatch_internal(self: &Arc<Self>, element: Element) -> ControlFlow<()> {
		if element.is("close", ns::FRAMING) {
			tracing::debug!("server closed the stream");
			return ControlFlow::Break(());
		}
		if element.is("error", ns::STREAMS) {
			let condition = element.children().next().map(|c| c.name().to_string()).unwrap_or_default();
			tracing::warn!(condition, "stream error");
			return ControlFlow::Break(());
		}

		if element.name() == "iq" {
			self.resolve_reply(&element).await;
		}

		let frame = Frame::classify(&element);
		if let Frame::Ping(ping) = &frame {
			if let Some(id) = &ping.envelope.id {
				if let Err(e) = self.send(stanza::iq_result(ping.envelope.from.as_ref(), id)) {
					tracing::debug!(error = %e, "failed to answer ping");
				}
			}
		}

		self.relay.publish_frame(Arc::new(element), &frame).await;
		ControlFlow::Continue(())
	}

	async fn resolve_reply(&self, element: &Element) {
		let kind = element.attr("type").and_then(IqKind::parse);
		if !matches!(kind, Some(IqKind::Result | IqKind::Error)) {
			return;
		}
		let Some(id) = element.attr("id") else {
			return;
		};
		let Some(callback) = self.callbacks.lock().await.remove(id) else {
			tracing::trace!(id, "reply without pending request");
			return;
		};

		let result = match kind {
			Some(IqKind::Error) => Err(StanzaError::of(element).into()),
			_ => Ok(element.clone()),
		};
		let _ = callback.send(result);
	}
}

/// Drains the outbound queue. Returns the first write error; frames still
/// queued behind it are dropped and their waiters see [`Error::ChannelClosed`].
async fn write_loop(
	mut sender: Box<dyn TransportSender>,
	mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) -> Result<()> {
	let mut outcome = Ok(());
	while let Some(outbound) = outbound_rx.recv().await {
		match outbound {
			Outbound::Frame(text, ack) => {
				let result = sender.send(text).await;
				let failed = result.as_ref().err().map(ToString::to_string);
				if let Some(ack) = ack {
					let _ = ack.send(result);
				}
				if let Some(error) = failed {
					tracing::debug!(%error, "transport write error");
					outcome = Err(Error::TransportError(error));
					break;
				}
			}
			Outbound::Close => {
				let _ = sender.send(stanza::stream_close().to_xml()).await;
				break;
			}
		}
	}
	let _ = sender.close().await;
	outcome
}

#[cfg(test)]
mod tests;
