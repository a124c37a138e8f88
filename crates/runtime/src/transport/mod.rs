//! Frame transports.
//!
//! A transport moves complete XML frames as strings. It is split into a
//! [`TransportSender`] owned by the connection's writer task and a
//! [`TransportReceiver`] whose [`run`](TransportReceiver::run) loop pushes
//! inbound frames into an unbounded channel until the peer goes away.
//!
//! Implementations:
//!
//! - [`WebSocketTransport`] - XMPP over WebSocket (RFC 7395), one element per
//!   text message, subprotocol `xmpp`
//! - [`MemoryTransport`] - in-process channel pair for tests (`testing` feature)

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

#[cfg(any(test, feature = "testing"))]
mod memory;
mod websocket;

#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryPeer, MemoryTransport};
pub use websocket::{WebSocketConnector, WebSocketTransport};

/// Outbound half of a transport.
#[async_trait]
pub trait TransportSender: Send {
	/// Writes one serialized frame.
	async fn send(&mut self, frame: String) -> Result<()>;

	/// Closes the outbound side. Further sends fail.
	async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a transport.
#[async_trait]
pub trait TransportReceiver: Send {
	/// Forwards frames until the peer closes or an error occurs.
	///
	/// Returning drops the frame channel, which the connection observes as a
	/// closed stream.
	async fn run(self: Box<Self>) -> Result<()>;
}

/// Both halves plus the channel inbound frames are delivered on.
pub struct TransportParts {
	pub sender: Box<dyn TransportSender>,
	pub receiver: Box<dyn TransportReceiver>,
	pub frame_rx: mpsc::UnboundedReceiver<String>,
}

/// Opens transports to a service endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
	async fn connect(&self, service: &str) -> Result<TransportParts>;
}

#[cfg(test)]
mod tests;
