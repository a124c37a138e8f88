use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{TransportParts, TransportReceiver, TransportSender};
use crate::error::{Error, Result};

/// In-process transport backed by two unbounded channels.
pub struct MemoryTransport;

/// Far end of a [`MemoryTransport`].
///
/// Frames sent on `tx` arrive at the client; frames the client sends are read
/// from `rx`. Dropping `tx` closes the client's stream.
pub struct MemoryPeer {
	pub tx: mpsc::UnboundedSender<String>,
	pub rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryTransport {
	pub fn pair() -> (TransportParts, MemoryPeer) {
		let (client_tx, peer_rx) = mpsc::unbounded_channel();
		let (peer_tx, client_rx) = mpsc::unbounded_channel();
		let (frame_tx, frame_rx) = mpsc::unbounded_channel();

		let parts = TransportParts {
			sender: Box::new(MemorySender { tx: Some(client_tx) }),
			receiver: Box::new(MemoryReceiver { rx: client_rx, frame_tx }),
			frame_rx,
		};
		(parts, MemoryPeer { tx: peer_tx, rx: peer_rx })
	}
}

struct MemorySender {
	tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl TransportSender for MemorySender {
	async fn send(&mut self, frame: String) -> Result<()> {
		let tx = self
			.tx
			.as_ref()
			.ok_or_else(|| Error::TransportError("transport closed".to_string()))?;
		tx.send(frame)
			.map_err(|_| Error::TransportError("peer went away".to_string()))
	}

	async fn close(&mut self) -> Result<()> {
		self.tx.take();
		Ok(())
	}
}

struct MemoryReceiver {
	rx: mpsc::UnboundedReceiver<String>,
	frame_tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
	async fn run(mut self: Box<Self>) -> Result<()> {
		while let Some(frame) = self.rx.recv().await {
			if self.frame_tx.send(frame).is_err() {
				break;
			}
		}
		Ok(())
	}
}
