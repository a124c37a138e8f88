use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Connector, TransportParts, TransportReceiver, TransportSender};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket subprotocol for XMPP framing.
pub const SUBPROTOCOL: &str = "xmpp";

/// XMPP-over-WebSocket transport.
pub struct WebSocketTransport;

impl WebSocketTransport {
	/// Connects to a `ws://` or `wss://` endpoint and splits the socket.
	pub async fn connect(url: &str) -> Result<TransportParts> {
		let mut request = url
			.into_client_request()
			.map_err(|e| Error::ConnectionFailed(format!("invalid service URL '{url}': {e}")))?;
		request
			.headers_mut()
			.insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

		let (stream, _response) = tokio_tungstenite::connect_async(request)
			.await
			.map_err(|e| Error::ConnectionFailed(format!("WebSocket connect to {url} failed: {e}")))?;

		tracing::debug!(url, "websocket connected");
		Ok(Self::from_stream(stream))
	}

	fn from_stream(stream: WsStream) -> TransportParts {
		let (sink, stream) = stream.split();
		let (frame_tx, frame_rx) = mpsc::unbounded_channel();

		TransportParts {
			sender: Box::new(WebSocketTransportSender { sink }),
			receiver: Box::new(WebSocketTransportReceiver { stream, frame_tx }),
			frame_rx,
		}
	}
}

struct WebSocketTransportSender {
	sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSender for WebSocketTransportSender {
	async fn send(&mut self, frame: String) -> Result<()> {
		tracing::trace!(frame = %frame, "send");
		self.sink
			.send(Message::Text(frame))
			.await
			.map_err(|e| Error::TransportError(e.to_string()))
	}

	async fn close(&mut self) -> Result<()> {
		self.sink
			.close()
			.await
			.map_err(|e| Error::TransportError(e.to_string()))
	}
}

struct WebSocketTransportReceiver {
	stream: SplitStream<WsStream>,
	frame_tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportReceiver for WebSocketTransportReceiver {
	async fn run(mut self: Box<Self>) -> Result<()> {
		while let Some(message) = self.stream.next().await {
			let text = match message.map_err(|e| Error::TransportError(e.to_string()))? {
				Message::Text(text) => text,
				Message::Binary(bytes) => String::from_utf8(bytes)
					.map_err(|e| Error::TransportError(format!("non UTF-8 binary frame: {e}")))?,
				Message::Close(frame) => {
					tracing::debug!(?frame, "websocket closed by peer");
					break;
				}
				_ => continue,
			};

			tracing::trace!(frame = %text, "recv");
			if self.frame_tx.send(text).is_err() {
				break;
			}
		}
		Ok(())
	}
}

/// [`Connector`] that opens a [`WebSocketTransport`] per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
	async fn connect(&self, service: &str) -> Result<TransportParts> {
		WebSocketTransport::connect(service).await
	}
}
