use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;

use super::*;

#[tokio::test]
async fn test_memory_transport_delivers_in_order() {
	let (parts, mut peer) = MemoryTransport::pair();
	let TransportParts {
		mut sender,
		receiver,
		mut frame_rx,
	} = parts;

	let read_task = tokio::spawn(receiver.run());

	for frame in ["<a/>", "<b/>", "<c/>"] {
		sender.send(frame.to_string()).await.unwrap();
	}
	for expected in ["<a/>", "<b/>", "<c/>"] {
		assert_eq!(peer.rx.recv().await.as_deref(), Some(expected));
	}

	peer.tx.send("<reply/>".to_string()).unwrap();
	assert_eq!(frame_rx.recv().await.as_deref(), Some("<reply/>"));

	// Dropping the peer's sender ends the read loop cleanly.
	drop(peer.tx);
	assert!(read_task.await.unwrap().is_ok());
	assert!(frame_rx.recv().await.is_none());
}

#[tokio::test]
async fn test_memory_sender_fails_after_close() {
	let (parts, _peer) = MemoryTransport::pair();
	let mut sender = parts.sender;

	sender.close().await.unwrap();
	let err = sender.send("<a/>".to_string()).await.unwrap_err();
	assert!(err.to_string().contains("transport closed"));
}

#[tokio::test]
async fn test_websocket_transport_round_trip() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	let server = tokio::spawn(async move {
		let (stream, _) = listener.accept().await.unwrap();
		let callback = |request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
			assert_eq!(
				request.headers().get("Sec-WebSocket-Protocol").and_then(|v| v.to_str().ok()),
				Some("xmpp")
			);
			response
				.headers_mut()
				.insert("Sec-WebSocket-Protocol", HeaderValue::from_static("xmpp"));
			Ok(response)
		};
		let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();

		let Some(Ok(Message::Text(text))) = ws.next().await else {
			panic!("expected a text frame");
		};
		ws.send(Message::Text(format!("<echo>{text}</echo>"))).await.unwrap();
		ws.close(None).await.unwrap();
	});

	let TransportParts {
		mut sender,
		receiver,
		mut frame_rx,
	} = WebSocketTransport::connect(&format!("ws://{addr}")).await.unwrap();
	let read_task = tokio::spawn(receiver.run());

	sender.send("<open/>".to_string()).await.unwrap();
	assert_eq!(frame_rx.recv().await.as_deref(), Some("<echo><open/></echo>"));

	server.await.unwrap();
	assert!(read_task.await.unwrap().is_ok());
	assert!(frame_rx.recv().await.is_none());
}

#[tokio::test]
async fn test_websocket_connect_failure_is_connection_error() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	drop(listener);

	let err = WebSocketTransport::connect(&format!("ws://{addr}")).await.err().unwrap();
	assert!(err.is_connection_error());

	let err = WebSocketTransport::connect("not a url").await.err().unwrap();
	assert!(err.is_connection_error());
}
