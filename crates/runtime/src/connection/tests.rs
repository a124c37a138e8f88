use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use xft_protocol::Jid;

use super::*;
use crate::testing::MockServer;

const DOMAIN: &str = "example.org";

fn params(username: &str, resource: Option<&str>) -> StreamParams {
	StreamParams {
		domain: DOMAIN.to_string(),
		username: username.to_string(),
		password: "secret".to_string(),
		resource: resource.map(str::to_string),
	}
}

async fn connect(server: &MockServer, username: &str, resource: Option<&str>) -> Result<Arc<Connection>> {
	let parts = server.connector().connect("memory://test").await?;
	Connection::establish(parts, &params(username, resource), Arc::new(EventRelay::new())).await
}

/// Sender that refuses chat messages once the stream is up.
struct RefuseMessages(Box<dyn TransportSender>);

#[async_trait]
impl TransportSender for RefuseMessages {
	async fn send(&mut self, frame: String) -> Result<()> {
		if frame.starts_with("<message") {
			return Err(Error::TransportError("write refused".to_string()));
		}
		self.0.send(frame).await
	}

	async fn close(&mut self) -> Result<()> {
		self.0.close().await
	}
}

#[tokio::test]
async fn test_establish_binds_requested_resource() {
	let server = MockServer::new(DOMAIN);
	let connection = connect(&server, "alice", Some("laptop")).await.unwrap();

	assert_eq!(connection.jid().to_string(), "alice@example.org/laptop");
	assert!(server.is_connected(connection.jid()));
	assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_establish_server_assigned_resource() {
	let server = MockServer::new(DOMAIN);
	let connection = connect(&server, "alice", None).await.unwrap();

	let resource = connection.jid().resource().unwrap();
	assert!(resource.starts_with("res-"), "unexpected resource {resource}");
}

#[tokio::test]
async fn test_rejected_credentials() {
	let server = MockServer::new(DOMAIN);
	server.add_account("alice", "other");

	let err = connect(&server, "alice", None).await.unwrap_err();
	assert!(matches!(err, Error::AuthenticationFailed(ref c) if c == "not-authorized"), "{err:?}");
	assert_eq!(server.auth_attempts(), 1);
	assert!(server.connected().is_empty());
}

#[tokio::test]
async fn test_send_and_await_resolves_result() {
	let server = MockServer::new(DOMAIN);
	let connection = connect(&server, "alice", None).await.unwrap();

	let reply = connection.send_and_await(stanza::ping(None, "p-1")).await.unwrap();
	assert_eq!(reply.attr("type"), Some("result"));
	assert_eq!(reply.attr("id"), Some("p-1"));
}

#[tokio::test]
async fn test_error_reply_becomes_stanza_error() {
	let server = MockServer::new(DOMAIN);
	let connection = connect(&server, "alice", None).await.unwrap();

	let to = Jid::parse("bob@example.org/missing").unwrap();
	let err = connection
		.send_and_await(stanza::disco_info(&to, "d-1"))
		.await
		.unwrap_err();
	assert_eq!(err.condition(), Some("service-unavailable"));
}

#[tokio::test]
async fn test_request_without_id_is_rejected() {
	let server = MockServer::new(DOMAIN);
	let connection = connect(&server, "alice", None).await.unwrap();

	let frame = Element::builder("iq", ns::CLIENT).attr("type", "get").build();
	let err = connection.send_and_await(frame).await.unwrap_err();
	assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_request_timeout_removes_reply_slot() {
	let server = MockServer::new(DOMAIN);
	server.set_answer_pings(false);
	let connection = connect(&server, "alice", None).await.unwrap();

	let err = connection
		.request(stanza::ping(None, "p-slow"), Duration::from_millis(50))
		.await
		.unwrap_err();
	assert!(err.is_timeout());

	// The guard cleans up on a spawned task.
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert!(connection.callbacks.lock().await.is_empty());
}

#[tokio::test]
async fn test_server_ping_is_answered() {
	let server = MockServer::new(DOMAIN);
	let connection = connect(&server, "alice", Some("pc")).await.unwrap();

	let ping = Element::builder("iq", ns::CLIENT)
		.attr("type", "get")
		.attr("id", "s2c-1")
		.attr("from", DOMAIN)
		.append(Element::new("ping", ns::PING))
		.build();
	assert!(server.deliver(connection.jid(), &ping));

	let reply = server
		.wait_for_frame(Duration::from_secs(1), |el| el.attr("id") == Some("s2c-1"))
		.await
		.expect("ping answered");
	assert_eq!(reply.attr("type"), Some("result"));
	assert_eq!(reply.attr("to"), Some(DOMAIN));
}

#[tokio::test]
async fn test_inbound_frames_reach_relay() {
	let server = MockServer::new(DOMAIN);
	let parts = server.connector().connect("memory://test").await.unwrap();
	let relay = Arc::new(EventRelay::new());
	let count = Arc::new(AtomicUsize::new(0));
	let _sub = {
		let count = Arc::clone(&count);
		relay.on_text_message(move |msg| {
			let count = Arc::clone(&count);
			async move {
				assert_eq!(msg.body, "hi");
				count.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		})
	};
	let connection = Connection::establish(parts, &params("alice", Some("pc")), Arc::clone(&relay))
		.await
		.unwrap();

	let message = stanza::chat_message(connection.jid(), "m-1", "hi");
	assert!(server.deliver(connection.jid(), &message));

	tokio::time::timeout(Duration::from_secs(1), async {
		while count.load(Ordering::SeqCst) == 0 {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.unwrap();
}

#[tokio::test]
async fn test_kick_closes_connection_and_fails_pending() {
	let server = MockServer::new(DOMAIN);
	server.set_answer_pings(false);
	let connection = connect(&server, "alice", None).await.unwrap();

	let pending = {
		let connection = Arc::clone(&connection);
		tokio::spawn(async move { connection.send_and_await(stanza::ping(None, "p-lost")).await })
	};
	server
		.wait_for_frame(Duration::from_secs(1), |el| el.attr("id") == Some("p-lost"))
		.await
		.unwrap();

	assert!(server.kick(connection.jid()));
	tokio::time::timeout(Duration::from_secs(1), connection.closed())
		.await
		.unwrap();

	let err = pending.await.unwrap().unwrap_err();
	assert!(matches!(err, Error::ChannelClosed));
	assert!(matches!(connection.send(stanza::ping(None, "after")), Err(Error::ChannelClosed)));
}

#[tokio::test]
async fn test_graceful_close() {
	let server = MockServer::new(DOMAIN);
	let connection = connect(&server, "alice", Some("pc")).await.unwrap();
	let jid = connection.jid().clone();

	connection.close().await;
	assert!(connection.is_closed());

	tokio::time::sleep(Duration::from_millis(20)).await;
	assert!(!server.is_connected(&jid));
}

#[tokio::test]
async fn test_dispatch_unknown_reply_is_ignored() {
	let server = MockServer::new(DOMAIN);
	let connection = connect(&server, "alice", None).await.unwrap();

	let stray = stanza::iq_result(None, "nobody-asked");
	assert!(connection.dispatch(stray).await.is_continue());
}

#[tokio::test]
async fn test_dispatch_stream_error_breaks() {
	let server = MockServer::new(DOMAIN);
	let connection = connect(&server, "alice", None).await.unwrap();

	let error = Element::builder("error", ns::STREAMS)
		.append(Element::new("conflict", ns::STREAM_ERRORS))
		.build();
	assert!(connection.dispatch(error).await.is_break());
	assert!(connection.dispatch(stanza::stream_close()).await.is_break());
}

#[tokio::test]
async fn test_write_resolves_after_transport_write() {
	let server = MockServer::new(DOMAIN);
	let connection = connect(&server, "alice", Some("pc")).await.unwrap();

	let to = Jid::parse("bob@example.org/laptop").unwrap();
	connection.write(stanza::chat_message(&to, "m-w", "hello")).await.unwrap();

	let logged = server
		.wait_for_frame(Duration::from_secs(1), |el| el.attr("id") == Some("m-w"))
		.await;
	assert!(logged.is_some());
}

#[tokio::test]
async fn test_write_error_reaches_caller_and_closes_stream() {
	let server = MockServer::new(DOMAIN);
	let mut parts = server.connector().connect("memory://test").await.unwrap();
	parts.sender = Box::new(RefuseMessages(parts.sender));
	let connection = Connection::establish(parts, &params("alice", Some("pc")), Arc::new(EventRelay::new()))
		.await
		.unwrap();

	let to = Jid::parse("bob@example.org/laptop").unwrap();
	let err = connection
		.write(stanza::chat_message(&to, "m-x", "lost"))
		.await
		.unwrap_err();
	assert!(matches!(err, Error::TransportError(_)), "{err:?}");

	tokio::time::timeout(Duration::from_secs(1), connection.closed())
		.await
		.unwrap();
	assert!(matches!(
		connection.write(stanza::chat_message(&to, "m-y", "after")).await,
		Err(Error::ChannelClosed)
	));
}
