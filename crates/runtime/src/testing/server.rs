use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use xft_protocol::{Element, Jid, ns, stanza};

use crate::error::{Error, Result};
use crate::transport::{Connector, MemoryPeer, MemoryTransport, TransportParts};

struct ClientEntry {
	conn_id: u64,
	tx: mpsc::UnboundedSender<String>,
	priority: i8,
	available: bool,
	kick: Arc<Notify>,
}

struct ServerState {
	domain: String,
	accounts: Mutex<HashMap<String, String>>,
	reject_auth: AtomicBool,
	answer_pings: AtomicBool,
	refuse_connections: AtomicBool,
	auth_attempts: AtomicUsize,
	connections: AtomicUsize,
	next_conn: AtomicU64,
	clients: Mutex<HashMap<Jid, ClientEntry>>,
	disco_info: Mutex<HashMap<Jid, Jid>>,
	log: Mutex<Vec<Element>>,
	logged: Notify,
}

/// Scriptable in-memory XMPP server. Cloning shares the server.
#[derive(Clone)]
pub struct MockServer {
	state: Arc<ServerState>,
}

impl MockServer {
	pub fn new(domain: &str) -> Self {
		Self {
			state: Arc::new(ServerState {
				domain: domain.to_lowercase(),
				accounts: Mutex::new(HashMap::new()),
				reject_auth: AtomicBool::new(false),
				answer_pings: AtomicBool::new(true),
				refuse_connections: AtomicBool::new(false),
				auth_attempts: AtomicUsize::new(0),
				connections: AtomicUsize::new(0),
				next_conn: AtomicU64::new(1),
				clients: Mutex::new(HashMap::new()),
				disco_info: Mutex::new(HashMap::new()),
				log: Mutex::new(Vec::new()),
				logged: Notify::new(),
			}),
		}
	}

	pub fn domain(&self) -> &str {
		&self.state.domain
	}

	/// Registers an account. Without any account every credential is accepted.
	pub fn add_account(&self, username: &str, password: &str) {
		self.state
			.accounts
			.lock()
			.insert(username.to_lowercase(), password.to_string());
	}

	pub fn set_reject_auth(&self, reject: bool) {
		self.state.reject_auth.store(reject, Ordering::SeqCst);
	}

	pub fn set_answer_pings(&self, answer: bool) {
		self.state.answer_pings.store(answer, Ordering::SeqCst);
	}

	pub fn set_refuse_connections(&self, refuse: bool) {
		self.state.refuse_connections.store(refuse, Ordering::SeqCst);
	}

	/// Answers disco#info queries sent to `bare` with an empty result whose
	/// sender is `from`. Without this such queries get service-unavailable.
	pub fn answer_disco_info(&self, bare: &Jid, from: &Jid) {
		self.state.disco_info.lock().insert(bare.bare(), from.clone());
	}

	/// Number of SASL `auth` requests received.
	pub fn auth_attempts(&self) -> usize {
		self.state.auth_attempts.load(Ordering::SeqCst)
	}

	/// Number of transports opened, refused ones excluded.
	pub fn connections(&self) -> usize {
		self.state.connections.load(Ordering::SeqCst)
	}

	pub fn connector(&self) -> Arc<dyn Connector> {
		Arc::new(MemoryConnector {
			state: Arc::clone(&self.state),
		})
	}

	/// Addresses of currently bound resources.
	pub fn connected(&self) -> Vec<Jid> {
		let mut jids: Vec<Jid> = self.state.clients.lock().keys().cloned().collect();
		jids.sort();
		jids
	}

	pub fn is_connected(&self, jid: &Jid) -> bool {
		self.state.clients.lock().contains_key(jid)
	}

	/// Every stanza received from clients so far, `from` stamped.
	pub fn frames(&self) -> Vec<Element> {
		self.state.log.lock().clone()
	}

	pub fn frames_matching(&self, predicate: impl Fn(&Element) -> bool) -> Vec<Element> {
		self.state.log.lock().iter().filter(|el| predicate(el)).cloned().collect()
	}

	/// Waits until a recorded stanza satisfies `predicate`.
	pub async fn wait_for_frame(&self, timeout: Duration, predicate: impl Fn(&Element) -> bool) -> Option<Element> {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let notified = self.state.logged.notified();
			if let Some(el) = self.state.log.lock().iter().find(|el| predicate(el)) {
				return Some(el.clone());
			}
			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				return None;
			}
		}
	}

	/// Pushes a frame to a bound resource verbatim.
	pub fn deliver(&self, to: &Jid, frame: &Element) -> bool {
		match self.state.clients.lock().get(to) {
			Some(client) => client.tx.send(frame.to_xml()).is_ok(),
			None => false,
		}
	}

	/// Drops the connection of a bound resource without closing the stream.
	pub fn kick(&self, jid: &Jid) -> bool {
		match self.state.clients.lock().remove(jid) {
			Some(client) => {
				client.kick.notify_one();
				true
			}
			None => false,
		}
	}
}

struct MemoryConnector {
	state: Arc<ServerState>,
}

#[async_trait]
impl Connector for MemoryConnector {
	async fn connect(&self, service: &str) -> Result<TransportParts> {
		if self.state.refuse_connections.load(Ordering::SeqCst) {
			return Err(Error::ConnectionFailed(format!("connection to {service} refused")));
		}
		self.state.connections.fetch_add(1, Ordering::SeqCst);

		let (parts, peer) = MemoryTransport::pair();
		tokio::spawn(serve(Arc::clone(&self.state), peer));
		Ok(parts)
	}
}

struct Bound {
	jid: Jid,
	conn_id: u64,
	kick: Arc<Notify>,
}

async fn serve(state: Arc<ServerState>, peer: MemoryPeer) {
	let MemoryPeer { tx, mut rx } = peer;
	let Some(bound) = handshake(&state, &tx, &mut rx).await else {
		return;
	};

	loop {
		tokio::select! {
			frame = rx.recv() => match frame {
				Some(text) => {
					if !state.handle(&bound.jid, &tx, &text) {
						break;
					}
				}
				None => break,
			},
			_ = bound.kick.notified() => break,
		}
	}

	state.unregister(&bound.jid, bound.conn_id);
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<Element> {
	let text = rx.recv().await?;
	Element::parse(&text).ok()
}

fn send(tx: &mpsc::UnboundedSender<String>, el: &Element) {
	let _ = tx.send(el.to_xml());
}

async fn handshake(
	state: &Arc<ServerState>,
	tx: &mpsc::UnboundedSender<String>,
	rx: &mut mpsc::UnboundedReceiver<String>,
) -> Option<Bound> {
	let open = recv(rx).await?;
	if !open.is("open", ns::FRAMING) {
		return None;
	}
	state.open_stream(tx);
	send(
		tx,
		&Element::builder("features", ns::STREAMS)
			.append(
				Element::builder("mechanisms", ns::SASL)
					.append(Element::builder("mechanism", ns::SASL).text("PLAIN").build())
					.build(),
			)
			.build(),
	);

	let auth = recv(rx).await?;
	if !auth.is("auth", ns::SASL) {
		return None;
	}
	state.auth_attempts.fetch_add(1, Ordering::SeqCst);
	let username = match state.check_plain(&auth.text()) {
		Some(username) => username,
		None => {
			send(
				tx,
				&Element::builder("failure", ns::SASL)
					.append(Element::new("not-authorized", ns::SASL))
					.build(),
			);
			send(tx, &stanza::stream_close());
			return None;
		}
	};
	send(tx, &Element::new("success", ns::SASL));

	let open = recv(rx).await?;
	if !open.is("open", ns::FRAMING) {
		return None;
	}
	state.open_stream(tx);
	send(
		tx,
		&Element::builder("features", ns::STREAMS)
			.append(Element::new("bind", ns::BIND))
			.append(
				Element::builder("session", ns::SESSION)
					.append(Element::new("optional", ns::SESSION))
					.build(),
			)
			.build(),
	);

	let request = recv(rx).await?;
	let bind = request.get_child("bind", ns::BIND)?;
	let conn_id = state.next_conn.fetch_add(1, Ordering::SeqCst);
	let resource = bind
		.child_text("resource", ns::BIND)
		.filter(|r| !r.is_empty())
		.unwrap_or_else(|| format!("res-{conn_id}"));

	let account = Jid::parse(&format!("{username}@{}", state.domain)).ok()?;
	let jid = account.with_resource(resource);
	let kick = Arc::new(Notify::new());
	state.register(&jid, conn_id, tx.clone(), Arc::clone(&kick));

	send(
		tx,
		&Element::builder("iq", ns::CLIENT)
			.attr("type", "result")
			.attr_opt("id", request.attr("id"))
			.append(
				Element::builder("bind", ns::BIND)
					.append(Element::builder("jid", ns::BIND).text(jid.to_string()).build())
					.build(),
			)
			.build(),
	);

	Some(Bound { jid, conn_id, kick })
}

impl ServerState {
	fn open_stream(&self, tx: &mpsc::UnboundedSender<String>) {
		send(
			tx,
			&Element::builder("open", ns::FRAMING)
				.attr("from", &self.domain)
				.attr("id", uuid::Uuid::new_v4().simple())
				.attr("version", "1.0")
				.build(),
		);
	}

	fn check_plain(&self, payload: &str) -> Option<String> {
		if self.reject_auth.load(Ordering::SeqCst) {
			return None;
		}
		let decoded = STANDARD.decode(payload.trim()).ok()?;
		let decoded = String::from_utf8(decoded).ok()?;
		let mut parts = decoded.split('\0');
		let _authzid = parts.next()?;
		let username = parts.next()?.to_lowercase();
		let password = parts.next()?;

		let accounts = self.accounts.lock();
		if accounts.is_empty() || accounts.get(&username).map(String::as_str) == Some(password) {
			Some(username)
		} else {
			None
		}
	}

	fn register(&self, jid: &Jid, conn_id: u64, tx: mpsc::UnboundedSender<String>, kick: Arc<Notify>) {
		let entry = ClientEntry {
			conn_id,
			tx,
			priority: 0,
			available: false,
			kick,
		};
		if let Some(old) = self.clients.lock().insert(jid.clone(), entry) {
			old.kick.notify_one();
		}
	}

	fn unregister(&self, jid: &Jid, conn_id: u64) {
		let mut clients = self.clients.lock();
		if clients.get(jid).is_some_and(|c| c.conn_id == conn_id) {
			clients.remove(jid);
		}
	}

	/// Handles one stanza from `from`. Returns `false` when the stream ends.
	fn handle(&self, from: &Jid, tx: &mpsc::UnboundedSender<String>, text: &str) -> bool {
		let Ok(mut el) = Element::parse(text) else {
			return true;
		};
		if el.is("close", ns::FRAMING) {
			send(tx, &stanza::stream_close());
			return false;
		}

		el.set_attr("from", from.to_string());
		self.log.lock().push(el.clone());
		self.logged.notify_waiters();

		let to = el.attr("to").and_then(|t| Jid::parse(t).ok());
		match el.name() {
			"presence" => self.handle_presence(from, &el, to),
			"iq" => self.handle_iq(from, tx, &el, to),
			"message" => {
				if let Some(to) = to {
					self.route(&to, &el);
				}
			}
			_ => {}
		}
		true
	}

	fn handle_presence(&self, from: &Jid, el: &Element, to: Option<Jid>) {
		let kind = el.attr("type");
		match (kind, to) {
			(Some("probe"), Some(to)) => {
				let bare = to.bare();
				let replies: Vec<Element> = self
					.clients
					.lock()
					.iter()
					.filter(|(jid, c)| jid.shares_bare(&bare) && c.available)
					.map(|(jid, c)| {
						Element::builder("presence", ns::CLIENT)
							.attr("from", jid)
							.attr("to", from)
							.append(Element::builder("priority", ns::CLIENT).text(c.priority.to_string()).build())
							.build()
					})
					.collect();
				for reply in &replies {
					self.route(from, reply);
				}
			}
			(_, Some(to)) => {
				self.route(&to, el);
			}
			(kind, None) => {
				if let Some(client) = self.clients.lock().get_mut(from) {
					client.available = kind.is_none();
					client.priority = el
						.child_text("priority", ns::CLIENT)
						.and_then(|p| p.trim().parse().ok())
						.unwrap_or(0);
				}
			}
		}
	}

	fn handle_iq(&self, from: &Jid, tx: &mpsc::UnboundedSender<String>, el: &Element, to: Option<Jid>) {
		let kind = el.attr("type").unwrap_or_default();
		let is_request = kind == "get" || kind == "set";
		let id = el.attr("id").unwrap_or_default();

		let Some(to) = to.filter(|to| to.node().is_some()) else {
			if !is_request {
				return;
			}
			if el.has_child("ping", ns::PING) {
				if self.answer_pings.load(Ordering::SeqCst) {
					send(tx, &stanza::iq_result(None, id));
				}
			} else if el.has_child("session", ns::SESSION) {
				send(tx, &stanza::iq_result(None, id));
			} else {
				send(tx, &stanza::iq_error(None, id, "cancel", "service-unavailable"));
			}
			return;
		};

		if to.is_bare() {
			if !is_request {
				return;
			}
			let info_from = self.disco_info.lock().get(&to.bare()).cloned();
			if let Some(info_from) = info_from.filter(|_| kind == "get" && el.has_child("query", ns::DISCO_INFO)) {
				let mut reply = stanza::iq_result(Some(from), id);
				reply.append_child(Element::new("query", ns::DISCO_INFO));
				reply.set_attr("from", info_from.to_string());
				send(tx, &reply);
				return;
			}
			let mut reply = if kind == "get" && el.has_child("query", ns::DISCO_ITEMS) {
				let items: Vec<Element> = self
					.connected_resources(&to)
					.iter()
					.map(|jid| Element::builder("item", ns::DISCO_ITEMS).attr("jid", jid).build())
					.collect();
				let mut reply = stanza::iq_result(Some(from), id);
				reply.append_child(Element::builder("query", ns::DISCO_ITEMS).append_all(items).build());
				reply
			} else {
				stanza::iq_error(Some(from), id, "cancel", "service-unavailable")
			};
			reply.set_attr("from", to.to_string());
			send(tx, &reply);
			return;
		}

		if !self.route(&to, el) && is_request {
			let mut reply = stanza::iq_error(Some(from), id, "cancel", "service-unavailable");
			reply.set_attr("from", to.to_string());
			send(tx, &reply);
		}
	}

	fn connected_resources(&self, bare: &Jid) -> Vec<Jid> {
		let mut jids: Vec<Jid> = self
			.clients
			.lock()
			.keys()
			.filter(|jid| jid.shares_bare(bare))
			.cloned()
			.collect();
		jids.sort();
		jids
	}

	/// Delivers to a full address, or to the best resource of a bare one.
	fn route(&self, to: &Jid, el: &Element) -> bool {
		let clients = self.clients.lock();
		let target = if to.is_full() {
			clients.get(to)
		} else {
			clients
				.iter()
				.filter(|(jid, c)| jid.shares_bare(to) && c.available)
				.max_by_key(|(_, c)| c.priority)
				.map(|(_, c)| c)
		};
		match target {
			Some(client) => client.tx.send(el.to_xml()).is_ok(),
			None => false,
		}
	}
}
