//! Session registry.
//!
//! [`SessionManager`] owns one [`Session`] per caller-chosen key. A session
//! outlives its connections: when the stream drops or a keepalive probe goes
//! unanswered the session goes offline and a background task reconnects with
//! exponential backoff (1s doubling to 15s), reusing the same options
//! and resource. The session's [`EventRelay`] survives reconnects, so
//! subscribers never need to re-register.
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Online -> Offline -> Reconnecting -> Connecting -> ...
//!                                      \-> Disconnected (released)
//! ```
//!
//! Every transition is published on the relay's connectivity channel.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as TokioMutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use xft_protocol::{Element, Jid, stanza};

use crate::connection::{Connection, StreamParams};
use crate::error::{Error, Result};
use crate::handlers::{HandlerId, Subscription};
use crate::relay::{ConnectivityEvent, EventKind, EventRelay, RelayHandler};
use crate::transport::{Connector, WebSocketConnector};

/// First reconnect delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Reconnect delay cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
	Disconnected,
	Connecting,
	Online,
	Offline,
	Reconnecting,
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Disconnected => "disconnected",
			Self::Connecting => "connecting",
			Self::Online => "online",
			Self::Offline => "offline",
			Self::Reconnecting => "reconnecting",
		})
	}
}

/// Connection options for one session.
#[derive(Clone)]
pub struct SessionOptions {
	/// WebSocket endpoint, e.g. `wss://chat.example.org/xmpp-websocket`.
	pub service: String,
	pub domain: String,
	/// Account address or bare username.
	pub identity: String,
	pub secret: String,
	/// Resource to bind; a random `xft-xxxxxxxx` is generated when absent.
	pub resource: Option<String>,
	pub announce_presence: bool,
	pub priority: i8,
	pub ping_interval: Duration,
	pub ping_timeout: Duration,
	pub connect_timeout: Duration,
}

impl SessionOptions {
	pub fn new(
		service: impl Into<String>,
		domain: impl Into<String>,
		identity: impl Into<String>,
		secret: impl Into<String>,
	) -> Self {
		Self {
			service: service.into(),
			domain: domain.into(),
			identity: identity.into(),
			secret: secret.into(),
			resource: None,
			announce_presence: true,
			priority: 0,
			ping_interval: Duration::from_secs(30),
			ping_timeout: Duration::from_secs(10),
			connect_timeout: Duration::from_secs(15),
		}
	}

	pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
		self.resource = Some(resource.into());
		self
	}

	pub fn with_announce_presence(mut self, announce: bool) -> Self {
		self.announce_presence = announce;
		self
	}

	pub fn with_priority(mut self, priority: i8) -> Self {
		self.priority = priority;
		self
	}

	pub fn with_ping_interval(mut self, interval: Duration) -> Self {
		self.ping_interval = interval;
		self
	}

	pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
		self.ping_timeout = timeout;
		self
	}

	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
		self
	}

	/// Rejects options the keepalive task cannot run with.
	pub fn validate(&self) -> Result<()> {
		if self.ping_interval.is_zero() {
			return Err(Error::InvalidArgument("ping interval must be positive".to_string()));
		}
		if self.ping_timeout.is_zero() {
			return Err(Error::InvalidArgument("ping timeout must be positive".to_string()));
		}
		Ok(())
	}

	/// SASL username: the local part of `identity`, or all of it.
	pub fn username(&self) -> &str {
		self.identity
			.split_once('@')
			.map(|(node, _)| node)
			.unwrap_or(&self.identity)
	}

	fn stream_params(&self, resource: &str) -> StreamParams {
		StreamParams {
			domain: self.domain.clone(),
			username: self.username().to_string(),
			password: self.secret.clone(),
			resource: Some(resource.to_string()),
		}
	}
}

impl fmt::Debug for SessionOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionOptions")
			.field("service", &self.service)
			.field("domain", &self.domain)
			.field("identity", &self.identity)
			.field("secret", &"<redacted>")
			.field("resource", &self.resource)
			.field("announce_presence", &self.announce_presence)
			.field("priority", &self.priority)
			.field("ping_interval", &self.ping_interval)
			.field("ping_timeout", &self.ping_timeout)
			.field("connect_timeout", &self.connect_timeout)
			.finish()
	}
}

/// Shared handle to a registered session.
pub type SessionHandle = Arc<Session>;

#[derive(Default)]
struct SessionTasks {
	keepalive: Option<JoinHandle<()>>,
	monitor: Option<JoinHandle<()>>,
	reconnect: Option<JoinHandle<()>>,
}

/// One logical session. Shared as `Arc<Session>`; re-acquiring an online
/// key returns the same `Arc`.
pub struct Session {
	key: String,
	resource: String,
	options: Mutex<SessionOptions>,
	connector: Arc<dyn Connector>,
	connection: Mutex<Option<Arc<Connection>>>,
	state: watch::Sender<SessionState>,
	backoff: Mutex<Duration>,
	tasks: Mutex<SessionTasks>,
	relay: Arc<EventRelay>,
	jid: Mutex<Option<Jid>>,
	last_id: AtomicU32,
	released: AtomicBool,
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("key", &self.key)
			.field("state", &self.state())
			.field("jid", &self.jid())
			.finish()
	}
}

impl Session {
	fn new(key: &str, options: SessionOptions, connector: Arc<dyn Connector>) -> Arc<Self> {
		let resource = options.resource.clone().unwrap_or_else(random_resource);
		let (state, _) = watch::channel(SessionState::Disconnected);

		Arc::new(Self {
			key: key.to_string(),
			resource,
			options: Mutex::new(options),
			connector,
			connection: Mutex::new(None),
			state,
			backoff: Mutex::new(Duration::ZERO),
			tasks: Mutex::new(SessionTasks::default()),
			relay: Arc::new(EventRelay::new()),
			jid: Mutex::new(None),
			last_id: AtomicU32::new(0),
			released: AtomicBool::new(false),
		})
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	/// Resource bound on every (re)connect.
	pub fn resource(&self) -> &str {
		&self.resource
	}

	pub fn options(&self) -> SessionOptions {
		self.options.lock().clone()
	}

	pub fn state(&self) -> SessionState {
		*self.state.borrow()
	}

	pub fn watch_state(&self) -> watch::Receiver<SessionState> {
		self.state.subscribe()
	}

	/// Full address of the last bound stream.
	pub fn jid(&self) -> Option<Jid> {
		self.jid.lock().clone()
	}

	pub fn relay(&self) -> &Arc<EventRelay> {
		&self.relay
	}

	/// Delay used for the most recent reconnect attempt; zero while online.
	pub fn backoff(&self) -> Duration {
		*self.backoff.lock()
	}

	/// Returns a frame id unique within this session.
	pub fn next_id(&self, prefix: &str) -> String {
		let n = self.last_id.fetch_add(1, Ordering::SeqCst);
		format!("{prefix}-{n}")
	}

	/// Live connection, if online.
	pub fn connection(&self) -> Result<Arc<Connection>> {
		let connection = self.connection.lock().clone();
		match connection {
			Some(connection) if self.state() == SessionState::Online && !connection.is_closed() => Ok(connection),
			_ => Err(Error::NotConnected { key: self.key.clone() }),
		}
	}

	pub fn send(&self, frame: Element) -> Result<()> {
		self.connection()?.send(frame)
	}

	/// Sends a frame and waits until the transport has written it.
	pub async fn write(&self, frame: Element) -> Result<()> {
		self.connection()?.write(frame).await
	}

	pub async fn send_and_await(&self, frame: Element) -> Result<Element> {
		self.connection()?.send_and_await(frame).await
	}

	pub async fn request(&self, frame: Element, timeout: Duration) -> Result<Element> {
		self.connection()?.request(frame, timeout).await
	}

	pub async fn wait_until_online(&self, timeout: Duration) -> Result<()> {
		let mut rx = self.watch_state();
		match tokio::time::timeout(timeout, rx.wait_for(|s| *s == SessionState::Online)).await {
			Ok(Ok(_)) => Ok(()),
			Ok(Err(_)) => Err(Error::ChannelClosed),
			Err(_) => Err(Error::Timeout(format!(
				"session '{}' not online within {}ms",
				self.key,
				timeout.as_millis()
			))),
		}
	}

	fn is_released(&self) -> bool {
		self.released.load(Ordering::SeqCst)
	}

	async fn set_state(&self, state: SessionState) {
		let previous = self.state.send_replace(state);
		if previous == state {
			return;
		}
		tracing::debug!(key = %self.key, from = %previous, to = %state, "session state");
		self.relay
			.publish_connectivity(ConnectivityEvent {
				key: self.key.clone(),
				state,
				jid: self.jid(),
			})
			.await;
	}

	/// One connection attempt bounded by `connect_timeout`.
	async fn connect(self: &Arc<Self>) -> Result<()> {
		if self.is_released() {
			return Err(self.released_error());
		}
		let options = self.options();
		self.set_state(SessionState::Connecting).await;

		let params = options.stream_params(&self.resource);
		let attempt = async {
			let parts = self.connector.connect(&options.service).await?;
			Connection::establish(parts, &params, Arc::clone(&self.relay)).await
		};
		let connection = tokio::time::timeout(options.connect_timeout, attempt)
			.await
			.map_err(|_| {
				Error::ConnectionFailed(format!(
					"no session established within {}ms",
					options.connect_timeout.as_millis()
				))
			})??;

		self.on_online(connection, &options).await
	}

	fn released_error(&self) -> Error {
		Error::ConnectionFailed(format!("session '{}' was released", self.key))
	}

	async fn on_online(self: &Arc<Self>, connection: Arc<Connection>, options: &SessionOptions) -> Result<()> {
		if self.is_released() {
			connection.close().await;
			return Err(self.released_error());
		}

		*self.jid.lock() = Some(connection.jid().clone());
		*self.connection.lock() = Some(Arc::clone(&connection));
		*self.backoff.lock() = Duration::ZERO;

		if options.announce_presence {
			if let Err(e) = connection.send(stanza::presence(options.priority)) {
				tracing::warn!(key = %self.key, error = %e, "failed to announce presence");
			}
		}

		tracing::info!(key = %self.key, jid = %connection.jid(), "session online");
		self.set_state(SessionState::Online).await;

		let keepalive = tokio::spawn(keepalive(
			Arc::downgrade(self),
			Arc::clone(&connection),
			options.ping_interval,
			options.ping_timeout,
		));
		let monitor = tokio::spawn(monitor(Arc::downgrade(self), connection));

		{
			let mut tasks = self.tasks.lock();
			if let Some(old) = tasks.keepalive.replace(keepalive) {
				old.abort();
			}
			if let Some(old) = tasks.monitor.replace(monitor) {
				old.abort();
			}
			tasks.reconnect.take();
		}
		// Released while going online; the release tears the connection down.
		if self.is_released() {
			return Err(self.released_error());
		}
		Ok(())
	}

	async fn on_offline(self: &Arc<Self>, connection: &Arc<Connection>) {
		{
			let mut current = self.connection.lock();
			match current.as_ref() {
				Some(c) if Arc::ptr_eq(c, connection) => {
					current.take();
				}
				_ => return,
			}
		}
		if self.is_released() {
			return;
		}

		{
			let mut tasks = self.tasks.lock();
			if let Some(keepalive) = tasks.keepalive.take() {
				keepalive.abort();
			}
			tasks.monitor.take();
		}

		tracing::warn!(key = %self.key, "session offline");
		self.set_state(SessionState::Offline).await;

		let handle = tokio::spawn(reconnect(Arc::downgrade(self)));
		self.tasks.lock().reconnect = Some(handle);
	}

	/// Next reconnect delay: 1s, doubling, capped at 15s.
	fn advance_backoff(&self) -> Duration {
		let mut backoff = self.backoff.lock();
		*backoff = if backoff.is_zero() {
			INITIAL_BACKOFF
		} else {
			(*backoff * 2).min(MAX_BACKOFF)
		};
		*backoff
	}

	/// Marks the session released and stops its background tasks. An
	/// in-flight connect gives up when it completes.
	async fn halt(&self) {
		self.released.store(true, Ordering::SeqCst);
		{
			let mut tasks = self.tasks.lock();
			for task in [tasks.keepalive.take(), tasks.monitor.take(), tasks.reconnect.take()]
				.into_iter()
				.flatten()
			{
				task.abort();
			}
		}
		self.set_state(SessionState::Disconnected).await;
	}

	async fn shutdown(&self) {
		self.halt().await;

		let connection = self.connection.lock().take();
		if let Some(connection) = connection {
			let _ = connection.send(stanza::unavailable_presence());
			connection.close().await;
		}
		self.set_state(SessionState::Disconnected).await;
		tracing::info!(key = %self.key, "session released");
	}
}

fn random_resource() -> String {
	let id = uuid::Uuid::new_v4().simple().to_string();
	format!("xft-{}", &id[..8])
}

async fn monitor(session: Weak<Session>, connection: Arc<Connection>) {
	connection.closed().await;
	if let Some(session) = session.upgrade() {
		session.on_offline(&connection).await;
	}
}

async fn keepalive(session: Weak<Session>, connection: Arc<Connection>, interval: Duration, timeout: Duration) {
	let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		ticker.tick().await;
		if connection.is_closed() {
			return;
		}
		let Some(id) = session.upgrade().map(|s| s.next_id("ping")) else {
			return;
		};

		match connection.request(stanza::ping(None, &id), timeout).await {
			// An error reply still proves the stream is alive.
			Ok(_) | Err(Error::Stanza { .. }) => tracing::trace!(%id, "keepalive answered"),
			Err(e) => {
				tracing::warn!(%id, error = %e, "keepalive failed, dropping connection");
				connection.disconnect();
				return;
			}
		}
	}
}

/// Boxed to break the `connect -> monitor -> reconnect` cycle, which would
/// otherwise leave the spawned future's `Send` bound unprovable.
fn reconnect(session: Weak<Session>) -> BoxFuture<'static, ()> {
	Box::pin(reconnect_loop(session))
}

async fn reconnect_loop(session: Weak<Session>) {
	loop {
		let delay = {
			let Some(session) = session.upgrade() else {
				return;
			};
			if session.is_released() {
				return;
			}
			let delay = session.advance_backoff();
			tracing::info!(key = %session.key, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
			session.set_state(SessionState::Reconnecting).await;
			delay
		};

		tokio::time::sleep(delay).await;

		let Some(session) = session.upgrade() else {
			return;
		};
		if session.is_released() {
			return;
		}
		match session.connect().await {
			Ok(()) => return,
			Err(e) => tracing::warn!(key = %session.key, error = %e, "reconnect attempt failed"),
		}
	}
}

struct ManagerInner {
	connector: Arc<dyn Connector>,
	sessions: DashMap<String, Arc<Session>>,
	connect_locks: DashMap<String, Arc<TokioMutex<()>>>,
	registered: Notify,
}

/// Registry of sessions by key. Cloning shares the registry.
#[derive(Clone)]
pub struct SessionManager {
	inner: Arc<ManagerInner>,
}

impl fmt::Debug for SessionManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionManager")
			.field("keys", &self.keys())
			.finish()
	}
}

impl Default for SessionManager {
	fn default() -> Self {
		Self::new()
	}
}

impl SessionManager {
	/// Manager connecting over WebSocket.
	pub fn new() -> Self {
		Self::with_connector(Arc::new(WebSocketConnector))
	}

	pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
		Self {
			inner: Arc::new(ManagerInner {
				connector,
				sessions: DashMap::new(),
				connect_locks: DashMap::new(),
				registered: Notify::new(),
			}),
		}
	}

	/// Returns the session for `key`, connecting it first if needed.
	///
	/// An online session is returned as is, without reconnecting. Concurrent
	/// calls for one key are serialized: later callers get the session the
	/// first one established. When the first connection attempt fails the
	/// session stays registered as `Disconnected` and the error is returned.
	///
	/// A [`release`](Self::release) that lands while the connect is in flight
	/// makes this call fail with [`Error::ConnectionFailed`].
	pub async fn acquire(&self, key: &str, options: SessionOptions) -> Result<SessionHandle> {
		options.validate()?;

		let lock = self.connect_lock(key);
		let _guard = lock.lock().await;

		if let Some(session) = self.session(key).filter(|s| !s.is_released()) {
			match session.state() {
				SessionState::Online => {
					tracing::debug!(key, "reusing online session");
					return Ok(session);
				}
				SessionState::Disconnected => {
					*session.options.lock() = options;
					return self.first_connect(session).await;
				}
				_ => {
					let timeout = session.options().connect_timeout;
					let mut rx = session.watch_state();
					let settled = rx.wait_for(|s| matches!(s, SessionState::Online | SessionState::Disconnected));
					let online = matches!(
						tokio::time::timeout(timeout, settled).await,
						Ok(Ok(state)) if *state == SessionState::Online
					);
					if !online || session.is_released() {
						return Err(Error::ConnectionFailed(format!(
							"session '{key}' did not come back online within {}ms",
							timeout.as_millis()
						)));
					}
					return Ok(session);
				}
			}
		}

		let session = Session::new(key, options, Arc::clone(&self.inner.connector));
		self.inner.sessions.insert(key.to_string(), Arc::clone(&session));
		self.inner.registered.notify_waiters();
		self.first_connect(session).await
	}

	fn connect_lock(&self, key: &str) -> Arc<TokioMutex<()>> {
		Arc::clone(self.inner.connect_locks.entry(key.to_string()).or_default().value())
	}

	async fn first_connect(&self, session: Arc<Session>) -> Result<Arc<Session>> {
		match session.connect().await {
			Ok(()) => Ok(session),
			Err(e) => {
				tracing::warn!(key = %session.key, error = %e, "connect failed");
				session.set_state(SessionState::Disconnected).await;
				Err(e)
			}
		}
	}

	pub fn session(&self, key: &str) -> Option<Arc<Session>> {
		self.inner.sessions.get(key).map(|s| Arc::clone(s.value()))
	}

	pub fn keys(&self) -> Vec<String> {
		let mut keys: Vec<String> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
		keys.sort();
		keys
	}

	fn online(&self, key: &str) -> Result<Arc<Connection>> {
		self.session(key)
			.ok_or_else(|| Error::NotConnected { key: key.to_string() })?
			.connection()
	}

	/// Transmits a frame on the session's connection.
	pub fn send(&self, key: &str, frame: Element) -> Result<()> {
		self.online(key)?.send(frame)
	}

	/// Transmits a request and resolves with the matching reply.
	pub async fn send_and_await(&self, key: &str, frame: Element) -> Result<Element> {
		self.online(key)?.send_and_await(frame).await
	}

	/// Waits until the session for `key` is online. A key that has not been
	/// acquired yet is waited for as well; either way the wait is bounded by
	/// `timeout`.
	pub async fn wait_until_online(&self, key: &str, timeout: Duration) -> Result<()> {
		let deadline = tokio::time::Instant::now() + timeout;
		let session = loop {
			let registered = self.inner.registered.notified();
			if let Some(session) = self.session(key) {
				break session;
			}
			if tokio::time::timeout_at(deadline, registered).await.is_err() {
				return Err(Error::Timeout(format!(
					"session '{key}' not online within {}ms",
					timeout.as_millis()
				)));
			}
		};
		let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
		session.wait_until_online(remaining).await
	}

	/// Tears down a session and forgets it. Unknown keys are ignored.
	///
	/// Takes the key's connect guard, so an `acquire` in flight finishes (and
	/// fails) before the session is removed.
	pub async fn release(&self, key: &str) {
		let Some(session) = self.session(key) else {
			return;
		};
		session.halt().await;

		let lock = self.connect_lock(key);
		{
			let _guard = lock.lock().await;
			self.inner.sessions.remove_if(key, |_, s| Arc::ptr_eq(s, &session));
			// Keep the guard while anyone else holds or waits on it.
			self.inner
				.connect_locks
				.remove_if(key, |_, l| Arc::strong_count(l) == 2);
		}
		session.shutdown().await;
	}

	/// Releases every session.
	pub async fn release_all(&self) {
		for key in self.keys() {
			self.release(&key).await;
		}
	}

	/// Subscribes a handler on the session's relay.
	pub fn on(&self, key: &str, handler: RelayHandler) -> Result<Subscription> {
		let session = self
			.session(key)
			.ok_or_else(|| Error::NotConnected { key: key.to_string() })?;
		Ok(session.relay().subscribe(handler))
	}

	/// Removes a handler by id. Returns `false` if the key or handler is unknown.
	pub fn off(&self, key: &str, kind: EventKind, id: HandlerId) -> bool {
		self.session(key).is_some_and(|s| s.relay().off(kind, id))
	}
}
