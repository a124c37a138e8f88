use std::sync::Arc;

use xft_protocol::Jid;
use xft_runtime::{Connector, Error, Result, SessionHandle, SessionManager, SessionOptions};

use crate::events::{EngineEvents, EventOptions};
use crate::messaging;
use crate::presence::PresenceResolver;
use crate::transfer::{InboundOptions, InboundTransfers, TransferEngine, TransferOptions, TransferReport};

/// Owns the session registry and everything built on it.
///
/// Cloning shares state. Call [`shutdown`](Self::shutdown) before exit to
/// end every stream cleanly.
#[derive(Debug, Clone)]
pub struct Client {
	sessions: SessionManager,
	resolver: PresenceResolver,
	transfers: TransferEngine,
}

impl Default for Client {
	fn default() -> Self {
		Self::new()
	}
}

impl Client {
	/// Client connecting over WebSocket.
	pub fn new() -> Self {
		Self::from_sessions(SessionManager::new(), TransferOptions::default())
	}

	pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
		Self::from_sessions(SessionManager::with_connector(connector), TransferOptions::default())
	}

	fn from_sessions(sessions: SessionManager, options: TransferOptions) -> Self {
		let resolver = PresenceResolver::new(sessions.clone());
		let transfers = TransferEngine::new(sessions.clone(), resolver.clone(), options);
		Self {
			sessions,
			resolver,
			transfers,
		}
	}

	/// Replaces the default outbound transfer options.
	pub fn with_transfer_options(self, options: TransferOptions) -> Self {
		Self::from_sessions(self.sessions, options)
	}

	pub fn sessions(&self) -> &SessionManager {
		&self.sessions
	}

	pub fn resolver(&self) -> &PresenceResolver {
		&self.resolver
	}

	pub fn transfers(&self) -> &TransferEngine {
		&self.transfers
	}

	/// Acquires (or reuses) the session for `key`.
	pub async fn connect(&self, key: &str, options: SessionOptions) -> Result<SessionHandle> {
		self.sessions.acquire(key, options).await
	}

	fn session(&self, key: &str) -> Result<SessionHandle> {
		self.sessions
			.session(key)
			.ok_or_else(|| Error::NotConnected { key: key.to_string() })
	}

	/// Sends a chat message; returns its frame id.
	pub fn send_message(&self, key: &str, to: &Jid, body: &str) -> Result<String> {
		messaging::send_message(&*self.session(key)?, to, body)
	}

	pub async fn send_file(&self, key: &str, to: &Jid, file_name: &str, bytes: &[u8]) -> Result<TransferReport> {
		self.transfers.send_file(key, to, file_name, bytes).await
	}

	/// Best full address for `bare`, using the transfer resolve timeout.
	pub async fn resolve(&self, key: &str, bare: &Jid) -> Option<Jid> {
		self.resolver
			.resolve(key, bare, self.transfers.options().resolve_timeout)
			.await
	}

	pub fn listen(&self, key: &str, options: InboundOptions) -> Result<InboundTransfers> {
		self.transfers.listen(key, options)
	}

	/// Text messages plus inbound transfer events for `key`; raw frames too
	/// when [`EventOptions::raw_stanzas`] is set.
	pub fn events(&self, key: &str, options: impl Into<EventOptions>) -> Result<EngineEvents> {
		Ok(EngineEvents::listen(&self.session(key)?, options.into()))
	}

	/// Releases every session.
	pub async fn shutdown(&self) {
		tracing::debug!(sessions = ?self.sessions.keys(), "shutting down");
		self.sessions.release_all().await;
	}
}
