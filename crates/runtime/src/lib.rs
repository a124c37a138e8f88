//! xft runtime - sessions, transports and stream plumbing
//!
//! This crate owns everything between a caller-chosen session key and the
//! bytes on the wire:
//!
//! - **Transport**: WebSocket framing (`xmpp` subprotocol), one stanza per
//!   text frame
//! - **Connection**: stream negotiation (SASL, bind), request/reply
//!   correlation by frame id, automatic ping answers
//! - **Session**: keyed registry with keepalive and reconnect with backoff
//! - **Relay**: per-session event bus for raw frames, chat messages and
//!   connectivity changes
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐
//! │ SessionManager │  key -> Session
//! └───────┬────────┘
//!         │ owns
//! ┌───────▼────────┐   publishes   ┌────────────┐
//! │    Session     ├──────────────►│ EventRelay │
//! └───────┬────────┘               └─────▲──────┘
//!         │ current                      │
//! ┌───────▼────────┐   dispatch loop     │
//! │   Connection   ├─────────────────────┘
//! └───────┬────────┘
//!         │
//! ┌───────▼────────┐
//! │   Transport    │  WebSocket / in-memory
//! └────────────────┘
//! ```

pub mod connection;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use connection::{Connection, StreamParams};
pub use error::{Error, Result};
pub use handlers::{HandlerId, Subscription};
pub use relay::{ConnectivityEvent, EventKind, EventRelay, RelayHandler, TextMessage};
pub use session::{Session, SessionHandle, SessionManager, SessionOptions, SessionState};
pub use transport::{Connector, TransportParts, TransportReceiver, TransportSender, WebSocketConnector};
