//! xft: XMPP file transfer
//!
//! Sends and receives files over an authenticated XMPP session using stream
//! initiation (XEP-0095/0096) negotiated onto in-band bytestreams (XEP-0047),
//! and relays chat messages.
//!
//! # Example
//!
//! ```ignore
//! use xft::{Client, InboundOptions, Jid, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> xft::Result<()> {
//!     let client = Client::new();
//!     let options = SessionOptions::new(
//!         "wss://chat.example.org/xmpp-websocket",
//!         "example.org",
//!         "alice@example.org",
//!         "secret",
//!     );
//!     client.connect("default", options).await?;
//!
//!     let to = Jid::parse("bob@example.org")?;
//!     let report = client.send_file("default", &to, "notes.txt", b"hello").await?;
//!     println!("sent {} in {} blocks", report.sid, report.blocks);
//!
//!     let mut events = client.events("default", InboundOptions::default())?;
//!     while let Some(event) = events.recv().await {
//!         println!("{}", event.to_json());
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

mod client;
pub mod events;
pub mod messaging;
pub mod presence;
pub mod transfer;

pub use client::Client;
pub use events::{EngineEvent, EngineEvents, EventOptions, RawStanza};
pub use presence::{PresenceCache, PresenceResolver};
pub use transfer::{
	FileOffer, InboundOptions, InboundTransfers, ReceivedFile, TransferEngine, TransferEvent, TransferOptions,
	TransferReport,
};
pub use xft_protocol::{Carrier, Element, Jid};
pub use xft_runtime::{
	ConnectivityEvent, Error, EventKind, RelayHandler, Result, SessionHandle, SessionManager, SessionOptions,
	SessionState, Subscription, TextMessage,
};
