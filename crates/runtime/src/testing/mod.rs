//! In-memory XMPP server for tests.
//!
//! [`MockServer`] hands out a [`Connector`](crate::transport::Connector)
//! whose transports are [`MemoryTransport`](crate::transport::MemoryTransport)
//! pairs. Each connection is served by a task that negotiates the stream
//! (PLAIN only), binds a resource and then routes stanzas between connected
//! clients by address:
//!
//! - full address: delivered to that resource; requests to an absent
//!   resource get `service-unavailable`
//! - bare address: messages go to the highest-priority available resource;
//!   disco#items lists connected resources; disco#info and other requests
//!   get `service-unavailable`
//! - server address: pings (when enabled) and legacy session requests are
//!   answered
//! - presence probes are answered with the presence of every available
//!   resource of the probed account
//!
//! Every stanza a client sends after binding is recorded with its `from`
//! stamped, so tests can assert on exact wire traffic.

mod server;

pub use server::MockServer;
