//! Wire types for the xft XMPP runtime.
//!
//! This crate has no I/O. It defines:
//!
//! - [`Element`] - a namespace-aware XML element tree, parsed from and
//!   serialized to one complete frame at a time
//! - [`Jid`] - bare and full addresses
//! - [`Frame`] - the tagged frame model produced by [`Frame::classify`]
//! - [`stanza`] - builders for every outbound frame the runtime sends
//! - [`ns`] - namespace constants that are part of the wire contract

pub mod frame;
pub mod jid;
pub mod ns;
pub mod stanza;
pub mod xml;

pub use frame::{
	Carrier, ChatMessage, Envelope, Frame, IbbClose, IbbData, IbbOpen, IqKind, Ping, PresenceUpdate, Reply,
	StanzaError, StreamAccept, StreamMethod, StreamOffer,
};
pub use jid::{Jid, JidError};
pub use xml::{Element, ElementBuilder, Node, ParseError};
