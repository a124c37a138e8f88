//! Tagged frame model.
//!
//! [`Frame::classify`] inspects a parsed stanza once and produces a variant
//! the runtime can switch on. Anything that does not match a known shape,
//! including frames missing a required attribute such as `sid`, becomes
//! [`Frame::Other`] so callers can ignore it without special cases.

use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

/// Addressing attributes shared by every stanza.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
	pub from: Option<Jid>,
	pub to: Option<Jid>,
	pub id: Option<String>,
}

impl Envelope {
	/// Reads `from`, `to` and `id`. Unparseable addresses are treated as absent.
	pub fn of(el: &Element) -> Self {
		Self {
			from: el.attr("from").and_then(|v| Jid::parse(v).ok()),
			to: el.attr("to").and_then(|v| Jid::parse(v).ok()),
			id: el.attr("id").map(str::to_string),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
	Get,
	Set,
	Result,
	Error,
}

impl IqKind {
	pub fn parse(value: &str) -> Option<Self> {
		match value {
			"get" => Some(Self::Get),
			"set" => Some(Self::Set),
			"result" => Some(Self::Result),
			"error" => Some(Self::Error),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Get => "get",
			Self::Set => "set",
			Self::Result => "result",
			Self::Error => "error",
		}
	}
}

/// Stanza kind that carries in-band bytestream data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Carrier {
	#[default]
	Message,
	Iq,
}

impl Carrier {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Message => "message",
			Self::Iq => "iq",
		}
	}

	/// Parses the `stanza` attribute of an open request. Absent means `iq`.
	pub fn from_open_attr(value: Option<&str>) -> Self {
		match value {
			Some("message") => Self::Message,
			_ => Self::Iq,
		}
	}
}

/// Stream methods a peer may negotiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMethod {
	Ibb,
	Other(String),
}

impl StreamMethod {
	pub fn parse(value: &str) -> Self {
		match value.trim() {
			ns::IBB => Self::Ibb,
			other => Self::Other(other.to_string()),
		}
	}
}

/// Stream-initiation file offer (`iq set` + `si`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOffer {
	pub envelope: Envelope,
	pub sid: String,
	pub file_name: Option<String>,
	/// Initiator-declared size; untrusted.
	pub file_size: Option<u64>,
	pub mime_type: Option<String>,
	pub methods: Vec<StreamMethod>,
}

impl StreamOffer {
	pub fn offers_ibb(&self) -> bool {
		self.methods.contains(&StreamMethod::Ibb)
	}
}

/// Stream-initiation accept (`iq result` + `si`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAccept {
	pub envelope: Envelope,
	pub method: Option<StreamMethod>,
}

impl StreamAccept {
	pub fn selects_ibb(&self) -> bool {
		self.method == Some(StreamMethod::Ibb)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbbOpen {
	pub envelope: Envelope,
	pub sid: String,
	pub block_size: Option<u32>,
	pub stanza: Carrier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbbData {
	pub envelope: Envelope,
	pub sid: String,
	pub seq: Option<u16>,
	/// Base64 text with surrounding whitespace removed.
	pub payload: String,
	pub carrier: Carrier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbbClose {
	pub envelope: Envelope,
	pub sid: String,
}

/// Liveness probe addressed to this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
	pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
	pub envelope: Envelope,
	/// Value of the `type` attribute; `None` means available.
	pub kind: Option<String>,
	pub priority: i8,
	pub show: Option<String>,
	pub status: Option<String>,
}

impl PresenceUpdate {
	pub fn is_unavailable(&self) -> bool {
		self.kind.as_deref() == Some("unavailable")
	}

	pub fn is_probe(&self) -> bool {
		self.kind.as_deref() == Some("probe")
	}

	/// Available presence: no type, or one that is neither unavailable,
	/// a probe, an error nor a subscription request.
	pub fn is_available(&self) -> bool {
		self.kind.is_none()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
	pub envelope: Envelope,
	pub kind: Option<String>,
	pub body: String,
}

/// Error condition carried by an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
	pub kind: String,
	pub condition: String,
	pub text: Option<String>,
}

impl StanzaError {
	pub fn of(el: &Element) -> Self {
		let Some(error) = el.get_child("error", el.ns()) else {
			return Self {
				kind: "cancel".to_string(),
				condition: "undefined-condition".to_string(),
				text: None,
			};
		};

		let condition = error
			.children()
			.find(|c| c.ns() == ns::STANZAS && c.name() != "text")
			.map(|c| c.name().to_string())
			.unwrap_or_else(|| "undefined-condition".to_string());

		Self {
			kind: error.attr("type").unwrap_or("cancel").to_string(),
			condition,
			text: error.child_text("text", ns::STANZAS),
		}
	}
}

/// Iq result or error that is not an SI accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
	pub envelope: Envelope,
	pub kind: IqKind,
	pub error: Option<StanzaError>,
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	Offer(StreamOffer),
	Accept(StreamAccept),
	Open(IbbOpen),
	Data(IbbData),
	Close(IbbClose),
	Ping(Ping),
	Presence(PresenceUpdate),
	Chat(ChatMessage),
	Reply(Reply),
	Other,
}

impl Frame {
	pub fn classify(el: &Element) -> Frame {
		if !el.ns().is_empty() && el.ns() != ns::CLIENT {
			return Frame::Other;
		}

		match el.name() {
			"iq" => classify_iq(el),
			"message" => classify_message(el),
			"presence" => Frame::Presence(presence(el)),
			_ => Frame::Other,
		}
	}

	/// Short variant name for logging.
	pub fn kind_name(&self) -> &'static str {
		match self {
			Frame::Offer(_) => "offer",
			Frame::Accept(_) => "accept",
			Frame::Open(_) => "open",
			Frame::Data(_) => "data",
			Frame::Close(_) => "close",
			Frame::Ping(_) => "ping",
			Frame::Presence(_) => "presence",
			Frame::Chat(_) => "chat",
			Frame::Reply(_) => "reply",
			Frame::Other => "other",
		}
	}

	pub fn envelope(&self) -> Option<&Envelope> {
		match self {
			Frame::Offer(f) => Some(&f.envelope),
			Frame::Accept(f) => Some(&f.envelope),
			Frame::Open(f) => Some(&f.envelope),
			Frame::Data(f) => Some(&f.envelope),
			Frame::Close(f) => Some(&f.envelope),
			Frame::Ping(f) => Some(&f.envelope),
			Frame::Presence(f) => Some(&f.envelope),
			Frame::Chat(f) => Some(&f.envelope),
			Frame::Reply(f) => Some(&f.envelope),
			Frame::Other => None,
		}
	}
}

fn classify_iq(el: &Element) -> Frame {
	let Some(kind) = el.attr("type").and_then(IqKind::parse) else {
		return Frame::Other;
	};
	let envelope = Envelope::of(el);

	match kind {
		IqKind::Set => {
			if let Some(si) = el.get_child("si", ns::SI) {
				return stream_offer(envelope, si);
			}
			if let Some(open) = el.get_child("open", ns::IBB) {
				return match open.attr("sid") {
					Some(sid) => Frame::Open(IbbOpen {
						envelope,
						sid: sid.to_string(),
						block_size: open.attr("block-size").and_then(|v| v.trim().parse().ok()),
						stanza: Carrier::from_open_attr(open.attr("stanza")),
					}),
					None => Frame::Other,
				};
			}
			if let Some(data) = el.get_child("data", ns::IBB) {
				return ibb_data(envelope, data, Carrier::Iq);
			}
			if let Some(close) = el.get_child("close", ns::IBB) {
				return match close.attr("sid") {
					Some(sid) => Frame::Close(IbbClose {
						envelope,
						sid: sid.to_string(),
					}),
					None => Frame::Other,
				};
			}
			Frame::Other
		}
		IqKind::Get => {
			if el.has_child("ping", ns::PING) {
				Frame::Ping(Ping { envelope })
			} else {
				Frame::Other
			}
		}
		IqKind::Result => match el.get_child("si", ns::SI) {
			Some(si) => Frame::Accept(StreamAccept {
				envelope,
				method: selected_method(si),
			}),
			None => Frame::Reply(Reply {
				envelope,
				kind,
				error: None,
			}),
		},
		IqKind::Error => Frame::Reply(Reply {
			envelope,
			kind,
			error: Some(StanzaError::of(el)),
		}),
	}
}

fn classify_message(el: &Element) -> Frame {
	let envelope = Envelope::of(el);
	if let Some(data) = el.get_child("data", ns::IBB) {
		return ibb_data(envelope, data, Carrier::Message);
	}
	match el.get_child("body", el.ns()) {
		Some(body) => Frame::Chat(ChatMessage {
			envelope,
			kind: el.attr("type").map(str::to_string),
			body: body.text(),
		}),
		None => Frame::Other,
	}
}

fn presence(el: &Element) -> PresenceUpdate {
	PresenceUpdate {
		envelope: Envelope::of(el),
		kind: el.attr("type").map(str::to_string),
		priority: el
			.child_text("priority", el.ns())
			.and_then(|p| p.trim().parse().ok())
			.unwrap_or(0),
		show: el.child_text("show", el.ns()),
		status: el.child_text("status", el.ns()),
	}
}

fn stream_offer(envelope: Envelope, si: &Element) -> Frame {
	let Some(sid) = si.attr("id") else {
		return Frame::Other;
	};
	let file = si.get_child("file", ns::SI_FILE_TRANSFER);

	let methods = stream_method_field(si)
		.map(|field| {
			field
				.children()
				.filter(|c| c.name() == "option")
				.filter_map(|option| option.get_child("value", option.ns()))
				.map(|value| StreamMethod::parse(&value.text()))
				.collect()
		})
		.unwrap_or_default();

	Frame::Offer(StreamOffer {
		envelope,
		sid: sid.to_string(),
		file_name: file.and_then(|f| f.attr("name")).map(str::to_string),
		file_size: file.and_then(|f| f.attr("size")).and_then(|s| s.trim().parse().ok()),
		mime_type: si.attr("mime-type").map(str::to_string),
		methods,
	})
}

fn selected_method(si: &Element) -> Option<StreamMethod> {
	let field = stream_method_field(si)?;
	let value = field.get_child("value", field.ns())?;
	Some(StreamMethod::parse(&value.text()))
}

fn stream_method_field(si: &Element) -> Option<&Element> {
	si.get_child("feature", ns::FEATURE_NEG)?
		.get_child("x", ns::DATA_FORMS)?
		.children()
		.find(|field| field.name() == "field" && field.attr("var") == Some("stream-method"))
}

fn ibb_data(envelope: Envelope, data: &Element, carrier: Carrier) -> Frame {
	match data.attr("sid") {
		Some(sid) => Frame::Data(IbbData {
			envelope,
			sid: sid.to_string(),
			seq: data.attr("seq").and_then(|s| s.trim().parse().ok()),
			payload: data.text().trim().to_string(),
			carrier,
		}),
		None => Frame::Other,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::stanza;

	fn jid(s: &str) -> Jid {
		Jid::parse(s).unwrap()
	}

	#[test]
	fn test_classify_offer_built_by_stanza_module() {
		let el = stanza::si_offer(&jid("bob@example.org/pc"), "offer-1", "sid-1", "report.pdf", 5000);
		let Frame::Offer(offer) = Frame::classify(&el) else {
			panic!("expected offer");
		};
		assert_eq!(offer.sid, "sid-1");
		assert_eq!(offer.file_name.as_deref(), Some("report.pdf"));
		assert_eq!(offer.file_size, Some(5000));
		assert!(offer.offers_ibb());
		assert_eq!(offer.envelope.id.as_deref(), Some("offer-1"));
	}

	#[test]
	fn test_classify_accept() {
		let el = stanza::si_accept(&jid("alice@example.org/a"), "offer-1");
		let Frame::Accept(accept) = Frame::classify(&el) else {
			panic!("expected accept");
		};
		assert!(accept.selects_ibb());
	}

	#[test]
	fn test_classify_ibb_frames() {
		let to = jid("bob@example.org/pc");
		let open = stanza::ibb_open(&to, "o1", "s1", 2048, Carrier::Message);
		assert!(matches!(
			Frame::classify(&open),
			Frame::Open(IbbOpen { block_size: Some(2048), stanza: Carrier::Message, .. })
		));

		let data = stanza::ibb_data_message(&to, "d1", "s1", 3, "QUJD");
		let Frame::Data(d) = Frame::classify(&data) else {
			panic!("expected data");
		};
		assert_eq!((d.seq, d.payload.as_str(), d.carrier), (Some(3), "QUJD", Carrier::Message));

		let data = stanza::ibb_data_iq(&to, "d2", "s1", 4, "REVG");
		assert!(matches!(Frame::classify(&data), Frame::Data(IbbData { carrier: Carrier::Iq, .. })));

		let close = stanza::ibb_close(&to, "c1", "s1");
		assert!(matches!(Frame::classify(&close), Frame::Close(IbbClose { ref sid, .. }) if sid == "s1"));
	}

	#[test]
	fn test_open_without_stanza_attribute_defaults_to_iq() {
		let el = Element::parse(
			r#"<iq xmlns="jabber:client" type="set" id="x"><open xmlns="http://jabber.org/protocol/ibb" sid="s" block-size="4096"/></iq>"#,
		)
		.unwrap();
		assert!(matches!(Frame::classify(&el), Frame::Open(IbbOpen { stanza: Carrier::Iq, .. })));
	}

	#[test]
	fn test_frames_missing_sid_are_other() {
		let el = Element::parse(r#"<message xmlns="jabber:client"><data xmlns="http://jabber.org/protocol/ibb" seq="0">QQ==</data></message>"#)
			.unwrap();
		assert_eq!(Frame::classify(&el), Frame::Other);
	}

	#[test]
	fn test_classify_presence_priority() {
		let el = Element::parse(
			r#"<presence xmlns="jabber:client" from="user@domain/r1"><priority>5</priority><show>chat</show></presence>"#,
		)
		.unwrap();
		let Frame::Presence(p) = Frame::classify(&el) else {
			panic!("expected presence");
		};
		assert_eq!(p.priority, 5);
		assert!(p.is_available());
		assert_eq!(p.show.as_deref(), Some("chat"));

		let el = Element::parse(r#"<presence xmlns="jabber:client" type="unavailable"><priority>oops</priority></presence>"#).unwrap();
		let Frame::Presence(p) = Frame::classify(&el) else {
			panic!("expected presence");
		};
		assert_eq!(p.priority, 0);
		assert!(p.is_unavailable());
	}

	#[test]
	fn test_classify_chat_and_error_reply() {
		let el = stanza::chat_message(&jid("bob@example.org"), "m1", "hello");
		assert!(matches!(Frame::classify(&el), Frame::Chat(ChatMessage { ref body, .. }) if body == "hello"));

		let el = Element::parse(
			r#"<iq xmlns="jabber:client" type="error" id="q1"><error type="cancel"><service-unavailable xmlns="urn:ietf:params:xml:ns:xmpp-stanzas"/></error></iq>"#,
		)
		.unwrap();
		let Frame::Reply(reply) = Frame::classify(&el) else {
			panic!("expected reply");
		};
		assert_eq!(reply.kind, IqKind::Error);
		assert_eq!(reply.error.unwrap().condition, "service-unavailable");
	}

	#[test]
	fn test_foreign_namespace_is_other() {
		let el = Element::parse(r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" version="1.0"/>"#).unwrap();
		assert_eq!(Frame::classify(&el), Frame::Other);
	}
}
