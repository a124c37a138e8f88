//! Builders for outbound frames.
//!
//! Every stanza is created in the `jabber:client` namespace; payload
//! elements carry their own namespace so serialization declares it.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::frame::Carrier;
use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

/// Default IBB block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

/// MIME type declared on every outgoing offer.
pub const OFFER_MIME_TYPE: &str = "application/octet-stream";

fn iq(kind: &str, id: &str) -> crate::xml::ElementBuilder {
	Element::builder("iq", ns::CLIENT).attr("type", kind).attr("id", id)
}

fn iq_to(kind: &str, to: &Jid, id: &str) -> crate::xml::ElementBuilder {
	iq(kind, id).attr("to", to)
}

/// Available presence with `show=chat`, `status=Online` and a priority.
pub fn presence(priority: i8) -> Element {
	Element::builder("presence", ns::CLIENT)
		.append(Element::builder("show", ns::CLIENT).text("chat").build())
		.append(Element::builder("status", ns::CLIENT).text("Online").build())
		.append(Element::builder("priority", ns::CLIENT).text(priority.to_string()).build())
		.build()
}

pub fn presence_probe(to: &Jid) -> Element {
	Element::builder("presence", ns::CLIENT)
		.attr("type", "probe")
		.attr("to", to)
		.build()
}

pub fn unavailable_presence() -> Element {
	Element::builder("presence", ns::CLIENT).attr("type", "unavailable").build()
}

/// Liveness probe. `to = None` addresses the server.
pub fn ping(to: Option<&Jid>, id: &str) -> Element {
	iq("get", id)
		.attr_opt("to", to)
		.append(Element::new("ping", ns::PING))
		.build()
}

/// Empty result acknowledging request `id`.
pub fn iq_result(to: Option<&Jid>, id: &str) -> Element {
	iq("result", id).attr_opt("to", to).build()
}

pub fn iq_error(to: Option<&Jid>, id: &str, kind: &str, condition: &str) -> Element {
	iq("error", id)
		.attr_opt("to", to)
		.append(
			Element::builder("error", ns::CLIENT)
				.attr("type", kind)
				.append(Element::new(condition, ns::STANZAS))
				.build(),
		)
		.build()
}

pub fn disco_info(to: &Jid, id: &str) -> Element {
	iq_to("get", to, id).append(Element::new("query", ns::DISCO_INFO)).build()
}

pub fn disco_items(to: &Jid, id: &str) -> Element {
	iq_to("get", to, id).append(Element::new("query", ns::DISCO_ITEMS)).build()
}

/// Stream-initiation offer for `file_name` of `size` bytes, IBB only.
pub fn si_offer(to: &Jid, id: &str, sid: &str, file_name: &str, size: u64) -> Element {
	let option = Element::builder("option", ns::DATA_FORMS)
		.append(Element::builder("value", ns::DATA_FORMS).text(ns::IBB).build())
		.build();
	let form = Element::builder("x", ns::DATA_FORMS)
		.attr("type", "form")
		.append(
			Element::builder("field", ns::DATA_FORMS)
				.attr("var", "stream-method")
				.attr("type", "list-single")
				.append(option)
				.build(),
		)
		.build();

	iq_to("set", to, id)
		.append(
			Element::builder("si", ns::SI)
				.attr("id", sid)
				.attr("mime-type", OFFER_MIME_TYPE)
				.attr("profile", ns::SI_FILE_TRANSFER)
				.append(
					Element::builder("file", ns::SI_FILE_TRANSFER)
						.attr("name", file_name)
						.attr("size", size)
						.build(),
				)
				.append(Element::builder("feature", ns::FEATURE_NEG).append(form).build())
				.build(),
		)
		.build()
}

/// Accept for offer `id`, selecting IBB.
pub fn si_accept(to: &Jid, id: &str) -> Element {
	let form = Element::builder("x", ns::DATA_FORMS)
		.attr("type", "submit")
		.append(
			Element::builder("field", ns::DATA_FORMS)
				.attr("var", "stream-method")
				.append(Element::builder("value", ns::DATA_FORMS).text(ns::IBB).build())
				.build(),
		)
		.build();

	iq_to("result", to, id)
		.append(
			Element::builder("si", ns::SI)
				.append(Element::builder("feature", ns::FEATURE_NEG).append(form).build())
				.build(),
		)
		.build()
}

pub fn ibb_open(to: &Jid, id: &str, sid: &str, block_size: u32, stanza: Carrier) -> Element {
	iq_to("set", to, id)
		.append(
			Element::builder("open", ns::IBB)
				.attr("sid", sid)
				.attr("block-size", block_size)
				.attr("stanza", stanza.as_str())
				.build(),
		)
		.build()
}

fn ibb_data(sid: &str, seq: u16, payload: &str) -> Element {
	Element::builder("data", ns::IBB)
		.attr("sid", sid)
		.attr("seq", seq)
		.text(payload)
		.build()
}

/// Data block carried by a message stanza. No acknowledgement is expected.
pub fn ibb_data_message(to: &Jid, id: &str, sid: &str, seq: u16, payload: &str) -> Element {
	Element::builder("message", ns::CLIENT)
		.attr("to", to)
		.attr("id", id)
		.append(ibb_data(sid, seq, payload))
		.build()
}

/// Data block carried by a set request, acknowledged by the peer.
pub fn ibb_data_iq(to: &Jid, id: &str, sid: &str, seq: u16, payload: &str) -> Element {
	iq_to("set", to, id).append(ibb_data(sid, seq, payload)).build()
}

pub fn ibb_close(to: &Jid, id: &str, sid: &str) -> Element {
	iq_to("set", to, id)
		.append(Element::builder("close", ns::IBB).attr("sid", sid).build())
		.build()
}

pub fn chat_message(to: &Jid, id: &str, body: &str) -> Element {
	Element::builder("message", ns::CLIENT)
		.attr("type", "chat")
		.attr("to", to)
		.attr("id", id)
		.append(Element::builder("body", ns::CLIENT).text(body).build())
		.build()
}

/// WebSocket framing open (RFC 7395).
pub fn stream_open(domain: &str) -> Element {
	Element::builder("open", ns::FRAMING)
		.attr("to", domain)
		.attr("version", "1.0")
		.build()
}

pub fn stream_close() -> Element {
	Element::new("close", ns::FRAMING)
}

/// SASL `auth`. An empty initial response is written as `=`.
pub fn sasl_auth(mechanism: &str, initial: Option<&[u8]>) -> Element {
	let builder = Element::builder("auth", ns::SASL).attr("mechanism", mechanism);
	match initial {
		Some(bytes) if bytes.is_empty() => builder.text("=").build(),
		Some(bytes) => builder.text(STANDARD.encode(bytes)).build(),
		None => builder.build(),
	}
}

pub fn sasl_response(data: &[u8]) -> Element {
	Element::builder("response", ns::SASL).text(STANDARD.encode(data)).build()
}

/// Resource binding request. `resource = None` lets the server pick one.
pub fn bind(id: &str, resource: Option<&str>) -> Element {
	let mut bind = Element::builder("bind", ns::BIND);
	if let Some(resource) = resource {
		bind = bind.append(Element::builder("resource", ns::BIND).text(resource).build());
	}
	iq("set", id).append(bind.build()).build()
}

pub fn session(id: &str) -> Element {
	iq("set", id).append(Element::new("session", ns::SESSION)).build()
}

/// Splits `bytes` into `block_size` slices and base64-encodes each one.
///
/// The last block may be shorter. Empty input yields no blocks.
pub fn encode_blocks(bytes: &[u8], block_size: usize) -> Vec<String> {
	let block_size = block_size.max(1);
	bytes.chunks(block_size).map(|chunk| STANDARD.encode(chunk)).collect()
}
