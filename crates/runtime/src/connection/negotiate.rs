//! Stream negotiation.
//!
//! Runs before the dispatch loop starts, reading frames directly from the
//! transport: open the stream, authenticate, restart the stream, bind a
//! resource and, when the server still requires it, establish a legacy
//! session.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc;
use xft_protocol::{Element, Jid, ns, stanza};

use super::sasl::{self, SaslClient};
use crate::error::{Error, Result};
use crate::transport::TransportSender;

/// Credentials and addressing for one negotiation.
#[derive(Debug, Clone)]
pub struct StreamParams {
	pub domain: String,
	pub username: String,
	pub password: String,
	pub resource: Option<String>,
}

/// Negotiates the stream and returns the bound full address.
pub async fn negotiate(
	sender: &mut dyn TransportSender,
	frames: &mut mpsc::UnboundedReceiver<String>,
	params: &StreamParams,
) -> Result<Jid> {
	let features = open_stream(sender, frames, &params.domain).await?;
	authenticate(sender, frames, &features, params).await?;

	let features = open_stream(sender, frames, &params.domain).await?;
	if !features.has_child("bind", ns::BIND) {
		return Err(Error::ConnectionFailed("server does not offer resource binding".to_string()));
	}

	let reply = exchange(sender, frames, stanza::bind("bind-1", params.resource.as_deref())).await?;
	let jid = reply
		.get_child("bind", ns::BIND)
		.and_then(|bind| bind.child_text("jid", ns::BIND))
		.ok_or_else(|| Error::ProtocolError("bind result without jid".to_string()))?;
	let jid = Jid::parse(&jid)?;

	if let Some(session) = features.get_child("session", ns::SESSION) {
		if !session.has_child("optional", ns::SESSION) {
			exchange(sender, frames, stanza::session("session-1")).await?;
		}
	}

	tracing::debug!(jid = %jid, "stream negotiated");
	Ok(jid)
}

async fn open_stream(
	sender: &mut dyn TransportSender,
	frames: &mut mpsc::UnboundedReceiver<String>,
	domain: &str,
) -> Result<Element> {
	sender.send(stanza::stream_open(domain).to_xml()).await?;

	loop {
		let el = next_element(frames).await?;
		if el.is("open", ns::FRAMING) {
			continue;
		}
		if el.is("features", ns::STREAMS) {
			return Ok(el);
		}
		return Err(unexpected(&el));
	}
}

async fn authenticate(
	sender: &mut dyn TransportSender,
	frames: &mut mpsc::UnboundedReceiver<String>,
	features: &Element,
	params: &StreamParams,
) -> Result<()> {
	let offered: Vec<String> = features
		.get_child("mechanisms", ns::SASL)
		.map(|m| m.children().filter(|c| c.name() == "mechanism").map(|c| c.text().trim().to_string()).collect())
		.unwrap_or_default();

	let mechanism = sasl::select(&offered).ok_or_else(|| {
		Error::AuthenticationFailed(format!("no supported mechanism in [{}]", offered.join(", ")))
	})?;
	tracing::debug!(mechanism, "authenticating");

	let mut client = SaslClient::new(mechanism, &params.username, &params.password)?;
	let initial = client.initial();
	sender.send(stanza::sasl_auth(client.mechanism(), Some(&initial)).to_xml()).await?;

	loop {
		let el = next_element(frames).await?;
		if el.ns() != ns::SASL {
			return Err(unexpected(&el));
		}
		match el.name() {
			"challenge" => {
				let challenge = decode_sasl(&el)?;
				let response = client.respond(&challenge)?;
				sender.send(stanza::sasl_response(&response).to_xml()).await?;
			}
			"success" => {
				client.finish(&decode_sasl(&el)?)?;
				return Ok(());
			}
			"failure" => {
				let condition = el
					.children()
					.find(|c| c.name() != "text")
					.map(|c| c.name().to_string())
					.unwrap_or_else(|| "not-authorized".to_string());
				return Err(Error::AuthenticationFailed(condition));
			}
			_ => return Err(unexpected(&el)),
		}
	}
}

/// Sends a request and reads frames until its reply arrives.
async fn exchange(
	sender: &mut dyn TransportSender,
	frames: &mut mpsc::UnboundedReceiver<String>,
	request: Element,
) -> Result<Element> {
	let id = request.attr("id").unwrap_or_default().to_string();
	sender.send(request.to_xml()).await?;

	loop {
		let el = next_element(frames).await?;
		if el.name() != "iq" || el.attr("id") != Some(id.as_str()) {
			tracing::debug!(frame = %el, "ignoring frame during negotiation");
			continue;
		}
		return match el.attr("type") {
			Some("result") => Ok(el),
			_ => Err(Error::ConnectionFailed(format!(
				"'{id}' rejected: {}",
				xft_protocol::StanzaError::of(&el).condition
			))),
		};
	}
}

async fn next_element(frames: &mut mpsc::UnboundedReceiver<String>) -> Result<Element> {
	let text = frames
		.recv()
		.await
		.ok_or_else(|| Error::ConnectionFailed("stream closed during negotiation".to_string()))?;
	let el = Element::parse(&text)?;

	if el.is("close", ns::FRAMING) {
		return Err(Error::ConnectionFailed("server closed the stream".to_string()));
	}
	if el.is("error", ns::STREAMS) {
		let condition = el.children().next().map(|c| c.name().to_string()).unwrap_or_default();
		return Err(Error::ConnectionFailed(format!("stream error: {condition}")));
	}
	Ok(el)
}

fn decode_sasl(el: &Element) -> Result<Vec<u8>> {
	let text = el.text();
	let text = text.trim();
	if text.is_empty() || text == "=" {
		return Ok(Vec::new());
	}
	STANDARD
		.decode(text)
		.map_err(|e| Error::AuthenticationFailed(format!("invalid base64 in <{}>: {e}", el.name())))
}

fn unexpected(el: &Element) -> Error {
	Error::ProtocolError(format!("unexpected <{}> in namespace '{}'", el.name(), el.ns()))
}
