//! Namespace-aware XML element tree.
//!
//! Every frame on an XMPP-over-WebSocket stream is one complete XML element,
//! so the tree is parsed from a whole string at once with [`quick_xml`] and
//! serialized back without any streaming state.
//!
//! Namespaces are resolved at parse time: each element stores the namespace
//! URI it lives in, inherited from its parent unless redeclared. Prefixed
//! element names (`stream:features`) are resolved through `xmlns:prefix`
//! declarations. Serialization only ever writes default-namespace
//! declarations, emitting `xmlns` when an element's namespace differs from
//! its parent's.

use std::fmt;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

/// Errors produced while parsing a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
	#[error("malformed XML: {0}")]
	Malformed(String),

	#[error("unbound namespace prefix '{0}'")]
	UnboundPrefix(String),

	#[error("document contains no root element")]
	Empty,

	#[error("unexpected content after the root element")]
	TrailingContent,

	#[error("element <{0}> is never closed")]
	Unclosed(String),
}

/// Child node of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
	Element(Element),
	Text(String),
}

/// XML element with a resolved namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
	name: String,
	ns: String,
	attrs: Vec<(String, String)>,
	children: Vec<Node>,
}

impl Element {
	/// Creates an empty element in namespace `ns`.
	pub fn new(name: impl Into<String>, ns: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			ns: ns.into(),
			attrs: Vec::new(),
			children: Vec::new(),
		}
	}

	/// Starts a builder for an element in namespace `ns`.
	pub fn builder(name: impl Into<String>, ns: impl Into<String>) -> ElementBuilder {
		ElementBuilder {
			element: Self::new(name, ns),
		}
	}

	/// Parses one complete XML document into its root element.
	pub fn parse(input: &str) -> Result<Self, ParseError> {
		let mut reader = Reader::from_str(input);
		let mut stack: Vec<OpenElement> = Vec::new();
		let mut root: Option<Element> = None;

		loop {
			let event = reader.read_event().map_err(|e| ParseError::Malformed(e.to_string()))?;
			match event {
				Event::Start(start) => {
					let open = open_element(&start, &stack)?;
					if root.is_some() {
						return Err(ParseError::TrailingContent);
					}
					stack.push(open);
				}
				Event::Empty(start) => {
					let open = open_element(&start, &stack)?;
					close_element(&mut stack, &mut root, open.element)?;
				}
				Event::End(_) => {
					let open = stack
						.pop()
						.ok_or_else(|| ParseError::Malformed("unbalanced end tag".to_string()))?;
					close_element(&mut stack, &mut root, open.element)?;
				}
				Event::Text(text) => {
					let text = text.unescape().map_err(|e| ParseError::Malformed(e.to_string()))?;
					push_text(&mut stack, &root, &text)?;
				}
				Event::CData(data) => {
					let text = String::from_utf8_lossy(&data).into_owned();
					push_text(&mut stack, &root, &text)?;
				}
				Event::Eof => break,
				_ => {}
			}
		}

		if let Some(open) = stack.pop() {
			return Err(ParseError::Unclosed(open.element.name));
		}
		root.ok_or(ParseError::Empty)
	}

	/// Local element name (no prefix).
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Namespace URI the element lives in.
	pub fn ns(&self) -> &str {
		&self.ns
	}

	/// Returns `true` if the element has the given local name and namespace.
	pub fn is(&self, name: &str, ns: &str) -> bool {
		self.name == name && self.ns == ns
	}

	pub fn attr(&self, name: &str) -> Option<&str> {
		self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
	}

	/// Sets or replaces an attribute.
	pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
		let name = name.into();
		let value = value.into();
		match self.attrs.iter_mut().find(|(k, _)| *k == name) {
			Some(slot) => slot.1 = value,
			None => self.attrs.push((name, value)),
		}
	}

	pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
		self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	pub fn nodes(&self) -> &[Node] {
		&self.children
	}

	/// Iterates over child elements, skipping text.
	pub fn children(&self) -> impl Iterator<Item = &Element> {
		self.children.iter().filter_map(|node| match node {
			Node::Element(el) => Some(el),
			Node::Text(_) => None,
		})
	}

	/// First child element matching name and namespace.
	pub fn get_child(&self, name: &str, ns: &str) -> Option<&Element> {
		self.children().find(|child| child.is(name, ns))
	}

	pub fn has_child(&self, name: &str, ns: &str) -> bool {
		self.get_child(name, ns).is_some()
	}

	/// Text of the first matching child, if present.
	pub fn child_text(&self, name: &str, ns: &str) -> Option<String> {
		self.get_child(name, ns).map(Element::text)
	}

	/// Concatenated direct text content.
	pub fn text(&self) -> String {
		self.children
			.iter()
			.filter_map(|node| match node {
				Node::Text(text) => Some(text.as_str()),
				Node::Element(_) => None,
			})
			.collect()
	}

	pub fn append_child(&mut self, child: Element) {
		self.children.push(Node::Element(child));
	}

	pub fn append_text(&mut self, text: impl Into<String>) {
		let text = text.into();
		if let Some(Node::Text(last)) = self.children.last_mut() {
			last.push_str(&text);
		} else {
			self.children.push(Node::Text(text));
		}
	}

	/// Serializes the element as a standalone XML fragment.
	pub fn to_xml(&self) -> String {
		let mut out = String::new();
		self.write_into(&mut out, None);
		out
	}

	fn write_into(&self, out: &mut String, parent_ns: Option<&str>) {
		out.push('<');
		out.push_str(&self.name);

		let needs_decl = match parent_ns {
			Some(parent) => parent != self.ns,
			None => !self.ns.is_empty(),
		};
		if needs_decl {
			out.push_str(" xmlns=\"");
			out.push_str(&escape(self.ns.as_str()));
			out.push('"');
		}

		for (key, value) in &self.attrs {
			out.push(' ');
			out.push_str(key);
			out.push_str("=\"");
			out.push_str(&escape(value.as_str()));
			out.push('"');
		}

		if self.children.is_empty() {
			out.push_str("/>");
			return;
		}

		out.push('>');
		for node in &self.children {
			match node {
				Node::Element(child) => child.write_into(out, Some(&self.ns)),
				Node::Text(text) => out.push_str(&escape(text.as_str())),
			}
		}
		out.push_str("</");
		out.push_str(&self.name);
		out.push('>');
	}
}

impl fmt::Display for Element {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_xml())
	}
}

/// Builder returned by [`Element::builder`].
#[derive(Debug, Clone)]
pub struct ElementBuilder {
	element: Element,
}

impl ElementBuilder {
	pub fn attr(mut self, name: impl Into<String>, value: impl ToString) -> Self {
		self.element.set_attr(name, value.to_string());
		self
	}

	/// Sets an attribute only when `value` is present.
	pub fn attr_opt(self, name: impl Into<String>, value: Option<impl ToString>) -> Self {
		match value {
			Some(value) => self.attr(name, value),
			None => self,
		}
	}

	pub fn append(mut self, child: Element) -> Self {
		self.element.append_child(child);
		self
	}

	pub fn append_all(mut self, children: impl IntoIterator<Item = Element>) -> Self {
		for child in children {
			self.element.append_child(child);
		}
		self
	}

	pub fn text(mut self, text: impl Into<String>) -> Self {
		self.element.append_text(text);
		self
	}

	pub fn build(self) -> Element {
		self.element
	}
}

impl From<ElementBuilder> for Element {
	fn from(builder: ElementBuilder) -> Self {
		builder.build()
	}
}

/// Element under construction plus the namespace declarations it carries.
struct OpenElement {
	element: Element,
	decls: Vec<(String, String)>,
}

fn open_element(start: &BytesStart<'_>, stack: &[OpenElement]) -> Result<OpenElement, ParseError> {
	let mut decls = Vec::new();
	let mut attrs = Vec::new();

	for attr in start.attributes() {
		let attr = attr.map_err(|e| ParseError::Malformed(e.to_string()))?;
		let key = std::str::from_utf8(attr.key.as_ref())
			.map_err(|e| ParseError::Malformed(e.to_string()))?
			.to_string();
		let value = attr
			.unescape_value()
			.map_err(|e| ParseError::Malformed(e.to_string()))?
			.into_owned();

		if key == "xmlns" {
			decls.push((String::new(), value));
		} else if let Some(prefix) = key.strip_prefix("xmlns:") {
			decls.push((prefix.to_string(), value));
		} else {
			attrs.push((key, value));
		}
	}

	let qname = start.name();
	let qname = std::str::from_utf8(qname.as_ref()).map_err(|e| ParseError::Malformed(e.to_string()))?;
	let (prefix, local) = qname.split_once(':').unwrap_or(("", qname));

	let ns = match resolve_prefix(prefix, &decls, stack) {
		Some(ns) => ns,
		None if prefix.is_empty() => String::new(),
		None => return Err(ParseError::UnboundPrefix(prefix.to_string())),
	};

	let mut element = Element::new(local, ns);
	element.attrs = attrs;
	Ok(OpenElement { element, decls })
}

fn resolve_prefix(prefix: &str, decls: &[(String, String)], stack: &[OpenElement]) -> Option<String> {
	let scopes = std::iter::once(decls).chain(stack.iter().rev().map(|open| open.decls.as_slice()));
	for scope in scopes {
		if let Some((_, uri)) = scope.iter().find(|(p, _)| p == prefix) {
			return Some(uri.clone());
		}
	}
	None
}

fn close_element(stack: &mut [OpenElement], root: &mut Option<Element>, element: Element) -> Result<(), ParseError> {
	match stack.last_mut() {
		Some(parent) => {
			parent.element.append_child(element);
			Ok(())
		}
		None if root.is_none() => {
			*root = Some(element);
			Ok(())
		}
		None => Err(ParseError::TrailingContent),
	}
}

fn push_text(stack: &mut [OpenElement], root: &Option<Element>, text: &str) -> Result<(), ParseError> {
	match stack.last_mut() {
		Some(parent) => {
			if !text.is_empty() {
				parent.element.append_text(text);
			}
			Ok(())
		}
		None if text.trim().is_empty() => Ok(()),
		None if root.is_some() => Err(ParseError::TrailingContent),
		None => Err(ParseError::Malformed("text outside of the root element".to_string())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_inherits_default_namespace() {
		let el = Element::parse(r#"<iq xmlns="jabber:client" type="get" id="p1"><ping xmlns="urn:xmpp:ping"/><x/></iq>"#)
			.unwrap();

		assert!(el.is("iq", "jabber:client"));
		assert_eq!(el.attr("type"), Some("get"));
		assert!(el.has_child("ping", "urn:xmpp:ping"));
		assert!(el.has_child("x", "jabber:client"));
	}

	#[test]
	fn test_parse_resolves_prefixed_names() {
		let el = Element::parse(
			r#"<stream:features xmlns:stream="http://etherx.jabber.org/streams"><mechanisms xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><mechanism>PLAIN</mechanism></mechanisms></stream:features>"#,
		)
		.unwrap();

		assert!(el.is("features", "http://etherx.jabber.org/streams"));
		let mechanisms = el.get_child("mechanisms", "urn:ietf:params:xml:ns:xmpp-sasl").unwrap();
		assert_eq!(
			mechanisms.child_text("mechanism", "urn:ietf:params:xml:ns:xmpp-sasl").as_deref(),
			Some("PLAIN")
		);
	}

	#[test]
	fn test_parse_unescapes_text_and_attributes() {
		let el = Element::parse(r#"<body a="x &amp; y">1 &lt; 2</body>"#).unwrap();
		assert_eq!(el.attr("a"), Some("x & y"));
		assert_eq!(el.text(), "1 < 2");
	}

	#[test]
	fn test_parse_rejects_unbound_prefix() {
		let err = Element::parse("<foo:bar/>").unwrap_err();
		assert_eq!(err, ParseError::UnboundPrefix("foo".to_string()));
	}

	#[test]
	fn test_parse_rejects_unclosed_and_trailing() {
		assert!(Element::parse("<a><b></b>").is_err());
		assert!(matches!(Element::parse("<a/><b/>"), Err(ParseError::TrailingContent)));
		assert!(matches!(Element::parse("   "), Err(ParseError::Empty)));
		assert!(Element::parse("<a></b>").is_err());
	}

	#[test]
	fn test_serialize_emits_namespace_only_on_change() {
		let el = Element::builder("message", "jabber:client")
			.attr("to", "a@b/c")
			.append(Element::builder("body", "jabber:client").text("hi <there>").build())
			.append(Element::builder("data", "http://jabber.org/protocol/ibb").attr("sid", "s1").build())
			.build();

		assert_eq!(
			el.to_xml(),
			r#"<message xmlns="jabber:client" to="a@b/c"><body>hi &lt;there&gt;</body><data xmlns="http://jabber.org/protocol/ibb" sid="s1"/></message>"#
		);
	}

	#[test]
	fn test_serialized_frame_parses_back_identically() {
		let el = Element::builder("iq", "jabber:client")
			.attr("type", "set")
			.attr("id", "o-1")
			.append(
				Element::builder("si", "http://jabber.org/protocol/si")
					.attr("id", "sid-1")
					.append(Element::builder("file", "http://jabber.org/protocol/si/profile/file-transfer").attr("name", "a \"b\".pdf").build())
					.build(),
			)
			.build();

		assert_eq!(Element::parse(&el.to_xml()).unwrap(), el);
	}

	#[test]
	fn test_append_text_merges_adjacent_runs() {
		let mut el = Element::new("data", "x");
		el.append_text("QUJD");
		el.append_text("REVG");
		assert_eq!(el.nodes().len(), 1);
		assert_eq!(el.text(), "QUJDREVG");
	}
}
