//! Bare and full addresses (`node@domain/resource`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
	#[error("address is empty")]
	Empty,
	#[error("address '{0}' has an empty domain")]
	EmptyDomain(String),
	#[error("address '{0}' has an empty local part")]
	EmptyNode(String),
	#[error("address '{0}' has an empty resource")]
	EmptyResource(String),
}

/// Address of an endpoint, optionally qualified with a resource.
///
/// Local part and domain compare case-insensitively (both are stored
/// lowercased); the resource is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
	node: Option<String>,
	domain: String,
	resource: Option<String>,
}

impl Jid {
	pub fn parse(input: &str) -> Result<Self, JidError> {
		let input = input.trim();
		if input.is_empty() {
			return Err(JidError::Empty);
		}

		let (addr, resource) = match input.split_once('/') {
			Some((_, resource)) if resource.is_empty() => return Err(JidError::EmptyResource(input.to_string())),
			Some((addr, resource)) => (addr, Some(resource.to_string())),
			None => (input, None),
		};

		let (node, domain) = match addr.rsplit_once('@') {
			Some((node, _)) if node.is_empty() => return Err(JidError::EmptyNode(input.to_string())),
			Some((node, domain)) => (Some(node.to_lowercase()), domain),
			None => (None, addr),
		};

		if domain.is_empty() {
			return Err(JidError::EmptyDomain(input.to_string()));
		}

		Ok(Self {
			node,
			domain: domain.to_lowercase(),
			resource,
		})
	}

	/// Domain-only address, used for server-directed frames.
	pub fn domain_only(domain: &str) -> Result<Self, JidError> {
		Self::parse(domain).map(|jid| Self {
			node: None,
			domain: jid.domain,
			resource: None,
		})
	}

	pub fn node(&self) -> Option<&str> {
		self.node.as_deref()
	}

	pub fn domain(&self) -> &str {
		&self.domain
	}

	pub fn resource(&self) -> Option<&str> {
		self.resource.as_deref()
	}

	/// Returns the address without its resource.
	pub fn bare(&self) -> Jid {
		Jid {
			node: self.node.clone(),
			domain: self.domain.clone(),
			resource: None,
		}
	}

	pub fn with_resource(&self, resource: impl Into<String>) -> Jid {
		Jid {
			node: self.node.clone(),
			domain: self.domain.clone(),
			resource: Some(resource.into()),
		}
	}

	/// `true` when a resource qualifier is present.
	pub fn is_full(&self) -> bool {
		self.resource.is_some()
	}

	pub fn is_bare(&self) -> bool {
		self.resource.is_none()
	}

	/// `true` when both addresses have the same local part and domain.
	pub fn shares_bare(&self, other: &Jid) -> bool {
		self.node == other.node && self.domain == other.domain
	}
}

impl fmt::Display for Jid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if let Some(node) = &self.node {
			write!(f, "{node}@")?;
		}
		f.write_str(&self.domain)?;
		if let Some(resource) = &self.resource {
			write!(f, "/{resource}")?;
		}
		Ok(())
	}
}

impl FromStr for Jid {
	type Err = JidError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl Serialize for Jid {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for Jid {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Jid::parse(&s).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_full_address() {
		let jid = Jid::parse("User@Example.org/Phone 1").unwrap();
		assert_eq!(jid.node(), Some("user"));
		assert_eq!(jid.domain(), "example.org");
		assert_eq!(jid.resource(), Some("Phone 1"));
		assert!(jid.is_full());
		assert_eq!(jid.to_string(), "user@example.org/Phone 1");
	}

	#[test]
	fn test_resource_may_contain_slashes_and_at() {
		let jid = Jid::parse("a@b/c/d@e").unwrap();
		assert_eq!(jid.node(), Some("a"));
		assert_eq!(jid.domain(), "b");
		assert_eq!(jid.resource(), Some("c/d@e"));
	}

	#[test]
	fn test_bare_and_shares_bare() {
		let r1 = Jid::parse("user@domain/r1").unwrap();
		let r2 = Jid::parse("user@domain/r2").unwrap();
		let other = Jid::parse("other@domain/r1").unwrap();

		assert_eq!(r1.bare(), Jid::parse("user@domain").unwrap());
		assert!(r1.shares_bare(&r2));
		assert!(r1.shares_bare(&r1.bare()));
		assert!(!r1.shares_bare(&other));
		assert!(r1.bare().is_bare());
	}

	#[test]
	fn test_domain_only() {
		let jid = Jid::parse("example.org").unwrap();
		assert_eq!(jid.node(), None);
		assert_eq!(Jid::domain_only("example.org").unwrap(), jid);
	}

	#[test]
	fn test_parse_errors() {
		assert_eq!(Jid::parse(""), Err(JidError::Empty));
		assert!(matches!(Jid::parse("@domain"), Err(JidError::EmptyNode(_))));
		assert!(matches!(Jid::parse("user@"), Err(JidError::EmptyDomain(_))));
		assert!(matches!(Jid::parse("user@domain/"), Err(JidError::EmptyResource(_))));
	}
}
