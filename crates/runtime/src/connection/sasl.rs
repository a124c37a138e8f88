//! SASL client mechanisms: SCRAM-SHA-1 (RFC 5802) and PLAIN (RFC 4616).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// Highest SCRAM iteration count a server may demand. Deployments use a few
/// thousand; anything far above only burns client CPU.
pub const MAX_SCRAM_ITERATIONS: u32 = 100_000;

/// Mechanisms in order of preference.
pub const SUPPORTED: &[&str] = &["SCRAM-SHA-1", "PLAIN"];

/// Picks the most preferred mechanism the server offers.
pub fn select(offered: &[String]) -> Option<&'static str> {
	SUPPORTED
		.iter()
		.copied()
		.find(|m| offered.iter().any(|o| o.eq_ignore_ascii_case(m)))
}

/// Client side of one SASL exchange.
pub enum SaslClient {
	Plain { username: String, password: String },
	ScramSha1(ScramSha1),
}

impl SaslClient {
	pub fn new(mechanism: &str, username: &str, password: &str) -> Result<Self> {
		match mechanism {
			"PLAIN" => Ok(Self::Plain {
				username: username.to_string(),
				password: password.to_string(),
			}),
			"SCRAM-SHA-1" => Ok(Self::ScramSha1(ScramSha1::new(
				username,
				password,
				&uuid::Uuid::new_v4().simple().to_string(),
			))),
			other => Err(Error::AuthenticationFailed(format!("unsupported mechanism {other}"))),
		}
	}

	pub fn mechanism(&self) -> &'static str {
		match self {
			Self::Plain { .. } => "PLAIN",
			Self::ScramSha1(_) => "SCRAM-SHA-1",
		}
	}

	/// Initial response sent with `auth`.
	pub fn initial(&mut self) -> Vec<u8> {
		match self {
			Self::Plain { username, password } => format!("\0{username}\0{password}").into_bytes(),
			Self::ScramSha1(scram) => scram.client_first().into_bytes(),
		}
	}

	/// Answers a server challenge.
	pub fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
		match self {
			Self::Plain { .. } => Err(Error::AuthenticationFailed("unexpected challenge for PLAIN".to_string())),
			Self::ScramSha1(scram) => scram.client_final(challenge).map(String::into_bytes),
		}
	}

	/// Checks additional data carried by `success`.
	pub fn finish(&self, data: &[u8]) -> Result<()> {
		match self {
			Self::Plain { .. } => Ok(()),
			Self::ScramSha1(scram) => scram.verify_server(data),
		}
	}
}

/// SCRAM-SHA-1 state without channel binding (`n,,`).
pub struct ScramSha1 {
	username: String,
	password: String,
	client_nonce: String,
	client_first_bare: String,
	server_signature: Option<Vec<u8>>,
}

impl ScramSha1 {
	pub fn new(username: &str, password: &str, client_nonce: &str) -> Self {
		Self {
			username: username.to_string(),
			password: password.to_string(),
			client_nonce: client_nonce.to_string(),
			client_first_bare: String::new(),
			server_signature: None,
		}
	}

	pub fn client_first(&mut self) -> String {
		self.client_first_bare = format!("n={},r={}", escape_name(&self.username), self.client_nonce);
		format!("n,,{}", self.client_first_bare)
	}

	pub fn client_final(&mut self, server_first: &[u8]) -> Result<String> {
		let server_first = std::str::from_utf8(server_first)
			.map_err(|_| Error::AuthenticationFailed("challenge is not UTF-8".to_string()))?;

		let mut nonce = None;
		let mut salt = None;
		let mut iterations = None;
		for part in server_first.split(',') {
			match part.split_once('=') {
				Some(("r", v)) => nonce = Some(v),
				Some(("s", v)) => salt = Some(v),
				Some(("i", v)) => iterations = v.parse::<u32>().ok(),
				_ => {}
			}
		}

		let (Some(nonce), Some(salt), Some(iterations)) = (nonce, salt, iterations) else {
			return Err(Error::AuthenticationFailed(format!("malformed challenge '{server_first}'")));
		};
		if !nonce.starts_with(&self.client_nonce) {
			return Err(Error::AuthenticationFailed("server nonce does not extend client nonce".to_string()));
		}
		if iterations == 0 || iterations > MAX_SCRAM_ITERATIONS {
			return Err(Error::AuthenticationFailed(format!(
				"iteration count {iterations} outside 1..={MAX_SCRAM_ITERATIONS}"
			)));
		}
		let salt = STANDARD
			.decode(salt)
			.map_err(|e| Error::AuthenticationFailed(format!("invalid salt: {e}")))?;

		let salted = hi(self.password.as_bytes(), &salt, iterations)?;
		let client_key = hmac(&salted, b"Client Key")?;
		let stored_key = Sha1::digest(&client_key);

		let without_proof = format!("c=biws,r={nonce}");
		let auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);

		let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
		let proof: Vec<u8> = client_key.iter().zip(&client_signature).map(|(k, s)| k ^ s).collect();

		let server_key = hmac(&salted, b"Server Key")?;
		self.server_signature = Some(hmac(&server_key, auth_message.as_bytes())?);

		Ok(format!("{without_proof},p={}", STANDARD.encode(proof)))
	}

	pub fn verify_server(&self, server_final: &[u8]) -> Result<()> {
		let expected = self
			.server_signature
			.as_ref()
			.ok_or_else(|| Error::AuthenticationFailed("success before challenge".to_string()))?;

		let server_final = std::str::from_utf8(server_final)
			.map_err(|_| Error::AuthenticationFailed("server final is not UTF-8".to_string()))?;
		let signature = server_final
			.split(',')
			.find_map(|part| part.strip_prefix("v="))
			.ok_or_else(|| Error::AuthenticationFailed(format!("server final without signature: '{server_final}'")))?;
		let signature = STANDARD
			.decode(signature)
			.map_err(|e| Error::AuthenticationFailed(format!("invalid server signature: {e}")))?;

		if &signature != expected {
			return Err(Error::AuthenticationFailed("server signature mismatch".to_string()));
		}
		Ok(())
	}
}

fn escape_name(name: &str) -> String {
	name.replace('=', "=3D").replace(',', "=2C")
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
	let mut mac =
		HmacSha1::new_from_slice(key).map_err(|e| Error::AuthenticationFailed(format!("hmac key: {e}")))?;
	mac.update(data);
	Ok(mac.finalize().into_bytes().to_vec())
}

/// PBKDF2-HMAC-SHA1 with a single output block.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
	let mut block = salt.to_vec();
	block.extend_from_slice(&1u32.to_be_bytes());

	let mut u = hmac(password, &block)?;
	let mut result = u.clone();
	for _ in 1..iterations {
		u = hmac(password, &u)?;
		for (r, b) in result.iter_mut().zip(&u) {
			*r ^= b;
		}
	}
	Ok(result)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_select_prefers_scram() {
		let offered = vec!["PLAIN".to_string(), "SCRAM-SHA-1".to_string()];
		assert_eq!(select(&offered), Some("SCRAM-SHA-1"));
		assert_eq!(select(&["PLAIN".to_string()]), Some("PLAIN"));
		assert_eq!(select(&["DIGEST-MD5".to_string()]), None);
	}

	#[test]
	fn test_plain_initial_response() {
		let mut client = SaslClient::new("PLAIN", "user", "secret").unwrap();
		assert_eq!(client.initial(), b"\0user\0secret".to_vec());
		assert!(client.respond(b"x").is_err());
	}

	#[test]
	fn test_scram_sha1_rfc5802_vector() {
		let mut scram = ScramSha1::new("user", "pencil", "fyko+d2lbbFgONRv9qkxdawL");
		assert_eq!(scram.client_first(), "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");

		let client_final = scram
			.client_final(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
			.unwrap();
		assert_eq!(
			client_final,
			"c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
		);

		scram.verify_server(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=").unwrap();
		assert!(scram.verify_server(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA=").is_err());
	}

	#[test]
	fn test_scram_rejects_foreign_nonce() {
		let mut scram = ScramSha1::new("user", "pencil", "abc");
		scram.client_first();
		assert!(scram.client_final(b"r=xyz,s=QSXCR+Q6sek8bf92,i=4096").is_err());
		assert!(scram.client_final(b"garbage").is_err());
	}

	#[test]
	fn test_scram_rejects_excessive_iterations() {
		let mut scram = ScramSha1::new("user", "pencil", "abc");
		scram.client_first();

		let err = scram.client_final(b"r=abcdef,s=QSXCR+Q6sek8bf92,i=4000000000").unwrap_err();
		assert!(matches!(err, Error::AuthenticationFailed(ref m) if m.contains("iteration count")), "{err:?}");
		assert!(scram.client_final(b"r=abcdef,s=QSXCR+Q6sek8bf92,i=0").is_err());
		assert!(scram.client_final(b"r=abcdef,s=QSXCR+Q6sek8bf92,i=100000").is_ok());
	}

	#[test]
	fn test_username_escaping() {
		let mut scram = ScramSha1::new("a=b,c", "p", "n");
		assert_eq!(scram.client_first(), "n,,n=a=3Db=2Cc,r=n");
	}
}
