//! Cookie credentials and the authentication handshake helpers.
//!
//! The daemon proves its identity and accepts ours through a 32-byte cookie
//! it writes to disk. With `SAFECOOKIE` both sides exchange HMAC-SHA256
//! digests keyed by fixed strings, so the cookie itself never crosses the
//! wire.

use crate::error::{Result, TorLauncherError};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::time::SystemTime;

type HmacSha256 = Hmac<Sha256>;

/// Length of a valid authentication cookie.
pub const COOKIE_LEN: usize = 32;

const SERVER_HASH_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";
const CLIENT_HASH_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";

/// A validated 32-byte authentication cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct ControlCookie([u8; COOKIE_LEN]);

impl ControlCookie {
    /// Build a cookie from raw bytes, rejecting any other length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; COOKIE_LEN] = bytes.try_into().ok()?;
        Some(ControlCookie(array))
    }

    /// The raw cookie bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Cookie length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Debug for ControlCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ControlCookie(<redacted>)")
    }
}

/// Cookie and control port extracted from the handshake files.
///
/// Consumed once by the control client; never persisted.
#[derive(Debug, Clone)]
pub struct Credential {
    /// The authentication cookie.
    pub cookie: ControlCookie,
    /// Loopback control port.
    pub port: u16,
    /// When both files were validated.
    pub extracted_at: SystemTime,
}

/// Generate a random client nonce for SAFECOOKIE authentication.
pub fn generate_client_nonce() -> [u8; 32] {
    use rand::Rng;
    let mut nonce = [0u8; 32];
    rand::rng().fill(&mut nonce);
    nonce
}

fn keyed_hash(key: &[u8], cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length should be valid");

    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);

    let result = mac.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result.into_bytes());
    hash
}

/// Compute the server hash for SAFECOOKIE authentication.
pub fn compute_server_hash(cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    keyed_hash(SERVER_HASH_KEY, cookie, client_nonce, server_nonce)
}

/// Compute the client hash for SAFECOOKIE authentication.
pub fn compute_client_hash(cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    keyed_hash(CLIENT_HASH_KEY, cookie, client_nonce, server_nonce)
}

/// Format cookie data as hex for the AUTHENTICATE command.
pub fn format_cookie_hex(cookie: &[u8]) -> String {
    hex::encode_upper(cookie)
}

/// Parse the AUTHCHALLENGE response.
///
/// Returns `(server_hash, server_nonce)`.
pub fn parse_authchallenge_response(text: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    // Format: AUTHCHALLENGE SERVERHASH=... SERVERNONCE=...
    let mut server_hash = None;
    let mut server_nonce = None;

    for part in text.split_whitespace() {
        if let Some(hash) = part.strip_prefix("SERVERHASH=") {
            server_hash = Some(hex::decode(hash).map_err(|e| {
                TorLauncherError::ProtocolError(format!("Invalid SERVERHASH hex: {}", e))
            })?);
        } else if let Some(nonce) = part.strip_prefix("SERVERNONCE=") {
            server_nonce = Some(hex::decode(nonce).map_err(|e| {
                TorLauncherError::ProtocolError(format!("Invalid SERVERNONCE hex: {}", e))
            })?);
        }
    }

    let server_hash = server_hash
        .ok_or_else(|| TorLauncherError::ProtocolError("Missing SERVERHASH".to_string()))?;
    let server_nonce = server_nonce
        .ok_or_else(|| TorLauncherError::ProtocolError("Missing SERVERNONCE".to_string()))?;

    if server_hash.len() != 32 {
        return Err(TorLauncherError::ProtocolError(format!(
            "Invalid SERVERHASH length: {}",
            server_hash.len()
        )));
    }

    if server_nonce.len() != 32 {
        return Err(TorLauncherError::ProtocolError(format!(
            "Invalid SERVERNONCE length: {}",
            server_nonce.len()
        )));
    }

    Ok((server_hash, server_nonce))
}

/// Verify the server's response in SAFECOOKIE authentication.
pub fn verify_server_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
    expected_hash: &[u8],
) -> bool {
    let computed = compute_server_hash(cookie, client_nonce, server_nonce);
    constant_time_compare(&computed, expected_hash)
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
