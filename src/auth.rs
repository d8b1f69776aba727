//! Credential parsing and password hashing.
//!
//! Credentials arrive either as the `u`/`p` URL parameters or as an HTTP
//! Basic Authorization header; the URL form wins when both are present.
//! Passwords are stored as `salt$hex(sha256(salt || password))`.

use crate::{Error, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Parsed credentials from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Extract credentials from URL query parameters and the Authorization
/// header. Returns `CredentialsRequired` when neither form is usable.
pub fn parse_credentials(
    username_param: Option<&str>,
    password_param: Option<&str>,
    authorization: Option<&str>,
) -> Result<Credentials> {
    if let (Some(u), Some(p)) = (username_param, password_param) {
        if !u.is_empty() && !p.is_empty() {
            return Ok(Credentials {
                username: u.to_string(),
                password: p.to_string(),
            });
        }
    }
    if let Some(header) = authorization {
        if let Some(encoded) = header.strip_prefix("Basic ") {
            let decoded = BASE64_STANDARD
                .decode(encoded.trim())
                .map_err(|_| Error::CredentialsRequired)?;
            let text = String::from_utf8(decoded).map_err(|_| Error::CredentialsRequired)?;
            if let Some((user, pass)) = text.split_once(':') {
                return Ok(Credentials {
                    username: user.to_string(),
                    password: pass.to_string(),
                });
            }
        }
    }
    Err(Error::CredentialsRequired)
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt_hex = hex(&salt);
    format!("{salt_hex}${}", digest_hex(&salt_hex, password))
}

/// Constant-shape verification of a password against a stored hash.
pub fn verify_password(stored: &str, password: &str) -> bool {
    let Some((salt_hex, digest)) = stored.split_once('$') else {
        return false;
    };
    let computed = digest_hex(salt_hex, password);
    // Compare without early exit on the first mismatching byte.
    computed.len() == digest.len()
        && computed
            .bytes()
            .zip(digest.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn digest_hex(salt_hex: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
