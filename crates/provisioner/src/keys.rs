//! SSH key material and instance naming.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::ProvisionError;

/// RSA modulus size for bootstrap keys.
pub const KEY_BITS: usize = 2048;

/// Prefix of every generated instance name.
pub const INSTANCE_NAME_PREFIX: &str = "lantern";

const SSH_RSA: &str = "ssh-rsa";

/// A single-use key pair for remote shell authentication.
#[derive(Clone)]
pub struct SshKeyPair {
    /// Public half in `authorized_keys` format.
    pub public_key: String,
    private_key_pem: String,
}

impl SshKeyPair {
    /// Private half, PKCS#1 PEM encoded.
    #[must_use]
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

impl fmt::Debug for SshKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh RSA key pair.
///
/// # Errors
/// Returns [`ProvisionError::KeyGeneration`] if the key cannot be
/// generated or encoded.
pub fn make_ssh_key_pair() -> Result<SshKeyPair, ProvisionError> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| ProvisionError::KeyGeneration(e.to_string()))?;
    let pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| ProvisionError::KeyGeneration(e.to_string()))?;

    Ok(SshKeyPair {
        public_key: authorized_key(&private.to_public_key()),
        private_key_pem: pem.as_str().to_owned(),
    })
}

/// Encode an RSA public key as an `authorized_keys` line.
fn authorized_key(public: &RsaPublicKey) -> String {
    let mut blob = Vec::new();
    put_string(&mut blob, SSH_RSA.as_bytes());
    put_mpint(&mut blob, &public.e().to_bytes_be());
    put_mpint(&mut blob, &public.n().to_bytes_be());
    format!("{SSH_RSA} {}", STANDARD.encode(blob))
}

#[allow(clippy::cast_possible_truncation)]
fn put_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

fn put_mpint(buf: &mut Vec<u8>, magnitude: &[u8]) {
    let start = magnitude.iter().position(|b| *b != 0).unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];
    if trimmed.first().is_some_and(|b| b & 0x80 != 0) {
        let mut padded = Vec::with_capacity(trimmed.len() + 1);
        padded.push(0);
        padded.extend_from_slice(trimmed);
        put_string(buf, &padded);
    } else {
        put_string(buf, trimmed);
    }
}

/// Instance name derived from the current UTC time.
#[must_use]
pub fn make_instance_name() -> String {
    instance_name_at(Utc::now())
}

/// Instance name for a given instant: `lantern-YYYYMMDD-HHMMSS`.
#[must_use]
pub fn instance_name_at(now: DateTime<Utc>) -> String {
    format!(
        "{INSTANCE_NAME_PREFIX}-{}-{}",
        now.format("%Y%m%d"),
        now.format("%H%M%S")
    )
}
