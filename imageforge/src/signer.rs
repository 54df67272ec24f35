//! Shared-secret request signing.
//!
//! The public front-end signs every rendition URL before redirecting here;
//! this module verifies those signatures. The signed message is the canonical
//! request form: the URL path followed by the query pairs sorted by key, with
//! the `hmac` parameter itself excluded:
//!
//! ```text
//! /id/237/200/300.jpg?blur=5&grayscale
//! ```
//!
//! Signatures are HMAC-SHA256, hex-encoded on the wire. Verification decodes
//! the presented hex and compares in constant time; a signature that is not
//! valid hex is simply invalid, not an error.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Query parameter carrying the request signature.
pub const SIGNATURE_PARAM: &str = "hmac";

#[derive(Debug, Error)]
pub enum SignerError {
    /// The configured key is empty, which would sign everything with a
    /// well-known value.
    #[error("signing key must not be empty")]
    EmptyKey,
    /// The key was rejected by the MAC implementation.
    #[error("signing key rejected: {0}")]
    InvalidKey(String),
}

/// Verifies that a request was signed by a trusted peer holding the shared key.
///
/// The keyed MAC is initialized once at construction and cloned per request,
/// so the hot path never re-derives key material.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl Signer {
    /// Creates a signer from the shared secret.
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, SignerError> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(SignerError::EmptyKey);
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Signs a canonical request string, returning the hex signature.
    pub fn sign(&self, message: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies a hex-encoded signature over a canonical request string.
    ///
    /// Comparison happens in constant time. Returns `false` for malformed
    /// hex rather than an error, since a garbled signature is just invalid.
    pub fn verify(&self, message: &str, signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(message.as_bytes());
        mac.verify_slice(&signature).is_ok()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material, even in debug output.
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

/// Builds the canonical request form signed by the front-end.
///
/// The path is taken verbatim; query pairs are sorted by key (then value, so
/// repeated keys canonicalize deterministically) and the signature parameter
/// is dropped. Flag-style parameters with empty values keep their bare form.
pub fn canonical_request(path: &str, query: &[(String, String)]) -> String {
    let mut pairs: Vec<&(String, String)> = query
        .iter()
        .filter(|(key, _)| key != SIGNATURE_PARAM)
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut canonical = String::from(path);
    for (i, (key, value)) in pairs.iter().enumerate() {
        canonical.push(if i == 0 { '?' } else { '&' });
        canonical.push_str(key);
        if !value.is_empty() {
            canonical.push('=');
            canonical.push_str(value);
        }
    }
    canonical
}
