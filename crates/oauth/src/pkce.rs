//! PKCE (RFC 7636) verifier/challenge generation and CSRF state.
//!
//! Only the `S256` challenge method is supported; the `plain` method is
//! deliberately absent. Secrets are drawn from the OS random source per
//! flow instance and never reused.

use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    rand::{TryRngCore, rngs::OsRng},
    sha2::{Digest, Sha256},
};

use crate::{Error, Result};

/// Challenge method advertised in authorization requests.
pub const CHALLENGE_METHOD: &str = "S256";

/// PKCE verifier/challenge pair for a single flow instance.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// Kept client-side and sent as `code_verifier` during token exchange.
    pub verifier: String,
    /// Sent as `code_challenge` in the authorization request.
    pub challenge: String,
}

impl PkceChallenge {
    pub fn generate() -> Result<Self> {
        let verifier = generate_verifier()?;
        let challenge = challenge(&verifier);
        Ok(Self {
            verifier,
            challenge,
        })
    }
}

/// Generate a verifier: 32 random bytes, base64url without padding.
/// The result is exactly 43 characters, within the 43-128 range RFC 7636
/// requires.
pub fn generate_verifier() -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes::<32>()?))
}

/// Generate a CSRF state value: 16 random bytes, base64url without padding.
pub fn generate_state() -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes::<16>()?))
}

/// Derive the S256 code challenge for a verifier:
/// `base64url(SHA-256(verifier))`, no padding.
#[must_use]
pub fn challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|source| Error::Random(source.to_string()))?;
    Ok(bytes)
}
