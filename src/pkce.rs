//! PKCE code verifier and challenge generation (RFC 7636, S256 only)

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Characters permitted in a code verifier (RFC 7636 §4.1 unreserved set).
const VERIFIER_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ-._~";

/// Length of generated code verifiers.
const VERIFIER_LEN: usize = 64;

/// Generate a fresh 64-character code verifier from the OS RNG.
#[must_use]
pub fn generate_verifier() -> String {
    let mut rng = OsRng;
    (0..VERIFIER_LEN)
        .map(|_| VERIFIER_CHARS[rng.gen_range(0..VERIFIER_CHARS.len())] as char)
        .collect()
}

/// Compute the S256 challenge for a verifier:
/// `base64url_nopad(SHA-256(verifier))`.
#[must_use]
pub fn challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Generate a `(challenge, verifier)` pair.
#[must_use]
pub fn generate_pair() -> (String, String) {
    let verifier = generate_verifier();
    let challenge = challenge(&verifier);
    (challenge, verifier)
}

/// Check a verifier against a stored challenge.
#[must_use]
pub fn verify(stored_challenge: &str, verifier: &str) -> bool {
    challenge(verifier) == stored_challenge
}
