//! PKCE verifier/challenge pair generation and checking.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Unreserved characters permitted in a code verifier (RFC 7636 §4.1).
const VERIFIER_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Verifier length in characters. 64 characters over a 66-symbol alphabet
/// carries well over the required 256 bits of entropy.
const VERIFIER_LEN: usize = 64;

/// Generate a fresh code verifier.
pub fn generate_verifier() -> String {
    let mut rng = rand::thread_rng();
    (0..VERIFIER_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..VERIFIER_ALPHABET.len());
            VERIFIER_ALPHABET[idx] as char
        })
        .collect()
}

/// S256 challenge: base64url(SHA-256(verifier)), no padding.
pub fn challenge_s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
