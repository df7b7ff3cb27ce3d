use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Decrypted token material. Zeroed on drop.
pub type Secret = Zeroizing<String>;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_SECRET_LEN: usize = 32;

/// AES-256-GCM cipher for tokens and DPoP private keys.
///
/// The encryption key is derived from the configured secret with a one-way
/// hash, so the raw secret never sits in the cipher. Stored form is
/// `b64url(iv).b64url(tag).b64url(ciphertext)` with a fresh 96-bit IV per
/// value.
#[derive(Clone)]
pub struct TokenCipher {
    key: Key<Aes256Gcm>,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Derive the cipher from the configured secret. Fails when the secret
    /// is missing or shorter than 32 bytes.
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::Validation(format!(
                "encryption secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        let digest = Sha256::digest(secret.as_bytes());
        Ok(Self {
            key: Key::<Aes256Gcm>::clone_from_slice(&digest),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new(&self.key);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| Error::CryptoFailure("encryption failed".to_string()))?;

        // aes-gcm appends the tag to the ciphertext.
        let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        Ok(format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(iv),
            URL_SAFE_NO_PAD.encode(tag),
            URL_SAFE_NO_PAD.encode(ct)
        ))
    }

    pub fn decrypt(&self, stored: &str) -> Result<Secret> {
        let mut parts = stored.splitn(3, '.');
        let (iv, tag, ct) = match (parts.next(), parts.next(), parts.next()) {
            (Some(iv), Some(tag), Some(ct)) => (iv, tag, ct),
            _ => {
                return Err(Error::CryptoFailure(
                    "stored ciphertext is not in iv.tag.ct form".to_string(),
                ));
            }
        };

        let iv = decode_part(iv, "iv")?;
        let tag = decode_part(tag, "tag")?;
        let ct = decode_part(ct, "ciphertext")?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(Error::CryptoFailure(
                "stored ciphertext has malformed iv or tag".to_string(),
            ));
        }

        let mut sealed = ct;
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| {
                Error::CryptoFailure("ciphertext failed authentication".to_string())
            })?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|_| Error::CryptoFailure("plaintext is not UTF-8".to_string()))
    }
}

fn decode_part(part: &str, label: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| Error::CryptoFailure(format!("stored {label} is not base64url")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn short_secret_is_rejected() {
        assert!(TokenCipher::from_secret("too-short").is_err());
        assert!(TokenCipher::from_secret(SECRET).is_ok());
    }

    #[test]
    fn round_trip() {
        let cipher = TokenCipher::from_secret(SECRET).unwrap();
        let stored = cipher.encrypt("eyJ0eXAiOiJhdCtqd3QifQ.token").unwrap();
        let out = cipher.decrypt(&stored).unwrap();
        assert_eq!(out.as_str(), "eyJ0eXAiOiJhdCtqd3QifQ.token");
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let cipher = TokenCipher::from_secret(SECRET).unwrap();
        let a = cipher.encrypt("same plaintext").unwrap();
        let b = cipher.encrypt("same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let cipher = TokenCipher::from_secret(SECRET).unwrap();
        let stored = cipher.encrypt("secret").unwrap();
        let mut parts: Vec<String> = stored.split('.').map(String::from).collect();
        // Flip the first ciphertext byte.
        let mut ct = URL_SAFE_NO_PAD.decode(&parts[2]).unwrap();
        ct[0] ^= 0x01;
        parts[2] = URL_SAFE_NO_PAD.encode(ct);
        let err = cipher.decrypt(&parts.join(".")).unwrap_err();
        assert!(matches!(err, Error::CryptoFailure(_)));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let a = TokenCipher::from_secret(SECRET).unwrap();
        let b =
            TokenCipher::from_secret("fedcba9876543210fedcba9876543210").unwrap();
        let stored = a.encrypt("secret").unwrap();
        assert!(matches!(
            b.decrypt(&stored),
            Err(Error::CryptoFailure(_))
        ));
    }

    #[test]
    fn malformed_stored_forms_are_crypto_failures() {
        let cipher = TokenCipher::from_secret(SECRET).unwrap();
        for bad in ["", "onlyonepart", "two.parts", "a.b.c", "!!!.###.$$$"] {
            assert!(matches!(
                cipher.decrypt(bad),
                Err(Error::CryptoFailure(_))
            ));
        }
    }
}
