//! DPoP key lifecycle and proof minting.
//!
//! One P-256 key pair per authorization session. Every authenticated request
//! carries a freshly minted proof: a compact ES256 JWS whose payload binds
//! the HTTP method, the normalized URL, the mint time, and (once the server
//! has issued one) the current server nonce.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use p256::SecretKey;
use p256::ecdsa::{Signature, SigningKey, signature::Signer};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Public half of a DPoP key in JWK form, embedded in every proof header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

#[derive(Serialize)]
struct ProofHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    jwk: &'a PublicJwk,
}

#[derive(Serialize)]
struct ProofPayload<'a> {
    jti: String,
    htm: String,
    htu: String,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
}

/// A session's DPoP signing key.
pub struct DpopKey {
    secret: SecretKey,
    signing: SigningKey,
}

impl std::fmt::Debug for DpopKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpopKey")
            .field("thumbprint", &self.thumbprint())
            .finish_non_exhaustive()
    }
}

impl DpopKey {
    /// Generate a fresh P-256 key pair.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut rand::thread_rng());
        let signing = SigningKey::from(&secret);
        Self { secret, signing }
    }

    /// Load a key from its private JWK. Anything other than an EC P-256 key
    /// is rejected.
    pub fn from_private_jwk(jwk: &str) -> Result<Self> {
        let secret = SecretKey::from_jwk_str(jwk).map_err(|_| {
            Error::CryptoFailure("stored DPoP key is not a P-256 EC JWK".to_string())
        })?;
        let signing = SigningKey::from(&secret);
        Ok(Self { secret, signing })
    }

    /// Serialized private JWK, for encryption at rest. Zeroed on drop.
    pub fn private_jwk(&self) -> Zeroizing<String> {
        self.secret.to_jwk_string()
    }

    /// The embedded-in-proofs public JWK.
    pub fn public_jwk(&self) -> PublicJwk {
        let point = self.signing.verifying_key().to_encoded_point(false);
        let x = point.x().expect("uncompressed point has x");
        let y = point.y().expect("uncompressed point has y");
        PublicJwk {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        }
    }

    /// Canonical JWK thumbprint (RFC 7638): SHA-256 over the field-ordered
    /// JSON of `{crv, kty, x, y}`, base64url without padding. Stable across
    /// serialize/deserialize round trips.
    pub fn thumbprint(&self) -> String {
        let jwk = self.public_jwk();
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            jwk.crv, jwk.kty, jwk.x, jwk.y
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Mint a proof for one request. Never cached; every call produces a
    /// fresh `jti`.
    pub fn mint_proof(
        &self,
        method: &str,
        url: &str,
        nonce: Option<&str>,
    ) -> Result<String> {
        let jwk = self.public_jwk();
        let header = ProofHeader {
            alg: "ES256",
            typ: "dpop+jwt",
            jwk: &jwk,
        };
        let payload = ProofPayload {
            jti: fresh_jti(),
            htm: method.to_ascii_uppercase(),
            htu: normalize_htu(url)?,
            iat: chrono::Utc::now().timestamp(),
            nonce,
        };

        let header_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&header)
                .map_err(|e| Error::Internal(format!("proof header: {e}")))?,
        );
        let payload_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&payload)
                .map_err(|e| Error::Internal(format!("proof payload: {e}")))?,
        );

        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature: Signature = self.signing.sign(signing_input.as_bytes());
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        Ok(format!("{signing_input}.{signature_b64}"))
    }
}

/// Strip query and fragment: proofs bind scheme + host + path only.
pub fn normalize_htu(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw)
        .map_err(|e| Error::Validation(format!("invalid request URL: {e}")))?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

fn fresh_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Validate that a public JWK (as stored on the session row) is an EC P-256
/// key.
pub fn validate_public_jwk(jwk_json: &str) -> Result<PublicJwk> {
    let jwk: PublicJwk = serde_json::from_str(jwk_json)
        .map_err(|_| Error::CryptoFailure("stored public JWK is malformed".to_string()))?;
    if jwk.kty != "EC" || jwk.crv != "P-256" {
        return Err(Error::CryptoFailure(format!(
            "unsupported DPoP key type {}/{}",
            jwk.kty, jwk.crv
        )));
    }
    Ok(jwk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn decode_json(part: &str) -> serde_json::Value {
        let bytes = URL_SAFE_NO_PAD.decode(part).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn thumbprint_is_stable_across_serialization() {
        let key = DpopKey::generate();
        let reloaded = DpopKey::from_private_jwk(&key.private_jwk()).unwrap();
        assert_eq!(key.thumbprint(), reloaded.thumbprint());
        assert_eq!(key.public_jwk(), reloaded.public_jwk());
    }

    #[test]
    fn distinct_keys_have_distinct_thumbprints() {
        assert_ne!(DpopKey::generate().thumbprint(), DpopKey::generate().thumbprint());
    }

    #[test]
    fn proof_shape() {
        let key = DpopKey::generate();
        let proof = key
            .mint_proof("post", "https://bsky.social/oauth/token?foo=bar#frag", None)
            .unwrap();
        let parts: Vec<&str> = proof.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header = decode_json(parts[0]);
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["typ"], "dpop+jwt");
        assert_eq!(header["jwk"]["kty"], "EC");
        assert_eq!(header["jwk"]["crv"], "P-256");

        let payload = decode_json(parts[1]);
        assert_eq!(payload["htm"], "POST");
        assert_eq!(payload["htu"], "https://bsky.social/oauth/token");
        assert!(payload["iat"].as_i64().unwrap() > 0);
        assert!(payload.get("nonce").is_none());

        // Raw r||s signature.
        assert_eq!(URL_SAFE_NO_PAD.decode(parts[2]).unwrap().len(), 64);
    }

    #[test]
    fn proof_carries_nonce_when_present() {
        let key = DpopKey::generate();
        let proof = key
            .mint_proof("POST", "https://bsky.social/xrpc/x", Some("server-nonce"))
            .unwrap();
        let payload = decode_json(proof.split('.').nth(1).unwrap());
        assert_eq!(payload["nonce"], "server-nonce");
    }

    #[test]
    fn jti_unique_per_proof() {
        let key = DpopKey::generate();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let proof = key
                .mint_proof("GET", "https://bsky.social/xrpc/y", None)
                .unwrap();
            let payload = decode_json(proof.split('.').nth(1).unwrap());
            assert!(seen.insert(payload["jti"].as_str().unwrap().to_string()));
        }
    }

    #[test]
    fn non_p256_keys_are_rejected() {
        // An Ed25519 OKP key must not load.
        let okp = r#"{"kty":"OKP","crv":"Ed25519","x":"abc","d":"def"}"#;
        assert!(matches!(
            DpopKey::from_private_jwk(okp),
            Err(Error::CryptoFailure(_))
        ));
        assert!(validate_public_jwk(r#"{"kty":"RSA","crv":"P-256","x":"a","y":"b"}"#).is_err());
    }

    #[test]
    fn htu_normalization_strips_query_and_fragment() {
        assert_eq!(
            normalize_htu("https://pds.example/xrpc/com.atproto.repo.createRecord?x=1#top")
                .unwrap(),
            "https://pds.example/xrpc/com.atproto.repo.createRecord"
        );
    }
}
