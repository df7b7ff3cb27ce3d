use chrono::{DateTime, Utc};

use crate::ids::{SessionId, UserId};

/// Revocation reasons recorded on a session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RevokeReason {
    /// User-initiated logout.
    Logout,
    /// The network rejected the refresh token.
    RefreshRejected,
    /// Stored ciphertext failed authentication on decrypt.
    CryptoFailure,
    /// Refresh expiry passed; removed by maintenance.
    Expired,
}

impl RevokeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevokeReason::Logout => "logout",
            RevokeReason::RefreshRejected => "refresh_rejected",
            RevokeReason::CryptoFailure => "crypto_failure",
            RevokeReason::Expired => "expired",
        }
    }
}

impl std::fmt::Display for RevokeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delegation of posting authority: a persisted OAuth session with its
/// token material (encrypted at rest) and the DPoP key pair bound to it.
///
/// Invariants: `access_expires_at <= refresh_expires_at`; an active session
/// has non-empty encrypted tokens; a revoked session is never reactivated.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: SessionId,
    pub user_id: UserId,
    /// AEAD ciphertext, `iv.tag.ct` base64url form.
    pub access_token_enc: String,
    pub refresh_token_enc: String,
    pub dpop_private_jwk_enc: String,
    /// Public half of the DPoP key, plain JWK JSON. Not secret.
    pub dpop_public_jwk: String,
    /// RFC 7638 thumbprint of the public JWK.
    pub dpop_key_thumbprint: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub last_used_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub source_ip: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn expiry_ordered(&self) -> bool {
        self.access_expires_at <= self.refresh_expires_at
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.refresh_expires_at > now
    }

    /// Access token is within the proactive-refresh skew window.
    pub fn access_needs_refresh(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        self.access_expires_at <= now + skew
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(access: DateTime<Utc>, refresh: DateTime<Utc>) -> AuthSession {
        AuthSession {
            id: SessionId::new(),
            user_id: UserId::new(),
            access_token_enc: "iv.tag.ct".into(),
            refresh_token_enc: "iv.tag.ct".into(),
            dpop_private_jwk_enc: "iv.tag.ct".into(),
            dpop_public_jwk: "{}".into(),
            dpop_key_thumbprint: "thumb".into(),
            access_expires_at: access,
            refresh_expires_at: refresh,
            is_active: true,
            last_used_at: Utc::now(),
            user_agent: None,
            source_ip: None,
            revoked_at: None,
            revoke_reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn refresh_window_bounds_usability() {
        let now = Utc::now();
        let live = session(now + chrono::Duration::hours(1), now + chrono::Duration::days(30));
        assert!(live.expiry_ordered());
        assert!(live.is_usable(now));

        let stale = session(now - chrono::Duration::hours(2), now - chrono::Duration::hours(1));
        assert!(!stale.is_usable(now));
    }

    #[test]
    fn skew_triggers_proactive_refresh() {
        let now = Utc::now();
        let s = session(now + chrono::Duration::seconds(10), now + chrono::Duration::days(1));
        assert!(s.access_needs_refresh(now, chrono::Duration::seconds(30)));
        assert!(!s.access_needs_refresh(now, chrono::Duration::seconds(5)));
    }
}
