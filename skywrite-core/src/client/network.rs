//! Authenticated request execution against the network's XRPC API.
//!
//! Every outbound call is DPoP-signed, rate-gated, and classified per the
//! error contract. A call spends at most one reactive refresh and one
//! server-nonce retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skywrite_model::{RevokeReason, UserId};

use crate::auth::core::AuthCore;
use crate::auth::nonce::NonceCache;
use crate::client::rate_gate::{ENDPOINT_API, RateGate};
use crate::error::{Error, Result};
use crate::store::{TokenStore, UserRepository};

/// The network's microblog-post record collection.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Per-attempt timeout for record-endpoint calls.
const RECORD_TIMEOUT: Duration = Duration::from_secs(30);

/// Reference to a published record, as used in reply pointers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordRef {
    pub uri: String,
    pub cid: String,
}

/// Reply pointers for a threaded post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRef {
    pub root: RecordRef,
    pub parent: RecordRef,
}

/// The microblog-post record payload.
#[derive(Debug, Clone, Serialize)]
pub struct PostRecord {
    #[serde(rename = "$type")]
    pub record_type: &'static str,
    pub text: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub langs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
}

impl PostRecord {
    pub fn new(text: String, langs: Vec<String>, reply: Option<ReplyRef>) -> Self {
        Self {
            record_type: POST_COLLECTION,
            text,
            created_at: Utc::now(),
            langs,
            reply,
        }
    }
}

/// A successfully created record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub uri: String,
    pub cid: String,
    pub rkey: String,
}

/// The publish seam the post service drives. Concrete in production,
/// mocked in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    async fn publish(
        &self,
        user_id: UserId,
        record: PostRecord,
        cancel: &CancellationToken,
    ) -> Result<PublishedRecord>;
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    uri: String,
    cid: String,
}

#[derive(Debug, Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Authenticated, DPoP-signed, rate-limited HTTP execution for one user.
pub struct NetworkClient {
    http: reqwest::Client,
    service_base: String,
    tokens: Arc<TokenStore>,
    users: Arc<UserRepository>,
    auth: Arc<AuthCore>,
    nonces: Arc<NonceCache>,
    gate: Arc<RateGate>,
}

impl std::fmt::Debug for NetworkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkClient")
            .field("service_base", &self.service_base)
            .finish_non_exhaustive()
    }
}

impl NetworkClient {
    pub fn new(
        http: reqwest::Client,
        service_base: String,
        tokens: Arc<TokenStore>,
        users: Arc<UserRepository>,
        auth: Arc<AuthCore>,
        nonces: Arc<NonceCache>,
        gate: Arc<RateGate>,
    ) -> Self {
        Self {
            http,
            service_base,
            tokens,
            users,
            auth,
            nonces,
            gate,
        }
    }

    fn service_host(&self) -> String {
        url::Url::parse(&self.service_base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.service_base.clone())
    }

    /// Execute one authenticated call for the user's most recent active
    /// session.
    pub async fn do_request(
        &self,
        user_id: UserId,
        method: Method,
        url: &str,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut session = self.tokens.get_most_recent_active(user_id).await?;

        // Proactive refresh inside the skew window.
        if session.access_needs_refresh() {
            session = self.auth.refresh_session(session.id, cancel).await?;
        }

        let host = self.service_host();
        let mut refresh_spent = false;
        let mut nonce_retry_spent = false;

        loop {
            self.gate
                .wait_for_availability(ENDPOINT_API, 1, cancel)
                .await?;

            let nonce = self.nonces.get(user_id, &host);
            let proof = session
                .dpop_key
                .mint_proof(method.as_str(), url, nonce.as_deref())?;

            let mut request = self
                .http
                .request(method.clone(), url)
                .timeout(RECORD_TIMEOUT)
                .header("Authorization", format!("DPoP {}", session.access_token.as_str()))
                .header("DPoP", proof);
            if let Some(body) = body {
                request = request.json(body);
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                sent = request.send() => sent.map_err(Error::from)?,
            };

            if let Some(new_nonce) = response
                .headers()
                .get("DPoP-Nonce")
                .and_then(|v| v.to_str().ok())
            {
                self.nonces.store(user_id, &host, new_nonce.to_string());
            }

            let status = response.status();
            if status.is_success() {
                self.tokens.touch(session.id).await?;
                return response
                    .json::<Value>()
                    .await
                    .map_err(|e| Error::Permanent(format!("malformed response body: {e}")));
            }

            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60));
            let body_err = response.json::<XrpcErrorBody>().await.ok();
            let error_code = body_err
                .as_ref()
                .and_then(|b| b.error.as_deref())
                .unwrap_or_default()
                .to_string();
            let error_message = body_err
                .and_then(|b| b.message)
                .unwrap_or_else(|| status.to_string());

            match status {
                StatusCode::UNAUTHORIZED if error_code == "use_dpop_nonce" => {
                    if nonce_retry_spent {
                        warn!(user = %user_id, "second consecutive nonce challenge");
                        return Err(Error::AuthNonce);
                    }
                    nonce_retry_spent = true;
                    debug!(user = %user_id, "retrying with fresh server nonce");
                    continue;
                }
                StatusCode::UNAUTHORIZED => {
                    // invalid_token / expired_access_token: one reactive
                    // refresh, then the session is declared dead.
                    if refresh_spent {
                        self.tokens
                            .revoke(session.id, RevokeReason::RefreshRejected)
                            .await?;
                        return Err(Error::AuthExpired);
                    }
                    refresh_spent = true;
                    session = self.auth.refresh_session(session.id, cancel).await?;
                    continue;
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    return Err(Error::RateLimited { retry_after });
                }
                _ if status.is_server_error() => {
                    return Err(Error::Transient(format!("{status}: {error_message}")));
                }
                _ => {
                    return Err(Error::Permanent(format!(
                        "{status}: {error_code} {error_message}"
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl RecordPublisher for NetworkClient {
    /// Create one microblog-post record in the user's repository.
    async fn publish(
        &self,
        user_id: UserId,
        record: PostRecord,
        cancel: &CancellationToken,
    ) -> Result<PublishedRecord> {
        let user = self.users.get(user_id).await?;
        let url = format!(
            "{}/xrpc/com.atproto.repo.createRecord",
            self.service_base.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "repo": user.did,
            "collection": POST_COLLECTION,
            "record": record,
        });

        let response = self
            .do_request(user_id, Method::POST, &url, Some(&body), cancel)
            .await?;
        let created: CreateRecordResponse = serde_json::from_value(response)
            .map_err(|e| Error::Permanent(format!("malformed createRecord response: {e}")))?;

        let rkey = trailing_path_segment(&created.uri).ok_or_else(|| {
            Error::Permanent(format!("record URI has no rkey: {}", created.uri))
        })?;
        Ok(PublishedRecord {
            uri: created.uri,
            cid: created.cid,
            rkey,
        })
    }
}

/// The record key is the trailing path segment of an `at://` URI.
pub fn trailing_path_segment(uri: &str) -> Option<String> {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rkey_is_trailing_segment() {
        assert_eq!(
            trailing_path_segment("at://did:plc:abc123/app.bsky.feed.post/3k44deefy2k2v"),
            Some("3k44deefy2k2v".to_string())
        );
        assert_eq!(trailing_path_segment(""), None);
    }

    #[test]
    fn post_record_serializes_to_the_network_shape() {
        let record = PostRecord::new(
            "hello".to_string(),
            vec!["en".to_string()],
            Some(ReplyRef {
                root: RecordRef {
                    uri: "at://did:plc:a/app.bsky.feed.post/1".into(),
                    cid: "bafyroot".into(),
                },
                parent: RecordRef {
                    uri: "at://did:plc:a/app.bsky.feed.post/2".into(),
                    cid: "bafyparent".into(),
                },
            }),
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["$type"], "app.bsky.feed.post");
        assert_eq!(value["text"], "hello");
        assert_eq!(value["langs"][0], "en");
        assert_eq!(value["reply"]["parent"]["cid"], "bafyparent");
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn bare_posts_omit_reply() {
        let record = PostRecord::new("solo".to_string(), vec!["en".to_string()], None);
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("reply").is_none());
    }
}
