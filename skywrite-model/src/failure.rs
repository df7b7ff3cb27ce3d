use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ids::PostId;

/// Append-only record of a terminal post failure. Never mutated; purged by
/// the maintenance task after the retention window.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct FailureRecord {
    pub id: Uuid,
    pub post_id: PostId,
    pub error: String,
    pub created_at: DateTime<Utc>,
}
