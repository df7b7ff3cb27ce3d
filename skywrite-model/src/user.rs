use chrono::{DateTime, Utc};

use crate::ids::UserId;

/// A network account that has delegated posting authority to us.
///
/// `did` is the network's stable decentralized identifier; `handle` is the
/// human-readable name and may change between logins.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct User {
    pub id: UserId,
    pub did: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
