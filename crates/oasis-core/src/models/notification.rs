//! Notification records picked up by the external fan-out function

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const INVITE_ACCEPTED: &str = "invite_accepted";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub community_id: String,
    pub recipient_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct NotificationRow {
    pub id: String,
    pub community_id: String,
    pub recipient_id: String,
    pub kind: String,
    pub payload_json: String,
    pub created_at: i64,
}

impl From<NotificationRow> for NotificationRecord {
    fn from(row: NotificationRow) -> Self {
        Self {
            id: row.id,
            community_id: row.community_id,
            recipient_id: row.recipient_id,
            kind: row.kind,
            payload: serde_json::from_str(&row.payload_json).unwrap_or_default(),
            created_at: super::from_millis(row.created_at),
        }
    }
}
