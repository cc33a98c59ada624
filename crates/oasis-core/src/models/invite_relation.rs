//! Invite relation model: one record per successful token consumption

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Immutable link from inviter to invitee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRelation {
    pub id: String,
    pub community_id: String,
    pub token_id: String,
    pub inviter_id: String,
    pub invitee_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct InviteRelationRow {
    pub id: String,
    pub community_id: String,
    pub token_id: String,
    pub inviter_id: String,
    pub invitee_id: String,
    pub timestamp: i64,
}

impl From<InviteRelationRow> for InviteRelation {
    fn from(row: InviteRelationRow) -> Self {
        Self {
            id: row.id,
            community_id: row.community_id,
            token_id: row.token_id,
            inviter_id: row.inviter_id,
            invitee_id: row.invitee_id,
            timestamp: super::from_millis(row.timestamp),
        }
    }
}

/// Derived usage view of one token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageSummary {
    pub token_id: String,
    pub total_uses: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Counter stored on the token; always equals `total_uses`
    pub current_uses: i64,
}

impl TokenUsageSummary {
    pub fn from_records(token_id: &str, current_uses: i64, records: &[InviteRelation]) -> Self {
        Self {
            token_id: token_id.to_string(),
            total_uses: records.len() as u64,
            last_used_at: records.iter().map(|r| r.timestamp).max(),
            current_uses,
        }
    }
}

/// Usage records of one token plus the summary derived from them
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageAnalytics {
    pub summary: TokenUsageSummary,
    pub records: Vec<InviteRelation>,
}
