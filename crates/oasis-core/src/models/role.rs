//! Community role definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::security::PermissionSet;

/// Named permission bundle. Assigning it copies the permissions onto the
/// membership; later edits or deletion do not propagate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleDefinition {
    pub id: String,
    pub community_id: String,
    pub name: String,
    /// Display only
    pub color: Option<String>,
    pub permissions: PermissionSet,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of a role definition
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleUpdate {
    #[serde(default)]
    pub name: Option<String>,
    /// `Some(None)` clears the colour
    #[serde(default)]
    pub color: Option<Option<String>>,
    #[serde(default)]
    pub permissions: Option<Vec<String>>,
}

#[derive(Debug, FromRow)]
pub(crate) struct RoleRow {
    pub id: String,
    pub community_id: String,
    pub name: String,
    pub color: Option<String>,
    pub permissions_json: String,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<RoleRow> for RoleDefinition {
    fn from(row: RoleRow) -> Self {
        Self {
            permissions: super::member::decode_permissions(&row.permissions_json),
            id: row.id,
            community_id: row.community_id,
            name: row.name,
            color: row.color,
            created_by: row.created_by,
            created_at: super::from_millis(row.created_at),
            updated_at: super::from_millis(row.updated_at),
        }
    }
}
