//! Audit logging for privileged community changes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use std::sync::Arc;

use crate::config::OasisConfig;
use crate::error::{OasisError, OasisResult};
use crate::models::{from_millis, to_millis};
use crate::security::{self, Action};
use crate::services::{community_service, member_service, store, DbPool};

/// Audit action types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CommunityCreate,
    TokenCreate,
    TokenRegenerate,
    TokenDisable,
    MemberAdd,
    MemberRemove,
    MemberRoleChange,
    MemberPermissionsChange,
    RoleCreate,
    RoleUpdate,
    RoleDelete,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::CommunityCreate => write!(f, "community_create"),
            AuditAction::TokenCreate => write!(f, "token_create"),
            AuditAction::TokenRegenerate => write!(f, "token_regenerate"),
            AuditAction::TokenDisable => write!(f, "token_disable"),
            AuditAction::MemberAdd => write!(f, "member_add"),
            AuditAction::MemberRemove => write!(f, "member_remove"),
            AuditAction::MemberRoleChange => write!(f, "member_role_change"),
            AuditAction::MemberPermissionsChange => write!(f, "member_permissions_change"),
            AuditAction::RoleCreate => write!(f, "role_create"),
            AuditAction::RoleUpdate => write!(f, "role_update"),
            AuditAction::RoleDelete => write!(f, "role_delete"),
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "community_create" => Ok(AuditAction::CommunityCreate),
            "token_create" => Ok(AuditAction::TokenCreate),
            "token_regenerate" => Ok(AuditAction::TokenRegenerate),
            "token_disable" => Ok(AuditAction::TokenDisable),
            "member_add" => Ok(AuditAction::MemberAdd),
            "member_remove" => Ok(AuditAction::MemberRemove),
            "member_role_change" => Ok(AuditAction::MemberRoleChange),
            "member_permissions_change" => Ok(AuditAction::MemberPermissionsChange),
            "role_create" => Ok(AuditAction::RoleCreate),
            "role_update" => Ok(AuditAction::RoleUpdate),
            "role_delete" => Ok(AuditAction::RoleDelete),
            _ => Err(format!("Unknown audit action: {}", s)),
        }
    }
}

/// Audit log entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: String,
    pub community_id: String,
    pub actor_id: String,
    pub action: AuditAction,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Filters for listing audit logs
#[derive(Debug, Clone, Default)]
pub struct AuditLogQuery {
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, FromRow)]
struct AuditRow {
    id: String,
    community_id: String,
    actor_id: String,
    action: String,
    resource_type: Option<String>,
    resource_id: Option<String>,
    details_json: String,
    timestamp: i64,
}

impl TryFrom<AuditRow> for AuditLog {
    type Error = OasisError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(Self {
            action: row.action.parse().map_err(OasisError::Database)?,
            details: serde_json::from_str(&row.details_json)?,
            id: row.id,
            community_id: row.community_id,
            actor_id: row.actor_id,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            timestamp: from_millis(row.timestamp),
        })
    }
}

/// Append an audit row on the caller's transaction so it commits with the change
pub(crate) async fn record(
    conn: &mut SqliteConnection,
    community_id: &str,
    actor_id: &str,
    action: AuditAction,
    resource: Option<(&str, &str)>,
    details: serde_json::Value,
) -> OasisResult<()> {
    let (resource_type, resource_id) = resource.unzip();
    sqlx::query(
        r#"
        INSERT INTO audit_logs (id, community_id, actor_id, action, resource_type, resource_id, details_json, timestamp)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(community_id)
    .bind(actor_id)
    .bind(action.to_string())
    .bind(resource_type)
    .bind(resource_id)
    .bind(details.to_string())
    .bind(to_millis(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

/// Audit service for querying audit events
#[derive(Clone)]
pub struct AuditService {
    pool: DbPool,
    config: Arc<OasisConfig>,
}

impl AuditService {
    pub fn new(pool: DbPool, config: Arc<OasisConfig>) -> Self {
        Self { pool, config }
    }

    /// List audit logs of a community, newest first. Requires `view_audit_log`.
    pub async fn list_audit_logs(
        &self,
        community_id: &str,
        viewer_id: &str,
        query: AuditLogQuery,
    ) -> OasisResult<Vec<AuditLog>> {
        let pool = self.pool.as_ref();
        let query = &query;
        store::read_with_retry(&self.config, "list_audit_logs", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            let viewer = member_service::fetch_membership(pool, community_id, viewer_id).await?;
            security::require(viewer.as_ref(), Action::ViewAuditLog)?;

            let mut sql = String::from(
                r#"
                SELECT id, community_id, actor_id, action, resource_type, resource_id, details_json, timestamp
                FROM audit_logs
                WHERE community_id = ?
                "#,
            );
            if query.actor_id.is_some() {
                sql.push_str(" AND actor_id = ?");
            }
            if query.action.is_some() {
                sql.push_str(" AND action = ?");
            }
            if query.resource_id.is_some() {
                sql.push_str(" AND resource_id = ?");
            }
            sql.push_str(" ORDER BY timestamp DESC, id ASC LIMIT ? OFFSET ?");

            let mut q = sqlx::query_as::<_, AuditRow>(&sql).bind(community_id);
            if let Some(ref actor) = query.actor_id {
                q = q.bind(actor);
            }
            if let Some(action) = query.action {
                q = q.bind(action.to_string());
            }
            if let Some(ref resource_id) = query.resource_id {
                q = q.bind(resource_id);
            }
            let rows = q
                .bind(query.limit.unwrap_or(100) as i64)
                .bind(query.offset.unwrap_or(0) as i64)
                .fetch_all(pool)
                .await?;

            rows.into_iter().map(AuditLog::try_from).collect()
        })
        .await
    }
}
