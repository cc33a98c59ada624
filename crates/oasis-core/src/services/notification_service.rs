//! Notification records for the external push/SMS fan-out

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::sync::Arc;

use crate::config::OasisConfig;
use crate::error::OasisResult;
use crate::models::{to_millis, NotificationRecord, NotificationRow};
use crate::services::{community_service, store, DbPool};

/// Queue a notification on the caller's transaction
pub(crate) async fn insert_notification(
    conn: &mut SqliteConnection,
    community_id: &str,
    recipient_id: &str,
    kind: &str,
    payload: &serde_json::Value,
    created_at: DateTime<Utc>,
) -> OasisResult<String> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO community_notifications (id, community_id, recipient_id, kind, payload_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(community_id)
    .bind(recipient_id)
    .bind(kind)
    .bind(payload.to_string())
    .bind(to_millis(created_at))
    .execute(conn)
    .await?;
    Ok(id)
}

#[derive(Clone)]
pub struct NotificationService {
    pool: DbPool,
    config: Arc<OasisConfig>,
}

impl NotificationService {
    pub fn new(pool: DbPool, config: Arc<OasisConfig>) -> Self {
        Self { pool, config }
    }

    /// Notifications addressed to a user in a community, newest first
    pub async fn list_notifications(
        &self,
        community_id: &str,
        recipient_id: &str,
    ) -> OasisResult<Vec<NotificationRecord>> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "list_notifications", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            let rows: Vec<NotificationRow> = sqlx::query_as(
                r#"
                SELECT id, community_id, recipient_id, kind, payload_json, created_at
                FROM community_notifications
                WHERE community_id = ? AND recipient_id = ?
                ORDER BY created_at DESC, id ASC
                "#,
            )
            .bind(community_id)
            .bind(recipient_id)
            .fetch_all(pool)
            .await?;
            Ok(rows.into_iter().map(NotificationRecord::from).collect())
        })
        .await
    }
}
