//! Community registry

use sqlx::{Executor, Sqlite};
use std::sync::Arc;
use tracing::info;

use crate::config::OasisConfig;
use crate::error::{OasisError, OasisResult};
use crate::models::{self, to_millis, Community, CommunityRow, MemberRole, Membership};
use crate::security::validator;
use crate::services::audit_service::{self, AuditAction};
use crate::services::{member_service, store, DbPool};

pub(crate) async fn fetch_community<'e, E>(
    executor: E,
    community_id: &str,
) -> OasisResult<Option<Community>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<CommunityRow> =
        sqlx::query_as("SELECT id, name, owner_id, created_at FROM communities WHERE id = ?")
            .bind(community_id)
            .fetch_optional(executor)
            .await?;
    Ok(row.map(Community::from))
}

/// `CommunityNotFound` unless the community exists
pub(crate) async fn ensure_community<'e, E>(executor: E, community_id: &str) -> OasisResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM communities WHERE id = ?")
        .bind(community_id)
        .fetch_optional(executor)
        .await?;
    match exists {
        Some(_) => Ok(()),
        None => Err(OasisError::CommunityNotFound(community_id.to_string())),
    }
}

#[derive(Clone)]
pub struct CommunityService {
    pool: DbPool,
    config: Arc<OasisConfig>,
}

impl CommunityService {
    pub fn new(pool: DbPool, config: Arc<OasisConfig>) -> Self {
        Self { pool, config }
    }

    /// Create a community and its owner membership in one transaction
    pub async fn create_community(&self, name: &str, owner_id: &str) -> OasisResult<Community> {
        let name = validator::validate_community_name(name)?;
        validator::validate_id("ownerId", owner_id)?;

        let community = Community {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            owner_id: owner_id.to_string(),
            created_at: models::now(),
        };
        let owner = Membership {
            joined_at: community.created_at,
            ..Membership::new(community.id.clone(), owner_id.to_string(), MemberRole::Owner)
        };

        store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT INTO communities (id, name, owner_id, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&community.id)
            .bind(&community.name)
            .bind(&community.owner_id)
            .bind(to_millis(community.created_at))
            .execute(&mut *tx)
            .await?;

            member_service::insert_membership(&mut tx, &owner).await?;

            audit_service::record(
                &mut tx,
                &community.id,
                owner_id,
                AuditAction::CommunityCreate,
                Some(("community", community.id.as_str())),
                serde_json::json!({ "name": community.name }),
            )
            .await?;

            Ok(tx)
        })
        .await?
        .commit()
        .await?;

        info!(community_id = %community.id, owner_id = %owner_id, "Community created");
        Ok(community)
    }

    pub async fn get_community(&self, community_id: &str) -> OasisResult<Community> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "get_community", move || async move {
            fetch_community(pool, community_id)
                .await?
                .ok_or_else(|| OasisError::CommunityNotFound(community_id.to_string()))
        })
        .await
    }
}
