//! Role definitions scoped to a community

use sqlx::{Executor, Sqlite};
use std::sync::Arc;
use tracing::info;

use crate::config::OasisConfig;
use crate::error::{OasisError, OasisResult};
use crate::models::{self, encode_permissions, to_millis, Membership, RoleDefinition, RoleRow, RoleUpdate};
use crate::security::{self, validator, Action, Permission, PermissionSet};
use crate::services::audit_service::{self, AuditAction};
use crate::services::{community_service, member_service, store, DbPool};

pub(crate) async fn fetch_role<'e, E>(
    executor: E,
    community_id: &str,
    role_id: &str,
) -> OasisResult<Option<RoleDefinition>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<RoleRow> = sqlx::query_as(
        r#"
        SELECT id, community_id, name, color, permissions_json, created_by, created_at, updated_at
        FROM community_roles
        WHERE community_id = ? AND id = ?
        "#,
    )
    .bind(community_id)
    .bind(role_id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(RoleDefinition::from))
}

fn map_name_conflict(err: sqlx::Error, name: &str) -> OasisError {
    if store::is_unique_violation(&err) {
        OasisError::Validation(format!("Role name already exists: {}", name))
    } else {
        err.into()
    }
}

#[derive(Clone)]
pub struct RoleService {
    pool: DbPool,
    config: Arc<OasisConfig>,
}

impl RoleService {
    pub fn new(pool: DbPool, config: Arc<OasisConfig>) -> Self {
        Self { pool, config }
    }

    async fn authorize(
        &self,
        community_id: &str,
        actor_id: &str,
        permissions: Option<&PermissionSet>,
    ) -> OasisResult<Membership> {
        let pool = self.pool.as_ref();
        let actor = store::read_with_retry(&self.config, "get_membership", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            member_service::fetch_membership(pool, community_id, actor_id).await
        })
        .await?;

        security::require(actor.as_ref(), Action::ManageRoles)?;
        if permissions.is_some_and(|p| p.contains(&Permission::Administrator)) {
            security::require(actor.as_ref(), Action::GrantAdministrator)?;
        }
        actor.ok_or_else(|| OasisError::MemberNotFound(actor_id.to_string()))
    }

    pub async fn create_role<S: AsRef<str>>(
        &self,
        community_id: &str,
        actor_id: &str,
        name: &str,
        color: Option<&str>,
        permissions: &[S],
    ) -> OasisResult<RoleDefinition> {
        let name = validator::validate_role_name(name)?;
        validator::validate_color(color)?;
        let permissions = validator::parse_permissions(permissions)?;
        self.authorize(community_id, actor_id, Some(&permissions)).await?;

        let now = models::now();
        let role = RoleDefinition {
            id: uuid::Uuid::new_v4().to_string(),
            community_id: community_id.to_string(),
            name,
            color: color.map(str::to_string),
            permissions,
            created_by: actor_id.to_string(),
            created_at: now,
            updated_at: now,
        };

        store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO community_roles (id, community_id, name, color, permissions_json, created_by, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&role.id)
            .bind(&role.community_id)
            .bind(&role.name)
            .bind(&role.color)
            .bind(encode_permissions(&role.permissions))
            .bind(&role.created_by)
            .bind(to_millis(role.created_at))
            .bind(to_millis(role.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_name_conflict(e, &role.name))?;

            audit_service::record(
                &mut tx,
                community_id,
                actor_id,
                AuditAction::RoleCreate,
                Some(("role", role.id.as_str())),
                serde_json::json!({ "name": role.name }),
            )
            .await?;
            Ok(tx)
        })
        .await?
        .commit()
        .await?;

        info!(community_id = %community_id, role_id = %role.id, name = %role.name, "Role created");
        Ok(role)
    }

    /// Apply a partial update. Memberships that copied this role keep their grants.
    pub async fn update_role(
        &self,
        community_id: &str,
        actor_id: &str,
        role_id: &str,
        update: RoleUpdate,
    ) -> OasisResult<RoleDefinition> {
        let name = update.name.as_deref().map(validator::validate_role_name).transpose()?;
        if let Some(color) = &update.color {
            validator::validate_color(color.as_deref())?;
        }
        let permissions = update
            .permissions
            .as_deref()
            .map(validator::parse_permissions)
            .transpose()?;
        self.authorize(community_id, actor_id, permissions.as_ref()).await?;

        let pool = self.pool.as_ref();
        let mut role = store::read_with_retry(&self.config, "get_role", move || async move {
            fetch_role(pool, community_id, role_id).await
        })
        .await?
        .ok_or_else(|| OasisError::RoleNotFound(role_id.to_string()))?;

        if let Some(name) = name {
            role.name = name;
        }
        if let Some(color) = update.color {
            role.color = color;
        }
        if let Some(permissions) = permissions {
            role.permissions = permissions;
        }
        role.updated_at = models::now();

        store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                UPDATE community_roles
                SET name = ?, color = ?, permissions_json = ?, updated_at = ?
                WHERE community_id = ? AND id = ?
                "#,
            )
            .bind(&role.name)
            .bind(&role.color)
            .bind(encode_permissions(&role.permissions))
            .bind(to_millis(role.updated_at))
            .bind(community_id)
            .bind(role_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_name_conflict(e, &role.name))?;
            if result.rows_affected() == 0 {
                return Err(OasisError::RoleNotFound(role_id.to_string()));
            }

            audit_service::record(
                &mut tx,
                community_id,
                actor_id,
                AuditAction::RoleUpdate,
                Some(("role", role_id)),
                serde_json::json!({
                    "name": role.name,
                    "color": role.color,
                    "permissions": role.permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
                }),
            )
            .await?;
            Ok(tx)
        })
        .await?
        .commit()
        .await?;

        info!(community_id = %community_id, role_id = %role_id, "Role updated");
        Ok(role)
    }

    /// Delete a role definition; member permission sets are left as they are
    pub async fn delete_role(
        &self,
        community_id: &str,
        actor_id: &str,
        role_id: &str,
    ) -> OasisResult<()> {
        self.authorize(community_id, actor_id, None).await?;

        store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query("DELETE FROM community_roles WHERE community_id = ? AND id = ?")
                .bind(community_id)
                .bind(role_id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(OasisError::RoleNotFound(role_id.to_string()));
            }
            audit_service::record(
                &mut tx,
                community_id,
                actor_id,
                AuditAction::RoleDelete,
                Some(("role", role_id)),
                serde_json::json!({}),
            )
            .await?;
            Ok(tx)
        })
        .await?
        .commit()
        .await?;

        info!(community_id = %community_id, role_id = %role_id, "Role deleted");
        Ok(())
    }

    pub async fn get_role(&self, community_id: &str, role_id: &str) -> OasisResult<RoleDefinition> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "get_role", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            fetch_role(pool, community_id, role_id)
                .await?
                .ok_or_else(|| OasisError::RoleNotFound(role_id.to_string()))
        })
        .await
    }

    pub async fn list_roles(&self, community_id: &str) -> OasisResult<Vec<RoleDefinition>> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "list_roles", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            let rows: Vec<RoleRow> = sqlx::query_as(
                r#"
                SELECT id, community_id, name, color, permissions_json, created_by, created_at, updated_at
                FROM community_roles
                WHERE community_id = ?
                ORDER BY name ASC
                "#,
            )
            .bind(community_id)
            .fetch_all(pool)
            .await?;
            Ok(rows.into_iter().map(RoleDefinition::from).collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::MemberRole;
    use crate::services::{CommunityService, MemberService};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        community_id: String,
        members: MemberService,
        roles: RoleService,
    }

    async fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("roles.db").display());
        let config = Arc::new(OasisConfig::with_database_url(url));
        let pool = db::connect(&config).await.unwrap();
        let community = CommunityService::new(pool.clone(), config.clone())
            .create_community("Garden", "owner")
            .await
            .unwrap();
        Fixture {
            _dir: dir,
            community_id: community.id,
            members: MemberService::new(pool.clone(), config.clone()),
            roles: RoleService::new(pool, config),
        }
    }

    #[tokio::test]
    async fn test_role_crud() {
        let f = setup().await;
        let role = f
            .roles
            .create_role(&f.community_id, "owner", "  Helpers ", Some("#33AA00"), &["kick_members"])
            .await
            .unwrap();
        assert_eq!(role.name, "Helpers");

        let updated = f
            .roles
            .update_role(
                &f.community_id,
                "owner",
                &role.id,
                RoleUpdate {
                    color: Some(None),
                    permissions: Some(vec!["ban_members".into(), "kick_members".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Helpers");
        assert_eq!(updated.color, None);
        assert_eq!(updated.permissions.len(), 2);
        assert_eq!(f.roles.get_role(&f.community_id, &role.id).await.unwrap(), updated);

        f.roles.delete_role(&f.community_id, "owner", &role.id).await.unwrap();
        assert!(f.roles.list_roles(&f.community_id).await.unwrap().is_empty());
        let err = f.roles.get_role(&f.community_id, &role.id).await.unwrap_err();
        assert!(matches!(err, OasisError::RoleNotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_name_is_validation_error() {
        let f = setup().await;
        let none: [&str; 0] = [];
        f.roles.create_role(&f.community_id, "owner", "Crew", None, &none).await.unwrap();
        let err = f
            .roles
            .create_role(&f.community_id, "owner", "Crew", None, &none)
            .await
            .unwrap_err();
        assert!(matches!(err, OasisError::Validation(_)));
    }

    #[tokio::test]
    async fn test_role_authority() {
        let f = setup().await;
        f.members
            .add_member(&f.community_id, "owner", "admin", MemberRole::Admin)
            .await
            .unwrap();

        // admins do not manage roles by default
        let err = f
            .roles
            .create_role(&f.community_id, "admin", "Crew", None, &["view_channels"])
            .await
            .unwrap_err();
        assert!(matches!(err, OasisError::Unauthorized { .. }));

        f.members
            .set_member_permissions(&f.community_id, "owner", "admin", &["manage_roles"])
            .await
            .unwrap();
        f.roles
            .create_role(&f.community_id, "admin", "Crew", None, &["view_channels"])
            .await
            .unwrap();
        let err = f
            .roles
            .create_role(&f.community_id, "admin", "Root", None, &["administrator"])
            .await
            .unwrap_err();
        assert!(matches!(err, OasisError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_assigned_permissions_are_a_copy() {
        let f = setup().await;
        f.members
            .add_member(&f.community_id, "owner", "bob", MemberRole::Member)
            .await
            .unwrap();
        let role = f
            .roles
            .create_role(&f.community_id, "owner", "Mods", None, &["kick_members"])
            .await
            .unwrap();
        f.members
            .assign_role_definition(&f.community_id, "owner", "bob", &role.id)
            .await
            .unwrap();

        f.roles.delete_role(&f.community_id, "owner", &role.id).await.unwrap();
        let bob = f.members.get_membership(&f.community_id, "bob").await.unwrap().unwrap();
        assert!(bob.has_permission(Permission::KickMembers));
    }

    #[tokio::test]
    async fn test_invalid_color() {
        let f = setup().await;
        let err = f
            .roles
            .create_role(&f.community_id, "owner", "Crew", Some("red"), &["view_channels"])
            .await
            .unwrap_err();
        assert!(matches!(err, OasisError::Validation(_)));
    }
}
