//! Membership service - roles and explicit grants per community member

use sqlx::{Executor, Sqlite, SqliteConnection};
use std::sync::Arc;
use tracing::info;

use crate::config::OasisConfig;
use crate::error::{OasisError, OasisResult};
use crate::models::{self, encode_permissions, to_millis, MemberRole, Membership, MembershipRow};
use crate::security::{self, validator, Action, Permission, PermissionSet, Tab};
use crate::services::audit_service::{self, AuditAction};
use crate::services::{community_service, role_service, store, DbPool};

pub(crate) async fn fetch_membership<'e, E>(
    executor: E,
    community_id: &str,
    user_id: &str,
) -> OasisResult<Option<Membership>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<MembershipRow> = sqlx::query_as(
        r#"
        SELECT community_id, user_id, role, permissions_json, joined_at
        FROM community_members
        WHERE community_id = ? AND user_id = ?
        "#,
    )
    .bind(community_id)
    .bind(user_id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(Membership::from))
}

/// Insert a membership on the caller's transaction
pub(crate) async fn insert_membership(
    conn: &mut SqliteConnection,
    membership: &Membership,
) -> OasisResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO community_members (community_id, user_id, role, permissions_json, joined_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&membership.community_id)
    .bind(&membership.user_id)
    .bind(membership.role.to_string())
    .bind(encode_permissions(&membership.permissions))
    .bind(to_millis(membership.joined_at))
    .execute(conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if store::is_unique_violation(&e) => Err(OasisError::MemberExists {
            user_id: membership.user_id.clone(),
        }),
        Err(e) => Err(e.into()),
    }
}

async fn write_permissions(
    conn: &mut SqliteConnection,
    community_id: &str,
    user_id: &str,
    permissions: &PermissionSet,
) -> OasisResult<()> {
    let result = sqlx::query(
        "UPDATE community_members SET permissions_json = ? WHERE community_id = ? AND user_id = ?",
    )
    .bind(encode_permissions(permissions))
    .bind(community_id)
    .bind(user_id)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(OasisError::MemberNotFound(user_id.to_string()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct MemberService {
    pool: DbPool,
    config: Arc<OasisConfig>,
}

impl MemberService {
    pub fn new(pool: DbPool, config: Arc<OasisConfig>) -> Self {
        Self { pool, config }
    }

    pub async fn get_membership(
        &self,
        community_id: &str,
        user_id: &str,
    ) -> OasisResult<Option<Membership>> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "get_membership", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            fetch_membership(pool, community_id, user_id).await
        })
        .await
    }

    /// Built-in role of a user; non-members resolve to `member`
    pub async fn resolve_role(&self, community_id: &str, user_id: &str) -> OasisResult<MemberRole> {
        let membership = self.get_membership(community_id, user_id).await?;
        Ok(security::resolve_role(membership.as_ref()))
    }

    /// Non-members hold no permissions at all
    pub async fn has_permission(
        &self,
        community_id: &str,
        user_id: &str,
        permission: Permission,
    ) -> OasisResult<bool> {
        let membership = self.get_membership(community_id, user_id).await?;
        Ok(membership.is_some_and(|m| m.has_permission(permission)))
    }

    pub async fn can_access_tab(
        &self,
        community_id: &str,
        user_id: &str,
        tab: Tab,
    ) -> OasisResult<bool> {
        let role = self.resolve_role(community_id, user_id).await?;
        Ok(security::can_access_tab(role, tab))
    }

    /// Members ordered by join time
    pub async fn list_members(&self, community_id: &str) -> OasisResult<Vec<Membership>> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "list_members", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            let rows: Vec<MembershipRow> = sqlx::query_as(
                r#"
                SELECT community_id, user_id, role, permissions_json, joined_at
                FROM community_members
                WHERE community_id = ?
                ORDER BY joined_at ASC, user_id ASC
                "#,
            )
            .bind(community_id)
            .fetch_all(pool)
            .await?;
            Ok(rows.into_iter().map(Membership::from).collect())
        })
        .await
    }

    /// Membership of `actor_id` after checking the community exists
    async fn actor(&self, community_id: &str, actor_id: &str) -> OasisResult<Option<Membership>> {
        self.get_membership(community_id, actor_id).await
    }

    async fn target(&self, community_id: &str, user_id: &str) -> OasisResult<Membership> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "get_membership", move || async move {
            fetch_membership(pool, community_id, user_id).await
        })
        .await?
        .ok_or_else(|| OasisError::MemberNotFound(user_id.to_string()))
    }

    /// Add a member directly, bypassing invite tokens
    pub async fn add_member(
        &self,
        community_id: &str,
        actor_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> OasisResult<Membership> {
        validator::validate_id("userId", user_id)?;
        let actor = self.actor(community_id, actor_id).await?;
        security::require(actor.as_ref(), Action::ManageMembers)?;
        if role == MemberRole::Owner {
            return Err(OasisError::CannotModifyOwner);
        }
        if role == MemberRole::Unknown {
            return Err(OasisError::Validation("Cannot assign an unknown role".to_string()));
        }

        let membership = Membership {
            joined_at: models::now(),
            ..Membership::new(community_id.to_string(), user_id.to_string(), role)
        };

        store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;
            insert_membership(&mut tx, &membership).await?;
            audit_service::record(
                &mut tx,
                community_id,
                actor_id,
                AuditAction::MemberAdd,
                Some(("member", user_id)),
                serde_json::json!({ "role": role.to_string() }),
            )
            .await?;
            Ok(tx)
        })
        .await?
        .commit()
        .await?;

        info!(community_id = %community_id, user_id = %user_id, role = %role, "Member added");
        Ok(membership)
    }

    /// Change a member's built-in role; the owner's seat is fixed
    pub async fn set_member_role(
        &self,
        community_id: &str,
        actor_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> OasisResult<Membership> {
        let actor = self.actor(community_id, actor_id).await?;
        security::require(actor.as_ref(), Action::ManageMembers)?;

        let mut target = self.target(community_id, user_id).await?;
        if target.is_owner() || role == MemberRole::Owner {
            return Err(OasisError::CannotModifyOwner);
        }
        if role == MemberRole::Unknown {
            return Err(OasisError::Validation("Cannot assign an unknown role".to_string()));
        }
        if target.role == role {
            return Ok(target);
        }
        let previous = target.role;

        store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                "UPDATE community_members SET role = ? WHERE community_id = ? AND user_id = ? AND role <> 'owner'",
            )
            .bind(role.to_string())
            .bind(community_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(OasisError::MemberNotFound(user_id.to_string()));
            }
            audit_service::record(
                &mut tx,
                community_id,
                actor_id,
                AuditAction::MemberRoleChange,
                Some(("member", user_id)),
                serde_json::json!({ "from": previous.to_string(), "to": role.to_string() }),
            )
            .await?;
            Ok(tx)
        })
        .await?
        .commit()
        .await?;

        info!(community_id = %community_id, user_id = %user_id, from = %previous, to = %role, "Member role changed");
        target.role = role;
        Ok(target)
    }

    /// Replace a member's explicit grants
    pub async fn set_member_permissions<S: AsRef<str>>(
        &self,
        community_id: &str,
        actor_id: &str,
        user_id: &str,
        permissions: &[S],
    ) -> OasisResult<Membership> {
        let permissions = validator::parse_permissions(permissions)?;
        let actor = self.actor(community_id, actor_id).await?;
        self.authorize_grants(actor.as_ref(), &permissions)?;

        let mut target = self.target(community_id, user_id).await?;
        if target.is_owner() {
            return Err(OasisError::CannotModifyOwner);
        }

        store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;
            write_permissions(&mut tx, community_id, user_id, &permissions).await?;
            audit_service::record(
                &mut tx,
                community_id,
                actor_id,
                AuditAction::MemberPermissionsChange,
                Some(("member", user_id)),
                serde_json::json!({
                    "permissions": permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>()
                }),
            )
            .await?;
            Ok(tx)
        })
        .await?
        .commit()
        .await?;

        info!(community_id = %community_id, user_id = %user_id, count = permissions.len(), "Member permissions replaced");
        target.permissions = permissions;
        Ok(target)
    }

    /// Copy a role definition's permissions onto a member. Later edits to the
    /// role do not propagate.
    pub async fn assign_role_definition(
        &self,
        community_id: &str,
        actor_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> OasisResult<Membership> {
        let actor = self.actor(community_id, actor_id).await?;
        security::require(actor.as_ref(), Action::ManageMembers)?;

        let pool = self.pool.as_ref();
        let role = store::read_with_retry(&self.config, "get_role", move || async move {
            role_service::fetch_role(pool, community_id, role_id).await
        })
        .await?
        .ok_or_else(|| OasisError::RoleNotFound(role_id.to_string()))?;
        self.authorize_grants(actor.as_ref(), &role.permissions)?;

        let mut target = self.target(community_id, user_id).await?;
        if target.is_owner() {
            return Err(OasisError::CannotModifyOwner);
        }

        store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;
            write_permissions(&mut tx, community_id, user_id, &role.permissions).await?;
            audit_service::record(
                &mut tx,
                community_id,
                actor_id,
                AuditAction::MemberPermissionsChange,
                Some(("member", user_id)),
                serde_json::json!({ "roleId": role.id, "roleName": role.name }),
            )
            .await?;
            Ok(tx)
        })
        .await?
        .commit()
        .await?;

        info!(community_id = %community_id, user_id = %user_id, role = %role.name, "Role definition assigned");
        target.permissions = role.permissions;
        Ok(target)
    }

    /// Remove a member or leave the community. Tokens the member created stay valid.
    pub async fn remove_member(
        &self,
        community_id: &str,
        actor_id: &str,
        user_id: &str,
    ) -> OasisResult<()> {
        let actor = self.actor(community_id, actor_id).await?;
        let target = self.target(community_id, user_id).await?;
        if target.is_owner() {
            return Err(OasisError::CannotModifyOwner);
        }
        security::require(actor.as_ref(), Action::RemoveMember { target: &target })?;

        store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                "DELETE FROM community_members WHERE community_id = ? AND user_id = ? AND role <> 'owner'",
            )
            .bind(community_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(OasisError::MemberNotFound(user_id.to_string()));
            }
            audit_service::record(
                &mut tx,
                community_id,
                actor_id,
                AuditAction::MemberRemove,
                Some(("member", user_id)),
                serde_json::json!({ "role": target.role.to_string() }),
            )
            .await?;
            Ok(tx)
        })
        .await?
        .commit()
        .await?;

        info!(community_id = %community_id, user_id = %user_id, actor_id = %actor_id, "Member removed");
        Ok(())
    }

    fn authorize_grants(
        &self,
        actor: Option<&Membership>,
        permissions: &PermissionSet,
    ) -> OasisResult<()> {
        security::require(actor, Action::ManageMembers)?;
        if permissions.contains(&Permission::Administrator) {
            security::require(actor, Action::GrantAdministrator)?;
        }
        Ok(())
    }
}
