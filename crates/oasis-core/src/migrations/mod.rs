//! Database migrations for the community access core

/// Migration SQL for community tables.
///
/// All timestamps are unix milliseconds.
pub const MIGRATION_SQL: &str = r#"
-- communities
CREATE TABLE IF NOT EXISTS communities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_communities_owner ON communities(owner_id);

-- community_members: one membership per user per community
CREATE TABLE IF NOT EXISTS community_members (
    community_id TEXT NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'member',
    permissions_json TEXT NOT NULL DEFAULT '[]',
    joined_at INTEGER NOT NULL,
    PRIMARY KEY (community_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_members_user ON community_members(user_id);

-- community_roles: role definitions, community scope only
CREATE TABLE IF NOT EXISTS community_roles (
    id TEXT PRIMARY KEY,
    community_id TEXT NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    color TEXT,
    permissions_json TEXT NOT NULL DEFAULT '[]',
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(community_id, name)
);
CREATE INDEX IF NOT EXISTS idx_roles_community ON community_roles(community_id);

-- invite_tokens
CREATE TABLE IF NOT EXISTS invite_tokens (
    id TEXT PRIMARY KEY,
    community_id TEXT NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
    code TEXT NOT NULL,
    token_type TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    max_uses INTEGER,
    current_uses INTEGER NOT NULL DEFAULT 0,
    UNIQUE(community_id, code)
);
CREATE INDEX IF NOT EXISTS idx_tokens_community ON invite_tokens(community_id);
CREATE INDEX IF NOT EXISTS idx_tokens_creator ON invite_tokens(community_id, created_by);

-- invite_relations: append-only consumption log
CREATE TABLE IF NOT EXISTS invite_relations (
    id TEXT PRIMARY KEY,
    community_id TEXT NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
    token_id TEXT NOT NULL REFERENCES invite_tokens(id),
    inviter_id TEXT NOT NULL,
    invitee_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_relations_inviter ON invite_relations(community_id, inviter_id);
CREATE INDEX IF NOT EXISTS idx_relations_token ON invite_relations(community_id, token_id);

-- community_notifications: consumed by the external fan-out function
CREATE TABLE IF NOT EXISTS community_notifications (
    id TEXT PRIMARY KEY,
    community_id TEXT NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
    recipient_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON community_notifications(community_id, recipient_id);

-- audit_logs
CREATE TABLE IF NOT EXISTS audit_logs (
    id TEXT PRIMARY KEY,
    community_id TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    action TEXT NOT NULL,
    resource_type TEXT,
    resource_id TEXT,
    details_json TEXT NOT NULL DEFAULT '{}',
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_community ON audit_logs(community_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_logs(actor_id)
"#;

/// Run migration
pub async fn run_migration(pool: &sqlx::SqlitePool) -> Result<(), sqlx::Error> {
    for statement in MIGRATION_SQL.split(';') {
        let statement = statement.trim();
        if statement.is_empty() || is_comment_only(statement) {
            continue;
        }

        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn is_comment_only(statement: &str) -> bool {
    statement
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        run_migration(&pool).await.unwrap();
        run_migration(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert!(names.contains(&"invite_tokens"));
        assert!(names.contains(&"invite_relations"));
        assert!(names.contains(&"community_roles"));
    }
}
