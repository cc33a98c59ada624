#![allow(dead_code)]

use chrono::{DateTime, Utc};
use oasis_core::models::MemberRole;
use oasis_core::{Oasis, OasisConfig};
use tempfile::TempDir;

pub const OWNER: &str = "owner";

pub struct TestEnv {
    // keeps the database directory alive
    _dir: TempDir,
    pub oasis: Oasis,
    pub community_id: String,
}

pub async fn setup() -> TestEnv {
    setup_with(|_| {}).await
}

pub async fn setup_with(configure: impl FnOnce(&mut OasisConfig)) -> TestEnv {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("oasis.db").display());
    let mut config = OasisConfig::with_database_url(url);
    config.max_connections = 16;
    configure(&mut config);

    let oasis = Oasis::connect(config).await.expect("connect");
    let community = oasis
        .communities
        .create_community("Test Oasis", OWNER)
        .await
        .expect("create community");

    TestEnv {
        _dir: dir,
        oasis,
        community_id: community.id,
    }
}

impl TestEnv {
    pub async fn add_member(&self, user_id: &str, role: MemberRole) {
        self.oasis
            .members
            .add_member(&self.community_id, OWNER, user_id, role)
            .await
            .expect("add member");
    }

    /// Move a token's expiry, standing in for the passage of time
    pub async fn set_expiry(&self, token_id: &str, expires_at: DateTime<Utc>) {
        sqlx::query("UPDATE invite_tokens SET expires_at = ? WHERE id = ?")
            .bind(expires_at.timestamp_millis())
            .bind(token_id)
            .execute(self.oasis.pool.as_ref())
            .await
            .expect("set expiry");
    }
}
