//! Oasis community access core
//!
//! Invite tokens, usage accounting and role/permission resolution for
//! communities ("oasis"), persisted in SQLite.
//!
//! # Features
//! - Permanent and temporary invite tokens with optional use ceilings
//! - Atomic consumption that enrols the invitee and records who invited whom
//! - Built-in roles plus explicit permission grants and community role definitions
//! - Audit log and join notifications written alongside each mutation
//! - Reference-counted profile cache over an injected change feed

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod migrations;
pub mod models;
pub mod security;
pub mod services;

pub use config::OasisConfig;
pub use error::{ErrorKind, InactiveReason, OasisError, OasisResult};
pub use services::DbPool;

use services::{
    AuditService, CodeGenerator, CommunityService, MemberService, NotificationService,
    RoleService, TokenService,
};
use std::sync::Arc;

/// All services sharing one pool and configuration
#[derive(Clone)]
pub struct Oasis {
    pub pool: DbPool,
    pub config: Arc<OasisConfig>,
    pub communities: CommunityService,
    pub members: MemberService,
    pub roles: RoleService,
    pub tokens: TokenService,
    pub notifications: NotificationService,
    pub audit: AuditService,
}

impl Oasis {
    /// Open the database described by `config` and wire up the services
    pub async fn connect(config: OasisConfig) -> OasisResult<Self> {
        let pool = db::connect(&config).await?;
        Ok(Self::with_pool(pool, Arc::new(config)))
    }

    pub fn with_pool(pool: DbPool, config: Arc<OasisConfig>) -> Self {
        Self {
            communities: CommunityService::new(pool.clone(), config.clone()),
            members: MemberService::new(pool.clone(), config.clone()),
            roles: RoleService::new(pool.clone(), config.clone()),
            tokens: TokenService::new(pool.clone(), config.clone()),
            notifications: NotificationService::new(pool.clone(), config.clone()),
            audit: AuditService::new(pool.clone(), config.clone()),
            pool,
            config,
        }
    }

    /// Swap the invite code source, e.g. for deterministic codes
    pub fn with_code_generator(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.tokens = TokenService::with_code_generator(self.pool.clone(), self.config.clone(), codes);
        self
    }
}
