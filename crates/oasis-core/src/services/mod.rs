//! Services module - business logic over the community store

pub mod audit_service;
pub mod community_service;
pub mod member_service;
pub mod notification_service;
pub mod role_service;
pub mod token_service;
mod store;

pub use audit_service::{AuditAction, AuditLog, AuditLogQuery, AuditService};
pub use community_service::CommunityService;
pub use member_service::MemberService;
pub use notification_service::NotificationService;
pub use role_service::RoleService;
pub use token_service::{CodeGenerator, TimestampCodeGenerator, TokenService};

use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared connection pool
pub type DbPool = Arc<SqlitePool>;
