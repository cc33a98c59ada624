//! Data models for the community access core

mod community;
mod invite_relation;
mod member;
mod notification;
mod role;
mod token;

pub use community::*;
pub use invite_relation::*;
pub use member::*;
pub use notification::*;
pub use role::*;
pub use token::*;

pub(crate) use community::CommunityRow;
pub(crate) use invite_relation::InviteRelationRow;
pub(crate) use member::{encode_permissions, MembershipRow};
pub(crate) use notification::NotificationRow;
pub(crate) use role::RoleRow;
pub(crate) use token::TokenRow;

use chrono::{DateTime, Utc};

/// Stored timestamps are unix milliseconds
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Current time truncated to storage precision, so returned values equal reread ones
pub(crate) fn now() -> DateTime<Utc> {
    from_millis(to_millis(Utc::now()))
}
