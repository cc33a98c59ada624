//! Community membership model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::security::{self, Permission, PermissionSet};

/// Built-in member role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    #[serde(alias = "administrator")]
    Admin,
    Moderator,
    Member,
    /// A stored role this build does not recognise; grants nothing
    Unknown,
}

impl Default for MemberRole {
    fn default() -> Self {
        MemberRole::Member
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberRole::Owner => write!(f, "owner"),
            MemberRole::Admin => write!(f, "admin"),
            MemberRole::Moderator => write!(f, "moderator"),
            MemberRole::Member => write!(f, "member"),
            MemberRole::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(MemberRole::Owner),
            "admin" | "administrator" => Ok(MemberRole::Admin),
            "moderator" => Ok(MemberRole::Moderator),
            "member" => Ok(MemberRole::Member),
            _ => Err(format!("Invalid member role: {}", s)),
        }
    }
}

impl MemberRole {
    fn rank(self) -> u8 {
        match self {
            MemberRole::Owner => 4,
            MemberRole::Admin => 3,
            MemberRole::Moderator => 2,
            MemberRole::Member => 1,
            MemberRole::Unknown => 0,
        }
    }

    /// Strictly higher in the owner > admin > moderator > member ladder
    pub fn outranks(self, other: MemberRole) -> bool {
        self.rank() > other.rank()
    }
}

/// A user's membership in one community; the sole source of truth for authorization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub community_id: String,
    pub user_id: String,
    pub role: MemberRole,
    #[serde(default)]
    pub permissions: PermissionSet,
    pub joined_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(community_id: String, user_id: String, role: MemberRole) -> Self {
        Self {
            community_id,
            user_id,
            role,
            permissions: PermissionSet::new(),
            joined_at: Utc::now(),
        }
    }

    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn is_owner(&self) -> bool {
        self.role == MemberRole::Owner
    }

    pub fn is_admin_or_owner(&self) -> bool {
        matches!(self.role, MemberRole::Owner | MemberRole::Admin)
    }

    /// Role defaults plus explicit grants
    pub fn has_permission(&self, permission: Permission) -> bool {
        security::has_permission(self.role, &self.permissions, permission)
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct MembershipRow {
    pub community_id: String,
    pub user_id: String,
    pub role: String,
    pub permissions_json: String,
    pub joined_at: i64,
}

impl From<MembershipRow> for Membership {
    fn from(row: MembershipRow) -> Self {
        let role = row.role.parse().unwrap_or_else(|_| {
            tracing::warn!(
                community_id = %row.community_id,
                user_id = %row.user_id,
                role = %row.role,
                "Unrecognized stored role, denying all permissions"
            );
            MemberRole::Unknown
        });
        Self {
            permissions: decode_permissions(&row.permissions_json),
            community_id: row.community_id,
            user_id: row.user_id,
            role,
            joined_at: super::from_millis(row.joined_at),
        }
    }
}

/// Decode a stored permission list, dropping tags this build does not know
pub(crate) fn decode_permissions(json: &str) -> PermissionSet {
    let names: Vec<String> = serde_json::from_str(json).unwrap_or_default();
    names
        .iter()
        .filter_map(|name| match name.parse::<Permission>() {
            Ok(p) => Some(p),
            Err(_) => {
                tracing::warn!(permission = %name, "Ignoring unknown stored permission");
                None
            }
        })
        .collect()
}

pub(crate) fn encode_permissions(permissions: &PermissionSet) -> String {
    let names: Vec<&str> = permissions.iter().map(|p| p.as_str()).collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}
