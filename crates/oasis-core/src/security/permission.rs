//! Role and permission resolution
//!
//! Authorization is recomputed from the stored membership on every call;
//! nothing here caches a decision.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{OasisError, OasisResult};
use crate::models::{MemberRole, Membership};

/// Capability tags gating privileged actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Administrator,
    ManageCommunity,
    ManageRoles,
    ManageChannels,
    ManageInvites,
    KickMembers,
    BanMembers,
    ManageMessages,
    ViewAuditLog,
    CreatePosts,
    ViewChannels,
}

/// Explicit permission grants carried by a membership or role definition
pub type PermissionSet = BTreeSet<Permission>;

impl Permission {
    pub const ALL: [Permission; 11] = [
        Permission::Administrator,
        Permission::ManageCommunity,
        Permission::ManageRoles,
        Permission::ManageChannels,
        Permission::ManageInvites,
        Permission::KickMembers,
        Permission::BanMembers,
        Permission::ManageMessages,
        Permission::ViewAuditLog,
        Permission::CreatePosts,
        Permission::ViewChannels,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Administrator => "administrator",
            Permission::ManageCommunity => "manage_community",
            Permission::ManageRoles => "manage_roles",
            Permission::ManageChannels => "manage_channels",
            Permission::ManageInvites => "manage_invites",
            Permission::KickMembers => "kick_members",
            Permission::BanMembers => "ban_members",
            Permission::ManageMessages => "manage_messages",
            Permission::ViewAuditLog => "view_audit_log",
            Permission::CreatePosts => "create_posts",
            Permission::ViewChannels => "view_channels",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("Invalid permission: {}", s))
    }
}

// Admins get everything except the two ownership-equivalent capabilities
const ADMIN_DEFAULTS: &[Permission] = &[
    Permission::ManageCommunity,
    Permission::ManageChannels,
    Permission::ManageInvites,
    Permission::KickMembers,
    Permission::BanMembers,
    Permission::ManageMessages,
    Permission::ViewAuditLog,
    Permission::CreatePosts,
    Permission::ViewChannels,
];

const MODERATOR_DEFAULTS: &[Permission] = &[
    Permission::KickMembers,
    Permission::BanMembers,
    Permission::ManageMessages,
    Permission::ViewAuditLog,
];

const MEMBER_DEFAULTS: &[Permission] = &[Permission::CreatePosts, Permission::ViewChannels];

/// Default permission table for a built-in role. Owner is total and not table-driven.
pub fn default_permissions(role: MemberRole) -> &'static [Permission] {
    match role {
        MemberRole::Owner => &Permission::ALL,
        MemberRole::Admin => ADMIN_DEFAULTS,
        MemberRole::Moderator => MODERATOR_DEFAULTS,
        MemberRole::Member => MEMBER_DEFAULTS,
        MemberRole::Unknown => &[],
    }
}

/// Coarse check by role alone. Never grants `administrator`/`manage_roles` to non-owners.
pub fn role_grants(role: MemberRole, permission: Permission) -> bool {
    role == MemberRole::Owner || default_permissions(role).contains(&permission)
}

/// Fine-grained check: role defaults plus explicit grants.
///
/// An explicit `administrator` grant satisfies every check, including
/// `administrator` and `manage_roles` themselves. An unrecognised role is
/// denied regardless of its grants.
pub fn has_permission(role: MemberRole, explicit: &PermissionSet, permission: Permission) -> bool {
    if role == MemberRole::Unknown {
        return false;
    }
    role_grants(role, permission)
        || explicit.contains(&permission)
        || explicit.contains(&Permission::Administrator)
}

/// String entry point; unrecognised roles or permissions are denied
pub fn has_permission_named(role: &str, explicit: &[&str], permission: &str) -> bool {
    let (Ok(role), Ok(permission)) = (role.parse::<MemberRole>(), permission.parse::<Permission>())
    else {
        return false;
    };
    let explicit: PermissionSet = explicit.iter().filter_map(|p| p.parse().ok()).collect();
    has_permission(role, &explicit, permission)
}

/// Role of a caller given their (possibly missing) membership
pub fn resolve_role(membership: Option<&Membership>) -> MemberRole {
    membership.map(|m| m.role).unwrap_or_default()
}

/// Coarse UI areas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tab {
    Owner,
    Admin,
    Moderation,
    Community,
}

impl std::str::FromStr for Tab {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Tab::Owner),
            "admin" => Ok(Tab::Admin),
            "moderation" => Ok(Tab::Moderation),
            "community" => Ok(Tab::Community),
            _ => Err(format!("Unknown tab: {}", s)),
        }
    }
}

pub fn can_access_tab(role: MemberRole, tab: Tab) -> bool {
    match tab {
        Tab::Owner => role == MemberRole::Owner,
        Tab::Admin => matches!(role, MemberRole::Owner | MemberRole::Admin),
        Tab::Moderation => matches!(
            role,
            MemberRole::Owner | MemberRole::Admin | MemberRole::Moderator
        ),
        Tab::Community => true,
    }
}

/// Default-deny for unknown tab names
pub fn can_access_tab_named(role: MemberRole, tab: &str) -> bool {
    tab.parse::<Tab>()
        .map(|tab| can_access_tab(role, tab))
        .unwrap_or(false)
}

/// Privileged operations enforced inside the services
#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    CreatePermanentToken,
    CreateTemporaryToken,
    ManageToken { creator_id: &'a str },
    ManageMembers,
    RemoveMember { target: &'a Membership },
    ManageRoles,
    GrantAdministrator,
    ViewAuditLog,
}

impl std::fmt::Display for Action<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::CreatePermanentToken => write!(f, "create permanent invite tokens"),
            Action::CreateTemporaryToken => write!(f, "create invite tokens"),
            Action::ManageToken { .. } => write!(f, "manage this invite token"),
            Action::ManageMembers => write!(f, "manage members"),
            Action::RemoveMember { .. } => write!(f, "remove this member"),
            Action::ManageRoles => write!(f, "manage roles"),
            Action::GrantAdministrator => write!(f, "grant administrator"),
            Action::ViewAuditLog => write!(f, "view the audit log"),
        }
    }
}

/// Check if a member can perform an action
pub fn check_permission(member: &Membership, action: Action<'_>) -> bool {
    if member.role == MemberRole::Unknown {
        return false;
    }
    match action {
        Action::CreatePermanentToken => {
            member.is_admin_or_owner() || member.permissions.contains(&Permission::Administrator)
        }
        Action::CreateTemporaryToken => true,
        Action::ManageToken { creator_id } => {
            member.user_id == creator_id || member.has_permission(Permission::ManageInvites)
        }
        Action::ManageMembers | Action::ManageRoles => member.has_permission(Permission::ManageRoles),
        Action::RemoveMember { target } => {
            if member.user_id == target.user_id {
                // leaving; the owner has to stay
                !target.is_owner()
            } else {
                member.has_permission(Permission::KickMembers) && member.role.outranks(target.role)
            }
        }
        Action::GrantAdministrator => member.is_owner(),
        Action::ViewAuditLog => member.has_permission(Permission::ViewAuditLog),
    }
}

/// Fail with `Unauthorized` unless the caller is a member allowed to perform `action`
pub fn require(membership: Option<&Membership>, action: Action<'_>) -> OasisResult<()> {
    match membership {
        Some(member) if check_permission(member, action) => Ok(()),
        _ => Err(OasisError::unauthorized(permission_denied_message(action))),
    }
}

/// Permission denied error message
pub fn permission_denied_message(action: Action<'_>) -> String {
    format!("You don't have permission to {}", action)
}
