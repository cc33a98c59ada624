//! Invite token model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{InactiveReason, OasisError};

/// Token lifetime class, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Permanent,
    Temporary,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::Permanent => write!(f, "permanent"),
            TokenType::Temporary => write!(f, "temporary"),
        }
    }
}

impl std::str::FromStr for TokenType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent" => Ok(TokenType::Permanent),
            "temporary" => Ok(TokenType::Temporary),
            _ => Err(format!("Invalid token type: {}", s)),
        }
    }
}

/// Invite capability scoped to a community
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteToken {
    pub id: String,
    pub community_id: String,
    /// Shareable code, unique within the community
    pub code: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Present only for temporary tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_enabled: bool,
    /// `None` means unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<i64>,
    pub current_uses: i64,
}

impl InviteToken {
    /// Why the token cannot be consumed at `now`, if it cannot
    pub fn inactive_reason_at(&self, now: DateTime<Utc>) -> Option<InactiveReason> {
        if !self.is_enabled {
            return Some(InactiveReason::Disabled);
        }
        if self.token_type == TokenType::Temporary {
            match self.expires_at {
                Some(expires_at) if now < expires_at => {}
                _ => return Some(InactiveReason::Expired),
            }
        }
        if let Some(max_uses) = self.max_uses {
            if self.current_uses >= max_uses {
                return Some(InactiveReason::Exhausted);
            }
        }
        None
    }

    /// enabled, not expired, under the use ceiling
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.inactive_reason_at(now).is_none()
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    pub fn remaining_uses(&self) -> Option<i64> {
        self.max_uses.map(|m| (m - self.current_uses).max(0))
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TokenRow {
    pub id: String,
    pub community_id: String,
    pub code: String,
    pub token_type: String,
    pub created_by: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub is_enabled: bool,
    pub max_uses: Option<i64>,
    pub current_uses: i64,
}

impl TryFrom<TokenRow> for InviteToken {
    type Error = OasisError;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        let token_type = row.token_type.parse().map_err(OasisError::Database)?;
        Ok(Self {
            id: row.id,
            community_id: row.community_id,
            code: row.code,
            token_type,
            created_by: row.created_by,
            created_at: super::from_millis(row.created_at),
            expires_at: row.expires_at.map(super::from_millis),
            is_enabled: row.is_enabled,
            max_uses: row.max_uses,
            current_uses: row.current_uses,
        })
    }
}
