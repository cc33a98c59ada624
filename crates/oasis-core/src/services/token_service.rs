//! Invite token service - creation, consumption and usage accounting

use chrono::{Duration, Utc};
use sqlx::{Executor, Sqlite};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::OasisConfig;
use crate::error::{InactiveReason, OasisError, OasisResult};
use crate::models::{
    self, to_millis, InviteRelation, InviteRelationRow, InviteToken, MemberRole, Membership,
    TokenRow, TokenType, TokenUsageAnalytics, TokenUsageSummary, INVITE_ACCEPTED,
};
use crate::security::{self, validator, Action};
use crate::services::audit_service::{self, AuditAction};
use crate::services::{
    community_service, member_service, notification_service, store, DbPool,
};

/// Source of shareable invite codes
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Base-36 millisecond timestamp followed by 8 random base-62 characters
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampCodeGenerator;

impl CodeGenerator for TimestampCodeGenerator {
    fn generate(&self) -> String {
        use rand::Rng;
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut rng = rand::rng();
        let mut code = to_base36(Utc::now().timestamp_millis().max(0) as u64);
        code.extend((0..8).map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char));
        code
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// How a caller names a token inside a community
#[derive(Debug, Clone, Copy)]
enum TokenRef<'a> {
    Id(&'a str),
    Code(&'a str),
}

impl TokenRef<'_> {
    fn column(&self) -> &'static str {
        match self {
            TokenRef::Id(_) => "id",
            TokenRef::Code(_) => "code",
        }
    }

    fn value(&self) -> &str {
        match self {
            TokenRef::Id(v) | TokenRef::Code(v) => v,
        }
    }
}

async fn fetch_token<'e, E>(
    executor: E,
    community_id: &str,
    token: TokenRef<'_>,
) -> OasisResult<Option<InviteToken>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        r#"
        SELECT id, community_id, code, token_type, created_by, created_at, expires_at, is_enabled, max_uses, current_uses
        FROM invite_tokens
        WHERE community_id = ? AND {} = ?
        "#,
        token.column()
    );
    let row: Option<TokenRow> = sqlx::query_as(&sql)
        .bind(community_id)
        .bind(token.value())
        .fetch_optional(executor)
        .await?;
    row.map(InviteToken::try_from).transpose()
}

async fn fetch_relations<'e, E>(
    executor: E,
    community_id: &str,
    token_id: &str,
) -> OasisResult<Vec<InviteRelation>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<InviteRelationRow> = sqlx::query_as(
        r#"
        SELECT id, community_id, token_id, inviter_id, invitee_id, timestamp
        FROM invite_relations
        WHERE community_id = ? AND token_id = ?
        ORDER BY timestamp DESC, invitee_id ASC
        "#,
    )
    .bind(community_id)
    .bind(token_id)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(InviteRelation::from).collect())
}

fn not_found(token: TokenRef<'_>) -> OasisError {
    OasisError::TokenNotFound(token.value().to_string())
}

/// Token service
#[derive(Clone)]
pub struct TokenService {
    pool: DbPool,
    config: Arc<OasisConfig>,
    codes: Arc<dyn CodeGenerator>,
}

impl TokenService {
    pub fn new(pool: DbPool, config: Arc<OasisConfig>) -> Self {
        Self::with_code_generator(pool, config, Arc::new(TimestampCodeGenerator))
    }

    pub fn with_code_generator(
        pool: DbPool,
        config: Arc<OasisConfig>,
        codes: Arc<dyn CodeGenerator>,
    ) -> Self {
        Self { pool, config, codes }
    }

    async fn membership(&self, community_id: &str, user_id: &str) -> OasisResult<Option<Membership>> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "get_membership", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            member_service::fetch_membership(pool, community_id, user_id).await
        })
        .await
    }

    /// Create a permanent token. Requires owner/admin or an explicit administrator grant.
    pub async fn create_permanent_token(
        &self,
        community_id: &str,
        creator_id: &str,
        max_uses: Option<i64>,
    ) -> OasisResult<InviteToken> {
        validator::validate_id("creatorId", creator_id)?;
        validator::validate_max_uses(max_uses)?;
        let creator = self.membership(community_id, creator_id).await?;
        if let Err(e) = security::require(creator.as_ref(), Action::CreatePermanentToken) {
            warn!(community_id = %community_id, user_id = %creator_id, "Permanent token creation denied");
            return Err(e);
        }

        let mut token = self.new_token(community_id, creator_id, TokenType::Permanent, None, max_uses);
        self.insert_token(&mut token).await?;
        Ok(token)
    }

    /// Create a token expiring `duration_hours` from now. Any member may do this.
    pub async fn create_temporary_token(
        &self,
        community_id: &str,
        creator_id: &str,
        duration_hours: u32,
        max_uses: Option<i64>,
    ) -> OasisResult<InviteToken> {
        validator::validate_id("creatorId", creator_id)?;
        validator::validate_duration_hours(duration_hours)?;
        validator::validate_max_uses(max_uses)?;
        let creator = self.membership(community_id, creator_id).await?;
        if let Err(e) = security::require(creator.as_ref(), Action::CreateTemporaryToken) {
            warn!(community_id = %community_id, user_id = %creator_id, "Temporary token creation denied");
            return Err(e);
        }

        let mut token = self.new_token(
            community_id,
            creator_id,
            TokenType::Temporary,
            Some(Duration::hours(i64::from(duration_hours))),
            max_uses,
        );
        self.insert_token(&mut token).await?;
        Ok(token)
    }

    fn new_token(
        &self,
        community_id: &str,
        creator_id: &str,
        token_type: TokenType,
        lifetime: Option<Duration>,
        max_uses: Option<i64>,
    ) -> InviteToken {
        let now = models::now();
        InviteToken {
            id: uuid::Uuid::new_v4().to_string(),
            community_id: community_id.to_string(),
            code: self.codes.generate(),
            token_type,
            created_by: creator_id.to_string(),
            created_at: now,
            expires_at: lifetime.map(|d| now + d),
            is_enabled: true,
            max_uses,
            current_uses: 0,
        }
    }

    /// Insert a new token, drawing a fresh code whenever the current one is taken
    async fn insert_token(&self, token: &mut InviteToken) -> OasisResult<()> {
        let attempts = self.config.code_collision_retries.max(1);
        for attempt in 1..=attempts {
            let inserted = store::bounded(&self.config, async {
                let mut tx = self.pool.begin().await?;
                let result = sqlx::query(
                    r#"
                    INSERT INTO invite_tokens (id, community_id, code, token_type, created_by, created_at, expires_at, is_enabled, max_uses, current_uses)
                    VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, 0)
                    "#,
                )
                .bind(&token.id)
                .bind(&token.community_id)
                .bind(&token.code)
                .bind(token.token_type.to_string())
                .bind(&token.created_by)
                .bind(to_millis(token.created_at))
                .bind(token.expires_at.map(to_millis))
                .bind(token.max_uses)
                .execute(&mut *tx)
                .await;

                match result {
                    Ok(_) => {}
                    Err(e) if store::is_unique_violation(&e) => return Ok(None),
                    Err(e) => return Err(e.into()),
                }

                audit_service::record(
                    &mut tx,
                    &token.community_id,
                    &token.created_by,
                    AuditAction::TokenCreate,
                    Some(("invite_token", token.id.as_str())),
                    serde_json::json!({
                        "type": token.token_type.to_string(),
                        "maxUses": token.max_uses,
                        "expiresAt": token.expires_at.map(to_millis),
                    }),
                )
                .await?;
                Ok(Some(tx))
            })
            .await?;

            if let Some(tx) = inserted {
                tx.commit().await?;
                info!(
                    community_id = %token.community_id,
                    token_id = %token.id,
                    token_type = %token.token_type,
                    "Invite token created"
                );
                return Ok(());
            }
            warn!(community_id = %token.community_id, attempt, "Invite code collision, regenerating");
            token.code = self.codes.generate();
        }

        Err(OasisError::Internal(format!(
            "no unique invite code after {} attempts",
            attempts
        )))
    }

    /// Load a token and check that `actor_id` may manage it
    async fn managed_token(
        &self,
        token_id: &str,
        community_id: &str,
        actor_id: &str,
    ) -> OasisResult<InviteToken> {
        let token = self.get_token(token_id, community_id).await?;
        let actor = self.membership(community_id, actor_id).await?;
        if let Err(e) = security::require(
            actor.as_ref(),
            Action::ManageToken {
                creator_id: &token.created_by,
            },
        ) {
            warn!(community_id = %community_id, token_id = %token_id, user_id = %actor_id, "Token management denied");
            return Err(e);
        }
        Ok(token)
    }

    /// Replace the shareable code. Usage counters and every other field stay as they were.
    pub async fn regenerate_code(
        &self,
        token_id: &str,
        community_id: &str,
        actor_id: &str,
    ) -> OasisResult<String> {
        self.managed_token(token_id, community_id, actor_id).await?;

        let attempts = self.config.code_collision_retries.max(1);
        for attempt in 1..=attempts {
            let code = self.codes.generate();
            let replaced = store::bounded(&self.config, async {
                let mut tx = self.pool.begin().await?;
                let result = sqlx::query(
                    "UPDATE invite_tokens SET code = ? WHERE community_id = ? AND id = ?",
                )
                .bind(&code)
                .bind(community_id)
                .bind(token_id)
                .execute(&mut *tx)
                .await;

                let result = match result {
                    Ok(result) => result,
                    Err(e) if store::is_unique_violation(&e) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                if result.rows_affected() == 0 {
                    return Err(OasisError::TokenNotFound(token_id.to_string()));
                }

                audit_service::record(
                    &mut tx,
                    community_id,
                    actor_id,
                    AuditAction::TokenRegenerate,
                    Some(("invite_token", token_id)),
                    serde_json::json!({}),
                )
                .await?;
                Ok(Some(tx))
            })
            .await?;

            if let Some(tx) = replaced {
                tx.commit().await?;
                info!(community_id = %community_id, token_id = %token_id, "Invite code regenerated");
                return Ok(code);
            }
            warn!(community_id = %community_id, token_id = %token_id, attempt, "Invite code collision, regenerating");
        }

        Err(OasisError::Internal(format!(
            "no unique invite code after {} attempts",
            attempts
        )))
    }

    /// Disable a token for good. Disabling a disabled token succeeds without change.
    pub async fn disable(&self, token_id: &str, community_id: &str, actor_id: &str) -> OasisResult<()> {
        self.managed_token(token_id, community_id, actor_id).await?;

        let (tx, changed) = store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                "UPDATE invite_tokens SET is_enabled = 0 WHERE community_id = ? AND id = ? AND is_enabled = 1",
            )
            .bind(community_id)
            .bind(token_id)
            .execute(&mut *tx)
            .await?;

            let changed = result.rows_affected() > 0;
            if changed {
                audit_service::record(
                    &mut tx,
                    community_id,
                    actor_id,
                    AuditAction::TokenDisable,
                    Some(("invite_token", token_id)),
                    serde_json::json!({}),
                )
                .await?;
            }
            Ok((tx, changed))
        })
        .await?;
        tx.commit().await?;

        if changed {
            info!(community_id = %community_id, token_id = %token_id, "Invite token disabled");
        } else {
            debug!(community_id = %community_id, token_id = %token_id, "Invite token already disabled");
        }
        Ok(())
    }

    /// Consume a token by its current code
    pub async fn consume(
        &self,
        code: &str,
        community_id: &str,
        invitee_id: &str,
    ) -> OasisResult<InviteRelation> {
        self.consume_ref(TokenRef::Code(code), community_id, invitee_id).await
    }

    /// Consume a token by id
    pub async fn consume_token(
        &self,
        token_id: &str,
        community_id: &str,
        invitee_id: &str,
    ) -> OasisResult<InviteRelation> {
        self.consume_ref(TokenRef::Id(token_id), community_id, invitee_id).await
    }

    /// The guarded increment is the first statement of the transaction, so a
    /// concurrent consumer waits on the write lock and then re-evaluates the
    /// activity predicate against the committed counter. Expiry is compared
    /// with the database clock at that point, not with the time the call began.
    async fn consume_ref(
        &self,
        token: TokenRef<'_>,
        community_id: &str,
        invitee_id: &str,
    ) -> OasisResult<InviteRelation> {
        validator::validate_id("inviteeId", invitee_id)?;
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "get_community", move || async move {
            community_service::ensure_community(pool, community_id).await
        })
        .await?;

        let update_sql = format!(
            r#"
            UPDATE invite_tokens
            SET current_uses = current_uses + 1
            WHERE community_id = ? AND {} = ?
              AND is_enabled = 1
              AND (token_type = 'permanent'
                   OR expires_at > CAST(ROUND((julianday('now') - 2440587.5) * 86400000.0) AS INTEGER))
              AND (max_uses IS NULL OR current_uses < max_uses)
            RETURNING id, created_by
            "#,
            token.column()
        );

        let result = store::bounded(&self.config, async {
            let mut tx = self.pool.begin().await?;

            let claimed: Option<(String, String)> = sqlx::query_as(&update_sql)
                .bind(community_id)
                .bind(token.value())
                .fetch_optional(&mut *tx)
                .await?;
            let now = models::now();

            let (token_id, inviter_id) = match claimed {
                Some(claimed) => claimed,
                None => {
                    let current = fetch_token(&mut *tx, community_id, token).await?;
                    return Err(match current {
                        None => not_found(token),
                        Some(t) => OasisError::TokenInactive {
                            reason: t.inactive_reason_at(now).unwrap_or(InactiveReason::Exhausted),
                        },
                    });
                }
            };

            if inviter_id == invitee_id && !self.config.allow_self_invite {
                return Err(OasisError::Validation(
                    "Cannot accept your own invite token".to_string(),
                ));
            }

            let membership = Membership {
                joined_at: now,
                ..Membership::new(community_id.to_string(), invitee_id.to_string(), MemberRole::Member)
            };
            member_service::insert_membership(&mut tx, &membership).await?;

            let relation = InviteRelation {
                id: uuid::Uuid::new_v4().to_string(),
                community_id: community_id.to_string(),
                token_id,
                inviter_id,
                invitee_id: invitee_id.to_string(),
                timestamp: now,
            };
            sqlx::query(
                r#"
                INSERT INTO invite_relations (id, community_id, token_id, inviter_id, invitee_id, timestamp)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&relation.id)
            .bind(&relation.community_id)
            .bind(&relation.token_id)
            .bind(&relation.inviter_id)
            .bind(&relation.invitee_id)
            .bind(to_millis(relation.timestamp))
            .execute(&mut *tx)
            .await?;

            if self.config.emit_join_notifications {
                notification_service::insert_notification(
                    &mut tx,
                    community_id,
                    &relation.inviter_id,
                    INVITE_ACCEPTED,
                    &serde_json::json!({
                        "inviteeId": relation.invitee_id,
                        "tokenId": relation.token_id,
                    }),
                    now,
                )
                .await?;
            }

            Ok((tx, relation))
        })
        .await;

        let result = match result {
            Ok((tx, relation)) => tx.commit().await.map(|_| relation).map_err(OasisError::from),
            Err(e) => Err(e),
        };

        match &result {
            Ok(relation) => info!(
                community_id = %community_id,
                token_id = %relation.token_id,
                user_id = %invitee_id,
                "Invite token consumed"
            ),
            Err(e) => warn!(
                community_id = %community_id,
                token = %token.value(),
                user_id = %invitee_id,
                error = %e,
                "Invite token consumption rejected"
            ),
        }
        result
    }

    pub async fn get_token(&self, token_id: &str, community_id: &str) -> OasisResult<InviteToken> {
        self.lookup(TokenRef::Id(token_id), community_id).await
    }

    /// Resolve a shareable code to its token. Replaced codes no longer resolve.
    pub async fn resolve_code(&self, code: &str, community_id: &str) -> OasisResult<InviteToken> {
        self.lookup(TokenRef::Code(code), community_id).await
    }

    async fn lookup(&self, token: TokenRef<'_>, community_id: &str) -> OasisResult<InviteToken> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "get_token", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            fetch_token(pool, community_id, token)
                .await?
                .ok_or_else(|| not_found(token))
        })
        .await
    }

    /// Tokens of a community, newest first
    pub async fn list_tokens(&self, community_id: &str) -> OasisResult<Vec<InviteToken>> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "list_tokens", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            let rows: Vec<TokenRow> = sqlx::query_as(
                r#"
                SELECT id, community_id, code, token_type, created_by, created_at, expires_at, is_enabled, max_uses, current_uses
                FROM invite_tokens
                WHERE community_id = ?
                ORDER BY created_at DESC, id ASC
                "#,
            )
            .bind(community_id)
            .fetch_all(pool)
            .await?;
            rows.into_iter().map(InviteToken::try_from).collect()
        })
        .await
    }

    /// Everyone `inviter_id` brought in, most recent first
    pub async fn get_invitees_by_inviter(
        &self,
        inviter_id: &str,
        community_id: &str,
    ) -> OasisResult<Vec<InviteRelation>> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "get_invitees_by_inviter", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            let rows: Vec<InviteRelationRow> = sqlx::query_as(
                r#"
                SELECT id, community_id, token_id, inviter_id, invitee_id, timestamp
                FROM invite_relations
                WHERE community_id = ? AND inviter_id = ?
                ORDER BY timestamp DESC, token_id ASC, invitee_id ASC
                "#,
            )
            .bind(community_id)
            .bind(inviter_id)
            .fetch_all(pool)
            .await?;
            Ok(rows.into_iter().map(InviteRelation::from).collect())
        })
        .await
    }

    /// Same predicate as `get_invitees_by_inviter`, counted
    pub async fn get_inviter_stats(&self, inviter_id: &str, community_id: &str) -> OasisResult<u64> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "get_inviter_stats", move || async move {
            community_service::ensure_community(pool, community_id).await?;
            let count: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM invite_relations WHERE community_id = ? AND inviter_id = ?",
            )
            .bind(community_id)
            .bind(inviter_id)
            .fetch_one(pool)
            .await?;
            Ok(count.0.max(0) as u64)
        })
        .await
    }

    /// Usage records of one token with the derived summary, read from one snapshot
    pub async fn get_token_usage_analytics(
        &self,
        token_id: &str,
        community_id: &str,
    ) -> OasisResult<TokenUsageAnalytics> {
        let pool = self.pool.as_ref();
        store::read_with_retry(&self.config, "get_token_usage_analytics", move || async move {
            let mut tx = pool.begin().await?;
            community_service::ensure_community(&mut *tx, community_id).await?;
            let token = fetch_token(&mut *tx, community_id, TokenRef::Id(token_id))
                .await?
                .ok_or_else(|| OasisError::TokenNotFound(token_id.to_string()))?;
            let records = fetch_relations(&mut *tx, community_id, token_id).await?;
            tx.commit().await?;

            if records.len() as i64 != token.current_uses {
                warn!(
                    token_id = %token_id,
                    current_uses = token.current_uses,
                    records = records.len(),
                    "Usage counter and relation log disagree"
                );
            }
            Ok(TokenUsageAnalytics {
                summary: TokenUsageSummary::from_records(token_id, token.current_uses, &records),
                records,
            })
        })
        .await
    }
}
