mod common;

use chrono::{Duration, Utc};
use common::{setup, setup_with, OWNER};
use oasis_core::models::{MemberRole, TokenType, INVITE_ACCEPTED};
use oasis_core::services::{AuditAction, AuditLogQuery, CodeGenerator, TimestampCodeGenerator};
use oasis_core::{InactiveReason, Oasis, OasisError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

fn assert_inactive(err: OasisError, expected: InactiveReason) {
    match err {
        OasisError::TokenInactive { reason } => assert_eq!(reason, expected),
        other => panic!("expected TokenInactive({:?}), got {:?}", expected, other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_never_exceed_ceiling() {
    let env = setup().await;
    let token = env
        .oasis
        .tokens
        .create_permanent_token(&env.community_id, OWNER, Some(3))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..12 {
        let tokens = env.oasis.tokens.clone();
        let community_id = env.community_id.clone();
        let code = token.code.clone();
        handles.push(tokio::spawn(async move {
            tokens
                .consume(&code, &community_id, &format!("invitee-{}", i))
                .await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert_inactive(e, InactiveReason::Exhausted),
        }
    }
    assert_eq!(accepted, 3);

    let stored = env.oasis.tokens.get_token(&token.id, &env.community_id).await.unwrap();
    assert_eq!(stored.current_uses, 3);
    assert_eq!(
        env.oasis.tokens.get_inviter_stats(OWNER, &env.community_id).await.unwrap(),
        3
    );
    let members = env.oasis.members.list_members(&env.community_id).await.unwrap();
    assert_eq!(members.len(), 4);
}

#[tokio::test]
async fn test_expired_token_is_inactive() {
    let env = setup().await;
    let token = env
        .oasis
        .tokens
        .create_temporary_token(&env.community_id, OWNER, 24, None)
        .await
        .unwrap();
    assert_eq!(token.token_type, TokenType::Temporary);
    assert!(token.is_active());

    env.set_expiry(&token.id, Utc::now() - Duration::minutes(1)).await;

    let err = env
        .oasis
        .tokens
        .consume(&token.code, &env.community_id, "late")
        .await
        .unwrap_err();
    assert_inactive(err, InactiveReason::Expired);

    let stored = env.oasis.tokens.get_token(&token.id, &env.community_id).await.unwrap();
    assert_eq!(stored.current_uses, 0);
    assert!(!stored.is_active());
    assert!(env
        .oasis
        .members
        .get_membership(&env.community_id, "late")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_disable_is_idempotent() {
    let env = setup().await;
    let token = env
        .oasis
        .tokens
        .create_permanent_token(&env.community_id, OWNER, None)
        .await
        .unwrap();

    env.oasis.tokens.disable(&token.id, &env.community_id, OWNER).await.unwrap();
    env.oasis.tokens.disable(&token.id, &env.community_id, OWNER).await.unwrap();

    let stored = env.oasis.tokens.get_token(&token.id, &env.community_id).await.unwrap();
    assert!(!stored.is_enabled);

    let err = env
        .oasis
        .tokens
        .consume(&token.code, &env.community_id, "guest")
        .await
        .unwrap_err();
    assert_inactive(err, InactiveReason::Disabled);

    let disables = env
        .oasis
        .audit
        .list_audit_logs(
            &env.community_id,
            OWNER,
            AuditLogQuery {
                action: Some(AuditAction::TokenDisable),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(disables.len(), 1);
}

#[tokio::test]
async fn test_regenerate_keeps_accounting() {
    let env = setup().await;
    let token = env
        .oasis
        .tokens
        .create_temporary_token(&env.community_id, OWNER, 48, Some(5))
        .await
        .unwrap();
    env.oasis
        .tokens
        .consume(&token.code, &env.community_id, "first")
        .await
        .unwrap();

    let new_code = env
        .oasis
        .tokens
        .regenerate_code(&token.id, &env.community_id, OWNER)
        .await
        .unwrap();
    assert_ne!(new_code, token.code);

    let err = env
        .oasis
        .tokens
        .resolve_code(&token.code, &env.community_id)
        .await
        .unwrap_err();
    assert!(matches!(err, OasisError::TokenNotFound(_)));
    let err = env
        .oasis
        .tokens
        .consume(&token.code, &env.community_id, "second")
        .await
        .unwrap_err();
    assert!(matches!(err, OasisError::TokenNotFound(_)));

    let stored = env.oasis.tokens.resolve_code(&new_code, &env.community_id).await.unwrap();
    assert_eq!(stored.id, token.id);
    assert_eq!(stored.code, new_code);
    assert_eq!(stored.current_uses, 1);
    assert_eq!(stored.max_uses, token.max_uses);
    assert_eq!(stored.token_type, token.token_type);
    assert_eq!(stored.expires_at, token.expires_at);
    assert_eq!(stored.is_enabled, token.is_enabled);
    assert_eq!(stored.created_at, token.created_at);
}

#[tokio::test]
async fn test_inviter_stats_match_invitees() {
    let env = setup().await;
    env.add_member("alice", MemberRole::Member).await;

    let a = env
        .oasis
        .tokens
        .create_permanent_token(&env.community_id, OWNER, None)
        .await
        .unwrap();
    let b = env
        .oasis
        .tokens
        .create_temporary_token(&env.community_id, OWNER, 1, None)
        .await
        .unwrap();
    let c = env
        .oasis
        .tokens
        .create_temporary_token(&env.community_id, "alice", 12, None)
        .await
        .unwrap();

    for (code, invitee) in [(&a.code, "u1"), (&b.code, "u2"), (&a.code, "u3"), (&c.code, "u4")] {
        env.oasis.tokens.consume(code, &env.community_id, invitee).await.unwrap();
    }

    for inviter in [OWNER, "alice", "nobody"] {
        let invitees = env
            .oasis
            .tokens
            .get_invitees_by_inviter(inviter, &env.community_id)
            .await
            .unwrap();
        let stats = env
            .oasis
            .tokens
            .get_inviter_stats(inviter, &env.community_id)
            .await
            .unwrap();
        assert_eq!(stats, invitees.len() as u64, "inviter {}", inviter);
        assert!(invitees.iter().all(|r| r.inviter_id == inviter));
        assert!(invitees.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    let owner_invitees = env
        .oasis
        .tokens
        .get_invitees_by_inviter(OWNER, &env.community_id)
        .await
        .unwrap();
    assert_eq!(owner_invitees.len(), 3);
}

#[tokio::test]
async fn test_temporary_token_end_to_end() {
    let env = setup().await;
    let token = env
        .oasis
        .tokens
        .create_temporary_token(&env.community_id, OWNER, 24, Some(2))
        .await
        .unwrap();
    let expires_at = token.expires_at.unwrap();
    assert_eq!(expires_at - token.created_at, Duration::hours(24));

    let first = env
        .oasis
        .tokens
        .consume(&token.code, &env.community_id, "guest-1")
        .await
        .unwrap();
    let second = env
        .oasis
        .tokens
        .consume_token(&token.id, &env.community_id, "guest-2")
        .await
        .unwrap();
    assert_eq!(first.inviter_id, OWNER);
    assert_eq!(second.token_id, token.id);

    let err = env
        .oasis
        .tokens
        .consume(&token.code, &env.community_id, "guest-3")
        .await
        .unwrap_err();
    assert_inactive(err, InactiveReason::Exhausted);

    env.oasis.tokens.disable(&token.id, &env.community_id, OWNER).await.unwrap();

    let analytics = env
        .oasis
        .tokens
        .get_token_usage_analytics(&token.id, &env.community_id)
        .await
        .unwrap();
    assert_eq!(analytics.records.len(), 2);
    assert_eq!(analytics.summary.total_uses, 2);
    assert_eq!(analytics.summary.current_uses, 2);
    assert_eq!(
        analytics.summary.last_used_at,
        Some(first.timestamp.max(second.timestamp))
    );

    let stored = env.oasis.tokens.get_token(&token.id, &env.community_id).await.unwrap();
    assert_eq!(stored.current_uses, 2);
    assert!(!stored.is_enabled);

    let guest = env
        .oasis
        .members
        .get_membership(&env.community_id, "guest-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guest.role, MemberRole::Member);
}

#[tokio::test]
async fn test_token_authorization() {
    let env = setup().await;
    env.add_member("admin", MemberRole::Admin).await;
    env.add_member("member", MemberRole::Member).await;
    env.add_member("other", MemberRole::Member).await;

    let err = env
        .oasis
        .tokens
        .create_permanent_token(&env.community_id, "member", None)
        .await
        .unwrap_err();
    assert!(matches!(err, OasisError::Unauthorized { .. }));

    let err = env
        .oasis
        .tokens
        .create_temporary_token(&env.community_id, "stranger", 24, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OasisError::Unauthorized { .. }));

    env.oasis
        .tokens
        .create_permanent_token(&env.community_id, "admin", None)
        .await
        .unwrap();
    let temp = env
        .oasis
        .tokens
        .create_temporary_token(&env.community_id, "member", 24, None)
        .await
        .unwrap();

    let err = env
        .oasis
        .tokens
        .disable(&temp.id, &env.community_id, "other")
        .await
        .unwrap_err();
    assert!(matches!(err, OasisError::Unauthorized { .. }));

    // admins hold manage_invites by default
    env.oasis
        .tokens
        .regenerate_code(&temp.id, &env.community_id, "admin")
        .await
        .unwrap();
    env.oasis
        .tokens
        .disable(&temp.id, &env.community_id, "member")
        .await
        .unwrap();

    env.oasis
        .members
        .set_member_permissions(&env.community_id, OWNER, "member", &["administrator"])
        .await
        .unwrap();
    env.oasis
        .tokens
        .create_permanent_token(&env.community_id, "member", Some(10))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_parameter_validation() {
    let env = setup().await;
    let tokens = &env.oasis.tokens;

    for hours in [0, 721] {
        let err = tokens
            .create_temporary_token(&env.community_id, OWNER, hours, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OasisError::Validation(_)), "hours {}", hours);
    }
    tokens
        .create_temporary_token(&env.community_id, OWNER, 720, None)
        .await
        .unwrap();

    for max_uses in [0, -1] {
        let err = tokens
            .create_permanent_token(&env.community_id, OWNER, Some(max_uses))
            .await
            .unwrap_err();
        assert!(matches!(err, OasisError::Validation(_)));
    }

    let err = tokens
        .create_permanent_token("missing", OWNER, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OasisError::CommunityNotFound(_)));
}

#[tokio::test]
async fn test_tokens_are_scoped_per_community() {
    let env = setup().await;
    let other = env
        .oasis
        .communities
        .create_community("Elsewhere", OWNER)
        .await
        .unwrap();
    let token = env
        .oasis
        .tokens
        .create_permanent_token(&env.community_id, OWNER, None)
        .await
        .unwrap();

    let err = env.oasis.tokens.resolve_code(&token.code, &other.id).await.unwrap_err();
    assert!(matches!(err, OasisError::TokenNotFound(_)));
    let err = env
        .oasis
        .tokens
        .consume(&token.code, &other.id, "guest")
        .await
        .unwrap_err();
    assert!(matches!(err, OasisError::TokenNotFound(_)));
    assert!(env.oasis.tokens.list_tokens(&other.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_consumption_counts_nothing() {
    let env = setup().await;
    env.add_member("existing", MemberRole::Member).await;
    let token = env
        .oasis
        .tokens
        .create_permanent_token(&env.community_id, OWNER, Some(5))
        .await
        .unwrap();

    let err = env
        .oasis
        .tokens
        .consume(&token.code, &env.community_id, "existing")
        .await
        .unwrap_err();
    assert!(matches!(err, OasisError::MemberExists { .. }));

    let err = env
        .oasis
        .tokens
        .consume(&token.code, &env.community_id, OWNER)
        .await
        .unwrap_err();
    assert!(matches!(err, OasisError::Validation(_)));

    let analytics = env
        .oasis
        .tokens
        .get_token_usage_analytics(&token.id, &env.community_id)
        .await
        .unwrap();
    assert_eq!(analytics.summary.current_uses, 0);
    assert!(analytics.records.is_empty());
    assert_eq!(analytics.summary.last_used_at, None);
}

#[tokio::test]
async fn test_self_invite_when_allowed() {
    let env = setup_with(|config| config.allow_self_invite = true).await;
    env.add_member("alice", MemberRole::Member).await;
    let token = env
        .oasis
        .tokens
        .create_temporary_token(&env.community_id, "alice", 1, None)
        .await
        .unwrap();
    env.oasis
        .members
        .remove_member(&env.community_id, "alice", "alice")
        .await
        .unwrap();

    // the token outlives its creator's membership
    let relation = env
        .oasis
        .tokens
        .consume(&token.code, &env.community_id, "alice")
        .await
        .unwrap();
    assert_eq!(relation.inviter_id, "alice");
    assert_eq!(relation.invitee_id, "alice");
}

#[tokio::test]
async fn test_join_notification_written() {
    let env = setup().await;
    let token = env
        .oasis
        .tokens
        .create_permanent_token(&env.community_id, OWNER, None)
        .await
        .unwrap();
    env.oasis
        .tokens
        .consume(&token.code, &env.community_id, "guest")
        .await
        .unwrap();

    let notifications = env
        .oasis
        .notifications
        .list_notifications(&env.community_id, OWNER)
        .await
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, INVITE_ACCEPTED);
    assert_eq!(notifications[0].payload["inviteeId"], "guest");
    assert_eq!(notifications[0].payload["tokenId"], token.id.as_str());
}

#[tokio::test]
async fn test_join_notification_can_be_switched_off() {
    let env = setup_with(|config| config.emit_join_notifications = false).await;
    let token = env
        .oasis
        .tokens
        .create_permanent_token(&env.community_id, OWNER, None)
        .await
        .unwrap();
    env.oasis
        .tokens
        .consume(&token.code, &env.community_id, "guest")
        .await
        .unwrap();
    assert!(env
        .oasis
        .notifications
        .list_notifications(&env.community_id, OWNER)
        .await
        .unwrap()
        .is_empty());
}

/// Hands out queued codes first, then falls back to generated ones
struct QueuedCodes(Mutex<VecDeque<String>>);

impl CodeGenerator for QueuedCodes {
    fn generate(&self) -> String {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TimestampCodeGenerator.generate())
    }
}

#[tokio::test]
async fn test_code_collision_draws_a_new_code() {
    let env = setup().await;
    let queued = ["taken", "taken", "fresh", "taken"].map(String::from);
    let oasis = env
        .oasis
        .clone()
        .with_code_generator(Arc::new(QueuedCodes(Mutex::new(VecDeque::from(queued)))));

    let first = oasis
        .tokens
        .create_permanent_token(&env.community_id, OWNER, None)
        .await
        .unwrap();
    assert_eq!(first.code, "taken");

    let second = oasis
        .tokens
        .create_permanent_token(&env.community_id, OWNER, None)
        .await
        .unwrap();
    assert_eq!(second.code, "fresh");

    // the same code is free in another community
    let other = oasis.communities.create_community("Elsewhere", OWNER).await.unwrap();
    let third = oasis.tokens.create_permanent_token(&other.id, OWNER, None).await.unwrap();
    assert_eq!(third.code, "taken");

    let tokens = oasis.tokens.list_tokens(&env.community_id).await.unwrap();
    assert_eq!(tokens.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expiry_is_checked_after_waiting_for_the_write_lock() {
    let env = setup().await;
    let token = env
        .oasis
        .tokens
        .create_temporary_token(&env.community_id, OWNER, 24, None)
        .await
        .unwrap();
    env.set_expiry(&token.id, Utc::now() + Duration::milliseconds(300)).await;

    // hold the write lock past the expiry
    let mut blocker = env.oasis.pool.begin().await.unwrap();
    sqlx::query("UPDATE invite_tokens SET is_enabled = is_enabled WHERE id = ?")
        .bind(&token.id)
        .execute(&mut *blocker)
        .await
        .unwrap();

    let tokens = env.oasis.tokens.clone();
    let community_id = env.community_id.clone();
    let code = token.code.clone();
    let pending =
        tokio::spawn(async move { tokens.consume(&code, &community_id, "late").await });

    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    blocker.commit().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert_inactive(err, InactiveReason::Expired);
    let stored = env.oasis.tokens.get_token(&token.id, &env.community_id).await.unwrap();
    assert_eq!(stored.current_uses, 0);
}

#[tokio::test]
async fn test_timed_out_and_cancelled_consumes_leave_no_partial_state() {
    let env = setup().await;
    let token = env
        .oasis
        .tokens
        .create_permanent_token(&env.community_id, OWNER, None)
        .await
        .unwrap();

    let mut accepted = 0;
    for i in 0..60u64 {
        let mut config = (*env.oasis.config).clone();
        config.operation_timeout_ms = i % 3;
        config.read_retry_attempts = 1;
        let hurried = Oasis::with_pool(env.oasis.pool.clone(), Arc::new(config));
        match hurried
            .tokens
            .consume(&token.code, &env.community_id, &format!("guest-{}", i))
            .await
        {
            Ok(_) => accepted += 1,
            Err(e) => assert!(e.is_retriable(), "unexpected error {:?}", e),
        }
    }

    // a timeout never fires after commit, so every success is counted and nothing else is
    let analytics = env
        .oasis
        .tokens
        .get_token_usage_analytics(&token.id, &env.community_id)
        .await
        .unwrap();
    assert_eq!(analytics.records.len(), accepted);
    assert_eq!(analytics.summary.current_uses as usize, accepted);

    for i in 0..10 {
        let tokens = env.oasis.tokens.clone();
        let community_id = env.community_id.clone();
        let code = token.code.clone();
        let handle = tokio::spawn(async move {
            tokens
                .consume(&code, &community_id, &format!("dropped-{}", i))
                .await
        });
        handle.abort();
        let _ = handle.await;
    }

    let analytics = env
        .oasis
        .tokens
        .get_token_usage_analytics(&token.id, &env.community_id)
        .await
        .unwrap();
    assert_eq!(analytics.summary.current_uses as usize, analytics.records.len());
    let members = env.oasis.members.list_members(&env.community_id).await.unwrap();
    assert_eq!(members.len(), analytics.records.len() + 1);

    let notifications = env
        .oasis
        .notifications
        .list_notifications(&env.community_id, OWNER)
        .await
        .unwrap();
    assert_eq!(notifications.len(), analytics.records.len());
}
