// tests/batch_orchestrator.rs
//
// End-to-end orchestrator behavior over the in-memory store:
// - page exhaustion and the resumption cursor
// - rule / pattern / history decisions and stored annotations
// - race conflicts reported, never thrown
// - deadline, per-item errors, transient store failures and the circuit breaker

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use inbound_spam_classifier::analyze::{Rule, RuleMode};
use inbound_spam_classifier::config::EngineConfig;
use inbound_spam_classifier::engine::Engine;
use inbound_spam_classifier::error::EngineError;
use inbound_spam_classifier::model::{LearningSource, MessageId, NewMessage};
use inbound_spam_classifier::status::MessageStatus;
use inbound_spam_classifier::store::{MemoryStore, MessageStore};

fn base_ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn fast_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.store.retry_base_ms = 1;
    cfg.store.retry_max_ms = 2;
    cfg
}

fn setup(cfg: EngineConfig) -> (Arc<MemoryStore>, Engine) {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store.clone(), cfg);
    (store, engine)
}

async fn add(engine: &Engine, i: i64, text: &str, brand: Option<&str>) -> MessageId {
    engine
        .ingest(NewMessage {
            phone: format!("+1555000{i:04}"),
            brand: brand.map(str::to_string),
            text: text.to_string(),
            created_at: base_ts() - Duration::seconds(i),
        })
        .await
        .expect("ingest")
        .id
}

#[tokio::test]
async fn page_exhaustion_reports_complete_and_zero_remaining() {
    let (_store, engine) = setup(fast_config());
    for i in 0..150 {
        add(&engine, i, &format!("Hi, I have a question about invoice {i}"), None).await;
    }

    let out = engine.process_batch(0, 200).await.unwrap();
    assert_eq!(out.processed, 150);
    assert_eq!(out.matched, 0);
    assert!(out.complete);
    assert_eq!(out.remaining, 0);
    assert_eq!(out.next_skip, 150);
    assert!(!out.deadline_hit);
}

#[tokio::test]
async fn cursor_accounts_for_moved_items() {
    let (_store, engine) = setup(fast_config());
    for i in 0..30 {
        let text = if i % 3 == 0 { "STOP".to_string() } else { format!("where is my parcel {i}") };
        add(&engine, i, &text, None).await;
    }

    let first = engine.process_batch(0, 12).await.unwrap();
    assert_eq!(first.processed, 12);
    assert_eq!(first.matched, 4);
    assert!(!first.complete);
    assert_eq!(first.next_skip, 8);
    assert_eq!(first.remaining, 26 - 8);

    let second = engine.process_batch(first.next_skip, 100).await.unwrap();
    assert!(second.complete);
    assert_eq!(second.matched, 6);
    assert_eq!(second.remaining, 0);
}

#[tokio::test]
async fn unsubscribe_rule_flags_and_annotates() {
    let (store, engine) = setup(fast_config());
    engine
        .upsert_rule(Rule::new("unsubscribe", RuleMode::Contains))
        .await
        .unwrap();
    let spam = add(&engine, 1, "Please UNSUBSCRIBE me now", None).await;
    let ham = add(&engine, 2, "Can you resend my receipt from Tuesday?", None).await;

    let out = engine.process_batch(0, 10).await.unwrap();
    assert_eq!(out.matched, 1);

    let m = store.get_message(spam).await.unwrap().unwrap();
    assert_eq!(m.status, MessageStatus::Review);
    assert_eq!(m.annotations, vec!["rule: \"unsubscribe\"".to_string()]);

    let h = store.get_message(ham).await.unwrap().unwrap();
    assert_eq!(h.status, MessageStatus::Pending);
    assert!(h.annotations.is_empty());
}

#[tokio::test]
async fn brand_scoped_rule_ignores_other_brands() {
    let (store, engine) = setup(fast_config());
    engine
        .upsert_rule(Rule::new("promo code", RuleMode::Contains).for_brand("Acme"))
        .await
        .unwrap();
    let acme = add(&engine, 1, "send me the promo code please", Some("ACME")).await;
    let other = add(&engine, 2, "send me the promo code please", Some("Globex")).await;

    engine.process_batch(0, 10).await.unwrap();
    assert_eq!(store.get_message(acme).await.unwrap().unwrap().status, MessageStatus::Review);
    assert_eq!(store.get_message(other).await.unwrap().unwrap().status, MessageStatus::Pending);
}

#[tokio::test]
async fn lone_command_word_matches_by_pattern() {
    let (store, engine) = setup(fast_config());
    let id = add(&engine, 1, "STOP", None).await;
    let out = engine.process_batch(0, 10).await.unwrap();
    assert_eq!(out.matched, 1);
    let m = store.get_message(id).await.unwrap().unwrap();
    assert!(m.annotations[0].starts_with("pattern: "), "{:?}", m.annotations);
    assert!(m.annotations[0].contains("single command word"));
}

#[tokio::test]
async fn learned_history_flags_what_rules_miss() {
    let (store, engine) = setup(fast_config());
    for _ in 0..4 {
        engine
            .learning()
            .learn_from_spam_decision("are you a real person", true, None, LearningSource::Manual)
            .await
            .unwrap();
    }
    let id = add(&engine, 1, "Are you a REAL person?", None).await;
    let fresh = add(&engine, 2, "my package never arrived", None).await;

    let out = engine.process_batch(0, 10).await.unwrap();
    assert_eq!(out.matched, 1);
    let m = store.get_message(id).await.unwrap().unwrap();
    assert_eq!(m.status, MessageStatus::Review);
    assert!(m.annotations[0].starts_with("history: 67"), "{:?}", m.annotations);
    assert_eq!(store.get_message(fresh).await.unwrap().unwrap().status, MessageStatus::Pending);
}

#[tokio::test]
async fn race_with_another_processor_is_counted_not_thrown() {
    let (store, engine) = setup(fast_config());
    let a = add(&engine, 1, "STOP", None).await;
    let b = add(&engine, 2, "QUIT", None).await;
    let c = add(&engine, 3, "CANCEL", None).await;
    store.interleave_before_next_transition(vec![b], MessageStatus::Promoted);

    let out = engine.process_batch(0, 10).await.unwrap();
    assert_eq!(out.processed, 3);
    assert_eq!(out.matched, 2);
    assert_eq!(out.conflicts, 1);
    assert_eq!(out.next_skip, 0);
    assert!(out.complete);

    assert_eq!(store.get_message(a).await.unwrap().unwrap().status, MessageStatus::Review);
    assert_eq!(store.get_message(b).await.unwrap().unwrap().status, MessageStatus::Promoted);
    assert_eq!(store.get_message(c).await.unwrap().unwrap().status, MessageStatus::Review);
}

#[tokio::test]
async fn committed_write_with_lost_reply_counts_as_matched() {
    let (store, engine) = setup(fast_config());
    let a = add(&engine, 1, "STOP", None).await;
    let c = add(&engine, 2, "CANCEL", None).await;
    store.commit_then_fail_next_write();

    let out = engine.process_batch(0, 10).await.unwrap();
    assert_eq!(out.matched, 2);
    assert_eq!(out.conflicts, 0);
    assert_eq!(out.errored, 0);
    assert_eq!(out.next_skip, 0);

    for id in [a, c] {
        let m = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(m.status, MessageStatus::Review);
        assert!(!m.annotations.is_empty());
        assert!(m.annotations.iter().all(|n| n.starts_with("pattern: ")), "{:?}", m.annotations);
    }
}

#[tokio::test]
async fn restore_continues_past_a_chunk_taken_by_another_writer() {
    let mut cfg = fast_config();
    cfg.batch.update_chunk = 2;
    let (store, engine) = setup(cfg);
    let mut ids = Vec::new();
    for i in 1..=4 {
        ids.push(add(&engine, i, "STOP", None).await);
    }
    assert_eq!(engine.process_batch(0, 10).await.unwrap().matched, 4);

    // Restore walks oldest first; the two oldest are taken before the first write.
    store.interleave_before_next_transition(vec![ids[3], ids[2]], MessageStatus::Promoted);
    let report = engine.restore(base_ts() + Duration::days(1), false).await.unwrap();
    assert_eq!(report.candidates, 4);
    assert_eq!(report.conflicts, 2);
    assert_eq!(report.restored, 2);

    for (id, want) in [
        (ids[0], MessageStatus::Pending),
        (ids[1], MessageStatus::Pending),
        (ids[2], MessageStatus::Promoted),
        (ids[3], MessageStatus::Promoted),
    ] {
        assert_eq!(store.get_message(id).await.unwrap().unwrap().status, want);
    }
}

#[tokio::test]
async fn rescoring_is_idempotent() {
    let (_store, engine) = setup(fast_config());
    add(&engine, 1, "STOP", None).await;
    add(&engine, 2, "thanks, that fixed it", None).await;

    let before = engine.preview(10).await.unwrap();
    let again = engine.preview(10).await.unwrap();
    assert_eq!(before, again);

    let first = engine.process_batch(0, 10).await.unwrap();
    let second = engine.process_batch(0, 10).await.unwrap();
    assert_eq!(first.matched, 1);
    assert_eq!(second.matched, 0);
    assert_eq!(second.processed, 1);
}

#[tokio::test]
async fn exhausted_budget_returns_valid_cursor() {
    let mut cfg = fast_config();
    cfg.batch.time_budget_ms = 1_000;
    cfg.batch.deadline_margin_ms = 1_000;
    let (_store, engine) = setup(cfg);
    for i in 0..5 {
        add(&engine, i, "STOP", None).await;
    }

    let out = engine.process_batch(2, 10).await.unwrap();
    assert!(out.deadline_hit);
    assert!(!out.complete);
    assert_eq!(out.processed, 0);
    assert_eq!(out.next_skip, 2);
    assert_eq!(out.remaining, 3);
}

#[tokio::test]
async fn oversized_text_counts_as_errored() {
    let mut cfg = fast_config();
    cfg.batch.max_text_chars = 20;
    let (store, engine) = setup(cfg);
    let long = add(&engine, 1, "FREE CASH PRIZE claim now at bit.ly/xyz!!!", None).await;
    add(&engine, 2, "STOP", None).await;

    let out = engine.process_batch(0, 10).await.unwrap();
    assert_eq!(out.errored, 1);
    assert_eq!(out.matched, 1);
    assert_eq!(out.processed, 2);
    assert_eq!(store.get_message(long).await.unwrap().unwrap().status, MessageStatus::Pending);
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let (store, engine) = setup(fast_config());
    add(&engine, 1, "STOP", None).await;
    store.inject_transient_failures(2);

    let out = engine.process_batch(0, 10).await.unwrap();
    assert_eq!(out.matched, 1);
}

#[tokio::test]
async fn breaker_opens_after_repeated_failures() {
    let mut cfg = fast_config();
    cfg.store.retry_attempts = 1;
    cfg.store.breaker_failures = 2;
    let (store, engine) = setup(cfg);
    add(&engine, 1, "STOP", None).await;
    store.inject_transient_failures(10);

    let first = engine.process_batch(0, 10).await.unwrap_err();
    assert!(matches!(first, EngineError::Store(_)));
    let second = engine.process_batch(0, 10).await.unwrap_err();
    assert!(matches!(second, EngineError::Store(_)));
    let third = engine.process_batch(0, 10).await.unwrap_err();
    assert!(matches!(third, EngineError::CircuitOpen { .. }), "got {third:?}");
}

#[tokio::test]
async fn invalid_take_is_rejected() {
    let (_store, engine) = setup(fast_config());
    assert!(matches!(engine.process_batch(0, 0).await, Err(EngineError::Validation(_))));
    assert!(matches!(
        engine.process_batch(0, 1_000_000).await,
        Err(EngineError::Validation(_))
    ));
}
