//! In-memory store used by tests and local runs.
//!
//! Behaves like the SQLite store: unique fingerprints, conditional status writes,
//! annotations cleared when leaving review. Hooks let tests inject transient
//! failures, simulate a concurrent writer and lose the reply to a committed write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use crate::analyze::rules::Rule;
use crate::error::StoreError;
use crate::learning::learning_prefix;
use crate::model::{LearningRecord, Message, MessageId, NewLearningRecord, NewMessage};
use crate::normalize::normalize;
use crate::status::MessageStatus;
use crate::store::{LearningRepository, MessageStore, RuleStore};

#[derive(Debug, Default)]
struct Inner {
    messages: BTreeMap<MessageId, Message>,
    fingerprints: HashSet<String>,
    next_message_id: MessageId,
    rules: BTreeMap<i64, Rule>,
    next_rule_id: i64,
    learning: Vec<LearningRecord>,
    transient_failures: u32,
    interleave: Option<(Vec<MessageId>, MessageStatus)>,
    fail_after_commit: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` store calls fail with `StoreError::Unavailable`.
    pub fn inject_transient_failures(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    /// Before the next status write, force `ids` into `status` as if another
    /// processor got there first.
    pub fn interleave_before_next_transition(&self, ids: Vec<MessageId>, status: MessageStatus) {
        self.lock().interleave = Some((ids, status));
    }

    /// The next status write is applied, then reported as `StoreError::Unavailable`.
    pub fn commit_then_fail_next_write(&self) {
        self.lock().fail_after_commit = true;
    }

    pub fn learning_len(&self) -> usize {
        self.lock().learning.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }

    /// Lock and consume one injected failure if any is pending.
    fn enter(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        let mut g = self.lock();
        if g.transient_failures > 0 {
            g.transient_failures -= 1;
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(g)
    }
}

impl Inner {
    fn apply_interleave(&mut self) {
        if let Some((stolen, status)) = self.interleave.take() {
            for id in stolen {
                if let Some(m) = self.messages.get_mut(&id) {
                    move_status(m, status);
                }
            }
        }
    }

    fn reply_after_commit<T>(&mut self, value: T) -> Result<T, StoreError> {
        if std::mem::take(&mut self.fail_after_commit) {
            return Err(StoreError::Unavailable("connection reset after commit".into()));
        }
        Ok(value)
    }
}

fn move_status(msg: &mut Message, next: MessageStatus) {
    msg.status = next;
    if next != MessageStatus::Review {
        msg.annotations.clear();
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
        let mut g = self.enter()?;
        let fingerprint = msg.fingerprint();
        if !g.fingerprints.insert(fingerprint.clone()) {
            return Err(StoreError::DuplicateFingerprint(fingerprint));
        }
        g.next_message_id += 1;
        let stored = Message {
            id: g.next_message_id,
            brand: msg.brand,
            text: msg.text,
            status: MessageStatus::Pending,
            annotations: Vec::new(),
            created_at: msg.created_at,
            fingerprint,
        };
        g.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let g = self.enter()?;
        Ok(g.messages.get(&id).cloned())
    }

    async fn fetch_pending(&self, skip: usize, take: usize) -> Result<Vec<Message>, StoreError> {
        let g = self.enter()?;
        let mut pending: Vec<&Message> = g
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending)
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(pending.into_iter().skip(skip).take(take).cloned().collect())
    }

    async fn count_pending(&self) -> Result<usize, StoreError> {
        let g = self.enter()?;
        Ok(g.messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending)
            .count())
    }

    async fn transition_status(
        &self,
        ids: &[MessageId],
        expected: MessageStatus,
        next: MessageStatus,
    ) -> Result<Vec<MessageId>, StoreError> {
        let mut g = self.enter()?;
        g.apply_interleave();
        let mut moved = Vec::new();
        for id in ids {
            if let Some(m) = g.messages.get_mut(id) {
                if m.status == expected {
                    move_status(m, next);
                    moved.push(*id);
                }
            }
        }
        g.reply_after_commit(moved)
    }

    async fn flag_for_review(
        &self,
        flags: &[(MessageId, Vec<String>)],
    ) -> Result<Vec<MessageId>, StoreError> {
        let mut g = self.enter()?;
        g.apply_interleave();
        let mut moved = Vec::new();
        for (id, notes) in flags {
            if let Some(m) = g.messages.get_mut(id) {
                if m.status == MessageStatus::Pending {
                    m.status = MessageStatus::Review;
                    m.annotations = notes.clone();
                    moved.push(*id);
                }
            }
        }
        g.reply_after_commit(moved)
    }

    async fn review_created_before(
        &self,
        cutoff: DateTime<Utc>,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let g = self.enter()?;
        let mut rows: Vec<&Message> = g
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Review && m.created_at < cutoff)
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows.into_iter().skip(skip).take(take).cloned().collect())
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn enabled_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let g = self.enter()?;
        Ok(g.rules.values().filter(|r| r.enabled).cloned().collect())
    }

    async fn upsert_rule(&self, mut rule: Rule) -> Result<Rule, StoreError> {
        let mut g = self.enter()?;
        rule.normalized_pattern = normalize(&rule.pattern);
        if rule.id == 0 {
            g.next_rule_id += 1;
            rule.id = g.next_rule_id;
        } else if !g.rules.contains_key(&rule.id) {
            return Err(StoreError::NotFound(format!("rule {}", rule.id)));
        }
        g.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<bool, StoreError> {
        let mut g = self.enter()?;
        Ok(match g.rules.get_mut(&id) {
            Some(r) => {
                r.enabled = enabled;
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl LearningRepository for MemoryStore {
    async fn append_learning(
        &self,
        record: NewLearningRecord,
    ) -> Result<LearningRecord, StoreError> {
        let mut g = self.enter()?;
        let id = g.learning.len() as i64 + 1;
        let saved = record.into_record(id);
        g.learning.push(saved.clone());
        Ok(saved)
    }

    async fn learning_by_prefixes(
        &self,
        prefixes: &[String],
    ) -> Result<Vec<LearningRecord>, StoreError> {
        let g = self.enter()?;
        Ok(g.learning
            .iter()
            .filter(|r| prefixes.contains(&learning_prefix(&r.normalized_text)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_msg(phone: &str, text: &str, minute: u32) -> NewMessage {
        NewMessage {
            phone: phone.into(),
            brand: None,
            text: text.into(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 10, minute, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_rejected() {
        let s = MemoryStore::new();
        s.insert_message(new_msg("555", "hi there", 0)).await.unwrap();
        let err = s.insert_message(new_msg("555", "Hi there!", 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateFingerprint(_)));
    }

    #[tokio::test]
    async fn pending_is_newest_first() {
        let s = MemoryStore::new();
        for m in 0..3 {
            s.insert_message(new_msg("555", &format!("msg {m}"), m)).await.unwrap();
        }
        let page = s.fetch_pending(0, 2).await.unwrap();
        assert_eq!(page.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(), ["msg 2", "msg 1"]);
        assert_eq!(s.fetch_pending(2, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conditional_transition_skips_moved_rows() {
        let s = MemoryStore::new();
        let a = s.insert_message(new_msg("1", "a", 0)).await.unwrap();
        let b = s.insert_message(new_msg("2", "b", 1)).await.unwrap();
        s.interleave_before_next_transition(vec![b.id], MessageStatus::Promoted);
        let moved = s
            .transition_status(&[a.id, b.id], MessageStatus::Pending, MessageStatus::Review)
            .await
            .unwrap();
        assert_eq!(moved, vec![a.id]);
    }

    #[tokio::test]
    async fn flag_writes_status_and_annotations_together() {
        let s = MemoryStore::new();
        let a = s.insert_message(new_msg("1", "a", 0)).await.unwrap();
        let b = s.insert_message(new_msg("2", "b", 1)).await.unwrap();
        s.transition_status(&[b.id], MessageStatus::Pending, MessageStatus::Promoted)
            .await
            .unwrap();

        let moved = s
            .flag_for_review(&[(a.id, vec!["rule: x".into()]), (b.id, vec!["rule: y".into()])])
            .await
            .unwrap();
        assert_eq!(moved, vec![a.id]);
        let m = s.get_message(a.id).await.unwrap().unwrap();
        assert_eq!(m.status, MessageStatus::Review);
        assert_eq!(m.annotations, vec!["rule: x".to_string()]);
        assert!(s.get_message(b.id).await.unwrap().unwrap().annotations.is_empty());

        s.transition_status(&[a.id], MessageStatus::Review, MessageStatus::Pending)
            .await
            .unwrap();
        let m = s.get_message(a.id).await.unwrap().unwrap();
        assert!(m.annotations.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let s = MemoryStore::new();
        s.inject_transient_failures(1);
        assert!(s.count_pending().await.unwrap_err().is_transient());
        assert_eq!(s.count_pending().await.unwrap(), 0);
    }
}
