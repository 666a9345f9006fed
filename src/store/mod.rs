// src/store/mod.rs
//! Persistence seams. The relational store is the only shared mutable resource;
//! every status-changing write is conditional on the expected current status.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::analyze::rules::Rule;
use crate::error::StoreError;
use crate::model::{LearningRecord, Message, MessageId, NewLearningRecord, NewMessage};
use crate::status::MessageStatus;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Inserts as `pending`; a repeated fingerprint yields `DuplicateFingerprint`.
    async fn insert_message(&self, msg: NewMessage) -> Result<Message, StoreError>;

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Pending messages, newest first, `take` items from offset `skip`.
    async fn fetch_pending(&self, skip: usize, take: usize) -> Result<Vec<Message>, StoreError>;

    async fn count_pending(&self) -> Result<usize, StoreError>;

    /// Moves only rows currently in `expected`; returns the ids actually moved.
    /// Leaving `review` clears annotations.
    async fn transition_status(
        &self,
        ids: &[MessageId],
        expected: MessageStatus,
        next: MessageStatus,
    ) -> Result<Vec<MessageId>, StoreError>;

    /// Moves `pending` rows to `review` and stores their annotations in the same
    /// conditional write; returns the ids actually moved.
    async fn flag_for_review(
        &self,
        flags: &[(MessageId, Vec<String>)],
    ) -> Result<Vec<MessageId>, StoreError>;

    /// `review` messages created strictly before `cutoff`, oldest first.
    async fn review_created_before(
        &self,
        cutoff: DateTime<Utc>,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Message>, StoreError>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn enabled_rules(&self) -> Result<Vec<Rule>, StoreError>;

    /// Inserts when `rule.id == 0`, otherwise replaces the rule with that id.
    async fn upsert_rule(&self, rule: Rule) -> Result<Rule, StoreError>;

    async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait LearningRepository: Send + Sync {
    async fn append_learning(&self, record: NewLearningRecord)
        -> Result<LearningRecord, StoreError>;

    /// All records whose lookup prefix is one of `prefixes`, ordered by id.
    async fn learning_by_prefixes(
        &self,
        prefixes: &[String],
    ) -> Result<Vec<LearningRecord>, StoreError>;
}

/// Everything the engine needs from persistence.
pub trait Store: MessageStore + RuleStore + LearningRepository {}

impl<T: MessageStore + RuleStore + LearningRepository> Store for T {}
