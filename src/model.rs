// src/model.rs
//! Persistent records: messages awaiting classification and human learning records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize::{brand_key, normalize};
use crate::status::MessageStatus;

pub type MessageId = i64;

/// An inbound message as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub brand: Option<String>,
    pub text: String,
    pub status: MessageStatus,
    /// Short match annotations; non-empty only while `status == review`.
    #[serde(default)]
    pub annotations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
}

/// Ingestion payload; the store assigns id/status and derives the fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub phone: String,
    #[serde(default)]
    pub brand: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.phone, self.created_at, &self.text, self.brand.as_deref())
    }
}

/// Dedupe key: SHA-256 over digits-only phone, unix millis, normalized text and
/// normalized brand. Identical tuples always collide.
pub fn fingerprint(phone: &str, ts: DateTime<Utc>, text: &str, brand: Option<&str>) -> String {
    use sha2::{Digest, Sha256};
    use std::fmt::Write as _;

    let phone: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    let mut hasher = Sha256::new();
    hasher.update(phone.as_bytes());
    hasher.update([0x1f]);
    hasher.update(ts.timestamp_millis().to_be_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize(text).as_bytes());
    hasher.update([0x1f]);
    hasher.update(brand_key(brand).unwrap_or_default().as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Short anonymized id for logs; raw message text is never logged.
pub(crate) fn anon_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    use std::fmt::Write as _;
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Who produced a learning record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningSource {
    Agent,
    Manual,
    Learning,
}

impl LearningSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LearningSource::Agent => "agent",
            LearningSource::Manual => "manual",
            LearningSource::Learning => "learning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(LearningSource::Agent),
            "manual" => Some(LearningSource::Manual),
            "learning" => Some(LearningSource::Learning),
            _ => None,
        }
    }
}

/// One immutable human verdict about a text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub id: i64,
    pub normalized_text: String,
    pub brand: Option<String>,
    pub is_spam: bool,
    pub score: u32,
    pub reasons: Vec<String>,
    pub pattern_tag: String,
    pub source: LearningSource,
    pub created_at: DateTime<Utc>,
}

/// Append payload for the learning store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLearningRecord {
    pub normalized_text: String,
    pub brand: Option<String>,
    pub is_spam: bool,
    pub score: u32,
    pub reasons: Vec<String>,
    pub pattern_tag: String,
    pub source: LearningSource,
    pub created_at: DateTime<Utc>,
}

impl NewLearningRecord {
    pub fn into_record(self, id: i64) -> LearningRecord {
        LearningRecord {
            id,
            normalized_text: self.normalized_text,
            brand: self.brand,
            is_spam: self.is_spam,
            score: self.score,
            reasons: self.reasons,
            pattern_tag: self.pattern_tag,
            source: self.source,
            created_at: self.created_at,
        }
    }
}
