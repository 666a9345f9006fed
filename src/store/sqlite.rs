//! SQLite-backed store.
//!
//! Timestamps are stored as unix millis, annotations and reasons as JSON text.
//! Status writes are single `UPDATE ... WHERE status = ? AND id IN (...) RETURNING id`
//! statements, so a row moved by someone else is simply not returned.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::analyze::rules::{Rule, RuleMode};
use crate::error::StoreError;
use crate::learning::learning_prefix;
use crate::model::{LearningRecord, LearningSource, Message, MessageId, NewLearningRecord, NewMessage};
use crate::normalize::normalize;
use crate::status::MessageStatus;
use crate::store::{LearningRepository, MessageStore, RuleStore};

static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        brand         TEXT,
        text          TEXT NOT NULL,
        status        TEXT NOT NULL CHECK (status IN ('pending', 'review', 'promoted')),
        annotations   TEXT NOT NULL DEFAULT '[]',
        created_at_ms INTEGER NOT NULL,
        fingerprint   TEXT NOT NULL UNIQUE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_status_created ON messages (status, created_at_ms)",
    r#"
    CREATE TABLE IF NOT EXISTS rules (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        pattern            TEXT NOT NULL,
        normalized_pattern TEXT NOT NULL,
        mode               TEXT NOT NULL CHECK (mode IN ('contains', 'lone')),
        brand              TEXT,
        enabled            INTEGER NOT NULL DEFAULT 1,
        note               TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS learning_records (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        normalized_text TEXT NOT NULL,
        text_prefix     TEXT NOT NULL,
        brand           TEXT,
        is_spam         INTEGER NOT NULL,
        score           INTEGER NOT NULL,
        reasons         TEXT NOT NULL DEFAULT '[]',
        pattern_tag     TEXT NOT NULL,
        source          TEXT NOT NULL,
        created_at_ms   INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_learning_prefix ON learning_records (text_prefix)",
];

const MESSAGE_COLUMNS: &str = "id, brand, text, status, annotations, created_at_ms, fingerprint";
const RULE_COLUMNS: &str = "id, pattern, normalized_pattern, mode, brand, enabled, note";
const LEARNING_COLUMNS: &str =
    "id, normalized_text, brand, is_spam, score, reasons, pattern_tag, source, created_at_ms";

type MessageRow = (i64, Option<String>, String, String, String, i64, String);
type RuleRow = (i64, String, String, String, Option<String>, bool, Option<String>);
type LearningRow = (i64, String, Option<String>, bool, i64, String, String, String, i64);

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
    const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Opens (creating if needed) the database at `path` and applies the schema.
    /// `:memory:` gets a private shared-cache database that lives as long as the pool.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let pool = if path == ":memory:" {
            let id = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let uri = format!(
                "file:spam-memdb-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                id
            );
            let options = SqliteConnectOptions::new()
                .filename(&uri)
                .shared_cache(true)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Self::BUSY_TIMEOUT);
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .connect_with(options)
                .await?
        };

        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        info!(target: "spam", path, "sqlite store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Backend(format!("timestamp out of range: {ms}")))
}

fn json_list(raw: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Backend(format!("bad json column: {e}")))
}

fn to_json(list: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(list).map_err(|e| StoreError::Backend(e.to_string()))
}

fn message_from_row(row: MessageRow) -> Result<Message, StoreError> {
    let (id, brand, text, status, annotations, created_at_ms, fingerprint) = row;
    Ok(Message {
        id,
        brand,
        text,
        status: MessageStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown status '{status}'")))?,
        annotations: json_list(&annotations)?,
        created_at: millis_to_utc(created_at_ms)?,
        fingerprint,
    })
}

fn rule_from_row(row: RuleRow) -> Result<Rule, StoreError> {
    let (id, pattern, normalized_pattern, mode, brand, enabled, note) = row;
    Ok(Rule {
        id,
        pattern,
        normalized_pattern,
        mode: RuleMode::parse(&mode)
            .ok_or_else(|| StoreError::Backend(format!("unknown rule mode '{mode}'")))?,
        brand,
        enabled,
        note,
    })
}

fn learning_from_row(row: LearningRow) -> Result<LearningRecord, StoreError> {
    let (id, normalized_text, brand, is_spam, score, reasons, pattern_tag, source, created_at_ms) =
        row;
    Ok(LearningRecord {
        id,
        normalized_text,
        brand,
        is_spam,
        score: score.clamp(0, 100) as u32,
        reasons: json_list(&reasons)?,
        pattern_tag,
        source: LearningSource::parse(&source)
            .ok_or_else(|| StoreError::Backend(format!("unknown learning source '{source}'")))?,
        created_at: millis_to_utc(created_at_ms)?,
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
        let fingerprint = msg.fingerprint();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO messages (brand, text, status, annotations, created_at_ms, fingerprint)
            VALUES (?, ?, 'pending', '[]', ?, ?)
            RETURNING id
            "#,
        )
        .bind(&msg.brand)
        .bind(&msg.text)
        .bind(msg.created_at.timestamp_millis())
        .bind(&fingerprint)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::DuplicateFingerprint(_) => StoreError::DuplicateFingerprint(fingerprint.clone()),
            other => other,
        })?;

        Ok(Message {
            id,
            brand: msg.brand,
            text: msg.text,
            status: MessageStatus::Pending,
            annotations: Vec::new(),
            created_at: msg.created_at,
            fingerprint,
        })
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(message_from_row).transpose()
    }

    async fn fetch_pending(&self, skip: usize, take: usize) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE status = 'pending' \
             ORDER BY created_at_ms DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(take as i64)
        .bind(skip as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn count_pending(&self) -> Result<usize, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as usize)
    }

    async fn transition_status(
        &self,
        ids: &[MessageId],
        expected: MessageStatus,
        next: MessageStatus,
    ) -> Result<Vec<MessageId>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE messages SET status = ");
        qb.push_bind(next.as_str());
        if next != MessageStatus::Review {
            qb.push(", annotations = '[]'");
        }
        qb.push(" WHERE status = ");
        qb.push_bind(expected.as_str());
        qb.push(" AND id IN (");
        let mut list = qb.separated(", ");
        for id in ids {
            list.push_bind(*id);
        }
        list.push_unseparated(") RETURNING id");

        let moved: Vec<i64> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(moved)
    }

    async fn flag_for_review(
        &self,
        flags: &[(MessageId, Vec<String>)],
    ) -> Result<Vec<MessageId>, StoreError> {
        if flags.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE messages SET status = 'review', annotations = CASE id",
        );
        for (id, notes) in flags {
            qb.push(" WHEN ");
            qb.push_bind(*id);
            qb.push(" THEN ");
            qb.push_bind(to_json(notes)?);
        }
        qb.push(" END WHERE status = 'pending' AND id IN (");
        let mut list = qb.separated(", ");
        for (id, _) in flags {
            list.push_bind(*id);
        }
        list.push_unseparated(") RETURNING id");

        let moved: Vec<i64> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(moved)
    }

    async fn review_created_before(
        &self,
        cutoff: DateTime<Utc>,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE status = 'review' AND created_at_ms < ? \
             ORDER BY created_at_ms ASC, id ASC LIMIT ? OFFSET ?"
        ))
        .bind(cutoff.timestamp_millis())
        .bind(take as i64)
        .bind(skip as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn enabled_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE enabled = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(rule_from_row).collect()
    }

    async fn upsert_rule(&self, mut rule: Rule) -> Result<Rule, StoreError> {
        rule.normalized_pattern = normalize(&rule.pattern);
        if rule.id == 0 {
            rule.id = sqlx::query_scalar(
                r#"
                INSERT INTO rules (pattern, normalized_pattern, mode, brand, enabled, note)
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(&rule.pattern)
            .bind(&rule.normalized_pattern)
            .bind(rule.mode.as_str())
            .bind(&rule.brand)
            .bind(rule.enabled)
            .bind(&rule.note)
            .fetch_one(&self.pool)
            .await?;
        } else {
            let res = sqlx::query(
                r#"
                UPDATE rules
                SET pattern = ?, normalized_pattern = ?, mode = ?, brand = ?, enabled = ?, note = ?
                WHERE id = ?
                "#,
            )
            .bind(&rule.pattern)
            .bind(&rule.normalized_pattern)
            .bind(rule.mode.as_str())
            .bind(&rule.brand)
            .bind(rule.enabled)
            .bind(&rule.note)
            .bind(rule.id)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("rule {}", rule.id)));
            }
        }
        Ok(rule)
    }

    async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<bool, StoreError> {
        let res = sqlx::query("UPDATE rules SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl LearningRepository for SqliteStore {
    async fn append_learning(
        &self,
        record: NewLearningRecord,
    ) -> Result<LearningRecord, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO learning_records
                (normalized_text, text_prefix, brand, is_spam, score, reasons, pattern_tag, source, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&record.normalized_text)
        .bind(learning_prefix(&record.normalized_text))
        .bind(&record.brand)
        .bind(record.is_spam)
        .bind(record.score as i64)
        .bind(to_json(&record.reasons)?)
        .bind(&record.pattern_tag)
        .bind(record.source.as_str())
        .bind(record.created_at.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(record.into_record(id))
    }

    async fn learning_by_prefixes(
        &self,
        prefixes: &[String],
    ) -> Result<Vec<LearningRecord>, StoreError> {
        if prefixes.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {LEARNING_COLUMNS} FROM learning_records WHERE text_prefix IN ("
        ));
        let mut list = qb.separated(", ");
        for p in prefixes {
            list.push_bind(p.as_str());
        }
        list.push_unseparated(") ORDER BY id");

        let rows: Vec<LearningRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(learning_from_row).collect()
    }
}
