//! # Classification Engine
//! Orchestrates the pending backlog: fetch a page, score it, consult learning for
//! whatever rules and heuristics did not catch, then apply guarded status writes.
//!
//! Every call is a stateless unit. Rules and learning records are read once per call
//! and never cached across calls, so overlapping invocations are safe: the store's
//! conditional writes decide who wins, and the loser sees a counted conflict.

use chrono::{DateTime, NaiveDate, Utc};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::analyze::{score_page_blocking, Rule, Scored};
use crate::config::EngineConfig;
use crate::decision::{history_hit, MatchHit, Thresholds};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::learning::{ImprovedScore, Learning, LearningQuery};
use crate::metrics::ensure_metrics_described;
use crate::model::{LearningSource, Message, MessageId, NewMessage};
use crate::normalize::normalize;
use crate::resilience::StoreGuard;
use crate::status::{validate, MessageStatus};
use crate::store::{MessageStore, RuleStore, Store};

const RESTORE_SAMPLE: usize = 20;

/// Result of one `process_batch` call. `next_skip` is the cursor for the next call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub matched: usize,
    pub processed: usize,
    pub remaining: usize,
    pub complete: bool,
    pub next_skip: usize,
    /// Transitions rejected by the validator.
    pub blocked: usize,
    /// Conditional writes that found the message already moved.
    pub conflicts: usize,
    pub errored: usize,
    pub deadline_hit: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewItem {
    pub id: MessageId,
    pub brand: Option<String>,
    pub rule_hits: Vec<String>,
    pub pattern_score: u32,
    pub pattern_reasons: Vec<String>,
    pub historical_score: Option<f32>,
    pub historical_confidence: Option<f32>,
    pub hits: Vec<MatchHit>,
    pub would_flag: bool,
    pub errored: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewReport {
    pub scanned: usize,
    pub matched: usize,
    pub errored: usize,
    pub items: Vec<PreviewItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub dry_run: bool,
    pub cutoff: DateTime<Utc>,
    pub candidates: usize,
    pub restored: usize,
    pub conflicts: usize,
    pub sample_ids: Vec<MessageId>,
}

/// Agent verdict on a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Legitimate: record ham and promote the message.
    Promote,
    /// Spam: record it; status is left for the downstream deleter.
    MarkSpam,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispositionOutcome {
    pub message_id: MessageId,
    pub learning_record_id: Option<i64>,
    pub status: MessageStatus,
    pub conflict: bool,
}

/// Parses a restore cutoff: RFC 3339 timestamp or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_cutoff(raw: &str) -> EngineResult<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    Err(EngineError::validation(format!(
        "invalid cutoff '{s}': expected RFC 3339 or YYYY-MM-DD"
    )))
}

/// Final hit list: rule/pattern hits win; history only counts when they are empty.
fn decide(primary: &[MatchHit], history: Option<&ImprovedScore>, t: &Thresholds) -> Vec<MatchHit> {
    if !primary.is_empty() {
        return primary.to_vec();
    }
    history.and_then(|h| history_hit(h, t)).into_iter().collect()
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    guard: Arc<StoreGuard>,
    config: EngineConfig,
    learning: Learning,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        ensure_metrics_described();
        let guard = Arc::new(StoreGuard::new(&config.store));
        let learning = Learning::new(store.clone(), guard.clone(), config.learning);
        Self {
            store,
            guard,
            config,
            learning,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn learning(&self) -> &Learning {
        &self.learning
    }

    pub fn guard(&self) -> &StoreGuard {
        &self.guard
    }

    /// Inserts an inbound message as `pending`. Duplicates surface as
    /// `StoreError::DuplicateFingerprint`.
    pub async fn ingest(&self, msg: NewMessage) -> EngineResult<Message> {
        let store = &self.store;
        let saved = self
            .guard
            .run("insert_message", || store.insert_message(msg.clone()))
            .await?;
        debug!(target: "spam", id = saved.id, "message ingested");
        Ok(saved)
    }

    pub async fn upsert_rule(&self, rule: Rule) -> EngineResult<Rule> {
        if normalize(&rule.pattern).is_empty() {
            return Err(EngineError::validation("rule pattern is empty after normalization"));
        }
        let store = &self.store;
        let saved = self
            .guard
            .run("upsert_rule", || store.upsert_rule(rule.clone()))
            .await?;
        info!(target: "spam", id = saved.id, mode = saved.mode.as_str(), enabled = saved.enabled, "rule saved");
        Ok(saved)
    }

    pub async fn set_rule_enabled(&self, id: i64, enabled: bool) -> EngineResult<bool> {
        let store = &self.store;
        self.guard
            .run("set_rule_enabled", || store.set_rule_enabled(id, enabled))
            .await
    }

    /// Fetches up to `take` pending messages from `skip` in store-sized chunks.
    /// Stops early (second value true) once `deadline` has passed.
    async fn fetch_pending_chunked(
        &self,
        skip: usize,
        take: usize,
        deadline: Option<Instant>,
    ) -> EngineResult<(Vec<Message>, bool)> {
        let chunk = self.config.batch.fetch_chunk.max(1);
        let store = &self.store;
        let mut page: Vec<Message> = Vec::with_capacity(take.min(chunk * 4));
        while page.len() < take {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok((page, true));
            }
            let want = (take - page.len()).min(chunk);
            let offset = skip + page.len();
            let rows = self
                .guard
                .run("fetch_pending", || store.fetch_pending(offset, want))
                .await?;
            let got = rows.len();
            page.extend(rows);
            if got < want {
                break;
            }
        }
        Ok((page, false))
    }

    async fn rules_snapshot(&self) -> EngineResult<Arc<Vec<Rule>>> {
        let store = &self.store;
        let rules = self
            .guard
            .run("enabled_rules", || store.enabled_rules())
            .await?;
        Ok(Arc::new(rules))
    }

    /// Historical scores for every scored, unmatched item with text. A failed lookup
    /// marks those items errored instead of failing the whole page.
    async fn history_for(
        &self,
        page: &[Message],
        scored: &[Scored],
    ) -> (HashMap<MessageId, ImprovedScore>, usize) {
        let queries: Vec<LearningQuery> = page
            .iter()
            .zip(scored)
            .filter(|(m, s)| {
                matches!(s, Scored::Done { hits, .. } if hits.is_empty()) && !normalize(&m.text).is_empty()
            })
            .map(|(m, _)| LearningQuery {
                id: m.id,
                text: m.text.clone(),
                brand: m.brand.clone(),
            })
            .collect();
        if queries.is_empty() {
            return (HashMap::new(), 0);
        }
        match self.learning.get_batch_improved_spam_scores(&queries).await {
            Ok(map) => (map, 0),
            Err(e) => {
                warn!(target: "spam", items = queries.len(), error = %e, "learning lookup failed; items counted as errored");
                (HashMap::new(), queries.len())
            }
        }
    }

    /// True when `id` already sits in `review` with exactly `notes`: a write whose
    /// reply was lost and whose retry then found nothing left to move.
    async fn already_flagged(&self, id: MessageId, notes: &[String]) -> bool {
        let store = &self.store;
        match self.guard.run("get_message", || store.get_message(id)).await {
            Ok(Some(m)) => m.status == MessageStatus::Review && m.annotations == notes,
            Ok(None) => false,
            Err(e) => {
                warn!(target: "spam", id, error = %e, "could not re-read conflicted message");
                false
            }
        }
    }

    /// Processes one page of the pending backlog starting at `skip`.
    pub async fn process_batch(&self, skip: usize, take: usize) -> EngineResult<BatchOutcome> {
        let cfg = &self.config.batch;
        if take == 0 || take > cfg.max_take {
            return Err(EngineError::validation(format!(
                "take must be between 1 and {}, got {take}",
                cfg.max_take
            )));
        }
        let started = Instant::now();
        let budget = Duration::from_millis(cfg.time_budget_ms.saturating_sub(cfg.deadline_margin_ms));
        let deadline = started + budget;
        counter!("spam_batch_runs_total").increment(1);

        let rules = self.rules_snapshot().await?;
        let (page, deadline_hit) = self.fetch_pending_chunked(skip, take, Some(deadline)).await?;
        let fetched = page.len();
        let complete = !deadline_hit && fetched < take;
        let page = Arc::new(page);

        let scored = score_page_blocking(
            page.clone(),
            rules.clone(),
            self.config.thresholds,
            cfg.max_text_chars,
        )
        .await;
        let mut errored = scored.iter().filter(|s| s.is_errored()).count();

        let (history, lookup_errors) = self.history_for(&page, &scored).await;
        errored += lookup_errors;

        let mut blocked = 0usize;
        let mut flagged: Vec<(MessageId, Vec<MatchHit>)> = Vec::new();
        for (msg, s) in page.iter().zip(&scored) {
            let Scored::Done { hits, .. } = s else { continue };
            let hits = decide(hits, history.get(&msg.id), &self.config.thresholds);
            if hits.is_empty() {
                continue;
            }
            let check = validate(msg.status, MessageStatus::Review);
            if !check.valid {
                blocked += 1;
                warn!(
                    target: "spam",
                    id = msg.id,
                    error = check.error.as_deref().unwrap_or_default(),
                    "transition rejected"
                );
                continue;
            }
            flagged.push((msg.id, hits));
        }

        let store = &self.store;
        let flags: Vec<(MessageId, Vec<String>)> = flagged
            .into_iter()
            .map(|(id, hits)| (id, hits.iter().map(MatchHit::annotation).collect()))
            .collect();
        let mut moved: Vec<MessageId> = Vec::with_capacity(flags.len());
        let mut conflicts = 0usize;
        for chunk in flags.chunks(cfg.update_chunk.max(1)) {
            match self
                .guard
                .run("flag_for_review", || store.flag_for_review(chunk))
                .await
            {
                Ok(done) => {
                    let done: HashSet<MessageId> = done.into_iter().collect();
                    let mut lost = 0usize;
                    for (id, notes) in chunk {
                        if done.contains(id) || self.already_flagged(*id, notes).await {
                            moved.push(*id);
                        } else {
                            lost += 1;
                        }
                    }
                    if lost > 0 {
                        conflicts += lost;
                        warn!(target: "spam", attempted = chunk.len(), lost, "conditional write skipped moved messages");
                    }
                }
                Err(e) => {
                    errored += chunk.len();
                    warn!(target: "spam", items = chunk.len(), error = %e, "status write failed");
                }
            }
        }

        let matched = moved.len();
        let processed = fetched;
        let next_skip = (skip + processed).saturating_sub(matched + conflicts);
        let remaining = if complete {
            0
        } else {
            match self.guard.run("count_pending", || store.count_pending()).await {
                Ok(n) => n.saturating_sub(next_skip),
                Err(e) => {
                    warn!(target: "spam", error = %e, "could not count pending messages");
                    0
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        counter!("spam_batch_processed_total").increment(processed as u64);
        counter!("spam_batch_matched_total").increment(matched as u64);
        counter!("spam_batch_conflicts_total").increment(conflicts as u64);
        counter!("spam_batch_blocked_total").increment(blocked as u64);
        counter!("spam_batch_errored_total").increment(errored as u64);
        if deadline_hit {
            counter!("spam_batch_deadline_total").increment(1);
        }
        histogram!("spam_batch_duration_ms").record(elapsed_ms as f64);
        gauge!("spam_pending_remaining").set(remaining as f64);

        info!(
            target: "spam",
            skip,
            take,
            processed,
            matched,
            conflicts,
            blocked,
            errored,
            next_skip,
            remaining,
            complete,
            deadline_hit,
            elapsed_ms,
            "batch processed"
        );

        Ok(BatchOutcome {
            matched,
            processed,
            remaining,
            complete,
            next_skip,
            blocked,
            conflicts,
            errored,
            deadline_hit,
            elapsed_ms,
        })
    }

    /// Dry evaluation of the newest `limit` pending messages. Writes nothing.
    pub async fn preview(&self, limit: usize) -> EngineResult<PreviewReport> {
        if limit == 0 {
            return Err(EngineError::validation("limit must be at least 1"));
        }
        let limit = limit.min(self.config.batch.max_take);
        let rules = self.rules_snapshot().await?;
        let (page, _) = self.fetch_pending_chunked(0, limit, None).await?;
        let page = Arc::new(page);
        let scored = score_page_blocking(
            page.clone(),
            rules,
            self.config.thresholds,
            self.config.batch.max_text_chars,
        )
        .await;

        let queries: Vec<LearningQuery> = page
            .iter()
            .zip(&scored)
            .filter(|(m, s)| !s.is_errored() && !normalize(&m.text).is_empty())
            .map(|(m, _)| LearningQuery {
                id: m.id,
                text: m.text.clone(),
                brand: m.brand.clone(),
            })
            .collect();
        let (history, lookup_failed) = if queries.is_empty() {
            (HashMap::new(), false)
        } else {
            match self.learning.get_batch_improved_spam_scores(&queries).await {
                Ok(map) => (map, false),
                Err(e) => {
                    warn!(target: "spam", error = %e, "preview learning lookup failed");
                    (HashMap::new(), true)
                }
            }
        };

        let mut report = PreviewReport {
            scanned: page.len(),
            ..PreviewReport::default()
        };
        for (msg, s) in page.iter().zip(scored) {
            let item = match s {
                Scored::Done {
                    rule_hits,
                    pattern,
                    hits,
                } => {
                    let hist = history.get(&msg.id);
                    let needs_history = hits.is_empty() && !normalize(&msg.text).is_empty();
                    let errored = lookup_failed && needs_history;
                    let decided = decide(&hits, hist, &self.config.thresholds);
                    PreviewItem {
                        id: msg.id,
                        brand: msg.brand.clone(),
                        rule_hits,
                        pattern_score: pattern.score,
                        pattern_reasons: pattern.reasons,
                        historical_score: hist.map(|h| h.score),
                        historical_confidence: hist.map(|h| h.historical_confidence),
                        would_flag: !decided.is_empty(),
                        hits: decided,
                        errored,
                    }
                }
                Scored::Errored(reason) => {
                    debug!(target: "spam", id = msg.id, reason = %reason, "preview item errored");
                    PreviewItem {
                        id: msg.id,
                        brand: msg.brand.clone(),
                        rule_hits: Vec::new(),
                        pattern_score: 0,
                        pattern_reasons: Vec::new(),
                        historical_score: None,
                        historical_confidence: None,
                        hits: Vec::new(),
                        would_flag: false,
                        errored: true,
                    }
                }
            };
            if item.would_flag {
                report.matched += 1;
            }
            if item.errored {
                report.errored += 1;
            }
            report.items.push(item);
        }
        Ok(report)
    }

    /// Reverts `review` messages created before `cutoff` back to `pending`
    /// (annotations cleared). With `dry_run` only counts them.
    pub async fn restore(&self, cutoff: DateTime<Utc>, dry_run: bool) -> EngineResult<RestoreReport> {
        let chunk = self.config.batch.update_chunk.max(1);
        let store = &self.store;
        let mut report = RestoreReport {
            dry_run,
            cutoff,
            candidates: 0,
            restored: 0,
            conflicts: 0,
            sample_ids: Vec::new(),
        };

        if dry_run {
            let mut skip = 0;
            loop {
                let rows = self
                    .guard
                    .run("review_created_before", || store.review_created_before(cutoff, skip, chunk))
                    .await?;
                let got = rows.len();
                report.candidates += got;
                for m in rows.iter().take(RESTORE_SAMPLE.saturating_sub(report.sample_ids.len())) {
                    report.sample_ids.push(m.id);
                }
                if got < chunk {
                    break;
                }
                skip += got;
            }
            info!(target: "spam", %cutoff, candidates = report.candidates, "restore dry run");
            return Ok(report);
        }

        let mut last_read: Vec<MessageId> = Vec::new();
        loop {
            let rows = self
                .guard
                .run("review_created_before", || store.review_created_before(cutoff, 0, chunk))
                .await?;
            let ids: Vec<MessageId> = rows
                .iter()
                .filter(|m| validate(m.status, MessageStatus::Pending).valid)
                .map(|m| m.id)
                .collect();
            // Rows moved by another writer drop out of the next read; the same ids
            // twice in a row means nothing more can be moved.
            if ids.is_empty() || ids == last_read {
                break;
            }
            let moved = self
                .guard
                .run("transition_status", || {
                    store.transition_status(&ids, MessageStatus::Review, MessageStatus::Pending)
                })
                .await?;
            report.candidates += ids.len();
            report.conflicts += ids.len() - moved.len();
            for id in moved.iter().take(RESTORE_SAMPLE.saturating_sub(report.sample_ids.len())) {
                report.sample_ids.push(*id);
            }
            report.restored += moved.len();
            last_read = ids;
        }

        counter!("spam_restore_total").increment(report.restored as u64);
        info!(
            target: "spam",
            %cutoff,
            restored = report.restored,
            conflicts = report.conflicts,
            "restore applied"
        );
        Ok(report)
    }

    /// Records an agent verdict for a stored message.
    pub async fn record_disposition(
        &self,
        id: MessageId,
        disposition: Disposition,
    ) -> EngineResult<DispositionOutcome> {
        let store = &self.store;
        let msg = self
            .guard
            .run("get_message", || store.get_message(id))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;

        let is_spam = disposition == Disposition::MarkSpam;
        if !is_spam {
            let check = validate(msg.status, MessageStatus::Promoted);
            if !check.valid {
                return Err(EngineError::Validation(
                    check.error.unwrap_or_else(|| "transition not allowed".into()),
                ));
            }
        }

        let learning_record_id = if normalize(&msg.text).is_empty() {
            None
        } else {
            let rec = self
                .learning
                .learn_from_spam_decision(&msg.text, is_spam, msg.brand.as_deref(), LearningSource::Agent)
                .await?;
            Some(rec.id)
        };

        if is_spam {
            return Ok(DispositionOutcome {
                message_id: id,
                learning_record_id,
                status: msg.status,
                conflict: false,
            });
        }

        let ids = [id];
        let moved = self
            .guard
            .run("transition_status", || {
                store.transition_status(&ids, msg.status, MessageStatus::Promoted)
            })
            .await?;
        let conflict = moved.is_empty();
        if conflict {
            warn!(target: "spam", id, from = %msg.status, "promote lost a race; message already moved");
        }
        Ok(DispositionOutcome {
            message_id: id,
            learning_record_id,
            status: if conflict { msg.status } else { MessageStatus::Promoted },
            conflict,
        })
    }
}
