//! learning.rs: append-only human verdicts and the confidence blender.
//!
//! Write path: every agent disposition appends one immutable record; nothing is
//! ever merged or deleted, so repeated verdicts on the same text act as evidence
//! strength.
//!
//! Read path: records whose normalized text is equal or near-identical to the
//! query (and which share its lookup prefix) are folded into a historical spam
//! share, then blended with a fresh pattern score:
//!
//! ```text
//! w       = min(n / (n + prior), max_history_weight)
//! blended = w * spam_share * 100 + (1 - w) * pattern_score
//! ```
//!
//! Single and batch lookups share `blend`, and both fetch candidates by the same
//! prefix key, so a batch result always equals the single-item result.

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::analyze::fuzzy::similarity;
use crate::analyze::pattern::{analyze, shortener_domains, PatternAnalysis};
use crate::error::{EngineError, EngineResult};
use crate::model::{anon_hash, LearningRecord, LearningSource, MessageId, NewLearningRecord};
use crate::normalize::{brand_key, normalize, tokens};
use crate::resilience::StoreGuard;
use crate::store::{LearningRepository, Store};

/// Characters of normalized text used as the bulk lookup key.
pub const LEARNING_PREFIX_CHARS: usize = 4;

const MAX_TAG_CHARS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningParams {
    /// Records at least this similar to the query count as the same text.
    pub near_duplicate_similarity: f32,
    /// Pseudo-count; history outweighs the pattern score once n > prior.
    pub prior: f32,
    /// Upper bound on the historical weight.
    pub max_history_weight: f32,
}

impl Default for LearningParams {
    fn default() -> Self {
        Self {
            near_duplicate_similarity: 0.85,
            prior: 2.0,
            max_history_weight: 0.9,
        }
    }
}

/// Blended score for one text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovedScore {
    /// 0..=100.
    pub score: f32,
    pub reasons: Vec<String>,
    /// Weighted share of the majority verdict, scaled by evidence weight; 0 without history.
    pub historical_confidence: f32,
    pub record_count: usize,
}

/// One member of a batch lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningQuery {
    pub id: MessageId,
    pub text: String,
    #[serde(default)]
    pub brand: Option<String>,
}

/// Bulk lookup key for already-normalized text.
pub fn learning_prefix(normalized: &str) -> String {
    normalized.chars().take(LEARNING_PREFIX_CHARS).collect()
}

/// Compact summary of what a text looks like: `LONE:stop`, `CONTAINS:bit.ly`.
pub fn pattern_tag(raw: &str, normalized: &str) -> String {
    let tag = if let Some(domain) = shortener_domains(raw).into_iter().next() {
        format!("CONTAINS:{domain}")
    } else {
        let toks = tokens(normalized);
        match toks.len() {
            0 => "EMPTY".to_string(),
            1 => format!("LONE:{}", toks[0]),
            _ => format!("CONTAINS:{}", toks.iter().take(3).copied().collect::<Vec<_>>().join(" ")),
        }
    };
    tag.chars().take(MAX_TAG_CHARS).collect()
}

fn brand_in_scope(record_brand: Option<&str>, query_brand: Option<&str>) -> bool {
    match brand_key(query_brand) {
        None => true,
        Some(q) => match brand_key(record_brand) {
            None => true,
            Some(r) => r == q,
        },
    }
}

/// Pure blend over candidate records. Candidates may include records for other
/// texts; only same-prefix, in-scope, near-identical ones count.
pub fn blend(
    normalized: &str,
    brand: Option<&str>,
    pattern: &PatternAnalysis,
    candidates: &[LearningRecord],
    params: &LearningParams,
) -> ImprovedScore {
    let prefix = learning_prefix(normalized);
    let mut matched: Vec<(&LearningRecord, f32)> = Vec::new();
    if !normalized.is_empty() {
        for r in candidates {
            if learning_prefix(&r.normalized_text) != prefix
                || !brand_in_scope(r.brand.as_deref(), brand)
            {
                continue;
            }
            let weight = if r.normalized_text == normalized {
                1.0
            } else {
                let s = similarity(&r.normalized_text, normalized);
                if s < params.near_duplicate_similarity {
                    continue;
                }
                s
            };
            matched.push((r, weight));
        }
    }
    matched.sort_by_key(|(r, _)| r.id);

    let mut reasons = pattern.reasons.clone();
    if matched.is_empty() {
        return ImprovedScore {
            score: pattern.score as f32,
            reasons,
            historical_confidence: 0.0,
            record_count: 0,
        };
    }

    let (mut spam_w, mut ham_w) = (0.0f32, 0.0f32);
    let mut spam_n = 0usize;
    for (r, w) in &matched {
        if r.is_spam {
            spam_w += w;
            spam_n += 1;
        } else {
            ham_w += w;
        }
    }
    let n = matched.len();
    let total = (spam_w + ham_w).max(f32::EPSILON);
    let spam_share = spam_w / total;
    let majority_share = spam_w.max(ham_w) / total;
    let w = (n as f32 / (n as f32 + params.prior.max(0.0))).min(params.max_history_weight);

    let score = (w * spam_share * 100.0 + (1.0 - w) * pattern.score as f32).clamp(0.0, 100.0);
    reasons.push(format!(
        "history: {spam_n}/{n} spam verdicts ({:.0}% agreement)",
        majority_share * 100.0
    ));

    ImprovedScore {
        score,
        reasons,
        historical_confidence: (majority_share * w).clamp(0.0, 1.0),
        record_count: n,
    }
}

/// Learning store operations bound to a backing store.
#[derive(Clone)]
pub struct Learning {
    store: Arc<dyn Store>,
    guard: Arc<StoreGuard>,
    params: LearningParams,
}

impl Learning {
    pub fn new(store: Arc<dyn Store>, guard: Arc<StoreGuard>, params: LearningParams) -> Self {
        Self {
            store,
            guard,
            params,
        }
    }

    pub fn params(&self) -> &LearningParams {
        &self.params
    }

    /// Append one immutable verdict for `text`.
    pub async fn learn_from_spam_decision(
        &self,
        text: &str,
        is_spam: bool,
        brand: Option<&str>,
        source: LearningSource,
    ) -> EngineResult<LearningRecord> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Err(EngineError::validation(
                "learning text is empty after normalization",
            ));
        }
        let pattern = analyze(text);
        let record = NewLearningRecord {
            pattern_tag: pattern_tag(text, &normalized),
            normalized_text: normalized,
            brand: brand.map(str::trim).filter(|b| !b.is_empty()).map(str::to_string),
            is_spam,
            score: pattern.score,
            reasons: pattern.reasons,
            source,
            created_at: Utc::now(),
        };

        let store = &self.store;
        let saved = self
            .guard
            .run("append_learning", || store.append_learning(record.clone()))
            .await?;

        counter!("spam_learning_records_total").increment(1);
        info!(
            target: "spam",
            id = %anon_hash(&saved.normalized_text),
            is_spam,
            source = source.as_str(),
            tag = %saved.pattern_tag,
            "learning record appended"
        );
        Ok(saved)
    }

    /// Blended score for a single text.
    pub async fn get_improved_spam_score(
        &self,
        text: &str,
        brand: Option<&str>,
    ) -> EngineResult<ImprovedScore> {
        let normalized = normalize(text);
        let pattern = analyze(text);
        if normalized.is_empty() {
            return Ok(blend(&normalized, brand, &pattern, &[], &self.params));
        }
        let prefixes = vec![learning_prefix(&normalized)];
        let store = &self.store;
        let candidates = self
            .guard
            .run("learning_by_prefixes", || store.learning_by_prefixes(&prefixes))
            .await?;
        Ok(blend(&normalized, brand, &pattern, &candidates, &self.params))
    }

    /// Blended scores for many texts with one bulk lookup across all distinct
    /// (prefix, brand) keys.
    pub async fn get_batch_improved_spam_scores(
        &self,
        items: &[LearningQuery],
    ) -> EngineResult<HashMap<MessageId, ImprovedScore>> {
        let prepared: Vec<(&LearningQuery, String)> =
            items.iter().map(|q| (q, normalize(&q.text))).collect();

        let keys: BTreeSet<(String, Option<String>)> = prepared
            .iter()
            .filter(|(_, n)| !n.is_empty())
            .map(|(q, n)| (learning_prefix(n), brand_key(q.brand.as_deref())))
            .collect();
        let prefixes: Vec<String> = keys
            .iter()
            .map(|(p, _)| p.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let candidates = if prefixes.is_empty() {
            Vec::new()
        } else {
            let store = &self.store;
            self.guard
                .run("learning_by_prefixes", || store.learning_by_prefixes(&prefixes))
                .await?
        };
        debug!(
            target: "spam",
            items = items.len(),
            keys = keys.len(),
            candidates = candidates.len(),
            "batch learning lookup"
        );

        Ok(prepared
            .into_iter()
            .map(|(q, normalized)| {
                let pattern = analyze(&q.text);
                let score = blend(&normalized, q.brand.as_deref(), &pattern, &candidates, &self.params);
                (q.id, score)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: i64, text: &str, brand: Option<&str>, is_spam: bool) -> LearningRecord {
        LearningRecord {
            id,
            normalized_text: normalize(text),
            brand: brand.map(str::to_string),
            is_spam,
            score: 0,
            reasons: vec![],
            pattern_tag: String::new(),
            source: LearningSource::Agent,
            created_at: Utc::now(),
        }
    }

    fn none() -> PatternAnalysis {
        PatternAnalysis::default()
    }

    #[test]
    fn no_history_falls_back_to_pattern() {
        let p = analyze("STOP");
        let s = blend("stop", None, &p, &[], &LearningParams::default());
        assert_eq!(s.score, p.score as f32);
        assert_eq!(s.historical_confidence, 0.0);
        assert_eq!(s.record_count, 0);
    }

    #[test]
    fn evidence_weight_grows_with_count() {
        let params = LearningParams::default();
        let one = vec![rec(1, "great deal today", None, true)];
        let four: Vec<_> = (1..=4).map(|i| rec(i, "great deal today", None, true)).collect();

        let s1 = blend("great deal today", None, &none(), &one, &params);
        let s4 = blend("great deal today", None, &none(), &four, &params);
        assert!((s1.score - 100.0 / 3.0).abs() < 1e-3, "got {}", s1.score);
        assert!((s4.score - 100.0 * 4.0 / 6.0).abs() < 1e-3, "got {}", s4.score);
        assert!(s4.historical_confidence > s1.historical_confidence);
    }

    #[test]
    fn mixed_verdicts_lower_confidence() {
        let params = LearningParams::default();
        let recs = vec![
            rec(1, "call me", None, true),
            rec(2, "call me", None, true),
            rec(3, "call me", None, false),
            rec(4, "call me", None, false),
        ];
        let s = blend("call me", None, &none(), &recs, &params);
        assert!((s.historical_confidence - 0.5 * (4.0 / 6.0)).abs() < 1e-4);
        assert!(s.reasons.iter().any(|r| r == "history: 2/4 spam verdicts (50% agreement)"));
    }

    #[test]
    fn near_duplicates_count_but_other_texts_do_not() {
        let params = LearningParams::default();
        let recs = vec![
            rec(1, "claim your reward now", None, true),
            rec(2, "claim your rewards now", None, true),
            rec(3, "claim denied sorry", None, false),
        ];
        let s = blend("claim your reward now", None, &none(), &recs, &params);
        assert_eq!(s.record_count, 2);
    }

    #[test]
    fn brand_scoping() {
        let params = LearningParams::default();
        let recs = vec![
            rec(1, "hello again", Some("Acme"), true),
            rec(2, "hello again", Some("Other"), true),
            rec(3, "hello again", None, true),
        ];
        assert_eq!(blend("hello again", Some("acme"), &none(), &recs, &params).record_count, 2);
        assert_eq!(blend("hello again", None, &none(), &recs, &params).record_count, 3);
    }

    #[test]
    fn pattern_tags() {
        assert_eq!(pattern_tag("STOP", "stop"), "LONE:stop");
        assert_eq!(pattern_tag("go to bit.ly/abc", "go to bitlyabc"), "CONTAINS:bit.ly");
        assert_eq!(pattern_tag("win a free cruise now", "win a free cruise now"), "CONTAINS:win a free");
        assert_eq!(pattern_tag("🎉", ""), "EMPTY");
    }

    #[test]
    fn prefix_is_char_based() {
        assert_eq!(learning_prefix("über alles"), "über");
        assert_eq!(learning_prefix("ok"), "ok");
    }
}
