// src/analyze/mod.rs
//! Scoring pipeline entry: rules + pattern heuristics per message, run data-parallel
//! over a page with rayon.
//!
//! Per-item failures stay per-item: an over-long text or a panic inside scoring marks
//! that message errored (no hits) and the rest of the page is unaffected.

pub mod fuzzy;
pub mod pattern;
pub mod rules;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rayon::prelude::*;

use crate::decision::{primary_hits, MatchHit, Thresholds};
use crate::model::Message;

pub use crate::analyze::pattern::{analyze, PatternAnalysis};
pub use crate::analyze::rules::{match_rules, Rule, RuleMode};

/// Outcome of scoring one message with rules and pattern heuristics.
#[derive(Debug, Clone, PartialEq)]
pub enum Scored {
    Done {
        rule_hits: Vec<String>,
        pattern: PatternAnalysis,
        /// Rule and pattern hits; empty means learning decides.
        hits: Vec<MatchHit>,
    },
    Errored(String),
}

impl Scored {
    pub fn is_errored(&self) -> bool {
        matches!(self, Scored::Errored(_))
    }
}

pub fn score_message(msg: &Message, rules: &[Rule], t: &Thresholds, max_text_chars: usize) -> Scored {
    if msg.text.chars().count() > max_text_chars {
        return Scored::Errored(format!("text longer than {max_text_chars} chars"));
    }
    let run = catch_unwind(AssertUnwindSafe(|| {
        let rule_hits = match_rules(msg.brand.as_deref(), &msg.text, rules);
        let pattern = analyze(&msg.text);
        let hits = primary_hits(&rule_hits, &pattern, t);
        (rule_hits, pattern, hits)
    }));
    match run {
        Ok((rule_hits, pattern, hits)) => Scored::Done {
            rule_hits,
            pattern,
            hits,
        },
        Err(_) => Scored::Errored("scoring panicked".into()),
    }
}

/// Scores every message on the rayon pool; output order matches `page`.
pub fn score_page(page: &[Message], rules: &[Rule], t: &Thresholds, max_text_chars: usize) -> Vec<Scored> {
    page.par_iter()
        .map(|m| score_message(m, rules, t, max_text_chars))
        .collect()
}

/// `score_page` on the blocking pool, for use from async code.
pub async fn score_page_blocking(
    page: Arc<Vec<Message>>,
    rules: Arc<Vec<Rule>>,
    t: Thresholds,
    max_text_chars: usize,
) -> Vec<Scored> {
    let len = page.len();
    tokio::task::spawn_blocking(move || score_page(&page, &rules, &t, max_text_chars))
        .await
        .unwrap_or_else(|_| vec![Scored::Errored("scoring task failed".into()); len])
}
