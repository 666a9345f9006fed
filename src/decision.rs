//! decision.rs: tagged match hits and the per-path thresholds that produce them.
//!
//! A message is flagged when at least one hit exists. Hits are typed so the preview
//! surface and the stored annotations render the same way.

use serde::{Deserialize, Serialize};

use crate::analyze::pattern::PatternAnalysis;
use crate::learning::ImprovedScore;

/// Why a message was (or would be) flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchHit {
    Rule { pattern: String },
    Pattern { score: u32, reasons: Vec<String> },
    History { score: f32, confidence: f32 },
}

impl MatchHit {
    /// Human-readable detail without the kind prefix.
    pub fn detail(&self) -> String {
        match self {
            MatchHit::Rule { pattern } => format!("\"{pattern}\""),
            MatchHit::Pattern { score, reasons } => {
                let top = reasons.first().map(String::as_str).unwrap_or("heuristics");
                format!("{score} ({top})")
            }
            MatchHit::History { score, confidence } => {
                format!("{:.0} (confidence {:.0}%)", score, confidence * 100.0)
            }
        }
    }

    /// Short annotation stored on the message while in review.
    pub fn annotation(&self) -> String {
        let kind = match self {
            MatchHit::Rule { .. } => "rule",
            MatchHit::Pattern { .. } => "pattern",
            MatchHit::History { .. } => "history",
        };
        format!("{kind}: {}", self.detail())
    }
}

/// Decision thresholds, one per scoring path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Pattern-only path: flag when `score >= pattern`.
    pub pattern: u32,
    /// Learning-blended path: flag when `score >= learning`.
    pub learning: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pattern: 50,
            learning: 60.0,
        }
    }
}

impl Thresholds {
    pub fn pattern_hit(&self, score: u32) -> bool {
        score >= self.pattern
    }

    pub fn learning_hit(&self, score: f32) -> bool {
        score >= self.learning
    }
}

/// Rule and pattern hits for one message. Learning is consulted separately, only
/// when this returns nothing.
pub fn primary_hits(rule_hits: &[String], pattern: &PatternAnalysis, t: &Thresholds) -> Vec<MatchHit> {
    let mut hits: Vec<MatchHit> = rule_hits
        .iter()
        .map(|p| MatchHit::Rule { pattern: p.clone() })
        .collect();
    if t.pattern_hit(pattern.score) {
        hits.push(MatchHit::Pattern {
            score: pattern.score,
            reasons: pattern.reasons.clone(),
        });
    }
    hits
}

pub fn history_hit(score: &ImprovedScore, t: &Thresholds) -> Option<MatchHit> {
    t.learning_hit(score.score).then(|| MatchHit::History {
        score: score.score,
        confidence: score.historical_confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pattern(score: u32) -> PatternAnalysis {
        PatternAnalysis {
            score,
            reasons: vec!["single command word: stop".into()],
        }
    }

    #[test]
    fn pattern_threshold_is_inclusive() {
        let t = Thresholds::default();
        assert_eq!(primary_hits(&[], &pattern(50), &t).len(), 1);
        assert!(primary_hits(&[], &pattern(49), &t).is_empty());
    }

    #[test]
    fn learning_threshold_is_inclusive() {
        let t = Thresholds::default();
        let at = ImprovedScore {
            score: 60.0,
            reasons: vec![],
            historical_confidence: 1.0,
            record_count: 2,
        };
        let below = ImprovedScore { score: 59.9, ..at.clone() };
        assert!(history_hit(&at, &t).is_some());
        assert!(history_hit(&below, &t).is_none());
    }

    #[test]
    fn rule_hits_come_first() {
        let hits = primary_hits(&["unsubscribe".into()], &pattern(60), &Thresholds::default());
        assert_eq!(hits[0], MatchHit::Rule { pattern: "unsubscribe".into() });
        assert!(matches!(hits[1], MatchHit::Pattern { score: 60, .. }));
    }

    #[test]
    fn hits_serialize_as_tagged_variants() {
        let v = serde_json::to_value(MatchHit::Rule { pattern: "stop".into() }).unwrap();
        assert_eq!(v, json!({"kind": "rule", "pattern": "stop"}));
        let h = MatchHit::History { score: 72.0, confidence: 0.8 };
        assert_eq!(h.annotation(), "history: 72 (confidence 80%)");
        assert_eq!(pattern_hit_annotation(), "pattern: 55 (single command word: stop)");
    }

    fn pattern_hit_annotation() -> String {
        MatchHit::Pattern {
            score: 55,
            reasons: vec!["single command word: stop".into()],
        }
        .annotation()
    }
}
