//! Static phrase rules (administrator-authored, read-only to the engine).
//!
//! Two match modes over the normalized message text:
//! - `lone`:     the entire message equals the pattern ("stop" matches "STOP!" but not "please stop")
//! - `contains`: whole-word / word-boundary phrase match, with a fuzzy fallback for
//!               allow-listed keywords (see `fuzzy`)
//!
//! Brand scoping is applied before any text work: a rule with a brand only ever
//! matches messages of that brand (case-insensitive).

use serde::{Deserialize, Serialize};

use crate::analyze::fuzzy::{self, PHRASE_THRESHOLD};
use crate::normalize::{brand_key, normalize, tokens};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    Contains,
    Lone,
}

impl RuleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleMode::Contains => "contains",
            RuleMode::Lone => "lone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contains" => Some(RuleMode::Contains),
            "lone" => Some(RuleMode::Lone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub pattern: String,
    /// Precomputed `normalize(pattern)`.
    pub normalized_pattern: String,
    pub mode: RuleMode,
    #[serde(default)]
    pub brand: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub note: Option<String>,
}

impl Rule {
    /// Enabled, global rule; `id` is assigned by the store.
    pub fn new(pattern: impl Into<String>, mode: RuleMode) -> Self {
        let pattern = pattern.into();
        Self {
            id: 0,
            normalized_pattern: normalize(&pattern),
            pattern,
            mode,
            brand: None,
            enabled: true,
            note: None,
        }
    }

    pub fn for_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn applies_to_brand(&self, message_brand: Option<&str>) -> bool {
        match brand_key(self.brand.as_deref()) {
            None => true,
            Some(rule_brand) => brand_key(message_brand).as_deref() == Some(rule_brand.as_str()),
        }
    }
}

/// A message prepared once for matching against many rules.
pub struct Prepared<'a> {
    brand: Option<&'a str>,
    text: String,
}

impl<'a> Prepared<'a> {
    pub fn new(brand: Option<&'a str>, raw_text: &str) -> Self {
        Self {
            brand,
            text: normalize(raw_text),
        }
    }
}

/// Returns the literal patterns of all enabled rules matching the message.
pub fn match_rules(brand: Option<&str>, text: &str, rules: &[Rule]) -> Vec<String> {
    let prepared = Prepared::new(brand, text);
    rules
        .iter()
        .filter(|r| rule_matches(r, &prepared))
        .map(|r| r.pattern.clone())
        .collect()
}

pub fn rule_matches(rule: &Rule, msg: &Prepared<'_>) -> bool {
    if !rule.enabled || !rule.applies_to_brand(msg.brand) {
        return false;
    }
    let pat = rule.normalized_pattern.as_str();
    if pat.is_empty() || msg.text.is_empty() {
        return false;
    }

    match rule.mode {
        RuleMode::Lone => msg.text == pat,
        RuleMode::Contains => {
            let pat_tokens = tokens(pat);
            if pat_tokens.len() == 1 {
                if tokens(&msg.text).contains(&pat) {
                    return true;
                }
                fuzzy::is_fuzzy_allowed(pat) && fuzzy::fuzzy_token_match(&msg.text, pat)
            } else {
                if contains_phrase(&msg.text, pat) {
                    return true;
                }
                fuzzy::fuzzy_contains(&msg.text, pat, PHRASE_THRESHOLD)
            }
        }
    }
}

/// Word-boundary phrase containment on normalized (single-spaced) text.
fn contains_phrase(text: &str, phrase: &str) -> bool {
    let padded_text = format!(" {text} ");
    let padded_phrase = format!(" {phrase} ");
    padded_text.contains(&padded_phrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_rule_is_case_and_punctuation_insensitive() {
        let rules = vec![Rule::new("unsubscribe", RuleMode::Contains)];
        let hits = match_rules(None, "Please UNSUBSCRIBE me now", &rules);
        assert_eq!(hits, vec!["unsubscribe".to_string()]);
    }

    #[test]
    fn lone_versus_contains() {
        let lone = vec![Rule::new("stop", RuleMode::Lone)];
        let contains = vec![Rule::new("stop", RuleMode::Contains)];

        assert_eq!(match_rules(None, "stop", &lone).len(), 1);
        assert_eq!(match_rules(None, "STOP!", &lone).len(), 1);
        assert!(match_rules(None, "please stop now", &lone).is_empty());

        assert_eq!(match_rules(None, "stop", &contains).len(), 1);
        assert_eq!(match_rules(None, "please stop now", &contains).len(), 1);
    }

    #[test]
    fn single_word_needs_whole_word() {
        let rules = vec![Rule::new("stop", RuleMode::Contains)];
        assert!(match_rules(None, "the bus stops here", &rules).is_empty());
        assert!(match_rules(None, "nonstop deals", &rules).is_empty());
    }

    #[test]
    fn lone_rule_never_fuzzy() {
        let rules = vec![Rule::new("unlock", RuleMode::Lone)];
        assert!(match_rules(None, "unl0ck", &rules).is_empty());
    }

    #[test]
    fn fuzzy_fallback_only_for_allow_listed() {
        let allowed = vec![Rule::new("unlock", RuleMode::Contains)];
        assert_eq!(match_rules(None, "unl0ck your phone now", &allowed).len(), 1);

        let not_allowed = vec![Rule::new("invoice", RuleMode::Contains)];
        assert!(match_rules(None, "your invoise is attached", &not_allowed).is_empty());
    }

    #[test]
    fn short_keywords_do_not_flag_ordinary_words() {
        let rules = vec![
            Rule::new("cash", RuleMode::Contains),
            Rule::new("win", RuleMode::Contains),
            Rule::new("free", RuleMode::Contains),
            Rule::new("gift", RuleMode::Contains),
            Rule::new("click", RuleMode::Contains),
        ];
        for text in [
            "question about my case",
            "which wine goes with fish",
            "a tree fell on the store sign",
            "are gifts wrapped",
            "the clock in the app is wrong",
        ] {
            assert!(match_rules(None, text, &rules).is_empty(), "{text}");
        }
        assert_eq!(match_rules(None, "c4sh prize, you w1n", &rules), vec!["cash", "win"]);
    }

    #[test]
    fn multi_word_phrase_boundaries_and_fuzzy() {
        let rules = vec![Rule::new("claim your prize", RuleMode::Contains)];
        assert_eq!(match_rules(None, "Tap to CLAIM YOUR PRIZE!", &rules).len(), 1);
        assert_eq!(match_rules(None, "claim you prize today", &rules).len(), 1);
        assert!(match_rules(None, "reclaim yours", &rules).is_empty());
    }

    #[test]
    fn brand_scoped_rule() {
        let rules = vec![Rule::new("stop", RuleMode::Contains).for_brand("Acme")];
        assert_eq!(match_rules(Some("acme"), "stop", &rules).len(), 1);
        assert_eq!(match_rules(Some(" ACME "), "stop", &rules).len(), 1);
        assert!(match_rules(Some("Other"), "stop", &rules).is_empty());
        assert!(match_rules(None, "stop", &rules).is_empty());
    }

    #[test]
    fn disabled_rules_are_ignored() {
        let rules = vec![Rule::new("stop", RuleMode::Contains).disabled()];
        assert!(match_rules(None, "stop", &rules).is_empty());
    }
}
