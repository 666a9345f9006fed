//! Heuristic, rule-free spamminess scorer.
//!
//! Each structural signal adds a fixed weight and appends exactly one human-readable
//! reason, so any score can be explained from its reasons list. The total is clamped
//! to 0..=100. No I/O; identical input always yields identical output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::normalize::{normalize, tokens};

const W_COMMAND_WORD: u32 = 60;
const W_SHORTENER: u32 = 45;
const W_URL: u32 = 15;
const W_EMOJI_ONLY: u32 = 40;
const W_EMOJI_CLUSTER: u32 = 20;
const W_ALL_CAPS: u32 = 20;
const W_REPEATED: u32 = 15;
const W_VERY_SHORT: u32 = 35;
const W_SINGLE_WORD: u32 = 15;
const W_PROMO_EACH: u32 = 10;
const W_PROMO_CAP: u32 = 30;

const COMMAND_WORDS: &[&str] = &[
    "stop", "quit", "cancel", "end", "unsubscribe", "unsub", "stopall", "ok", "okay", "yes",
    "no", "test", "start", "help", "info", "hi", "hello", "hey", "y", "n", "k",
];

const PROMO_KEYWORDS: &[&str] = &[
    "free",
    "winner",
    "won",
    "prize",
    "claim",
    "cash",
    "urgent",
    "congratulations",
    "giftcard",
    "loan",
    "bitcoin",
    "crypto",
    "bonus",
];

static RE_SHORTENER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(bit\.ly|tinyurl\.com|goo\.gl|t\.co|ow\.ly|is\.gd|buff\.ly|rebrand\.ly|cutt\.ly|shorturl\.at|tiny\.cc|rb\.gy)\b",
    )
    .expect("shortener regex")
});

static RE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(https?://|www\.)\S+").expect("url regex"));

/// Score plus the reasons that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub score: u32,
    pub reasons: Vec<String>,
}

impl PatternAnalysis {
    fn add(&mut self, weight: u32, reason: String) {
        self.score += weight;
        self.reasons.push(reason);
    }
}

pub fn analyze(text: &str) -> PatternAnalysis {
    let mut out = PatternAnalysis::default();
    if text.trim().is_empty() {
        return out;
    }

    let norm = normalize(text);
    let toks = tokens(&norm);
    let is_command = toks.len() == 1 && COMMAND_WORDS.contains(&toks[0]);

    if is_command {
        out.add(W_COMMAND_WORD, format!("single command word: {}", toks[0]));
    }

    let shorteners = shortener_domains(text);
    if !shorteners.is_empty() {
        out.add(W_SHORTENER, format!("link shortener: {}", shorteners.join(", ")));
    } else if RE_URL.is_match(text) {
        out.add(W_URL, "contains link".to_string());
    }

    let emoji = text.chars().filter(|c| is_emoji(*c)).count();
    if emoji > 0 && norm.is_empty() {
        out.add(W_EMOJI_ONLY, format!("emoji-only message ({emoji} emoji)"));
    } else if emoji >= 3 {
        out.add(W_EMOJI_CLUSTER, format!("emoji cluster ({emoji} emoji)"));
    }

    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() >= 6 {
        let upper = letters.iter().filter(|c| c.is_uppercase()).count();
        let ratio = upper as f32 / letters.len() as f32;
        if ratio >= 0.7 {
            out.add(
                W_ALL_CAPS,
                format!("excessive capitalization ({:.0}% upper-case)", ratio * 100.0),
            );
        }
    }

    if let Some((ch, run)) = longest_run(text) {
        if run >= 4 {
            out.add(W_REPEATED, format!("repeated characters ('{ch}' x{run})"));
        }
    }

    if !is_command && !norm.is_empty() {
        let len = norm.chars().count();
        if len <= 3 {
            out.add(W_VERY_SHORT, format!("extremely short message ({len} chars)"));
        } else if toks.len() == 1 {
            out.add(W_SINGLE_WORD, "single-word message".to_string());
        }
    }

    let mut promo = 0;
    for kw in PROMO_KEYWORDS {
        if promo >= W_PROMO_CAP {
            break;
        }
        if toks.contains(kw) {
            out.add(W_PROMO_EACH, format!("promotional keyword: {kw}"));
            promo += W_PROMO_EACH;
        }
    }

    out.score = out.score.min(100);
    out
}

/// Distinct link-shortener domains in raw text, lower-cased, in order of appearance.
pub fn shortener_domains(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in RE_SHORTENER.find_iter(text) {
        let d = m.as_str().to_ascii_lowercase();
        if !out.contains(&d) {
            out.push(d);
        }
    }
    out
}

/// Longest run of one repeated non-whitespace character.
fn longest_run(text: &str) -> Option<(char, usize)> {
    let mut best: Option<(char, usize)> = None;
    let mut prev: Option<char> = None;
    let mut run = 0usize;
    for ch in text.chars() {
        if Some(ch) == prev {
            run += 1;
        } else {
            prev = Some(ch);
            run = 1;
        }
        if ch.is_whitespace() {
            continue;
        }
        if best.map_or(true, |(_, n)| run > n) {
            best = Some((ch, run));
        }
    }
    best
}

fn is_emoji(c: char) -> bool {
    let cp = c as u32;
    (0x1F300..=0x1FAFF).contains(&cp)
        || (0x1F000..=0x1F2FF).contains(&cp)
        || (0x2600..=0x27BF).contains(&cp)
}
