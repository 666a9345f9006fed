//! Fuzzy keyword matching for known spam variants ("unl0ck", "cla1m", "freee").
//!
//! Similarity: `strsim::normalized_levenshtein` (returns f64 -> cast to f32).
//! Fuzzy matching is a fallback only. It runs after an exact match failed, and only
//! for allow-listed keywords, because edit distance on arbitrary short words flags
//! ordinary misspellings of legitimate messages.

use strsim::normalized_levenshtein;

use crate::normalize::tokens;

/// Similarity required for a single-token fuzzy hit.
pub const SINGLE_TOKEN_THRESHOLD: f32 = 0.70;
/// Similarity required for a multi-word phrase fuzzy hit.
pub const PHRASE_THRESHOLD: f32 = 0.75;

/// Keywords with common obfuscated spellings in the wild.
const FUZZY_ALLOW_LIST: &[&str] = &[
    "unlock",
    "claim",
    "win",
    "winner",
    "free",
    "prize",
    "reward",
    "bonus",
    "verify",
    "urgent",
    "offer",
    "gift",
    "cash",
    "click",
    "congratulations",
    "unsubscribe",
];

/// Normalized Levenshtein similarity in [0.0, 1.0].
pub fn similarity(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    normalized_levenshtein(a, b) as f32
}

/// True if some window of `needle`'s token length in `haystack` is at least
/// `threshold` similar to `needle`. Both sides are expected normalized.
pub fn fuzzy_contains(haystack: &str, needle: &str, threshold: f32) -> bool {
    let hay = tokens(haystack);
    let pat = tokens(needle);
    if pat.is_empty() || hay.is_empty() {
        return false;
    }
    let width = pat.len();
    if hay.len() < width {
        return similarity(haystack, needle) >= threshold;
    }
    let needle = pat.join(" ");
    hay.windows(width)
        .any(|w| similarity(&w.join(" "), &needle) >= threshold)
}

/// Keywords shorter than this only match obfuscated spellings (`c4sh`, `freee`);
/// one edit on a 3-5 letter word lands on ordinary words ("case", "wine", "clock").
pub const MIN_EDIT_FUZZY_CHARS: usize = 6;

/// Letters a digit commonly stands in for.
fn leet_letters(c: char) -> &'static [char] {
    match c {
        '0' => &['o'],
        '1' => &['i', 'l'],
        '3' => &['e'],
        '4' => &['a'],
        '5' => &['s'],
        '7' => &['t'],
        '8' => &['b'],
        '9' => &['g'],
        _ => &[],
    }
}

fn collapse_runs(word: &str) -> Vec<char> {
    let mut out: Vec<char> = Vec::with_capacity(word.len());
    for c in word.chars() {
        if out.last() != Some(&c) {
            out.push(c);
        }
    }
    out
}

/// True if `token` spells `keyword` with digits for letters and/or stretched
/// letters: `unl0ck`, `cla1m`, `fr33`, `freee`.
pub fn is_obfuscated_variant(token: &str, keyword: &str) -> bool {
    let tok = collapse_runs(token);
    let key = collapse_runs(keyword);
    tok.len() == key.len()
        && tok
            .iter()
            .zip(&key)
            .all(|(t, k)| t == k || leet_letters(*t).contains(k))
}

/// Single-keyword fuzzy fallback: any token that is an obfuscated spelling of
/// `keyword`, or, for keywords of at least `MIN_EDIT_FUZZY_CHARS`, one that is
/// `SINGLE_TOKEN_THRESHOLD` similar.
pub fn fuzzy_token_match(haystack: &str, keyword: &str) -> bool {
    let edit_ok = keyword.chars().count() >= MIN_EDIT_FUZZY_CHARS;
    tokens(haystack).into_iter().any(|tok| {
        is_obfuscated_variant(tok, keyword)
            || (edit_ok && similarity(tok, keyword) >= SINGLE_TOKEN_THRESHOLD)
    })
}

/// Single-word patterns eligible for fuzzy fallback.
pub fn is_fuzzy_allowed(pattern: &str) -> bool {
    FUZZY_ALLOW_LIST.contains(&pattern) && !looks_like_typo(pattern)
}

/// Short, consonant-heavy words ("txt", "pls", "thx") read like abbreviations or
/// typos; fuzzy matching them would hit half the dictionary.
pub fn looks_like_typo(word: &str) -> bool {
    let letters: Vec<char> = word.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return true;
    }
    if letters.len() > 4 {
        return false;
    }
    let vowels = letters
        .iter()
        .filter(|c| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y'))
        .count();
    (vowels as f32 / letters.len() as f32) < 0.25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity("unlock", "unlock"), 1.0);
        assert!(similarity("unlock", "unl0ck") > 0.8);
        assert!(similarity("abc", "xyz") < 0.1);
    }

    #[test]
    fn fuzzy_contains_finds_obfuscated_word() {
        assert!(fuzzy_contains("tap here to unl0ck your account", "unlock", SINGLE_TOKEN_THRESHOLD));
        assert!(!fuzzy_contains("the lock is broken", "unlock", SINGLE_TOKEN_THRESHOLD));
    }

    #[test]
    fn obfuscated_spellings_match_short_keywords() {
        assert!(fuzzy_token_match("you w1n today", "win"));
        assert!(fuzzy_token_match("get it fr33", "free"));
        assert!(fuzzy_token_match("freee stuff", "free"));
        assert!(fuzzy_token_match("c4sh waiting", "cash"));
        assert!(fuzzy_token_match("cla1m now", "claim"));
        assert!(fuzzy_token_match("tap to unl0ck", "unlock"));
    }

    #[test]
    fn one_edit_on_short_keywords_is_not_a_match() {
        assert!(!fuzzy_token_match("question about my case", "cash"));
        assert!(!fuzzy_token_match("a glass of wine", "win"));
        assert!(!fuzzy_token_match("the tree fell", "free"));
        assert!(!fuzzy_token_match("thanks for the gifts", "gift"));
        assert!(!fuzzy_token_match("the clock stopped", "click"));
    }

    #[test]
    fn long_keywords_keep_edit_distance() {
        assert!(fuzzy_token_match("please unsubscibe me", "unsubscribe"));
        assert!(!fuzzy_token_match("the lock is broken", "unlock"));
    }

    #[test]
    fn fuzzy_contains_phrase_window() {
        assert!(fuzzy_contains("you can claim you prize today", "claim your prize", PHRASE_THRESHOLD));
        assert!(!fuzzy_contains("call me back later", "claim your prize", PHRASE_THRESHOLD));
    }

    #[test]
    fn typo_shaped_words_are_not_fuzzy() {
        assert!(looks_like_typo("txt"));
        assert!(looks_like_typo("pls"));
        assert!(!looks_like_typo("win"));
        assert!(!is_fuzzy_allowed("pls"));
        assert!(is_fuzzy_allowed("claim"));
        assert!(!is_fuzzy_allowed("hello"));
    }
}
