//! Text canonicalization shared by every matching stage.
//!
//! `normalize` lower-cases, drops zero-width/format characters and punctuation
//! (Unicode letters, digits and whitespace survive), then collapses whitespace.
//! Rules, learning records and incoming messages all go through the same function,
//! so equality on the normalized form is the only equality the engine uses.

/// Zero-width and invisible formatting characters commonly used to dodge filters.
fn is_zero_width(ch: char) -> bool {
    matches!(
        ch,
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}' | '\u{180E}'
    )
}

/// Canonical form: lower-case, no punctuation, no zero-width chars, single spaces.
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = true;
    for ch in input.chars() {
        if is_zero_width(ch) {
            continue;
        }
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Whitespace tokens of already-normalized text.
pub fn tokens(normalized: &str) -> Vec<&str> {
    normalized.split(' ').filter(|t| !t.is_empty()).collect()
}

/// Brand comparison key: trimmed, lower-cased, `None` when blank.
pub fn brand_key(brand: Option<&str>) -> Option<String> {
    brand
        .map(|b| b.trim().to_lowercase())
        .filter(|b| !b.is_empty())
}
