//! Canonical forms for horse, person, course and race-title names.
//!
//! Two layers exist. [`normalize_name`] keeps word boundaries and is what gets
//! displayed and hashed into race keys. [`name_key`] drops every separator and
//! is what identity comparisons use, so "O'Brien", "OBrien" and "O Brien"
//! collapse to one key.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const GENERATIONAL_SUFFIXES: [&str; 5] = ["ii", "iii", "iv", "v", "vi"];

/// Canonical comparable form of a free-text name. Total and idempotent.
pub fn normalize_name(raw: &str) -> String {
    // Passes only ever shorten the string once casing and accents have settled,
    // so this reaches a fixed point quickly.
    let mut current = normalize_pass(raw);
    loop {
        let next = normalize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Separator-free identity key used for runner matching and dimension uniqueness.
pub fn name_key(raw: &str) -> String {
    normalize_name(raw)
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Course names compare with no separators at all and without the all-weather marker.
pub fn normalize_course_name(raw: &str) -> String {
    let name = normalize_name(raw);
    let name = name
        .strip_suffix(" (aw)")
        .or_else(|| name.strip_suffix(" aw"))
        .unwrap_or(&name);
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '\'')
        .collect()
}

/// True when a race title or type text marks the race as a handicap.
pub fn signals_handicap(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("handicap")
        || lowered.contains("h'cap")
        || lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| token == "hcap")
}

fn normalize_pass(raw: &str) -> String {
    let stripped = strip_country_suffix(raw.trim());
    let lowered = stripped.to_lowercase();
    let without_suffix = strip_generational_suffix(&lowered);
    let unaccented: String = without_suffix
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .nfc()
        .collect();
    let spaced: String = unaccented
        .chars()
        .map(|c| match c {
            '.' | '\'' | '\u{2019}' | '-' | ',' => ' ',
            other => other,
        })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"Kingman (IRE)"` -> `"Kingman"`.
fn strip_country_suffix(input: &str) -> &str {
    let Some(body) = input.strip_suffix(')') else {
        return input;
    };
    let Some(open) = body.rfind('(') else {
        return input;
    };
    let code = &body[open + 1..];
    let is_code = (2..=4).contains(&code.len()) && code.chars().all(|c| c.is_ascii_alphabetic());
    if is_code {
        body[..open].trim_end()
    } else {
        input
    }
}

fn strip_generational_suffix(input: &str) -> &str {
    let trimmed = input.trim_end();
    match trimmed.rsplit_once(char::is_whitespace) {
        Some((head, last)) if GENERATIONAL_SUFFIXES.contains(&last) && !head.trim().is_empty() => {
            head.trim_end()
        }
        _ => trimmed,
    }
}
