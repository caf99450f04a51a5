use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::RunOutput;

/// Printed by decoders in place of byte sequences they could not decode.
pub const REPLACEMENT_CHAR: char = '\u{FFFD}';
pub const MIN_PRINTABLE_RATIO: f64 = 0.7;
pub const MIN_LETTER_RATIO: f64 = 0.35;

static LEADING_ROLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(assistant|answer)\s*:\s*").expect("valid regex"));
static INNER_ROLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\n\s*(assistant|answer)\s*:\s*").expect("valid regex"));
static NEW_TURN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\n\s*(user|assistant|question)\s*:\s*").expect("valid regex"));
static PROMPT_USER_TURN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)User:\s*(.*?)\nAssistant:\s*$").expect("valid regex")
});

/// Removes role echoes, anything past the next turn marker, and a verbatim
/// copy of the user's last message from a model reply.
pub fn clean_reply(text: &str, prompt: &str) -> String {
    let normalized = text.replace('\r', "");
    let trimmed = normalized.trim();

    let stripped = LEADING_ROLE.replace(trimmed, "");
    let stripped = INNER_ROLE.replace_all(&stripped, "\n");

    let first_turn = NEW_TURN.split(&stripped).next().unwrap_or_default().trim();

    match echoed_user_message(prompt) {
        Some(echoed) => strip_prefix_ignore_case(first_turn, echoed).trim().to_string(),
        None => first_turn.to_string(),
    }
}

fn echoed_user_message(prompt: &str) -> Option<&str> {
    PROMPT_USER_TURN
        .captures(prompt)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> &'a str {
    match text.get(..prefix.len()) {
        Some(head) if head.to_lowercase() == prefix.to_lowercase() => &text[prefix.len()..],
        _ => text,
    }
}

/// Pulls the generated continuation out of the dependency's final return value.
pub fn extract_generated_text(output: &RunOutput, prompt: &str) -> String {
    match output {
        RunOutput::Text(full) => full.strip_prefix(prompt).unwrap_or(full).trim().to_string(),
        RunOutput::Messages(messages) => messages
            .last()
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Heuristic for corrupted output from a misbehaving accelerated backend.
pub fn is_garbled(text: &str) -> bool {
    if text.is_empty() || text.contains(REPLACEMENT_CHAR) {
        return true;
    }

    let mut total = 0usize;
    let mut printable = 0usize;
    let mut letters = 0usize;
    for c in text.chars() {
        total += 1;
        if (' '..='~').contains(&c) {
            printable += 1;
        }
        if c.is_ascii_alphabetic() {
            letters += 1;
        }
    }

    let total = total.max(1) as f64;
    printable as f64 / total < MIN_PRINTABLE_RATIO || letters as f64 / total < MIN_LETTER_RATIO
}
