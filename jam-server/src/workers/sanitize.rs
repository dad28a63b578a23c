//! Cleaning of client-supplied session fields

use lazy_static::lazy_static;
use regex::Regex;

/// Longest title kept
pub const TITLE_MAX: usize = 64;
/// Longest description kept
pub const DESCRIPTION_MAX: usize = 256;

lazy_static! {
    static ref DISALLOWED: Regex = Regex::new(r"[^A-Za-z0-9 _.,!?'-]").unwrap();
}

/// Strip characters outside the allowed set, trim, and cut to `max_chars`
pub fn sanitize(text: &str, max_chars: usize) -> String {
    let cleaned = DISALLOWED.replace_all(text, "");
    cleaned.trim().chars().take(max_chars).collect::<String>().trim_end().to_string()
}
