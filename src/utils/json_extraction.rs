//! JSON extraction utilities for parsing LLM responses.
//!
//! Repair suggestions often wrap JSON in markdown code blocks or surround it
//! with explanatory text. These helpers locate the JSON object without
//! attempting to validate it; callers deserialize the result themselves.
//!
//! # Example
//!
//! ```
//! use buildloop::utils::json_extraction::extract_from_json_code_block;
//!
//! let response = "Here is the fix:\n```json\n{\"changes\": []}\n```";
//! assert_eq!(extract_from_json_code_block(response).as_deref(), Some("{\"changes\": []}"));
//! ```

use std::sync::OnceLock;

use regex::Regex;

fn json_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?i:json)[ \t]*\r?\n?([\s\S]*?)```").ok())
        .as_ref()
}

fn generic_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```[\w+-]*[ \t]*\r?\n?([\s\S]*?)```").ok())
        .as_ref()
}

/// Helper function to find the matching closing brace for a JSON object.
///
/// This function properly handles:
/// - Nested braces
/// - String literals (including escaped quotes)
/// - Escape sequences within strings
///
/// # Arguments
///
/// * `s` - A string starting with '{'
///
/// # Returns
///
/// The index of the matching closing '}', or None if not found.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                depth += 1;
            }
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Returns the first balanced `{...}` in `content`.
pub fn extract_first_json_object(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let end = find_matching_brace(&content[start..])?;
    Some(content[start..=start + end].to_string())
}

/// Extract the JSON object from a ```json ... ``` code block.
pub fn extract_from_json_code_block(content: &str) -> Option<String> {
    json_block_regex()?
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .find_map(|body| extract_first_json_object(body.as_str().trim()))
}

/// Extract the JSON object from the first ``` ... ``` block that holds one,
/// whatever its language tag.
pub fn extract_from_generic_code_block(content: &str) -> Option<String> {
    generic_block_regex()?
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .find_map(|body| extract_first_json_object(body.as_str().trim()))
}
