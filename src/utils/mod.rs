//! Shared utilities.
//!
//! JSON extraction from LLM responses and a bounded ring buffer used for
//! escalation and session history.

pub mod bounded;
pub mod json_extraction;

pub use bounded::BoundedLog;
pub use json_extraction::{
    extract_first_json_object, extract_from_generic_code_block, extract_from_json_code_block,
    find_matching_brace,
};
