//! Turning repair output into a [`Patch`].
//!
//! Repair agents answer in free text. [`PatchParser`] runs an ordered list of
//! [`PatchStrategy`] values over the text and keeps the first one that yields
//! a non-empty change list:
//!
//! 1. [`JsonStrategy`]: the whole answer is a JSON patch object
//! 2. [`FencedJsonStrategy`]: a JSON patch inside a fenced code block (or
//!    embedded in prose)
//! 3. [`DiffStrategy`]: unified-diff text, one change per file
//!
//! If none matches, parsing fails with [`FixError::PatchFormat`].

use serde::Deserialize;

use crate::error::FixError;
use crate::utils::json_extraction::{
    extract_first_json_object, extract_from_generic_code_block, extract_from_json_code_block,
};

use super::types::{Change, ChangeAction, ChangeFormat, Hunk, Patch, Provenance};

const DEFAULT_CONFIDENCE: f64 = 0.5;

/// A patch as read from repair output, before provenance is attached.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPatch {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

impl RawPatch {
    fn into_patch(self, provenance: Provenance) -> Patch {
        let confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            DEFAULT_CONFIDENCE
        };
        Patch {
            analysis: self.analysis,
            changes: self.changes,
            description: self.description,
            confidence,
            provenance,
        }
    }
}

/// One way of reading a patch out of repair output.
pub trait PatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, text: &str) -> Option<RawPatch>;
}

/// The entire text is a JSON object.
#[derive(Debug, Default)]
pub struct JsonStrategy;

impl PatchStrategy for JsonStrategy {
    fn name(&self) -> &'static str {
        "json"
    }

    fn parse(&self, text: &str) -> Option<RawPatch> {
        serde_json::from_str(text.trim()).ok()
    }
}

/// A JSON object inside a ```` ```json ```` block, any fenced block, or
/// surrounded by prose, tried in that order.
#[derive(Debug, Default)]
pub struct FencedJsonStrategy;

impl PatchStrategy for FencedJsonStrategy {
    fn name(&self) -> &'static str {
        "fenced_json"
    }

    fn parse(&self, text: &str) -> Option<RawPatch> {
        [
            extract_from_json_code_block(text),
            extract_from_generic_code_block(text),
            extract_first_json_object(text),
        ]
        .into_iter()
        .flatten()
        .find_map(|candidate| serde_json::from_str(&candidate).ok())
    }
}

/// Unified diff text (`--- a/x`, `+++ b/x`, `@@` hunks).
///
/// `/dev/null` as the old side means create, as the new side means delete.
/// Modified files carry their hunks for context search-and-replace.
#[derive(Debug, Default)]
pub struct DiffStrategy;

struct FileDiff {
    old_path: String,
    new_path: String,
    hunks: Vec<Hunk>,
}

impl FileDiff {
    fn into_change(self) -> Option<Change> {
        if self.new_path == "/dev/null" {
            return Some(Change::delete(self.old_path));
        }
        if self.hunks.is_empty() {
            return None;
        }
        if self.old_path == "/dev/null" {
            let content: String = self.hunks.iter().map(|h| h.after.as_str()).collect();
            return Some(Change::create(self.new_path, content));
        }
        Some(Change {
            file: self.new_path,
            action: ChangeAction::Modify,
            content: None,
            explanation: String::new(),
            format: ChangeFormat::Hunks,
            hunks: self.hunks,
        })
    }
}

fn diff_path(raw: &str, side_prefix: &str) -> String {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    path.strip_prefix(side_prefix).unwrap_or(path).to_string()
}

/// Old and new line counts declared by a `@@ -a,b +c,d @@` header. A side
/// without `,n` counts one line.
fn hunk_counts(header: &str) -> Option<(u32, u32)> {
    let mut ranges = header.trim_start_matches('@').split_whitespace();
    let count = |range: &str, sign: char| -> Option<u32> {
        let range = range.strip_prefix(sign)?;
        match range.split_once(',') {
            Some((_, n)) => n.parse().ok(),
            None => range.parse::<u32>().ok().map(|_| 1),
        }
    };
    let old = count(ranges.next()?, '-')?;
    let new = count(ranges.next()?, '+')?;
    Some((old, new))
}

impl PatchStrategy for DiffStrategy {
    fn name(&self) -> &'static str {
        "unified_diff"
    }

    fn parse(&self, text: &str) -> Option<RawPatch> {
        let lines: Vec<&str> = text.lines().collect();
        let mut files: Vec<FileDiff> = Vec::new();
        let mut preamble: Vec<&str> = Vec::new();
        let mut current: Option<FileDiff> = None;
        let mut hunk: Option<Hunk> = None;
        // Lines still owed to the open hunk; None when its header had no counts.
        let mut remaining: Option<(u32, u32)> = None;

        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            let in_counted_hunk =
                hunk.is_some() && remaining.is_some_and(|(old, new)| old > 0 || new > 0);

            if let (false, Some(old), Some(new)) = (
                in_counted_hunk,
                line.strip_prefix("--- "),
                lines.get(i + 1).and_then(|next| next.strip_prefix("+++ ")),
            ) {
                if let Some(done) = hunk.take() {
                    if let Some(file) = current.as_mut() {
                        file.hunks.push(done);
                    }
                }
                files.extend(current.take());
                current = Some(FileDiff {
                    old_path: diff_path(old, "a/"),
                    new_path: diff_path(new, "b/"),
                    hunks: Vec::new(),
                });
                i += 2;
                continue;
            }

            match current.as_mut() {
                None => preamble.push(line),
                Some(file) => {
                    if line.starts_with("@@") {
                        if let Some(done) = hunk.take() {
                            file.hunks.push(done);
                        }
                        hunk = Some(Hunk {
                            before: String::new(),
                            after: String::new(),
                        });
                        remaining = hunk_counts(line);
                    } else if let Some(h) = hunk.as_mut() {
                        let (old, new) = remaining.get_or_insert((0, 0));
                        if let Some(rest) = line.strip_prefix('-') {
                            h.before.push_str(rest);
                            h.before.push('\n');
                            *old = old.saturating_sub(1);
                        } else if let Some(rest) = line.strip_prefix('+') {
                            h.after.push_str(rest);
                            h.after.push('\n');
                            *new = new.saturating_sub(1);
                        } else if let Some(rest) = line.strip_prefix(' ') {
                            h.before.push_str(rest);
                            h.before.push('\n');
                            h.after.push_str(rest);
                            h.after.push('\n');
                            *old = old.saturating_sub(1);
                            *new = new.saturating_sub(1);
                        } else if line.is_empty() {
                            h.before.push('\n');
                            h.after.push('\n');
                            *old = old.saturating_sub(1);
                            *new = new.saturating_sub(1);
                        } else if !line.starts_with('\\') {
                            if let Some(done) = hunk.take() {
                                file.hunks.push(done);
                            }
                        }
                    }
                }
            }
            i += 1;
        }

        if let Some(done) = hunk.take() {
            if let Some(file) = current.as_mut() {
                file.hunks.push(done);
            }
        }
        files.extend(current.take());

        let changes: Vec<Change> = files.into_iter().filter_map(FileDiff::into_change).collect();
        if changes.is_empty() {
            return None;
        }

        let description = preamble
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with("```") && !l.starts_with("diff "))
            .collect::<Vec<_>>()
            .join(" ");
        let description = if description.is_empty() {
            format!("Unified diff touching {} file(s)", changes.len())
        } else {
            description
        };

        Some(RawPatch {
            analysis: String::new(),
            changes,
            description,
            confidence: DEFAULT_CONFIDENCE,
        })
    }
}

/// Ordered strategy pipeline.
pub struct PatchParser {
    strategies: Vec<Box<dyn PatchStrategy>>,
}

impl Default for PatchParser {
    fn default() -> Self {
        Self::new(vec![
            Box::new(JsonStrategy),
            Box::new(FencedJsonStrategy),
            Box::new(DiffStrategy),
        ])
    }
}

impl PatchParser {
    pub fn new(strategies: Vec<Box<dyn PatchStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Parses `text`, attaching `provenance` to the resulting patch.
    pub fn parse(&self, text: &str, provenance: Provenance) -> Result<Patch, FixError> {
        for strategy in &self.strategies {
            match strategy.parse(text) {
                Some(raw) if !raw.changes.is_empty() => {
                    tracing::debug!(strategy = strategy.name(), changes = raw.changes.len(), "Parsed patch");
                    return Ok(raw.into_patch(provenance));
                }
                Some(_) => {
                    tracing::debug!(strategy = strategy.name(), "Patch had no changes");
                }
                None => {}
            }
        }

        Err(FixError::PatchFormat(format!(
            "no non-empty change list found (tried {})",
            self.strategy_names().join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH_JSON: &str = r#"{
  "analysis": "off-by-one in the loop bound",
  "changes": [
    {"file": "src/sum.rs", "action": "modify", "content": "pub fn sum() {}", "explanation": "fix bound"}
  ],
  "description": "Fix loop bound",
  "confidence": 0.8
}"#;

    fn provenance() -> Provenance {
        Provenance {
            provider: "stub".to_string(),
            model: "m".to_string(),
            ..Provenance::default()
        }
    }

    #[test]
    fn test_plain_json() {
        let patch = PatchParser::default()
            .parse(PATCH_JSON, provenance())
            .expect("should parse");
        assert_eq!(patch.changes.len(), 1);
        assert_eq!(patch.changes[0].action, ChangeAction::Modify);
        assert!((patch.confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(patch.provenance.provider, "stub");
    }

    #[test]
    fn test_fenced_json_equals_plain_json() {
        let parser = PatchParser::default();
        let fenced = format!("Here is my fix:\n\n```json\n{}\n```\nLet me know.", PATCH_JSON);

        let plain = parser.parse(PATCH_JSON, provenance()).expect("plain");
        let wrapped = parser.parse(&fenced, provenance()).expect("fenced");
        assert_eq!(plain, wrapped);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let text = r#"{"changes": [{"file": "a", "action": "delete"}], "confidence": 7}"#;
        let patch = PatchParser::default().parse(text, provenance()).expect("parse");
        assert_eq!(patch.confidence, 1.0);
    }

    #[test]
    fn test_empty_changes_fail() {
        let err = PatchParser::default()
            .parse(r#"{"analysis": "nothing to do", "changes": []}"#, provenance())
            .unwrap_err();
        assert!(matches!(err, FixError::PatchFormat(_)));
    }

    #[test]
    fn test_garbage_fails_with_strategy_list() {
        let err = PatchParser::default()
            .parse("I could not figure this out.", provenance())
            .unwrap_err();
        assert!(err.to_string().contains("json, fenced_json, unified_diff"));
    }

    #[test]
    fn test_unified_diff_modify_create_delete() {
        let diff = "\
Tighten the bound.
```diff
--- a/src/sum.rs
+++ b/src/sum.rs
@@ -1,3 +1,3 @@
 fn sum(v: &[i32]) -> i32 {
-    v[..v.len() - 1].iter().sum()
+    v.iter().sum()
 }
--- /dev/null
+++ b/tests/new.rs
@@ -0,0 +1,2 @@
+#[test]
+fn it_works() {}
--- a/old.txt
+++ /dev/null
@@ -1 +0,0 @@
-stale
```";
        let patch = PatchParser::default().parse(diff, provenance()).expect("diff");
        assert_eq!(patch.changes.len(), 3);
        assert_eq!(patch.description, "Tighten the bound.");

        let modify = &patch.changes[0];
        assert_eq!(modify.file, "src/sum.rs");
        assert_eq!(modify.format, ChangeFormat::Hunks);
        assert_eq!(
            modify.hunks[0].before,
            "fn sum(v: &[i32]) -> i32 {\n    v[..v.len() - 1].iter().sum()\n}\n"
        );
        assert_eq!(modify.hunks[0].after, "fn sum(v: &[i32]) -> i32 {\n    v.iter().sum()\n}\n");

        let create = &patch.changes[1];
        assert_eq!(create.action, ChangeAction::Create);
        assert_eq!(create.content.as_deref(), Some("#[test]\nfn it_works() {}\n"));

        let delete = &patch.changes[2];
        assert_eq!(delete.action, ChangeAction::Delete);
        assert_eq!(delete.file, "old.txt");
    }

    #[test]
    fn test_header_lookalikes_inside_hunk_stay_in_hunk() {
        let diff = "\
--- a/src/query.cpp
+++ b/src/query.cpp
@@ -1,3 +1,3 @@
 int main() {
--- count rows
+++i;
 }
";
        let patch = PatchParser::default().parse(diff, provenance()).expect("diff");
        assert_eq!(patch.changes.len(), 1);

        let change = &patch.changes[0];
        assert_eq!(change.file, "src/query.cpp");
        assert_eq!(change.hunks.len(), 1);
        assert_eq!(change.hunks[0].before, "int main() {\n-- count rows\n}\n");
        assert_eq!(change.hunks[0].after, "int main() {\n++i;\n}\n");
    }

    #[test]
    fn test_hunk_counts() {
        assert_eq!(hunk_counts("@@ -1,3 +1,4 @@ fn main()"), Some((3, 4)));
        assert_eq!(hunk_counts("@@ -1 +0,0 @@"), Some((1, 0)));
        assert_eq!(hunk_counts("@@ @@"), None);
    }

    #[test]
    fn test_strategy_order_prefers_json() {
        let parser = PatchParser::default();
        assert_eq!(parser.strategy_names(), vec!["json", "fenced_json", "unified_diff"]);
        assert!(JsonStrategy.parse("```json\n{}\n```").is_none());
        assert!(FencedJsonStrategy.parse("```json\n{}\n```").is_some());
    }
}
