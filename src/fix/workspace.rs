//! Applying patch changes to a working tree.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use walkdir::WalkDir;

use crate::error::ApplyError;

use super::types::{Change, ChangeAction, ChangeFormat, SourceFile};

/// Applies one [`Change`] under a workspace root.
#[async_trait]
pub trait PatchApplier: Send + Sync {
    async fn apply(&self, workspace: &Path, change: &Change) -> Result<(), ApplyError>;
}

/// [`PatchApplier`] over the local filesystem.
///
/// Paths are resolved relative to the workspace root; absolute paths and
/// `..` components are refused.
#[derive(Debug, Default, Clone)]
pub struct FsWorkspace;

impl FsWorkspace {
    pub fn new() -> Self {
        Self
    }

    fn resolve(workspace: &Path, file: &str) -> Result<PathBuf, ApplyError> {
        let relative = Path::new(file);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if file.trim().is_empty() || escapes {
            return Err(ApplyError::PathOutsideWorkspace(file.to_string()));
        }
        Ok(workspace.join(relative))
    }
}

fn io_error(file: &str, err: std::io::Error) -> ApplyError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ApplyError::FileNotFound(file.to_string())
    } else {
        ApplyError::Io {
            file: file.to_string(),
            message: err.to_string(),
        }
    }
}

/// Applies `change`'s hunks to `original` by context search-and-replace.
///
/// Each hunk's `before` text must occur in the file as it stands after the
/// previous hunks; a trailing newline is optional on the last line of the file.
pub fn apply_hunks(original: &str, change: &Change) -> Result<String, ApplyError> {
    let mut text = original.to_string();
    for (index, hunk) in change.hunks.iter().enumerate() {
        let mismatch = || ApplyError::HunkMismatch {
            file: change.file.clone(),
            hunk: index + 1,
        };

        if hunk.before.is_empty() {
            text.push_str(&hunk.after);
            continue;
        }

        if let Some(pos) = text.find(&hunk.before) {
            text.replace_range(pos..pos + hunk.before.len(), &hunk.after);
            continue;
        }

        let before = hunk.before.strip_suffix('\n').ok_or_else(mismatch)?;
        if !text.ends_with(before) {
            return Err(mismatch());
        }
        let pos = text.len() - before.len();
        let after = hunk.after.strip_suffix('\n').unwrap_or(&hunk.after);
        text.replace_range(pos.., after);
    }
    Ok(text)
}

#[async_trait]
impl PatchApplier for FsWorkspace {
    async fn apply(&self, workspace: &Path, change: &Change) -> Result<(), ApplyError> {
        let path = Self::resolve(workspace, &change.file)?;

        match change.action {
            ChangeAction::Delete => fs::remove_file(&path)
                .await
                .map_err(|e| io_error(&change.file, e)),
            ChangeAction::Modify if change.format == ChangeFormat::Hunks => {
                let original = fs::read_to_string(&path)
                    .await
                    .map_err(|e| io_error(&change.file, e))?;
                let updated = apply_hunks(&original, change)?;
                fs::write(&path, updated)
                    .await
                    .map_err(|e| io_error(&change.file, e))
            }
            ChangeAction::Create | ChangeAction::Modify => {
                let content = change
                    .content
                    .as_deref()
                    .ok_or_else(|| ApplyError::MissingContent(change.file.clone()))?;

                if change.action == ChangeAction::Modify && fs::metadata(&path).await.is_err() {
                    return Err(ApplyError::FileNotFound(change.file.clone()));
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_error(&change.file, e))?;
                }
                fs::write(&path, content)
                    .await
                    .map_err(|e| io_error(&change.file, e))
            }
        }
    }
}

/// Directories never read into a code context.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", "__pycache__", ".venv", "dist"];

/// Reads source files under `root` with one of `extensions`, for use as
/// [`CodeContext`](super::CodeContext) files. Stops after `max_files`.
pub fn collect_sources(root: &Path, extensions: &[&str], max_files: usize) -> Vec<SourceFile> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .map(|name| SKIPPED_DIRS.contains(&name))
                    .unwrap_or(false)
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.contains(&ext))
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let content = std::fs::read_to_string(entry.path()).ok()?;
            let relative = entry.path().strip_prefix(root).ok()?;
            Some(SourceFile {
                path: relative.to_string_lossy().replace('\\', "/"),
                content,
            })
        })
        .take(max_files)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::types::Hunk;

    #[tokio::test]
    async fn test_create_modify_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FsWorkspace::new();

        ws.apply(dir.path(), &Change::create("src/nested/a.txt", "one"))
            .await
            .expect("create");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/nested/a.txt")).expect("read"),
            "one"
        );

        ws.apply(dir.path(), &Change::modify("src/nested/a.txt", "two"))
            .await
            .expect("modify");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/nested/a.txt")).expect("read"),
            "two"
        );

        ws.apply(dir.path(), &Change::delete("src/nested/a.txt"))
            .await
            .expect("delete");
        assert!(!dir.path().join("src/nested/a.txt").exists());
    }

    #[tokio::test]
    async fn test_refuses_escaping_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FsWorkspace::new();

        for path in ["../evil.txt", "/etc/passwd", "a/../../b", ""] {
            let err = ws
                .apply(dir.path(), &Change::create(path, "x"))
                .await
                .unwrap_err();
            assert!(matches!(err, ApplyError::PathOutsideWorkspace(_)), "{path}");
        }
    }

    #[tokio::test]
    async fn test_missing_files_and_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FsWorkspace::new();

        let err = ws.apply(dir.path(), &Change::delete("nope.rs")).await.unwrap_err();
        assert_eq!(err, ApplyError::FileNotFound("nope.rs".to_string()));

        let err = ws
            .apply(dir.path(), &Change::modify("nope.rs", "x"))
            .await
            .unwrap_err();
        assert_eq!(err, ApplyError::FileNotFound("nope.rs".to_string()));

        let mut change = Change::create("a.rs", "");
        change.content = None;
        let err = ws.apply(dir.path(), &change).await.unwrap_err();
        assert_eq!(err, ApplyError::MissingContent("a.rs".to_string()));
    }

    fn hunk_change(hunks: Vec<Hunk>) -> Change {
        Change {
            file: "lib.rs".to_string(),
            action: ChangeAction::Modify,
            content: None,
            explanation: String::new(),
            format: ChangeFormat::Hunks,
            hunks,
        }
    }

    #[test]
    fn test_apply_hunks() {
        let original = "fn a() {\n    1\n}\nfn b() {\n    2\n}";
        let change = hunk_change(vec![
            Hunk {
                before: "fn a() {\n    1\n".to_string(),
                after: "fn a() {\n    10\n".to_string(),
            },
            Hunk {
                before: "    2\n}\n".to_string(),
                after: "    20\n}\n".to_string(),
            },
        ]);
        assert_eq!(
            apply_hunks(original, &change).expect("apply"),
            "fn a() {\n    10\n}\nfn b() {\n    20\n}"
        );
    }

    #[test]
    fn test_apply_hunks_mismatch() {
        let change = hunk_change(vec![Hunk {
            before: "not there\n".to_string(),
            after: "x\n".to_string(),
        }]);
        assert_eq!(
            apply_hunks("something else", &change).unwrap_err(),
            ApplyError::HunkMismatch {
                file: "lib.rs".to_string(),
                hunk: 1
            }
        );
    }

    #[test]
    fn test_collect_sources_skips_build_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("target/debug")).expect("mkdir");
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}").expect("write");
        std::fs::write(dir.path().join("src/notes.md"), "# notes").expect("write");
        std::fs::write(dir.path().join("target/debug/gen.rs"), "// generated").expect("write");

        let files = collect_sources(dir.path(), &["rs"], 10);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "src/lib.rs");
    }
}
