//! Per-commit complexity extraction.
//!
//! Complexity is a deliberately cheap syntactic proxy: the sum of leading
//! whitespace columns over all lines. For a commit, the delta is computed
//! from the diff — added lines contribute to `added`, removed lines to
//! `removed`. Negative net values arise legitimately from refactors.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::Result;

use crate::shell::{non_empty_lines, run_shell_command};

/// Per-file complexity delta of one commit. A path missing from one side
/// reads as 0 there.
#[derive(Debug, Default)]
pub struct ComplexityChange {
    pub added: HashMap<String, i64>,
    pub removed: HashMap<String, i64>,
}

impl ComplexityChange {
    /// Union of touched paths with their (added, removed) values, sorted
    /// for deterministic iteration.
    pub fn files(&self) -> Vec<(String, i64, i64)> {
        let paths: BTreeSet<&String> = self.added.keys().chain(self.removed.keys()).collect();
        paths
            .into_iter()
            .map(|p| {
                (
                    p.clone(),
                    self.added.get(p).copied().unwrap_or(0),
                    self.removed.get(p).copied().unwrap_or(0),
                )
            })
            .collect()
    }
}

/// Number of leading whitespace columns of a line.
pub fn leading_whitespace(line: &str) -> i64 {
    line.chars().take_while(|c| c.is_whitespace()).count() as i64
}

/// Compute the per-file complexity delta for `commit_hash`.
///
/// Lists the commit's touched files with `git diff-tree --name-only`,
/// falling back to `--root` for the initial commit, then filters the
/// patch text for added and removed lines per file. Paths no longer
/// present in the working tree are skipped.
pub fn complexity_change(repo_dir: &Path, commit_hash: &str) -> Result<ComplexityChange> {
    let cmd = format!("git diff-tree --no-commit-id --name-only -r {}", commit_hash);
    let mut files_changed = run_shell_command(&cmd, repo_dir)?;

    let is_root_commit = files_changed.trim().is_empty();
    if is_root_commit {
        let cmd = format!(
            "git diff-tree --root --no-commit-id --name-only -r {}",
            commit_hash
        );
        files_changed = run_shell_command(&cmd, repo_dir)?;
    }

    let mut change = ComplexityChange::default();

    for file_name in non_empty_lines(&files_changed) {
        if !repo_dir.join(file_name).exists() {
            continue;
        }

        let cmd = format!(
            "git diff-tree --no-commit-id -p -r {} -- \"{}\" | grep -v \"^+++ \" | grep \"^+\"",
            commit_hash, file_name
        );
        let lines_added = run_shell_command(&cmd, repo_dir)?;
        for line in non_empty_lines(&lines_added) {
            // skip the diff marker character
            let line = &line[1..];
            *change.added.entry(file_name.to_string()).or_insert(0) += leading_whitespace(line);
        }

        let cmd = format!(
            "git diff-tree --no-commit-id -p -r {} -- \"{}\" | grep -v \"^--- \" | grep \"^-\"",
            commit_hash, file_name
        );
        let lines_removed = run_shell_command(&cmd, repo_dir)?;
        for line in non_empty_lines(&lines_removed) {
            let line = &line[1..];
            *change.removed.entry(file_name.to_string()).or_insert(0) += leading_whitespace(line);
        }
    }

    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(repo: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(repo)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn init_repo() -> TempDir {
        let tmp = TempDir::new().unwrap();
        git(tmp.path(), &["init", "-q"]);
        git(tmp.path(), &["config", "user.email", "test@example.com"]);
        git(tmp.path(), &["config", "user.name", "Test"]);
        tmp
    }

    fn head_hash(repo: &Path) -> String {
        let out = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(repo)
            .output()
            .unwrap();
        String::from_utf8(out.stdout).unwrap().trim().to_string()
    }

    #[test]
    fn leading_whitespace_counts_columns() {
        assert_eq!(leading_whitespace("  a"), 2);
        assert_eq!(leading_whitespace("    b"), 4);
        assert_eq!(leading_whitespace("none"), 0);
        assert_eq!(leading_whitespace(""), 0);
    }

    #[test]
    fn root_commit_yields_added_complexity() {
        let tmp = init_repo();
        std::fs::write(tmp.path().join("main.py"), "  a\n    b\n").unwrap();
        git(tmp.path(), &["add", "."]);
        git(tmp.path(), &["commit", "-q", "-m", "initial"]);

        let change = complexity_change(tmp.path(), &head_hash(tmp.path())).unwrap();
        assert_eq!(change.added.get("main.py"), Some(&6));
        assert_eq!(change.removed.get("main.py"), None);
        assert_eq!(change.files(), vec![("main.py".to_string(), 6, 0)]);
    }

    #[test]
    fn reformat_is_symmetric() {
        let tmp = init_repo();
        std::fs::write(tmp.path().join("app.rs"), "          x\ny\n").unwrap();
        git(tmp.path(), &["add", "."]);
        git(tmp.path(), &["commit", "-q", "-m", "initial"]);

        // move 10 leading spaces from the first line to the second
        std::fs::write(tmp.path().join("app.rs"), "x\n          y\n").unwrap();
        git(tmp.path(), &["add", "."]);
        git(tmp.path(), &["commit", "-q", "-m", "reformat"]);

        let change = complexity_change(tmp.path(), &head_hash(tmp.path())).unwrap();
        assert_eq!(change.added.get("app.rs"), Some(&10));
        assert_eq!(change.removed.get("app.rs"), Some(&10));
    }

    #[test]
    fn deleted_file_is_skipped() {
        let tmp = init_repo();
        std::fs::write(tmp.path().join("gone.txt"), "  x\n").unwrap();
        git(tmp.path(), &["add", "."]);
        git(tmp.path(), &["commit", "-q", "-m", "initial"]);
        git(tmp.path(), &["rm", "-q", "gone.txt"]);
        git(tmp.path(), &["commit", "-q", "-m", "remove"]);

        let change = complexity_change(tmp.path(), &head_hash(tmp.path())).unwrap();
        assert!(change.added.is_empty());
        assert!(change.removed.is_empty());
    }
}
