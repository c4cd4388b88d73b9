//! Source-tree snapshot materialization.
//!
//! Walks a disposable working copy of the project, builds a parent-pointer
//! tree of [`SourceNode`]s, annotates every file with complexity, change
//! count, and ownership, and swaps the snapshot to active in one
//! transaction. Nested-set bounds are computed in a single post-order pass
//! before the tree is written; they are never maintained incrementally.

use anyhow::Result;
use chrono::{Duration, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sqlx::SqlitePool;
use std::path::Path;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::changes::leading_whitespace;
use crate::config::Config;
use crate::models::{Ownership, Project, SourceNode, SourceSnapshot};
use crate::repo;
use crate::shell::{non_empty_lines, run_shell_command};
use crate::store;

/// Paths excluded from every snapshot.
const BUILTIN_EXCLUDES: &[&str] = &["**/.git/**", "**/package-lock.json"];

/// How many days of history weigh into a file's change count.
const CHANGE_WINDOW_DAYS: i64 = 30;

/// How many authors are listed individually before the tail collapses
/// into an "N Others" bucket.
const OWNERSHIP_TOP_AUTHORS: usize = 4;

/// A file discovered during the walk, with its annotations.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub rel_path: String,
    pub complexity: i64,
    pub change_count: i64,
    pub ownership: Vec<Ownership>,
    pub repo_link: Option<String>,
}

/// Build, enrich, and activate a snapshot of the project's current tree.
/// Returns the new snapshot id.
pub async fn build_snapshot(
    pool: &SqlitePool,
    config: &Config,
    project: &Project,
) -> Result<String> {
    log::info!("Project({}): Starting build_snapshot.", project.slug);

    let snapshot = SourceSnapshot {
        id: Uuid::new_v4().to_string(),
        project_id: project.id.clone(),
        timestamp: Utc::now(),
        active: false,
    };
    store::create_snapshot(pool, &snapshot).await?;

    let excludes = build_excludes(&config.tree.exclude_globs)?;

    // The scratch copy lives until this handle drops, error paths included.
    let scratch = repo::checkout_scratch(config, project)?;
    let root = scratch.path();

    let mut rel_paths = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        if excludes.is_match(&rel) {
            continue;
        }
        rel_paths.push(rel);
    }
    rel_paths.sort();

    let change_window = Utc::now() - Duration::days(CHANGE_WINDOW_DAYS);
    let mut files = Vec::with_capacity(rel_paths.len());
    for rel in rel_paths {
        let complexity = file_complexity(&root.join(&rel));
        let ownership = file_ownership(root, &rel)?;
        let changes = store::count_changes_for_path(pool, &project.id, &rel, change_window).await?;

        files.push(FileEntry {
            repo_link: Some(repo_link(
                &project.git_url,
                project.default_branch.as_deref(),
                &rel,
            )),
            rel_path: rel,
            complexity,
            // a file with no recorded changes still carries weight 1
            change_count: changes.max(1),
            ownership,
        });
    }

    let nodes = assemble_tree(&snapshot.id, &files);
    store::write_nodes(pool, &nodes).await?;
    store::activate_snapshot(pool, &project.id, &snapshot.id).await?;

    log::info!(
        "Project({}): Finished build_snapshot ({} nodes).",
        project.slug,
        nodes.len()
    );
    Ok(snapshot.id)
}

fn build_excludes(extra: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in BUILTIN_EXCLUDES {
        builder.add(Glob::new(pattern)?);
    }
    for pattern in extra {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Syntactic complexity of a file: 1 plus the sum of leading whitespace
/// columns over its lines. Unreadable or non-UTF-8 content reads as 1
/// (binary-file heuristic).
pub fn file_complexity(path: &Path) -> i64 {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return 1,
    };
    1 + content.lines().map(leading_whitespace).sum::<i64>()
}

/// Per-author line counts from `git shortlog`, top authors first, tail
/// collapsed and normalized to integer percentages.
fn file_ownership(repo_dir: &Path, rel_path: &str) -> Result<Vec<Ownership>> {
    let cmd = format!(
        "git shortlog --summary --numbered --email HEAD -- \"{}\"",
        rel_path
    );
    let output = run_shell_command(&cmd, repo_dir)?;
    Ok(normalize_ownership(parse_shortlog(&output)))
}

/// Parse `git shortlog --summary --numbered` lines ("  12\tJane <j@x>").
pub fn parse_shortlog(output: &str) -> Vec<Ownership> {
    let mut ownerships = Vec::new();
    for line in non_empty_lines(output) {
        let trimmed = line.trim_start();
        let Some((count, author)) = trimmed.split_once('\t') else {
            continue;
        };
        let Ok(lines) = count.trim().parse::<i64>() else {
            continue;
        };
        ownerships.push(Ownership {
            author: author.to_string(),
            lines,
        });
    }
    ownerships
}

/// Keep the top authors, collapse the remainder into an "N Others" bucket,
/// and normalize counts to integer percentages. Rounding can leave the sum
/// at 100 ± 1.
pub fn normalize_ownership(ownerships: Vec<Ownership>) -> Vec<Ownership> {
    if ownerships.is_empty() {
        return ownerships;
    }

    let mut top: Vec<Ownership> = ownerships
        .iter()
        .take(OWNERSHIP_TOP_AUTHORS)
        .cloned()
        .collect();

    let others = &ownerships[OWNERSHIP_TOP_AUTHORS.min(ownerships.len())..];
    if !others.is_empty() {
        top.push(Ownership {
            author: format!("{} Others", others.len()),
            lines: others.iter().map(|o| o.lines).sum(),
        });
    }

    let total: i64 = top.iter().map(|o| o.lines).sum();
    if total > 0 {
        for o in &mut top {
            o.lines = ((o.lines as f64 / total as f64) * 100.0).round() as i64;
        }
    }

    top
}

/// Web link to the file's blame view, derived from the remote URL.
fn repo_link(git_url: &str, branch: Option<&str>, rel_path: &str) -> String {
    let base = git_url.trim_end_matches(".git");
    let base = match base.strip_prefix("git@github.com:") {
        Some(rest) => format!("https://github.com/{}", rest),
        None => base.to_string(),
    };
    format!("{}/blame/{}/{}", base, branch.unwrap_or("master"), rel_path)
}

/// Assemble the node tree from annotated file entries: directories are
/// created on demand keyed by path, files become leaves, and lft/rgt
/// bounds are assigned in one post-order pass.
pub fn assemble_tree(snapshot_id: &str, files: &[FileEntry]) -> Vec<SourceNode> {
    struct Builder {
        node: SourceNode,
        children: Vec<usize>,
    }

    let mut arena: Vec<Builder> = vec![Builder {
        node: SourceNode {
            id: Uuid::new_v4().to_string(),
            snapshot_id: snapshot_id.to_string(),
            parent_id: None,
            name: "root".to_string(),
            path: String::new(),
            is_file: false,
            complexity: 0,
            change_count: 0,
            ownership: Vec::new(),
            repo_link: None,
            lft: 0,
            rgt: 0,
        },
        children: Vec::new(),
    }];

    let mut dir_index: std::collections::HashMap<String, usize> =
        std::collections::HashMap::new();
    dir_index.insert(String::new(), 0);

    for file in files {
        let parts: Vec<&str> = file.rel_path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            continue;
        }

        let mut current = 0usize;
        let mut path = String::new();

        for part in &parts[..parts.len() - 1] {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(part);

            current = match dir_index.get(&path) {
                Some(&idx) => idx,
                None => {
                    let parent_id = arena[current].node.id.clone();
                    let idx = arena.len();
                    arena.push(Builder {
                        node: SourceNode {
                            id: Uuid::new_v4().to_string(),
                            snapshot_id: snapshot_id.to_string(),
                            parent_id: Some(parent_id),
                            name: part.to_string(),
                            path: path.clone(),
                            is_file: false,
                            complexity: 0,
                            change_count: 0,
                            ownership: Vec::new(),
                            repo_link: None,
                            lft: 0,
                            rgt: 0,
                        },
                        children: Vec::new(),
                    });
                    arena[current].children.push(idx);
                    dir_index.insert(path.clone(), idx);
                    idx
                }
            };
        }

        let leaf_name = parts[parts.len() - 1];
        let parent_id = arena[current].node.id.clone();
        let idx = arena.len();
        arena.push(Builder {
            node: SourceNode {
                id: Uuid::new_v4().to_string(),
                snapshot_id: snapshot_id.to_string(),
                parent_id: Some(parent_id),
                name: leaf_name.to_string(),
                path: file.rel_path.clone(),
                is_file: true,
                complexity: file.complexity,
                change_count: file.change_count,
                ownership: file.ownership.clone(),
                repo_link: file.repo_link.clone(),
                lft: 0,
                rgt: 0,
            },
            children: Vec::new(),
        });
        arena[current].children.push(idx);
    }

    // post-order bounds, iterative to keep deep trees off the call stack
    let mut counter: i64 = 1;
    let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
    while let Some((idx, child_pos)) = stack.pop() {
        if child_pos == 0 {
            arena[idx].node.lft = counter;
            counter += 1;
        }
        if child_pos < arena[idx].children.len() {
            let child = arena[idx].children[child_pos];
            stack.push((idx, child_pos + 1));
            stack.push((child, 0));
        } else {
            arena[idx].node.rgt = counter;
            counter += 1;
        }
    }

    arena.into_iter().map(|b| b.node).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> FileEntry {
        FileEntry {
            rel_path: path.to_string(),
            complexity: 5,
            change_count: 1,
            ownership: vec![],
            repo_link: None,
        }
    }

    #[test]
    fn excludes_git_internals_and_lockfiles() {
        let excludes = build_excludes(&[]).unwrap();
        assert!(excludes.is_match(".git/HEAD"));
        assert!(excludes.is_match("sub/.git/config"));
        assert!(excludes.is_match("node_modules/package-lock.json"));
        assert!(excludes.is_match("package-lock.json"));
        assert!(!excludes.is_match("src/main.rs"));
        assert!(!excludes.is_match("gitignore.txt"));
    }

    #[test]
    fn file_complexity_counts_indentation_plus_baseline() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sample.py");
        std::fs::write(&path, "  a\n    b\n").unwrap();
        assert_eq!(file_complexity(&path), 7);
    }

    #[test]
    fn binary_file_complexity_is_one() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob.bin");
        std::fs::write(&path, [0xffu8, 0xfe, 0x00, 0x80]).unwrap();
        assert_eq!(file_complexity(&path), 1);
    }

    #[test]
    fn missing_file_complexity_is_one() {
        assert_eq!(file_complexity(Path::new("/nonexistent/nope.rs")), 1);
    }

    #[test]
    fn shortlog_parsing() {
        let output = "   102\tJane Doe <jane@example.com>\n     3\tBob <bob@example.com>\n";
        let parsed = parse_shortlog(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].author, "Jane Doe <jane@example.com>");
        assert_eq!(parsed[0].lines, 102);
        assert_eq!(parsed[1].lines, 3);
    }

    #[test]
    fn ownership_top_four_plus_others() {
        let raw: Vec<Ownership> = (0..7)
            .map(|i| Ownership {
                author: format!("author{}", i),
                lines: 100 - i * 10,
            })
            .collect();

        let normalized = normalize_ownership(raw);
        assert_eq!(normalized.len(), 5);
        assert_eq!(normalized[4].author, "3 Others");

        let sum: i64 = normalized.iter().map(|o| o.lines).sum();
        assert!((99..=101).contains(&sum), "percentages sum to {}", sum);
    }

    #[test]
    fn ownership_single_author_is_all() {
        let normalized = normalize_ownership(vec![Ownership {
            author: "solo <s@x>".to_string(),
            lines: 42,
        }]);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].lines, 100);
    }

    #[test]
    fn tree_has_one_root_with_empty_path() {
        let nodes = assemble_tree("snap", &[entry("src/main.rs"), entry("README.md")]);
        let roots: Vec<&SourceNode> = nodes.iter().filter(|n| n.parent_id.is_none()).collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].path, "");
        assert!(!roots[0].is_file);
    }

    #[test]
    fn node_path_is_parent_path_plus_name() {
        let nodes = assemble_tree("snap", &[entry("src/lib/util.rs")]);
        for node in &nodes {
            let Some(parent_id) = &node.parent_id else {
                continue;
            };
            let parent = nodes.iter().find(|n| &n.id == parent_id).unwrap();
            assert!(!parent.is_file);
            let expected = if parent.path.is_empty() {
                node.name.clone()
            } else {
                format!("{}/{}", parent.path, node.name)
            };
            assert_eq!(node.path, expected);
        }
    }

    #[test]
    fn directories_are_shared_between_siblings() {
        let nodes = assemble_tree("snap", &[entry("src/a.rs"), entry("src/b.rs")]);
        let dirs: Vec<&SourceNode> = nodes.iter().filter(|n| n.path == "src").collect();
        assert_eq!(dirs.len(), 1);
        let src_id = &dirs[0].id;
        let children: Vec<&SourceNode> = nodes
            .iter()
            .filter(|n| n.parent_id.as_ref() == Some(src_id))
            .collect();
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn nested_set_bounds_enclose_children() {
        let nodes = assemble_tree(
            "snap",
            &[entry("src/a.rs"), entry("src/sub/b.rs"), entry("top.rs")],
        );

        for node in &nodes {
            assert!(node.lft < node.rgt);
            if let Some(parent_id) = &node.parent_id {
                let parent = nodes.iter().find(|n| &n.id == parent_id).unwrap();
                assert!(parent.lft < node.lft && node.rgt < parent.rgt);
            }
        }

        // bounds are a permutation of 1..=2n
        let mut all: Vec<i64> = nodes.iter().flat_map(|n| [n.lft, n.rgt]).collect();
        all.sort();
        let expected: Vec<i64> = (1..=(nodes.len() as i64 * 2)).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn repo_link_uses_branch_and_path() {
        assert_eq!(
            repo_link(
                "https://github.com/acme/widget.git",
                Some("main"),
                "src/main.rs"
            ),
            "https://github.com/acme/widget/blame/main/src/main.rs"
        );
        assert_eq!(
            repo_link("git@github.com:acme/widget.git", None, "a.rs"),
            "https://github.com/acme/widget/blame/master/a.rs"
        );
    }
}
