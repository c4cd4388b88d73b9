//! Commit history ingestion.
//!
//! Walks the commit log in forward date order from an effective start date,
//! computes per-file complexity deltas for each commit, and upserts one
//! [`CodeChange`] row per touched file. Re-running over the same range is a
//! no-op: all writes key on (project, commit hash, file path).

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate};
use sqlx::SqlitePool;
use std::path::Path;

use crate::changes::complexity_change;
use crate::models::{CodeChange, Project, Release, ReleaseKind};
use crate::shell::{non_empty_lines, run_shell_command};
use crate::store;

/// One line of `git log` output: enough to ingest the commit later without
/// touching git again for ordering.
#[derive(Debug, Clone)]
pub struct CommitDescriptor {
    pub timestamp: DateTime<FixedOffset>,
    pub hash: String,
    pub author_name: String,
    pub author_email: String,
}

impl CommitDescriptor {
    pub fn author(&self) -> String {
        format!("{} <{}>", self.author_name, self.author_email)
    }
}

/// Author date of the first commit, or None for an empty repository.
pub fn first_commit_date(repo_dir: &Path) -> Result<Option<NaiveDate>> {
    let output = run_shell_command(
        "git rev-list --max-parents=0 HEAD --pretty=\"%ad\" --date=iso8601-strict-local",
        repo_dir,
    )?;

    // Output alternates "commit <hash>" and date lines; a repo with
    // multiple roots lists each, the oldest last.
    let date = non_empty_lines(&output)
        .into_iter()
        .filter(|line| !line.starts_with("commit "))
        .filter_map(|line| DateTime::parse_from_rfc3339(line.trim()).ok())
        .map(|ts| ts.date_naive())
        .min();

    Ok(date)
}

/// Clamp a requested start date to the repository's first commit.
/// Returns None when the repository has no commits at all.
pub fn resolve_start_date(
    repo_dir: &Path,
    start_date: Option<NaiveDate>,
) -> Result<Option<NaiveDate>> {
    let first = match first_commit_date(repo_dir)? {
        Some(d) => d,
        None => return Ok(None),
    };
    Ok(Some(match start_date {
        Some(start) if start > first => start,
        _ => first,
    }))
}

/// Commits from `start` onward, oldest first.
///
/// The `;~;` delimiter is used because author names may contain semicolons.
pub fn list_commits(repo_dir: &Path, start: NaiveDate) -> Result<Vec<CommitDescriptor>> {
    let cmd = format!(
        "git log --reverse --date-order --after=\"{} 00:00\" \
         --pretty=\"%ad;~;%H;~;%aN;~;%aE\" --date=iso8601-strict-local",
        start.format("%Y-%m-%d")
    );
    let output = run_shell_command(&cmd, repo_dir)?;

    let mut commits = Vec::new();
    for line in non_empty_lines(&output) {
        let fields: Vec<&str> = line.split(";~;").collect();
        if fields.len() != 4 {
            log::warn!("skipping malformed git log line: {}", line);
            continue;
        }
        let timestamp = DateTime::parse_from_rfc3339(fields[0])
            .with_context(|| format!("invalid commit timestamp: {}", fields[0]))?;
        commits.push(CommitDescriptor {
            timestamp,
            hash: fields[1].to_string(),
            author_name: fields[2].to_string(),
            author_email: fields[3].to_string(),
        });
    }

    Ok(commits)
}

/// Full commit message of one commit.
pub fn commit_message(repo_dir: &Path, hash: &str) -> Result<String> {
    let output = run_shell_command(&format!("git log --format=%B -n 1 {}", hash), repo_dir)?;
    Ok(output.trim().to_string())
}

/// Split commit descriptors into chunks for fan-out; each chunk becomes an
/// independent pipeline task.
pub fn commit_chunks(
    commits: Vec<CommitDescriptor>,
    chunk_size: usize,
) -> Vec<Vec<CommitDescriptor>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    for commit in commits {
        current.push(commit);
        if current.len() >= chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Ingest one chunk of commits: extract the per-file complexity delta and
/// upsert a CodeChange per touched file. Returns the number of rows written.
pub async fn ingest_commits(
    pool: &SqlitePool,
    project_id: &str,
    repo_dir: &Path,
    commits: &[CommitDescriptor],
) -> Result<u64> {
    let mut rows = 0u64;

    for commit in commits {
        let change = complexity_change(repo_dir, &commit.hash)?;
        if change.added.is_empty() && change.removed.is_empty() {
            continue;
        }
        let description = commit_message(repo_dir, &commit.hash)?;

        for (file_path, added, removed) in change.files() {
            log::debug!(
                "Project({}): CodeChange {} {}",
                project_id,
                commit.hash,
                file_path
            );
            store::upsert_code_change(
                pool,
                &CodeChange {
                    project_id: project_id.to_string(),
                    commit_hash: commit.hash.clone(),
                    timestamp: commit.timestamp,
                    file_path,
                    author: commit.author(),
                    complexity_added: added,
                    complexity_removed: removed,
                    description: description.clone(),
                },
            )
            .await?;
            rows += 1;
        }
    }

    Ok(rows)
}

/// Sequential ingest of the whole history from `start_date` (clamped to the
/// first commit). The orchestrator instead fans out over [`commit_chunks`].
pub async fn import_code_changes(
    pool: &SqlitePool,
    project: &Project,
    repo_dir: &Path,
    start_date: Option<NaiveDate>,
) -> Result<u64> {
    log::info!(
        "Project({}): Starting import_code_changes ({:?}).",
        project.slug,
        start_date
    );

    let start = match resolve_start_date(repo_dir, start_date)? {
        Some(d) => d,
        None => {
            log::info!("Project({}): no commits found.", project.slug);
            return Ok(0);
        }
    };

    let commits = list_commits(repo_dir, start)?;
    let rows = ingest_commits(pool, &project.id, repo_dir, &commits).await?;

    log::info!(
        "Project({}): Finished import_code_changes ({} rows).",
        project.slug,
        rows
    );
    Ok(rows)
}

/// Import git tags as releases. Tagger date wins over committer date
/// (annotated vs lightweight tags).
pub async fn import_tags(pool: &SqlitePool, project: &Project, repo_dir: &Path) -> Result<u64> {
    log::info!("Project({}): Starting import_tags.", project.slug);

    let output = run_shell_command(
        "git tag --list --format=\"%(refname:strip=2);%(taggerdate);%(committerdate)\"",
        repo_dir,
    )?;

    let mut count = 0u64;
    for line in non_empty_lines(&output) {
        let fields: Vec<&str> = line.splitn(3, ';').collect();
        if fields.len() != 3 {
            log::warn!("skipping malformed tag line: {}", line);
            continue;
        }
        let tag_name = fields[0];
        let tag_date = parse_git_date(fields[1]).or_else(|| parse_git_date(fields[2]));

        let tag_date = match tag_date {
            Some(d) => d,
            None => {
                log::warn!("tag {} has no parseable date", tag_name);
                continue;
            }
        };

        log::debug!("Project({}): Git Tag {} {}", project.slug, tag_name, tag_date);
        store::upsert_release(
            pool,
            &Release {
                project_id: project.id.clone(),
                timestamp: tag_date.with_timezone(&chrono::Utc),
                kind: ReleaseKind::GitTag,
                name: tag_name.to_string(),
                url: None,
            },
        )
        .await?;
        count += 1;
    }

    log::info!("Project({}): Finished import_tags.", project.slug);
    Ok(count)
}

/// Parse git's default date format ("Mon Jan 2 15:04:05 2006 -0700").
fn parse_git_date(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_str(s, "%a %b %e %H:%M:%S %Y %z").ok()
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
        git(tmp.path(), &["config", "user.email", "dev@example.com"]);
        git(tmp.path(), &["config", "user.name", "Dev; Eloper"]);
        tmp
    }

    fn commit_file(repo: &Path, name: &str, content: &str, message: &str) {
        std::fs::write(repo.join(name), content).unwrap();
        git(repo, &["add", "."]);
        git(repo, &["commit", "-q", "-m", message]);
    }

    #[test]
    fn lists_commits_with_semicolon_author() {
        let tmp = init_repo();
        commit_file(tmp.path(), "a.txt", "  one\n", "first");
        commit_file(tmp.path(), "b.txt", "  two\n", "second");

        let start = first_commit_date(tmp.path()).unwrap().unwrap();
        let commits = list_commits(tmp.path(), start).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].author_name, "Dev; Eloper");
        assert_eq!(commits[0].author(), "Dev; Eloper <dev@example.com>");
        // forward date order
        assert!(commits[0].timestamp <= commits[1].timestamp);
    }

    #[test]
    fn empty_repo_has_no_first_commit() {
        let tmp = init_repo();
        assert!(first_commit_date(tmp.path()).unwrap().is_none());
        assert!(resolve_start_date(tmp.path(), None).unwrap().is_none());
    }

    #[test]
    fn start_date_clamped_to_first_commit() {
        let tmp = init_repo();
        commit_file(tmp.path(), "a.txt", "x\n", "first");

        let first = first_commit_date(tmp.path()).unwrap().unwrap();
        let earlier = first - chrono::Duration::days(30);
        assert_eq!(
            resolve_start_date(tmp.path(), Some(earlier)).unwrap(),
            Some(first)
        );

        let later = first + chrono::Duration::days(30);
        assert_eq!(
            resolve_start_date(tmp.path(), Some(later)).unwrap(),
            Some(later)
        );
    }

    #[test]
    fn commit_message_fetched_by_hash() {
        let tmp = init_repo();
        commit_file(tmp.path(), "a.txt", "x\n", "a multi-word message");

        let start = first_commit_date(tmp.path()).unwrap().unwrap();
        let commits = list_commits(tmp.path(), start).unwrap();
        let message = commit_message(tmp.path(), &commits[0].hash).unwrap();
        assert_eq!(message, "a multi-word message");
    }

    #[test]
    fn chunking_partitions_preserving_order() {
        let tmp = init_repo();
        for i in 0..5 {
            commit_file(tmp.path(), "a.txt", &format!("{}\n", i), &format!("c{}", i));
        }
        let start = first_commit_date(tmp.path()).unwrap().unwrap();
        let commits = list_commits(tmp.path(), start).unwrap();
        let hashes: Vec<String> = commits.iter().map(|c| c.hash.clone()).collect();

        let chunks = commit_chunks(commits, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[2].len(), 1);
        let flattened: Vec<String> = chunks
            .iter()
            .flatten()
            .map(|c| c.hash.clone())
            .collect();
        assert_eq!(flattened, hashes);
    }

    #[test]
    fn annotated_and_lightweight_tags_parse() {
        let tmp = init_repo();
        commit_file(tmp.path(), "a.txt", "x\n", "first");
        git(tmp.path(), &["tag", "-a", "v1.0", "-m", "release one"]);
        git(tmp.path(), &["tag", "v1.1-light"]);

        let output = run_shell_command(
            "git tag --list --format=\"%(refname:strip=2);%(taggerdate);%(committerdate)\"",
            tmp.path(),
        )
        .unwrap();
        let lines = non_empty_lines(&output);
        assert_eq!(lines.len(), 2);

        for line in lines {
            let fields: Vec<&str> = line.splitn(3, ';').collect();
            let date = parse_git_date(fields[1]).or_else(|| parse_git_date(fields[2]));
            assert!(date.is_some(), "no date parsed from: {}", line);
        }
    }
}
