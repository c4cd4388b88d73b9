//! Core data models used throughout Repo Pulse.
//!
//! These types represent the projects, raw history rows, tracker items, and
//! derived metrics that flow through the ingestion pipeline.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Fallback bug-label set used when a project carries no `bug_labels`
/// configuration in its provider refs.
pub const DEFAULT_BUG_LABELS: &[&str] = &["bug"];

/// Pipeline status of a tracked project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Ready,
    Queued,
    Updating,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Ready => "READY",
            ProjectStatus::Queued => "QUEUED",
            ProjectStatus::Updating => "UPDATING",
        }
    }

    pub fn parse(s: &str) -> ProjectStatus {
        match s {
            "QUEUED" => ProjectStatus::Queued,
            "UPDATING" => ProjectStatus::Updating,
            _ => ProjectStatus::Ready,
        }
    }
}

/// A tracked repository. Created externally (CLI `add` or webhook); the
/// orchestrator only mutates `status`, `default_branch`, and `last_update`.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub git_url: String,
    pub default_branch: Option<String>,
    pub private: bool,
    pub active: bool,
    pub status: ProjectStatus,
    pub last_update: Option<DateTime<Utc>>,
    /// Opaque provider-specific reference data: installation id, repo
    /// owner/name, configured bug labels.
    pub provider_refs: serde_json::Value,
}

impl Project {
    pub fn installation_id(&self) -> Option<i64> {
        self.provider_refs
            .get("installation_id")
            .and_then(|v| v.as_i64())
    }

    pub fn repo_owner(&self) -> Option<&str> {
        self.provider_refs.get("owner").and_then(|v| v.as_str())
    }

    pub fn repo_name(&self) -> Option<&str> {
        self.provider_refs.get("repo").and_then(|v| v.as_str())
    }

    /// Configured bug labels, falling back to [`DEFAULT_BUG_LABELS`].
    pub fn bug_labels(&self) -> Vec<String> {
        match self
            .provider_refs
            .get("bug_labels")
            .and_then(|v| v.as_array())
        {
            Some(labels) if !labels.is_empty() => labels
                .iter()
                .filter_map(|l| l.as_str().map(|s| s.to_string()))
                .collect(),
            _ => DEFAULT_BUG_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// One row per (commit, file) touched. Immutable after creation.
/// Natural key: (project, commit hash, file path).
#[derive(Debug, Clone)]
pub struct CodeChange {
    pub project_id: String,
    pub commit_hash: String,
    /// Commit author time, offset preserved.
    pub timestamp: DateTime<FixedOffset>,
    pub file_path: String,
    pub author: String,
    pub complexity_added: i64,
    pub complexity_removed: i64,
    pub description: String,
}

/// Issue category derived from labels against the project's bug-label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueCategory {
    Bug,
    Change,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::Bug => "bug",
            IssueCategory::Change => "change",
        }
    }

    pub fn parse(s: &str) -> IssueCategory {
        match s {
            "bug" => IssueCategory::Bug,
            _ => IssueCategory::Change,
        }
    }

    /// A label marks a bug if it equals a configured bug label, or contains
    /// one as a substring ("bugfix", "type: bug").
    pub fn from_labels(labels: &[String], bug_labels: &[String]) -> IssueCategory {
        for label in labels {
            if bug_labels.iter().any(|b| b == label) {
                return IssueCategory::Bug;
            }
        }
        for label in labels {
            if bug_labels.iter().any(|b| label.contains(b.as_str())) {
                return IssueCategory::Bug;
            }
        }
        IssueCategory::Change
    }
}

/// External tracker issue. Natural key: (project, external id).
#[derive(Debug, Clone)]
pub struct Issue {
    pub project_id: String,
    pub issue_refid: i64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub category: IssueCategory,
}

impl Issue {
    /// Age in whole days at the end of calendar day `at_date`: time open up
    /// to that day, constant after the close date. Never negative.
    pub fn age_at(&self, at_date: NaiveDate) -> i64 {
        let opened = self.opened_at.date_naive();
        let end = match self.closed_at {
            Some(closed) => closed.date_naive().min(at_date),
            None => at_date,
        };
        (end - opened).num_days().max(0)
    }
}

/// Closed pull request. Natural key: (project, external id).
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub project_id: String,
    pub pull_refid: i64,
    pub opened_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    /// merged_at - opened_at in whole days; 0 for unmerged PRs.
    pub age_days: i64,
}

/// Where a release row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    GitTag,
    ProviderRelease,
}

impl ReleaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseKind::GitTag => "git_tag",
            ReleaseKind::ProviderRelease => "provider_release",
        }
    }

    pub fn parse(s: &str) -> ReleaseKind {
        match s {
            "provider_release" => ReleaseKind::ProviderRelease,
            _ => ReleaseKind::GitTag,
        }
    }
}

/// Named point in history. Natural key: (project, timestamp, name).
#[derive(Debug, Clone)]
pub struct Release {
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ReleaseKind,
    pub name: String,
    pub url: Option<String>,
}

/// Per-day aggregate payload stored as JSON on the metrics table.
///
/// All fields are optional so the three aggregators (complexity, issues,
/// pull requests) can each write their slice without clobbering the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_frequency: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues_open: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues_closed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_age: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulls_merged: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulls_cumulative_age: Option<i64>,
}

impl MetricPayload {
    /// Overlay `other` onto self: fields set in `other` win, the rest keep
    /// their current value. Used by the field-level metric upsert.
    pub fn merge(&mut self, other: &MetricPayload) {
        if other.complexity.is_some() {
            self.complexity = other.complexity;
        }
        if other.change_frequency.is_some() {
            self.change_frequency = other.change_frequency;
        }
        if other.issues_open.is_some() {
            self.issues_open = other.issues_open;
        }
        if other.issues_closed.is_some() {
            self.issues_closed = other.issues_closed;
        }
        if other.issue_age.is_some() {
            self.issue_age = other.issue_age;
        }
        if other.pulls_merged.is_some() {
            self.pulls_merged = other.pulls_merged;
        }
        if other.pulls_cumulative_age.is_some() {
            self.pulls_cumulative_age = other.pulls_cumulative_age;
        }
    }

    /// Average hours a merged pull request stayed open, from the cumulative
    /// age in seconds. 0 when nothing was merged.
    pub fn pulls_average_age_hours(&self) -> f64 {
        let merged = self.pulls_merged.unwrap_or(0);
        if merged <= 0 {
            return 0.0;
        }
        let cumulative = self.pulls_cumulative_age.unwrap_or(0);
        cumulative as f64 / merged as f64 / 3600.0
    }
}

/// One per-day point of a project's metric series.
#[derive(Debug, Clone)]
pub struct MetricPoint {
    pub project_id: String,
    pub date: NaiveDate,
    pub payload: MetricPayload,
}

/// Immutable capture of the repository tree at a point in time. At most one
/// snapshot per project is active.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub id: String,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub active: bool,
}

/// Per-author line share of a file, normalized to integer percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ownership {
    pub author: String,
    pub lines: i64,
}

/// Element of a snapshot tree: a directory or a file leaf.
#[derive(Debug, Clone)]
pub struct SourceNode {
    pub id: String,
    pub snapshot_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    /// Repo-root-anchored relative path; empty for the root node.
    pub path: String,
    pub is_file: bool,
    pub complexity: i64,
    pub change_count: i64,
    pub ownership: Vec<Ownership>,
    pub repo_link: Option<String>,
    /// Nested-set bounds, computed in one post-order pass at snapshot
    /// activation. Not maintained incrementally.
    pub lft: i64,
    pub rgt: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(opened: &str, closed: Option<&str>) -> Issue {
        let parse = |s: &str| {
            format!("{}T00:00:00Z", s)
                .parse::<DateTime<Utc>>()
                .unwrap()
        };
        Issue {
            project_id: "p1".to_string(),
            issue_refid: 1,
            opened_at: parse(opened),
            closed_at: closed.map(parse),
            labels: vec![],
            category: IssueCategory::Change,
        }
    }

    #[test]
    fn issue_age_open_grows_with_date() {
        let i = issue("2024-01-01", Some("2024-01-11"));
        let d = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(i.age_at(d), 4);
    }

    #[test]
    fn issue_age_constant_after_close() {
        let i = issue("2024-01-01", Some("2024-01-11"));
        let d = NaiveDate::from_ymd_opt(2024, 1, 20).unwrap();
        assert_eq!(i.age_at(d), 10);
    }

    #[test]
    fn issue_age_never_negative() {
        let i = issue("2024-01-10", None);
        let d = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(i.age_at(d), 0);
    }

    #[test]
    fn category_exact_label_match() {
        let labels = vec!["bug".to_string(), "ui".to_string()];
        let bug_labels = vec!["bug".to_string()];
        assert_eq!(
            IssueCategory::from_labels(&labels, &bug_labels),
            IssueCategory::Bug
        );
    }

    #[test]
    fn category_substring_match() {
        let labels = vec!["type: bugfix".to_string()];
        let bug_labels = vec!["bug".to_string()];
        assert_eq!(
            IssueCategory::from_labels(&labels, &bug_labels),
            IssueCategory::Bug
        );
    }

    #[test]
    fn category_defaults_to_change() {
        let labels = vec!["enhancement".to_string()];
        let bug_labels = vec!["bug".to_string()];
        assert_eq!(
            IssueCategory::from_labels(&labels, &bug_labels),
            IssueCategory::Change
        );
    }

    #[test]
    fn payload_merge_keeps_unset_fields() {
        let mut a = MetricPayload {
            complexity: Some(10),
            change_frequency: Some(2),
            ..Default::default()
        };
        let b = MetricPayload {
            issues_open: Some(5),
            issue_age: Some(1.5),
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.complexity, Some(10));
        assert_eq!(a.change_frequency, Some(2));
        assert_eq!(a.issues_open, Some(5));
        assert_eq!(a.issue_age, Some(1.5));
    }

    #[test]
    fn pulls_average_age_zero_when_unmerged() {
        let p = MetricPayload::default();
        assert_eq!(p.pulls_average_age_hours(), 0.0);

        let p = MetricPayload {
            pulls_merged: Some(2),
            pulls_cumulative_age: Some(7200),
            ..Default::default()
        };
        assert_eq!(p.pulls_average_age_hours(), 1.0);
    }
}
