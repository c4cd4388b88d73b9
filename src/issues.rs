//! Issue, pull-request, and release ingestion from the hosting provider.
//!
//! All writes key on (project, external id); re-running an import upserts
//! the same rows. The provider's issues endpoint mirrors pull requests as
//! issues with a `pull_request` field — those are skipped here and ingested
//! through the dedicated pulls endpoint instead.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Issue, IssueCategory, Project, PullRequest, Release, ReleaseKind};
use crate::provider::ProviderClient;
use crate::store;

/// Fetch and upsert issues, oldest first. `start_date` switches the
/// endpoint into incremental mode (`since=`).
pub async fn import_issues(
    pool: &SqlitePool,
    project: &Project,
    client: &ProviderClient,
    start_date: Option<DateTime<Utc>>,
) -> Result<u64> {
    log::info!(
        "Project({}): Starting import_issues ({:?}).",
        project.slug,
        start_date
    );

    let (owner, repo) = match (project.repo_owner(), project.repo_name()) {
        (Some(o), Some(r)) => (o.to_string(), r.to_string()),
        _ => {
            log::warn!(
                "Project({}): no provider owner/repo configured, skipping issues.",
                project.slug
            );
            return Ok(0);
        }
    };

    let bug_labels = project.bug_labels();
    let items = client.get_issues(&owner, &repo, start_date).await?;

    let mut count = 0u64;
    for item in &items {
        if let Some(issue) = issue_from_json(&project.id, item, &bug_labels) {
            store::upsert_issue(pool, &issue).await?;
            count += 1;
        }
    }

    log::info!(
        "Project({}): Finished import_issues ({} rows).",
        project.slug,
        count
    );
    Ok(count)
}

/// Fetch and upsert closed pull requests with their merge age.
pub async fn import_pull_requests(
    pool: &SqlitePool,
    project: &Project,
    client: &ProviderClient,
) -> Result<u64> {
    log::info!("Project({}): Starting import_pull_requests.", project.slug);

    let (owner, repo) = match (project.repo_owner(), project.repo_name()) {
        (Some(o), Some(r)) => (o.to_string(), r.to_string()),
        _ => {
            log::warn!(
                "Project({}): no provider owner/repo configured, skipping pulls.",
                project.slug
            );
            return Ok(0);
        }
    };

    let items = client.get_pull_requests(&owner, &repo).await?;

    let mut count = 0u64;
    for item in &items {
        if let Some(pull) = pull_request_from_json(&project.id, item) {
            store::upsert_pull_request(pool, &pull).await?;
            count += 1;
        }
    }

    log::info!(
        "Project({}): Finished import_pull_requests ({} rows).",
        project.slug,
        count
    );
    Ok(count)
}

/// Fetch and upsert provider releases.
pub async fn import_releases(
    pool: &SqlitePool,
    project: &Project,
    client: &ProviderClient,
) -> Result<u64> {
    log::info!("Project({}): Starting import_releases.", project.slug);

    let (owner, repo) = match (project.repo_owner(), project.repo_name()) {
        (Some(o), Some(r)) => (o.to_string(), r.to_string()),
        _ => {
            log::warn!(
                "Project({}): no provider owner/repo configured, skipping releases.",
                project.slug
            );
            return Ok(0);
        }
    };

    let items = client.get_releases(&owner, &repo).await?;

    let mut count = 0u64;
    for item in &items {
        if let Some(release) = release_from_json(&project.id, item) {
            log::debug!(
                "Project({}): Release {} {}",
                project.slug,
                release.name,
                release.timestamp
            );
            store::upsert_release(pool, &release).await?;
            count += 1;
        }
    }

    log::info!(
        "Project({}): Finished import_releases ({} rows).",
        project.slug,
        count
    );
    Ok(count)
}

/// Convert one provider issue object; None for PR mirror rows and items
/// missing required fields.
pub fn issue_from_json(
    project_id: &str,
    item: &serde_json::Value,
    bug_labels: &[String],
) -> Option<Issue> {
    if item.get("pull_request").is_some() {
        return None;
    }

    let number = item.get("number")?.as_i64()?;
    let opened_at = parse_ts(item.get("created_at"))?;
    let closed_at = parse_ts(item.get("closed_at"));

    let labels: Vec<String> = item
        .get("labels")
        .and_then(|l| l.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|l| l.get("name").and_then(|n| n.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let category = IssueCategory::from_labels(&labels, bug_labels);

    Some(Issue {
        project_id: project_id.to_string(),
        issue_refid: number,
        opened_at,
        closed_at,
        labels,
        category,
    })
}

/// Convert one provider pull-request object; age is merged - opened in
/// whole days, 0 for closed-but-unmerged PRs.
pub fn pull_request_from_json(project_id: &str, item: &serde_json::Value) -> Option<PullRequest> {
    let number = item.get("number")?.as_i64()?;
    let opened_at = parse_ts(item.get("created_at"))?;
    let merged_at = parse_ts(item.get("merged_at"));

    let age_days = merged_at
        .map(|merged| (merged - opened_at).num_days().max(0))
        .unwrap_or(0);

    Some(PullRequest {
        project_id: project_id.to_string(),
        pull_refid: number,
        opened_at,
        merged_at,
        age_days,
    })
}

/// Convert one provider release object.
pub fn release_from_json(project_id: &str, item: &serde_json::Value) -> Option<Release> {
    let name = item.get("tag_name")?.as_str()?;
    let timestamp = parse_ts(item.get("published_at"))?;
    let url = item
        .get("html_url")
        .and_then(|u| u.as_str())
        .map(|s| s.to_string());

    Some(Release {
        project_id: project_id.to_string(),
        timestamp,
        kind: ReleaseKind::ProviderRelease,
        name: name.to_string(),
        url,
    })
}

fn parse_ts(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bug_labels() -> Vec<String> {
        vec!["bug".to_string()]
    }

    #[test]
    fn issue_parsed_with_labels_and_category() {
        let item = json!({
            "number": 42,
            "created_at": "2024-01-01T10:00:00Z",
            "closed_at": "2024-01-11T10:00:00Z",
            "labels": [{"name": "bug"}, {"name": "ui"}]
        });
        let issue = issue_from_json("p1", &item, &bug_labels()).unwrap();
        assert_eq!(issue.issue_refid, 42);
        assert_eq!(issue.labels, vec!["bug", "ui"]);
        assert_eq!(issue.category, IssueCategory::Bug);
        assert!(issue.closed_at.is_some());
    }

    #[test]
    fn open_issue_has_no_closed_at() {
        let item = json!({
            "number": 7,
            "created_at": "2024-01-01T10:00:00Z",
            "closed_at": null,
            "labels": []
        });
        let issue = issue_from_json("p1", &item, &bug_labels()).unwrap();
        assert!(issue.closed_at.is_none());
        assert_eq!(issue.category, IssueCategory::Change);
    }

    #[test]
    fn pull_request_mirror_rows_are_skipped() {
        let item = json!({
            "number": 8,
            "created_at": "2024-01-01T10:00:00Z",
            "pull_request": {"url": "https://api.example.com/pulls/8"}
        });
        assert!(issue_from_json("p1", &item, &bug_labels()).is_none());
    }

    #[test]
    fn merged_pull_age_in_days() {
        let item = json!({
            "number": 3,
            "created_at": "2024-01-01T00:00:00Z",
            "merged_at": "2024-01-04T12:00:00Z"
        });
        let pull = pull_request_from_json("p1", &item).unwrap();
        assert_eq!(pull.age_days, 3);
        assert!(pull.merged_at.is_some());
    }

    #[test]
    fn unmerged_closed_pull_has_zero_age() {
        let item = json!({
            "number": 4,
            "created_at": "2024-01-01T00:00:00Z",
            "merged_at": null
        });
        let pull = pull_request_from_json("p1", &item).unwrap();
        assert_eq!(pull.age_days, 0);
        assert!(pull.merged_at.is_none());
    }

    #[test]
    fn release_parsed_from_tag_name() {
        let item = json!({
            "tag_name": "v2.1.0",
            "published_at": "2024-03-01T09:00:00Z",
            "html_url": "https://example.com/releases/v2.1.0"
        });
        let release = release_from_json("p1", &item).unwrap();
        assert_eq!(release.name, "v2.1.0");
        assert_eq!(release.kind, ReleaseKind::ProviderRelease);
        assert!(release.url.is_some());
    }

    #[test]
    fn release_without_publish_date_skipped() {
        let item = json!({"tag_name": "draft", "published_at": null});
        assert!(release_from_json("p1", &item).is_none());
    }
}
