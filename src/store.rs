//! Typed accessors over the entity store.
//!
//! Every write is an upsert keyed by the entity's natural key, which makes
//! the whole ingestion pipeline idempotent under retries and concurrent
//! workers. Read paths expose the range queries the aggregators and the
//! source-tree builder need.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{
    CodeChange, Issue, IssueCategory, MetricPayload, MetricPoint, Ownership, Project,
    ProjectStatus, PullRequest, Release, ReleaseKind, SourceNode, SourceSnapshot,
};

// ---------------- projects ----------------

pub async fn create_project(pool: &SqlitePool, project: &Project) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO projects (id, name, slug, git_url, default_branch, private, active, status, last_update, provider_refs)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(slug) DO UPDATE SET
            name = excluded.name,
            git_url = excluded.git_url,
            private = excluded.private,
            provider_refs = excluded.provider_refs
        "#,
    )
    .bind(&project.id)
    .bind(&project.name)
    .bind(&project.slug)
    .bind(&project.git_url)
    .bind(&project.default_branch)
    .bind(project.private)
    .bind(project.active)
    .bind(project.status.as_str())
    .bind(project.last_update.map(|t| t.timestamp()))
    .bind(project.provider_refs.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_project(row: &sqlx::sqlite::SqliteRow) -> Result<Project> {
    let provider_refs: String = row.get("provider_refs");
    let status: String = row.get("status");
    Ok(Project {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
        git_url: row.get("git_url"),
        default_branch: row.get("default_branch"),
        private: row.get("private"),
        active: row.get("active"),
        status: ProjectStatus::parse(&status),
        last_update: row
            .get::<Option<i64>, _>("last_update")
            .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        provider_refs: serde_json::from_str(&provider_refs)
            .with_context(|| "invalid provider_refs JSON")?,
    })
}

pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Option<Project>> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_project).transpose()
}

pub async fn get_project_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<Project>> {
    let row = sqlx::query("SELECT * FROM projects WHERE slug = ?")
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_project).transpose()
}

pub async fn list_active_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let rows = sqlx::query("SELECT * FROM projects WHERE active = 1 ORDER BY slug")
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_project).collect()
}

pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let rows = sqlx::query("SELECT * FROM projects ORDER BY slug")
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_project).collect()
}

/// Guarded status transition. Returns false when the project was not in
/// `from` — the caller lost the race and must not start a second pipeline.
pub async fn transition_status(
    pool: &SqlitePool,
    project_id: &str,
    from: ProjectStatus,
    to: ProjectStatus,
) -> Result<bool> {
    let result = sqlx::query("UPDATE projects SET status = ? WHERE id = ? AND status = ?")
        .bind(to.as_str())
        .bind(project_id)
        .bind(from.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_status(pool: &SqlitePool, project_id: &str, status: ProjectStatus) -> Result<()> {
    sqlx::query("UPDATE projects SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(project_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_default_branch(pool: &SqlitePool, project_id: &str, branch: &str) -> Result<()> {
    sqlx::query("UPDATE projects SET default_branch = ? WHERE id = ?")
        .bind(branch)
        .bind(project_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_last_update(
    pool: &SqlitePool,
    project_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE projects SET last_update = ? WHERE id = ?")
        .bind(at.timestamp())
        .bind(project_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_active(pool: &SqlitePool, project_id: &str, active: bool) -> Result<()> {
    sqlx::query("UPDATE projects SET active = ? WHERE id = ?")
        .bind(active)
        .bind(project_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete all derived rows for a project and reset its pipeline state.
pub async fn purge_project_data(pool: &SqlitePool, project_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM source_nodes WHERE snapshot_id IN (SELECT id FROM source_snapshots WHERE project_id = ?)",
    )
    .bind(project_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM source_snapshots WHERE project_id = ?")
        .bind(project_id)
        .execute(&mut *tx)
        .await?;
    for table in [
        "metrics",
        "releases",
        "pull_requests",
        "issues",
        "code_changes",
    ] {
        sqlx::query(&format!("DELETE FROM {} WHERE project_id = ?", table))
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("UPDATE projects SET last_update = NULL, status = 'READY' WHERE id = ?")
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

// ---------------- code changes ----------------

/// Insert one (commit, file) row. Rows are immutable; a conflict on the
/// natural key means the row is already ingested and the write is a no-op.
pub async fn upsert_code_change(pool: &SqlitePool, change: &CodeChange) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO code_changes (project_id, commit_hash, file_path, timestamp, ts_utc, author, complexity_added, complexity_removed, description)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(project_id, commit_hash, file_path) DO NOTHING
        "#,
    )
    .bind(&change.project_id)
    .bind(&change.commit_hash)
    .bind(&change.file_path)
    .bind(change.timestamp.to_rfc3339())
    .bind(change.timestamp.timestamp())
    .bind(&change.author)
    .bind(change.complexity_added)
    .bind(change.complexity_removed)
    .bind(&change.description)
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_code_change(row: &sqlx::sqlite::SqliteRow) -> Result<CodeChange> {
    let ts: String = row.get("timestamp");
    Ok(CodeChange {
        project_id: row.get("project_id"),
        commit_hash: row.get("commit_hash"),
        timestamp: DateTime::<FixedOffset>::parse_from_rfc3339(&ts)
            .with_context(|| format!("invalid code change timestamp: {}", ts))?,
        file_path: row.get("file_path"),
        author: row.get("author"),
        complexity_added: row.get("complexity_added"),
        complexity_removed: row.get("complexity_removed"),
        description: row.get("description"),
    })
}

/// Code changes for a project ordered by commit time, optionally bounded
/// below (inclusive, day precision).
pub async fn code_changes_since(
    pool: &SqlitePool,
    project_id: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<CodeChange>> {
    let since_ts = since.map(|s| s.timestamp()).unwrap_or(i64::MIN);
    let rows = sqlx::query(
        "SELECT * FROM code_changes WHERE project_id = ? AND ts_utc >= ? ORDER BY ts_utc, commit_hash, file_path",
    )
    .bind(project_id)
    .bind(since_ts)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_code_change).collect()
}

pub async fn count_code_changes(pool: &SqlitePool, project_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM code_changes WHERE project_id = ?")
        .bind(project_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Commits touching `path` since `since`, used as the change weight of a
/// file node.
pub async fn count_changes_for_path(
    pool: &SqlitePool,
    project_id: &str,
    path: &str,
    since: DateTime<Utc>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM code_changes WHERE project_id = ? AND file_path = ? AND ts_utc >= ?",
    )
    .bind(project_id)
    .bind(path)
    .bind(since.timestamp())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Daily change counts for one path over the trailing `days`, zero-filled.
pub async fn file_changes_trend(
    pool: &SqlitePool,
    project_id: &str,
    path: &str,
    days: i64,
) -> Result<Vec<i64>> {
    let today = Utc::now().date_naive();
    let ref_date = today - chrono::Duration::days(days);
    let since = ref_date
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
        .unwrap_or_else(Utc::now);

    let rows = sqlx::query(
        "SELECT ts_utc FROM code_changes WHERE project_id = ? AND file_path = ? AND ts_utc >= ? ORDER BY ts_utc",
    )
    .bind(project_id)
    .bind(path)
    .bind(since.timestamp())
    .fetch_all(pool)
    .await?;

    let mut trend = vec![0i64; days as usize + 1];
    for row in &rows {
        let ts: i64 = row.get("ts_utc");
        if let Some(dt) = DateTime::from_timestamp(ts, 0) {
            let offset = (dt.date_naive() - ref_date).num_days();
            if (0..trend.len() as i64).contains(&offset) {
                trend[offset as usize] += 1;
            }
        }
    }
    Ok(trend)
}

// ---------------- issues ----------------

pub async fn upsert_issue(pool: &SqlitePool, issue: &Issue) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO issues (project_id, issue_refid, opened_at, closed_at, labels, category)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(project_id, issue_refid) DO UPDATE SET
            closed_at = excluded.closed_at,
            labels = excluded.labels,
            category = excluded.category
        "#,
    )
    .bind(&issue.project_id)
    .bind(issue.issue_refid)
    .bind(issue.opened_at.timestamp())
    .bind(issue.closed_at.map(|t| t.timestamp()))
    .bind(serde_json::to_string(&issue.labels)?)
    .bind(issue.category.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn issues_for_project(pool: &SqlitePool, project_id: &str) -> Result<Vec<Issue>> {
    let rows = sqlx::query(
        "SELECT * FROM issues WHERE project_id = ? ORDER BY opened_at, issue_refid",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let labels: String = row.get("labels");
            let category: String = row.get("category");
            let opened: i64 = row.get("opened_at");
            Ok(Issue {
                project_id: row.get("project_id"),
                issue_refid: row.get("issue_refid"),
                opened_at: DateTime::from_timestamp(opened, 0)
                    .context("invalid issue opened_at")?,
                closed_at: row
                    .get::<Option<i64>, _>("closed_at")
                    .and_then(|ts| DateTime::from_timestamp(ts, 0)),
                labels: serde_json::from_str(&labels)?,
                category: IssueCategory::parse(&category),
            })
        })
        .collect()
}

// ---------------- pull requests ----------------

pub async fn upsert_pull_request(pool: &SqlitePool, pull: &PullRequest) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pull_requests (project_id, pull_refid, opened_at, merged_at, age_days)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(project_id, pull_refid) DO UPDATE SET
            merged_at = excluded.merged_at,
            age_days = excluded.age_days
        "#,
    )
    .bind(&pull.project_id)
    .bind(pull.pull_refid)
    .bind(pull.opened_at.timestamp())
    .bind(pull.merged_at.map(|t| t.timestamp()))
    .bind(pull.age_days)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn pull_requests_for_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<PullRequest>> {
    let rows = sqlx::query(
        "SELECT * FROM pull_requests WHERE project_id = ? ORDER BY opened_at, pull_refid",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let opened: i64 = row.get("opened_at");
            Ok(PullRequest {
                project_id: row.get("project_id"),
                pull_refid: row.get("pull_refid"),
                opened_at: DateTime::from_timestamp(opened, 0)
                    .context("invalid pull request opened_at")?,
                merged_at: row
                    .get::<Option<i64>, _>("merged_at")
                    .and_then(|ts| DateTime::from_timestamp(ts, 0)),
                age_days: row.get("age_days"),
            })
        })
        .collect()
}

// ---------------- releases ----------------

pub async fn upsert_release(pool: &SqlitePool, release: &Release) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO releases (project_id, timestamp, type, name, url)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(project_id, timestamp, name) DO UPDATE SET
            type = excluded.type,
            url = excluded.url
        "#,
    )
    .bind(&release.project_id)
    .bind(release.timestamp.timestamp())
    .bind(release.kind.as_str())
    .bind(&release.name)
    .bind(&release.url)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn releases_for_project(pool: &SqlitePool, project_id: &str) -> Result<Vec<Release>> {
    let rows = sqlx::query(
        "SELECT * FROM releases WHERE project_id = ? ORDER BY timestamp, name",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let ts: i64 = row.get("timestamp");
            let kind: String = row.get("type");
            Ok(Release {
                project_id: row.get("project_id"),
                timestamp: DateTime::from_timestamp(ts, 0).context("invalid release timestamp")?,
                kind: ReleaseKind::parse(&kind),
                name: row.get("name"),
                url: row.get("url"),
            })
        })
        .collect()
}

// ---------------- metrics ----------------

/// Merge `fields` into the payload for (project, date): fields present in
/// `fields` win, previously written fields survive. The merge happens in
/// SQL (`json_patch`) so concurrent aggregators writing different fields
/// of the same day cannot lose each other's updates.
pub async fn upsert_metric_fields(
    pool: &SqlitePool,
    project_id: &str,
    date: NaiveDate,
    fields: &MetricPayload,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO metrics (project_id, date, payload) VALUES (?, ?, ?)
        ON CONFLICT(project_id, date) DO UPDATE SET
            payload = json_patch(metrics.payload, excluded.payload)
        "#,
    )
    .bind(project_id)
    .bind(date.to_string())
    .bind(serde_json::to_string(fields)?)
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_metric(row: &sqlx::sqlite::SqliteRow) -> Result<MetricPoint> {
    let date: String = row.get("date");
    let payload: String = row.get("payload");
    Ok(MetricPoint {
        project_id: row.get("project_id"),
        date: date
            .parse::<NaiveDate>()
            .with_context(|| format!("invalid metric date: {}", date))?,
        payload: serde_json::from_str(&payload)?,
    })
}

/// Latest metric strictly before `date`.
pub async fn last_metric_before(
    pool: &SqlitePool,
    project_id: &str,
    date: NaiveDate,
) -> Result<Option<MetricPoint>> {
    let row = sqlx::query(
        "SELECT * FROM metrics WHERE project_id = ? AND date < ? ORDER BY date DESC LIMIT 1",
    )
    .bind(project_id)
    .bind(date.to_string())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_metric).transpose()
}

pub async fn metrics_in_range(
    pool: &SqlitePool,
    project_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<MetricPoint>> {
    let rows = sqlx::query(
        "SELECT * FROM metrics WHERE project_id = ? AND date >= ? AND date <= ? ORDER BY date",
    )
    .bind(project_id)
    .bind(from.to_string())
    .bind(to.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_metric).collect()
}

pub async fn metric_date_bounds(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Option<(NaiveDate, NaiveDate)>> {
    let row = sqlx::query("SELECT MIN(date) AS lo, MAX(date) AS hi FROM metrics WHERE project_id = ?")
        .bind(project_id)
        .fetch_one(pool)
        .await?;
    let lo: Option<String> = row.get("lo");
    let hi: Option<String> = row.get("hi");
    match (lo, hi) {
        (Some(lo), Some(hi)) => Ok(Some((lo.parse()?, hi.parse()?))),
        _ => Ok(None),
    }
}

// ---------------- source tree snapshots ----------------

pub async fn create_snapshot(pool: &SqlitePool, snapshot: &SourceSnapshot) -> Result<()> {
    sqlx::query(
        "INSERT INTO source_snapshots (id, project_id, timestamp, active) VALUES (?, ?, ?, ?)",
    )
    .bind(&snapshot.id)
    .bind(&snapshot.project_id)
    .bind(snapshot.timestamp.timestamp())
    .bind(snapshot.active)
    .execute(pool)
    .await?;
    Ok(())
}

/// Write a snapshot's whole node tree in one transaction.
pub async fn write_nodes(pool: &SqlitePool, nodes: &[SourceNode]) -> Result<()> {
    let mut tx = pool.begin().await?;

    for node in nodes {
        sqlx::query(
            r#"
            INSERT INTO source_nodes (id, snapshot_id, parent_id, name, path, is_file, complexity, change_count, ownership, repo_link, lft, rgt)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(&node.snapshot_id)
        .bind(&node.parent_id)
        .bind(&node.name)
        .bind(&node.path)
        .bind(node.is_file)
        .bind(node.complexity)
        .bind(node.change_count)
        .bind(serde_json::to_string(&node.ownership)?)
        .bind(&node.repo_link)
        .bind(node.lft)
        .bind(node.rgt)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Activate `snapshot_id` and deactivate the previous active snapshot of
/// the project in the same transaction.
pub async fn activate_snapshot(
    pool: &SqlitePool,
    project_id: &str,
    snapshot_id: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE source_snapshots SET active = 0 WHERE project_id = ? AND active = 1")
        .bind(project_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE source_snapshots SET active = 1 WHERE id = ?")
        .bind(snapshot_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn active_snapshot(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Option<SourceSnapshot>> {
    let row = sqlx::query(
        "SELECT * FROM source_snapshots WHERE project_id = ? AND active = 1 LIMIT 1",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let ts: i64 = row.get("timestamp");
        Ok(SourceSnapshot {
            id: row.get("id"),
            project_id: row.get("project_id"),
            timestamp: DateTime::from_timestamp(ts, 0).context("invalid snapshot timestamp")?,
            active: row.get("active"),
        })
    })
    .transpose()
}

pub async fn count_active_snapshots(pool: &SqlitePool, project_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM source_snapshots WHERE project_id = ? AND active = 1",
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// All nodes of a snapshot in depth-first (lft) order.
pub async fn nodes_for_snapshot(pool: &SqlitePool, snapshot_id: &str) -> Result<Vec<SourceNode>> {
    let rows = sqlx::query("SELECT * FROM source_nodes WHERE snapshot_id = ? ORDER BY lft")
        .bind(snapshot_id)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            let ownership: String = row.get("ownership");
            Ok(SourceNode {
                id: row.get("id"),
                snapshot_id: row.get("snapshot_id"),
                parent_id: row.get("parent_id"),
                name: row.get("name"),
                path: row.get("path"),
                is_file: row.get("is_file"),
                complexity: row.get("complexity"),
                change_count: row.get("change_count"),
                ownership: serde_json::from_str::<Vec<Ownership>>(&ownership)?,
                repo_link: row.get("repo_link"),
                lft: row.get("lft"),
                rgt: row.get("rgt"),
            })
        })
        .collect()
}

/// Ownership annotation of one file in the active snapshot.
pub async fn file_ownership(
    pool: &SqlitePool,
    project_id: &str,
    path: &str,
) -> Result<Option<Vec<Ownership>>> {
    let snapshot = match active_snapshot(pool, project_id).await? {
        Some(s) => s,
        None => return Ok(None),
    };

    let ownership: Option<String> = sqlx::query_scalar(
        "SELECT ownership FROM source_nodes WHERE snapshot_id = ? AND path = ? AND is_file = 1",
    )
    .bind(&snapshot.id)
    .bind(path)
    .fetch_optional(pool)
    .await?;

    ownership
        .map(|json| serde_json::from_str(&json).context("invalid ownership JSON"))
        .transpose()
}
