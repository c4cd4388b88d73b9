//! Database statistics and health overview.
//!
//! Provides a quick summary of what's ingested: per-project row counts,
//! pipeline status, and last-update recency. Used by `pulse stats` to give
//! confidence that ingestion runs are landing as expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::store;

/// Per-project breakdown of ingested rows.
struct ProjectStats {
    slug: String,
    status: String,
    change_count: i64,
    issue_count: i64,
    pull_count: i64,
    release_count: i64,
    metric_days: i64,
    last_update_ts: Option<i64>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_projects: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
        .fetch_one(&pool)
        .await?;
    let total_changes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM code_changes")
        .fetch_one(&pool)
        .await?;
    let total_metrics: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metrics")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Repo Pulse — Database Stats");
    println!("===========================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Projects:     {}", total_projects);
    println!("  Code changes: {}", total_changes);
    println!("  Metric days:  {}", total_metrics);

    let projects = store::list_projects(&pool).await?;
    let mut stats = Vec::new();
    for project in &projects {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM code_changes WHERE project_id = p.id) AS change_count,
                (SELECT COUNT(*) FROM issues WHERE project_id = p.id) AS issue_count,
                (SELECT COUNT(*) FROM pull_requests WHERE project_id = p.id) AS pull_count,
                (SELECT COUNT(*) FROM releases WHERE project_id = p.id) AS release_count,
                (SELECT COUNT(*) FROM metrics WHERE project_id = p.id) AS metric_days
            FROM projects p WHERE p.id = ?
            "#,
        )
        .bind(&project.id)
        .fetch_one(&pool)
        .await?;

        stats.push(ProjectStats {
            slug: project.slug.clone(),
            status: project.status.as_str().to_string(),
            change_count: row.get("change_count"),
            issue_count: row.get("issue_count"),
            pull_count: row.get("pull_count"),
            release_count: row.get("release_count"),
            metric_days: row.get("metric_days"),
            last_update_ts: project.last_update.map(|t| t.timestamp()),
        });
    }

    if !stats.is_empty() {
        println!();
        println!("  By project:");
        println!(
            "  {:<24} {:<10} {:>8} {:>7} {:>6} {:>9} {:>7}   {}",
            "PROJECT", "STATUS", "CHANGES", "ISSUES", "PULLS", "RELEASES", "DAYS", "LAST UPDATE"
        );
        println!("  {}", "-".repeat(96));

        for s in &stats {
            let update_display = match s.last_update_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:<10} {:>8} {:>7} {:>6} {:>9} {:>7}   {}",
                s.slug,
                s.status,
                s.change_count,
                s.issue_count,
                s.pull_count,
                s.release_count,
                s.metric_days,
                update_display
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
