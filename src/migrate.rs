use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            git_url TEXT NOT NULL,
            default_branch TEXT,
            private INTEGER NOT NULL DEFAULT 1,
            active INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'READY',
            last_update INTEGER,
            provider_refs TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS code_changes (
            project_id TEXT NOT NULL,
            commit_hash TEXT NOT NULL,
            file_path TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            ts_utc INTEGER NOT NULL,
            author TEXT NOT NULL,
            complexity_added INTEGER NOT NULL,
            complexity_removed INTEGER NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (project_id, commit_hash, file_path),
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS issues (
            project_id TEXT NOT NULL,
            issue_refid INTEGER NOT NULL,
            opened_at INTEGER NOT NULL,
            closed_at INTEGER,
            labels TEXT NOT NULL DEFAULT '[]',
            category TEXT NOT NULL DEFAULT 'change',
            PRIMARY KEY (project_id, issue_refid),
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pull_requests (
            project_id TEXT NOT NULL,
            pull_refid INTEGER NOT NULL,
            opened_at INTEGER NOT NULL,
            merged_at INTEGER,
            age_days INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (project_id, pull_refid),
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS releases (
            project_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            type TEXT NOT NULL DEFAULT 'git_tag',
            name TEXT NOT NULL,
            url TEXT,
            PRIMARY KEY (project_id, timestamp, name),
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metrics (
            project_id TEXT NOT NULL,
            date TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (project_id, date),
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_snapshots (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_nodes (
            id TEXT PRIMARY KEY,
            snapshot_id TEXT NOT NULL,
            parent_id TEXT,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            is_file INTEGER NOT NULL DEFAULT 0,
            complexity INTEGER NOT NULL DEFAULT 0,
            change_count INTEGER NOT NULL DEFAULT 0,
            ownership TEXT NOT NULL DEFAULT '[]',
            repo_link TEXT,
            lft INTEGER NOT NULL DEFAULT 0,
            rgt INTEGER NOT NULL DEFAULT 0,
            UNIQUE (snapshot_id, parent_id, name),
            FOREIGN KEY (snapshot_id) REFERENCES source_snapshots(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_code_changes_project_ts ON code_changes(project_id, ts_utc)",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_code_changes_project_path ON code_changes(project_id, file_path)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_metrics_project_date ON metrics(project_id, date)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_issues_project_opened ON issues(project_id, opened_at)",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_project_active ON source_snapshots(project_id, active)",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_source_nodes_snapshot ON source_nodes(snapshot_id, lft)",
    )
    .execute(&pool)
    .await?;

    pool.close().await;
    Ok(())
}
