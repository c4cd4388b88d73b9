//! # Repo Pulse CLI (`pulse`)
//!
//! The `pulse` binary drives the ingestion pipeline and the webhook
//! receiver. It provides commands for database initialization, project
//! registration, full and incremental ingestion, metric inspection, and
//! purging.
//!
//! ## Usage
//!
//! ```bash
//! pulse --config ./pulse.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pulse init` | Create the SQLite database and run schema migrations |
//! | `pulse add <slug> <git-url>` | Register a repository for tracking |
//! | `pulse ingest <slug>` | Run the full-history ingest pipeline |
//! | `pulse update <slug>` / `--all` | Run the incremental update pipeline |
//! | `pulse metrics <slug>` | Print the per-day health series |
//! | `pulse stats` | Show row counts and last-update recency |
//! | `pulse purge <slug>` | Delete all derived rows for a project |
//! | `pulse serve` | Start the webhook receiver |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use repo_pulse::config::load_config;
use repo_pulse::models::{Project, ProjectStatus};
use repo_pulse::{metrics, migrate, pipeline, stats, store, webhook};

/// Repo Pulse — software-health metrics for git repositories.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Provider credentials and directory locations can also come from
/// the environment (REPO_CACHE_DIR, SCRATCH_DIR, PROVIDER_*).
#[derive(Parser)]
#[command(
    name = "pulse",
    about = "Repo Pulse — git history ingestion and software-health metrics",
    version,
    long_about = "Repo Pulse ingests a repository's commit history, issues, pull requests, \
    and releases, derives per-day complexity and age metrics, and materializes an annotated \
    snapshot of the current source tree."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./pulse.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Register a repository for tracking.
    ///
    /// Projects are created inactive pipeline-wise: run `pulse ingest`
    /// afterwards to populate history and metrics.
    Add {
        /// Unique project slug, e.g. `acme-widget`.
        slug: String,

        /// Remote URL to clone from.
        git_url: String,

        /// Human-readable name; defaults to the slug.
        #[arg(long)]
        name: Option<String>,

        /// Mark the repository private; cloning will inject an
        /// installation access token.
        #[arg(long)]
        private: bool,

        /// Provider repository owner (for issue/PR/release ingestion).
        #[arg(long)]
        owner: Option<String>,

        /// Provider repository name (for issue/PR/release ingestion).
        #[arg(long)]
        repo: Option<String>,

        /// Provider app installation id for this repository.
        #[arg(long)]
        installation_id: Option<i64>,

        /// Labels that mark an issue as a bug (repeatable).
        #[arg(long = "bug-label")]
        bug_labels: Vec<String>,
    },

    /// Run the full-history ingest pipeline for one project.
    ///
    /// Clones or pulls the repository, walks the entire commit history,
    /// fetches issues, pull requests, and releases, aggregates per-day
    /// metrics, and materializes a source-tree snapshot.
    Ingest {
        /// Project slug.
        slug: String,
    },

    /// Run the incremental update pipeline.
    ///
    /// Same stages as `ingest`, starting at the beginning of the day 24
    /// hours ago so a daily schedule overlaps the previous run.
    Update {
        /// Project slug. Omit with `--all` to update every active project.
        slug: Option<String>,

        /// Update all active projects sequentially.
        #[arg(long)]
        all: bool,
    },

    /// Print the per-day metric series for a project.
    ///
    /// The series is forward-filled and resampled to the frequency its
    /// span calls for (daily up to 90 days, then weekly, monthly,
    /// quarterly).
    Metrics {
        /// Project slug.
        slug: String,

        /// Trailing window in days.
        #[arg(long, default_value_t = 90)]
        days: i64,
    },

    /// Show database statistics.
    Stats,

    /// Delete all derived rows for a project and reset its status.
    ///
    /// The project row itself is kept; a subsequent `pulse ingest`
    /// rebuilds everything from scratch.
    Purge {
        /// Project slug.
        slug: String,
    },

    /// Start the webhook receiver.
    ///
    /// Verifies `X-Hub-Signature` against the configured shared secret
    /// and dispatches deliveries through the handler registry.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            println!("database initialized at {}", config.db.path.display());
        }

        Commands::Add {
            slug,
            git_url,
            name,
            private,
            owner,
            repo,
            installation_id,
            bug_labels,
        } => {
            let pool = repo_pulse::db::connect(&config).await?;

            let mut provider_refs = serde_json::Map::new();
            if let Some(owner) = owner {
                provider_refs.insert("owner".to_string(), owner.into());
            }
            if let Some(repo) = repo {
                provider_refs.insert("repo".to_string(), repo.into());
            }
            if let Some(id) = installation_id {
                provider_refs.insert("installation_id".to_string(), id.into());
            }
            if !bug_labels.is_empty() {
                provider_refs.insert("bug_labels".to_string(), bug_labels.into());
            }

            let project = Project {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.unwrap_or_else(|| slug.clone()),
                slug: slug.clone(),
                git_url,
                default_branch: None,
                private,
                active: true,
                status: ProjectStatus::Ready,
                last_update: None,
                provider_refs: serde_json::Value::Object(provider_refs),
            };
            store::create_project(&pool, &project).await?;
            pool.close().await;
            println!("project '{}' registered", slug);
        }

        Commands::Ingest { slug } => {
            let pool = repo_pulse::db::connect(&config).await?;
            let project = require_project(&pool, &slug).await?;

            if !pipeline::queue(&pool, &project).await? {
                bail!("project '{}' is already queued or updating", slug);
            }
            let report = pipeline::ingest(&pool, &config, &project).await?;
            print_report(&slug, &report)?;
            pool.close().await;
        }

        Commands::Update { slug, all } => {
            let pool = repo_pulse::db::connect(&config).await?;

            if all {
                let projects = store::list_active_projects(&pool).await?;
                for project in projects {
                    if !pipeline::queue(&pool, &project).await? {
                        log::warn!("skipping '{}': already queued or updating", project.slug);
                        continue;
                    }
                    match pipeline::update(&pool, &config, &project).await {
                        Ok(report) => {
                            if report.success() {
                                println!("{}: ok", project.slug);
                            } else {
                                println!(
                                    "{}: {} stages failed",
                                    project.slug,
                                    report.failed.len() + report.skipped.len()
                                );
                            }
                        }
                        Err(err) => log::error!("update of '{}' failed: {:#}", project.slug, err),
                    }
                }
            } else {
                let slug = slug.context("provide a project slug or --all")?;
                let project = require_project(&pool, &slug).await?;
                if !pipeline::queue(&pool, &project).await? {
                    bail!("project '{}' is already queued or updating", slug);
                }
                let report = pipeline::update(&pool, &config, &project).await?;
                print_report(&slug, &report)?;
            }

            pool.close().await;
        }

        Commands::Metrics { slug, days } => {
            let pool = repo_pulse::db::connect(&config).await?;
            let project = require_project(&pool, &slug).await?;

            let to = chrono::Utc::now().date_naive();
            let from = to - chrono::Duration::days(days);
            let series = metrics::metrics_series(&pool, &project.id, from, to).await?;

            if series.is_empty() {
                println!("no metrics for '{}' in the last {} days", slug, days);
            } else {
                println!(
                    "{:<12} {:>10} {:>8} {:>7} {:>9} {:>7} {:>10}",
                    "DATE", "COMPLEXITY", "COMMITS", "OPEN", "ISSUE AGE", "MERGED", "PR AGE (h)"
                );
                for point in &series {
                    println!(
                        "{:<12} {:>10} {:>8} {:>7} {:>9.1} {:>7} {:>10.1}",
                        point.date,
                        point.payload.complexity.unwrap_or(0),
                        point.payload.change_frequency.unwrap_or(0),
                        point.payload.issues_open.unwrap_or(0),
                        point.payload.issue_age.unwrap_or(0.0),
                        point.payload.pulls_merged.unwrap_or(0),
                        point.payload.pulls_average_age_hours(),
                    );
                }
            }
            pool.close().await;
        }

        Commands::Stats => {
            stats::run_stats(&config).await?;
        }

        Commands::Purge { slug } => {
            let pool = repo_pulse::db::connect(&config).await?;
            let project = require_project(&pool, &slug).await?;
            store::purge_project_data(&pool, &project.id).await?;
            pool.close().await;
            println!("derived data for '{}' purged", slug);
        }

        Commands::Serve => {
            migrate::run_migrations(&config).await?;
            webhook::run_server(&config).await?;
        }
    }

    Ok(())
}

async fn require_project(pool: &sqlx::SqlitePool, slug: &str) -> Result<Project> {
    store::get_project_by_slug(pool, slug)
        .await?
        .with_context(|| format!("project '{}' not found — register it with `pulse add`", slug))
}

fn print_report(slug: &str, report: &pipeline::GraphReport) -> Result<()> {
    println!("ingest {}", slug);
    println!("  stages completed: {}", report.done.len());
    if !report.failed.is_empty() {
        for (name, err) in &report.failed {
            println!("  FAILED {}: {}", name, err);
        }
    }
    if !report.skipped.is_empty() {
        println!("  skipped: {}", report.skipped.join(", "));
    }

    if report.success() {
        println!("ok");
        Ok(())
    } else {
        bail!("pipeline for '{}' did not complete", slug)
    }
}
