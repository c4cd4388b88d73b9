//! Pipeline orchestration.
//!
//! The ingest and update pipelines are expressed as a declarative task
//! graph: nodes are typed tasks, edges are happens-before constraints. The
//! executor submits a node as soon as all of its predecessors completed,
//! bounded by the configured worker count. A failed node aborts its
//! dependents but lets parallel siblings finish — partial progress is
//! durable because every write downstream is an idempotent upsert.
//!
//! Tasks carry an expiration from enqueue time; a task that becomes ready
//! after its deadline is skipped so abandoned pipelines cannot pile up.

use anyhow::{bail, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::history::{self, CommitDescriptor};
use crate::issues;
use crate::metrics;
use crate::models::{Project, ProjectStatus};
use crate::provider::{ProviderClient, ProviderError};
use crate::repo;
use crate::store;
use crate::tree;

// ---------------- task graph ----------------

/// One node of a task graph.
#[derive(Debug)]
pub struct TaskNode<K> {
    pub name: String,
    pub kind: K,
    pub deps: Vec<usize>,
    enqueued_at: Instant,
}

/// A declarative DAG of tasks. Nodes are added with explicit
/// happens-before edges; cycles are a construction bug and make the
/// executor bail.
#[derive(Debug, Default)]
pub struct TaskGraph<K> {
    nodes: Vec<TaskNode<K>>,
}

impl<K> TaskGraph<K> {
    pub fn new() -> Self {
        TaskGraph { nodes: Vec::new() }
    }

    pub fn add(&mut self, name: impl Into<String>, kind: K, deps: Vec<usize>) -> usize {
        let id = self.nodes.len();
        self.nodes.push(TaskNode {
            name: name.into(),
            kind,
            deps,
            enqueued_at: Instant::now(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

/// Outcome of a graph run.
#[derive(Debug, Default)]
pub struct GraphReport {
    pub done: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

impl GraphReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Execute a task graph on a bounded worker pool.
///
/// `runner` executes one node to completion; it is invoked for a node only
/// once every predecessor finished successfully. Nodes whose predecessors
/// failed or expired are skipped, as are nodes that pass their TTL while
/// waiting.
pub async fn run_graph<K, F, Fut>(
    graph: TaskGraph<K>,
    workers: usize,
    ttl: Duration,
    runner: F,
) -> Result<GraphReport>
where
    K: Clone + Send + 'static,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut states = vec![NodeState::Pending; graph.nodes.len()];
    let mut report = GraphReport::default();
    let mut pool: JoinSet<(usize, Result<()>)> = JoinSet::new();
    let mut running = 0usize;

    loop {
        // Alternate between failure propagation and submission until the
        // graph settles: a pending node with a failed or skipped
        // predecessor can never run, and skipping it may unblock further
        // propagation.
        loop {
            let mut changed = false;

            for id in 0..graph.nodes.len() {
                if states[id] != NodeState::Pending {
                    continue;
                }
                let blocked = graph.nodes[id]
                    .deps
                    .iter()
                    .any(|&d| matches!(states[d], NodeState::Failed | NodeState::Skipped));
                if blocked {
                    states[id] = NodeState::Skipped;
                    report.skipped.push(graph.nodes[id].name.clone());
                    changed = true;
                }
            }

            // Submit ready nodes up to the worker bound.
            for id in 0..graph.nodes.len() {
                if running >= workers {
                    break;
                }
                if states[id] != NodeState::Pending {
                    continue;
                }
                let ready = graph.nodes[id]
                    .deps
                    .iter()
                    .all(|&d| states[d] == NodeState::Done);
                if !ready {
                    continue;
                }

                if graph.nodes[id].enqueued_at.elapsed() > ttl {
                    log::warn!("task {} expired before it could run", graph.nodes[id].name);
                    states[id] = NodeState::Skipped;
                    report.skipped.push(graph.nodes[id].name.clone());
                    changed = true;
                    continue;
                }

                states[id] = NodeState::Running;
                running += 1;
                changed = true;
                let fut = runner(graph.nodes[id].kind.clone());
                pool.spawn(async move { (id, fut.await) });
            }

            if !changed {
                break;
            }
        }

        if running == 0 {
            break;
        }

        match pool.join_next().await {
            Some(Ok((id, result))) => {
                running -= 1;
                match result {
                    Ok(()) => {
                        states[id] = NodeState::Done;
                        report.done.push(graph.nodes[id].name.clone());
                    }
                    Err(err) => {
                        log::error!("task {} failed: {:#}", graph.nodes[id].name, err);
                        states[id] = NodeState::Failed;
                        report.failed.push((graph.nodes[id].name.clone(), format!("{:#}", err)));
                    }
                }
            }
            Some(Err(join_err)) => bail!("worker panicked: {}", join_err),
            None => break,
        }
    }

    // Anything still pending means the graph has a cycle.
    if states.iter().any(|s| *s == NodeState::Pending) {
        bail!("task graph contains a cycle");
    }

    Ok(report)
}

// ---------------- project pipelines ----------------

/// Typed pipeline tasks. The commit fan-out is sized at runtime from the
/// listed history.
#[derive(Debug, Clone)]
enum Task {
    CommitChunk(usize),
    Issues,
    Pulls,
    Releases,
    Tags,
    AggregateIssues,
    AggregatePulls,
    AggregateComplexity,
    BuildTree,
}

struct PipelineCtx {
    pool: SqlitePool,
    config: Config,
    project: Project,
    repo_dir: std::path::PathBuf,
    chunks: Vec<Vec<CommitDescriptor>>,
    start_date: Option<NaiveDate>,
    permanent_failure: AtomicBool,
}

impl PipelineCtx {
    /// Provider client for one task. Installation-authenticated when the
    /// project has an installation and app credentials exist; anonymous
    /// otherwise (public API limits apply).
    async fn provider_client(&self) -> Result<ProviderClient> {
        match self.project.installation_id() {
            Some(id) if self.config.provider.has_app_credentials() => {
                ProviderClient::for_installation(&self.config.provider, id).await
            }
            _ => Ok(ProviderClient::anonymous(&self.config.provider)),
        }
    }

    fn issues_since(&self) -> Option<chrono::DateTime<Utc>> {
        self.start_date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
    }
}

async fn run_task(ctx: Arc<PipelineCtx>, task: Task) -> Result<()> {
    let result = match &task {
        Task::CommitChunk(index) => {
            history::ingest_commits(&ctx.pool, &ctx.project.id, &ctx.repo_dir, &ctx.chunks[*index])
                .await
                .map(|_| ())
        }
        Task::Issues => {
            let client = ctx.provider_client().await?;
            issues::import_issues(&ctx.pool, &ctx.project, &client, ctx.issues_since())
                .await
                .map(|_| ())
        }
        Task::Pulls => {
            let client = ctx.provider_client().await?;
            issues::import_pull_requests(&ctx.pool, &ctx.project, &client)
                .await
                .map(|_| ())
        }
        Task::Releases => {
            let client = ctx.provider_client().await?;
            issues::import_releases(&ctx.pool, &ctx.project, &client)
                .await
                .map(|_| ())
        }
        Task::Tags => history::import_tags(&ctx.pool, &ctx.project, &ctx.repo_dir)
            .await
            .map(|_| ()),
        Task::AggregateIssues => metrics::aggregate_issues(&ctx.pool, &ctx.project).await,
        Task::AggregatePulls => metrics::aggregate_pulls(&ctx.pool, &ctx.project).await,
        Task::AggregateComplexity => {
            metrics::aggregate_complexity(&ctx.pool, &ctx.project, ctx.start_date).await
        }
        Task::BuildTree => tree::build_snapshot(&ctx.pool, &ctx.config, &ctx.project)
            .await
            .map(|_| ()),
    };

    if let Err(err) = &result {
        if err.downcast_ref::<ProviderError>().is_some() {
            ctx.permanent_failure.store(true, Ordering::SeqCst);
        }
    }

    result
}

/// Mark a project queued for ingestion. Returns false when the project is
/// already queued or updating — at most one pipeline instance runs per
/// project.
pub async fn queue(pool: &SqlitePool, project: &Project) -> Result<bool> {
    store::transition_status(pool, &project.id, ProjectStatus::Ready, ProjectStatus::Queued).await
}

/// Full-history ingest pipeline.
pub async fn ingest(pool: &SqlitePool, config: &Config, project: &Project) -> Result<GraphReport> {
    run_pipeline(pool, config, project, None).await
}

/// Incremental update pipeline: start at the beginning of the day 24 hours
/// ago, so a daily schedule overlaps the previous run by design.
pub async fn update(pool: &SqlitePool, config: &Config, project: &Project) -> Result<GraphReport> {
    let start = (Utc::now() - ChronoDuration::hours(24)).date_naive();
    run_pipeline(pool, config, project, Some(start)).await
}

async fn run_pipeline(
    pool: &SqlitePool,
    config: &Config,
    project: &Project,
    start_date: Option<NaiveDate>,
) -> Result<GraphReport> {
    let started = store::transition_status(
        pool,
        &project.id,
        ProjectStatus::Queued,
        ProjectStatus::Updating,
    )
    .await?;
    if !started {
        bail!(
            "project '{}' is not queued; another pipeline instance owns it",
            project.slug
        );
    }

    match run_pipeline_inner(pool, config, project, start_date).await {
        Ok(report) if report.success() => {
            store::set_last_update(pool, &project.id, Utc::now()).await?;
            store::set_status(pool, &project.id, ProjectStatus::Ready).await?;
            log::info!("Project({}): pipeline finished.", project.slug);
            Ok(report)
        }
        Ok(report) => {
            // failed stages: back to READY with last_update unchanged
            store::set_status(pool, &project.id, ProjectStatus::Ready).await?;
            log::error!(
                "Project({}): pipeline failed ({} failed, {} skipped).",
                project.slug,
                report.failed.len(),
                report.skipped.len()
            );
            Ok(report)
        }
        Err(err) => {
            store::set_status(pool, &project.id, ProjectStatus::Ready).await?;
            Err(err)
        }
    }
}

async fn run_pipeline_inner(
    pool: &SqlitePool,
    config: &Config,
    project: &Project,
    start_date: Option<NaiveDate>,
) -> Result<GraphReport> {
    log::info!(
        "Project({}): Starting pipeline ({:?}).",
        project.slug,
        start_date
    );

    // Clone-or-pull is serialized per project by the status machine, so it
    // runs before the graph rather than inside it.
    let access_token = if project.private && config.provider.has_app_credentials() {
        match project.installation_id() {
            Some(id) => {
                let client = ProviderClient::for_installation(&config.provider, id).await?;
                client.installation_token().map(|t| t.to_string())
            }
            None => None,
        }
    } else {
        None
    };

    let (repo_dir, branch) = repo::ensure_local(config, project, access_token.as_deref())?;
    store::set_default_branch(pool, &project.id, &branch).await?;

    let effective_start = history::resolve_start_date(&repo_dir, start_date)?;
    let commits = match effective_start {
        Some(start) => history::list_commits(&repo_dir, start)?,
        None => Vec::new(),
    };
    let chunks = history::commit_chunks(commits, config.pipeline.chunk_size);

    let mut project = project.clone();
    project.default_branch = Some(branch);

    let ctx = Arc::new(PipelineCtx {
        pool: pool.clone(),
        config: config.clone(),
        project,
        repo_dir,
        chunks,
        start_date,
        permanent_failure: AtomicBool::new(false),
    });

    let mut graph: TaskGraph<Task> = TaskGraph::new();

    // first fan-out: history chunks and provider imports
    let mut first_group = Vec::new();
    for index in 0..ctx.chunks.len() {
        first_group.push(graph.add(
            format!("commits[{}]", index),
            Task::CommitChunk(index),
            vec![],
        ));
    }
    let issues_node = graph.add("issues", Task::Issues, vec![]);
    let pulls_node = graph.add("pulls", Task::Pulls, vec![]);
    first_group.push(graph.add("releases", Task::Releases, vec![]));
    first_group.push(graph.add("tags", Task::Tags, vec![]));

    // metric joins chained behind their imports
    first_group.push(graph.add(
        "aggregate_issues",
        Task::AggregateIssues,
        vec![issues_node],
    ));
    first_group.push(graph.add("aggregate_pulls", Task::AggregatePulls, vec![pulls_node]));
    first_group.push(issues_node);
    first_group.push(pulls_node);

    // second fan-out after the join
    graph.add(
        "aggregate_complexity",
        Task::AggregateComplexity,
        first_group.clone(),
    );
    graph.add("build_tree", Task::BuildTree, first_group);

    let ttl = Duration::from_secs(config.pipeline.task_expiration_secs);
    let workers = config.pipeline.workers;

    let runner_ctx = ctx.clone();
    let report = run_graph(graph, workers, ttl, move |task| {
        run_task(runner_ctx.clone(), task)
    })
    .await?;

    if ctx.permanent_failure.load(Ordering::SeqCst) {
        log::error!(
            "Project({}): permanent provider failure, marking project inactive.",
            ctx.project.slug
        );
        store::set_active(pool, &ctx.project.id, false).await?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) {
        log.lock().unwrap().push(name);
    }

    #[tokio::test]
    async fn chain_runs_in_dependency_order() {
        let mut graph: TaskGraph<&'static str> = TaskGraph::new();
        let a = graph.add("a", "a", vec![]);
        let b = graph.add("b", "b", vec![a]);
        graph.add("c", "c", vec![b]);

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_ref = order.clone();

        let report = run_graph(graph, 4, Duration::from_secs(60), move |kind| {
            let order = order_ref.clone();
            async move {
                record(&order, kind);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(report.success());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn fan_in_waits_for_all_siblings() {
        let mut graph: TaskGraph<&'static str> = TaskGraph::new();
        let s1 = graph.add("s1", "s1", vec![]);
        let s2 = graph.add("s2", "s2", vec![]);
        let s3 = graph.add("s3", "s3", vec![]);
        graph.add("join", "join", vec![s1, s2, s3]);

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_ref = order.clone();

        let report = run_graph(graph, 4, Duration::from_secs(60), move |kind| {
            let order = order_ref.clone();
            async move {
                record(&order, kind);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(report.success());
        let order = order.lock().unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(*order.last().unwrap(), "join");
    }

    #[tokio::test]
    async fn failure_skips_dependents_but_not_siblings() {
        let mut graph: TaskGraph<&'static str> = TaskGraph::new();
        let bad = graph.add("bad", "bad", vec![]);
        graph.add("sibling", "sibling", vec![]);
        graph.add("dependent", "dependent", vec![bad]);

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_ref = order.clone();

        let report = run_graph(graph, 4, Duration::from_secs(60), move |kind| {
            let order = order_ref.clone();
            async move {
                if kind == "bad" {
                    bail!("boom");
                }
                record(&order, kind);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(!report.success());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert_eq!(report.skipped, vec!["dependent"]);
        assert_eq!(*order.lock().unwrap(), vec!["sibling"]);
    }

    #[tokio::test]
    async fn expired_tasks_are_skipped() {
        let mut graph: TaskGraph<&'static str> = TaskGraph::new();
        graph.add("late", "late", vec![]);

        let report = run_graph(graph, 1, Duration::ZERO, move |_kind| async move {
            panic!("expired task must not run");
            #[allow(unreachable_code)]
            Ok(())
        })
        .await
        .unwrap();

        assert!(!report.success());
        assert_eq!(report.skipped, vec!["late"]);
    }

    #[tokio::test]
    async fn worker_bound_is_respected() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut graph: TaskGraph<usize> = TaskGraph::new();
        for i in 0..6 {
            graph.add(format!("t{}", i), i, vec![]);
        }

        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let live_ref = live.clone();
        let peak_ref = peak.clone();

        let report = run_graph(graph, 2, Duration::from_secs(60), move |_| {
            let live = live_ref.clone();
            let peak = peak_ref.clone();
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(report.success());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
