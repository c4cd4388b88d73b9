use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub repos: ReposConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub tree: TreeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReposConfig {
    /// Base directory for persistent clones, one subdirectory per project.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Base for disposable working copies. Defaults to a memory-backed
    /// tmpfs when one is present.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

impl Default for ReposConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/repos")
}

fn default_scratch_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        shm
    } else {
        std::env::temp_dir()
    }
}

/// Code-hosting provider credentials. All optional: public repositories can
/// be ingested from git alone, without issue/PR/release data.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub app_id: Option<String>,
    /// RSA private key, PEM-encoded.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_token_url() -> String {
    "https://github.com/login/oauth/access_token".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Seconds after enqueue a task is considered abandoned.
    #[serde(default = "default_task_expiration_secs")]
    pub task_expiration_secs: u64,
    /// Commits per history sub-task.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Parallel workers draining the task queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            task_expiration_secs: default_task_expiration_secs(),
            chunk_size: default_chunk_size(),
            workers: default_workers(),
        }
    }
}

fn default_task_expiration_secs() -> u64 {
    3600
}
fn default_chunk_size() -> usize {
    500
}
fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TreeConfig {
    /// Extra exclude globs for the source-tree walk, on top of the
    /// built-in `.git` and `package-lock.json` exclusions.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl ProviderConfig {
    pub fn has_app_credentials(&self) -> bool {
        self.app_id.is_some() && self.private_key.is_some()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config);

    if config.pipeline.chunk_size == 0 {
        anyhow::bail!("pipeline.chunk_size must be > 0");
    }
    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be > 0");
    }
    if config.pipeline.task_expiration_secs == 0 {
        anyhow::bail!("pipeline.task_expiration_secs must be > 0");
    }

    Ok(config)
}

/// Environment variables override file values so deployments can keep
/// secrets out of the config file.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(dir) = std::env::var("REPO_CACHE_DIR") {
        config.repos.cache_dir = PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("SCRATCH_DIR") {
        config.repos.scratch_dir = PathBuf::from(dir);
    }
    if let Ok(v) = std::env::var("PROVIDER_APP_ID") {
        config.provider.app_id = Some(v);
    }
    if let Ok(v) = std::env::var("PROVIDER_PRIVATE_KEY") {
        config.provider.private_key = Some(v);
    }
    if let Ok(v) = std::env::var("PROVIDER_CLIENT_ID") {
        config.provider.client_id = Some(v);
    }
    if let Ok(v) = std::env::var("PROVIDER_CLIENT_SECRET") {
        config.provider.client_secret = Some(v);
    }
    if let Ok(v) = std::env::var("PROVIDER_WEBHOOK_SECRET") {
        config.provider.webhook_secret = Some(v);
    }
    if let Ok(v) = std::env::var("TASK_EXPIRATION") {
        if let Ok(secs) = v.parse() {
            config.pipeline.task_expiration_secs = secs;
        }
    }
    if let Ok(v) = std::env::var("CHUNK_SIZE") {
        if let Ok(n) = v.parse() {
            config.pipeline.chunk_size = n;
        }
    }
}
