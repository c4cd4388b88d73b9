//! Provider webhook receiver.
//!
//! Incoming hooks are verified against the shared secret (HMAC-SHA1,
//! constant-time compare) and dispatched through an explicit registry
//! keyed by `(event, action)`, populated at startup. Unknown keys produce
//! a typed unhandled outcome rather than an error — providers add events
//! faster than we care about them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::issues::{issue_from_json, release_from_json};
use crate::store;

type HmacSha1 = Hmac<Sha1>;

/// Verify an `X-Hub-Signature` header (`sha1=<hex>`) against the request
/// body. The comparison runs in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha1=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = match HmacSha1::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature header value for a body; the test-side twin of
/// [`verify_signature`].
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Outcome of dispatching one hook delivery.
#[derive(Debug, PartialEq)]
pub enum HookOutcome {
    Handled(String),
    Unhandled { event: String, action: String },
}

/// Shared state handed to hook handlers.
#[derive(Clone)]
pub struct HookContext {
    pub pool: SqlitePool,
}

/// One webhook handler, keyed by the provider's event and action strings.
#[async_trait]
pub trait HookHandler: Send + Sync {
    fn event(&self) -> &str;
    fn action(&self) -> &str;
    async fn handle(&self, ctx: &HookContext, payload: &serde_json::Value) -> Result<String>;
}

/// Explicit mapping from `(event, action)` to a handler, populated at
/// program start.
#[derive(Default)]
pub struct HookRegistry {
    handlers: HashMap<(String, String), Box<dyn HookHandler>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers: issue open/close and release
    /// publication feed straight into the entity store.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(IssueHook { action: "opened" }));
        registry.register(Box::new(IssueHook { action: "closed" }));
        registry.register(Box::new(ReleaseHook));
        registry
    }

    pub fn register(&mut self, handler: Box<dyn HookHandler>) {
        let key = (handler.event().to_string(), handler.action().to_string());
        self.handlers.insert(key, handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route one delivery. The action is read from the payload's `action`
    /// field; events without one (e.g. `push`) dispatch with an empty
    /// action.
    pub async fn dispatch(
        &self,
        ctx: &HookContext,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<HookOutcome> {
        let action = payload
            .get("action")
            .and_then(|a| a.as_str())
            .unwrap_or("")
            .to_string();

        match self.handlers.get(&(event.to_string(), action.clone())) {
            Some(handler) => {
                let message = handler.handle(ctx, payload).await?;
                Ok(HookOutcome::Handled(message))
            }
            None => {
                log::warn!("no handler for hook {}/{}", event, action);
                Ok(HookOutcome::Unhandled {
                    event: event.to_string(),
                    action,
                })
            }
        }
    }
}

/// Resolve the project a delivery belongs to from `repository.full_name`.
async fn project_for_payload(
    ctx: &HookContext,
    payload: &serde_json::Value,
) -> Result<Option<crate::models::Project>> {
    let full_name = payload
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(|n| n.as_str())
        .context("hook payload has no repository.full_name")?;

    store::get_project_by_slug(&ctx.pool, &slugify(full_name)).await
}

/// Slug for a provider repository: `Acme/Widget.js` → `acme-widget-js`.
pub fn slugify(full_name: &str) -> String {
    let mut slug = String::with_capacity(full_name.len());
    let mut last_dash = true;
    for c in full_name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

struct IssueHook {
    action: &'static str,
}

#[async_trait]
impl HookHandler for IssueHook {
    fn event(&self) -> &str {
        "issues"
    }

    fn action(&self) -> &str {
        self.action
    }

    async fn handle(&self, ctx: &HookContext, payload: &serde_json::Value) -> Result<String> {
        let Some(project) = project_for_payload(ctx, payload).await? else {
            return Ok("repository is not tracked".to_string());
        };

        let item = payload.get("issue").context("issues hook has no issue")?;
        let bug_labels = project.bug_labels();
        match issue_from_json(&project.id, item, &bug_labels) {
            Some(issue) => {
                store::upsert_issue(&ctx.pool, &issue).await?;
                Ok(format!("issue #{} upserted", issue.issue_refid))
            }
            None => Ok("issue payload not ingestable".to_string()),
        }
    }
}

struct ReleaseHook;

#[async_trait]
impl HookHandler for ReleaseHook {
    fn event(&self) -> &str {
        "release"
    }

    fn action(&self) -> &str {
        "released"
    }

    async fn handle(&self, ctx: &HookContext, payload: &serde_json::Value) -> Result<String> {
        let Some(project) = project_for_payload(ctx, payload).await? else {
            return Ok("repository is not tracked".to_string());
        };

        let item = payload
            .get("release")
            .context("release hook has no release")?;
        match release_from_json(&project.id, item) {
            Some(release) => {
                store::upsert_release(&ctx.pool, &release).await?;
                Ok(format!("release {} upserted", release.name))
            }
            None => Ok("release payload not ingestable".to_string()),
        }
    }
}

// ---------------- HTTP server ----------------

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    registry: Arc<HookRegistry>,
}

/// Start the webhook receiver on the configured bind address.
pub async fn run_server(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        registry: Arc::new(HookRegistry::with_builtins()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/hooks/provider", post(handle_hook))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind = config.server.bind.clone();
    println!("webhook receiver listening on http://{}", bind);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

struct HookError(StatusCode, String);

impl IntoResponse for HookError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({"error": self.1});
        (self.0, Json(body)).into_response()
    }
}

async fn handle_hook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, HookError> {
    let secret = state.config.provider.webhook_secret.as_deref().ok_or_else(|| {
        HookError(
            StatusCode::SERVICE_UNAVAILABLE,
            "webhook secret is not configured".to_string(),
        )
    })?;

    let signature = headers
        .get("X-Hub-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            HookError(
                StatusCode::UNAUTHORIZED,
                "missing X-Hub-Signature".to_string(),
            )
        })?;

    if !verify_signature(secret.as_bytes(), &body, signature) {
        return Err(HookError(
            StatusCode::UNAUTHORIZED,
            "signature mismatch".to_string(),
        ));
    }

    let event = headers
        .get("X-Github-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| HookError(StatusCode::BAD_REQUEST, format!("invalid JSON body: {}", e)))?;

    let ctx = HookContext {
        pool: state.pool.clone(),
    };

    match state.registry.dispatch(&ctx, &event, &payload).await {
        Ok(HookOutcome::Handled(message)) => {
            Ok(Json(serde_json::json!({"handled": true, "message": message})))
        }
        Ok(HookOutcome::Unhandled { event, action }) => Ok(Json(serde_json::json!({
            "handled": false,
            "event": event,
            "action": action,
        }))),
        Err(err) => Err(HookError(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{:#}", err),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let secret = b"shared-secret";
        let body = br#"{"action":"opened"}"#;
        let header = sign_body(secret, body);
        assert!(header.starts_with("sha1="));
        assert!(verify_signature(secret, body, &header));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = b"shared-secret";
        let header = sign_body(secret, b"original");
        assert!(!verify_signature(secret, b"tampered", &header));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let header = sign_body(b"secret-a", b"body");
        assert!(!verify_signature(b"secret-b", b"body", &header));
    }

    #[test]
    fn malformed_header_fails_verification() {
        assert!(!verify_signature(b"secret", b"body", "md5=abcdef"));
        assert!(!verify_signature(b"secret", b"body", "sha1=not-hex"));
        assert!(!verify_signature(b"secret", b"body", ""));
    }

    #[test]
    fn slugify_matches_provider_naming() {
        assert_eq!(slugify("Acme/Widget.js"), "acme-widget-js");
        assert_eq!(slugify("owner/repo"), "owner-repo");
        assert_eq!(slugify("a__b/c"), "a-b-c");
    }

    struct Recorder;

    #[async_trait]
    impl HookHandler for Recorder {
        fn event(&self) -> &str {
            "ping"
        }
        fn action(&self) -> &str {
            "test"
        }
        async fn handle(&self, _ctx: &HookContext, _payload: &serde_json::Value) -> Result<String> {
            Ok("pong".to_string())
        }
    }

    async fn memory_ctx() -> HookContext {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        HookContext { pool }
    }

    #[tokio::test]
    async fn dispatch_routes_by_event_and_action() {
        let mut registry = HookRegistry::new();
        registry.register(Box::new(Recorder));

        let ctx = memory_ctx().await;
        let payload = serde_json::json!({"action": "test"});
        let outcome = registry.dispatch(&ctx, "ping", &payload).await.unwrap();
        assert_eq!(outcome, HookOutcome::Handled("pong".to_string()));
    }

    #[tokio::test]
    async fn unknown_key_is_typed_unhandled() {
        let registry = HookRegistry::with_builtins();
        let ctx = memory_ctx().await;
        let payload = serde_json::json!({"action": "labeled"});
        let outcome = registry.dispatch(&ctx, "issues", &payload).await.unwrap();
        assert_eq!(
            outcome,
            HookOutcome::Unhandled {
                event: "issues".to_string(),
                action: "labeled".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn builtins_cover_issue_lifecycle() {
        let registry = HookRegistry::with_builtins();
        assert_eq!(registry.len(), 3);
    }
}
