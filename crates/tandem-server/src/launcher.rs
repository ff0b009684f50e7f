use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Idempotency key; relaunching the same key must not start a second run.
    pub run_key: String,
    pub entrypoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_skill: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchReceipt {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("run api unreachable: {0}")]
    Transport(String),
    #[error("run api rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("run api returned an unusable response: {0}")]
    InvalidResponse(String),
    #[error("no run api configured")]
    NotConfigured,
}

impl LaunchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LaunchError::Transport(_) => true,
            LaunchError::Rejected { status, .. } => *status >= 500 || *status == 429,
            LaunchError::InvalidResponse(_) | LaunchError::NotConfigured => false,
        }
    }
}

/// Boundary to the agent runtime that actually executes runs.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchReceipt, LaunchError>;

    /// Lifts the dry-run hold on a run that was waiting for approval.
    async fn approve(&self, run_id: &str) -> Result<(), LaunchError>;

    async fn cancel(&self, run_id: &str, reason: &str) -> Result<(), LaunchError>;
}

/// Retries retryable failures with exponential backoff. Gives up early when
/// the next attempt could not start before `deadline`.
pub async fn launch_with_retry(
    launcher: &dyn RunLauncher,
    request: &LaunchRequest,
    max_attempts: u32,
    backoff_ms: u64,
    deadline: Option<Instant>,
) -> Result<LaunchReceipt, LaunchError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match launcher.launch(request).await {
            Ok(receipt) => return Ok(receipt),
            Err(error) if !error.is_retryable() || attempt >= max_attempts => return Err(error),
            Err(error) => {
                let delay = Duration::from_millis(
                    backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16)),
                );
                if deadline.is_some_and(|deadline| Instant::now() + delay >= deadline) {
                    tracing::warn!(
                        run_key = %request.run_key,
                        attempt,
                        "launch retry window exhausted: {error}"
                    );
                    return Err(error);
                }
                tracing::debug!(
                    run_key = %request.run_key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "launch failed, retrying: {error}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

pub struct HttpRunLauncher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRunLauncher {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self, LaunchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()
            .map_err(|err| LaunchError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, path: &str, body: &Value) -> Result<String, LaunchError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|err| LaunchError::Transport(err.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LaunchError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl RunLauncher for HttpRunLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchReceipt, LaunchError> {
        let body = serde_json::to_value(request)
            .map_err(|err| LaunchError::InvalidResponse(err.to_string()))?;
        let text = self.post("/run", &body).await?;
        let payload: Value = serde_json::from_str(&text)
            .map_err(|err| LaunchError::InvalidResponse(format!("{err}: {text}")))?;
        let field = |camel: &str, snake: &str| {
            payload
                .get(camel)
                .or_else(|| payload.get(snake))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        };
        let run_id = field("runID", "run_id")
            .ok_or_else(|| LaunchError::InvalidResponse(format!("missing run id: {text}")))?;
        Ok(LaunchReceipt {
            run_id,
            session_id: field("sessionID", "session_id"),
        })
    }

    async fn approve(&self, run_id: &str) -> Result<(), LaunchError> {
        self.post(&format!("/run/{run_id}/approve"), &json!({}))
            .await
            .map(|_| ())
    }

    async fn cancel(&self, run_id: &str, reason: &str) -> Result<(), LaunchError> {
        self.post(&format!("/run/{run_id}/cancel"), &json!({ "reason": reason }))
            .await
            .map(|_| ())
    }
}

/// In-process launcher that records requests. Backs `--dry-launcher` and
/// tests; failures can be injected.
#[derive(Default)]
pub struct RecordingRunLauncher {
    launches: Mutex<Vec<LaunchRequest>>,
    approvals: Mutex<Vec<String>>,
    cancellations: Mutex<Vec<(String, String)>>,
    pending_failures: AtomicU32,
    fail_all: AtomicBool,
}

impl RecordingRunLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_all(&self, enabled: bool) {
        self.fail_all.store(enabled, Ordering::SeqCst);
    }

    pub async fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().await.clone()
    }

    pub async fn approvals(&self) -> Vec<String> {
        self.approvals.lock().await.clone()
    }

    pub async fn cancellations(&self) -> Vec<(String, String)> {
        self.cancellations.lock().await.clone()
    }

    fn injected_failure(&self) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn receipt_for(run_key: &str) -> LaunchReceipt {
        LaunchReceipt {
            run_id: format!("run-{run_key}"),
            session_id: None,
        }
    }
}

#[async_trait]
impl RunLauncher for RecordingRunLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchReceipt, LaunchError> {
        if self.injected_failure() {
            return Err(LaunchError::Rejected {
                status: 503,
                body: "injected failure".to_string(),
            });
        }
        let mut launches = self.launches.lock().await;
        if !launches.iter().any(|known| known.run_key == request.run_key) {
            launches.push(request.clone());
        }
        Ok(Self::receipt_for(&request.run_key))
    }

    async fn approve(&self, run_id: &str) -> Result<(), LaunchError> {
        self.approvals.lock().await.push(run_id.to_string());
        Ok(())
    }

    async fn cancel(&self, run_id: &str, reason: &str) -> Result<(), LaunchError> {
        self.cancellations
            .lock()
            .await
            .push((run_id.to_string(), reason.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    fn request(run_key: &str) -> LaunchRequest {
        LaunchRequest {
            run_key: run_key.to_string(),
            entrypoint: "mission.default".to_string(),
            prompt: None,
            args: json!({"topic": "weekly report"}),
            capabilities: vec!["fs.read".to_string()],
            dry_run: true,
            agent_skill: None,
            metadata: json!({}),
        }
    }

    async fn spawn_stub() -> String {
        let app = Router::new()
            .route(
                "/run",
                post(|Json(input): Json<LaunchRequest>| async move {
                    if input.entrypoint == "broken" {
                        return (StatusCode::BAD_GATEWAY, Json(json!({"error": "down"})));
                    }
                    (
                        StatusCode::OK,
                        Json(json!({
                            "runID": format!("run-{}", input.run_key),
                            "sessionID": "session-1",
                        })),
                    )
                }),
            )
            .route(
                "/run/{id}/cancel",
                post(|Path(id): Path<String>| async move { Json(json!({"cancelled": id})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn http_launcher_posts_requests_and_parses_receipts() {
        let base = spawn_stub().await;
        let launcher = HttpRunLauncher::new(base, 2_000).expect("launcher");
        assert!(!launcher.base_url().ends_with('/'));

        let receipt = launcher.launch(&request("rr-daily-60000")).await.expect("launch");
        assert_eq!(receipt.run_id, "run-rr-daily-60000");
        assert_eq!(receipt.session_id.as_deref(), Some("session-1"));
        launcher
            .cancel("run-rr-daily-60000", "mission cancelled")
            .await
            .expect("cancel");

        let mut broken = request("rr-broken-1");
        broken.entrypoint = "broken".to_string();
        let err = launcher.launch(&broken).await.expect_err("rejected");
        assert!(matches!(err, LaunchError::Rejected { status: 502, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let launcher = RecordingRunLauncher::new();
        launcher.fail_next(2);
        let receipt = launch_with_retry(&launcher, &request("k-1"), 3, 1, None)
            .await
            .expect("third attempt succeeds");
        assert_eq!(receipt.run_id, "run-k-1");
        assert_eq!(launcher.launches().await.len(), 1);
    }

    #[tokio::test]
    async fn retry_backoff_doubles_each_attempt() {
        let launcher = RecordingRunLauncher::new();
        launcher.fail_next(3);
        let started = Instant::now();
        launch_with_retry(&launcher, &request("k-3"), 4, 20, None)
            .await
            .expect("fourth attempt succeeds");
        // 20 + 40 + 80
        assert!(started.elapsed() >= Duration::from_millis(140));
    }

    #[tokio::test]
    async fn retry_stops_at_deadline() {
        let launcher = RecordingRunLauncher::new();
        launcher.set_fail_all(true);
        let deadline = Instant::now() + Duration::from_millis(20);
        let started = Instant::now();
        let err = launch_with_retry(&launcher, &request("k-2"), 10, 50, Some(deadline))
            .await
            .expect_err("deadline");
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(launcher.launches().await.is_empty());
    }

    #[tokio::test]
    async fn recording_launcher_is_idempotent_per_run_key() {
        let launcher = RecordingRunLauncher::new();
        let first = launcher.launch(&request("m-1:w-1:1")).await.expect("launch");
        let second = launcher.launch(&request("m-1:w-1:1")).await.expect("launch");
        assert_eq!(first, second);
        assert_eq!(launcher.launches().await.len(), 1);
    }
}
