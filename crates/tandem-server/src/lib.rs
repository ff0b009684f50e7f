use std::sync::Arc;

use serde_json::json;
use tandem_core::{ConfigStore, EngineConfig, EventBus, LauncherConfig, StateStore};
use tandem_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tracing::Level;

mod dispatch;
mod http;
pub mod launcher;
pub mod missions;
pub mod routines;
pub mod schedule;

pub use dispatch::{CommandDispatcher, DEFAULT_MISSION_ENTRYPOINT};
pub use http::{app_router, serve};
pub use tandem_core::now_ms;

use launcher::{HttpRunLauncher, RecordingRunLauncher, RunLauncher};
use missions::MissionService;
use routines::RoutineScheduler;

pub fn build_id() -> String {
    if let Some(explicit) = option_env!("TANDEM_BUILD_ID") {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    if let Some(git_sha) = option_env!("VERGEN_GIT_SHA") {
        let trimmed = git_sha.trim();
        if !trimmed.is_empty() {
            return format!("{}+{}", env!("CARGO_PKG_VERSION"), trimmed);
        }
    }
    env!("CARGO_PKG_VERSION").to_string()
}

/// Scheduler identity written into leases. Unique per process start.
pub fn default_worker_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("engine-{}-{}", std::process::id(), &suffix[..8])
}

/// Picks the run launcher for this process. `dry` forces the in-memory
/// launcher so nothing leaves the engine.
pub fn build_launcher(config: &LauncherConfig, dry: bool) -> anyhow::Result<Arc<dyn RunLauncher>> {
    if dry {
        tracing::warn!("dry launcher enabled: runs are recorded, not executed");
        return Ok(Arc::new(RecordingRunLauncher::new()));
    }
    let Some(base_url) = config.base_url.as_deref() else {
        anyhow::bail!(
            "no run api configured; set launcher.base_url or TANDEM_RUN_API_URL, or pass --dry-launcher"
        );
    };
    let launcher = HttpRunLauncher::new(base_url, config.timeout_ms)?;
    Ok(Arc::new(launcher))
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub config: ConfigStore,
    pub engine_config: Arc<EngineConfig>,
    pub event_bus: EventBus,
    pub missions: MissionService,
    pub dispatcher: CommandDispatcher,
    pub scheduler: RoutineScheduler,
    pub launcher: Arc<dyn RunLauncher>,
    pub started_at_ms: u64,
}

impl AppState {
    pub async fn new(
        config: ConfigStore,
        store: Arc<dyn StateStore>,
        launcher: Arc<dyn RunLauncher>,
        worker_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let engine_config = config.get().await?;
        let event_bus = EventBus::new();
        let missions = MissionService::new(store.clone(), event_bus.clone());
        let dispatcher = CommandDispatcher::new(
            missions.clone(),
            launcher.clone(),
            event_bus.clone(),
            engine_config.dispatch.clone(),
        );
        let scheduler = RoutineScheduler::new(
            store.clone(),
            launcher.clone(),
            event_bus.clone(),
            worker_id,
            engine_config.scheduler.clone(),
            engine_config.entrypoints.clone(),
        );
        Ok(Self {
            store,
            config,
            engine_config: Arc::new(engine_config),
            event_bus,
            missions,
            dispatcher,
            scheduler,
            launcher,
            started_at_ms: now_ms(),
        })
    }
}

/// Background scheduler pass every `scheduler.poll_interval_ms`. Safe to run
/// in any number of processes against one state dir.
pub async fn run_routine_scheduler(scheduler: RoutineScheduler) {
    let interval = scheduler.poll_interval();
    emit_event(
        Level::INFO,
        ProcessKind::Scheduler,
        ObservabilityEvent::new("scheduler.started", "scheduler").status("running"),
    );
    loop {
        tokio::time::sleep(interval).await;
        match scheduler.tick(now_ms()).await {
            Ok(report) if !report.runs.is_empty() || !report.failures.is_empty() => {
                tracing::info!(
                    worker_id = scheduler.worker_id(),
                    report = %json!(report),
                    "scheduler pass"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(worker_id = scheduler.worker_id(), "scheduler pass failed: {err}"),
        }
    }
}
