use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tandem_core::{DispatchConfig, EventBus};
use tandem_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use tandem_orchestrator::{
    outstanding_gates, ArtifactGate, GateEvaluator, GateOutcome, MissionCommand, MissionEvent,
    MissionState, WorkItemStatus,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::Level;

use crate::launcher::{launch_with_retry, LaunchRequest, RunLauncher};
use crate::missions::MissionService;

pub const DEFAULT_MISSION_ENTRYPOINT: &str = "mission.default";
const FEEDBACK_ATTEMPTS: u32 = 5;

/// Executes reducer commands. Every outcome that matters to the mission
/// comes back as an event through [`MissionService::apply_event`].
#[derive(Clone)]
pub struct CommandDispatcher {
    missions: MissionService,
    launcher: Arc<dyn RunLauncher>,
    event_bus: EventBus,
    config: DispatchConfig,
    permits: Arc<Semaphore>,
    /// Permits of launched runs by run key, held until the item leaves the run.
    active_runs: Arc<Mutex<HashMap<String, ActiveRun>>>,
    gate: Arc<dyn GateEvaluator>,
}

struct ActiveRun {
    mission_id: String,
    work_item_id: String,
    _permit: OwnedSemaphorePermit,
}

fn run_is_live(mission: &MissionState, work_item_id: &str, run_key: &str) -> bool {
    !mission.status.is_terminal()
        && mission.work_item(work_item_id).is_some_and(|item| {
            item.status == WorkItemStatus::InProgress && item.run_key(&mission.mission_id) == run_key
        })
}

impl CommandDispatcher {
    pub fn new(
        missions: MissionService,
        launcher: Arc<dyn RunLauncher>,
        event_bus: EventBus,
        config: DispatchConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            missions,
            launcher,
            event_bus,
            config,
            permits,
            active_runs: Arc::new(Mutex::new(HashMap::new())),
            gate: Arc::new(ArtifactGate::default()),
        }
    }

    pub fn with_gate_evaluator(mut self, gate: Arc<dyn GateEvaluator>) -> Self {
        self.gate = gate;
        self
    }

    pub fn missions(&self) -> &MissionService {
        &self.missions
    }

    /// Number of launched runs still holding a concurrency permit.
    pub fn active_runs(&self) -> usize {
        self.active_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Releases the permits of runs `mission` no longer has in progress, then
    /// runs `commands` in the background.
    pub fn dispatch(&self, mission: &MissionState, commands: Vec<MissionCommand>) {
        self.release_settled(mission);
        if commands.is_empty() {
            return;
        }
        let entrypoint = mission
            .spec
            .entrypoint
            .clone()
            .unwrap_or_else(|| DEFAULT_MISSION_ENTRYPOINT.to_string());
        for command in commands {
            tokio::spawn(self.clone().execute(entrypoint.clone(), command));
        }
    }

    fn execute(self, entrypoint: String, command: MissionCommand) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            match command {
                MissionCommand::StartRun {
                    mission_id,
                    work_item_id,
                    run_key,
                    agent_skill,
                    prompt,
                    capabilities,
                } => {
                    let request = LaunchRequest {
                        run_key,
                        entrypoint,
                        prompt: Some(prompt),
                        args: json!({}),
                        capabilities,
                        dry_run: false,
                        agent_skill,
                        metadata: json!({
                            "missionID": mission_id,
                            "workItemID": work_item_id,
                        }),
                    };
                    self.start_run(mission_id, work_item_id, request).await;
                }
                MissionCommand::RequestApproval {
                    mission_id,
                    work_item_id,
                    kind,
                    summary,
                } => {
                    self.event_bus.emit(
                        "mission.approval_requested",
                        json!({
                            "missionID": mission_id,
                            "workItemID": work_item_id,
                            "kind": kind,
                            "summary": summary,
                        }),
                    );
                }
                MissionCommand::PersistArtifact {
                    mission_id,
                    work_item_id,
                    artifact_ref,
                    metadata,
                } => {
                    self.event_bus.emit(
                        "mission.artifact.persisted",
                        json!({
                            "missionID": mission_id,
                            "workItemID": work_item_id,
                            "artifactRef": artifact_ref,
                            "metadata": metadata,
                        }),
                    );
                }
                MissionCommand::ScheduleTimer {
                    mission_id,
                    timer_id,
                    delay_ms,
                } => {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    self.feed_back(MissionEvent::TimerFired {
                        mission_id,
                        timer_id,
                    })
                    .await;
                }
                MissionCommand::EmitNotice {
                    mission_id,
                    event_type,
                    properties,
                } => self.notice(mission_id, event_type, properties).await,
            }
        })
    }

    fn release_settled(&self, mission: &MissionState) {
        let mut active = self
            .active_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        active.retain(|run_key, run| {
            run.mission_id != mission.mission_id || run_is_live(mission, &run.work_item_id, run_key)
        });
    }

    fn release_run(&self, run_key: &str) {
        self.active_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_key);
    }

    async fn start_run(&self, mission_id: String, work_item_id: String, request: LaunchRequest) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        // The item may have moved on while this launch was queued.
        match self.missions.get(&mission_id).await {
            Ok(Some(mission)) if run_is_live(&mission, &work_item_id, &request.run_key) => {}
            Ok(_) => {
                tracing::info!(mission_id = %mission_id, run_key = %request.run_key, "queued run no longer wanted");
                return;
            }
            Err(err) => {
                tracing::warn!(mission_id = %mission_id, run_key = %request.run_key, "queued run skipped: {err}");
                return;
            }
        }
        tracing::info!(
            mission_id = %mission_id,
            work_item_id = %work_item_id,
            run_key = %request.run_key,
            prompt = %redact_text(request.prompt.as_deref().unwrap_or_default()),
            "launching work item run"
        );
        let result = launch_with_retry(
            self.launcher.as_ref(),
            &request,
            self.config.max_attempts,
            self.config.backoff_ms,
            None,
        )
        .await;

        let event = match result {
            Ok(receipt) => {
                self.active_runs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        request.run_key.clone(),
                        ActiveRun {
                            mission_id: mission_id.clone(),
                            work_item_id: work_item_id.clone(),
                            _permit: permit,
                        },
                    );
                let started = MissionEvent::RunStarted {
                    mission_id,
                    work_item_id,
                    run_id: receipt.run_id,
                };
                if !self.feed_back(started).await {
                    self.release_run(&request.run_key);
                }
                return;
            }
            Err(err) => {
                drop(permit);
                let detail = err.to_string();
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("mission.run.launch_failed", "dispatch")
                        .mission(&mission_id)
                        .work_item(&work_item_id)
                        .run(&request.run_key)
                        .error_code("MISSION_LAUNCH_FAILED")
                        .detail(&detail),
                );
                self.event_bus.emit(
                    "mission.run.launch_failed",
                    json!({
                        "missionID": mission_id,
                        "workItemID": work_item_id,
                        "runKey": request.run_key,
                        "error": detail,
                    }),
                );
                MissionEvent::RunFinished {
                    mission_id,
                    work_item_id,
                    run_id: request.run_key,
                    status: "launch_failed".to_string(),
                }
            }
        };
        self.feed_back(event).await;
    }

    async fn notice(&self, mission_id: String, event_type: String, mut properties: Value) {
        if let Value::Object(map) = &mut properties {
            map.entry("missionID")
                .or_insert_with(|| Value::String(mission_id.clone()));
        }
        let work_item_id = properties
            .get("workItemID")
            .and_then(Value::as_str)
            .map(str::to_string);
        let run_id = properties
            .get("runID")
            .and_then(Value::as_str)
            .map(str::to_string);
        let reason = properties
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("cancelled")
            .to_string();
        self.event_bus.emit(event_type.clone(), properties);

        match event_type.as_str() {
            "mission.work_item.cancelled" => {
                if let Some(run_id) = run_id {
                    if let Err(err) = self.launcher.cancel(&run_id, &reason).await {
                        tracing::warn!(mission_id = %mission_id, run_id = %run_id, "run cancel failed: {err}");
                    }
                }
            }
            "mission.work_item.review_requested" if self.config.auto_gates => {
                if let Some(work_item_id) = work_item_id {
                    self.evaluate_gates(&mission_id, &work_item_id).await;
                }
            }
            _ => {}
        }
    }

    /// Runs the configured evaluator over every outstanding gate, stopping at
    /// the first verdict that is not a pass.
    async fn evaluate_gates(&self, mission_id: &str, work_item_id: &str) {
        let mission = match self.missions.get(mission_id).await {
            Ok(Some(mission)) => mission,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(mission_id, "gate evaluation skipped: {err}");
                return;
            }
        };
        let Some(item) = mission.work_item(work_item_id) else {
            return;
        };
        if item.status != WorkItemStatus::Review {
            return;
        }
        for gate in outstanding_gates(item) {
            let verdict = self.gate.evaluate(gate, item, &mission.spec.success_criteria);
            let passed = verdict.outcome == GateOutcome::Pass;
            self.feed_back(MissionEvent::GateResult {
                mission_id: mission_id.to_string(),
                work_item_id: work_item_id.to_string(),
                gate,
                outcome: verdict.outcome,
                reason: Some(verdict.reason),
                reviewer: Some(self.gate.reviewer().to_string()),
            })
            .await;
            if !passed {
                break;
            }
        }
    }

    /// Applies a follow-up event and dispatches whatever it emits. Returns
    /// false when the event was dropped.
    async fn feed_back(&self, event: MissionEvent) -> bool {
        let mission_id = event.mission_id().to_string();
        let kind = event.kind();
        let mut attempt = 1;
        loop {
            match self
                .missions
                .apply_event(&mission_id, event.clone(), None)
                .await
            {
                Ok(outcome) => {
                    self.dispatch(&outcome.mission, outcome.commands);
                    return true;
                }
                Err(err) if err.is_conflict() && attempt < FEEDBACK_ATTEMPTS => {
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::warn!(mission_id = %mission_id, event = kind, "mission feedback dropped: {err}");
                    return false;
                }
            }
        }
    }
}
