use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tandem_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tandem_orchestrator::{
    GateKind, MissionBudget, MissionCapabilities, MissionEvent, MissionSpec, ReducerError,
    WorkItemPlan,
};
use tandem_types::EngineEvent;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::Level;
use uuid::Uuid;

use crate::missions::{MissionError, MissionOutcome};
use crate::routines::{
    is_valid_routine_id, RoutineBudget, RoutineCreatorType, RoutineError, RoutineMisfirePolicy,
    RoutinePatch, RoutineSchedule, RoutineSpec, RoutineStatus,
};
use crate::AppState;

#[derive(Debug, Deserialize, Default)]
struct EventFilterQuery {
    #[serde(rename = "missionID", alias = "mission_id")]
    mission_id: Option<String>,
    #[serde(rename = "routineID", alias = "routine_id")]
    routine_id: Option<String>,
    #[serde(rename = "runID", alias = "run_id")]
    run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MissionCreateInput {
    #[serde(default)]
    mission_id: Option<String>,
    title: String,
    goal: String,
    #[serde(default)]
    success_criteria: Vec<String>,
    #[serde(default)]
    entrypoint: Option<String>,
    #[serde(default)]
    budgets: Option<MissionBudget>,
    #[serde(default)]
    capabilities: Option<MissionCapabilities>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    work_items: Vec<MissionCreateWorkItem>,
    #[serde(default)]
    start: bool,
}

#[derive(Debug, Deserialize)]
struct MissionCreateWorkItem {
    #[serde(default)]
    work_item_id: Option<String>,
    title: String,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    required: Option<bool>,
    #[serde(default)]
    required_skills: Vec<String>,
    #[serde(default)]
    gates: Option<Vec<GateKind>>,
    #[serde(default)]
    sensitive_tools: Vec<String>,
    #[serde(default)]
    requires_approval: bool,
    #[serde(default)]
    metadata: Option<Value>,
}

impl MissionCreateWorkItem {
    fn into_plan(self) -> WorkItemPlan {
        let mut plan = WorkItemPlan::new(
            self.work_item_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            self.title,
        )
        .depends_on(self.depends_on)
        .skills(self.required_skills)
        .sensitive(self.sensitive_tools);
        plan.detail = self.detail;
        plan.required = self.required.unwrap_or(true);
        plan.requires_approval = self.requires_approval;
        plan.metadata = self.metadata;
        if let Some(gates) = self.gates {
            plan = plan.gates(gates);
        }
        plan
    }
}

#[derive(Debug, Deserialize)]
struct MissionEventInput {
    event: MissionEvent,
    #[serde(default)]
    expected_revision: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RoutineCreateInput {
    routine_id: Option<String>,
    name: String,
    schedule: RoutineSchedule,
    timezone: Option<String>,
    misfire_policy: Option<RoutineMisfirePolicy>,
    entrypoint: String,
    args: Option<Value>,
    #[serde(alias = "allowed_tools")]
    allowed_capabilities: Option<Vec<String>>,
    output_targets: Option<Vec<String>>,
    budget: Option<RoutineBudget>,
    creator_type: Option<RoutineCreatorType>,
    creator_id: Option<String>,
    requires_approval: Option<bool>,
    external_integrations_allowed: Option<bool>,
    next_fire_at_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RoutineRunNowInput {
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RoutineHistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RoutineRunsQuery {
    routine_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RoutineRunDecisionInput {
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RoutineEventsQuery {
    routine_id: Option<String>,
}

type ApiError = (StatusCode, Json<Value>);

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let routine_scheduler = tokio::spawn(crate::run_routine_scheduler(state.scheduler.clone()));
    let worker_id = state.scheduler.worker_id().to_string();
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent::new("engine.listening", "http")
            .status("ready")
            .detail(&worker_id),
    );
    tracing::info!("tandem engine listening on http://{addr}");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    routine_scheduler.abort();
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/global/health", get(global_health))
        .route("/global/config", get(global_config))
        .route("/event", get(events))
        .route("/mission", post(mission_create).get(mission_list))
        .route("/mission/{id}", get(mission_get))
        .route("/mission/{id}/event", post(mission_apply_event))
        .route("/routines", post(routines_create).get(routines_list))
        .route("/routines/events", get(routines_events))
        .route("/routines/runs", get(routines_runs_all))
        .route("/routines/runs/{run_id}", get(routines_run_get))
        .route("/routines/runs/{run_id}/approve", post(routines_run_approve))
        .route("/routines/runs/{run_id}/deny", post(routines_run_deny))
        .route(
            "/routines/{id}",
            get(routines_get)
                .patch(routines_patch)
                .delete(routines_delete),
        )
        .route("/routines/{id}/run_now", post(routines_run_now))
        .route("/routines/{id}/activate", post(routines_activate))
        .route("/routines/{id}/history", get(routines_history))
        .route("/routines/{id}/runs", get(routines_runs))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    let now = crate::now_ms();
    Json(json!({
        "healthy": true,
        "ready": true,
        "version": env!("CARGO_PKG_VERSION"),
        "build_id": crate::build_id(),
        "workerID": state.scheduler.worker_id(),
        "startedAtMs": state.started_at_ms,
        "uptimeMs": now.saturating_sub(state.started_at_ms),
        "subscribers": state.event_bus.subscriber_count(),
    }))
}

async fn global_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "effective": state.config.get_effective_value().await,
        "layers": state.config.get_layers_value().await,
    }))
}

fn sse_stream(
    state: AppState,
    filter: EventFilterQuery,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.event_bus.subscribe();
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new("server.connected", json!({}))).unwrap_or_default(),
    )));
    let ready = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new(
            "engine.lifecycle.ready",
            json!({
                "status": "ready",
                "transport": "sse",
                "timestamp_ms": crate::now_ms(),
            }),
        ))
        .unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) => {
            if !event_matches_filter(&event, &filter) {
                return None;
            }
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });
    initial.chain(ready).chain(live)
}

async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(sse_stream(state, filter))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

fn event_matches_filter(event: &EngineEvent, filter: &EventFilterQuery) -> bool {
    let checks = [
        ("missionID", filter.mission_id.as_deref()),
        ("routineID", filter.routine_id.as_deref()),
        ("runID", filter.run_id.as_deref()),
    ];
    checks.iter().all(|(key, wanted)| match wanted {
        Some(wanted) => event.property_str(key) == Some(*wanted),
        None => true,
    })
}

fn mission_error_response(mission_id: &str, error: MissionError) -> ApiError {
    let (status, code) = match &error {
        MissionError::NotFound { .. } => (StatusCode::NOT_FOUND, "MISSION_NOT_FOUND"),
        MissionError::AlreadyExists { .. } => (StatusCode::CONFLICT, "MISSION_ALREADY_EXISTS"),
        MissionError::Conflict { .. }
        | MissionError::Reducer(ReducerError::RevisionConflict { .. }) => {
            (StatusCode::CONFLICT, "MISSION_REVISION_CONFLICT")
        }
        MissionError::Reducer(ReducerError::MissionMismatch { .. }) => {
            (StatusCode::BAD_REQUEST, "MISSION_EVENT_MISMATCH")
        }
        MissionError::Reducer(_) => (StatusCode::BAD_REQUEST, "MISSION_EVENT_INVALID"),
        MissionError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MISSION_PERSIST_FAILED"),
    };
    let detail = match &error {
        MissionError::Reducer(reducer) => serde_json::to_value(reducer).unwrap_or(Value::Null),
        _ => Value::Null,
    };
    (
        status,
        Json(json!({
            "error": error.to_string(),
            "code": code,
            "missionID": mission_id,
            "detail": detail,
        })),
    )
}

async fn mission_create(
    State(state): State<AppState>,
    Json(input): Json<MissionCreateInput>,
) -> Result<Json<Value>, ApiError> {
    let mission_id = input
        .mission_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut spec = MissionSpec::with_id(mission_id.clone(), input.title, input.goal);
    spec.success_criteria = input.success_criteria;
    spec.entrypoint = input.entrypoint;
    spec.budgets = input.budgets.unwrap_or_default();
    spec.capabilities = input.capabilities.unwrap_or_default();
    spec.metadata = input.metadata;
    let plans = input
        .work_items
        .into_iter()
        .map(MissionCreateWorkItem::into_plan)
        .collect();

    let outcome = state
        .missions
        .create(spec, plans, input.start)
        .await
        .map_err(|err| mission_error_response(&mission_id, err))?;
    Ok(Json(dispatch_outcome(&state, outcome)))
}

fn dispatch_outcome(state: &AppState, outcome: MissionOutcome) -> Value {
    let MissionOutcome { mission, commands } = outcome;
    let body = json!({
        "mission": mission,
        "commands": commands,
        "revision": mission.revision,
    });
    state.dispatcher.dispatch(&mission, commands);
    body
}

async fn mission_list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let missions = state.missions.list().await.map_err(|err| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": err.to_string(),
                "code": "MISSION_PERSIST_FAILED",
            })),
        )
    })?;
    Ok(Json(json!({
        "missions": missions,
        "count": missions.len(),
    })))
}

async fn mission_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mission = state
        .missions
        .require(&id)
        .await
        .map_err(|err| mission_error_response(&id, err))?;
    Ok(Json(json!({
        "mission": mission,
    })))
}

async fn mission_apply_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<MissionEventInput>,
) -> Result<Json<Value>, ApiError> {
    if input.event.mission_id() != id {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Mission event mission_id mismatch",
                "code": "MISSION_EVENT_MISMATCH",
                "missionID": id,
            })),
        ));
    }
    let outcome = state
        .missions
        .apply_event(&id, input.event, input.expected_revision)
        .await
        .map_err(|err| mission_error_response(&id, err))?;
    Ok(Json(dispatch_outcome(&state, outcome)))
}

fn routine_error_response(error: RoutineError) -> ApiError {
    let mut body = json!({ "error": error.to_string() });
    let status = match &error {
        RoutineError::NotFound { routine_id } => {
            body["code"] = json!("ROUTINE_NOT_FOUND");
            body["routineID"] = json!(routine_id);
            StatusCode::NOT_FOUND
        }
        RoutineError::AlreadyExists { routine_id } => {
            body["code"] = json!("ROUTINE_ALREADY_EXISTS");
            body["routineID"] = json!(routine_id);
            StatusCode::CONFLICT
        }
        RoutineError::InvalidId { routine_id } => {
            body["code"] = json!("INVALID_ROUTINE_ID");
            body["routineID"] = json!(routine_id);
            StatusCode::BAD_REQUEST
        }
        RoutineError::InvalidSchedule { .. } => {
            body["code"] = json!("INVALID_ROUTINE_SCHEDULE");
            StatusCode::BAD_REQUEST
        }
        RoutineError::NotActive { routine_id, status } => {
            body["code"] = json!("ROUTINE_NOT_ACTIVE");
            body["routineID"] = json!(routine_id);
            body["status"] = json!(status);
            StatusCode::CONFLICT
        }
        RoutineError::AlreadyFiring {
            routine_id,
            holder,
            lease_expires_at_ms,
        } => {
            body["code"] = json!("ROUTINE_ALREADY_FIRING");
            body["routineID"] = json!(routine_id);
            body["leaseHolder"] = json!(holder);
            body["leaseExpiresAtMs"] = json!(lease_expires_at_ms);
            StatusCode::CONFLICT
        }
        RoutineError::RunNotFound { run_id } => {
            body["code"] = json!("ROUTINE_RUN_NOT_FOUND");
            body["runID"] = json!(run_id);
            StatusCode::NOT_FOUND
        }
        RoutineError::RunNotPending { run_id, status } => {
            body["code"] = json!("ROUTINE_RUN_NOT_PENDING");
            body["runID"] = json!(run_id);
            body["status"] = json!(status);
            StatusCode::CONFLICT
        }
        RoutineError::LaunchFailed { routine_id, .. } => {
            body["code"] = json!("ROUTINE_LAUNCH_FAILED");
            body["routineID"] = json!(routine_id);
            StatusCode::BAD_GATEWAY
        }
        RoutineError::Store(_) => {
            body["code"] = json!("ROUTINE_PERSIST_FAILED");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(body))
}

async fn routines_create(
    State(state): State<AppState>,
    Json(input): Json<RoutineCreateInput>,
) -> Result<Json<Value>, ApiError> {
    let routine_id = input
        .routine_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if !is_valid_routine_id(&routine_id) {
        return Err(routine_error_response(RoutineError::InvalidId { routine_id }));
    }
    let mut spec = RoutineSpec::new(routine_id, input.name, input.schedule, input.entrypoint);
    spec.status = RoutineStatus::Active;
    if let Some(timezone) = input.timezone {
        spec.timezone = timezone;
    }
    spec.misfire_policy = input.misfire_policy.unwrap_or_default();
    spec.args = input.args.unwrap_or_else(|| json!({}));
    spec.allowed_capabilities = input.allowed_capabilities.unwrap_or_default();
    spec.output_targets = input.output_targets.unwrap_or_default();
    spec.budget = input.budget.unwrap_or_default();
    spec.creator_type = input.creator_type.unwrap_or_default();
    if let Some(creator_id) = input.creator_id.filter(|id| !id.trim().is_empty()) {
        spec.creator_id = creator_id;
    }
    spec.requires_approval = input.requires_approval.unwrap_or(true);
    spec.external_integrations_allowed = input.external_integrations_allowed.unwrap_or(false);

    let stored = state
        .scheduler
        .routines()
        .create(spec, input.next_fire_at_ms, crate::now_ms())
        .await
        .map_err(routine_error_response)?;
    state.event_bus.publish(EngineEvent::new(
        "routine.created",
        json!({
            "routineID": stored.spec.routine_id,
            "name": stored.spec.name,
            "entrypoint": stored.spec.entrypoint,
        }),
    ));
    Ok(Json(json!({
        "routine": stored,
    })))
}

async fn routines_list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let routines = state
        .scheduler
        .routines()
        .list()
        .await
        .map_err(routine_error_response)?;
    Ok(Json(json!({
        "routines": routines,
        "count": routines.len(),
    })))
}

async fn routines_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let routine = state
        .scheduler
        .routines()
        .require(&id)
        .await
        .map_err(routine_error_response)?;
    Ok(Json(json!({
        "routine": routine,
    })))
}

async fn routines_patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RoutinePatch>,
) -> Result<Json<Value>, ApiError> {
    let stored = state
        .scheduler
        .routines()
        .patch(&id, input, crate::now_ms())
        .await
        .map_err(routine_error_response)?;
    state.event_bus.publish(EngineEvent::new(
        "routine.updated",
        json!({
            "routineID": stored.spec.routine_id,
            "status": stored.spec.status,
            "nextFireAtMs": stored.runtime.next_fire_at_ms,
        }),
    ));
    Ok(Json(json!({
        "routine": stored,
    })))
}

async fn routines_activate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stored = state
        .scheduler
        .routines()
        .activate(&id, crate::now_ms())
        .await
        .map_err(routine_error_response)?;
    state.event_bus.publish(EngineEvent::new(
        "routine.activated",
        json!({
            "routineID": stored.spec.routine_id,
            "status": stored.spec.status,
            "nextFireAtMs": stored.runtime.next_fire_at_ms,
        }),
    ));
    Ok(Json(json!({
        "routine": stored,
    })))
}

async fn routines_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state
        .scheduler
        .routines()
        .delete(&id)
        .await
        .map_err(routine_error_response)?;
    let Some(routine) = deleted else {
        return Err(routine_error_response(RoutineError::NotFound { routine_id: id }));
    };
    state.event_bus.publish(EngineEvent::new(
        "routine.deleted",
        json!({
            "routineID": routine.spec.routine_id,
        }),
    ));
    Ok(Json(json!({
        "deleted": true,
        "routineID": id,
    })))
}

async fn routines_run_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RoutineRunNowInput>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .scheduler
        .run_now(&id, crate::now_ms(), input.reason)
        .await
        .map_err(routine_error_response)?;
    Ok(Json(json!({
        "ok": true,
        "routineID": id,
        "status": run.status,
        "run": run,
    })))
}

async fn routines_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RoutineHistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let events = state
        .scheduler
        .routines()
        .history(&id, limit)
        .await
        .map_err(routine_error_response)?;
    Ok(Json(json!({
        "routineID": id,
        "events": events,
        "count": events.len(),
    })))
}

async fn routines_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RoutineRunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let runs = state
        .scheduler
        .routines()
        .list_runs(Some(&id), limit)
        .await
        .map_err(routine_error_response)?;
    Ok(Json(json!({
        "routineID": id,
        "runs": runs,
        "count": runs.len(),
    })))
}

async fn routines_runs_all(
    State(state): State<AppState>,
    Query(query): Query<RoutineRunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let runs = state
        .scheduler
        .routines()
        .list_runs(query.routine_id.as_deref(), limit)
        .await
        .map_err(routine_error_response)?;
    Ok(Json(json!({
        "runs": runs,
        "count": runs.len(),
    })))
}

async fn routines_run_get(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .scheduler
        .routines()
        .get_run(&run_id)
        .await
        .map_err(routine_error_response)?
        .ok_or_else(|| routine_error_response(RoutineError::RunNotFound { run_id }))?;
    Ok(Json(json!({ "run": run })))
}

async fn routines_run_approve(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(input): Json<RoutineRunDecisionInput>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .scheduler
        .approve_run(&run_id, input.reason)
        .await
        .map_err(routine_error_response)?;
    Ok(Json(json!({ "ok": true, "run": run })))
}

async fn routines_run_deny(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(input): Json<RoutineRunDecisionInput>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .scheduler
        .deny_run(&run_id, input.reason)
        .await
        .map_err(routine_error_response)?;
    Ok(Json(json!({ "ok": true, "run": run })))
}

fn routines_sse_stream(
    state: AppState,
    routine_id: Option<String>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let ready = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&json!({
            "status": "ready",
            "stream": "routines",
            "timestamp_ms": crate::now_ms(),
        }))
        .unwrap_or_default(),
    )));
    let rx = state.event_bus.subscribe();
    let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) => {
            if !event.is_family("routine.") {
                return None;
            }
            if let Some(routine_id) = routine_id.as_deref() {
                if event.property_str("routineID").unwrap_or_default() != routine_id {
                    return None;
                }
            }
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });
    ready.chain(live)
}

async fn routines_events(
    State(state): State<AppState>,
    Query(query): Query<RoutineEventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(routines_sse_stream(state, query.routine_id))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tandem_core::{ConfigStore, JsonStateStore};
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    use crate::launcher::RecordingRunLauncher;

    async fn test_state_with_launcher() -> (AppState, Arc<RecordingRunLauncher>) {
        let root = std::env::temp_dir().join(format!("tandem-http-test-{}", Uuid::new_v4()));
        let config = ConfigStore::open(
            root.join("config.json"),
            None,
            json!({}),
            Some(json!({
                "scheduler": {
                    "lease_ttl_ms": 30000,
                    "launch_max_attempts": 2,
                    "launch_backoff_ms": 1
                },
                "dispatch": { "backoff_ms": 1 },
                "entrypoints": {
                    "mission.default": {
                        "capabilities": ["connector.slack", "fs.read", "fs.write"]
                    }
                }
            })),
        )
        .await
        .expect("config");
        let launcher = Arc::new(RecordingRunLauncher::new());
        let state = AppState::new(
            config,
            Arc::new(JsonStateStore::in_memory()),
            launcher.clone(),
            "worker-http",
        )
        .await
        .expect("state");
        (state, launcher)
    }

    async fn test_state() -> AppState {
        test_state_with_launcher().await.0
    }

    async fn next_event_of_type(
        rx: &mut broadcast::Receiver<EngineEvent>,
        expected_type: &str,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event");
                if event.event_type == expected_type {
                    return event;
                }
            }
        })
        .await
        .expect("event timeout")
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.expect("response");
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).expect("json")
        };
        (status, payload)
    }

    async fn create_routine(app: &Router, body: Value) -> Value {
        let (status, payload) = send(app, json_request("POST", "/routines", body)).await;
        assert_eq!(status, StatusCode::OK, "{payload}");
        payload
    }

    #[tokio::test]
    async fn global_health_route_returns_healthy_shape() {
        let state = test_state().await;
        let app = app_router(state);
        let req = Request::builder()
            .uri("/global/health")
            .body(Body::empty())
            .expect("request");
        let (status, payload) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.get("healthy").and_then(Value::as_bool), Some(true));
        assert_eq!(payload.get("workerID").and_then(Value::as_str), Some("worker-http"));
        assert!(payload.get("build_id").and_then(Value::as_str).is_some());
    }

    #[tokio::test]
    async fn global_config_exposes_cli_layer() {
        let state = test_state().await;
        let app = app_router(state);
        let req = Request::builder()
            .uri("/global/config")
            .body(Body::empty())
            .expect("request");
        let (status, payload) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["effective"]["scheduler"]["lease_ttl_ms"], 30000);
        assert!(payload["layers"]["cli"]["entrypoints"]["mission.default"].is_object());
    }

    #[tokio::test]
    async fn mission_created_event_contract_snapshot() {
        let state = test_state().await;
        let mut rx = state.event_bus.subscribe();
        let app = app_router(state.clone());

        let (status, payload) = send(
            &app,
            json_request(
                "POST",
                "/mission",
                json!({
                    "title": "Event contract",
                    "goal": "Capture mission.created shape",
                    "work_items": [{"work_item_id":"w-1","title":"Task"}]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let mission_id = payload
            .get("mission")
            .and_then(|v| v.get("mission_id"))
            .and_then(|v| v.as_str())
            .expect("mission_id");

        let event = next_event_of_type(&mut rx, "mission.created").await;
        let snapshot = json!({
            "type": event.event_type,
            "properties": event.properties,
        });
        let expected = json!({
            "type": "mission.created",
            "properties": {
                "missionID": mission_id,
                "workItemCount": 1
            }
        });
        assert_eq!(snapshot, expected);
    }

    #[tokio::test]
    async fn mission_updated_event_contract_snapshot() {
        let state = test_state().await;
        let mut rx = state.event_bus.subscribe();
        let app = app_router(state.clone());

        let (status, payload) = send(
            &app,
            json_request(
                "POST",
                "/mission",
                json!({
                    "mission_id": "m-contract",
                    "title": "Mission update contract",
                    "goal": "Capture mission.updated shape",
                    "work_items": [{"work_item_id":"w-1","title":"Task"}]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["revision"], 2);

        let (status, payload) = send(
            &app,
            json_request(
                "POST",
                "/mission/m-contract/event",
                json!({
                    "event": {"type": "mission_started", "mission_id": "m-contract"},
                    "expected_revision": 2
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["commands"][0]["type"], "start_run");

        let event = next_event_of_type(&mut rx, "mission.updated").await;
        let snapshot = json!({
            "type": event.event_type,
            "properties": event.properties,
        });
        let expected = json!({
            "type": "mission.updated",
            "properties": {
                "missionID": "m-contract",
                "revision": 3,
                "status": "running",
                "commandCount": 1
            }
        });
        assert_eq!(snapshot, expected);
    }

    #[tokio::test]
    async fn mission_event_errors_use_stable_codes() {
        let state = test_state().await;
        let app = app_router(state);
        send(
            &app,
            json_request(
                "POST",
                "/mission",
                json!({"mission_id": "m-err", "title": "Errors", "goal": "Check codes"}),
            ),
        )
        .await;

        let (status, payload) = send(
            &app,
            json_request(
                "POST",
                "/mission/m-err/event",
                json!({
                    "event": {"type": "mission_started", "mission_id": "m-err"},
                    "expected_revision": 7
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(payload["code"], "MISSION_REVISION_CONFLICT");

        let (status, payload) = send(
            &app,
            json_request(
                "POST",
                "/mission/m-err/event",
                json!({"event": {"type": "mission_started", "mission_id": "other"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "MISSION_EVENT_MISMATCH");

        let (status, payload) = send(
            &app,
            json_request(
                "POST",
                "/mission/m-err/event",
                json!({"event": {"type": "mission_resumed", "mission_id": "m-err"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "MISSION_EVENT_INVALID");
        assert_eq!(payload["detail"]["type"], "invalid_transition");

        let req = Request::builder()
            .uri("/mission/ghost")
            .body(Body::empty())
            .expect("request");
        let (status, payload) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(payload["code"], "MISSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn routine_fired_event_contract_snapshot() {
        let state = test_state().await;
        let mut rx = state.event_bus.subscribe();
        let app = app_router(state.clone());

        let created = create_routine(
            &app,
            json!({
                "routine_id": "r-fired",
                "name": "Digest",
                "schedule": {"interval_seconds": {"seconds": 60}},
                "entrypoint": "mission.default",
                "allowed_capabilities": ["fs.read"],
                "requires_approval": false,
                "external_integrations_allowed": true
            }),
        )
        .await;
        let next_fire = created["routine"]["runtime"]["next_fire_at_ms"].clone();
        assert!(next_fire.is_u64());

        let (status, payload) = send(
            &app,
            json_request("POST", "/routines/r-fired/run_now", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let run = &payload["run"];
        assert_eq!(run["status"], "launched");
        assert_eq!(run["capabilities"], json!(["fs.read"]));

        let event = next_event_of_type(&mut rx, "routine.fired").await;
        let snapshot = json!({
            "type": event.event_type,
            "properties": event.properties,
        });
        let expected = json!({
            "type": "routine.fired",
            "properties": {
                "routineID": "r-fired",
                "runID": run["run_id"],
                "runCount": 1,
                "triggerType": "manual",
                "scheduledAtMs": run["scheduled_for_ms"],
                "nextFireAtMs": next_fire,
                "dryRun": false
            }
        });
        assert_eq!(snapshot, expected);
    }

    #[tokio::test]
    async fn routine_approval_required_event_contract_snapshot() {
        let (state, launcher) = test_state_with_launcher().await;
        let mut rx = state.event_bus.subscribe();
        let app = app_router(state.clone());

        create_routine(
            &app,
            json!({
                "routine_id": "r-approval",
                "name": "Needs sign-off",
                "schedule": {"interval_seconds": {"seconds": 300}},
                "entrypoint": "mission.default"
            }),
        )
        .await;
        let (status, payload) = send(
            &app,
            json_request("POST", "/routines/r-approval/run_now", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let run_id = payload["run"]["run_id"].as_str().expect("run id").to_string();
        assert_eq!(payload["run"]["status"], "awaiting_approval");
        assert_eq!(payload["run"]["dry_run"], true);

        let event = next_event_of_type(&mut rx, "routine.approval_required").await;
        let snapshot = json!({
            "type": event.event_type,
            "properties": event.properties,
        });
        let expected = json!({
            "type": "routine.approval_required",
            "properties": {
                "routineID": "r-approval",
                "runID": run_id,
                "runCount": 1,
                "triggerType": "manual",
                "reason": "manual approval required before side effects"
            }
        });
        assert_eq!(snapshot, expected);

        let (status, payload) = send(
            &app,
            json_request(
                "POST",
                &format!("/routines/runs/{run_id}/approve"),
                json!({"reason": "looks fine"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["run"]["status"], "approved");
        assert_eq!(launcher.approvals().await.len(), 1);

        let (status, payload) = send(
            &app,
            json_request("POST", &format!("/routines/runs/{run_id}/deny"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(payload["code"], "ROUTINE_RUN_NOT_PENDING");
    }

    #[tokio::test]
    async fn routine_blocked_event_contract_snapshot() {
        let state = test_state().await;
        let mut rx = state.event_bus.subscribe();
        let app = app_router(state.clone());

        create_routine(
            &app,
            json!({
                "routine_id": "r-blocked",
                "name": "Unknown target",
                "schedule": {"interval_seconds": {"seconds": 60}},
                "entrypoint": "mission.unknown",
                "requires_approval": false
            }),
        )
        .await;
        let (status, payload) = send(
            &app,
            json_request("POST", "/routines/r-blocked/run_now", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["run"]["status"], "blocked");
        let run_id = payload["run"]["run_id"].clone();

        let event = next_event_of_type(&mut rx, "routine.blocked").await;
        let snapshot = json!({
            "type": event.event_type,
            "properties": event.properties,
        });
        let expected = json!({
            "type": "routine.blocked",
            "properties": {
                "routineID": "r-blocked",
                "runID": run_id,
                "runCount": 1,
                "triggerType": "manual",
                "reason": "unknown entrypoint `mission.unknown`"
            }
        });
        assert_eq!(snapshot, expected);
    }

    #[tokio::test]
    async fn run_now_twice_is_already_firing() {
        let state = test_state().await;
        let app = app_router(state);
        create_routine(
            &app,
            json!({
                "routine_id": "r-twice",
                "name": "Twice",
                "schedule": {"interval_seconds": {"seconds": 60}},
                "entrypoint": "mission.default",
                "requires_approval": false
            }),
        )
        .await;
        let (status, _) = send(
            &app,
            json_request("POST", "/routines/r-twice/run_now", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, payload) = send(
            &app,
            json_request("POST", "/routines/r-twice/run_now", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(payload["code"], "ROUTINE_ALREADY_FIRING");
        assert_eq!(payload["routineID"], "r-twice");
        assert_eq!(payload["leaseHolder"], "worker-http");
    }

    #[tokio::test]
    async fn agent_routines_wait_for_activation() {
        let state = test_state().await;
        let mut rx = state.event_bus.subscribe();
        let app = app_router(state.clone());
        let created = create_routine(
            &app,
            json!({
                "routine_id": "r-agent",
                "name": "Agent proposal",
                "schedule": {"cron": {"expression": "0 9 * * 1-5"}},
                "timezone": "+02:00",
                "entrypoint": "mission.default",
                "creator_type": "agent",
                "creator_id": "planner"
            }),
        )
        .await;
        assert_eq!(created["routine"]["status"], "pending_activation");

        let (status, payload) = send(
            &app,
            json_request("POST", "/routines/r-agent/run_now", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(payload["code"], "ROUTINE_NOT_ACTIVE");

        let (status, payload) = send(
            &app,
            json_request("POST", "/routines/r-agent/activate", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["routine"]["status"], "active");
        let event = next_event_of_type(&mut rx, "routine.activated").await;
        assert_eq!(event.property_str("routineID"), Some("r-agent"));
    }

    #[tokio::test]
    async fn routine_validation_and_lifecycle_routes() {
        let state = test_state().await;
        let app = app_router(state);

        let (status, payload) = send(
            &app,
            json_request(
                "POST",
                "/routines",
                json!({
                    "routine_id": "r-zero",
                    "name": "Zero",
                    "schedule": {"interval_seconds": {"seconds": 0}},
                    "entrypoint": "mission.default"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "INVALID_ROUTINE_SCHEDULE");

        let (status, payload) = send(
            &app,
            json_request(
                "POST",
                "/routines",
                json!({
                    "routine_id": "bad id",
                    "name": "Bad",
                    "schedule": {"interval_seconds": {"seconds": 60}},
                    "entrypoint": "mission.default"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "INVALID_ROUTINE_ID");

        create_routine(
            &app,
            json!({
                "routine_id": "r-life",
                "name": "Lifecycle",
                "schedule": {"interval_seconds": {"seconds": 60}},
                "entrypoint": "mission.default"
            }),
        )
        .await;
        let (status, payload) = send(
            &app,
            json_request(
                "PATCH",
                "/routines/r-life",
                json!({"status": "paused", "name": "Lifecycle (paused)"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["routine"]["status"], "paused");
        assert_eq!(payload["routine"]["name"], "Lifecycle (paused)");

        let req = Request::builder()
            .uri("/routines")
            .body(Body::empty())
            .expect("request");
        let (_, payload) = send(&app, req).await;
        assert_eq!(payload["count"], 1);

        let req = Request::builder()
            .method("DELETE")
            .uri("/routines/r-life")
            .body(Body::empty())
            .expect("request");
        let (status, payload) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload, json!({"deleted": true, "routineID": "r-life"}));

        let req = Request::builder()
            .method("DELETE")
            .uri("/routines/r-life")
            .body(Body::empty())
            .expect("request");
        let (status, payload) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(payload["code"], "ROUTINE_NOT_FOUND");

        let req = Request::builder()
            .uri("/routines/runs/rr-missing")
            .body(Body::empty())
            .expect("request");
        let (status, payload) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(payload["code"], "ROUTINE_RUN_NOT_FOUND");
    }

    #[tokio::test]
    async fn history_and_runs_routes_list_manual_runs() {
        let state = test_state().await;
        let app = app_router(state);
        create_routine(
            &app,
            json!({
                "routine_id": "r-hist",
                "name": "History",
                "schedule": {"interval_seconds": {"seconds": 60}},
                "entrypoint": "mission.default",
                "requires_approval": false
            }),
        )
        .await;
        send(
            &app,
            json_request(
                "POST",
                "/routines/r-hist/run_now",
                json!({"reason": "operator check"}),
            ),
        )
        .await;

        let req = Request::builder()
            .uri("/routines/r-hist/history?limit=5")
            .body(Body::empty())
            .expect("request");
        let (status, payload) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["routineID"], "r-hist");
        assert_eq!(payload["events"][0]["trigger_type"], "manual");

        let req = Request::builder()
            .uri("/routines/runs?routine_id=r-hist")
            .body(Body::empty())
            .expect("request");
        let (status, payload) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["count"], 1);
        assert_eq!(payload["runs"][0]["detail"], "operator check");
    }

    #[tokio::test]
    async fn routines_sse_filters_by_routine_id() {
        let state = test_state().await;
        let app = app_router(state.clone());
        let req = Request::builder()
            .uri("/routines/events?routine_id=r-watch")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body().into_data_stream();

        let first = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("ready frame")
            .expect("frame")
            .expect("bytes");
        assert!(String::from_utf8_lossy(&first).contains("\"stream\":\"routines\""));

        state
            .event_bus
            .emit("routine.fired", json!({"routineID": "r-other"}));
        state
            .event_bus
            .emit("mission.updated", json!({"routineID": "r-watch"}));
        state
            .event_bus
            .emit("routine.fired", json!({"routineID": "r-watch", "runID": "rr-1"}));

        let next = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("event frame")
            .expect("frame")
            .expect("bytes");
        let text = String::from_utf8_lossy(&next);
        assert!(text.contains("r-watch"));
        assert!(text.contains("rr-1"));
        assert!(!text.contains("r-other"));
    }

    #[test]
    fn event_filter_matches_all_given_ids() {
        let event = EngineEvent::new(
            "routine.fired",
            json!({"routineID": "r-1", "runID": "rr-r-1-60000"}),
        );
        assert!(event_matches_filter(&event, &EventFilterQuery::default()));
        assert!(event_matches_filter(
            &event,
            &EventFilterQuery {
                routine_id: Some("r-1".to_string()),
                ..EventFilterQuery::default()
            }
        ));
        assert!(!event_matches_filter(
            &event,
            &EventFilterQuery {
                routine_id: Some("r-1".to_string()),
                mission_id: Some("m-1".to_string()),
                ..EventFilterQuery::default()
            }
        ));
    }
}
