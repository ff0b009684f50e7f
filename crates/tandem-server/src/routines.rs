use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tandem_core::{
    EntrypointConfig, EventBus, Expect, Lease, LeaseManager, LeaseOutcome, Namespace,
    SchedulerConfig, StateStore, StoreError,
};
use tandem_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tokio::time::Instant;
use tracing::Level;

use crate::launcher::{launch_with_retry, LaunchRequest, RunLauncher};
use crate::schedule::{
    resolve_misfire, retained_occurrences, CompiledSchedule, DueOccurrences, ScheduleError,
};

const CAS_ATTEMPTS: usize = 8;
/// Launch retries stop this long before the lease would lapse.
const LEASE_SAFETY_MARGIN_MS: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutineSchedule {
    IntervalSeconds { seconds: u64 },
    Cron { expression: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RoutineMisfirePolicy {
    Skip,
    #[default]
    RunOnce,
    CatchUp { max_runs: u32 },
}

impl RoutineMisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutineMisfirePolicy::Skip => "skip",
            RoutineMisfirePolicy::RunOnce => "run_once",
            RoutineMisfirePolicy::CatchUp { .. } => "catch_up",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutineStatus {
    Active,
    Paused,
    PendingActivation,
}

impl RoutineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutineStatus::Active => "active",
            RoutineStatus::Paused => "paused",
            RoutineStatus::PendingActivation => "pending_activation",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutineCreatorType {
    #[default]
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoutineBudget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs_per_trigger: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutineSpec {
    pub routine_id: String,
    pub name: String,
    pub status: RoutineStatus,
    pub schedule: RoutineSchedule,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub misfire_policy: RoutineMisfirePolicy,
    pub entrypoint: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, alias = "allowed_tools")]
    pub allowed_capabilities: Vec<String>,
    #[serde(default)]
    pub output_targets: Vec<String>,
    #[serde(default)]
    pub budget: RoutineBudget,
    #[serde(default)]
    pub creator_type: RoutineCreatorType,
    #[serde(default = "default_creator_id")]
    pub creator_id: String,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub external_integrations_allowed: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_creator_id() -> String {
    "unknown".to_string()
}

impl RoutineSpec {
    pub fn new(
        routine_id: impl Into<String>,
        name: impl Into<String>,
        schedule: RoutineSchedule,
        entrypoint: impl Into<String>,
    ) -> Self {
        Self {
            routine_id: routine_id.into(),
            name: name.into(),
            status: RoutineStatus::Active,
            schedule,
            timezone: default_timezone(),
            misfire_policy: RoutineMisfirePolicy::default(),
            entrypoint: entrypoint.into(),
            args: json!({}),
            allowed_capabilities: Vec::new(),
            output_targets: Vec::new(),
            budget: RoutineBudget::default(),
            creator_type: RoutineCreatorType::User,
            creator_id: default_creator_id(),
            requires_approval: false,
            external_integrations_allowed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutinePhase {
    #[default]
    Scheduled,
    Firing,
    Fired,
    Misfired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoutineRuntimeState {
    #[serde(default)]
    pub phase: RoutinePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<String>,
    #[serde(default)]
    pub consecutive_misfires: u32,
    /// Occurrences whose launch failed; folded into the next pass.
    #[serde(default)]
    pub retry_occurrences: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutineRecord {
    #[serde(flatten)]
    pub spec: RoutineSpec,
    #[serde(default)]
    pub runtime: RoutineRuntimeState,
}

impl RoutineRecord {
    pub fn routine_id(&self) -> &str {
        &self.spec.routine_id
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.spec.status == RoutineStatus::Active
            && (self
                .runtime
                .next_fire_at_ms
                .is_some_and(|next| next <= now_ms)
                || !self.runtime.retry_occurrences.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutineTriggerType {
    Scheduled,
    Manual,
    CatchUp,
    RunOnce,
}

impl RoutineTriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutineTriggerType::Scheduled => "scheduled",
            RoutineTriggerType::Manual => "manual",
            RoutineTriggerType::CatchUp => "catch_up",
            RoutineTriggerType::RunOnce => "run_once",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutineRunStatus {
    Launched,
    AwaitingApproval,
    Approved,
    Denied,
    Blocked,
    Failed,
}

impl RoutineRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutineRunStatus::Launched => "launched",
            RoutineRunStatus::AwaitingApproval => "awaiting_approval",
            RoutineRunStatus::Approved => "approved",
            RoutineRunStatus::Denied => "denied",
            RoutineRunStatus::Blocked => "blocked",
            RoutineRunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutineRunRecord {
    pub run_id: String,
    pub routine_id: String,
    pub trigger_type: RoutineTriggerType,
    pub scheduled_for_ms: u64,
    pub fired_at_ms: u64,
    pub status: RoutineRunStatus,
    pub dry_run: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub entrypoint: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutineHistoryEvent {
    pub routine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub trigger_type: String,
    pub run_count: u64,
    pub fired_at_ms: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutinePatch {
    pub name: Option<String>,
    pub status: Option<RoutineStatus>,
    pub schedule: Option<RoutineSchedule>,
    pub timezone: Option<String>,
    pub misfire_policy: Option<RoutineMisfirePolicy>,
    pub entrypoint: Option<String>,
    pub args: Option<Value>,
    #[serde(alias = "allowed_tools")]
    pub allowed_capabilities: Option<Vec<String>>,
    pub output_targets: Option<Vec<String>>,
    pub budget: Option<RoutineBudget>,
    pub requires_approval: Option<bool>,
    pub external_integrations_allowed: Option<bool>,
    pub next_fire_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutineError {
    #[error("routine `{routine_id}` not found")]
    NotFound { routine_id: String },
    #[error("routine `{routine_id}` already exists")]
    AlreadyExists { routine_id: String },
    #[error("invalid routine id `{routine_id}`")]
    InvalidId { routine_id: String },
    #[error("invalid routine schedule: {detail}")]
    InvalidSchedule { detail: String },
    #[error("routine `{routine_id}` is {status}")]
    NotActive { routine_id: String, status: String },
    #[error("routine `{routine_id}` is already firing")]
    AlreadyFiring {
        routine_id: String,
        holder: Option<String>,
        lease_expires_at_ms: Option<u64>,
    },
    #[error("routine run `{run_id}` not found")]
    RunNotFound { run_id: String },
    #[error("routine run `{run_id}` is {status}, not awaiting approval")]
    RunNotPending { run_id: String, status: String },
    #[error("launch failed for routine `{routine_id}`: {detail}")]
    LaunchFailed { routine_id: String, detail: String },
    #[error("routine persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl From<ScheduleError> for RoutineError {
    fn from(error: ScheduleError) -> Self {
        RoutineError::InvalidSchedule {
            detail: error.to_string(),
        }
    }
}

pub fn is_valid_routine_id(routine_id: &str) -> bool {
    !routine_id.is_empty()
        && routine_id.len() <= 128
        && routine_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
}

pub fn validate_routine(spec: &RoutineSpec) -> Result<CompiledSchedule, RoutineError> {
    if !is_valid_routine_id(&spec.routine_id) {
        return Err(RoutineError::InvalidId {
            routine_id: spec.routine_id.clone(),
        });
    }
    if let RoutineMisfirePolicy::CatchUp { max_runs: 0 } = spec.misfire_policy {
        return Err(RoutineError::InvalidSchedule {
            detail: "catch_up max_runs must be >= 1".to_string(),
        });
    }
    Ok(CompiledSchedule::compile(&spec.schedule, &spec.timezone)?)
}

pub fn is_external_capability(capability: &str) -> bool {
    let lowered = capability.to_ascii_lowercase();
    lowered.starts_with("connector.") || lowered.starts_with("integration.")
}

/// Routine allowance intersected with what the entrypoint declares, minus
/// external capabilities when integrations are disallowed.
pub fn effective_capabilities(routine: &RoutineSpec, entrypoint: &EntrypointConfig) -> Vec<String> {
    let allowed = routine
        .allowed_capabilities
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<_>>();
    let declared = entrypoint
        .capabilities
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<_>>();
    allowed
        .intersection(&declared)
        .filter(|capability| {
            routine.external_integrations_allowed || !is_external_capability(capability)
        })
        .map(|capability| capability.to_string())
        .collect()
}

fn encode<T: Serialize>(namespace: Namespace, key: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|err| StoreError::Decode {
        namespace,
        key: key.to_string(),
        detail: err.to_string(),
    })
}

/// Routine definitions, run records and history on top of the state store.
#[derive(Clone)]
pub struct RoutineStore {
    store: Arc<dyn StateStore>,
}

impl RoutineStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        mut spec: RoutineSpec,
        next_fire_at_ms: Option<u64>,
        now_ms: u64,
    ) -> Result<RoutineRecord, RoutineError> {
        if spec.creator_type == RoutineCreatorType::Agent {
            spec.status = RoutineStatus::PendingActivation;
        }
        let schedule = validate_routine(&spec)?;
        let record = RoutineRecord {
            runtime: RoutineRuntimeState {
                next_fire_at_ms: next_fire_at_ms.or_else(|| schedule.next_after(now_ms)),
                ..RoutineRuntimeState::default()
            },
            spec,
        };
        let key = record.spec.routine_id.clone();
        let value = encode(Namespace::Routine, &key, &record)?;
        match self
            .store
            .put(Namespace::Routine, &key, value, Expect::Absent)
            .await
        {
            Ok(_) => Ok(record),
            Err(err) if err.is_conflict() => Err(RoutineError::AlreadyExists { routine_id: key }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, routine_id: &str) -> Result<Option<RoutineRecord>, RoutineError> {
        match self.store.get(Namespace::Routine, routine_id).await? {
            Some(record) => Ok(Some(record.decode(Namespace::Routine)?)),
            None => Ok(None),
        }
    }

    pub async fn require(&self, routine_id: &str) -> Result<RoutineRecord, RoutineError> {
        self.get(routine_id)
            .await?
            .ok_or_else(|| RoutineError::NotFound {
                routine_id: routine_id.to_string(),
            })
    }

    pub async fn list(&self) -> Result<Vec<RoutineRecord>, RoutineError> {
        let mut rows = self
            .store
            .list(Namespace::Routine)
            .await?
            .iter()
            .map(|record| record.decode::<RoutineRecord>(Namespace::Routine))
            .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by(|a, b| a.spec.routine_id.cmp(&b.spec.routine_id));
        Ok(rows)
    }

    /// Read-modify-write under the record revision, retried on conflict.
    pub async fn update<F>(&self, routine_id: &str, apply: F) -> Result<RoutineRecord, RoutineError>
    where
        F: FnMut(&mut RoutineRecord) -> Result<(), RoutineError>,
    {
        self.update_json(Namespace::Routine, routine_id, apply, || {
            RoutineError::NotFound {
                routine_id: routine_id.to_string(),
            }
        })
        .await
    }

    pub async fn patch(
        &self,
        routine_id: &str,
        patch: RoutinePatch,
        now_ms: u64,
    ) -> Result<RoutineRecord, RoutineError> {
        self.update(routine_id, |record| {
            let spec = &mut record.spec;
            let before = (spec.schedule.clone(), spec.timezone.clone(), spec.status);
            if patch.status == Some(RoutineStatus::Active)
                && spec.status == RoutineStatus::PendingActivation
            {
                return Err(RoutineError::NotActive {
                    routine_id: spec.routine_id.clone(),
                    status: spec.status.as_str().to_string(),
                });
            }
            if let Some(name) = patch.name.clone() {
                spec.name = name;
            }
            if let Some(status) = patch.status {
                spec.status = status;
            }
            if let Some(schedule) = patch.schedule.clone() {
                spec.schedule = schedule;
            }
            if let Some(timezone) = patch.timezone.clone() {
                spec.timezone = timezone;
            }
            if let Some(policy) = patch.misfire_policy.clone() {
                spec.misfire_policy = policy;
            }
            if let Some(entrypoint) = patch.entrypoint.clone() {
                spec.entrypoint = entrypoint;
            }
            if let Some(args) = patch.args.clone() {
                spec.args = args;
            }
            if let Some(capabilities) = patch.allowed_capabilities.clone() {
                spec.allowed_capabilities = capabilities;
            }
            if let Some(targets) = patch.output_targets.clone() {
                spec.output_targets = targets;
            }
            if let Some(budget) = patch.budget.clone() {
                spec.budget = budget;
            }
            if let Some(requires_approval) = patch.requires_approval {
                spec.requires_approval = requires_approval;
            }
            if let Some(allowed) = patch.external_integrations_allowed {
                spec.external_integrations_allowed = allowed;
            }
            let schedule = validate_routine(spec)?;
            let timing_changed = before != (spec.schedule.clone(), spec.timezone.clone(), spec.status);
            if let Some(next) = patch.next_fire_at_ms {
                record.runtime.next_fire_at_ms = Some(next);
            } else if timing_changed {
                record.runtime.next_fire_at_ms = schedule.next_after(now_ms);
                record.runtime.retry_occurrences.clear();
            }
            Ok(())
        })
        .await
    }

    /// Moves a pending or paused routine to active, scheduling from `now_ms`.
    pub async fn activate(&self, routine_id: &str, now_ms: u64) -> Result<RoutineRecord, RoutineError> {
        self.update(routine_id, |record| {
            if record.spec.status == RoutineStatus::Active {
                return Ok(());
            }
            let schedule = validate_routine(&record.spec)?;
            record.spec.status = RoutineStatus::Active;
            record.runtime.phase = RoutinePhase::Scheduled;
            record.runtime.next_fire_at_ms = schedule.next_after(now_ms);
            record.runtime.retry_occurrences.clear();
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, routine_id: &str) -> Result<Option<RoutineRecord>, RoutineError> {
        match self
            .store
            .delete(Namespace::Routine, routine_id, Expect::Any)
            .await?
        {
            Some(record) => Ok(Some(record.decode(Namespace::Routine)?)),
            None => Ok(None),
        }
    }

    pub async fn append_history(&self, event: &RoutineHistoryEvent) -> Result<(), RoutineError> {
        let key = format!(
            "{}/{:016}/{}",
            event.routine_id,
            event.fired_at_ms,
            uuid::Uuid::new_v4()
        );
        let value = encode(Namespace::RoutineHistory, &key, event)?;
        self.store
            .put(Namespace::RoutineHistory, &key, value, Expect::Absent)
            .await?;
        Ok(())
    }

    /// Newest first.
    pub async fn history(
        &self,
        routine_id: &str,
        limit: usize,
    ) -> Result<Vec<RoutineHistoryEvent>, RoutineError> {
        let mut rows = self
            .store
            .list_prefix(Namespace::RoutineHistory, &format!("{routine_id}/"))
            .await?
            .iter()
            .map(|record| record.decode::<RoutineHistoryEvent>(Namespace::RoutineHistory))
            .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by(|a, b| b.fired_at_ms.cmp(&a.fired_at_ms));
        rows.truncate(limit.clamp(1, 500));
        Ok(rows)
    }

    pub async fn put_run(&self, run: &RoutineRunRecord) -> Result<(), RoutineError> {
        let value = encode(Namespace::RoutineRun, &run.run_id, run)?;
        self.store
            .put(Namespace::RoutineRun, &run.run_id, value, Expect::Any)
            .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RoutineRunRecord>, RoutineError> {
        match self.store.get(Namespace::RoutineRun, run_id).await? {
            Some(record) => Ok(Some(record.decode(Namespace::RoutineRun)?)),
            None => Ok(None),
        }
    }

    /// Newest first, optionally filtered to one routine.
    pub async fn list_runs(
        &self,
        routine_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RoutineRunRecord>, RoutineError> {
        let mut rows = self
            .store
            .list(Namespace::RoutineRun)
            .await?
            .iter()
            .map(|record| record.decode::<RoutineRunRecord>(Namespace::RoutineRun))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(routine_id) = routine_id {
            rows.retain(|run| run.routine_id == routine_id);
        }
        rows.sort_by(|a, b| {
            b.fired_at_ms
                .cmp(&a.fired_at_ms)
                .then_with(|| b.scheduled_for_ms.cmp(&a.scheduled_for_ms))
        });
        rows.truncate(limit.clamp(1, 500));
        Ok(rows)
    }

    pub async fn update_run<F>(&self, run_id: &str, apply: F) -> Result<RoutineRunRecord, RoutineError>
    where
        F: FnMut(&mut RoutineRunRecord) -> Result<(), RoutineError>,
    {
        self.update_json(Namespace::RoutineRun, run_id, apply, || {
            RoutineError::RunNotFound {
                run_id: run_id.to_string(),
            }
        })
        .await
    }

    async fn update_json<T, F, M>(
        &self,
        namespace: Namespace,
        key: &str,
        mut apply: F,
        missing: M,
    ) -> Result<T, RoutineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut T) -> Result<(), RoutineError>,
        M: Fn() -> RoutineError,
    {
        let mut last_conflict = None;
        for _ in 0..CAS_ATTEMPTS {
            let Some(stored) = self.store.get(namespace, key).await? else {
                return Err(missing());
            };
            let mut value: T = stored.decode(namespace)?;
            apply(&mut value)?;
            let encoded = encode(namespace, key, &value)?;
            match self
                .store
                .put(namespace, key, encoded, Expect::Revision(stored.rev))
                .await
            {
                Ok(_) => return Ok(value),
                Err(err) if err.is_conflict() => last_conflict = Some(err),
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_conflict
            .map(RoutineError::from)
            .unwrap_or_else(missing))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub evaluated: usize,
    pub contended: usize,
    pub runs: Vec<RoutineRunRecord>,
    pub failures: Vec<String>,
}

struct FireContext {
    trigger_type: RoutineTriggerType,
    scheduled_for_ms: u64,
    fired_at_ms: u64,
    next_fire_at_ms: Option<u64>,
    deadline: Instant,
}

/// Lease-guarded routine firing. Any number of schedulers may run against
/// the same store; the per-routine lease decides which one fires.
#[derive(Clone)]
pub struct RoutineScheduler {
    routines: RoutineStore,
    leases: LeaseManager,
    launcher: Arc<dyn RunLauncher>,
    event_bus: EventBus,
    worker_id: String,
    config: SchedulerConfig,
    entrypoints: Arc<BTreeMap<String, EntrypointConfig>>,
}

impl RoutineScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        launcher: Arc<dyn RunLauncher>,
        event_bus: EventBus,
        worker_id: impl Into<String>,
        config: SchedulerConfig,
        entrypoints: BTreeMap<String, EntrypointConfig>,
    ) -> Self {
        Self {
            routines: RoutineStore::new(store.clone()),
            leases: LeaseManager::new(store),
            launcher,
            event_bus,
            worker_id: worker_id.into(),
            config,
            entrypoints: Arc::new(entrypoints),
        }
    }

    pub fn routines(&self) -> &RoutineStore {
        &self.routines
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(10))
    }

    /// One scheduler pass over every due routine.
    pub async fn tick(&self, now_ms: u64) -> Result<TickReport, RoutineError> {
        let mut report = TickReport::default();
        for record in self.routines.list().await? {
            if !record.is_due(now_ms) {
                continue;
            }
            report.evaluated += 1;
            match self.fire_due(record.routine_id(), now_ms).await {
                Ok(Some(runs)) => report.runs.extend(runs),
                Ok(None) => report.contended += 1,
                Err(err) => {
                    tracing::warn!(routine_id = %record.routine_id(), "routine pass failed: {err}");
                    report.failures.push(record.spec.routine_id.clone());
                }
            }
        }
        Ok(report)
    }

    /// Fires one routine if this worker wins its lease. `None` means another
    /// worker holds it.
    pub async fn fire_due(
        &self,
        routine_id: &str,
        now_ms: u64,
    ) -> Result<Option<Vec<RoutineRunRecord>>, RoutineError> {
        let lease = match self
            .leases
            .acquire(routine_id, &self.worker_id, now_ms, self.config.lease_ttl_ms)
            .await?
        {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::Contended { holder, .. } => {
                tracing::debug!(
                    routine_id,
                    worker_id = %self.worker_id,
                    holder = holder.as_deref().unwrap_or(""),
                    "routine lease contended"
                );
                return Ok(None);
            }
        };

        // Another worker may have fired it between our list and the lease.
        let Some(record) = self.routines.get(routine_id).await? else {
            self.release(&lease, now_ms).await;
            return Ok(Some(Vec::new()));
        };
        if !record.is_due(now_ms) {
            self.release(&lease, now_ms).await;
            return Ok(Some(Vec::new()));
        }
        let schedule = match validate_routine(&record.spec) {
            Ok(schedule) => schedule,
            Err(err) => {
                self.release(&lease, now_ms).await;
                return Err(err);
            }
        };

        let budget_cap = record.spec.budget.max_runs_per_trigger;
        let keep = retained_occurrences(&record.spec.misfire_policy, budget_cap);
        let due = match record.runtime.next_fire_at_ms {
            Some(next) => schedule.due_occurrences(next, now_ms, keep),
            None => DueOccurrences {
                total: 0,
                newest: Vec::new(),
                next_fire_at_ms: schedule.next_after(now_ms),
                overdue: false,
            },
        };
        let plan = resolve_misfire(
            &record.spec.misfire_policy,
            &due,
            &record.runtime.retry_occurrences,
            budget_cap,
        );

        // Advance the schedule before any launch so a crash cannot refire.
        let next_fire_at_ms = due.next_fire_at_ms;
        self.routines
            .update(routine_id, |current| {
                current.runtime.next_fire_at_ms = next_fire_at_ms;
                current.runtime.phase = RoutinePhase::Firing;
                current.runtime.lease_holder = Some(lease.holder.clone());
                current.runtime.lease_expires_at_ms = Some(lease.expires_at_ms);
                current.runtime.retry_occurrences.clear();
                Ok(())
            })
            .await?;

        if plan.dropped > 0 {
            self.record_history(RoutineHistoryEvent {
                routine_id: routine_id.to_string(),
                run_id: None,
                trigger_type: record.spec.misfire_policy.as_str().to_string(),
                run_count: plan.dropped,
                fired_at_ms: now_ms,
                status: "misfire_dropped".to_string(),
                detail: Some(format!(
                    "{} of {} due occurrences dropped",
                    plan.dropped,
                    due.total + record.runtime.retry_occurrences.len() as u64
                )),
            })
            .await;
        }
        if plan.misfired {
            self.event_bus.emit(
                "routine.misfired",
                json!({
                    "routineID": routine_id,
                    "policy": record.spec.misfire_policy.as_str(),
                    "dueCount": due.total + record.runtime.retry_occurrences.len() as u64,
                    "launchCount": plan.runs.len(),
                    "droppedCount": plan.dropped,
                    "nextFireAtMs": next_fire_at_ms,
                }),
            );
        }

        let deadline = self.lease_deadline(now_ms, &lease);
        let mut launched = Vec::new();
        let mut failed = Vec::new();
        let mut failure = None;
        for run in &plan.runs {
            if failure.is_some() {
                failed.push(run.scheduled_for_ms);
                continue;
            }
            let context = FireContext {
                trigger_type: run.trigger_type,
                scheduled_for_ms: run.scheduled_for_ms,
                fired_at_ms: now_ms,
                next_fire_at_ms,
                deadline,
            };
            let run_id = format!("rr-{routine_id}-{}", run.scheduled_for_ms);
            match self.launch_run(&record.spec, run_id, context).await {
                Ok(launched_run) => launched.push(launched_run),
                Err(err) => {
                    failed.push(run.scheduled_for_ms);
                    failure = Some(err.to_string());
                }
            }
        }

        let launched_count = launched.len();
        let misfired = plan.misfired;
        match failure {
            None => {
                self.routines
                    .update(routine_id, |current| {
                        current.runtime.phase = RoutinePhase::Fired;
                        current.runtime.lease_holder = None;
                        current.runtime.lease_expires_at_ms = None;
                        if launched_count > 0 {
                            current.runtime.last_fired_at_ms = Some(now_ms);
                        }
                        current.runtime.last_outcome = Some(format!("launched {launched_count}"));
                        current.runtime.consecutive_misfires = if misfired {
                            current.runtime.consecutive_misfires.saturating_add(1)
                        } else {
                            0
                        };
                        Ok(())
                    })
                    .await?;
                self.release(&lease, now_ms).await;
            }
            Some(detail) => {
                // The lease is left to lapse; the next pass after its TTL
                // picks the failed occurrences back up.
                let retry = failed.clone();
                self.routines
                    .update(routine_id, |current| {
                        current.runtime.phase = RoutinePhase::Misfired;
                        current.runtime.last_outcome = Some(format!("launch_failed: {detail}"));
                        current.runtime.consecutive_misfires =
                            current.runtime.consecutive_misfires.saturating_add(1);
                        current.runtime.retry_occurrences = retry.clone();
                        if launched_count > 0 {
                            current.runtime.last_fired_at_ms = Some(now_ms);
                        }
                        Ok(())
                    })
                    .await?;
                return Err(RoutineError::LaunchFailed {
                    routine_id: routine_id.to_string(),
                    detail,
                });
            }
        }
        Ok(Some(launched))
    }

    /// Manual trigger. Shares the routine lease and keeps it until TTL
    /// expiry, so a second trigger inside the TTL is rejected.
    pub async fn run_now(
        &self,
        routine_id: &str,
        now_ms: u64,
        reason: Option<String>,
    ) -> Result<RoutineRunRecord, RoutineError> {
        let record = self.routines.require(routine_id).await?;
        if record.spec.status == RoutineStatus::PendingActivation {
            return Err(RoutineError::NotActive {
                routine_id: routine_id.to_string(),
                status: record.spec.status.as_str().to_string(),
            });
        }
        let lease = match self
            .leases
            .acquire(routine_id, &self.worker_id, now_ms, self.config.lease_ttl_ms)
            .await?
        {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::Contended {
                holder,
                expires_at_ms,
            } => {
                return Err(RoutineError::AlreadyFiring {
                    routine_id: routine_id.to_string(),
                    holder,
                    lease_expires_at_ms: expires_at_ms,
                })
            }
        };
        self.routines
            .update(routine_id, |current| {
                current.runtime.lease_holder = Some(lease.holder.clone());
                current.runtime.lease_expires_at_ms = Some(lease.expires_at_ms);
                current.runtime.last_fired_at_ms = Some(now_ms);
                Ok(())
            })
            .await?;
        let context = FireContext {
            trigger_type: RoutineTriggerType::Manual,
            scheduled_for_ms: now_ms,
            fired_at_ms: now_ms,
            next_fire_at_ms: record.runtime.next_fire_at_ms,
            deadline: self.lease_deadline(now_ms, &lease),
        };
        let run_id = format!("rr-{routine_id}-manual-{now_ms}");
        let mut run = self.launch_run(&record.spec, run_id, context).await?;
        if let Some(reason) = reason.filter(|reason| !reason.trim().is_empty()) {
            if run.detail.is_none() {
                run.detail = Some(reason);
                self.routines.put_run(&run).await?;
            }
        }
        Ok(run)
    }

    /// Approves a run awaiting approval, or lifts dry-run mode from a launched
    /// dry run.
    pub async fn approve_run(
        &self,
        run_id: &str,
        reason: Option<String>,
    ) -> Result<RoutineRunRecord, RoutineError> {
        let reason = reason_or_default(reason, "approved by operator");
        let run = self
            .decide_run(run_id, RoutineRunStatus::Approved, &reason)
            .await?;
        let target = run.launcher_run_id.as_deref().unwrap_or(&run.run_id);
        if let Err(err) = self.launcher.approve(target).await {
            let detail = err.to_string();
            self.routines
                .update_run(run_id, |current| {
                    current.status = RoutineRunStatus::Failed;
                    current.detail = Some(format!("approval launch failed: {detail}"));
                    Ok(())
                })
                .await?;
            return Err(RoutineError::LaunchFailed {
                routine_id: run.routine_id,
                detail,
            });
        }
        self.event_bus.emit(
            "routine.run.approved",
            json!({
                "runID": run.run_id,
                "routineID": run.routine_id,
                "reason": reason,
            }),
        );
        Ok(run)
    }

    pub async fn deny_run(
        &self,
        run_id: &str,
        reason: Option<String>,
    ) -> Result<RoutineRunRecord, RoutineError> {
        let reason = reason_or_default(reason, "denied by operator");
        let run = self
            .decide_run(run_id, RoutineRunStatus::Denied, &reason)
            .await?;
        let target = run.launcher_run_id.as_deref().unwrap_or(&run.run_id);
        if let Err(err) = self.launcher.cancel(target, &reason).await {
            tracing::warn!(run_id, "cancelling denied run failed: {err}");
        }
        self.event_bus.emit(
            "routine.run.denied",
            json!({
                "runID": run.run_id,
                "routineID": run.routine_id,
                "reason": reason,
            }),
        );
        Ok(run)
    }

    async fn decide_run(
        &self,
        run_id: &str,
        status: RoutineRunStatus,
        reason: &str,
    ) -> Result<RoutineRunRecord, RoutineError> {
        let run = self
            .routines
            .update_run(run_id, |current| {
                let liftable_dry_run = status == RoutineRunStatus::Approved
                    && current.status == RoutineRunStatus::Launched
                    && current.dry_run;
                if current.status != RoutineRunStatus::AwaitingApproval && !liftable_dry_run {
                    return Err(RoutineError::RunNotPending {
                        run_id: run_id.to_string(),
                        status: current.status.as_str().to_string(),
                    });
                }
                current.status = status;
                if status == RoutineRunStatus::Approved {
                    current.dry_run = false;
                }
                current.detail = Some(reason.to_string());
                Ok(())
            })
            .await?;
        self.record_history(RoutineHistoryEvent {
            routine_id: run.routine_id.clone(),
            run_id: Some(run.run_id.clone()),
            trigger_type: run.trigger_type.as_str().to_string(),
            run_count: 1,
            fired_at_ms: tandem_core::now_ms(),
            status: status.as_str().to_string(),
            detail: Some(reason.to_string()),
        })
        .await;
        Ok(run)
    }

    async fn launch_run(
        &self,
        routine: &RoutineSpec,
        run_id: String,
        context: FireContext,
    ) -> Result<RoutineRunRecord, RoutineError> {
        if let Some(existing) = self.routines.get_run(&run_id).await? {
            if existing.status != RoutineRunStatus::Failed {
                return Ok(existing);
            }
        }
        let routine_id = routine.routine_id.as_str();
        let trigger = context.trigger_type.as_str();
        let mut run = RoutineRunRecord {
            run_id: run_id.clone(),
            routine_id: routine_id.to_string(),
            trigger_type: context.trigger_type,
            scheduled_for_ms: context.scheduled_for_ms,
            fired_at_ms: context.fired_at_ms,
            status: RoutineRunStatus::Blocked,
            dry_run: routine.requires_approval || !routine.external_integrations_allowed,
            capabilities: Vec::new(),
            entrypoint: routine.entrypoint.clone(),
            args: routine.args.clone(),
            launcher_run_id: None,
            session_id: None,
            detail: None,
        };

        let Some(entrypoint) = self.entrypoints.get(&routine.entrypoint) else {
            let reason = format!("unknown entrypoint `{}`", routine.entrypoint);
            run.detail = Some(reason.clone());
            self.routines.put_run(&run).await?;
            self.finish_run(&run, "routine.blocked", Some(reason.as_str())).await;
            return Ok(run);
        };
        run.capabilities = effective_capabilities(routine, entrypoint);

        let request = LaunchRequest {
            run_key: run_id.clone(),
            entrypoint: routine.entrypoint.clone(),
            prompt: routine
                .args
                .get("prompt")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|prompt| !prompt.is_empty())
                .map(ToString::to_string),
            args: routine.args.clone(),
            capabilities: run.capabilities.clone(),
            dry_run: run.dry_run,
            agent_skill: None,
            metadata: json!({
                "routineID": routine_id,
                "triggerType": trigger,
                "scheduledForMs": context.scheduled_for_ms,
                "outputTargets": routine.output_targets,
                "budget": routine.budget,
            }),
        };
        match launch_with_retry(
            self.launcher.as_ref(),
            &request,
            self.config.launch_max_attempts,
            self.config.launch_backoff_ms,
            Some(context.deadline),
        )
        .await
        {
            Ok(receipt) => {
                run.launcher_run_id = Some(receipt.run_id);
                run.session_id = receipt.session_id;
                if routine.requires_approval {
                    let reason = "manual approval required before side effects".to_string();
                    run.status = RoutineRunStatus::AwaitingApproval;
                    run.detail = Some(reason.clone());
                    self.routines.put_run(&run).await?;
                    self.finish_run(&run, "routine.approval_required", Some(reason.as_str()))
                        .await;
                } else {
                    run.status = RoutineRunStatus::Launched;
                    self.routines.put_run(&run).await?;
                    self.record_run_history(&run, None).await;
                    self.event_bus.emit(
                        "routine.fired",
                        json!({
                            "routineID": routine_id,
                            "runID": run.run_id,
                            "runCount": 1,
                            "triggerType": trigger,
                            "scheduledAtMs": context.scheduled_for_ms,
                            "nextFireAtMs": context.next_fire_at_ms,
                            "dryRun": run.dry_run,
                        }),
                    );
                    emit_event(
                        Level::INFO,
                        ProcessKind::Scheduler,
                        ObservabilityEvent::new("routine.fired", "scheduler")
                            .routine(routine_id)
                            .run(&run.run_id)
                            .status(run.status.as_str()),
                    );
                }
                Ok(run)
            }
            Err(err) => {
                let detail = err.to_string();
                run.status = RoutineRunStatus::Failed;
                run.detail = Some(detail.clone());
                self.routines.put_run(&run).await?;
                self.finish_run(&run, "routine.blocked", Some(detail.as_str())).await;
                emit_event(
                    Level::WARN,
                    ProcessKind::Scheduler,
                    ObservabilityEvent::new("routine.launch_failed", "scheduler")
                        .routine(routine_id)
                        .run(&run.run_id)
                        .error_code("ROUTINE_LAUNCH_FAILED")
                        .detail(&detail),
                );
                Err(RoutineError::LaunchFailed {
                    routine_id: routine_id.to_string(),
                    detail,
                })
            }
        }
    }

    async fn finish_run(&self, run: &RoutineRunRecord, event_type: &str, reason: Option<&str>) {
        self.record_run_history(run, reason).await;
        self.event_bus.emit(
            event_type,
            json!({
                "routineID": run.routine_id,
                "runID": run.run_id,
                "runCount": 1,
                "triggerType": run.trigger_type.as_str(),
                "reason": reason,
            }),
        );
    }

    async fn record_run_history(&self, run: &RoutineRunRecord, detail: Option<&str>) {
        self.record_history(RoutineHistoryEvent {
            routine_id: run.routine_id.clone(),
            run_id: Some(run.run_id.clone()),
            trigger_type: run.trigger_type.as_str().to_string(),
            run_count: 1,
            fired_at_ms: run.fired_at_ms,
            status: run.status.as_str().to_string(),
            detail: detail.map(ToString::to_string),
        })
        .await;
    }

    async fn record_history(&self, event: RoutineHistoryEvent) {
        if let Err(err) = self.routines.append_history(&event).await {
            tracing::warn!(routine_id = %event.routine_id, "failed to record routine history: {err}");
        }
    }

    async fn release(&self, lease: &Lease, now_ms: u64) {
        match self.leases.release(lease, now_ms).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(key = %lease.key, "lease already lost at release"),
            Err(err) => tracing::warn!(key = %lease.key, "lease release failed: {err}"),
        }
    }

    fn lease_deadline(&self, now_ms: u64, lease: &Lease) -> Instant {
        let remaining = lease
            .expires_at_ms
            .saturating_sub(now_ms)
            .saturating_sub(LEASE_SAFETY_MARGIN_MS);
        Instant::now() + Duration::from_millis(remaining)
    }
}

fn reason_or_default(input: Option<String>, fallback: &str) -> String {
    input
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
