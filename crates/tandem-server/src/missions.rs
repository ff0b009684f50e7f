use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tandem_core::{EventBus, Expect, Namespace, StateStore, StoreError};
use tandem_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tandem_orchestrator::{
    DefaultMissionReducer, MissionCommand, MissionEvent, MissionReducer, MissionSpec,
    MissionState, ReducerError, WorkItemPlan,
};
use tokio::sync::Mutex;
use tracing::Level;

#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    #[error("mission `{mission_id}` not found")]
    NotFound { mission_id: String },
    #[error("mission `{mission_id}` already exists")]
    AlreadyExists { mission_id: String },
    #[error("mission `{mission_id}` was changed by another writer")]
    Conflict { mission_id: String },
    #[error(transparent)]
    Reducer(#[from] ReducerError),
    #[error("mission persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl MissionError {
    /// Conflicts a caller can resolve by re-reading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            MissionError::Conflict { .. }
                | MissionError::Reducer(ReducerError::RevisionConflict { .. })
        )
    }
}

#[derive(Debug, Clone)]
pub struct MissionOutcome {
    pub mission: MissionState,
    pub commands: Vec<MissionCommand>,
}

/// Persists reducer output. Writes to one mission are serialized in-process
/// and guarded by the store revision across processes.
#[derive(Clone)]
pub struct MissionService {
    store: Arc<dyn StateStore>,
    event_bus: EventBus,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl MissionService {
    pub fn new(store: Arc<dyn StateStore>, event_bus: EventBus) -> Self {
        Self {
            store,
            event_bus,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_for(&self, mission_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(mission_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the mission's lock entry once no other caller holds or waits on it.
    async fn release_lock(&self, mission_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks
            .get(mission_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(mission_id);
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn create(
        &self,
        spec: MissionSpec,
        work_items: Vec<WorkItemPlan>,
        start: bool,
    ) -> Result<MissionOutcome, MissionError> {
        let mission_id = spec.mission_id.clone();
        let mut state = DefaultMissionReducer::init(spec);
        let mut commands = Vec::new();
        if !work_items.is_empty() {
            let (next, emitted) = DefaultMissionReducer::reduce(
                &state,
                MissionEvent::WorkItemsPlanned {
                    mission_id: mission_id.clone(),
                    work_items,
                },
            )?;
            state = next;
            commands.extend(emitted);
        }
        if start {
            let (next, emitted) = DefaultMissionReducer::reduce(
                &state,
                MissionEvent::MissionStarted {
                    mission_id: mission_id.clone(),
                },
            )?;
            state = next;
            commands.extend(emitted);
        }

        let value = serde_json::to_value(&state).map_err(|err| StoreError::Decode {
            namespace: Namespace::Mission,
            key: mission_id.clone(),
            detail: err.to_string(),
        })?;
        match self
            .store
            .put(Namespace::Mission, &mission_id, value, Expect::Absent)
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_conflict() => {
                return Err(MissionError::AlreadyExists { mission_id });
            }
            Err(err) => return Err(err.into()),
        }

        self.event_bus.emit(
            "mission.created",
            json!({
                "missionID": mission_id,
                "workItemCount": state.work_items.len(),
            }),
        );
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("mission.created", "missions")
                .mission(&mission_id)
                .status(state.status.as_str()),
        );
        Ok(MissionOutcome {
            mission: state,
            commands,
        })
    }

    pub async fn get(&self, mission_id: &str) -> Result<Option<MissionState>, MissionError> {
        let Some(stored) = self.store.get(Namespace::Mission, mission_id).await? else {
            return Ok(None);
        };
        Ok(Some(stored.decode(Namespace::Mission)?))
    }

    pub async fn require(&self, mission_id: &str) -> Result<MissionState, MissionError> {
        self.get(mission_id)
            .await?
            .ok_or_else(|| MissionError::NotFound {
                mission_id: mission_id.to_string(),
            })
    }

    pub async fn list(&self) -> Result<Vec<MissionState>, MissionError> {
        let mut missions = self
            .store
            .list(Namespace::Mission)
            .await?
            .iter()
            .map(|stored| stored.decode::<MissionState>(Namespace::Mission))
            .collect::<Result<Vec<_>, _>>()?;
        missions.sort_by(|a, b| a.mission_id.cmp(&b.mission_id));
        Ok(missions)
    }

    /// Reduces `event` against the stored mission and persists the result.
    /// `expected_revision` rejects callers working from a stale snapshot.
    pub async fn apply_event(
        &self,
        mission_id: &str,
        event: MissionEvent,
        expected_revision: Option<u64>,
    ) -> Result<MissionOutcome, MissionError> {
        let lock = self.lock_for(mission_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(mission_id, event, expected_revision).await
        };
        self.release_lock(mission_id, lock).await;
        result
    }

    async fn apply_locked(
        &self,
        mission_id: &str,
        event: MissionEvent,
        expected_revision: Option<u64>,
    ) -> Result<MissionOutcome, MissionError> {
        let Some(stored) = self.store.get(Namespace::Mission, mission_id).await? else {
            return Err(MissionError::NotFound {
                mission_id: mission_id.to_string(),
            });
        };
        let current: MissionState = stored.decode(Namespace::Mission)?;
        let kind = event.kind();
        let (next, commands) = DefaultMissionReducer::apply(&current, expected_revision, event)?;

        let value = serde_json::to_value(&next).map_err(|err| StoreError::Decode {
            namespace: Namespace::Mission,
            key: mission_id.to_string(),
            detail: err.to_string(),
        })?;
        match self
            .store
            .put(
                Namespace::Mission,
                mission_id,
                value,
                Expect::Revision(stored.rev),
            )
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_conflict() => {
                return Err(MissionError::Conflict {
                    mission_id: mission_id.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        }

        tracing::debug!(
            mission_id,
            event = kind,
            revision = next.revision,
            commands = commands.len(),
            "mission event applied"
        );
        self.event_bus.emit(
            "mission.updated",
            json!({
                "missionID": mission_id,
                "revision": next.revision,
                "status": next.status,
                "commandCount": commands.len(),
            }),
        );
        Ok(MissionOutcome {
            mission: next,
            commands,
        })
    }
}
