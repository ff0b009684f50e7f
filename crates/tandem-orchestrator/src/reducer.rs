use serde::Serialize;
use serde_json::{json, Value};

use crate::board::{
    dependencies_done, match_assignee, refresh_blocked, validate_plan, AssigneeMatch, PlanError,
};
use crate::gate::{gates_satisfied, GateKind, GateOutcome, GateRecord};
use crate::{
    ApprovalState, ArtifactIndexEntry, BlockedReason, MissionCommand, MissionEvent, MissionSpec,
    MissionState, MissionStatus, TimerPurpose, WorkItem, WorkItemStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReducerError {
    #[error("mission revision conflict: expected {expected}, current {current}")]
    RevisionConflict { expected: u64, current: u64 },
    #[error("event targets mission `{event_mission_id}` but state is `{mission_id}`")]
    MissionMismatch {
        mission_id: String,
        event_mission_id: String,
    },
    #[error("unknown work item `{work_item_id}`")]
    UnknownWorkItem { work_item_id: String },
    #[error("invalid work item plan: {0}")]
    InvalidPlan(#[from] PlanError),
    #[error("mission is {} and accepts no further events", status.as_str())]
    MissionClosed { status: MissionStatus },
    #[error("`{event}` is not valid while mission is {}", status.as_str())]
    InvalidTransition {
        event: String,
        status: MissionStatus,
    },
}

pub type ReduceOutput = (MissionState, Vec<MissionCommand>);

pub trait MissionReducer {
    fn init(spec: MissionSpec) -> MissionState;
    fn on_event(state: &MissionState, event: MissionEvent) -> Result<ReduceOutput, ReducerError>;
}

pub struct DefaultMissionReducer;

impl MissionReducer for DefaultMissionReducer {
    fn init(spec: MissionSpec) -> MissionState {
        MissionState {
            mission_id: spec.mission_id.clone(),
            status: MissionStatus::Draft,
            status_reason: None,
            available_skills: spec.capabilities.skill_tags.iter().cloned().collect(),
            spec,
            work_items: Vec::new(),
            revision: 1,
            artifacts: Vec::new(),
            gate_log: Vec::new(),
            timers: Default::default(),
            resources: Default::default(),
        }
    }

    fn on_event(state: &MissionState, event: MissionEvent) -> Result<ReduceOutput, ReducerError> {
        Self::reduce(state, event)
    }
}

impl DefaultMissionReducer {
    /// Applies `event` when the caller's view of the mission is current.
    pub fn apply(
        state: &MissionState,
        expected_revision: Option<u64>,
        event: MissionEvent,
    ) -> Result<ReduceOutput, ReducerError> {
        if let Some(expected) = expected_revision {
            if expected != state.revision {
                return Err(ReducerError::RevisionConflict {
                    expected,
                    current: state.revision,
                });
            }
        }
        Self::reduce(state, event)
    }

    /// Folds `events` over a freshly initialized mission.
    pub fn replay<I>(spec: MissionSpec, events: I) -> Result<MissionState, ReducerError>
    where
        I: IntoIterator<Item = MissionEvent>,
    {
        let mut state = Self::init(spec);
        for event in events {
            state = Self::reduce(&state, event)?.0;
        }
        Ok(state)
    }

    pub fn reduce(state: &MissionState, event: MissionEvent) -> Result<ReduceOutput, ReducerError> {
        if event.mission_id() != state.mission_id {
            return Err(ReducerError::MissionMismatch {
                mission_id: state.mission_id.clone(),
                event_mission_id: event.mission_id().to_string(),
            });
        }
        if state.status.is_terminal() {
            return Err(ReducerError::MissionClosed {
                status: state.status,
            });
        }
        if let Some(work_item_id) = event.work_item_id() {
            if state.work_item(work_item_id).is_none() {
                return Err(ReducerError::UnknownWorkItem {
                    work_item_id: work_item_id.to_string(),
                });
            }
        }

        let mut step = Step {
            next: state.clone(),
            commands: Vec::new(),
        };
        step.next.revision = state.revision.saturating_add(1);
        step.handle(event)?;
        step.settle()?;
        Ok((step.next, step.commands))
    }
}

struct Step {
    next: MissionState,
    commands: Vec<MissionCommand>,
}

impl Step {
    fn notice(&mut self, event_type: &str, properties: Value) {
        self.commands.push(MissionCommand::EmitNotice {
            mission_id: self.next.mission_id.clone(),
            event_type: event_type.to_string(),
            properties,
        });
    }

    fn out_of_phase(&mut self, work_item_id: &str, event: &str) {
        let status = self
            .next
            .work_item(work_item_id)
            .map(|item| item.status.as_str())
            .unwrap_or("unknown");
        self.notice(
            "mission.work_item.out_of_phase",
            json!({
                "workItemID": work_item_id,
                "event": event,
                "status": status,
            }),
        );
    }

    fn item(&mut self, work_item_id: &str) -> Result<&mut WorkItem, ReducerError> {
        self.next
            .work_item_mut(work_item_id)
            .ok_or_else(|| ReducerError::UnknownWorkItem {
                work_item_id: work_item_id.to_string(),
            })
    }

    fn invalid(&self, event: &MissionEvent) -> ReducerError {
        ReducerError::InvalidTransition {
            event: event.kind().to_string(),
            status: self.next.status,
        }
    }

    fn handle(&mut self, event: MissionEvent) -> Result<(), ReducerError> {
        let revision = self.next.revision;
        let kind = event.kind();
        match event {
            MissionEvent::MissionStarted { .. } => {
                if self.next.status != MissionStatus::Draft {
                    return Err(self.invalid(&event));
                }
                self.next.status = MissionStatus::Running;
                self.next.status_reason = None;
            }
            MissionEvent::MissionPaused {
                ref reason,
                resume_after_ms,
                ..
            } => {
                if self.next.status != MissionStatus::Running {
                    return Err(self.invalid(&event));
                }
                self.next.status = MissionStatus::Paused;
                self.next.status_reason = Some(reason.clone());
                if let Some(delay_ms) = resume_after_ms {
                    let timer_id = format!("resume-{revision}");
                    self.next
                        .timers
                        .insert(timer_id.clone(), TimerPurpose::ResumeMission);
                    self.commands.push(MissionCommand::ScheduleTimer {
                        mission_id: self.next.mission_id.clone(),
                        timer_id,
                        delay_ms,
                    });
                }
            }
            MissionEvent::MissionResumed { .. } => {
                if self.next.status != MissionStatus::Paused {
                    return Err(self.invalid(&event));
                }
                self.resume();
            }
            MissionEvent::MissionCanceled { reason, .. } => {
                self.next.status = MissionStatus::Cancelled;
                self.next.status_reason = Some(reason.clone());
                self.next.timers.clear();
                let mut stopped = Vec::new();
                for item in &mut self.next.work_items {
                    if matches!(item.status, WorkItemStatus::Done | WorkItemStatus::Cancelled) {
                        continue;
                    }
                    item.status = WorkItemStatus::Cancelled;
                    if let Some(run_id) = item.run_id.clone() {
                        stopped.push((item.work_item_id.clone(), run_id));
                    }
                }
                for (work_item_id, run_id) in stopped {
                    self.notice(
                        "mission.work_item.cancelled",
                        json!({
                            "workItemID": work_item_id,
                            "runID": run_id,
                            "reason": reason,
                        }),
                    );
                }
                self.notice(
                    "mission.cancelled",
                    json!({
                        "missionID": self.next.mission_id,
                        "reason": reason,
                    }),
                );
            }
            MissionEvent::WorkItemsPlanned { work_items, .. } => {
                validate_plan(&self.next.work_items, &work_items)?;
                self.next
                    .work_items
                    .extend(work_items.into_iter().map(WorkItem::from_plan));
            }
            MissionEvent::RunStarted {
                work_item_id,
                run_id,
                ..
            } => {
                let item = self.item(&work_item_id)?;
                match item.status {
                    WorkItemStatus::InProgress => item.run_id = Some(run_id),
                    WorkItemStatus::Rework => {
                        item.status = WorkItemStatus::InProgress;
                        item.attempt = item.attempt.saturating_add(1);
                        item.run_id = Some(run_id);
                    }
                    _ => self.out_of_phase(&work_item_id, kind),
                }
            }
            MissionEvent::RunFinished {
                work_item_id,
                run_id,
                status,
                ..
            } => {
                let item = self.item(&work_item_id)?;
                let stale_run = item
                    .run_id
                    .as_deref()
                    .is_some_and(|current| current != run_id);
                if item.status != WorkItemStatus::InProgress || stale_run {
                    self.out_of_phase(&work_item_id, kind);
                } else if is_success_status(&status) {
                    enter_review(item, revision);
                    self.notice(
                        "mission.work_item.review_requested",
                        json!({
                            "workItemID": work_item_id,
                            "runID": run_id,
                            "reason": "run_finished",
                        }),
                    );
                } else {
                    item.status = WorkItemStatus::Rework;
                    self.notice(
                        "mission.work_item.rework_requested",
                        json!({
                            "workItemID": work_item_id,
                            "reason": "run_failed",
                            "runStatus": status,
                        }),
                    );
                }
            }
            MissionEvent::ToolResult {
                work_item_id,
                run_id,
                tool,
                artifact_ref,
                ..
            } => {
                let mission_id = self.next.mission_id.clone();
                let item = self.item(&work_item_id)?;
                if item.status != WorkItemStatus::InProgress {
                    self.out_of_phase(&work_item_id, kind);
                    return Ok(());
                }
                let sensitive = item.is_sensitive_tool(&tool);
                let mut persisted = None;
                if let Some(artifact_ref) = artifact_ref {
                    if !item.artifact_refs.contains(&artifact_ref) {
                        item.artifact_refs.push(artifact_ref.clone());
                        persisted = Some(artifact_ref);
                    }
                }
                if sensitive {
                    enter_review(item, revision);
                }
                if let Some(artifact_ref) = persisted {
                    self.next.artifacts.push(ArtifactIndexEntry {
                        work_item_id: work_item_id.clone(),
                        artifact_ref: artifact_ref.clone(),
                    });
                    self.commands.push(MissionCommand::PersistArtifact {
                        mission_id,
                        work_item_id: work_item_id.clone(),
                        artifact_ref,
                        metadata: Some(json!({ "tool": tool, "runID": run_id })),
                    });
                }
                if sensitive {
                    self.notice(
                        "mission.work_item.review_requested",
                        json!({
                            "workItemID": work_item_id,
                            "runID": run_id,
                            "reason": "sensitive_tool",
                            "tool": tool,
                        }),
                    );
                }
            }
            MissionEvent::ApprovalGranted {
                work_item_id,
                approval_id,
                ..
            } => {
                let item = self.item(&work_item_id)?;
                match item.approval {
                    ApprovalState::Pending | ApprovalState::Denied => {
                        item.approval = ApprovalState::Granted;
                        if matches!(item.blocked_reason, Some(BlockedReason::ApprovalDenied { .. }))
                        {
                            item.status = WorkItemStatus::Pending;
                            item.blocked_reason = None;
                        }
                        self.notice(
                            "mission.work_item.approved",
                            json!({
                                "workItemID": work_item_id,
                                "approvalID": approval_id,
                            }),
                        );
                    }
                    _ => self.out_of_phase(&work_item_id, kind),
                }
            }
            MissionEvent::ApprovalDenied {
                work_item_id,
                approval_id,
                reason,
                ..
            } => {
                let item = self.item(&work_item_id)?;
                if item.approval != ApprovalState::Pending {
                    self.out_of_phase(&work_item_id, kind);
                    return Ok(());
                }
                item.approval = ApprovalState::Denied;
                item.status = WorkItemStatus::Blocked;
                item.blocked_reason = Some(BlockedReason::ApprovalDenied {
                    reason: reason.clone(),
                });
                self.notice(
                    "mission.work_item.blocked",
                    json!({
                        "workItemID": work_item_id,
                        "approvalID": approval_id,
                        "reason": reason,
                    }),
                );
            }
            MissionEvent::TimerFired { timer_id, .. } => {
                match self.next.timers.remove(&timer_id) {
                    Some(TimerPurpose::ResumeMission)
                        if self.next.status == MissionStatus::Paused =>
                    {
                        self.resume();
                    }
                    _ => self.notice(
                        "mission.timer.stale",
                        json!({
                            "timerID": timer_id,
                            "status": self.next.status.as_str(),
                        }),
                    ),
                }
            }
            MissionEvent::ResourceChanged { key, rev, .. } => {
                self.next.resources.insert(key, rev);
            }
            MissionEvent::CapabilitiesUpdated { skill_tags, .. } => {
                self.next.available_skills = skill_tags.into_iter().collect();
            }
            MissionEvent::GateResult {
                work_item_id,
                gate,
                outcome,
                reason,
                reviewer,
                ..
            } => {
                self.next.gate_log.push(GateRecord {
                    work_item_id: work_item_id.clone(),
                    gate,
                    outcome,
                    reason: reason.clone(),
                    reviewer: reviewer.clone(),
                    revision,
                });
                self.gate_result(&work_item_id, gate, outcome, reason, kind)?;
            }
            MissionEvent::WorkItemResubmitted {
                work_item_id, note, ..
            } => {
                let item = self.item(&work_item_id)?;
                if item.status != WorkItemStatus::Rework {
                    self.out_of_phase(&work_item_id, kind);
                    return Ok(());
                }
                self.start_run(&work_item_id, item_skill(&self.next, &work_item_id), note)?;
            }
            MissionEvent::WorkItemCancelled {
                work_item_id,
                reason,
                ..
            } => {
                let item = self.item(&work_item_id)?;
                if matches!(item.status, WorkItemStatus::Done | WorkItemStatus::Cancelled) {
                    self.out_of_phase(&work_item_id, kind);
                    return Ok(());
                }
                item.status = WorkItemStatus::Cancelled;
                let required = item.required;
                let run_id = item.run_id.clone();
                self.notice(
                    "mission.work_item.cancelled",
                    json!({
                        "workItemID": work_item_id,
                        "runID": run_id,
                        "reason": reason,
                    }),
                );
                if required {
                    self.next.status = MissionStatus::Failed;
                    self.next.status_reason =
                        Some(format!("required work item `{work_item_id}` was cancelled"));
                    self.notice(
                        "mission.failed",
                        json!({
                            "missionID": self.next.mission_id,
                            "workItemID": work_item_id,
                            "reason": reason,
                        }),
                    );
                }
            }
        }
        Ok(())
    }

    fn gate_result(
        &mut self,
        work_item_id: &str,
        gate: GateKind,
        outcome: GateOutcome,
        reason: Option<String>,
        kind: &str,
    ) -> Result<(), ReducerError> {
        let item = self.item(work_item_id)?;
        if item.status != WorkItemStatus::Review || !item.gates.contains(&gate) {
            self.out_of_phase(work_item_id, kind);
            return Ok(());
        }
        match outcome {
            GateOutcome::Pass => {
                if !item.gate_outcomes.contains(&gate) {
                    item.gate_outcomes.push(gate);
                }
                if gates_satisfied(item) {
                    item.status = WorkItemStatus::Done;
                    let run_id = item.run_id.clone();
                    self.notice(
                        "mission.work_item.completed",
                        json!({
                            "workItemID": work_item_id,
                            "runID": run_id,
                        }),
                    );
                }
            }
            GateOutcome::Fail => {
                item.status = WorkItemStatus::Rework;
                item.gate_outcomes.clear();
                item.review_entered_at = None;
                self.notice(
                    "mission.work_item.gate_failed",
                    json!({
                        "workItemID": work_item_id,
                        "gate": gate.as_str(),
                        "reason": reason,
                    }),
                );
            }
            GateOutcome::NeedsMoreInfo => {
                self.notice(
                    "mission.work_item.needs_more_info",
                    json!({
                        "workItemID": work_item_id,
                        "gate": gate.as_str(),
                        "reason": reason,
                    }),
                );
            }
        }
        Ok(())
    }

    fn resume(&mut self) {
        self.next.status = MissionStatus::Running;
        self.next.status_reason = None;
        self.next
            .timers
            .retain(|_, purpose| *purpose != TimerPurpose::ResumeMission);
    }

    fn start_run(
        &mut self,
        work_item_id: &str,
        agent_skill: Option<String>,
        note: Option<String>,
    ) -> Result<(), ReducerError> {
        let mission_id = self.next.mission_id.clone();
        let goal = self.next.spec.goal.clone();
        let capabilities = self.next.spec.capabilities.allowed_tools.clone();
        let item = self.item(work_item_id)?;
        item.status = WorkItemStatus::InProgress;
        item.attempt = item.attempt.saturating_add(1);
        item.assigned_skill = agent_skill.clone();
        item.run_id = None;
        let mut prompt = format!("{goal}\n\nWork item: {}", item.title);
        if let Some(detail) = item.detail.as_deref() {
            prompt.push_str(&format!("\n{detail}"));
        }
        if let Some(note) = note.as_deref() {
            prompt.push_str(&format!("\n\nRework note: {note}"));
        }
        let run_key = item.run_key(&mission_id);
        self.commands.push(MissionCommand::StartRun {
            mission_id,
            work_item_id: work_item_id.to_string(),
            run_key,
            agent_skill,
            prompt,
            capabilities,
        });
        Ok(())
    }

    /// Blocked propagation, completion check and dispatch of ready items.
    fn settle(&mut self) -> Result<(), ReducerError> {
        if self.next.status.is_terminal() || self.next.status == MissionStatus::Draft {
            return Ok(());
        }
        for change in refresh_blocked(&mut self.next.work_items) {
            let event_type = if change.blocked {
                "mission.work_item.blocked"
            } else {
                "mission.work_item.unblocked"
            };
            self.notice(
                event_type,
                json!({
                    "workItemID": change.work_item_id,
                    "blockedBy": change.blocker,
                }),
            );
        }
        if self.next.required_items_done() {
            self.next.status = MissionStatus::Complete;
            self.next.status_reason = None;
            self.notice(
                "mission.completed",
                json!({
                    "missionID": self.next.mission_id,
                }),
            );
            return Ok(());
        }
        if self.next.status != MissionStatus::Running {
            return Ok(());
        }

        let ready: Vec<(String, AssigneeMatch, bool)> = self
            .next
            .work_items
            .iter()
            .filter(|item| {
                item.status == WorkItemStatus::Pending
                    && dependencies_done(item, &self.next.work_items)
            })
            .map(|item| {
                (
                    item.work_item_id.clone(),
                    match_assignee(item, &self.next.available_skills),
                    item.requires_approval && item.approval != ApprovalState::Granted,
                )
            })
            .collect();

        for (work_item_id, assignee, needs_approval) in ready {
            let agent_skill = match assignee {
                AssigneeMatch::NoMatch => continue,
                AssigneeMatch::Unconstrained => None,
                AssigneeMatch::Skill(skill) => Some(skill),
            };
            if needs_approval {
                self.request_approval(&work_item_id);
                continue;
            }
            self.start_run(&work_item_id, agent_skill, None)?;
        }
        Ok(())
    }

    fn request_approval(&mut self, work_item_id: &str) {
        let mission_id = self.next.mission_id.clone();
        let Some(item) = self.next.work_item_mut(work_item_id) else {
            return;
        };
        if item.approval != ApprovalState::NotRequested {
            return;
        }
        item.approval = ApprovalState::Pending;
        let summary = format!("Approval required before starting `{}`", item.title);
        self.commands.push(MissionCommand::RequestApproval {
            mission_id,
            work_item_id: work_item_id.to_string(),
            kind: "dispatch".to_string(),
            summary,
        });
    }
}

fn enter_review(item: &mut WorkItem, revision: u64) {
    item.status = WorkItemStatus::Review;
    item.review_entered_at = Some(revision);
    item.gate_outcomes.clear();
}

fn item_skill(state: &MissionState, work_item_id: &str) -> Option<String> {
    state
        .work_item(work_item_id)
        .and_then(|item| item.assigned_skill.clone())
}

fn is_success_status(status: &str) -> bool {
    matches!(
        status.to_ascii_lowercase().as_str(),
        "ok" | "success" | "passed" | "completed"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkItemPlan;

    const MISSION: &str = "m-1";

    fn spec() -> MissionSpec {
        let mut spec = MissionSpec::with_id(MISSION, "Default flow", "Ship with gates");
        spec.capabilities.allowed_tools = vec!["read".to_string(), "write".to_string()];
        spec
    }

    fn planned(plans: Vec<WorkItemPlan>) -> MissionState {
        let state = DefaultMissionReducer::init(spec());
        let (state, _) = DefaultMissionReducer::reduce(
            &state,
            MissionEvent::WorkItemsPlanned {
                mission_id: MISSION.to_string(),
                work_items: plans,
            },
        )
        .expect("plan");
        state
    }

    fn started(plans: Vec<WorkItemPlan>) -> (MissionState, Vec<MissionCommand>) {
        let state = planned(plans);
        DefaultMissionReducer::reduce(
            &state,
            MissionEvent::MissionStarted {
                mission_id: MISSION.to_string(),
            },
        )
        .expect("start")
    }

    fn step(state: &MissionState, event: MissionEvent) -> (MissionState, Vec<MissionCommand>) {
        DefaultMissionReducer::reduce(state, event).expect("event accepted")
    }

    fn started_items(commands: &[MissionCommand]) -> Vec<String> {
        commands
            .iter()
            .filter_map(|command| match command {
                MissionCommand::StartRun { work_item_id, .. } => Some(work_item_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn has_notice(commands: &[MissionCommand], wanted: &str) -> bool {
        commands.iter().any(|command| {
            matches!(command, MissionCommand::EmitNotice { event_type, .. } if event_type == wanted)
        })
    }

    fn run_finished(work_item_id: &str, status: &str) -> MissionEvent {
        MissionEvent::RunFinished {
            mission_id: MISSION.to_string(),
            work_item_id: work_item_id.to_string(),
            run_id: format!("run-{work_item_id}"),
            status: status.to_string(),
        }
    }

    fn gate(work_item_id: &str, gate: GateKind, outcome: GateOutcome) -> MissionEvent {
        MissionEvent::GateResult {
            mission_id: MISSION.to_string(),
            work_item_id: work_item_id.to_string(),
            gate,
            outcome,
            reason: Some("checked".to_string()),
            reviewer: Some("reviewer-1".to_string()),
        }
    }

    #[test]
    fn init_starts_in_draft_at_revision_one() {
        let state = DefaultMissionReducer::init(spec());
        assert_eq!(state.mission_id, MISSION);
        assert_eq!(state.status, MissionStatus::Draft);
        assert_eq!(state.revision, 1);
        assert!(state.work_items.is_empty());
    }

    #[test]
    fn mission_without_required_items_completes_on_start() {
        let (state, commands) = started(vec![WorkItemPlan::new("a", "Polish").optional()]);
        assert_eq!(state.status, MissionStatus::Complete);
        assert!(started_items(&commands).is_empty());
        assert!(has_notice(&commands, "mission.completed"));

        let (empty, _) = step(
            &DefaultMissionReducer::init(spec()),
            MissionEvent::MissionStarted {
                mission_id: MISSION.to_string(),
            },
        );
        assert_eq!(empty.status, MissionStatus::Complete);
    }

    #[test]
    fn start_dispatches_only_items_with_done_dependencies() {
        let (state, commands) = started(vec![
            WorkItemPlan::new("a", "Research"),
            WorkItemPlan::new("b", "Draft").depends_on(["a"]),
        ]);
        assert_eq!(started_items(&commands), vec!["a"]);
        assert_eq!(state.work_item("a").map(|i| i.status), Some(WorkItemStatus::InProgress));
        assert_eq!(state.work_item("b").map(|i| i.status), Some(WorkItemStatus::Pending));
        match &commands[0] {
            MissionCommand::StartRun { run_key, capabilities, .. } => {
                assert_eq!(run_key, "m-1:a:1");
                assert_eq!(capabilities, &vec!["read".to_string(), "write".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn dependency_order_is_respected_end_to_end() {
        let (state, _) = started(vec![
            WorkItemPlan::new("a", "Research"),
            WorkItemPlan::new("b", "Draft").depends_on(["a"]),
        ]);
        let (state, commands) = step(&state, run_finished("a", "ok"));
        assert!(started_items(&commands).is_empty());
        let (state, commands) = step(&state, gate("a", GateKind::Review, GateOutcome::Pass));
        assert_eq!(state.work_item("a").map(|i| i.status), Some(WorkItemStatus::Done));
        assert_eq!(started_items(&commands), vec!["b"]);
        assert!(has_notice(&commands, "mission.work_item.completed"));
    }

    #[test]
    fn revision_increments_by_one_per_accepted_event() {
        let (state, _) = started(vec![WorkItemPlan::new("a", "Research")]);
        assert_eq!(state.revision, 3);
        let (next, _) = step(
            &state,
            MissionEvent::ResourceChanged {
                mission_id: MISSION.to_string(),
                key: "repo/main".to_string(),
                rev: 7,
            },
        );
        assert_eq!(next.revision, 4);
        assert_eq!(next.resources.get("repo/main"), Some(&7));
    }

    #[test]
    fn rejected_events_leave_state_untouched() {
        let (state, _) = started(vec![WorkItemPlan::new("a", "Research")]);
        let before = state.clone();
        let err = DefaultMissionReducer::apply(
            &state,
            Some(1),
            MissionEvent::MissionResumed {
                mission_id: MISSION.to_string(),
            },
        )
        .expect_err("stale revision");
        assert_eq!(
            err,
            ReducerError::RevisionConflict {
                expected: 1,
                current: 3
            }
        );
        let err = DefaultMissionReducer::reduce(
            &state,
            MissionEvent::RunStarted {
                mission_id: MISSION.to_string(),
                work_item_id: "ghost".to_string(),
                run_id: "r".to_string(),
            },
        )
        .expect_err("unknown item");
        assert!(matches!(err, ReducerError::UnknownWorkItem { .. }));
        let err = DefaultMissionReducer::reduce(
            &state,
            MissionEvent::MissionStarted {
                mission_id: "other".to_string(),
            },
        )
        .expect_err("mismatch");
        assert!(matches!(err, ReducerError::MissionMismatch { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn planning_rejects_cycles() {
        let state = DefaultMissionReducer::init(spec());
        let err = DefaultMissionReducer::reduce(
            &state,
            MissionEvent::WorkItemsPlanned {
                mission_id: MISSION.to_string(),
                work_items: vec![
                    WorkItemPlan::new("a", "A").depends_on(["b"]),
                    WorkItemPlan::new("b", "B").depends_on(["a"]),
                ],
            },
        )
        .expect_err("cycle");
        assert!(matches!(
            err,
            ReducerError::InvalidPlan(PlanError::CycleDetected { .. })
        ));
    }

    #[test]
    fn gate_fail_rework_resubmit_keeps_artifacts() {
        let (state, _) = started(vec![WorkItemPlan::new("a", "Patch")]);
        let (state, commands) = step(
            &state,
            MissionEvent::ToolResult {
                mission_id: MISSION.to_string(),
                work_item_id: "a".to_string(),
                run_id: "run-a".to_string(),
                tool: "read".to_string(),
                artifact_ref: Some("artifact://notes".to_string()),
            },
        );
        assert!(commands
            .iter()
            .any(|command| matches!(command, MissionCommand::PersistArtifact { .. })));
        let (state, _) = step(&state, run_finished("a", "success"));
        let (state, commands) = step(&state, gate("a", GateKind::Review, GateOutcome::Fail));
        assert!(has_notice(&commands, "mission.work_item.gate_failed"));
        let item = state.work_item("a").expect("item");
        assert_eq!(item.status, WorkItemStatus::Rework);
        assert_eq!(item.artifact_refs, vec!["artifact://notes".to_string()]);

        let (state, commands) = step(
            &state,
            MissionEvent::WorkItemResubmitted {
                mission_id: MISSION.to_string(),
                work_item_id: "a".to_string(),
                note: Some("cover the edge case".to_string()),
            },
        );
        let item = state.work_item("a").expect("item");
        assert_eq!(item.status, WorkItemStatus::InProgress);
        assert_eq!(item.attempt, 2);
        assert_eq!(item.artifact_refs, vec!["artifact://notes".to_string()]);
        assert_eq!(state.artifacts.len(), 1);
        match &commands[0] {
            MissionCommand::StartRun { run_key, prompt, .. } => {
                assert_eq!(run_key, "m-1:a:2");
                assert!(prompt.contains("cover the edge case"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn done_requires_every_gate_since_review_entry() {
        let (state, _) = started(vec![
            WorkItemPlan::new("a", "Patch").gates(vec![GateKind::Review, GateKind::Test])
        ]);
        let (state, _) = step(&state, run_finished("a", "ok"));
        let (state, _) = step(&state, gate("a", GateKind::Review, GateOutcome::Pass));
        assert_eq!(state.work_item("a").map(|i| i.status), Some(WorkItemStatus::Review));
        let (state, commands) = step(&state, gate("a", GateKind::Test, GateOutcome::NeedsMoreInfo));
        assert!(has_notice(&commands, "mission.work_item.needs_more_info"));
        let (state, commands) = step(&state, gate("a", GateKind::Test, GateOutcome::Pass));
        assert_eq!(state.work_item("a").map(|i| i.status), Some(WorkItemStatus::Done));
        assert_eq!(state.status, MissionStatus::Complete);
        assert!(has_notice(&commands, "mission.completed"));
        assert_eq!(state.gate_log.len(), 3);
    }

    #[test]
    fn passes_before_rework_do_not_count() {
        let (state, _) = started(vec![
            WorkItemPlan::new("a", "Patch").gates(vec![GateKind::Review, GateKind::Test])
        ]);
        let (state, _) = step(&state, run_finished("a", "ok"));
        let (state, _) = step(&state, gate("a", GateKind::Review, GateOutcome::Pass));
        let (state, _) = step(&state, gate("a", GateKind::Test, GateOutcome::Fail));
        let (state, _) = step(
            &state,
            MissionEvent::WorkItemResubmitted {
                mission_id: MISSION.to_string(),
                work_item_id: "a".to_string(),
                note: None,
            },
        );
        let (state, _) = step(&state, run_finished("a", "ok"));
        let (state, _) = step(&state, gate("a", GateKind::Test, GateOutcome::Pass));
        assert_eq!(state.work_item("a").map(|i| i.status), Some(WorkItemStatus::Review));
    }

    #[test]
    fn sensitive_tool_forces_review_without_new_run() {
        let (state, _) = started(vec![WorkItemPlan::new("a", "Patch").sensitive(["apply_patch"])]);
        let (state, commands) = step(
            &state,
            MissionEvent::ToolResult {
                mission_id: MISSION.to_string(),
                work_item_id: "a".to_string(),
                run_id: "run-a".to_string(),
                tool: "apply_patch".to_string(),
                artifact_ref: None,
            },
        );
        assert_eq!(state.work_item("a").map(|i| i.status), Some(WorkItemStatus::Review));
        assert!(has_notice(&commands, "mission.work_item.review_requested"));
        assert!(started_items(&commands).is_empty());
    }

    #[test]
    fn out_of_phase_events_are_reported() {
        let (state, _) = started(vec![
            WorkItemPlan::new("a", "Research"),
            WorkItemPlan::new("b", "Draft").depends_on(["a"]),
        ]);
        let (next, commands) = step(
            &state,
            MissionEvent::ToolResult {
                mission_id: MISSION.to_string(),
                work_item_id: "b".to_string(),
                run_id: "run-b".to_string(),
                tool: "write".to_string(),
                artifact_ref: Some("artifact://early".to_string()),
            },
        );
        assert!(has_notice(&commands, "mission.work_item.out_of_phase"));
        assert_eq!(next.work_item("b").map(|i| i.status), Some(WorkItemStatus::Pending));
        assert!(next.artifacts.is_empty());
        assert_eq!(next.revision, state.revision + 1);
    }

    #[test]
    fn approval_flow_and_blocked_propagation() {
        let (state, commands) = started(vec![
            WorkItemPlan::new("a", "Deploy").with_approval(),
            WorkItemPlan::new("b", "Announce").depends_on(["a"]),
        ]);
        assert!(commands
            .iter()
            .any(|command| matches!(command, MissionCommand::RequestApproval { .. })));
        assert!(started_items(&commands).is_empty());

        let (state, commands) = step(
            &state,
            MissionEvent::ApprovalDenied {
                mission_id: MISSION.to_string(),
                work_item_id: "a".to_string(),
                approval_id: "ap-1".to_string(),
                reason: "freeze window".to_string(),
            },
        );
        assert_eq!(state.work_item("a").map(|i| i.status), Some(WorkItemStatus::Blocked));
        let dependant = state.work_item("b").expect("b");
        assert_eq!(dependant.status, WorkItemStatus::Blocked);
        assert_eq!(
            dependant.blocked_reason,
            Some(BlockedReason::Dependency {
                work_item_id: "a".to_string()
            })
        );
        assert!(has_notice(&commands, "mission.work_item.blocked"));

        let (state, commands) = step(
            &state,
            MissionEvent::ApprovalGranted {
                mission_id: MISSION.to_string(),
                work_item_id: "a".to_string(),
                approval_id: "ap-2".to_string(),
            },
        );
        assert_eq!(started_items(&commands), vec!["a"]);
        assert_eq!(state.work_item("b").map(|i| i.status), Some(WorkItemStatus::Pending));
    }

    #[test]
    fn missing_skill_keeps_item_pending_until_capabilities_change() {
        let (state, commands) = started(vec![WorkItemPlan::new("a", "Audit").skills(["security"])]);
        assert!(commands.is_empty());
        assert_eq!(state.work_item("a").map(|i| i.status), Some(WorkItemStatus::Pending));
        let (state, commands) = step(
            &state,
            MissionEvent::CapabilitiesUpdated {
                mission_id: MISSION.to_string(),
                skill_tags: vec!["security".to_string()],
            },
        );
        assert_eq!(started_items(&commands), vec!["a"]);
        assert_eq!(
            state.work_item("a").and_then(|i| i.assigned_skill.clone()),
            Some("security".to_string())
        );
    }

    #[test]
    fn cancelling_required_item_fails_mission() {
        let (state, _) = started(vec![
            WorkItemPlan::new("a", "Core"),
            WorkItemPlan::new("b", "Extra").optional(),
        ]);
        let (next, commands) = step(
            &state,
            MissionEvent::WorkItemCancelled {
                mission_id: MISSION.to_string(),
                work_item_id: "b".to_string(),
                reason: "descoped".to_string(),
            },
        );
        assert_eq!(next.status, MissionStatus::Running);
        assert!(has_notice(&commands, "mission.work_item.cancelled"));
        let (next, _) = step(
            &next,
            MissionEvent::WorkItemCancelled {
                mission_id: MISSION.to_string(),
                work_item_id: "a".to_string(),
                reason: "descoped".to_string(),
            },
        );
        assert_eq!(next.status, MissionStatus::Failed);
        let err = DefaultMissionReducer::reduce(
            &next,
            MissionEvent::MissionResumed {
                mission_id: MISSION.to_string(),
            },
        )
        .expect_err("closed");
        assert!(matches!(err, ReducerError::MissionClosed { .. }));
    }

    #[test]
    fn mission_cancel_cancels_open_items() {
        let (state, _) = started(vec![WorkItemPlan::new("a", "Core")]);
        let (state, _) = step(
            &state,
            MissionEvent::RunStarted {
                mission_id: MISSION.to_string(),
                work_item_id: "a".to_string(),
                run_id: "run-a".to_string(),
            },
        );
        let (state, commands) = step(
            &state,
            MissionEvent::MissionCanceled {
                mission_id: MISSION.to_string(),
                reason: "user".to_string(),
            },
        );
        assert_eq!(state.status, MissionStatus::Cancelled);
        assert_eq!(state.work_items[0].status, WorkItemStatus::Cancelled);
        assert!(commands.iter().any(|command| matches!(
            command,
            MissionCommand::EmitNotice { event_type, properties, .. }
                if event_type == "mission.work_item.cancelled" && properties["runID"] == "run-a"
        )));
    }

    #[test]
    fn pause_with_timer_resumes_and_stale_timers_are_reported() {
        let (state, _) = started(vec![
            WorkItemPlan::new("a", "A"),
            WorkItemPlan::new("b", "B").depends_on(["a"]),
        ]);
        let (state, commands) = step(
            &state,
            MissionEvent::MissionPaused {
                mission_id: MISSION.to_string(),
                reason: "budget".to_string(),
                resume_after_ms: Some(5_000),
            },
        );
        let timer_id = match &commands[0] {
            MissionCommand::ScheduleTimer { timer_id, delay_ms, .. } => {
                assert_eq!(*delay_ms, 5_000);
                timer_id.clone()
            }
            other => panic!("unexpected command: {other:?}"),
        };
        let (state, _) = step(&state, run_finished("a", "ok"));
        let (state, commands) = step(&state, gate("a", GateKind::Review, GateOutcome::Pass));
        assert!(started_items(&commands).is_empty());

        let (state, commands) = step(
            &state,
            MissionEvent::TimerFired {
                mission_id: MISSION.to_string(),
                timer_id: timer_id.clone(),
            },
        );
        assert_eq!(state.status, MissionStatus::Running);
        assert_eq!(started_items(&commands), vec!["b"]);

        let (_, commands) = step(
            &state,
            MissionEvent::TimerFired {
                mission_id: MISSION.to_string(),
                timer_id,
            },
        );
        assert!(has_notice(&commands, "mission.timer.stale"));
    }

    #[test]
    fn replay_is_deterministic() {
        let events = vec![
            MissionEvent::WorkItemsPlanned {
                mission_id: MISSION.to_string(),
                work_items: vec![
                    WorkItemPlan::new("a", "A"),
                    WorkItemPlan::new("b", "B").depends_on(["a"]),
                ],
            },
            MissionEvent::MissionStarted {
                mission_id: MISSION.to_string(),
            },
            run_finished("a", "ok"),
            gate("a", GateKind::Review, GateOutcome::Pass),
        ];
        let first = DefaultMissionReducer::replay(spec(), events.clone()).expect("replay");
        let second = DefaultMissionReducer::replay(spec(), events).expect("replay");
        assert_eq!(
            serde_json::to_string(&first).expect("json"),
            serde_json::to_string(&second).expect("json")
        );
        assert_eq!(first.revision, 5);
    }
}
