use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gate::{default_gates, normalize_gates, GateKind, GateOutcome, GateRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Draft,
    Running,
    Paused,
    Complete,
    Failed,
    Cancelled,
}

impl MissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MissionStatus::Complete | MissionStatus::Failed | MissionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MissionStatus::Draft => "draft",
            MissionStatus::Running => "running",
            MissionStatus::Paused => "paused",
            MissionStatus::Complete => "complete",
            MissionStatus::Failed => "failed",
            MissionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MissionBudget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MissionCapabilities {
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub allowed_agents: Vec<String>,
    /// Skill tags the mission can staff work items with.
    #[serde(default)]
    pub skill_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionSpec {
    pub mission_id: String,
    pub title: String,
    pub goal: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub budgets: MissionBudget,
    #[serde(default)]
    pub capabilities: MissionCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl MissionSpec {
    pub fn new(title: impl Into<String>, goal: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), title, goal)
    }

    pub fn with_id(
        mission_id: impl Into<String>,
        title: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        Self {
            mission_id: mission_id.into(),
            title: title.into(),
            goal: goal.into(),
            success_criteria: Vec::new(),
            entrypoint: None,
            budgets: MissionBudget::default(),
            capabilities: MissionCapabilities::default(),
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    InProgress,
    Review,
    Rework,
    Done,
    Blocked,
    Cancelled,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::Review => "review",
            WorkItemStatus::Rework => "rework",
            WorkItemStatus::Done => "done",
            WorkItemStatus::Blocked => "blocked",
            WorkItemStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    NotRequested,
    Pending,
    Granted,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockedReason {
    ApprovalDenied { reason: String },
    Dependency { work_item_id: String },
}

impl BlockedReason {
    pub fn describe(&self) -> String {
        match self {
            BlockedReason::ApprovalDenied { reason } => format!("approval denied: {reason}"),
            BlockedReason::Dependency { work_item_id } => {
                format!("dependency `{work_item_id}` cannot complete")
            }
        }
    }
}

fn default_true() -> bool {
    true
}

/// Planning input for one work item, carried by `work_items_planned`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemPlan {
    pub work_item_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default = "default_gates")]
    pub gates: Vec<GateKind>,
    #[serde(default)]
    pub sensitive_tools: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl WorkItemPlan {
    pub fn new(work_item_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            title: title.into(),
            detail: None,
            depends_on: Vec::new(),
            required: true,
            required_skills: Vec::new(),
            gates: default_gates(),
            sensitive_tools: Vec::new(),
            requires_approval: false,
            metadata: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn gates(mut self, gates: Vec<GateKind>) -> Self {
        self.gates = gates;
        self
    }

    pub fn sensitive<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sensitive_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub work_item_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_skill: Option<String>,
    #[serde(default = "default_gates")]
    pub gates: Vec<GateKind>,
    #[serde(default)]
    pub sensitive_tools: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub approval: ApprovalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub artifact_refs: Vec<String>,
    /// Gates passed since the item last entered review.
    #[serde(default)]
    pub gate_outcomes: Vec<GateKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_entered_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockedReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl WorkItem {
    pub fn from_plan(plan: WorkItemPlan) -> Self {
        let mut required_skills = plan.required_skills;
        required_skills.sort();
        required_skills.dedup();
        Self {
            work_item_id: plan.work_item_id,
            title: plan.title,
            detail: plan.detail,
            status: WorkItemStatus::Pending,
            depends_on: plan.depends_on,
            required: plan.required,
            required_skills,
            assigned_skill: None,
            gates: normalize_gates(&plan.gates),
            sensitive_tools: plan.sensitive_tools,
            requires_approval: plan.requires_approval,
            approval: ApprovalState::NotRequested,
            run_id: None,
            attempt: 0,
            artifact_refs: Vec::new(),
            gate_outcomes: Vec::new(),
            review_entered_at: None,
            blocked_reason: None,
            metadata: plan.metadata,
        }
    }

    pub fn is_sensitive_tool(&self, tool: &str) -> bool {
        self.sensitive_tools
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(tool))
    }

    pub fn run_key(&self, mission_id: &str) -> String {
        format!("{mission_id}:{}:{}", self.work_item_id, self.attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIndexEntry {
    pub work_item_id: String,
    pub artifact_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerPurpose {
    ResumeMission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionState {
    pub mission_id: String,
    pub status: MissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub spec: MissionSpec,
    #[serde(default)]
    pub work_items: Vec<WorkItem>,
    pub revision: u64,
    #[serde(default)]
    pub artifacts: Vec<ArtifactIndexEntry>,
    #[serde(default)]
    pub gate_log: Vec<GateRecord>,
    #[serde(default)]
    pub available_skills: BTreeSet<String>,
    #[serde(default)]
    pub timers: BTreeMap<String, TimerPurpose>,
    #[serde(default)]
    pub resources: BTreeMap<String, u64>,
}

impl MissionState {
    pub fn work_item(&self, work_item_id: &str) -> Option<&WorkItem> {
        self.work_items
            .iter()
            .find(|item| item.work_item_id == work_item_id)
    }

    pub fn work_item_mut(&mut self, work_item_id: &str) -> Option<&mut WorkItem> {
        self.work_items
            .iter_mut()
            .find(|item| item.work_item_id == work_item_id)
    }

    /// Vacuously true when no item is required.
    pub fn required_items_done(&self) -> bool {
        self.work_items
            .iter()
            .filter(|item| item.required)
            .all(|item| item.status == WorkItemStatus::Done)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MissionEvent {
    MissionStarted {
        mission_id: String,
    },
    MissionPaused {
        mission_id: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_after_ms: Option<u64>,
    },
    MissionResumed {
        mission_id: String,
    },
    MissionCanceled {
        mission_id: String,
        reason: String,
    },
    WorkItemsPlanned {
        mission_id: String,
        work_items: Vec<WorkItemPlan>,
    },
    RunStarted {
        mission_id: String,
        work_item_id: String,
        run_id: String,
    },
    RunFinished {
        mission_id: String,
        work_item_id: String,
        run_id: String,
        status: String,
    },
    ToolResult {
        mission_id: String,
        work_item_id: String,
        run_id: String,
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact_ref: Option<String>,
    },
    ApprovalGranted {
        mission_id: String,
        work_item_id: String,
        approval_id: String,
    },
    ApprovalDenied {
        mission_id: String,
        work_item_id: String,
        approval_id: String,
        reason: String,
    },
    TimerFired {
        mission_id: String,
        timer_id: String,
    },
    ResourceChanged {
        mission_id: String,
        key: String,
        rev: u64,
    },
    CapabilitiesUpdated {
        mission_id: String,
        skill_tags: Vec<String>,
    },
    GateResult {
        mission_id: String,
        work_item_id: String,
        gate: GateKind,
        outcome: GateOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reviewer: Option<String>,
    },
    WorkItemResubmitted {
        mission_id: String,
        work_item_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    WorkItemCancelled {
        mission_id: String,
        work_item_id: String,
        reason: String,
    },
}

impl MissionEvent {
    pub fn mission_id(&self) -> &str {
        match self {
            MissionEvent::MissionStarted { mission_id }
            | MissionEvent::MissionPaused { mission_id, .. }
            | MissionEvent::MissionResumed { mission_id }
            | MissionEvent::MissionCanceled { mission_id, .. }
            | MissionEvent::WorkItemsPlanned { mission_id, .. }
            | MissionEvent::RunStarted { mission_id, .. }
            | MissionEvent::RunFinished { mission_id, .. }
            | MissionEvent::ToolResult { mission_id, .. }
            | MissionEvent::ApprovalGranted { mission_id, .. }
            | MissionEvent::ApprovalDenied { mission_id, .. }
            | MissionEvent::TimerFired { mission_id, .. }
            | MissionEvent::ResourceChanged { mission_id, .. }
            | MissionEvent::CapabilitiesUpdated { mission_id, .. }
            | MissionEvent::GateResult { mission_id, .. }
            | MissionEvent::WorkItemResubmitted { mission_id, .. }
            | MissionEvent::WorkItemCancelled { mission_id, .. } => mission_id,
        }
    }

    pub fn work_item_id(&self) -> Option<&str> {
        match self {
            MissionEvent::RunStarted { work_item_id, .. }
            | MissionEvent::RunFinished { work_item_id, .. }
            | MissionEvent::ToolResult { work_item_id, .. }
            | MissionEvent::ApprovalGranted { work_item_id, .. }
            | MissionEvent::ApprovalDenied { work_item_id, .. }
            | MissionEvent::GateResult { work_item_id, .. }
            | MissionEvent::WorkItemResubmitted { work_item_id, .. }
            | MissionEvent::WorkItemCancelled { work_item_id, .. } => Some(work_item_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MissionEvent::MissionStarted { .. } => "mission_started",
            MissionEvent::MissionPaused { .. } => "mission_paused",
            MissionEvent::MissionResumed { .. } => "mission_resumed",
            MissionEvent::MissionCanceled { .. } => "mission_canceled",
            MissionEvent::WorkItemsPlanned { .. } => "work_items_planned",
            MissionEvent::RunStarted { .. } => "run_started",
            MissionEvent::RunFinished { .. } => "run_finished",
            MissionEvent::ToolResult { .. } => "tool_result",
            MissionEvent::ApprovalGranted { .. } => "approval_granted",
            MissionEvent::ApprovalDenied { .. } => "approval_denied",
            MissionEvent::TimerFired { .. } => "timer_fired",
            MissionEvent::ResourceChanged { .. } => "resource_changed",
            MissionEvent::CapabilitiesUpdated { .. } => "capabilities_updated",
            MissionEvent::GateResult { .. } => "gate_result",
            MissionEvent::WorkItemResubmitted { .. } => "work_item_resubmitted",
            MissionEvent::WorkItemCancelled { .. } => "work_item_cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MissionCommand {
    StartRun {
        mission_id: String,
        work_item_id: String,
        run_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_skill: Option<String>,
        prompt: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    RequestApproval {
        mission_id: String,
        work_item_id: String,
        kind: String,
        summary: String,
    },
    PersistArtifact {
        mission_id: String,
        work_item_id: String,
        artifact_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    ScheduleTimer {
        mission_id: String,
        timer_id: String,
        delay_ms: u64,
    },
    EmitNotice {
        mission_id: String,
        event_type: String,
        properties: Value,
    },
}

impl MissionCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            MissionCommand::StartRun { .. } => "start_run",
            MissionCommand::RequestApproval { .. } => "request_approval",
            MissionCommand::PersistArtifact { .. } => "persist_artifact",
            MissionCommand::ScheduleTimer { .. } => "schedule_timer",
            MissionCommand::EmitNotice { .. } => "emit_notice",
        }
    }
}
