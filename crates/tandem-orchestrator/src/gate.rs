use serde::{Deserialize, Serialize};

use crate::{WorkItem, WorkItemStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Review,
    Test,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GateKind::Review => "review",
            GateKind::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    Fail,
    NeedsMoreInfo,
}

impl GateOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            GateOutcome::Pass => "pass",
            GateOutcome::Fail => "fail",
            GateOutcome::NeedsMoreInfo => "needs_more_info",
        }
    }
}

/// One gate conclusion as it entered the mission log. `revision` is the
/// mission revision the result was applied at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRecord {
    pub work_item_id: String,
    pub gate: GateKind,
    pub outcome: GateOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    pub revision: u64,
}

pub fn default_gates() -> Vec<GateKind> {
    vec![GateKind::Review]
}

/// Sorted, de-duplicated gate list; an empty list falls back to a single
/// review gate so nothing can reach `done` ungated.
pub fn normalize_gates(gates: &[GateKind]) -> Vec<GateKind> {
    let mut out = gates.to_vec();
    out.sort();
    out.dedup();
    if out.is_empty() {
        return default_gates();
    }
    out
}

/// Gates still missing a pass since the item last entered review.
pub fn outstanding_gates(item: &WorkItem) -> Vec<GateKind> {
    item.gates
        .iter()
        .copied()
        .filter(|gate| !item.gate_outcomes.contains(gate))
        .collect()
}

pub fn gates_satisfied(item: &WorkItem) -> bool {
    item.status == WorkItemStatus::Review
        && item.review_entered_at.is_some()
        && outstanding_gates(item).is_empty()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub outcome: GateOutcome,
    pub reason: String,
}

/// Out-of-band gate evaluation. Implementations never mutate mission state;
/// their verdicts re-enter the reducer as `gate_result` events.
pub trait GateEvaluator: Send + Sync {
    fn reviewer(&self) -> &str;
    fn evaluate(&self, gate: GateKind, item: &WorkItem, success_criteria: &[String]) -> GateVerdict;
}

/// Rule gate used for unattended missions: an item passes once it has
/// produced at least `min_artifacts` artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactGate {
    pub min_artifacts: usize,
}

impl Default for ArtifactGate {
    fn default() -> Self {
        Self { min_artifacts: 1 }
    }
}

impl GateEvaluator for ArtifactGate {
    fn reviewer(&self) -> &str {
        "gate.artifact"
    }

    fn evaluate(&self, gate: GateKind, item: &WorkItem, success_criteria: &[String]) -> GateVerdict {
        let produced = item.artifact_refs.len();
        if produced == 0 {
            return GateVerdict {
                outcome: GateOutcome::NeedsMoreInfo,
                reason: format!("{} gate has no artifacts to inspect", gate.as_str()),
            };
        }
        if produced < self.min_artifacts {
            return GateVerdict {
                outcome: GateOutcome::Fail,
                reason: format!(
                    "{} gate expected at least {} artifacts, found {produced}",
                    gate.as_str(),
                    self.min_artifacts
                ),
            };
        }
        let criteria = if success_criteria.is_empty() {
            "no explicit criteria".to_string()
        } else {
            format!("{} criteria", success_criteria.len())
        };
        GateVerdict {
            outcome: GateOutcome::Pass,
            reason: format!(
                "{} gate accepted {produced} artifacts ({criteria})",
                gate.as_str()
            ),
        }
    }
}
