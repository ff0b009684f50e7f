use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::{BlockedReason, WorkItem, WorkItemPlan, WorkItemStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanError {
    #[error("work item plan is empty")]
    EmptyPlan,
    #[error("duplicate work item id `{work_item_id}`")]
    DuplicateWorkItem { work_item_id: String },
    #[error("work item `{work_item_id}` depends on unknown item `{dependency_id}`")]
    UnknownDependency {
        work_item_id: String,
        dependency_id: String,
    },
    #[error("cycle detected in work item graph: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
}

/// Validate a planning batch against the items a mission already holds.
/// New items may depend on existing ones; the combined graph must stay acyclic.
pub fn validate_plan(existing: &[WorkItem], plans: &[WorkItemPlan]) -> Result<(), PlanError> {
    if plans.is_empty() {
        return Err(PlanError::EmptyPlan);
    }

    let mut graph: BTreeMap<&str, &[String]> = existing
        .iter()
        .map(|item| (item.work_item_id.as_str(), item.depends_on.as_slice()))
        .collect();
    for plan in plans {
        if plan.work_item_id.trim().is_empty()
            || graph
                .insert(plan.work_item_id.as_str(), plan.depends_on.as_slice())
                .is_some()
        {
            return Err(PlanError::DuplicateWorkItem {
                work_item_id: plan.work_item_id.clone(),
            });
        }
    }

    for plan in plans {
        for dep in &plan.depends_on {
            if !graph.contains_key(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    work_item_id: plan.work_item_id.clone(),
                    dependency_id: dep.clone(),
                });
            }
        }
    }

    if let Some(path) = detect_cycle(&graph) {
        return Err(PlanError::CycleDetected { path });
    }
    Ok(())
}

/// Kahn's algorithm over the dependency edges. Items left with unmet
/// dependencies all sit on or behind a cycle, so following any of their
/// unresolved dependencies must revisit an item.
fn detect_cycle(graph: &BTreeMap<&str, &[String]>) -> Option<Vec<String>> {
    let mut unmet: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (&id, deps) in graph {
        let known = deps.iter().filter(|dep| graph.contains_key(dep.as_str()));
        let mut count = 0;
        for dep in known {
            dependents.entry(dep.as_str()).or_default().push(id);
            count += 1;
        }
        unmet.insert(id, count);
    }

    let mut ready: Vec<&str> = unmet
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    while let Some(id) = ready.pop() {
        unmet.remove(id);
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(count) = unmet.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.push(*dependent);
                }
            }
        }
    }

    let start = unmet.keys().next().copied()?;
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    let mut path: Vec<&str> = Vec::new();
    let mut current = start;
    loop {
        if let Some(&at) = seen.get(current) {
            let mut cycle: Vec<String> = path[at..].iter().map(|id| id.to_string()).collect();
            cycle.push(current.to_string());
            return Some(cycle);
        }
        seen.insert(current, path.len());
        path.push(current);
        current = graph
            .get(current)
            .into_iter()
            .flat_map(|deps| deps.iter())
            .map(String::as_str)
            .find(|dep| unmet.contains_key(dep))?;
    }
}

pub fn dependencies_done(item: &WorkItem, items: &[WorkItem]) -> bool {
    item.depends_on.iter().all(|dep| {
        items
            .iter()
            .any(|candidate| candidate.work_item_id == *dep && candidate.status == WorkItemStatus::Done)
    })
}

/// Pending items whose dependencies are all done, in board order.
pub fn runnable(items: &[WorkItem]) -> Vec<&WorkItem> {
    items
        .iter()
        .filter(|item| item.status == WorkItemStatus::Pending && dependencies_done(item, items))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssigneeMatch {
    /// The item names no skills; any worker may take it.
    Unconstrained,
    Skill(String),
    NoMatch,
}

/// Picks the first (sorted) skill tag the item asks for that the mission can staff.
pub fn match_assignee(item: &WorkItem, available: &BTreeSet<String>) -> AssigneeMatch {
    if item.required_skills.is_empty() {
        return AssigneeMatch::Unconstrained;
    }
    let wanted: BTreeSet<&str> = item.required_skills.iter().map(String::as_str).collect();
    wanted
        .into_iter()
        .find(|skill| available.contains(*skill))
        .map(|skill| AssigneeMatch::Skill(skill.to_string()))
        .unwrap_or(AssigneeMatch::NoMatch)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedChange {
    pub work_item_id: String,
    pub blocked: bool,
    pub blocker: Option<String>,
}

fn blocking_dependency(item: &WorkItem, items: &[WorkItem]) -> Option<String> {
    item.depends_on.iter().find_map(|dep| {
        items
            .iter()
            .find(|candidate| candidate.work_item_id == *dep)
            .filter(|candidate| {
                matches!(
                    candidate.status,
                    WorkItemStatus::Blocked | WorkItemStatus::Cancelled
                )
            })
            .map(|candidate| candidate.work_item_id.clone())
    })
}

/// Propagates blocked status through the dependency graph until nothing
/// changes. Items blocked by a denied approval are left for the approval
/// flow to clear.
pub fn refresh_blocked(items: &mut [WorkItem]) -> Vec<BlockedChange> {
    let mut changes = Vec::new();
    loop {
        let mut changed = false;
        for idx in 0..items.len() {
            let blocker = blocking_dependency(&items[idx], items);
            let item = &mut items[idx];
            let dependency_block = matches!(
                item.blocked_reason,
                Some(BlockedReason::Dependency { .. })
            );
            match (item.status, dependency_block, blocker) {
                (WorkItemStatus::Pending, _, Some(blocker)) => {
                    item.status = WorkItemStatus::Blocked;
                    item.blocked_reason = Some(BlockedReason::Dependency {
                        work_item_id: blocker.clone(),
                    });
                    changes.push(BlockedChange {
                        work_item_id: item.work_item_id.clone(),
                        blocked: true,
                        blocker: Some(blocker),
                    });
                    changed = true;
                }
                (WorkItemStatus::Blocked, true, None) => {
                    item.status = WorkItemStatus::Pending;
                    item.blocked_reason = None;
                    changes.push(BlockedChange {
                        work_item_id: item.work_item_id.clone(),
                        blocked: false,
                        blocker: None,
                    });
                    changed = true;
                }
                _ => {}
            }
        }
        if !changed {
            return changes;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoardProgress {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub review: usize,
    pub rework: usize,
    pub done: usize,
    pub blocked: usize,
    pub cancelled: usize,
}

impl BoardProgress {
    pub fn of(items: &[WorkItem]) -> Self {
        let mut progress = BoardProgress {
            total: items.len(),
            ..BoardProgress::default()
        };
        for item in items {
            match item.status {
                WorkItemStatus::Pending => progress.pending += 1,
                WorkItemStatus::InProgress => progress.in_progress += 1,
                WorkItemStatus::Review => progress.review += 1,
                WorkItemStatus::Rework => progress.rework += 1,
                WorkItemStatus::Done => progress.done += 1,
                WorkItemStatus::Blocked => progress.blocked += 1,
                WorkItemStatus::Cancelled => progress.cancelled += 1,
            }
        }
        progress
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}
