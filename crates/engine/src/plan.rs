//! Batch validation and ordering, done before any lease is taken.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use vaultward_core::{ActionPayload, ProposedAction, Result, RiskClass, VaultwardError};

use crate::classifier;

/// A validated batch: actions in dependency order with their effective class.
#[derive(Debug, Clone)]
pub struct OrderedPlan {
    pub actions: Vec<PlannedAction>,
}

#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub action: ProposedAction,
    pub class: RiskClass,
    /// Set for B1 actions: the id shared by every member of the transaction.
    pub transaction_id: Option<String>,
}

impl OrderedPlan {
    pub fn get(&self, id: &str) -> Option<&PlannedAction> {
        self.actions.iter().find(|p| p.action.id == id)
    }

    pub fn transaction_members(&self, transaction_id: &str) -> Vec<&PlannedAction> {
        self.actions
            .iter()
            .filter(|p| p.transaction_id.as_deref() == Some(transaction_id))
            .collect()
    }

    /// Every action that transitively depends on one of `roots`.
    pub fn dependents_of(&self, roots: &BTreeSet<String>) -> BTreeSet<String> {
        let mut reached = BTreeSet::new();
        // Dependency order means one forward pass sees every chain.
        for planned in &self.actions {
            if planned
                .action
                .dependencies
                .iter()
                .any(|dep| roots.contains(dep) || reached.contains(dep))
            {
                reached.insert(planned.action.id.clone());
            }
        }
        reached
    }
}

/// Reject duplicate ids, unknown dependencies and cycles, then order the
/// batch topologically. Ties keep input order.
pub fn order(items: &[ProposedAction]) -> Result<OrderedPlan> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (idx, action) in items.iter().enumerate() {
        if action.id.trim().is_empty() {
            return Err(VaultwardError::InvalidPlan(format!("action #{idx} has an empty id")));
        }
        if index.insert(action.id.as_str(), idx).is_some() {
            return Err(VaultwardError::InvalidPlan(format!("duplicate action id {}", action.id)));
        }
    }

    let mut indegree = vec![0usize; items.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
    for (idx, action) in items.iter().enumerate() {
        for dep in &action.dependencies {
            let Some(&dep_idx) = index.get(dep.as_str()) else {
                return Err(VaultwardError::InvalidPlan(format!(
                    "action {} depends on unknown action {dep}",
                    action.id
                )));
            };
            if dep_idx == idx {
                return Err(VaultwardError::InvalidPlan(format!("action {} depends on itself", action.id)));
            }
            indegree[idx] += 1;
            dependents[dep_idx].push(idx);
        }
    }

    // Kahn's algorithm with a min-ordered ready set for a stable order.
    let mut ready: BTreeSet<usize> = (0..items.len()).filter(|&i| indegree[i] == 0).collect();
    let mut sequence = Vec::with_capacity(items.len());
    while let Some(idx) = ready.pop_first() {
        sequence.push(idx);
        for &next in &dependents[idx] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }
    if sequence.len() != items.len() {
        let stuck: Vec<&str> = (0..items.len())
            .filter(|i| indegree[*i] > 0)
            .map(|i| items[i].id.as_str())
            .collect();
        return Err(VaultwardError::InvalidPlan(format!(
            "dependency cycle among actions: {}",
            stuck.join(", ")
        )));
    }

    let classes: Vec<RiskClass> = items.iter().map(classifier::classify).collect();
    let transactions = group_transactions(items, &classes, &index);
    let sequence = schedule(items, &index, &sequence, &transactions)?;

    Ok(OrderedPlan {
        actions: sequence
            .into_iter()
            .map(|idx| PlannedAction {
                action: items[idx].clone(),
                class: classes[idx],
                transaction_id: transactions.get(&idx).cloned(),
            })
            .collect(),
    })
}

/// B1 actions linked by dependency edges form one transaction, named after
/// its first member in input order.
fn group_transactions(
    items: &[ProposedAction],
    classes: &[RiskClass],
    index: &HashMap<&str, usize>,
) -> BTreeMap<usize, String> {
    let b1: Vec<usize> = (0..items.len()).filter(|&i| classes[i] == RiskClass::B1).collect();
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
    for &idx in &b1 {
        for dep in &items[idx].dependencies {
            let Some(&dep_idx) = index.get(dep.as_str()) else {
                continue;
            };
            if classes[dep_idx] == RiskClass::B1 {
                adjacency.entry(idx).or_default().push(dep_idx);
                adjacency.entry(dep_idx).or_default().push(idx);
            }
        }
    }

    let mut assigned = BTreeMap::new();
    for &start in &b1 {
        if assigned.contains_key(&start) {
            continue;
        }
        let transaction_id = format!("txn_{}", items[start].id);
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            if assigned.contains_key(&idx) {
                continue;
            }
            assigned.insert(idx, transaction_id.clone());
            for &next in adjacency.get(&idx).into_iter().flatten() {
                queue.push_back(next);
            }
        }
    }
    assigned
}

/// Order the batch with each transaction collapsed into one step, so a
/// transaction starts only after the outside dependencies of all its members.
/// Members keep their relative dependency order inside the step.
fn schedule(
    items: &[ProposedAction],
    index: &HashMap<&str, usize>,
    sequence: &[usize],
    transactions: &BTreeMap<usize, String>,
) -> Result<Vec<usize>> {
    // A step is keyed by its first member in input order.
    let mut leaders: HashMap<&str, usize> = HashMap::new();
    let step_of: Vec<usize> = (0..items.len())
        .map(|idx| match transactions.get(&idx) {
            Some(txn) => *leaders.entry(txn.as_str()).or_insert(idx),
            None => idx,
        })
        .collect();

    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &idx in sequence {
        members.entry(step_of[idx]).or_default().push(idx);
    }

    let mut indegree: BTreeMap<usize, usize> = members.keys().map(|&step| (step, 0)).collect();
    let mut dependents: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (idx, action) in items.iter().enumerate() {
        for dep in &action.dependencies {
            let Some(&dep_idx) = index.get(dep.as_str()) else {
                continue;
            };
            let (from, to) = (step_of[dep_idx], step_of[idx]);
            if from != to && dependents.entry(from).or_default().insert(to) {
                *indegree.entry(to).or_default() += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(&step, _)| step)
        .collect();
    let mut ordered = Vec::with_capacity(items.len());
    while let Some(step) = ready.pop_first() {
        ordered.extend(members.get(&step).into_iter().flatten().copied());
        for next in dependents.get(&step).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(next) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*next);
                }
            }
        }
    }

    if ordered.len() != items.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(step, _)| transactions.get(step).map_or(items[*step].id.as_str(), String::as_str))
            .collect();
        return Err(VaultwardError::InvalidPlan(format!(
            "dependency cycle through a transaction: {}",
            stuck.join(", ")
        )));
    }
    Ok(ordered)
}

/// Actions that survive starvation under the chosen reduced mode.
pub fn survives_starvation(planned: &PlannedAction, append_only: bool) -> bool {
    if planned.class != RiskClass::A {
        return false;
    }
    !append_only || matches!(planned.action.payload, ActionPayload::AppendAnchoredBlock { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use vaultward_core::Placement;

    fn append(id: &str, deps: &[&str]) -> ProposedAction {
        ProposedAction {
            id: id.to_string(),
            target_path: PathBuf::from(format!("{id}.md")),
            risk_class: RiskClass::A,
            payload: ActionPayload::AppendAnchoredBlock {
                anchor: "r".to_string(),
                block: "<!-- r -->\n".to_string(),
                placement: Placement::End,
            },
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            expected_base_digest: None,
        }
    }

    fn rename(id: &str, deps: &[&str]) -> ProposedAction {
        ProposedAction {
            payload: ActionPayload::RenameNote {
                source_path: PathBuf::from(format!("{id}-old.md")),
                referrers: BTreeMap::new(),
            },
            risk_class: RiskClass::B1,
            ..append(id, deps)
        }
    }

    fn ids(plan: &OrderedPlan) -> Vec<&str> {
        plan.actions.iter().map(|p| p.action.id.as_str()).collect()
    }

    #[test]
    fn orders_by_dependency_then_input() {
        let plan = order(&[append("c", &["b"]), append("a", &[]), append("b", &[])]).unwrap();
        assert_eq!(ids(&plan), vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_invalid_plan() {
        let err = order(&[append("a", &["b"]), append("b", &["a"])]).unwrap_err();
        assert!(matches!(err, VaultwardError::InvalidPlan(msg) if msg.contains("cycle")));
    }

    #[test]
    fn unknown_dependency_and_duplicates_are_invalid() {
        assert!(matches!(
            order(&[append("a", &["zzz"])]),
            Err(VaultwardError::InvalidPlan(_))
        ));
        assert!(matches!(
            order(&[append("a", &[]), append("a", &[])]),
            Err(VaultwardError::InvalidPlan(_))
        ));
    }

    #[test]
    fn linked_b1_actions_share_a_transaction() {
        let plan = order(&[rename("r1", &[]), rename("r2", &["r1"]), rename("r3", &[]), append("a", &["r1"])]).unwrap();
        let txn = |id: &str| plan.get(id).unwrap().transaction_id.clone();
        assert_eq!(txn("r1"), Some("txn_r1".to_string()));
        assert_eq!(txn("r2"), Some("txn_r1".to_string()));
        assert_eq!(txn("r3"), Some("txn_r3".to_string()));
        assert_eq!(txn("a"), None);
        assert_eq!(plan.transaction_members("txn_r1").len(), 2);
    }

    #[test]
    fn transaction_waits_for_outside_dependencies_of_later_members() {
        let plan = order(&[rename("r1", &[]), append("a1", &[]), rename("r2", &["r1", "a1"])]).unwrap();
        assert_eq!(ids(&plan), vec!["a1", "r1", "r2"]);
        assert_eq!(plan.get("r2").unwrap().transaction_id, Some("txn_r1".to_string()));
    }

    #[test]
    fn cycle_through_a_transaction_is_invalid() {
        let err = order(&[rename("r1", &[]), append("a1", &["r1"]), rename("r2", &["r1", "a1"])]).unwrap_err();
        assert!(matches!(err, VaultwardError::InvalidPlan(msg) if msg.contains("txn_r1")));
    }

    #[test]
    fn dependents_are_transitive() {
        let plan = order(&[append("a", &[]), append("b", &["a"]), append("c", &["b"]), append("d", &[])]).unwrap();
        let reached = plan.dependents_of(&BTreeSet::from(["a".to_string()]));
        assert_eq!(reached, BTreeSet::from(["b".to_string(), "c".to_string()]));
    }

    #[test]
    fn starvation_keeps_only_class_a() {
        let plan = order(&[append("a", &[]), rename("r", &[])]).unwrap();
        assert!(survives_starvation(plan.get("a").unwrap(), true));
        assert!(!survives_starvation(plan.get("r").unwrap(), false));
    }
}
