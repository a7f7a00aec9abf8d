//! Execution planner: orders operations into a plan.
//!
//! Operations are expanded into steps, ordering constraints are collected
//! from the new graph (provisioning) and from the snapshot (removals), and
//! the steps are sorted with Kahn's algorithm.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::PlanError;
use crate::graph::ResourceGraph;
use crate::state::StateSnapshot;

use super::diff::{
    DiffResult, Operation, OperationKind, PropertyDelta, ReplaceStrategy, ReplacementDowntimeWarning,
};
use super::plan::{Plan, PlanStep, StepAction};

/// Planner that turns a diff into an ordered plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutionPlanner;

/// Steps of one logical name, by role.
#[derive(Debug, Default)]
struct NameSteps {
    /// Create, update or replacement create.
    provision: Option<usize>,
    /// Removals of the current instance.
    current_removals: Vec<usize>,
    /// Removals of deposed instances.
    deposed_removals: Vec<usize>,
    /// Old-instance removal of a create-before-delete replacement.
    replaced_removal: Option<usize>,
}

impl NameSteps {
    fn removals(&self) -> impl Iterator<Item = usize> + '_ {
        self.current_removals
            .iter()
            .chain(&self.deposed_removals)
            .copied()
            .chain(self.replaced_removal)
    }
}

impl ExecutionPlanner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Orders the operations of `diff` into a plan.
    ///
    /// `graph` supplies the edges for provisioning steps and `snapshot` the
    /// recorded edges for removals. When create-before-delete replacements
    /// sit on an ordering cycle they are switched to delete-before-create,
    /// with a downtime warning, and the plan is ordered again.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::CyclicPlan` if the constraints admit no order.
    pub fn plan(
        &self,
        diff: &DiffResult,
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
        description_hash: &str,
    ) -> Result<Plan, PlanError> {
        let mut operations = diff.operations.clone();
        let mut warnings = diff.warnings.clone();

        loop {
            let (steps, edges) = Self::constrain(&operations, graph, snapshot);
            let stuck = match Self::sort(&steps, &edges) {
                Ok(order) => {
                    debug!("Planned {} steps from {} operations", steps.len(), operations.len());
                    return Ok(Plan {
                        created_at: Utc::now(),
                        description_hash: description_hash.to_string(),
                        steps: Self::arrange(steps, &edges, order),
                        warnings,
                    });
                }
                Err(stuck) => stuck,
            };

            let cycle = Self::cycle_core(&stuck, &edges);
            if !Self::delete_first(&mut operations, &steps, &cycle, &mut warnings) {
                return Err(PlanError::CyclicPlan {
                    steps: stuck
                        .iter()
                        .map(|&i| format!("{} {}", steps[i].action, steps[i].name))
                        .collect(),
                });
            }
        }
    }

    /// Expands operations into steps and collects the ordering constraints.
    fn constrain(
        operations: &[Operation],
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
    ) -> (Vec<PlanStep>, BTreeSet<(usize, usize)>) {
        let mut steps: Vec<PlanStep> = Vec::new();
        let mut by_name: BTreeMap<String, NameSteps> = BTreeMap::new();
        let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();

        for op in operations {
            Self::expand(op, &mut steps, by_name.entry(op.name.clone()).or_default(), &mut edges);
        }

        for (name, own) in &by_name {
            // Dependencies are provisioned before their dependents.
            if let (Some(step), Some(node)) = (own.provision, graph.get(name)) {
                for dep in &node.dependencies {
                    if let Some(dep_step) = by_name.get(dep).and_then(|d| d.provision) {
                        edges.insert((dep_step, step));
                    }
                }
            }

            // Old dependents are removed before what they depended on.
            if let Some(record) = snapshot.get(name) {
                for dep in &record.dependencies {
                    let Some(dep_steps) = by_name.get(dep) else {
                        continue;
                    };
                    for removal in own.removals() {
                        for dep_removal in dep_steps.removals() {
                            edges.insert((removal, dep_removal));
                        }
                    }
                }
            }

            // An old instance goes only once every new dependent has moved on.
            let old_instances: Vec<usize> = own
                .replaced_removal
                .into_iter()
                .chain(own.deposed_removals.iter().copied())
                .collect();
            if !old_instances.is_empty() {
                for dependent in graph.dependents_of(name) {
                    if let Some(step) = by_name.get(&dependent.name).and_then(|d| d.provision) {
                        for &removal in &old_instances {
                            edges.insert((step, removal));
                        }
                    }
                }
            }

            // Deposed leftovers go before the current instance.
            for &deposed in &own.deposed_removals {
                for &current in &own.current_removals {
                    edges.insert((deposed, current));
                }
            }
        }

        (steps, edges)
    }

    /// Puts steps in sorted order and rewrites their indices and predecessors.
    fn arrange(steps: Vec<PlanStep>, edges: &BTreeSet<(usize, usize)>, order: Vec<usize>) -> Vec<PlanStep> {
        let mut position = vec![0; steps.len()];
        for (pos, &old) in order.iter().enumerate() {
            position[old] = pos;
        }

        let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); steps.len()];
        for &(from, to) in edges {
            predecessors[position[to]].insert(position[from]);
        }

        let mut slots: Vec<Option<PlanStep>> = steps.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(slots.len());
        for (pos, old) in order.into_iter().enumerate() {
            if let Some(mut step) = slots[old].take() {
                step.index = pos;
                step.after = predecessors[pos].iter().copied().collect();
                ordered.push(step);
            }
        }
        ordered
    }

    /// Narrows the unsorted steps to those on or between cycles by peeling
    /// off steps with no unsorted successor.
    fn cycle_core(stuck: &[usize], edges: &BTreeSet<(usize, usize)>) -> BTreeSet<usize> {
        let mut core: BTreeSet<usize> = stuck.iter().copied().collect();
        loop {
            let sinks: Vec<usize> = core
                .iter()
                .copied()
                .filter(|&i| !edges.iter().any(|&(from, to)| from == i && core.contains(&to)))
                .collect();
            if sinks.is_empty() {
                return core;
            }
            for sink in sinks {
                core.remove(&sink);
            }
        }
    }

    /// Switches the create-before-delete replacements among `cycle` to
    /// delete-before-create. Returns false if there were none.
    fn delete_first(
        operations: &mut [Operation],
        steps: &[PlanStep],
        cycle: &BTreeSet<usize>,
        warnings: &mut Vec<ReplacementDowntimeWarning>,
    ) -> bool {
        let names: BTreeSet<&str> = cycle
            .iter()
            .map(|&i| &steps[i])
            .filter(|s| s.operation == OperationKind::Replace)
            .map(|s| s.name.as_str())
            .collect();

        let mut switched = false;
        for op in operations
            .iter_mut()
            .filter(|op| op.strategy == Some(ReplaceStrategy::CreateBeforeDelete))
            .filter(|op| names.contains(op.name.as_str()))
        {
            debug!("Replacement of {} cannot overlap, deleting first", op.name);
            op.strategy = Some(ReplaceStrategy::DeleteBeforeCreate);
            op.reason = format!(
                "{}; both instances cannot coexist without an ordering cycle",
                op.reason
            );
            warnings.push(ReplacementDowntimeWarning {
                resource: op.name.clone(),
                resource_type: op.resource_type,
                reason: op.reason.clone(),
            });
            switched = true;
        }
        switched
    }

    fn expand(
        op: &Operation,
        steps: &mut Vec<PlanStep>,
        own: &mut NameSteps,
        edges: &mut BTreeSet<(usize, usize)>,
    ) {
        let prior_id = op.prior.as_ref().map(|r| r.physical_id.clone());
        let mut push = |action: StepAction, physical_id: Option<String>, downtime: bool| {
            let index = steps.len();
            steps.push(PlanStep {
                index,
                action,
                operation: op.kind,
                name: op.name.clone(),
                resource_type: op.resource_type,
                desired: if action.is_provisioning() {
                    op.desired.clone()
                } else {
                    None
                },
                delta: if action == StepAction::Update {
                    op.delta.clone()
                } else {
                    PropertyDelta::default()
                },
                physical_id,
                after: Vec::new(),
                reason: op.reason.clone(),
                downtime,
            });
            index
        };

        match (op.kind, op.strategy, &op.deposed_id) {
            (OperationKind::Create, _, _) => {
                own.provision = Some(push(StepAction::Create, None, false));
            }
            (OperationKind::Update, _, _) => {
                own.provision = Some(push(StepAction::Update, prior_id, false));
            }
            (OperationKind::Replace, Some(ReplaceStrategy::DeleteBeforeCreate), _) => {
                let delete = push(StepAction::DeleteReplaced, prior_id, true);
                let create = push(StepAction::CreateReplacement, None, true);
                edges.insert((delete, create));
                own.current_removals.push(delete);
                own.provision = Some(create);
            }
            (OperationKind::Replace, _, _) => {
                let create = push(StepAction::CreateReplacement, None, false);
                let delete = push(StepAction::DeleteReplaced, prior_id, false);
                edges.insert((create, delete));
                own.provision = Some(create);
                own.replaced_removal = Some(delete);
            }
            (OperationKind::Delete, _, Some(deposed)) => {
                own.deposed_removals
                    .push(push(StepAction::DeleteReplaced, Some(deposed.clone()), false));
            }
            (OperationKind::Delete, _, None) => {
                own.current_removals
                    .push(push(StepAction::Delete, prior_id, false));
            }
        }
    }

    /// Kahn's algorithm; provisioning steps win ties, then plan order.
    ///
    /// On failure returns the steps that could not be ordered.
    fn sort(steps: &[PlanStep], edges: &BTreeSet<(usize, usize)>) -> Result<Vec<usize>, Vec<usize>> {
        let mut indegree = vec![0usize; steps.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for &(from, to) in edges {
            indegree[to] += 1;
            successors[from].push(to);
        }

        let rank = |i: usize| (!steps[i].action.is_provisioning(), i);
        let mut ready: BTreeSet<(bool, usize)> = (0..steps.len())
            .filter(|&i| indegree[i] == 0)
            .map(rank)
            .collect();

        let mut order = Vec::with_capacity(steps.len());
        while let Some((_, next)) = ready.pop_first() {
            order.push(next);
            for &succ in &successors[next] {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    ready.insert(rank(succ));
                }
            }
        }

        if order.len() < steps.len() {
            return Err((0..steps.len()).filter(|&i| indegree[i] > 0).collect());
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::DiffEngine;
    use crate::planner::diff::tests::{PLANT_STACK, graph, provisioned};

    fn plan_for(new: &ResourceGraph, snapshot: &StateSnapshot) -> Result<Plan, PlanError> {
        let diff = DiffEngine::new().compute(new, snapshot).unwrap();
        ExecutionPlanner::new().plan(&diff, new, snapshot, "hash")
    }

    fn pos(plan: &Plan, name: &str, action: StepAction) -> usize {
        plan.position(name, action)
            .unwrap_or_else(|| panic!("no {action} step for {name}"))
    }

    /// Every provisioning step follows those of its dependencies, and every
    /// removal precedes those of its recorded dependencies.
    fn assert_dependency_order(plan: &Plan, snapshot: &StateSnapshot) {
        for step in &plan.steps {
            if let Some(node) = &step.desired {
                for dep in &node.dependencies {
                    for other in plan.steps.iter().filter(|s| &s.name == dep) {
                        if other.action.is_provisioning() {
                            assert!(other.index < step.index, "{other} should precede {step}");
                        }
                    }
                }
            }
            if !step.action.is_provisioning()
                && let Some(record) = snapshot.get(&step.name)
            {
                for dep in &record.dependencies {
                    for other in plan.steps.iter().filter(|s| &s.name == dep) {
                        if !other.action.is_provisioning() {
                            assert!(step.index < other.index, "{step} should precede {other}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_fresh_stack_orders_dependencies_first() {
        let graph = graph(PLANT_STACK);
        let snapshot = StateSnapshot::new("plant-report", "dev");
        let plan = plan_for(&graph, &snapshot).unwrap();

        assert_eq!(plan.step_count(), 4);
        assert!(pos(&plan, "plant-table", StepAction::Create) < pos(&plan, "report-fn", StepAction::Create));
        assert!(pos(&plan, "report-bucket", StepAction::Create) < pos(&plan, "report-fn", StepAction::Create));
        assert!(pos(&plan, "report-fn", StepAction::Create) < pos(&plan, "plant-route", StepAction::Create));
        assert_dependency_order(&plan, &snapshot);

        let route = &plan.steps[pos(&plan, "plant-route", StepAction::Create)];
        assert_eq!(route.after, vec![pos(&plan, "report-fn", StepAction::Create)]);
    }

    #[test]
    fn test_independent_then_dependent() {
        let graph = graph(
            r"
project: { name: p }
resources:
  b: { type: storage-bucket, properties: { name: b }, depends_on: [a] }
  a: { type: storage-bucket, properties: { name: a } }
",
        );
        let plan = plan_for(&graph, &StateSnapshot::new("p", "dev")).unwrap();
        assert_eq!(plan.steps[0].name, "a");
        assert_eq!(plan.steps[1].name, "b");
        assert_eq!(plan.steps[1].after, vec![0]);
    }

    #[test]
    fn test_destroy_removes_dependents_first() {
        let old = graph(PLANT_STACK);
        let snapshot = provisioned(&old);
        let plan = plan_for(&ResourceGraph::empty(), &snapshot).unwrap();

        assert_eq!(plan.summary().delete, 4);
        assert!(pos(&plan, "plant-route", StepAction::Delete) < pos(&plan, "report-fn", StepAction::Delete));
        assert!(pos(&plan, "report-fn", StepAction::Delete) < pos(&plan, "plant-table", StepAction::Delete));
        assert!(pos(&plan, "report-fn", StepAction::Delete) < pos(&plan, "report-bucket", StepAction::Delete));
        assert_dependency_order(&plan, &snapshot);
    }

    #[test]
    fn test_create_before_delete_repoints_dependents_first() {
        let old = graph(PLANT_STACK);
        let snapshot = provisioned(&old);
        let new = graph(&PLANT_STACK.replacen("name: plants", "name: plants-v2", 1));
        let plan = plan_for(&new, &snapshot).unwrap();

        let create = pos(&plan, "plant-table", StepAction::CreateReplacement);
        let update = pos(&plan, "report-fn", StepAction::Update);
        let delete = pos(&plan, "plant-table", StepAction::DeleteReplaced);
        assert!(create < update);
        assert!(update < delete);
        assert_eq!(plan.steps[delete].physical_id.as_deref(), Some("id-plant-table"));
        assert!(!plan.has_downtime());
        assert_eq!(plan.summary().replace, 1);
    }

    #[test]
    fn test_downtime_replacement_deletes_first() {
        let old = graph(PLANT_STACK);
        let snapshot = provisioned(&old);
        let new = graph(&PLANT_STACK.replacen("partition_key: PlantID", "partition_key: PlantId", 1));
        let plan = plan_for(&new, &snapshot).unwrap();

        let delete = pos(&plan, "plant-table", StepAction::DeleteReplaced);
        let create = pos(&plan, "plant-table", StepAction::CreateReplacement);
        let update = pos(&plan, "report-fn", StepAction::Update);
        assert!(delete < create);
        assert!(create < update);
        assert!(plan.steps[delete].downtime);
        assert!(plan.has_downtime());
    }

    #[test]
    fn test_deposed_cleanup_runs_after_repoint() {
        let graph = graph(PLANT_STACK);
        let mut snapshot = provisioned(&graph);
        snapshot
            .get_mut("plant-table")
            .unwrap()
            .deposed
            .push("tbl-old".to_string());

        let plan = plan_for(&graph, &snapshot).unwrap();
        assert_eq!(plan.step_count(), 2);
        assert!(pos(&plan, "report-fn", StepAction::Update) < pos(&plan, "plant-table", StepAction::DeleteReplaced));
    }

    #[test]
    fn test_conflicting_replacements_fall_back_to_delete_first() {
        let old = graph(
            r"
project: { name: p }
resources:
  a: { type: compute-function, properties: { name: fa, runtime: go1.x, handler: main }, depends_on: [b] }
  b: { type: key-value-table, properties: { name: tb, partition_key: id } }
",
        );
        let new = graph(
            r"
project: { name: p }
resources:
  a: { type: compute-function, properties: { name: fa2, runtime: go1.x, handler: main } }
  b: { type: key-value-table, properties: { name: tb, partition_key: key }, depends_on: [a] }
",
        );
        let snapshot = provisioned(&old);
        let plan = plan_for(&new, &snapshot).unwrap();

        let delete_a = pos(&plan, "a", StepAction::DeleteReplaced);
        let create_a = pos(&plan, "a", StepAction::CreateReplacement);
        let delete_b = pos(&plan, "b", StepAction::DeleteReplaced);
        let create_b = pos(&plan, "b", StepAction::CreateReplacement);
        assert!(delete_a < create_a);
        assert!(delete_a < delete_b);
        assert!(create_a < create_b);
        assert!(plan.steps[create_a].downtime);
        assert_dependency_order(&plan, &snapshot);

        let warned: Vec<&str> = plan.warnings.iter().map(|w| w.resource.as_str()).collect();
        assert!(warned.contains(&"a"));
        assert!(warned.contains(&"b"));
    }

    #[test]
    fn test_renamed_dependent_of_downtime_replacement_deletes_first() {
        let old = graph(PLANT_STACK);
        let snapshot = provisioned(&old);
        let new = graph(
            &PLANT_STACK
                .replacen("partition_key: PlantID", "partition_key: PlantId", 1)
                .replacen("name: plant-report\n", "name: plant-report-v2\n", 1),
        );
        let plan = plan_for(&new, &snapshot).unwrap();

        let delete_fn = pos(&plan, "report-fn", StepAction::DeleteReplaced);
        let delete_table = pos(&plan, "plant-table", StepAction::DeleteReplaced);
        let create_table = pos(&plan, "plant-table", StepAction::CreateReplacement);
        let create_fn = pos(&plan, "report-fn", StepAction::CreateReplacement);
        let route = pos(&plan, "plant-route", StepAction::Update);
        assert!(delete_fn < delete_table);
        assert!(delete_table < create_table);
        assert!(create_table < create_fn);
        assert!(create_fn < route);
        assert!(plan.steps[create_fn].downtime);
        assert_dependency_order(&plan, &snapshot);

        let fn_warning = plan
            .warnings
            .iter()
            .find(|w| w.resource == "report-fn")
            .unwrap();
        assert!(fn_warning.reason.contains("ordering cycle"));
        assert!(plan.warnings.iter().any(|w| w.resource == "plant-table"));
    }

    #[test]
    fn test_sort_reports_steps_on_a_cycle() {
        let step = |index: usize, name: &str| PlanStep {
            index,
            action: StepAction::Update,
            operation: OperationKind::Update,
            name: name.to_string(),
            resource_type: crate::graph::ResourceType::StorageBucket,
            desired: None,
            delta: PropertyDelta::default(),
            physical_id: Some(format!("id-{name}")),
            after: Vec::new(),
            reason: String::new(),
            downtime: false,
        };
        let steps = vec![step(0, "a"), step(1, "b"), step(2, "c")];
        let edges: BTreeSet<(usize, usize)> = [(0, 1), (1, 0), (1, 2)].into_iter().collect();

        let stuck = ExecutionPlanner::sort(&steps, &edges).unwrap_err();
        assert_eq!(stuck, vec![0, 1, 2]);
        let core = ExecutionPlanner::cycle_core(&stuck, &edges);
        assert_eq!(core.into_iter().collect::<Vec<_>>(), vec![0, 1]);
    }
}
