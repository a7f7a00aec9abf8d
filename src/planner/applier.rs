//! Plan applier.
//!
//! This module executes a [`Plan`] against a provider and commits each
//! confirmed result to the state store before any step that depends on it
//! can start.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHasher;
use crate::error::{ApplyError, ProviderError, StackError};
use crate::graph::{AccessGrant, PropertyValue, ResourceNode};
use crate::provider::{
    CreateRequest, Provider, ProviderResult, ResolvedGrant, ResolvedValue, RetryPolicy,
    UpdateRequest,
};
use crate::state::{HeldLease, ResourceRecord, SharedSnapshot, StateSnapshot, StateStore};

use super::plan::{Plan, PlanStep, StepAction};

/// Executes plans against a provider.
pub struct PlanApplier<'a> {
    /// Provider receiving the calls.
    provider: &'a dyn Provider,
    /// Retry policy for transient errors.
    retry: RetryPolicy,
    /// Maximum steps in flight.
    parallelism: usize,
    /// Bound on the time spent waiting for the provider.
    timeout: Option<Duration>,
    /// Lease every commit must renew.
    lease: Option<&'a HeldLease<'a>>,
    /// Fingerprint hasher.
    hasher: ConfigHasher,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    /// The provider confirmed the step and the snapshot was saved.
    Committed {
        /// Physical identifier the step produced or touched.
        physical_id: Option<String>,
    },
    /// The step failed.
    Failed {
        /// Failure description.
        error: String,
    },
    /// The run stopped waiting; the provider may still complete the call.
    TimedOut,
    /// The step was never attempted.
    Skipped {
        /// Why the step did not run.
        reason: String,
    },
}

/// Report line for one plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    /// Step position in the plan.
    pub index: usize,
    /// Step action.
    pub action: StepAction,
    /// Logical name.
    pub name: String,
    /// What happened.
    #[serde(flatten)]
    pub status: StepStatus,
}

/// Result of applying a plan.
#[derive(Debug, Serialize)]
pub struct ApplyReport {
    /// One outcome per plan step, in plan order.
    pub outcomes: Vec<StepOutcome>,
    /// Snapshot as last committed.
    #[serde(skip)]
    pub snapshot: StateSnapshot,
}

#[derive(Debug, Error)]
enum StepFailure {
    #[error("{0}")]
    Provider(ProviderError),
    #[error("timed out waiting for the provider; outcome unknown")]
    TimedOut,
    #[error("{0}")]
    Unresolved(String),
    #[error("provider call succeeded but the state commit failed: {0}")]
    Commit(StackError),
    #[error("the state lease was lost to another run")]
    LeaseLost,
}

impl<'a> PlanApplier<'a> {
    /// Creates an applier that runs one step at a time.
    #[must_use]
    pub fn new(provider: &'a dyn Provider) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            parallelism: 1,
            timeout: None,
            lease: None,
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the number of steps allowed in flight.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Bounds how long the run waits for provider calls.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Commits only while `lease` is held; once it is lost no new step starts.
    #[must_use]
    pub const fn with_lease(mut self, lease: &'a HeldLease<'a>) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Applies `plan`, committing each confirmed step to `store`.
    ///
    /// In sequential mode the first failure halts the run. With parallelism
    /// above one, a failure only blocks the steps that follow it; a timeout
    /// always stops new steps from starting.
    pub async fn apply(
        &self,
        plan: &Plan,
        store: &dyn StateStore,
        snapshot: StateSnapshot,
    ) -> ApplyReport {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let sequential = self.parallelism <= 1;
        let shared = SharedSnapshot::new(store, snapshot).with_lease(self.lease);

        let mut statuses: Vec<Option<StepStatus>> = vec![None; plan.steps.len()];
        let mut started = vec![false; plan.steps.len()];
        let mut halted = false;
        let mut in_flight = FuturesUnordered::new();

        info!(
            steps = plan.steps.len(),
            parallelism = self.parallelism,
            "Applying plan"
        );

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) || shared.lease_lost() {
                halted = true;
            }

            if !halted {
                for (i, step) in plan.steps.iter().enumerate() {
                    if in_flight.len() >= self.parallelism {
                        break;
                    }
                    if started[i] {
                        continue;
                    }
                    let ready = step.after.iter().all(|&p| {
                        matches!(statuses.get(p), Some(Some(StepStatus::Committed { .. })))
                    });
                    if ready {
                        started[i] = true;
                        in_flight.push(self.run_step(i, step, &shared, deadline));
                    } else if sequential {
                        break;
                    }
                }
            }

            let Some((index, status)) = in_flight.next().await else {
                break;
            };

            match &status {
                StepStatus::Committed { .. } => {}
                StepStatus::TimedOut => halted = true,
                _ if sequential => halted = true,
                _ => {}
            }
            statuses[index] = Some(status);
        }
        drop(in_flight);

        let outcomes = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let status = statuses[i].clone().unwrap_or_else(|| StepStatus::Skipped {
                    reason: step
                        .after
                        .iter()
                        .find(|&&p| {
                            !matches!(statuses.get(p), Some(Some(StepStatus::Committed { .. })))
                        })
                        .map_or_else(
                            || String::from("run halted"),
                            |p| format!("blocked by step {p}"),
                        ),
                });
                StepOutcome {
                    index: i,
                    action: step.action,
                    name: step.name.clone(),
                    status,
                }
            })
            .collect();

        let report = ApplyReport {
            outcomes,
            snapshot: shared.into_inner(),
        };

        info!(
            committed = report.committed(),
            failed = report.failed(),
            skipped = report.skipped(),
            "Apply finished"
        );

        report
    }

    async fn run_step(
        &self,
        index: usize,
        step: &PlanStep,
        shared: &SharedSnapshot<'_>,
        deadline: Option<Instant>,
    ) -> (usize, StepStatus) {
        let _entry = shared.lock_entry(&step.name).await;
        info!(
            step = index,
            action = %step.action,
            resource = %step.name,
            "Applying step"
        );

        let status = match self.execute(step, shared, deadline).await {
            Ok(physical_id) => {
                info!(step = index, resource = %step.name, "Step committed");
                StepStatus::Committed { physical_id }
            }
            Err(StepFailure::TimedOut) => {
                error!(step = index, resource = %step.name, "Timed out waiting for provider");
                StepStatus::TimedOut
            }
            Err(failure) => {
                error!(step = index, resource = %step.name, error = %failure, "Step failed");
                StepStatus::Failed {
                    error: failure.to_string(),
                }
            }
        };

        (index, status)
    }

    async fn execute(
        &self,
        step: &PlanStep,
        shared: &SharedSnapshot<'_>,
        deadline: Option<Instant>,
    ) -> Result<Option<String>, StepFailure> {
        // No provider call is issued without the lease.
        if let Err(e) = shared.renew_lease().await {
            warn!("Not starting {} {}: {e}", step.action, step.name);
            return Err(StepFailure::LeaseLost);
        }
        let label = format!("{} {}", step.action, step.name);

        match step.action {
            StepAction::Create | StepAction::CreateReplacement => {
                let node = desired(step)?;
                let replacing = step.action == StepAction::CreateReplacement;
                let mut request = shared.read(|s| create_request(node, s)).await?;
                if replacing && !step.downtime {
                    // The old instance still holds the plain logical name.
                    request.logical_name = temporary_identity(&node.name);
                }
                let physical_id = self
                    .call(deadline, self.retry.run(&label, || self.provider.create(&request)))
                    .await?;

                let fingerprint = self.hasher.hash_node(node);
                shared
                    .commit(|s| {
                        let mut record = ResourceRecord::from_node(node, &physical_id, &fingerprint);
                        if replacing && let Some(previous) = s.get(&node.name) {
                            record.deposed.clone_from(&previous.deposed);
                            record.deposed.push(previous.physical_id.clone());
                        }
                        s.upsert(record);
                    })
                    .await
                    .map_err(StepFailure::Commit)?;

                Ok(Some(physical_id))
            }
            StepAction::Update => {
                let node = desired(step)?;
                let (physical_id, request) = shared.read(|s| update_request(step, node, s)).await?;

                if request.is_empty() {
                    debug!("No provider-side change for {}, recording only", step.name);
                } else {
                    self.call(
                        deadline,
                        self.retry
                            .run(&label, || self.provider.update(&physical_id, &request)),
                    )
                    .await?;
                }

                let fingerprint = self.hasher.hash_node(node);
                shared
                    .commit(|s| {
                        if let Some(record) = s.get_mut(&node.name) {
                            record.apply_node(node, &fingerprint);
                        }
                        s.touch();
                    })
                    .await
                    .map_err(StepFailure::Commit)?;

                Ok(Some(physical_id))
            }
            StepAction::Delete | StepAction::DeleteReplaced => {
                let physical_id = step.physical_id.as_deref().ok_or_else(|| {
                    StepFailure::Unresolved(format!("no instance recorded for '{}'", step.name))
                })?;

                match self
                    .call(deadline, self.retry.run(&label, || self.provider.delete(physical_id)))
                    .await
                {
                    Ok(()) => {}
                    Err(StepFailure::Provider(e)) if e.is_not_found() => {
                        warn!("{physical_id} was already gone, recording deletion");
                    }
                    Err(e) => return Err(e),
                }

                let old_instance = step.action == StepAction::DeleteReplaced;
                shared
                    .commit(|s| {
                        if old_instance && s.clear_deposed(&step.name, physical_id) {
                            return;
                        }
                        if s.physical_id(&step.name) == Some(physical_id) {
                            s.remove(&step.name);
                        }
                    })
                    .await
                    .map_err(StepFailure::Commit)?;

                Ok(None)
            }
        }
    }

    /// Awaits a provider call within the run deadline.
    async fn call<T>(
        &self,
        deadline: Option<Instant>,
        call: impl Future<Output = ProviderResult<T>>,
    ) -> Result<T, StepFailure> {
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call)
                .await
                .map_err(|_| StepFailure::TimedOut)?,
            None => call.await,
        };
        result.map_err(StepFailure::Provider)
    }
}

/// Identity a create-before-delete replacement is created under.
fn temporary_identity(name: &str) -> String {
    format!("{name}~new")
}

fn desired(step: &PlanStep) -> Result<&ResourceNode, StepFailure> {
    step.desired
        .as_ref()
        .ok_or_else(|| StepFailure::Unresolved(format!("step for '{}' has no declaration", step.name)))
}

fn resolve_value(value: &PropertyValue, snapshot: &StateSnapshot) -> Result<ResolvedValue, StepFailure> {
    Ok(match value {
        PropertyValue::Boolean(b) => ResolvedValue::Boolean(*b),
        PropertyValue::Number(n) => ResolvedValue::Number(*n),
        PropertyValue::String(s) => ResolvedValue::String(s.clone()),
        PropertyValue::Reference { target } => ResolvedValue::String(resolve_id(target, snapshot)?),
    })
}

fn resolve_id(target: &str, snapshot: &StateSnapshot) -> Result<String, StepFailure> {
    snapshot
        .physical_id(target)
        .map(ToString::to_string)
        .ok_or_else(|| StepFailure::Unresolved(format!("'{target}' has no recorded instance")))
}

fn resolve_grants(
    grants: &[AccessGrant],
    snapshot: &StateSnapshot,
) -> Result<Vec<ResolvedGrant>, StepFailure> {
    grants
        .iter()
        .map(|g| {
            Ok(ResolvedGrant {
                target: resolve_id(&g.resource, snapshot)?,
                access: g.access,
            })
        })
        .collect()
}

fn create_request(node: &ResourceNode, snapshot: &StateSnapshot) -> Result<CreateRequest, StepFailure> {
    let properties = node
        .properties
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(value, snapshot)?)))
        .collect::<Result<_, StepFailure>>()?;

    Ok(CreateRequest {
        resource_type: node.resource_type,
        logical_name: node.name.clone(),
        properties,
        grants: resolve_grants(&node.grants, snapshot)?,
    })
}

fn update_request(
    step: &PlanStep,
    node: &ResourceNode,
    snapshot: &StateSnapshot,
) -> Result<(String, UpdateRequest), StepFailure> {
    let physical_id = resolve_id(&node.name, snapshot)?;
    let mut request = UpdateRequest::default();

    for change in &step.delta.changes {
        match &change.new {
            Some(value) => {
                request
                    .set
                    .insert(change.key.clone(), resolve_value(value, snapshot)?);
            }
            None => request.unset.push(change.key.clone()),
        }
    }

    // References to replaced resources are re-sent with the new identifier.
    for (key, target) in node.references() {
        if step.delta.rebind.contains(target) {
            request
                .set
                .insert(key.to_string(), ResolvedValue::String(resolve_id(target, snapshot)?));
        }
    }

    let grants_moved = node
        .grants
        .iter()
        .any(|g| step.delta.rebind.contains(&g.resource));
    if step.delta.grants_changed || grants_moved {
        request.grants = Some(resolve_grants(&node.grants, snapshot)?);
    }

    Ok((physical_id, request))
}

impl ApplyReport {
    /// Returns the number of committed steps.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Committed { .. }))
            .count()
    }

    /// Returns the number of failed or timed-out steps.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Failed { .. } | StepStatus::TimedOut))
            .count()
    }

    /// Returns the number of steps never attempted.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Skipped { .. }))
            .count()
    }

    /// Returns true if every step committed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.committed() == self.outcomes.len()
    }

    /// Returns the first failed step.
    #[must_use]
    pub fn first_failure(&self) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|o| matches!(o.status, StepStatus::Failed { .. } | StepStatus::TimedOut))
    }

    /// Returns logical names of committed steps, in plan order.
    #[must_use]
    pub fn committed_names(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Committed { .. }))
            .map(|o| o.name.as_str())
            .collect()
    }

    /// Builds the error describing a halted run, if the run failed.
    #[must_use]
    pub fn error(&self) -> Option<ApplyError> {
        let failure = self.first_failure()?;
        let reason = match &failure.status {
            StepStatus::Failed { error } => error.clone(),
            _ => String::from("timed out waiting for the provider; outcome unknown"),
        };
        Some(ApplyError::Halted {
            resource: failure.name.clone(),
            operation: failure.action.to_string(),
            reason,
            committed: self.committed(),
            failed: self.failed(),
            skipped: self.skipped(),
        })
    }
}
