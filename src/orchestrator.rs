//! Orchestrator for a single run.
//!
//! This module ties the pipeline together: acquire the lease, load the
//! snapshot, build the graph, diff, plan, check downtime acknowledgement,
//! apply while renewing the lease, record history, and release the lease.

use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ExecutionConfig, StackConfig};
use crate::error::{PlanError, Result};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::planner::{ApplyReport, DiffEngine, ExecutionPlanner, Plan, PlanApplier};
use crate::provider::{Provider, RetryPolicy};
use crate::state::{
    HeldLease, LeaseOptions, RunHistoryEntry, RunKind, StateSnapshot, StateStore, acquire_lease,
    generate_holder_id,
};

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Bounded wait for the state lease.
    pub lease: LeaseOptions,
    /// Maximum steps in flight.
    pub parallelism: usize,
    /// Bound on the time spent waiting for the provider.
    pub run_timeout: Option<Duration>,
    /// Retry policy for transient provider errors.
    pub retry: RetryPolicy,
    /// Whether every downtime replacement is acknowledged up front.
    pub accept_downtime: bool,
    /// Resources whose downtime replacement was acknowledged one by one.
    pub acknowledged_downtime: BTreeSet<String>,
    /// Lease holder identifier.
    pub holder: String,
}

impl RunOptions {
    /// Derives run options from the execution settings.
    #[must_use]
    pub fn from_config(execution: &ExecutionConfig) -> Self {
        Self {
            lease: LeaseOptions {
                max_wait: Duration::from_secs(execution.lock_wait_secs),
                poll_interval: Duration::from_millis(execution.lock_poll_ms),
            },
            parallelism: execution.parallelism.max(1),
            run_timeout: execution.run_timeout_secs.map(Duration::from_secs),
            retry: RetryPolicy::from(&execution.retry),
            accept_downtime: false,
            acknowledged_downtime: BTreeSet::new(),
            holder: generate_holder_id(),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

/// Result of a dry run.
#[derive(Debug, Serialize)]
pub struct Preview {
    /// The plan an apply would run now.
    pub plan: Plan,
    /// Resources already up to date.
    pub unchanged: usize,
}

/// Result of an apply or destroy run.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    /// Type of run.
    pub kind: RunKind,
    /// The plan that was executed.
    pub plan: Plan,
    /// Apply report; `None` when there was nothing to do.
    pub report: Option<ApplyReport>,
}

impl RunOutcome {
    /// Returns true if the run converged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.report.as_ref().is_none_or(ApplyReport::is_success)
    }

    /// Converts a halted run into an error.
    ///
    /// # Errors
    ///
    /// Returns `ApplyError::Halted` if any step failed.
    pub fn into_result(self) -> Result<Self> {
        match self.report.as_ref().and_then(ApplyReport::error) {
            Some(err) => Err(err.into()),
            None => Ok(self),
        }
    }
}

/// Runs the pipeline for one stack configuration.
pub struct Orchestrator<'a> {
    /// Configuration.
    config: &'a StackConfig,
    /// State store.
    store: &'a dyn StateStore,
    /// Provider.
    provider: &'a dyn Provider,
    /// Run settings.
    options: RunOptions,
    hasher: ConfigHasher,
    builder: GraphBuilder,
    diff_engine: DiffEngine,
    planner: ExecutionPlanner,
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator with options taken from the configuration.
    #[must_use]
    pub fn new(
        config: &'a StackConfig,
        store: &'a dyn StateStore,
        provider: &'a dyn Provider,
    ) -> Self {
        Self {
            config,
            store,
            provider,
            options: RunOptions::from_config(&config.execution),
            hasher: ConfigHasher::new(),
            builder: GraphBuilder::new(),
            diff_engine: DiffEngine::new(),
            planner: ExecutionPlanner::new(),
        }
    }

    /// Replaces the run options.
    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the run options.
    #[must_use]
    pub const fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Builds and validates the resource graph.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the description is not a valid DAG.
    pub fn build_graph(&self) -> Result<ResourceGraph> {
        Ok(self.builder.build_config(self.config)?)
    }

    /// Computes the plan an apply would run, without taking the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the description is invalid, the state cannot be
    /// loaded, or no valid ordering exists.
    pub async fn preview(&self) -> Result<Preview> {
        let graph = self.build_graph()?;
        let snapshot = self.load_snapshot().await?;
        let hash = self.hasher.hash_config(self.config);

        let diff = self.diff_engine.compute(&graph, &snapshot)?;
        let unchanged = diff.unchanged;
        let plan = self.planner.plan(&diff, &graph, &snapshot, &hash)?;

        Ok(Preview { plan, unchanged })
    }

    /// Converges infrastructure onto the description.
    ///
    /// Validation happens before the lease is taken so that an invalid
    /// description never blocks other runs.
    ///
    /// # Errors
    ///
    /// Returns validation, planning, lease, or state errors. A failed step
    /// is reported through the outcome; see [`RunOutcome::into_result`].
    pub async fn apply(&self) -> Result<RunOutcome> {
        let graph = self.build_graph()?;
        let hash = self.hasher.hash_config(self.config);
        self.run(&graph, &hash, RunKind::Apply).await
    }

    /// Deletes every resource recorded in the snapshot.
    ///
    /// # Errors
    ///
    /// Returns planning, lease, or state errors.
    pub async fn destroy(&self) -> Result<RunOutcome> {
        self.run(&ResourceGraph::empty(), "", RunKind::Destroy).await
    }

    async fn run(&self, graph: &ResourceGraph, hash: &str, kind: RunKind) -> Result<RunOutcome> {
        info!(
            "Starting {kind} for {} ({} resources declared)",
            self.config.qualified_name(),
            graph.len()
        );

        let lock = acquire_lease(self.store, &self.options.holder, self.options.lease).await?;
        debug!("Acquired state lease {}", lock.lock_id);
        let lease = HeldLease::new(self.store, lock);

        let result = self.run_locked(graph, hash, kind, &lease).await;

        if let Err(e) = lease.release().await {
            warn!("Failed to release state lease: {e}");
        }

        result
    }

    async fn run_locked(
        &self,
        graph: &ResourceGraph,
        hash: &str,
        kind: RunKind,
        lease: &HeldLease<'_>,
    ) -> Result<RunOutcome> {
        let snapshot = self.load_snapshot().await?;
        let diff = self.diff_engine.compute(graph, &snapshot)?;
        let plan = self.planner.plan(&diff, graph, &snapshot, hash)?;

        // The plan is recomputed under the lease and may differ from the one
        // the operator confirmed.
        let unacknowledged: Vec<String> = plan
            .warnings
            .iter()
            .map(|w| w.resource.clone())
            .filter(|r| {
                !self.options.accept_downtime && !self.options.acknowledged_downtime.contains(r)
            })
            .collect();
        if !unacknowledged.is_empty() {
            return Err(PlanError::DowntimeNotAcknowledged {
                resources: unacknowledged,
            }
            .into());
        }

        if plan.is_empty() {
            info!("No changes required");
            return Ok(RunOutcome {
                kind,
                plan,
                report: None,
            });
        }

        let applier = PlanApplier::new(self.provider)
            .with_retry(self.options.retry)
            .with_parallelism(self.options.parallelism)
            .with_timeout(self.options.run_timeout)
            .with_lease(lease);

        let mut report = {
            let apply = applier.apply(&plan, self.store, snapshot);
            tokio::pin!(apply);
            tokio::select! {
                report = &mut apply => report,
                () = lease.keep_alive() => apply.await,
            }
        };

        let mut entry = RunHistoryEntry::new(kind, hash);
        entry.committed = report.committed();
        entry.failed = report.failed();
        entry.skipped = report.skipped();
        entry.success = report.is_success();
        entry.error = report.error().map(|e| e.to_string());

        if entry.success {
            report.snapshot.description_hash = hash.to_string();
        }
        report.snapshot.add_history(entry);
        lease.renew().await?;
        self.store.save(&report.snapshot).await?;

        info!(
            "{kind} finished: {} committed, {} failed, {} skipped",
            report.committed(),
            report.failed(),
            report.skipped()
        );

        Ok(RunOutcome {
            kind,
            plan,
            report: Some(report),
        })
    }

    async fn load_snapshot(&self) -> Result<StateSnapshot> {
        let project = &self.config.project;
        match self.store.load().await? {
            Some(snapshot) => {
                snapshot.check_owner(&project.name, &project.environment)?;
                Ok(snapshot)
            }
            None => Ok(StateSnapshot::new(&project.name, &project.environment)),
        }
    }
}
