// ============================================================================
// Linting
// ============================================================================

#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::cognitive_complexity)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackwright
//!
//! A declarative provisioning orchestrator for cloud resource stacks.
//!
//! ## Overview
//!
//! Stackwright takes a description of named resources (storage buckets,
//! key-value tables, compute functions and API routes) and converges real
//! infrastructure to it:
//!
//! - Declare resources and their references in `stackwright.yaml`
//! - Preview the ordered changes before anything is touched
//! - Apply them with retries, bounded parallelism and per-step commits
//! - Replace immutable resources without leaving dangling references
//!
//! ## Architecture
//!
//! A run is a pipeline:
//!
//! 1. **Graph**: the description is validated into an acyclic resource graph
//! 2. **Diff**: the graph is compared with the state snapshot
//! 3. **Plan**: operations are expanded into ordered provider steps
//! 4. **Apply**: steps run against a provider, each committed to state
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, validation and hashing
//! - [`graph`]: Typed resource nodes, schemas and the graph builder
//! - [`planner`]: Diff engine, execution planner and applier
//! - [`provider`]: Provider trait, HTTP client and simulated provider
//! - [`state`]: State snapshots, leases and storage backends (local, S3)
//! - [`orchestrator`]: Runs the whole pipeline under the state lease
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: plant-report
//!   environment: dev
//!
//! resources:
//!   plant-table:
//!     type: key-value-table
//!     properties: { name: plants, partition_key: PlantID }
//!   report-fn:
//!     type: compute-function
//!     properties:
//!       name: plant-report
//!       runtime: go1.x
//!       handler: main
//!       env.TABLE_NAME: { ref: plant-table }
//!     grants:
//!       - { resource: plant-table, access: read }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{Result, StackError};
pub use graph::{GraphBuilder, ResourceGraph, ResourceNode, ResourceType};
pub use orchestrator::{Orchestrator, Preview, RunOptions, RunOutcome};
pub use planner::{ApplyReport, DiffEngine, ExecutionPlanner, Plan, PlanApplier};
pub use provider::{HttpProvider, Provider, SimulatedProvider};
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
