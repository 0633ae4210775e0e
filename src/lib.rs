// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # stackplan
//!
//! A declarative, idempotent reconciler for stacks of interdependent
//! resources.
//!
//! ## Overview
//!
//! A stack is declared as a set of resources whose properties may reference
//! the outputs of other resources (`${vpc.id}`). stackplan:
//!
//! - Builds the dependency graph from those references and rejects cycles
//! - Diffs the graph against the recorded state snapshot
//! - Orders the resulting creates, updates, deletes and replacements into
//!   dependency-respecting waves
//! - Applies the plan concurrently through a [`provider::Provider`],
//!   persisting the new snapshot under a state lock
//!
//! ## Architecture
//!
//! 1. **Desired State**: Defined in `stackplan.yaml`
//! 2. **Recorded State**: The last applied snapshot, stored locally or in S3
//! 3. **Reconciler**: Plans the difference and executes it
//!
//! ## Modules
//!
//! - [`config`]: Definition parsing, validation and hashing
//! - [`graph`]: Resource nodes, references and the dependency graph
//! - [`state`]: State storage backends (local, S3) and locking
//! - [`provider`]: Provider abstraction, simulated and HTTP providers
//! - [`planner`]: Diff computation, change plans and plan execution
//! - [`reconciler`]: Plan and apply entry points
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: my-stack
//!   environment: dev
//!
//! resources:
//!   - id: vpc
//!     type: aws:ec2:Vpc
//!     properties:
//!       cidr: 10.0.0.0/16
//!     immutable: [cidr]
//!   - id: alb_sg
//!     type: aws:ec2:SecurityGroup
//!     properties:
//!       vpc_id: ${vpc.id}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{Result, StackError};
pub use graph::{Graph, ReferenceResolver, ResourceNode};
pub use planner::{ChangePlan, DiffEngine, PlanExecutor};
pub use provider::{HttpProvider, Provider, SimulatedProvider};
pub use reconciler::{ReconciliationResult, Reconciler};
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
