//! Resource graph module.
//!
//! This module turns the declared resources into typed nodes and builds
//! the dependency graph:
//! - Node model with parsed property references
//! - Graph construction, cycle detection and ordering

mod node;
mod resolver;

pub use node::{PropertyValue, Reference, ResourceNode, Segment, build_nodes, deep_merge};
pub use resolver::{Graph, ReferenceResolver};
