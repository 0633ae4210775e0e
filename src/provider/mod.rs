//! Provider abstraction.
//!
//! The engine never talks to a cloud API directly. Every create, update and
//! delete goes through a [`Provider`], which owns resource identities and
//! reports the output attributes other nodes may reference.

mod http;
mod simulated;

pub use http::HttpProvider;
pub use simulated::{CallKind, ProviderCall, SimulatedProvider};

use async_trait::async_trait;

use crate::error::ProviderResult;

/// Output attributes reported for a resource.
pub type Outputs = serde_json::Map<String, serde_json::Value>;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Provider-assigned identity.
    pub id: String,
    /// Output attributes.
    pub outputs: Outputs,
}

/// Backend that materializes resources.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource and returns its identity and outputs.
    async fn create(&self, type_tag: &str, properties: &serde_json::Value) -> ProviderResult<Created>;

    /// Updates a resource in place and returns its new outputs.
    async fn update(
        &self,
        id: &str,
        type_tag: &str,
        properties: &serde_json::Value,
    ) -> ProviderResult<Outputs>;

    /// Deletes a resource.
    async fn delete(&self, id: &str, type_tag: &str) -> ProviderResult<()>;

    /// Gets the provider name, for logs.
    fn name(&self) -> &'static str;
}
