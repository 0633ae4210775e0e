//! Definition hashing for change detection.
//!
//! This module provides deterministic hashing of the stack definition and of
//! resolved property bags, so snapshots and saved plans can record exactly
//! what they were computed from.

use sha2::{Digest, Sha256};

use super::spec::StackConfig;

/// Hasher for computing definition and property hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire stack definition.
    ///
    /// This hash changes when any part of the definition changes.
    #[must_use]
    pub fn hash_config(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());
        hasher.update(config.settings.api_endpoint.to_string().as_bytes());

        for (name, value) in &config.variables {
            hasher.update(name.as_bytes());
            hasher.update(self.hash_value(value).as_bytes());
        }

        for (name, block) in &config.defaults {
            hasher.update(name.as_bytes());
            hasher.update(self.hash_value(&serde_json::Value::Object(block.clone())).as_bytes());
        }

        // Resource order matters for tie-breaking, so it is hashed as declared.
        for resource in &config.resources {
            hasher.update(resource.id.as_bytes());
            hasher.update(resource.type_tag.as_bytes());
            hasher.update(
                self.hash_value(&serde_json::Value::Object(resource.properties.clone()))
                    .as_bytes(),
            );
            for dep in &resource.depends_on {
                hasher.update(dep.as_bytes());
            }
            for field in &resource.immutable {
                hasher.update(field.as_bytes());
            }
            for name in &resource.extends {
                hasher.update(name.as_bytes());
            }
            hasher.update(resource.replace_strategy.to_string().as_bytes());
            if let Some(endpoint) = resource.endpoint {
                hasher.update(endpoint.to_string().as_bytes());
            }
        }

        if let Some(guardrails) = &config.guardrails {
            if let Some(max_deletes) = guardrails.max_deletes {
                hasher.update(max_deletes.to_be_bytes());
            }
            for id in &guardrails.prevent_destroy {
                hasher.update(id.as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of a JSON value.
    ///
    /// Object keys are serialized in sorted order, so equal values always
    /// produce equal hashes.
    #[must_use]
    pub fn hash_value(&self, value: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
