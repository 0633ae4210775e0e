//! In-memory provider.
//!
//! Produces deterministic identities and outputs, records every call and
//! supports failure injection, so plans can be applied end to end without
//! any remote backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::state::StateSnapshot;

use super::{Created, Outputs, Provider};

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// A create call.
    Create,
    /// An update call.
    Update,
    /// A delete call.
    Delete,
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Call kind.
    pub kind: CallKind,
    /// Type tag passed to the call.
    pub type_tag: String,
    /// Identity the call acted on; for creates, the identity assigned.
    pub id: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Live resources by identity.
    resources: HashMap<String, (String, serde_json::Value)>,
    /// Next identity sequence number.
    next_seq: u64,
    /// Call log, in completion order.
    calls: Vec<ProviderCall>,
}

/// Deterministic in-memory provider.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    inner: Mutex<Inner>,
    failures: HashMap<(CallKind, String), ProviderError>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

impl SimulatedProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider holding every resource recorded in `snapshot`,
    /// live or deposed. New identities continue after the highest recorded
    /// sequence number.
    #[must_use]
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        let mut inner = Inner::default();
        let recorded = snapshot
            .resources
            .values()
            .map(|r| (&r.provider_id, &r.type_tag, r.properties.clone()))
            .chain(
                snapshot
                    .deposed
                    .iter()
                    .map(|d| (&d.provider_id, &d.type_tag, serde_json::Value::Null)),
            );
        for (id, type_tag, properties) in recorded {
            if let Some(seq) = id.rsplit('-').next().and_then(|s| s.parse::<u64>().ok()) {
                inner.next_seq = inner.next_seq.max(seq);
            }
            inner.resources.insert(id.clone(), (type_tag.clone(), properties));
        }

        Self {
            inner: Mutex::new(inner),
            ..Self::default()
        }
    }

    /// Makes every `kind` call on `type_tag` fail with `error`.
    #[must_use]
    pub fn fail_on(mut self, kind: CallKind, type_tag: impl Into<String>, error: ProviderError) -> Self {
        self.failures.insert((kind, type_tag.into()), error);
        self
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns the calls made so far, in completion order.
    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Returns true if `id` is live.
    pub async fn exists(&self, id: &str) -> bool {
        self.inner.lock().await.resources.contains_key(id)
    }

    /// Returns the number of live resources.
    pub async fn resource_count(&self) -> usize {
        self.inner.lock().await.resources.len()
    }

    /// Returns the largest number of calls that were in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, kind: CallKind, type_tag: &str) -> ProviderResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.failures.get(&(kind, type_tag.to_string())) {
            Some(error) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(error.clone())
            }
            None => Ok(()),
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builds the outputs for a resource: inputs echoed back, then the computed
/// attributes.
fn outputs_for(id: &str, type_tag: &str, properties: &serde_json::Value) -> Outputs {
    let mut outputs = properties.as_object().cloned().unwrap_or_default();
    let mut parts = type_tag.split(':');
    let _provider = parts.next();
    let service = parts.next().unwrap_or("core");

    let name = properties
        .get("name")
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| id.to_string(), str::to_string);

    outputs.insert(String::from("id"), serde_json::json!(id));
    outputs.insert(
        String::from("arn"),
        serde_json::json!(format!("arn:sim:{service}::{id}")),
    );
    outputs.insert(String::from("name"), serde_json::json!(name));
    outputs.insert(
        String::from("dns_name"),
        serde_json::json!(format!("{id}.{service}.sim.internal")),
    );
    outputs
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn create(&self, type_tag: &str, properties: &serde_json::Value) -> ProviderResult<Created> {
        self.enter(CallKind::Create, type_tag).await?;

        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        let kind = type_tag.rsplit(':').next().unwrap_or(type_tag).to_lowercase();
        let id = format!("{kind}-{:06}", inner.next_seq);

        inner
            .resources
            .insert(id.clone(), (type_tag.to_string(), properties.clone()));
        inner.calls.push(ProviderCall {
            kind: CallKind::Create,
            type_tag: type_tag.to_string(),
            id: Some(id.clone()),
        });
        drop(inner);
        self.leave();

        debug!("Simulated create {type_tag} -> {id}");
        let outputs = outputs_for(&id, type_tag, properties);
        Ok(Created { id, outputs })
    }

    async fn update(
        &self,
        id: &str,
        type_tag: &str,
        properties: &serde_json::Value,
    ) -> ProviderResult<Outputs> {
        self.enter(CallKind::Update, type_tag).await?;

        let mut inner = self.inner.lock().await;
        inner.calls.push(ProviderCall {
            kind: CallKind::Update,
            type_tag: type_tag.to_string(),
            id: Some(id.to_string()),
        });
        let result = match inner.resources.get_mut(id) {
            Some(entry) => {
                *entry = (type_tag.to_string(), properties.clone());
                Ok(outputs_for(id, type_tag, properties))
            }
            None => Err(ProviderError::NotFound { id: id.to_string() }),
        };
        drop(inner);
        self.leave();

        debug!("Simulated update {type_tag} {id}");
        result
    }

    async fn delete(&self, id: &str, type_tag: &str) -> ProviderResult<()> {
        self.enter(CallKind::Delete, type_tag).await?;

        let mut inner = self.inner.lock().await;
        inner.calls.push(ProviderCall {
            kind: CallKind::Delete,
            type_tag: type_tag.to_string(),
            id: Some(id.to_string()),
        });
        let removed = inner.resources.remove(id);
        drop(inner);
        self.leave();

        debug!("Simulated delete {type_tag} {id}");
        removed
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
