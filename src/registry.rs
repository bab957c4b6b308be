//! Plugin registry for AI services.
//!
//! The registry owns every `(descriptor, plugin)` pair for the life of the
//! process. It is read-mostly: selection takes a read lock and clones the
//! `Arc` handle out, so no provider call ever happens under the lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::providers::ProviderError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    PromptOptimizer,
    Analyzer,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    PromptOptimization,
    DocumentAnalysis,
    ChatProcessing,
    SeoGeneration,
    CryptoAnalysis,
    GenericAnalysis,
}

/// Registry entry metadata. `capabilities` and `service_types` never change
/// after registration; only `available` moves, driven by health probes.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub capabilities: BTreeSet<Capability>,
    pub service_types: BTreeSet<ServiceType>,
    pub priority: i32,
    pub available: bool,
}

impl ServiceDescriptor {
    /// Two descriptors describe the same registration if everything but the
    /// derived availability flag matches.
    fn same_shape(&self, other: &ServiceDescriptor) -> bool {
        self.id == other.id
            && self.provider == other.provider
            && self.model == other.model
            && self.capabilities == other.capabilities
            && self.service_types == other.service_types
            && self.priority == other.priority
    }
}

#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct InvokeOutput {
    pub content: String,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

/// The capability surface every provider plugin implements.
#[async_trait]
pub trait AiService: Send + Sync {
    async fn invoke(&self, input: &str, opts: &InvokeOptions)
        -> Result<InvokeOutput, ProviderError>;

    async fn health(&self) -> bool;

    fn descriptor(&self) -> ServiceDescriptor;

    fn capabilities(&self) -> BTreeSet<Capability> {
        self.descriptor().capabilities
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service '{0}' is already registered with a different shape")]
    Conflict(String),
    #[error("no service available for {0:?}")]
    NoService(ServiceType),
}

struct Entry {
    descriptor: ServiceDescriptor,
    plugin: Arc<dyn AiService>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Re-registering the same id is idempotent as long
    /// as the descriptor shape matches; a differing shape is a conflict.
    pub fn register(
        &self,
        plugin: Arc<dyn AiService>,
        descriptor: ServiceDescriptor,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if let Some(existing) = entries.get(&descriptor.id) {
            if !existing.descriptor.same_shape(&descriptor) {
                return Err(RegistryError::Conflict(descriptor.id));
            }
        }
        info!(
            id = %descriptor.id,
            provider = %descriptor.provider,
            priority = descriptor.priority,
            "registered AI service"
        );
        entries.insert(
            descriptor.id.clone(),
            Entry { descriptor, plugin },
        );
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let removed = entries.remove(id).is_some();
        if removed {
            info!(id, "unregistered AI service");
        }
        removed
    }

    /// All descriptors ordered by (priority ascending, id lexicographic).
    pub fn list(&self) -> Vec<ServiceDescriptor> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut descriptors: Vec<_> =
            entries.values().map(|e| e.descriptor.clone()).collect();
        descriptors.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
        descriptors
    }

    /// Best candidate for a stage, or an error when the type has none.
    pub fn select(
        &self,
        service_type: ServiceType,
        preferred: Option<Capability>,
    ) -> Result<(ServiceDescriptor, Arc<dyn AiService>), RegistryError> {
        self.select_ranked(service_type, preferred)?
            .into_iter()
            .next()
            .ok_or(RegistryError::NoService(service_type))
    }

    /// Every candidate for a stage in preference order. Unavailable plugins
    /// sort behind available ones but are never dropped entirely: when the
    /// whole pool is unhealthy the best candidate is still worth one try.
    pub fn select_ranked(
        &self,
        service_type: ServiceType,
        preferred: Option<Capability>,
    ) -> Result<Vec<(ServiceDescriptor, Arc<dyn AiService>)>, RegistryError> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut candidates: Vec<(&ServiceDescriptor, &Arc<dyn AiService>)> = entries
            .values()
            .filter(|e| e.descriptor.service_types.contains(&service_type))
            .map(|e| (&e.descriptor, &e.plugin))
            .collect();
        if candidates.is_empty() {
            return Err(RegistryError::NoService(service_type));
        }

        if let Some(capability) = preferred {
            let matching: Vec<_> = candidates
                .iter()
                .filter(|(d, _)| d.capabilities.contains(&capability))
                .cloned()
                .collect();
            if !matching.is_empty() {
                candidates = matching;
            }
        }

        candidates.sort_by(|(a, _), (b, _)| {
            (!a.available, a.priority, &a.id).cmp(&(!b.available, b.priority, &b.id))
        });

        Ok(candidates
            .into_iter()
            .map(|(d, p)| (d.clone(), p.clone()))
            .collect())
    }

    /// Probe every plugin concurrently and fold the results back into the
    /// availability flags. A probe that exceeds `probe_timeout` counts as
    /// unhealthy; the aggregate call returns once all probes settle.
    pub async fn health_check_all(&self, probe_timeout: Duration) -> BTreeMap<String, bool> {
        let plugins: Vec<(String, Arc<dyn AiService>)> = {
            let entries = self.entries.read().expect("registry lock poisoned");
            entries
                .iter()
                .map(|(id, e)| (id.clone(), e.plugin.clone()))
                .collect()
        };

        let probes = plugins.into_iter().map(|(id, plugin)| async move {
            let healthy = match tokio::time::timeout(probe_timeout, plugin.health()).await {
                Ok(healthy) => healthy,
                Err(_) => {
                    warn!(id = %id, "health probe timed out");
                    false
                }
            };
            (id, healthy)
        });
        let results: BTreeMap<String, bool> = join_all(probes).await.into_iter().collect();

        let mut entries = self.entries.write().expect("registry lock poisoned");
        for (id, healthy) in &results {
            if let Some(entry) = entries.get_mut(id) {
                entry.descriptor.available = *healthy;
            }
        }
        results
    }

    pub fn set_available(&self, id: &str, available: bool) {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if let Some(entry) = entries.get_mut(id) {
            entry.descriptor.available = available;
        }
    }

    /// True when at least one healthy analyzer is registered.
    pub fn has_healthy_analyzer(&self) -> bool {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries.values().any(|e| {
            e.descriptor.available && e.descriptor.service_types.contains(&ServiceType::Analyzer)
        })
    }
}
