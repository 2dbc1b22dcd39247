//! Contracts for collaborators outside the engine: model storage and snapshot transport.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::model::{layer_shapes, GlobalModelSnapshot, LayerBuffer, ModelUpdate};

#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn get_global_model(&self, model_id: &str) -> Result<GlobalModelSnapshot>;
    /// Replace the global weights with the aggregate; returns the new version.
    async fn apply_aggregate(&self, model_id: &str, aggregate: &ModelUpdate) -> Result<u64>;
}

#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn distribute_snapshot(&self, node_id: &str, snapshot: &GlobalModelSnapshot) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryModelStore {
    models: RwLock<HashMap<String, GlobalModelSnapshot>>,
}

impl InMemoryModelStore {
    pub fn new() -> Self { Self::default() }

    pub fn insert_model(&self, model_id: &str, layers: Vec<LayerBuffer>) {
        let snap = GlobalModelSnapshot { model_id: model_id.to_string(), version: 1, layers, updated_at: chrono::Utc::now().timestamp_millis() };
        self.models.write().insert(model_id.to_string(), snap);
    }

    pub fn snapshot(&self, model_id: &str) -> Option<GlobalModelSnapshot> { self.models.read().get(model_id).cloned() }
}

#[async_trait]
impl ModelStore for InMemoryModelStore {
    async fn get_global_model(&self, model_id: &str) -> Result<GlobalModelSnapshot> {
        match self.models.read().get(model_id) {
            Some(snap) => Ok(snap.clone()),
            None => bail!("model {model_id} not found"),
        }
    }

    async fn apply_aggregate(&self, model_id: &str, aggregate: &ModelUpdate) -> Result<u64> {
        let mut models = self.models.write();
        let Some(snap) = models.get_mut(model_id) else { bail!("model {model_id} not found") };
        if layer_shapes(&snap.layers) != layer_shapes(&aggregate.weights) {
            bail!("aggregate shapes do not match model {model_id}");
        }
        snap.layers = aggregate.weights.clone();
        snap.version += 1;
        snap.updated_at = chrono::Utc::now().timestamp_millis();
        info!(model_id, version = snap.version, "global model updated");
        Ok(snap.version)
    }
}
