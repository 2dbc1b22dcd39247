//! Participant registry: capabilities, trust, reputation and privacy preferences.
//!
//! Selection ranks eligible nodes by `0.4·trust + 0.3·reputation + 0.3·compute`
//! where compute power is normalised against the strongest eligible node.
//! Reputation is an exponential moving average (`0.9·old + 0.1·quality`).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FederationError, Result};
use crate::events::{emit, EventSink, FederationEvent};
use crate::metrics_ext::FEDERATION_METRICS;
use crate::model::{NodeId, UpdateMetadata};
use crate::settings::RegistrySettings;

const NEUTRAL_REPUTATION: f64 = 0.5;
const ACCURACY_BLEND: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus { Active, Inactive, Training, Offline }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub compute_power: f64,
    pub memory_gb: f64,
    pub bandwidth_mbps: f64,
    pub trust_score: f64,
    pub data_quality: f64,
}

impl NodeCapabilities {
    /// Resources finite and non-negative; data quality within [0,1].
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("compute_power", self.compute_power), ("memory_gb", self.memory_gb), ("bandwidth_mbps", self.bandwidth_mbps)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(FederationError::Validation(format!("{name} must be finite and >= 0, got {value}")));
            }
        }
        if !(0.0..=1.0).contains(&self.data_quality) {
            return Err(FederationError::Validation(format!("data quality {} outside [0,1]", self.data_quality)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyPreferences {
    pub epsilon: f64,
    pub noise_variance: f64,
    pub clipping_norm: f64,
}

impl Default for PrivacyPreferences {
    fn default() -> Self { Self { epsilon: 1.0, noise_variance: 0.0, clipping_norm: 1.0 } }
}

impl PrivacyPreferences {
    pub fn validate(&self) -> Result<()> {
        if !(self.epsilon > 0.0 && self.epsilon.is_finite()) {
            return Err(FederationError::Validation(format!("epsilon must be > 0, got {}", self.epsilon)));
        }
        if !(self.noise_variance >= 0.0 && self.noise_variance.is_finite()) {
            return Err(FederationError::Validation(format!("noise variance must be >= 0, got {}", self.noise_variance)));
        }
        if !(self.clipping_norm > 0.0 && self.clipping_norm.is_finite()) {
            return Err(FederationError::Validation(format!("clipping norm must be > 0, got {}", self.clipping_norm)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionHistory {
    pub rounds_participated: u64,
    pub average_accuracy: f64,
    pub total_samples: u64,
    pub reputation_score: f64,
}

impl Default for ContributionHistory {
    fn default() -> Self { Self { rounds_participated: 0, average_accuracy: 0.0, total_samples: 0, reputation_score: NEUTRAL_REPUTATION } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedNode {
    pub id: NodeId,
    pub name: String,
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    pub privacy: PrivacyPreferences,
    pub contribution: ContributionHistory,
    pub registered_at: i64,
    pub last_seen: i64,
}

/// Registration request; identity and history are assigned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub name: String,
    pub capabilities: NodeCapabilities,
    #[serde(default)]
    pub privacy: PrivacyPreferences,
}

pub trait NodeRepository: Send + Sync {
    fn get(&self, id: &str) -> Option<FederatedNode>;
    fn put(&self, node: FederatedNode);
    fn remove(&self, id: &str) -> Option<FederatedNode>;
    fn list(&self) -> Vec<FederatedNode>;
    /// Read-modify-write under the repository's own lock.
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut FederatedNode)) -> bool;
}

#[derive(Default)]
pub struct InMemoryNodeRepository {
    nodes: RwLock<HashMap<NodeId, FederatedNode>>,
}

impl InMemoryNodeRepository {
    pub fn new() -> Self { Self::default() }
}

impl NodeRepository for InMemoryNodeRepository {
    fn get(&self, id: &str) -> Option<FederatedNode> { self.nodes.read().get(id).cloned() }
    fn put(&self, node: FederatedNode) { self.nodes.write().insert(node.id.clone(), node); }
    fn remove(&self, id: &str) -> Option<FederatedNode> { self.nodes.write().remove(id) }
    fn list(&self) -> Vec<FederatedNode> { self.nodes.read().values().cloned().collect() }
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut FederatedNode)) -> bool {
        match self.nodes.write().get_mut(id) {
            Some(node) => { f(node); true }
            None => false,
        }
    }
}

pub struct NodeRegistry {
    repo: Arc<dyn NodeRepository>,
    events: Arc<dyn EventSink>,
    cfg: RegistrySettings,
}

impl NodeRegistry {
    pub fn new(repo: Arc<dyn NodeRepository>, events: Arc<dyn EventSink>, cfg: RegistrySettings) -> Self { Self { repo, events, cfg } }

    pub fn register(&self, req: NodeRegistration) -> Result<FederatedNode> {
        let caps = &req.capabilities;
        if !(0.0..=1.0).contains(&caps.trust_score) {
            return Err(FederationError::Validation(format!("trust score {} outside [0,1]", caps.trust_score)));
        }
        if caps.trust_score < self.cfg.min_registration_trust {
            return Err(FederationError::Validation(format!(
                "trust score {} below registration minimum {}",
                caps.trust_score, self.cfg.min_registration_trust
            )));
        }
        caps.validate()?;
        req.privacy.validate()?;
        let now = chrono::Utc::now().timestamp_millis();
        let node = FederatedNode {
            id: uuid::Uuid::new_v4().to_string(),
            name: req.name,
            capabilities: req.capabilities,
            status: NodeStatus::Active,
            privacy: req.privacy,
            contribution: ContributionHistory::default(),
            registered_at: now,
            last_seen: now,
        };
        self.repo.put(node.clone());
        FEDERATION_METRICS.nodes_registered_total.add(1, &[]);
        info!(node_id = %node.id, name = %node.name, trust = node.capabilities.trust_score, "node registered");
        emit(self.events.as_ref(), FederationEvent::NodeRegistered { node_id: node.id.clone(), trust_score: node.capabilities.trust_score });
        Ok(node)
    }

    /// Ranked candidates for a round. A short list is reported, not rejected.
    pub fn select_participants(&self, min_participants: usize) -> Vec<FederatedNode> {
        let mut eligible: Vec<FederatedNode> = self
            .repo
            .list()
            .into_iter()
            .filter(|n| n.status == NodeStatus::Active && n.capabilities.trust_score >= self.cfg.min_selection_trust)
            .collect();
        let max_compute = eligible.iter().map(|n| n.capabilities.compute_power).fold(0.0_f64, f64::max);
        let score = |n: &FederatedNode| {
            let compute = if max_compute > 0.0 { n.capabilities.compute_power / max_compute } else { 0.0 };
            0.4 * n.capabilities.trust_score + 0.3 * n.contribution.reputation_score + 0.3 * compute
        };
        // ties broken by id so selection is deterministic
        eligible.sort_by(|a, b| score(b).total_cmp(&score(a)).then_with(|| a.id.cmp(&b.id)));
        eligible.truncate(min_participants.saturating_mul(2));
        debug!(selected = eligible.len(), min_participants, "participants selected");
        eligible
    }

    pub fn update_contribution(&self, node_id: &str, meta: &UpdateMetadata) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let found = self.repo.update(node_id, &mut |node| {
            let hist = &mut node.contribution;
            if meta.local_accuracy.is_finite() {
                let acc = meta.local_accuracy.clamp(0.0, 1.0);
                hist.average_accuracy = if hist.rounds_participated == 0 {
                    acc
                } else {
                    (1.0 - ACCURACY_BLEND) * hist.average_accuracy + ACCURACY_BLEND * acc
                };
            }
            hist.rounds_participated += 1;
            hist.total_samples = hist.total_samples.saturating_add(meta.sample_count);
            node.last_seen = now;
        });
        if found { Ok(()) } else { Err(FederationError::NodeNotFound(node_id.to_string())) }
    }

    pub fn update_reputation(&self, node_id: &str, meta: &UpdateMetadata) -> Result<f64> {
        let raw = 0.7 * meta.local_accuracy + 0.3 * (1.0 - meta.local_loss);
        let quality = raw.is_finite().then(|| raw.clamp(0.0, 1.0));
        let mut updated = NEUTRAL_REPUTATION;
        let found = self.repo.update(node_id, &mut |node| {
            let rep = &mut node.contribution.reputation_score;
            if let Some(q) = quality { *rep = (0.9 * *rep + 0.1 * q).clamp(0.0, 1.0); }
            updated = *rep;
        });
        if !found { return Err(FederationError::NodeNotFound(node_id.to_string())); }
        if quality.is_none() { warn!(node_id, raw, "non-finite quality ignored"); }
        debug!(node_id, ?quality, reputation = updated, "reputation updated");
        Ok(updated)
    }

    /// Flag round participants as busy; selection only considers `Active` nodes.
    pub fn mark_training(&self, node_ids: &[NodeId]) {
        let now = chrono::Utc::now().timestamp_millis();
        for id in node_ids {
            self.repo.update(id, &mut |n| {
                if n.status == NodeStatus::Active { n.status = NodeStatus::Training; }
                n.last_seen = now;
            });
        }
    }

    /// Return round participants to `Active`. Statuses set by an operator meanwhile are kept.
    pub fn release_from_training(&self, node_ids: &[NodeId]) {
        for id in node_ids {
            self.repo.update(id, &mut |n| {
                if n.status == NodeStatus::Training { n.status = NodeStatus::Active; }
            });
        }
    }

    pub fn get(&self, node_id: &str) -> Option<FederatedNode> { self.repo.get(node_id) }

    pub fn list(&self) -> Vec<FederatedNode> { self.repo.list() }

    pub fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        if self.repo.update(node_id, &mut |n| n.status = status) { Ok(()) } else { Err(FederationError::NodeNotFound(node_id.to_string())) }
    }

    pub fn set_trust_score(&self, node_id: &str, trust: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&trust) {
            return Err(FederationError::Validation(format!("trust score {} outside [0,1]", trust)));
        }
        if self.repo.update(node_id, &mut |n| n.capabilities.trust_score = trust) { Ok(()) } else { Err(FederationError::NodeNotFound(node_id.to_string())) }
    }

    /// Administrative removal; nodes are never dropped implicitly.
    pub fn remove_node(&self, node_id: &str) -> Result<FederatedNode> {
        let node = self.repo.remove(node_id).ok_or_else(|| FederationError::NodeNotFound(node_id.to_string()))?;
        info!(node_id, "node removed");
        emit(self.events.as_ref(), FederationEvent::NodeRemoved { node_id: node_id.to_string() });
        Ok(node)
    }
}
