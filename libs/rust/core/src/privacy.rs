//! Differential-privacy sanitization and epsilon accounting.
//!
//! Clip to the node's L2 bound, add N(0, variance) noise per element, then charge
//! epsilon additively.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, warn};

use crate::error::{FederationError, Result};
use crate::metrics_ext::FEDERATION_METRICS;
use crate::model::{l2_norm, LayerBuffer, ModelUpdate, NodeId};
use crate::registry::PrivacyPreferences;

#[derive(Debug, Clone, PartialEq)]
pub struct SanitizeReport {
    pub pre_clip_norm: f64,
    pub clipped: bool,
    pub epsilon_spent: f64,
    pub node_budget_used: f64,
}

#[derive(Default)]
struct Ledger {
    per_node: HashMap<NodeId, f64>,
    total: f64,
}

#[derive(Default)]
pub struct PrivacyAccountant {
    ledger: Mutex<Ledger>,
    node_budget_limit: Option<f64>,
}

/// Scale every element by `clipping_norm / norm` when the global norm exceeds the bound.
/// Returns the pre-clip norm.
pub fn clip_to_norm(layers: &mut [LayerBuffer], clipping_norm: f64) -> f64 {
    let norm = l2_norm(layers);
    if norm > clipping_norm {
        let scale = clipping_norm / norm;
        for layer in layers.iter_mut() {
            for v in layer.values.iter_mut() { *v = (*v as f64 * scale) as f32; }
        }
    }
    norm
}

pub fn add_gaussian_noise<R: Rng + ?Sized>(layers: &mut [LayerBuffer], variance: f64, rng: &mut R) -> Result<()> {
    if variance == 0.0 { return Ok(()); }
    let normal = Normal::new(0.0, variance.sqrt()).map_err(|e| FederationError::Validation(format!("noise distribution: {e}")))?;
    for layer in layers.iter_mut() {
        for v in layer.values.iter_mut() { *v += normal.sample(rng) as f32; }
    }
    Ok(())
}

impl PrivacyAccountant {
    pub fn new(node_budget_limit: Option<f64>) -> Self { Self { ledger: Mutex::new(Ledger::default()), node_budget_limit } }

    pub fn sanitize(&self, update: &mut ModelUpdate, prefs: &PrivacyPreferences) -> Result<SanitizeReport> {
        self.sanitize_with_rng(update, prefs, &mut rand::thread_rng())
    }

    pub fn sanitize_with_rng<R: Rng + ?Sized>(&self, update: &mut ModelUpdate, prefs: &PrivacyPreferences, rng: &mut R) -> Result<SanitizeReport> {
        prefs.validate()?;
        // charge before any mutation
        let node_budget_used = self.charge(&update.node_id, prefs.epsilon)?;
        let pre_clip_norm = clip_to_norm(&mut update.weights, prefs.clipping_norm);
        add_gaussian_noise(&mut update.weights, prefs.noise_variance, rng)?;
        update.metadata.privacy_noise = prefs.noise_variance;
        let clipped = pre_clip_norm > prefs.clipping_norm;
        debug!(node_id = %update.node_id, pre_clip_norm, clipped, epsilon = prefs.epsilon, "update sanitized");
        Ok(SanitizeReport { pre_clip_norm, clipped, epsilon_spent: prefs.epsilon, node_budget_used })
    }

    fn charge(&self, node_id: &str, epsilon: f64) -> Result<f64> {
        let mut ledger = self.ledger.lock();
        let spent = ledger.per_node.get(node_id).copied().unwrap_or(0.0);
        if let Some(limit) = self.node_budget_limit {
            if spent + epsilon > limit {
                warn!(node_id, spent, requested = epsilon, limit, "privacy budget exceeded");
                return Err(FederationError::PrivacyBudgetExceeded { node_id: node_id.to_string(), spent, requested: epsilon, limit });
            }
        }
        let used = spent + epsilon;
        ledger.per_node.insert(node_id.to_string(), used);
        ledger.total += epsilon;
        FEDERATION_METRICS.privacy_epsilon_spent.add(epsilon, &[]);
        Ok(used)
    }

    pub fn get_total_budget_used(&self) -> f64 { self.ledger.lock().total }

    pub fn get_node_budget_used(&self, node_id: &str) -> f64 { self.ledger.lock().per_node.get(node_id).copied().unwrap_or(0.0) }

    /// Administrative reset of one node's spend; the global total is kept.
    pub fn reset_node_budget(&self, node_id: &str) {
        self.ledger.lock().per_node.remove(node_id);
        warn!(node_id, "node privacy budget reset by operator");
    }

    pub fn reset_all(&self) {
        *self.ledger.lock() = Ledger::default();
        warn!("all privacy budgets reset by operator");
    }
}
