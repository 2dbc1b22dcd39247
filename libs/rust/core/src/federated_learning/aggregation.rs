//! Aggregation strategies: FedAvg, FedProx, FedNova, SCAFFOLD.
//!
//! SCAFFOLD currently falls back to FedAvg weighting; true control variates need
//! per-node state that survives across rounds, which this engine does not keep.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FederationError, Result};
use crate::model::{element_count, LayerBuffer, ModelUpdate, NodeId, UpdateMetadata, AGGREGATED_NODE_ID};
use crate::settings::AggregationSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    FedAvg,
    FedProx,
    FedNova,
    Scaffold,
}

#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub update: ModelUpdate,
    pub weighting: BTreeMap<NodeId, f64>,
}

pub struct AggregationEngine {
    mu: f64,
    parallel_threshold: usize,
}

/// Per-node weighting factors; they sum to 1.
pub fn weighting_factors(method: AggregationMethod, updates: &BTreeMap<NodeId, ModelUpdate>) -> Result<BTreeMap<NodeId, f64>> {
    let raw = |u: &ModelUpdate| -> f64 {
        match method {
            AggregationMethod::FedNova => u.metadata.local_epochs as f64 * u.metadata.sample_count as f64,
            AggregationMethod::FedAvg | AggregationMethod::FedProx | AggregationMethod::Scaffold => u.metadata.sample_count as f64,
        }
    };
    let total: f64 = updates.values().map(raw).sum();
    if !(total > 0.0) {
        return Err(FederationError::Aggregation(format!("{:?} weighting total is zero", method)));
    }
    Ok(updates.iter().map(|(id, u)| (id.clone(), raw(u) / total)).collect())
}

/// Every update must match the global per-layer shapes before any arithmetic runs.
pub fn check_shapes(updates: &BTreeMap<NodeId, ModelUpdate>, global: &[LayerBuffer]) -> Result<()> {
    for (node_id, u) in updates {
        if u.weights.len() != global.len() {
            return Err(FederationError::ShapeMismatch {
                node_id: node_id.clone(),
                layer: u.weights.len().min(global.len()),
                expected: vec![global.len()],
                actual: vec![u.weights.len()],
            });
        }
        for (layer, (w, g)) in u.weights.iter().zip(global).enumerate() {
            if w.shape != g.shape || w.values.len() != g.values.len() {
                return Err(FederationError::ShapeMismatch { node_id: node_id.clone(), layer, expected: g.shape.clone(), actual: w.shape.clone() });
            }
        }
    }
    Ok(())
}

impl Default for AggregationEngine {
    fn default() -> Self { Self::new(&AggregationSettings::default()) }
}

impl AggregationEngine {
    pub fn new(cfg: &AggregationSettings) -> Self { Self { mu: cfg.proximal_mu, parallel_threshold: cfg.parallel_threshold } }

    pub fn aggregate(&self, method: AggregationMethod, updates: &BTreeMap<NodeId, ModelUpdate>, global: &[LayerBuffer]) -> Result<AggregationOutcome> {
        let first = updates.values().next().ok_or_else(|| FederationError::Aggregation("no updates to aggregate".into()))?;
        check_shapes(updates, global)?;
        let weighting = weighting_factors(method, updates)?;
        let contributions: Vec<(f64, &ModelUpdate)> = updates.iter().map(|(id, u)| (weighting[id], u)).collect();
        let mu = if method == AggregationMethod::FedProx { self.mu } else { 0.0 };
        let parallel = element_count(global) >= self.parallel_threshold;

        let weights = self.combine(global.len(), parallel, |layer| {
            let g = &global[layer];
            let mut out = vec![0.0f64; g.values.len()];
            for (w, u) in &contributions {
                for (i, v) in u.weights[layer].values.iter().enumerate() {
                    let local = *v as f64;
                    // FedProx pulls each contribution back toward the global weights
                    let adjusted = local - mu * (local - g.values[i] as f64);
                    out[i] += w * adjusted;
                }
            }
            LayerBuffer { shape: g.shape.clone(), values: out.into_iter().map(|v| v as f32).collect() }
        });
        for (layer, buf) in weights.iter().enumerate() {
            if !buf.is_finite() {
                return Err(FederationError::Aggregation(format!("non-finite value in aggregated layer {layer}")));
            }
        }

        let gradients = if self.gradients_consistent(updates, first) {
            self.combine(first.gradients.len(), parallel, |layer| {
                let shape = first.gradients[layer].shape.clone();
                let mut out = vec![0.0f64; first.gradients[layer].values.len()];
                for (w, u) in &contributions {
                    for (i, v) in u.gradients[layer].values.iter().enumerate() { out[i] += w * *v as f64; }
                }
                LayerBuffer { shape, values: out.into_iter().map(|v| v as f32).collect() }
            })
        } else {
            Vec::new()
        };

        let metadata = merged_metadata(&contributions);
        if !(metadata.local_loss.is_finite() && metadata.local_accuracy.is_finite() && metadata.privacy_noise.is_finite()) {
            return Err(FederationError::Aggregation("non-finite statistics in aggregated metadata".into()));
        }
        debug!(method = ?method, contributors = updates.len(), layers = weights.len(), parallel, "aggregation complete");
        let round_id = first.round_id;
        let update = ModelUpdate {
            node_id: AGGREGATED_NODE_ID.to_string(),
            round_id,
            weights,
            gradients,
            metadata,
            signature: String::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            encrypted: false,
        };
        Ok(AggregationOutcome { update, weighting })
    }

    fn combine<F>(&self, layers: usize, parallel: bool, f: F) -> Vec<LayerBuffer>
    where
        F: Fn(usize) -> LayerBuffer + Sync + Send,
    {
        if parallel { (0..layers).into_par_iter().map(&f).collect() } else { (0..layers).map(f).collect() }
    }

    fn gradients_consistent(&self, updates: &BTreeMap<NodeId, ModelUpdate>, first: &ModelUpdate) -> bool {
        if first.gradients.is_empty() { return false; }
        updates.values().all(|u| {
            u.gradients.len() == first.gradients.len()
                && u.gradients.iter().zip(&first.gradients).all(|(a, b)| a.shape == b.shape && a.values.len() == b.values.len())
        })
    }
}

fn merged_metadata(contributions: &[(f64, &ModelUpdate)]) -> UpdateMetadata {
    let mut meta = UpdateMetadata { local_epochs: 0, ..Default::default() };
    for (w, u) in contributions {
        meta.sample_count = meta.sample_count.saturating_add(u.metadata.sample_count);
        meta.local_epochs = meta.local_epochs.max(u.metadata.local_epochs);
        meta.local_loss += w * u.metadata.local_loss;
        meta.local_accuracy += w * u.metadata.local_accuracy;
        meta.compute_time_ms = meta.compute_time_ms.saturating_add(u.metadata.compute_time_ms);
        meta.privacy_noise += w * u.metadata.privacy_noise;
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn upd(node: &str, values: Vec<f32>, samples: u64, epochs: u32) -> (NodeId, ModelUpdate) {
        let n = values.len();
        let meta = UpdateMetadata { sample_count: samples, local_epochs: epochs, ..Default::default() };
        (node.to_string(), ModelUpdate::new(node, Uuid::nil(), vec![LayerBuffer::new(vec![n], values).unwrap()], meta))
    }

    fn global(values: Vec<f32>) -> Vec<LayerBuffer> {
        let n = values.len();
        vec![LayerBuffer::new(vec![n], values).unwrap()]
    }

    #[test]
    fn non_finite_metadata_fails_aggregation() {
        let (id, mut bad) = upd("b", vec![1.0], 10, 1);
        bad.metadata.local_accuracy = f64::NAN;
        let updates: BTreeMap<_, _> = [upd("a", vec![1.0], 10, 1), (id, bad)].into_iter().collect();
        let err = AggregationEngine::default().aggregate(AggregationMethod::FedAvg, &updates, &global(vec![0.0])).unwrap_err();
        assert!(matches!(err, FederationError::Aggregation(_)));
    }

    #[test]
    fn fedavg_weights_sum_to_one() {
        let updates: BTreeMap<_, _> = [upd("a", vec![1.0], 17, 1), upd("b", vec![1.0], 3, 1), upd("c", vec![1.0], 999, 4)].into_iter().collect();
        for method in [AggregationMethod::FedAvg, AggregationMethod::FedNova] {
            let sum: f64 = weighting_factors(method, &updates).unwrap().values().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn fedavg_identical_inputs_return_same_vector() {
        let v = vec![0.25, -1.5, 3.0];
        let updates: BTreeMap<_, _> = [upd("a", v.clone(), 100, 1), upd("b", v.clone(), 200, 1), upd("c", v.clone(), 300, 1)].into_iter().collect();
        let out = AggregationEngine::default().aggregate(AggregationMethod::FedAvg, &updates, &global(vec![0.0; 3])).unwrap();
        for (a, b) in out.update.weights[0].values.iter().zip(&v) { assert!((a - b).abs() < 1e-6); }
        assert_eq!(out.update.node_id, AGGREGATED_NODE_ID);
        assert_eq!(out.update.metadata.sample_count, 600);
    }

    #[test]
    fn fedavg_weights_by_samples() {
        let updates: BTreeMap<_, _> = [upd("n1", vec![0.1, 0.2, 0.3], 10, 1), upd("n2", vec![0.2, 0.4, 0.6], 30, 1)].into_iter().collect();
        let out = AggregationEngine::default().aggregate(AggregationMethod::FedAvg, &updates, &global(vec![0.0; 3])).unwrap();
        assert!((out.update.weights[0].values[0] - 0.175).abs() < 1e-6);
    }

    #[test]
    fn fedprox_pulls_toward_global() {
        let updates: BTreeMap<_, _> = [upd("a", vec![2.0], 1, 1), upd("b", vec![2.0], 1, 1)].into_iter().collect();
        let engine = AggregationEngine::new(&AggregationSettings { proximal_mu: 0.5, parallel_threshold: usize::MAX });
        let out = engine.aggregate(AggregationMethod::FedProx, &updates, &global(vec![1.0])).unwrap();
        // 2 - 0.5 * (2 - 1)
        assert!((out.update.weights[0].values[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn fednova_uses_epochs_times_samples() {
        let updates: BTreeMap<_, _> = [upd("a", vec![0.0], 100, 3), upd("b", vec![4.0], 100, 1)].into_iter().collect();
        let out = AggregationEngine::default().aggregate(AggregationMethod::FedNova, &updates, &global(vec![0.0])).unwrap();
        assert!((out.update.weights[0].values[0] - 1.0).abs() < 1e-6);
        assert!((out.weighting["a"] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn scaffold_matches_fedavg() {
        let updates: BTreeMap<_, _> = [upd("a", vec![1.0, 2.0], 10, 1), upd("b", vec![3.0, 5.0], 30, 2)].into_iter().collect();
        let engine = AggregationEngine::default();
        let g = global(vec![0.0, 0.0]);
        let avg = engine.aggregate(AggregationMethod::FedAvg, &updates, &g).unwrap();
        let scaffold = engine.aggregate(AggregationMethod::Scaffold, &updates, &g).unwrap();
        assert_eq!(avg.update.weights, scaffold.update.weights);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let updates: BTreeMap<_, _> = [upd("a", vec![1.0, 2.0], 10, 1), upd("b", vec![1.0, 2.0, 3.0], 10, 1)].into_iter().collect();
        let err = AggregationEngine::default().aggregate(AggregationMethod::FedAvg, &updates, &global(vec![0.0, 0.0])).unwrap_err();
        assert!(matches!(err, FederationError::ShapeMismatch { ref node_id, .. } if node_id == "b"));
    }

    #[test]
    fn non_finite_output_is_rejected() {
        let updates: BTreeMap<_, _> = [upd("a", vec![f32::NAN], 10, 1)].into_iter().collect();
        let err = AggregationEngine::default().aggregate(AggregationMethod::FedAvg, &updates, &global(vec![0.0])).unwrap_err();
        assert!(matches!(err, FederationError::Aggregation(_)));
    }

    #[test]
    fn parallel_path_matches_sequential() {
        let layers: Vec<LayerBuffer> = (0..4).map(|_| LayerBuffer::zeros(vec![8, 8])).collect();
        let mk = |node: &str, v: f32, samples: u64| {
            let w: Vec<LayerBuffer> = (0..4).map(|_| LayerBuffer::filled(vec![8, 8], v)).collect();
            (node.to_string(), ModelUpdate::new(node, Uuid::nil(), w, UpdateMetadata { sample_count: samples, ..Default::default() }))
        };
        let updates: BTreeMap<_, _> = [mk("a", 1.0, 1), mk("b", 5.0, 3)].into_iter().collect();
        let seq = AggregationEngine::new(&AggregationSettings { proximal_mu: 0.01, parallel_threshold: usize::MAX });
        let par = AggregationEngine::new(&AggregationSettings { proximal_mu: 0.01, parallel_threshold: 1 });
        let a = seq.aggregate(AggregationMethod::FedAvg, &updates, &layers).unwrap();
        let b = par.aggregate(AggregationMethod::FedAvg, &updates, &layers).unwrap();
        assert_eq!(a.update.weights, b.update.weights);
        assert!((a.update.weights[3].values[0] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn gradients_aggregate_when_consistent() {
        let (ia, a) = upd("a", vec![1.0], 1, 1);
        let (ib, b) = upd("b", vec![1.0], 1, 1);
        let a = a.with_gradients(vec![LayerBuffer::filled(vec![2], 1.0)]);
        let b = b.with_gradients(vec![LayerBuffer::filled(vec![2], 3.0)]);
        let updates: BTreeMap<_, _> = [(ia, a), (ib, b)].into_iter().collect();
        let out = AggregationEngine::default().aggregate(AggregationMethod::FedAvg, &updates, &global(vec![0.0])).unwrap();
        assert_eq!(out.update.gradients[0].values, vec![2.0, 2.0]);
    }
}
