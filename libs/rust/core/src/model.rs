//! Model weight containers shared by every federation component.
//!
//! Weights are plain per-layer `f32` buffers with an explicit shape so the
//! aggregation core stays independent of any tensor runtime.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FederationError, Result};

pub type NodeId = String;

/// Node id carried by aggregated updates.
pub const AGGREGATED_NODE_ID: &str = "aggregated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerBuffer {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl LayerBuffer {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(FederationError::Validation(format!(
                "layer shape {:?} expects {} values, got {}",
                shape,
                expected,
                values.len()
            )));
        }
        Ok(Self { shape, values })
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self { shape, values: vec![value; len] }
    }

    pub fn zeros(shape: Vec<usize>) -> Self { Self::filled(shape, 0.0) }

    pub fn len(&self) -> usize { self.values.len() }

    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    pub fn is_finite(&self) -> bool { self.values.iter().all(|v| v.is_finite()) }
}

/// Global L2 norm over all layers, accumulated in f64.
pub fn l2_norm(layers: &[LayerBuffer]) -> f64 {
    layers
        .iter()
        .flat_map(|l| l.values.iter())
        .map(|v| (*v as f64) * (*v as f64))
        .sum::<f64>()
        .sqrt()
}

pub fn layer_shapes(layers: &[LayerBuffer]) -> Vec<Vec<usize>> {
    layers.iter().map(|l| l.shape.clone()).collect()
}

pub fn element_count(layers: &[LayerBuffer]) -> usize {
    layers.iter().map(|l| l.len()).sum()
}

/// Versioned global model as held by the model store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalModelSnapshot {
    pub model_id: String,
    pub version: u64,
    pub layers: Vec<LayerBuffer>,
    pub updated_at: i64,
}

impl GlobalModelSnapshot {
    pub fn shapes(&self) -> Vec<Vec<usize>> { layer_shapes(&self.layers) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMetadata {
    pub sample_count: u64,
    pub local_epochs: u32,
    pub local_loss: f64,
    pub local_accuracy: f64,
    pub compute_time_ms: u64,
    pub privacy_noise: f64,
}

impl Default for UpdateMetadata {
    fn default() -> Self {
        Self { sample_count: 0, local_epochs: 1, local_loss: 0.0, local_accuracy: 0.0, compute_time_ms: 0, privacy_noise: 0.0 }
    }
}

impl UpdateMetadata {
    /// Node-reported statistics feed reputation and round metrics, so they must be finite.
    pub fn validate(&self) -> Result<()> {
        if !self.local_loss.is_finite() {
            return Err(FederationError::Validation(format!("local loss must be finite, got {}", self.local_loss)));
        }
        if !(0.0..=1.0).contains(&self.local_accuracy) {
            return Err(FederationError::Validation(format!("local accuracy {} outside [0,1]", self.local_accuracy)));
        }
        if !(self.privacy_noise.is_finite() && self.privacy_noise >= 0.0) {
            return Err(FederationError::Validation(format!("privacy noise must be finite and >= 0, got {}", self.privacy_noise)));
        }
        Ok(())
    }
}

/// One participant's contribution to a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub node_id: NodeId,
    pub round_id: Uuid,
    pub weights: Vec<LayerBuffer>,
    pub gradients: Vec<LayerBuffer>,
    pub metadata: UpdateMetadata,
    pub signature: String,
    pub timestamp: i64,
    pub encrypted: bool,
}

impl ModelUpdate {
    pub fn new(node_id: impl Into<NodeId>, round_id: Uuid, weights: Vec<LayerBuffer>, metadata: UpdateMetadata) -> Self {
        Self {
            node_id: node_id.into(),
            round_id,
            weights,
            gradients: Vec::new(),
            metadata,
            signature: String::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            encrypted: false,
        }
    }

    pub fn with_gradients(mut self, gradients: Vec<LayerBuffer>) -> Self {
        self.gradients = gradients;
        self
    }

    pub fn weight_norm(&self) -> f64 { l2_norm(&self.weights) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_rejects_wrong_length() {
        assert!(LayerBuffer::new(vec![2, 3], vec![0.0; 5]).is_err());
        let l = LayerBuffer::new(vec![2, 3], vec![1.0; 6]).unwrap();
        assert_eq!(l.len(), 6);
    }

    #[test]
    fn metadata_rejects_non_finite_statistics() {
        assert!(UpdateMetadata::default().validate().is_ok());
        for meta in [
            UpdateMetadata { local_accuracy: f64::NAN, ..Default::default() },
            UpdateMetadata { local_accuracy: 1.5, ..Default::default() },
            UpdateMetadata { local_loss: f64::NAN, ..Default::default() },
            UpdateMetadata { local_loss: f64::INFINITY, ..Default::default() },
            UpdateMetadata { privacy_noise: f64::NAN, ..Default::default() },
        ] {
            assert!(matches!(meta.validate(), Err(FederationError::Validation(_))), "{meta:?}");
        }
    }

    #[test]
    fn norm_spans_layers() {
        let layers = vec![LayerBuffer::new(vec![1], vec![3.0]).unwrap(), LayerBuffer::new(vec![1], vec![4.0]).unwrap()];
        assert!((l2_norm(&layers) - 5.0).abs() < 1e-9);
    }
}
