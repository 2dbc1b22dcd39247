//! Error taxonomy for the federation engine.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient participants: need {needed}, got {actual}")]
    InsufficientParticipants { needed: usize, actual: usize },

    #[error("signature mismatch for update from node {node_id}")]
    Signature { node_id: String },

    #[error("shape mismatch from node {node_id} in layer {layer}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        node_id: String,
        layer: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("privacy budget exceeded for node {node_id}: spent {spent:.4}, requested {requested:.4}, limit {limit:.4}")]
    PrivacyBudgetExceeded {
        node_id: String,
        spent: f64,
        requested: f64,
        limit: f64,
    },

    #[error("consensus rejected: {approvals}/{participants} approvals, threshold {threshold}")]
    ConsensusRejected {
        approvals: usize,
        participants: usize,
        threshold: f64,
    },

    #[error("aggregation failed: {0}")]
    Aggregation(String),

    #[error("round {0} not found")]
    RoundNotFound(Uuid),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("model {model_id} already has active round {round_id}")]
    RoundAlreadyActive { model_id: String, round_id: Uuid },

    #[error("model store error: {0}")]
    ModelStore(String),
}

impl FederationError {
    /// Stable identifier used in events and inbound rejections.
    pub fn kind(&self) -> &'static str {
        match self {
            FederationError::Validation(_) => "validation",
            FederationError::InsufficientParticipants { .. } => "insufficient_participants",
            FederationError::Signature { .. } => "signature",
            FederationError::ShapeMismatch { .. } => "shape_mismatch",
            FederationError::PrivacyBudgetExceeded { .. } => "privacy_budget_exceeded",
            FederationError::ConsensusRejected { .. } => "consensus_rejected",
            FederationError::Aggregation(_) => "aggregation",
            FederationError::RoundNotFound(_) => "round_not_found",
            FederationError::NodeNotFound(_) => "node_not_found",
            FederationError::RoundAlreadyActive { .. } => "round_already_active",
            FederationError::ModelStore(_) => "model_store",
        }
    }

    /// Node-level errors exclude one contribution without failing the round.
    pub fn is_node_level(&self) -> bool {
        matches!(self, FederationError::Signature { .. } | FederationError::PrivacyBudgetExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, FederationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_level_classification() {
        assert!(FederationError::Signature { node_id: "n1".into() }.is_node_level());
        assert!(!FederationError::Aggregation("nan".into()).is_node_level());
        assert_eq!(FederationError::InsufficientParticipants { needed: 3, actual: 2 }.kind(), "insufficient_participants");
    }
}
