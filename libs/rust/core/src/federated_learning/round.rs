//! Round record and its finite state machine.
//!
//! Phases:
//! - Initializing (only entry state)
//! - Training
//! - Aggregating
//! - Completed | Failed (terminal)
//!
//! Every transition is timestamped; a failure raised early walks forward through
//! the intermediate phases so the history never contains a skipped edge.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::aggregation::AggregationMethod;
use crate::error::{FederationError, Result};
use crate::model::{ModelUpdate, NodeId};
use crate::settings::EngineConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus { Initializing, Training, Aggregating, Completed, Failed }

impl RoundStatus {
    pub fn is_terminal(self) -> bool { matches!(self, RoundStatus::Completed | RoundStatus::Failed) }

    pub fn can_transition_to(self, next: RoundStatus) -> bool {
        matches!(
            (self, next),
            (RoundStatus::Initializing, RoundStatus::Training)
                | (RoundStatus::Training, RoundStatus::Aggregating)
                | (RoundStatus::Aggregating, RoundStatus::Completed)
                | (RoundStatus::Aggregating, RoundStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyMechanism { Gaussian }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRequirement {
    pub required: bool,
    pub threshold: f64,
}

#[derive(Debug, Clone)]
pub struct RoundConfig {
    pub min_participants: usize,
    pub method: AggregationMethod,
    pub privacy: PrivacyMechanism,
    pub timeout: Duration,
    pub consensus: ConsensusRequirement,
}

impl RoundConfig {
    pub fn from_engine(cfg: &EngineConfig) -> Self {
        Self {
            min_participants: cfg.round.min_participants,
            method: cfg.round.method,
            privacy: PrivacyMechanism::Gaussian,
            timeout: cfg.round.timeout(),
            consensus: ConsensusRequirement { required: cfg.consensus.required, threshold: cfg.consensus.threshold },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_participants == 0 { return Err(FederationError::Validation("min_participants must be at least 1".into())); }
        if self.timeout.is_zero() { return Err(FederationError::Validation("round timeout must be positive".into())); }
        if self.consensus.required && !(self.consensus.threshold > 0.0 && self.consensus.threshold <= 1.0) {
            return Err(FederationError::Validation(format!("consensus threshold {} outside (0,1]", self.consensus.threshold)));
        }
        Ok(())
    }
}

impl Default for RoundConfig {
    fn default() -> Self { Self::from_engine(&EngineConfig::default()) }
}

#[derive(Debug, Clone, Default)]
pub struct ConsensusState {
    pub votes: BTreeMap<NodeId, bool>,
    pub approved: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundMetrics {
    pub contributors: usize,
    pub total_samples: u64,
    pub average_loss: f64,
    pub average_accuracy: f64,
    pub aggregation_ms: f64,
    pub weighting: BTreeMap<NodeId, f64>,
    pub model_version: u64,
}

#[derive(Debug, Clone)]
pub struct FederatedRound {
    pub id: Uuid,
    pub model_id: String,
    pub round_number: u64,
    pub base_version: u64,
    pub base_shapes: Vec<Vec<usize>>,
    pub selected: Vec<NodeId>,
    /// Nodes still expected to respond; shrinks on distribution or node-level failures.
    pub participants: BTreeSet<NodeId>,
    /// Nodes flagged `Training` in the registry while this round runs.
    pub enrolled: Vec<NodeId>,
    pub config: RoundConfig,
    pub status: RoundStatus,
    pub history: Vec<(RoundStatus, i64)>,
    pub updates: BTreeMap<NodeId, ModelUpdate>,
    pub aggregate: Option<ModelUpdate>,
    pub metrics: Option<RoundMetrics>,
    pub consensus: ConsensusState,
    pub failure: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl FederatedRound {
    pub fn new(model_id: String, round_number: u64, base_version: u64, base_shapes: Vec<Vec<usize>>, selected: Vec<NodeId>, config: RoundConfig) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            model_id,
            round_number,
            base_version,
            base_shapes,
            selected,
            participants: BTreeSet::new(),
            enrolled: Vec::new(),
            config,
            status: RoundStatus::Initializing,
            history: vec![(RoundStatus::Initializing, now)],
            updates: BTreeMap::new(),
            aggregate: None,
            metrics: None,
            consensus: ConsensusState::default(),
            failure: None,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: RoundStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FederationError::Validation(format!("illegal round transition {:?} -> {:?}", self.status, next)));
        }
        let now = chrono::Utc::now().timestamp_millis();
        self.status = next;
        self.history.push((next, now));
        if next.is_terminal() { self.finished_at = Some(now); }
        Ok(())
    }

    /// Move to `Failed` along legal edges. Returns false if already terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() { return false; }
        while self.status != RoundStatus::Aggregating {
            let next = match self.status { RoundStatus::Initializing => RoundStatus::Training, _ => RoundStatus::Aggregating };
            // both edges are legal by construction
            let _ = self.transition(next);
        }
        let _ = self.transition(RoundStatus::Failed);
        self.failure = Some(reason.into());
        true
    }

    pub fn is_expected(&self, node_id: &str) -> bool { self.participants.contains(node_id) }

    /// True once every expected node has an update stored. An emptied expected set counts as responded.
    pub fn all_responded(&self) -> bool { self.participants.iter().all(|p| self.updates.contains_key(p)) }
}
