//! Approval vote over a candidate aggregate.
//!
//! Votes are requested concurrently from a pluggable [`VoteSource`]; a vote that
//! errors or exceeds the per-vote timeout counts as a rejection.
//! `approved = approvals / participants >= threshold`, the boundary approves.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::metrics_ext::FEDERATION_METRICS;
use crate::model::{ModelUpdate, NodeId};

// absorbs float error when the ratio lands exactly on the threshold
const RATIO_EPSILON: f64 = 1e-12;

#[async_trait]
pub trait VoteSource: Send + Sync {
    async fn request_vote(&self, node_id: &str, round_id: Uuid, candidate: &ModelUpdate) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusOutcome {
    pub votes: BTreeMap<NodeId, bool>,
    pub approvals: usize,
    pub participants: usize,
    pub approved: bool,
}

pub fn tally(approvals: usize, participants: usize, threshold: f64) -> bool {
    if participants == 0 { return false; }
    approvals as f64 / participants as f64 + RATIO_EPSILON >= threshold
}

pub struct ConsensusEngine {
    source: std::sync::Arc<dyn VoteSource>,
    vote_timeout: Duration,
}

impl ConsensusEngine {
    pub fn new(source: std::sync::Arc<dyn VoteSource>, vote_timeout: Duration) -> Self { Self { source, vote_timeout } }

    #[instrument(skip(self, participants, candidate), fields(participants = participants.len()))]
    pub async fn collect(&self, round_id: Uuid, participants: &[NodeId], candidate: &ModelUpdate, threshold: f64) -> ConsensusOutcome {
        let requests = participants.iter().map(|node| async move {
            let vote = match tokio::time::timeout(self.vote_timeout, self.source.request_vote(node, round_id, candidate)).await {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => { warn!(node_id = %node, error = %e, "vote request failed, counted as reject"); false }
                Err(_) => { warn!(node_id = %node, "vote timed out, counted as reject"); false }
            };
            (node.clone(), vote)
        });
        let votes: BTreeMap<NodeId, bool> = join_all(requests).await.into_iter().collect();
        FEDERATION_METRICS.consensus_votes_total.add(votes.len() as u64, &[]);
        let approvals = votes.values().filter(|v| **v).count();
        let approved = tally(approvals, participants.len(), threshold);
        info!(%round_id, approvals, participants = participants.len(), threshold, approved, "consensus tallied");
        ConsensusOutcome { votes, approvals, participants: participants.len(), approved }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpdateMetadata;
    use std::collections::HashSet;
    use std::sync::Arc;

    struct FixedVotes { approve: HashSet<String>, stall: HashSet<String> }

    #[async_trait]
    impl VoteSource for FixedVotes {
        async fn request_vote(&self, node_id: &str, _round_id: Uuid, _candidate: &ModelUpdate) -> anyhow::Result<bool> {
            if self.stall.contains(node_id) { tokio::time::sleep(Duration::from_secs(60)).await; }
            Ok(self.approve.contains(node_id))
        }
    }

    fn candidate() -> ModelUpdate { ModelUpdate::new("aggregated", Uuid::nil(), Vec::new(), UpdateMetadata::default()) }

    #[test]
    fn boundary_ratio_approves() {
        assert!(tally(3, 5, 0.6));
        assert!(!tally(2, 5, 0.6));
        assert!(tally(2, 3, 2.0 / 3.0));
        assert!(!tally(0, 0, 0.5));
    }

    #[tokio::test]
    async fn three_of_five_meets_sixty_percent() {
        let nodes: Vec<String> = (0..5).map(|i| format!("n{i}")).collect();
        let source = FixedVotes { approve: nodes[..3].iter().cloned().collect(), stall: HashSet::new() };
        let engine = ConsensusEngine::new(Arc::new(source), Duration::from_secs(1));
        let out = engine.collect(Uuid::nil(), &nodes, &candidate(), 0.6).await;
        assert_eq!(out.approvals, 3);
        assert!(out.approved);
    }

    #[tokio::test]
    async fn stalled_votes_count_as_reject() {
        let nodes: Vec<String> = vec!["a".into(), "b".into()];
        let source = FixedVotes { approve: nodes.iter().cloned().collect(), stall: ["b".to_string()].into_iter().collect() };
        let engine = ConsensusEngine::new(Arc::new(source), Duration::from_millis(20));
        let out = engine.collect(Uuid::nil(), &nodes, &candidate(), 1.0).await;
        assert_eq!(out.votes["b"], false);
        assert!(!out.approved);
    }
}
