use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::aggregation::AggregationEngine;
use super::round::{ConsensusState, FederatedRound, RoundConfig, RoundMetrics, RoundStatus};
use super::store::{RoundHandle, RoundRepository};
use crate::consensus::ConsensusEngine;
use crate::error::{FederationError, Result};
use crate::events::{emit, EventSink, FederationEvent};
use crate::external::{ModelStore, NodeTransport};
use crate::metrics_ext::FEDERATION_METRICS;
use crate::model::{ModelUpdate, NodeId, UpdateMetadata};
use crate::privacy::PrivacyAccountant;
use crate::registry::NodeRegistry;
use crate::verifier::ModelUpdateVerifier;

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub round_id: Uuid,
    pub node_id: NodeId,
    pub received: usize,
    pub expected: usize,
    pub aggregation_triggered: bool,
}

/// Answer returned to a remote node by the inbound submission API.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Accepted(SubmissionReceipt),
    Rejected { kind: &'static str, reason: String },
}

#[derive(Default)]
struct ModelSlot {
    active_round: Option<Uuid>,
    timeout_task: Option<AbortHandle>,
}

/// Per-model critical sections. Start, finalize, timeout and cancel all run under the slot.
#[derive(Default)]
struct ModelSlots {
    slots: parking_lot::Mutex<HashMap<String, Arc<Mutex<ModelSlot>>>>,
}

impl ModelSlots {
    fn slot(&self, model_id: &str) -> Arc<Mutex<ModelSlot>> { self.slots.lock().entry(model_id.to_string()).or_default().clone() }

    fn all(&self) -> Vec<Arc<Mutex<ModelSlot>>> { self.slots.lock().values().cloned().collect() }
}

struct Finalized {
    aggregate: ModelUpdate,
    metrics: RoundMetrics,
    contributors: Vec<(NodeId, UpdateMetadata)>,
}

#[derive(Clone)]
pub struct RoundCoordinator {
    registry: Arc<NodeRegistry>,
    privacy: Arc<PrivacyAccountant>,
    verifier: ModelUpdateVerifier,
    aggregation: Arc<AggregationEngine>,
    consensus: Option<Arc<ConsensusEngine>>,
    model_store: Arc<dyn ModelStore>,
    transport: Arc<dyn NodeTransport>,
    rounds: Arc<dyn RoundRepository>,
    events: Arc<dyn EventSink>,
    slots: Arc<ModelSlots>,
}

impl RoundCoordinator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        privacy: Arc<PrivacyAccountant>,
        aggregation: Arc<AggregationEngine>,
        model_store: Arc<dyn ModelStore>,
        transport: Arc<dyn NodeTransport>,
        rounds: Arc<dyn RoundRepository>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            privacy,
            verifier: ModelUpdateVerifier::new(),
            aggregation,
            consensus: None,
            model_store,
            transport,
            rounds,
            events,
            slots: Arc::new(ModelSlots::default()),
        }
    }

    pub fn with_consensus(mut self, engine: Arc<ConsensusEngine>) -> Self {
        self.consensus = Some(engine);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> { &self.registry }

    pub fn privacy(&self) -> &Arc<PrivacyAccountant> { &self.privacy }

    #[instrument(skip(self, config), fields(min_participants = config.min_participants))]
    pub async fn start_round(&self, model_id: &str, config: RoundConfig) -> Result<FederatedRound> {
        config.validate()?;
        if config.consensus.required && self.consensus.is_none() {
            return Err(FederationError::Validation("consensus required but no vote source is configured".into()));
        }
        let slot = self.slots.slot(model_id);
        let mut slot_guard = slot.lock().await;
        if let Some(active) = slot_guard.active_round {
            return Err(FederationError::RoundAlreadyActive { model_id: model_id.to_string(), round_id: active });
        }
        let snapshot = self.model_store.get_global_model(model_id).await.map_err(|e| FederationError::ModelStore(e.to_string()))?;
        let candidates = self.registry.select_participants(config.min_participants);
        if candidates.len() < config.min_participants {
            warn!(model_id, eligible = candidates.len(), needed = config.min_participants, "not enough eligible nodes to start round");
            return Err(FederationError::InsufficientParticipants { needed: config.min_participants, actual: candidates.len() });
        }
        let selected: Vec<NodeId> = candidates.into_iter().map(|n| n.id).collect();
        let number = self.rounds.next_round_number(model_id);
        let mut round = FederatedRound::new(model_id.to_string(), number, snapshot.version, snapshot.shapes(), selected.clone(), config.clone());
        let round_id = round.id;

        let snap = &snapshot;
        let acks = join_all(selected.iter().map(|node| async move { (node.clone(), self.transport.distribute_snapshot(node, snap).await) })).await;
        for (node, res) in acks {
            match res {
                Ok(()) => { round.participants.insert(node); }
                Err(e) => warn!(%round_id, node_id = %node, error = %e, "snapshot distribution failed, node dropped from round"),
            }
        }

        if round.participants.len() < config.min_participants {
            let err = FederationError::InsufficientParticipants { needed: config.min_participants, actual: round.participants.len() };
            round.fail(err.to_string());
            self.rounds.insert(RoundHandle::new(round));
            FEDERATION_METRICS.rounds_failed_total.add(1, &[]);
            warn!(%round_id, error = %err, "round failed during distribution");
            emit(self.events.as_ref(), FederationEvent::RoundFailed { round_id, model_id: model_id.to_string(), reason: err.to_string() });
            return Err(err);
        }

        round.transition(RoundStatus::Training)?;
        round.enrolled = round.participants.iter().cloned().collect();
        self.registry.mark_training(&round.enrolled);
        let started = round.clone();
        self.rounds.insert(RoundHandle::new(round));
        slot_guard.active_round = Some(round_id);
        slot_guard.timeout_task = Some(self.arm_timeout(round_id, config.timeout));
        FEDERATION_METRICS.rounds_started_total.add(1, &[]);
        FEDERATION_METRICS.active_rounds.add(1, &[]);
        info!(%round_id, model_id, round_number = number, participants = started.participants.len(), "round started");
        emit(
            self.events.as_ref(),
            FederationEvent::RoundStarted { round_id, model_id: model_id.to_string(), round_number: number, participants: started.participants.iter().cloned().collect() },
        );
        Ok(started)
    }

    #[instrument(skip(self, update), fields(round_id = %update.round_id, node_id = %update.node_id))]
    pub async fn submit_update(&self, mut update: ModelUpdate) -> Result<SubmissionReceipt> {
        let round_id = update.round_id;
        let handle = self.rounds.get(round_id).ok_or_else(|| FederationError::Validation(format!("unknown round {round_id}")))?;
        let mut round = handle.lock().await;
        if round.status != RoundStatus::Training {
            let err = FederationError::Validation(format!("round is {:?}, not accepting updates", round.status));
            return Err(self.reject(round_id, &update.node_id, err));
        }
        if !round.is_expected(&update.node_id) {
            let err = FederationError::Validation(format!("node {} is not a participant of this round", update.node_id));
            return Err(self.reject(round_id, &update.node_id, err));
        }
        if let Err(err) = update.metadata.validate() {
            return Err(self.reject(round_id, &update.node_id, err));
        }
        if let Err(err) = self.verifier.verify(&update) {
            return Err(self.reject(round_id, &update.node_id, err));
        }
        let Some(node) = self.registry.get(&update.node_id) else {
            let err = FederationError::Validation(format!("node {} is no longer registered", update.node_id));
            return Err(self.reject(round_id, &update.node_id, err));
        };
        match self.privacy.sanitize(&mut update, &node.privacy) {
            Ok(report) => debug!(clipped = report.clipped, budget_used = report.node_budget_used, "update sanitized"),
            Err(err) if err.is_node_level() => {
                // the node leaves this round's expected set
                round.participants.remove(&update.node_id);
                round.updates.remove(&update.node_id);
                let triggered = self.begin_aggregation_if_complete(&mut round, &handle);
                drop(round);
                if triggered { self.spawn_finalize(round_id); }
                return Err(self.reject(round_id, &update.node_id, err));
            }
            Err(err) => return Err(self.reject(round_id, &update.node_id, err)),
        }

        let node_id = update.node_id.clone();
        let sample_count = update.metadata.sample_count;
        // overwrite: the latest submission before aggregation is authoritative
        round.updates.insert(node_id.clone(), update);
        let received = round.updates.len();
        let expected = round.participants.len();
        FEDERATION_METRICS.updates_accepted_total.add(1, &[]);
        emit(self.events.as_ref(), FederationEvent::UpdateSubmitted { round_id, node_id: node_id.clone(), sample_count, received, expected });
        let triggered = self.begin_aggregation_if_complete(&mut round, &handle);
        drop(round);
        if triggered { self.spawn_finalize(round_id); }
        debug!(received, expected, triggered, "update stored");
        Ok(SubmissionReceipt { round_id, node_id, received, expected, aggregation_triggered: triggered })
    }

    /// Inbound API shape: never errors, reports the structured rejection instead.
    pub async fn submit_model_update(&self, update: ModelUpdate) -> SubmissionOutcome {
        match self.submit_update(update).await {
            Ok(receipt) => SubmissionOutcome::Accepted(receipt),
            Err(e) => SubmissionOutcome::Rejected { kind: e.kind(), reason: e.to_string() },
        }
    }

    /// Operator cancellation. Never touches the global model.
    #[instrument(skip(self))]
    pub async fn cancel_round(&self, round_id: Uuid) -> Result<FederatedRound> {
        let handle = self.rounds.get(round_id).ok_or(FederationError::RoundNotFound(round_id))?;
        let slot = self.slots.slot(&handle.model_id);
        let mut slot_guard = slot.lock().await;
        let mut round = handle.lock().await;
        if round.status.is_terminal() {
            return Err(FederationError::Validation(format!("round {round_id} already {:?}", round.status)));
        }
        round.fail("cancelled by operator");
        self.release(&mut slot_guard, &round, true);
        FEDERATION_METRICS.rounds_failed_total.add(1, &[]);
        warn!(%round_id, model_id = %round.model_id, "round cancelled");
        emit(self.events.as_ref(), FederationEvent::RoundFailed { round_id, model_id: round.model_id.clone(), reason: "cancelled by operator".into() });
        handle.publish(round.status);
        Ok(round.clone())
    }

    /// Cancel every active round; used on shutdown.
    pub async fn cancel_all(&self) -> usize {
        let mut active = Vec::new();
        for slot in self.slots.all() {
            if let Some(id) = slot.lock().await.active_round { active.push(id); }
        }
        let mut cancelled = 0;
        for id in active {
            if self.cancel_round(id).await.is_ok() { cancelled += 1; }
        }
        cancelled
    }

    pub async fn get_round(&self, round_id: Uuid) -> Result<FederatedRound> {
        let handle = self.rounds.get(round_id).ok_or(FederationError::RoundNotFound(round_id))?;
        Ok(handle.snapshot().await)
    }

    pub async fn rounds_for_model(&self, model_id: &str) -> Vec<FederatedRound> {
        let mut out = Vec::new();
        for handle in self.rounds.for_model(model_id) { out.push(handle.snapshot().await); }
        out.sort_by_key(|r| r.round_number);
        out
    }

    pub async fn active_round(&self, model_id: &str) -> Option<Uuid> { self.slots.slot(model_id).lock().await.active_round }

    /// Resolves once the round reaches `Completed` or `Failed`.
    pub async fn wait_for_round(&self, round_id: Uuid) -> Result<FederatedRound> {
        let handle = self.rounds.get(round_id).ok_or(FederationError::RoundNotFound(round_id))?;
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.is_terminal()).await.map(|_| ()).map_err(|_| FederationError::Validation("round status channel closed".into()))?;
        Ok(handle.snapshot().await)
    }

    fn reject(&self, round_id: Uuid, node_id: &str, err: FederationError) -> FederationError {
        FEDERATION_METRICS.updates_rejected_total.add(1, &[]);
        warn!(%round_id, node_id, kind = err.kind(), error = %err, "update rejected");
        emit(self.events.as_ref(), FederationEvent::UpdateRejected { round_id, node_id: node_id.to_string(), reason: err.to_string() });
        err
    }

    fn begin_aggregation_if_complete(&self, round: &mut FederatedRound, handle: &RoundHandle) -> bool {
        if round.status != RoundStatus::Training || !round.all_responded() { return false; }
        if round.transition(RoundStatus::Aggregating).is_err() { return false; }
        handle.publish(RoundStatus::Aggregating);
        true
    }

    fn arm_timeout(&self, round_id: Uuid, timeout: Duration) -> AbortHandle {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.handle_timeout(round_id).await;
        })
        .abort_handle()
    }

    fn spawn_finalize(&self, round_id: Uuid) {
        let this = self.clone();
        tokio::spawn(async move { this.finalize(round_id).await });
    }

    fn release(&self, slot: &mut ModelSlot, round: &FederatedRound, abort_timeout: bool) {
        self.registry.release_from_training(&round.enrolled);
        if slot.active_round != Some(round.id) { return; }
        slot.active_round = None;
        if let Some(task) = slot.timeout_task.take() {
            if abort_timeout { task.abort(); }
        }
        FEDERATION_METRICS.active_rounds.add(-1, &[]);
    }

    #[instrument(skip(self))]
    async fn handle_timeout(&self, round_id: Uuid) {
        let Some(handle) = self.rounds.get(round_id) else { return };
        let slot = self.slots.slot(&handle.model_id);
        let mut slot_guard = slot.lock().await;
        if slot_guard.active_round == Some(round_id) {
            // running inside the timeout task itself
            slot_guard.timeout_task = None;
        }
        let mut round = handle.lock().await;
        if round.status != RoundStatus::Training { return; }
        let received = round.updates.len();
        let needed = round.config.min_participants;
        if received >= needed {
            let r = &mut *round;
            r.participants.retain(|p| r.updates.contains_key(p));
            if r.transition(RoundStatus::Aggregating).is_err() { return; }
            handle.publish(RoundStatus::Aggregating);
            info!(%round_id, received, "round timed out, aggregating over responders");
            drop(round);
            drop(slot_guard);
            self.finalize(round_id).await;
        } else {
            let err = FederationError::InsufficientParticipants { needed, actual: received };
            round.fail(err.to_string());
            self.release(&mut slot_guard, &round, false);
            FEDERATION_METRICS.rounds_failed_total.add(1, &[]);
            warn!(%round_id, received, needed, "round timed out without enough updates");
            emit(self.events.as_ref(), FederationEvent::RoundFailed { round_id, model_id: round.model_id.clone(), reason: err.to_string() });
            handle.publish(round.status);
        }
    }

    #[instrument(skip(self))]
    async fn finalize(&self, round_id: Uuid) {
        let Some(handle) = self.rounds.get(round_id) else { return };
        let slot = self.slots.slot(&handle.model_id);
        let mut slot_guard = slot.lock().await;
        let (updates, config, voters, model_id, base_version, base_shapes) = {
            let round = handle.lock().await;
            // cancelled while waiting for the slot
            if round.status != RoundStatus::Aggregating { return; }
            (round.updates.clone(), round.config.clone(), round.participants.iter().cloned().collect::<Vec<_>>(), round.model_id.clone(), round.base_version, round.base_shapes.clone())
        };

        let mut consensus = ConsensusState::default();
        let result = self.run_finalize(round_id, &model_id, (base_version, base_shapes.as_slice()), updates, &config, &voters, &mut consensus).await;

        let mut round = handle.lock().await;
        round.consensus = consensus;
        match result {
            Ok(done) => {
                for (node_id, meta) in &done.contributors {
                    if let Err(e) = self.registry.update_contribution(node_id, meta) { warn!(%node_id, error = %e, "contribution not recorded"); }
                    if let Err(e) = self.registry.update_reputation(node_id, meta) { warn!(%node_id, error = %e, "reputation not updated"); }
                }
                let version = done.metrics.model_version;
                let contributors = done.metrics.contributors;
                round.aggregate = Some(done.aggregate);
                round.metrics = Some(done.metrics);
                if let Err(e) = round.transition(RoundStatus::Completed) { error!(%round_id, error = %e, "completed round in unexpected state"); }
                FEDERATION_METRICS.rounds_completed_total.add(1, &[]);
                info!(%round_id, model_id = %model_id, version, contributors, "round completed");
                emit(self.events.as_ref(), FederationEvent::RoundCompleted { round_id, model_id: model_id.clone(), model_version: version, contributors });
            }
            Err(err) => {
                round.fail(err.to_string());
                FEDERATION_METRICS.rounds_failed_total.add(1, &[]);
                warn!(%round_id, model_id = %model_id, kind = err.kind(), error = %err, "round failed, global model untouched");
                emit(self.events.as_ref(), FederationEvent::RoundFailed { round_id, model_id: model_id.clone(), reason: err.to_string() });
            }
        }
        self.release(&mut slot_guard, &round, true);
        handle.publish(round.status);
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_finalize(
        &self,
        round_id: Uuid,
        model_id: &str,
        (base_version, base_shapes): (u64, &[Vec<usize>]),
        updates: BTreeMap<NodeId, ModelUpdate>,
        config: &RoundConfig,
        voters: &[NodeId],
        consensus: &mut ConsensusState,
    ) -> Result<Finalized> {
        if updates.len() < config.min_participants {
            return Err(FederationError::InsufficientParticipants { needed: config.min_participants, actual: updates.len() });
        }
        let global = self.model_store.get_global_model(model_id).await.map_err(|e| FederationError::ModelStore(e.to_string()))?;
        if global.version != base_version {
            warn!(%round_id, base_version, current = global.version, "global model changed outside the round");
        }
        // participants trained against the distributed layout
        if global.shapes() != base_shapes {
            return Err(FederationError::Aggregation(format!(
                "global model layout changed since round start (version {base_version} -> {})",
                global.version
            )));
        }
        let contributors: Vec<(NodeId, UpdateMetadata)> = updates.iter().map(|(id, u)| (id.clone(), u.metadata.clone())).collect();

        let engine = self.aggregation.clone();
        let method = config.method;
        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || engine.aggregate(method, &updates, &global.layers))
            .await
            .map_err(|e| FederationError::Aggregation(format!("aggregation worker failed: {e}")))??;
        let aggregation_ms = started.elapsed().as_secs_f64() * 1000.0;
        FEDERATION_METRICS.aggregation_latency_ms.record(aggregation_ms, &[]);
        let mut aggregate = outcome.update;
        aggregate.round_id = round_id;
        self.verifier.sign(&mut aggregate)?;

        if config.consensus.required {
            let engine = self.consensus.as_ref().ok_or_else(|| FederationError::Validation("consensus required but no vote source is configured".into()))?;
            let vote = engine.collect(round_id, voters, &aggregate, config.consensus.threshold).await;
            consensus.votes = vote.votes.clone();
            consensus.approved = Some(vote.approved);
            if !vote.approved {
                return Err(FederationError::ConsensusRejected { approvals: vote.approvals, participants: vote.participants, threshold: config.consensus.threshold });
            }
        }

        let model_version = self.model_store.apply_aggregate(model_id, &aggregate).await.map_err(|e| FederationError::ModelStore(e.to_string()))?;
        let metrics = RoundMetrics {
            contributors: contributors.len(),
            total_samples: aggregate.metadata.sample_count,
            average_loss: aggregate.metadata.local_loss,
            average_accuracy: aggregate.metadata.local_accuracy,
            aggregation_ms,
            weighting: outcome.weighting,
            model_version,
        };
        Ok(Finalized { aggregate, metrics, contributors })
    }
}
