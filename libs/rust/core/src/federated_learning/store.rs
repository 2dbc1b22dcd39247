//! Round ownership: handles, repository contract and the in-memory repository.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use super::round::{FederatedRound, RoundStatus};

/// A round plus the status channel watchers subscribe to.
pub struct RoundHandle {
    pub id: Uuid,
    pub model_id: String,
    state: Mutex<FederatedRound>,
    status_tx: watch::Sender<RoundStatus>,
}

impl RoundHandle {
    pub fn new(round: FederatedRound) -> Arc<Self> {
        let (status_tx, _) = watch::channel(round.status);
        Arc::new(Self { id: round.id, model_id: round.model_id.clone(), state: Mutex::new(round), status_tx })
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, FederatedRound> { self.state.lock().await }

    pub async fn snapshot(&self) -> FederatedRound { self.state.lock().await.clone() }

    pub fn publish(&self, status: RoundStatus) { self.status_tx.send_replace(status); }

    pub fn subscribe(&self) -> watch::Receiver<RoundStatus> { self.status_tx.subscribe() }
}

pub trait RoundRepository: Send + Sync {
    fn insert(&self, handle: Arc<RoundHandle>);
    fn get(&self, round_id: Uuid) -> Option<Arc<RoundHandle>>;
    fn for_model(&self, model_id: &str) -> Vec<Arc<RoundHandle>>;
    /// Monotonic per model, starting at 1.
    fn next_round_number(&self, model_id: &str) -> u64;
}

#[derive(Default)]
pub struct InMemoryRoundRepository {
    rounds: RwLock<HashMap<Uuid, Arc<RoundHandle>>>,
    by_model: RwLock<HashMap<String, Vec<Uuid>>>,
    counters: RwLock<HashMap<String, u64>>,
}

impl InMemoryRoundRepository {
    pub fn new() -> Self { Self::default() }
}

impl RoundRepository for InMemoryRoundRepository {
    fn insert(&self, handle: Arc<RoundHandle>) {
        self.by_model.write().entry(handle.model_id.clone()).or_default().push(handle.id);
        self.rounds.write().insert(handle.id, handle);
    }

    fn get(&self, round_id: Uuid) -> Option<Arc<RoundHandle>> { self.rounds.read().get(&round_id).cloned() }

    fn for_model(&self, model_id: &str) -> Vec<Arc<RoundHandle>> {
        let ids = self.by_model.read().get(model_id).cloned().unwrap_or_default();
        let rounds = self.rounds.read();
        ids.iter().filter_map(|id| rounds.get(id).cloned()).collect()
    }

    fn next_round_number(&self, model_id: &str) -> u64 {
        let mut counters = self.counters.write();
        let n = counters.entry(model_id.to_string()).or_insert(0);
        *n += 1;
        *n
    }
}
