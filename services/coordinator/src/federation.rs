use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use federation_core::external::{InMemoryModelStore, NodeTransport};
use federation_core::{
    AggregationEngine, BroadcastEventSink, EngineConfig, GlobalModelSnapshot, InMemoryNodeRepository, InMemoryRoundRepository, NodeRegistry,
    PrivacyAccountant, RoundCoordinator,
};

const EVENT_BUFFER: usize = 1024;

/// Transport used when no node network is wired in: records the hand-off only.
struct LoggingTransport;

#[async_trait]
impl NodeTransport for LoggingTransport {
    async fn distribute_snapshot(&self, node_id: &str, snapshot: &GlobalModelSnapshot) -> Result<()> {
        info!(node_id, model_id = %snapshot.model_id, version = snapshot.version, "snapshot_dispatched");
        Ok(())
    }
}

pub struct FederationModule {
    coordinator: RoundCoordinator,
    store: Arc<InMemoryModelStore>,
    event_logger: JoinHandle<()>,
}

impl FederationModule {
    pub fn new(cfg: &EngineConfig) -> Result<Self> {
        if cfg.consensus.required {
            bail!("consensus.required is set but this service has no vote source configured");
        }
        let events = Arc::new(BroadcastEventSink::new(EVENT_BUFFER));
        let mut rx = events.subscribe();
        let event_logger = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        let payload = serde_json::to_string(&record.payload).unwrap_or_default();
                        info!(kind = record.kind, entity_id = %record.entity_id, %payload, "federation_event");
                    }
                    Err(RecvError::Lagged(missed)) => warn!(missed, "event logger lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let registry = Arc::new(NodeRegistry::new(Arc::new(InMemoryNodeRepository::new()), events.clone(), cfg.registry.clone()));
        let store = Arc::new(InMemoryModelStore::new());
        let coordinator = RoundCoordinator::new(
            registry,
            Arc::new(PrivacyAccountant::new(cfg.privacy.node_budget_limit)),
            Arc::new(AggregationEngine::new(&cfg.aggregation)),
            store.clone(),
            Arc::new(LoggingTransport),
            Arc::new(InMemoryRoundRepository::new()),
            events,
        );
        info!("federation_module_initialized");
        Ok(Self { coordinator, store, event_logger })
    }

    pub fn coordinator(&self) -> &RoundCoordinator { &self.coordinator }

    pub fn store(&self) -> &Arc<InMemoryModelStore> { &self.store }

    pub async fn shutdown(&self) -> Result<()> {
        let cancelled = self.coordinator.cancel_all().await;
        self.event_logger.abort();
        info!(cancelled, "federation_module_shutdown");
        Ok(())
    }
}
