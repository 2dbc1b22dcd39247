//! Federated learning coordination engine.
//!
//! Nodes register with capabilities and privacy preferences, rounds select
//! participants, collect signed and sanitized updates, aggregate them and
//! (optionally after an approval vote) advance the global model.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod consensus;
pub mod error;
pub mod events;
pub mod external;
pub mod federated_learning;
pub mod metrics_ext;
pub mod model;
pub mod privacy;
pub mod registry;
pub mod settings;
pub mod verifier;

pub use consensus::{ConsensusEngine, ConsensusOutcome, VoteSource};
pub use error::{FederationError, Result as FederationResult};
pub use events::{BroadcastEventSink, EventRecord, EventSink, FederationEvent, MemoryEventSink};
pub use external::{InMemoryModelStore, ModelStore, NodeTransport};
pub use federated_learning::{
    AggregationEngine, AggregationMethod, FederatedRound, InMemoryRoundRepository, RoundConfig, RoundCoordinator, RoundStatus, SubmissionOutcome,
    SubmissionReceipt,
};
pub use metrics_ext::{FederationMetrics, FEDERATION_METRICS};
pub use model::{GlobalModelSnapshot, LayerBuffer, ModelUpdate, NodeId, UpdateMetadata};
pub use privacy::PrivacyAccountant;
pub use registry::{FederatedNode, InMemoryNodeRepository, NodeCapabilities, NodeRegistration, NodeRegistry, NodeStatus, PrivacyPreferences};
pub use settings::{load_config, EngineConfig};
pub use verifier::ModelUpdateVerifier;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber once. `FEDERATION_JSON_LOG=1` switches to JSON lines;
/// filtering follows `RUST_LOG`, falling back to `default_level` (the configured `log_level`).
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("FEDERATION_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = env_filter(default_level)?;
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false)).try_init()?;
        } else {
            registry.with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true)).try_init()?;
        }
        Ok(())
    })?;
    info!(target: "federation", service, "tracing initialized");
    Ok(())
}

fn env_filter(default_level: &str) -> Result<tracing_subscriber::EnvFilter> {
    let level: tracing::level_filters::LevelFilter = default_level.parse()?;
    Ok(tracing_subscriber::EnvFilter::builder().with_default_directive(level.into()).from_env_lossy())
}
