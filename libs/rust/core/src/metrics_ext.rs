//! Federation metrics group registered on the global OpenTelemetry meter.
//!
//! Exporter wiring belongs to the host service; without one these are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit, UpDownCounter};

pub struct FederationMetrics {
    pub rounds_started_total: Counter<u64>,
    pub rounds_completed_total: Counter<u64>,
    pub rounds_failed_total: Counter<u64>,
    pub active_rounds: UpDownCounter<i64>,
    pub updates_accepted_total: Counter<u64>,
    pub updates_rejected_total: Counter<u64>,
    pub nodes_registered_total: Counter<u64>,
    pub privacy_epsilon_spent: Counter<f64>,
    pub consensus_votes_total: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
}

static FED_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("swarm_federation"));

pub static FEDERATION_METRICS: Lazy<FederationMetrics> = Lazy::new(|| FederationMetrics {
    rounds_started_total: FED_METER.u64_counter("fed_rounds_started_total").with_description("Federated rounds started").init(),
    rounds_completed_total: FED_METER.u64_counter("fed_rounds_completed_total").with_description("Federated rounds completed").init(),
    rounds_failed_total: FED_METER.u64_counter("fed_rounds_failed_total").with_description("Federated rounds failed or cancelled").init(),
    active_rounds: FED_METER.i64_up_down_counter("fed_active_rounds").with_description("Rounds currently between start and a terminal state").init(),
    updates_accepted_total: FED_METER.u64_counter("fed_updates_accepted_total").with_description("Model updates stored into a round").init(),
    updates_rejected_total: FED_METER.u64_counter("fed_updates_rejected_total").with_description("Model updates rejected (validation/signature/privacy)").init(),
    nodes_registered_total: FED_METER.u64_counter("fed_nodes_registered_total").with_description("Nodes admitted to the registry").init(),
    privacy_epsilon_spent: FED_METER.f64_counter("fed_privacy_epsilon_spent").with_description("Cumulative epsilon charged across all nodes").init(),
    consensus_votes_total: FED_METER.u64_counter("fed_consensus_votes_total").with_description("Consensus votes collected").init(),
    aggregation_latency_ms: FED_METER
        .f64_histogram("fed_aggregation_latency_ms")
        .with_description("Aggregation latency ms")
        .with_unit(Unit::new("ms"))
        .init(),
});
