//! Federated training rounds: state machine, aggregation and the coordinator.

pub mod aggregation;
pub mod coordinator;
pub mod round;
pub mod store;

pub use aggregation::{AggregationEngine, AggregationMethod, AggregationOutcome};
pub use coordinator::{RoundCoordinator, SubmissionOutcome, SubmissionReceipt};
pub use round::{ConsensusRequirement, ConsensusState, FederatedRound, PrivacyMechanism, RoundConfig, RoundMetrics, RoundStatus};
pub use store::{InMemoryRoundRepository, RoundHandle, RoundRepository};
