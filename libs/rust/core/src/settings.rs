//! Layered engine configuration: defaults, optional file, then `FEDERATION__*` env.

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use crate::federated_learning::aggregation::AggregationMethod;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub service_name: String,
    pub log_level: String,
    pub registry: RegistrySettings,
    pub round: RoundSettings,
    pub privacy: PrivacySettings,
    pub consensus: ConsensusSettings,
    pub aggregation: AggregationSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_name: "federation".into(),
            log_level: "info".into(),
            registry: RegistrySettings::default(),
            round: RoundSettings::default(),
            privacy: PrivacySettings::default(),
            consensus: ConsensusSettings::default(),
            aggregation: AggregationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub min_registration_trust: f64,
    pub min_selection_trust: f64,
}

impl Default for RegistrySettings {
    fn default() -> Self { Self { min_registration_trust: 0.3, min_selection_trust: 0.5 } }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoundSettings {
    pub min_participants: usize,
    pub method: AggregationMethod,
    pub timeout_secs: u64,
}

impl Default for RoundSettings {
    fn default() -> Self { Self { min_participants: 3, method: AggregationMethod::FedAvg, timeout_secs: 300 } }
}

impl RoundSettings {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PrivacySettings {
    /// Per-node epsilon ceiling; `None` means unbounded additive spend.
    pub node_budget_limit: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    pub required: bool,
    pub threshold: f64,
    pub vote_timeout_ms: u64,
}

impl Default for ConsensusSettings {
    fn default() -> Self { Self { required: false, threshold: 0.67, vote_timeout_ms: 5_000 } }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    pub proximal_mu: f64,
    /// Element count above which layers are aggregated on the rayon pool.
    pub parallel_threshold: usize,
}

impl Default for AggregationSettings {
    fn default() -> Self { Self { proximal_mu: 0.01, parallel_threshold: 65_536 } }
}

pub fn load_config(service: &str) -> Result<EngineConfig> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?
        .set_default("log_level", "info")?;
    if let Ok(file) = std::env::var("FEDERATION_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("FEDERATION").separator("__").try_parsing(true));
    let cfg: EngineConfig = builder.build()?.try_deserialize()?;
    validate(&cfg)?;
    tracing::debug!(service = %cfg.service_name, min_participants = cfg.round.min_participants, "engine config loaded");
    Ok(cfg)
}

fn validate(cfg: &EngineConfig) -> Result<()> {
    if cfg.log_level.parse::<tracing::level_filters::LevelFilter>().is_err() {
        anyhow::bail!("log_level {:?} is not a level (trace, debug, info, warn, error, off)", cfg.log_level);
    }
    if cfg.round.min_participants == 0 { anyhow::bail!("round.min_participants must be at least 1"); }
    if !(cfg.consensus.threshold > 0.0 && cfg.consensus.threshold <= 1.0) { anyhow::bail!("consensus.threshold must be in (0, 1]"); }
    if cfg.aggregation.proximal_mu < 0.0 { anyhow::bail!("aggregation.proximal_mu must be non-negative"); }
    if let Some(limit) = cfg.privacy.node_budget_limit { if limit <= 0.0 { anyhow::bail!("privacy.node_budget_limit must be positive"); } }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.registry.min_registration_trust, 0.3);
        assert_eq!(cfg.registry.min_selection_trust, 0.5);
        assert_eq!(cfg.aggregation.proximal_mu, 0.01);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn partial_document_keeps_section_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"round": {"min_participants": 5, "method": "fednova"}}"#).unwrap();
        assert_eq!(cfg.round.min_participants, 5);
        assert_eq!(cfg.round.method, AggregationMethod::FedNova);
        assert_eq!(cfg.round.timeout_secs, 300);
        assert!(!cfg.consensus.required);
    }

    #[test]
    fn log_level_must_name_a_level() {
        let mut cfg = EngineConfig::default();
        cfg.log_level = "warn".into();
        assert!(validate(&cfg).is_ok());
        cfg.log_level = "verbose".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_bad_threshold() {
        let mut cfg = EngineConfig::default();
        cfg.consensus.threshold = 1.5;
        assert!(validate(&cfg).is_err());
    }
}
