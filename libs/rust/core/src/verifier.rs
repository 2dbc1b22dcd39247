//! Integrity signatures for incoming model updates.
//!
//! The digest covers node id, round id and the canonical JSON of the metadata.
//! Weight buffers are not hashed.

use sha2::{Digest, Sha256};

use crate::error::{FederationError, Result};
use crate::model::ModelUpdate;

#[derive(Debug, Clone, Copy, Default)]
pub struct ModelUpdateVerifier;

impl ModelUpdateVerifier {
    pub fn new() -> Self { Self }

    pub fn compute_signature(&self, update: &ModelUpdate) -> Result<String> {
        let meta = serde_json::to_vec(&update.metadata).map_err(|e| FederationError::Validation(format!("metadata encoding: {e}")))?;
        let mut hasher = Sha256::new();
        hasher.update(update.node_id.as_bytes());
        hasher.update(update.round_id.as_bytes());
        hasher.update(&meta);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn verify(&self, update: &ModelUpdate) -> Result<()> {
        let expected = self.compute_signature(update)?;
        if update.signature.is_empty() || !expected.eq_ignore_ascii_case(update.signature.trim()) {
            return Err(FederationError::Signature { node_id: update.node_id.clone() });
        }
        Ok(())
    }

    /// Participant-side helper: stamp the update with its signature.
    pub fn sign(&self, update: &mut ModelUpdate) -> Result<()> {
        update.signature = self.compute_signature(update)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LayerBuffer, UpdateMetadata};
    use uuid::Uuid;

    fn signed() -> ModelUpdate {
        let mut upd = ModelUpdate::new("n1", Uuid::new_v4(), vec![LayerBuffer::filled(vec![2], 1.0)], UpdateMetadata { sample_count: 10, ..Default::default() });
        ModelUpdateVerifier::new().sign(&mut upd).unwrap();
        upd
    }

    #[test]
    fn accepts_own_signature() {
        assert!(ModelUpdateVerifier::new().verify(&signed()).is_ok());
    }

    #[test]
    fn tampered_metadata_fails() {
        let mut upd = signed();
        upd.metadata.sample_count = 10_000;
        assert!(matches!(ModelUpdateVerifier::new().verify(&upd), Err(FederationError::Signature { .. })));
    }

    #[test]
    fn missing_signature_fails() {
        let mut upd = signed();
        upd.signature.clear();
        assert!(ModelUpdateVerifier::new().verify(&upd).is_err());
    }
}
