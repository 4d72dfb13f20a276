//! PREIMAGE-SHA-256 crypto-conditions for hash-locked escrows

use crate::error::{EngineError, EngineResult};
use crate::state::{ConditionPair, Store};

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error};

/// Preimage length in bytes
pub const PREIMAGE_LEN: usize = 32;

/// `A0 25 80 20 <sha256(preimage)> 81 01 20`
pub fn condition_for(preimage: &[u8]) -> Vec<u8> {
    let mut out = vec![0xA0, 0x25, 0x80, 0x20];
    out.extend_from_slice(&Sha256::digest(preimage));
    out.extend_from_slice(&[0x81, 0x01, preimage.len() as u8]);
    out
}

/// `A0 22 80 20 <preimage>`
pub fn fulfillment_for(preimage: &[u8]) -> Vec<u8> {
    let mut out = vec![0xA0, 0x22, 0x80, preimage.len() as u8];
    out.extend_from_slice(preimage);
    out
}

/// Whether a hex fulfillment opens a hex condition
pub fn verify(condition: &str, fulfillment: &str) -> bool {
    let fulfillment = match hex::decode(fulfillment) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    if fulfillment.len() != 4 + PREIMAGE_LEN || fulfillment[..4] != [0xA0, 0x22, 0x80, 0x20] {
        return false;
    }

    let expected = hex::encode_upper(condition_for(&fulfillment[4..]));
    expected.eq_ignore_ascii_case(condition)
}

/// Generates and persists condition/fulfillment pairs
pub struct ConditionGenerator {
    store: Arc<dyn Store>,
}

impl ConditionGenerator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Draw a fresh preimage and persist the pair before handing it out
    pub async fn generate(&self) -> EngineResult<ConditionPair> {
        let mut preimage = [0u8; PREIMAGE_LEN];
        rand::thread_rng().fill_bytes(&mut preimage);

        let pair = ConditionPair {
            escrow_condition: hex::encode_upper(condition_for(&preimage)),
            fulfillment: hex::encode_upper(fulfillment_for(&preimage)),
        };

        if let Err(e) = self.store.insert_condition(&pair).await {
            error!("Condition {} was not persisted: {}", pair.escrow_condition, e);
            return Err(match e {
                EngineError::Persistence(_) => e,
                other => EngineError::Persistence(other.to_string()),
            });
        }

        debug!("Generated condition {}", pair.escrow_condition);
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::MemoryStore;

    #[test]
    fn test_encodings() {
        let preimage = [7u8; 32];
        let condition = condition_for(&preimage);
        assert_eq!(condition.len(), 39);
        assert_eq!(&condition[..4], &[0xA0, 0x25, 0x80, 0x20]);
        assert_eq!(&condition[36..], &[0x81, 0x01, 0x20]);

        let fulfillment = fulfillment_for(&preimage);
        assert_eq!(fulfillment.len(), 36);
        assert_eq!(&fulfillment[4..], &preimage);

        assert!(verify(
            &hex::encode_upper(&condition),
            &hex::encode_upper(&fulfillment)
        ));
        assert!(!verify(
            &hex::encode_upper(&condition),
            &hex::encode_upper(fulfillment_for(&[8u8; 32]))
        ));
    }

    #[tokio::test]
    async fn test_generate_persists_pair() {
        let store = Arc::new(MemoryStore::new());
        let generator = ConditionGenerator::new(store.clone());

        let pair = generator.generate().await.unwrap();
        assert!(verify(&pair.escrow_condition, &pair.fulfillment));
        assert_eq!(
            store.fulfillment(&pair.escrow_condition).await.unwrap(),
            Some(pair.fulfillment)
        );
    }

    #[test]
    fn test_generate_fails_when_not_persisted() {
        let store = Arc::new(MemoryStore::failing_condition_writes());
        let generator = ConditionGenerator::new(store.clone());

        assert!(matches!(
            tokio_test::block_on(generator.generate()),
            Err(EngineError::Persistence(_))
        ));
        assert_eq!(store.condition_count(), 0);
    }
}
