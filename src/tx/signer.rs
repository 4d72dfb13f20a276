//! Custody key handling and transaction signing
//!
//! The custody account signs with an Ed25519 key derived from a family seed
//! (`sEd...`). The private key is the first half of SHA-512 over the 16-byte
//! seed entropy.

use super::codec::{self, Transaction, SIGNING_PREFIX, TX_ID_PREFIX};
use crate::error::{EngineError, EngineResult};

use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha512};

/// Version prefix of an Ed25519 family seed
const ED25519_SEED_PREFIX: [u8; 3] = [0x01, 0xE1, 0x4B];

/// A transaction ready for `submit`
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub blob: String,
    pub hash: String,
    pub transaction: Transaction,
}

/// Signs on behalf of the custody account
pub struct CustodySigner {
    account: String,
    signing_key: SigningKey,
    public_key_hex: String,
}

impl CustodySigner {
    /// Build a signer from the custody address and its family seed
    pub fn from_seed(account: &str, seed: &str) -> EngineResult<Self> {
        codec::decode_address(account)?;

        let decoded = bs58::decode(seed.trim())
            .with_alphabet(bs58::Alphabet::RIPPLE)
            .with_check(None)
            .into_vec()
            .map_err(|e| EngineError::Signing(format!("invalid seed: {}", e)))?;

        if decoded.len() != 19 || decoded[..3] != ED25519_SEED_PREFIX {
            return Err(EngineError::Signing(
                "custody seed must be an Ed25519 family seed".to_string(),
            ));
        }

        Ok(Self::from_entropy(account, &decoded[3..]))
    }

    fn from_entropy(account: &str, entropy: &[u8]) -> Self {
        let digest = Sha512::digest(entropy);
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&digest[..32]);

        let signing_key = SigningKey::from_bytes(&secret);
        let public_key_hex = format!(
            "ED{}",
            hex::encode_upper(signing_key.verifying_key().to_bytes())
        );

        Self {
            account: account.to_string(),
            signing_key,
            public_key_hex,
        }
    }

    /// Custody account address
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// Sign a fully populated transaction
    pub fn sign(&self, mut tx: Transaction) -> EngineResult<SignedTransaction> {
        if tx.account != self.account {
            return Err(EngineError::Signing(format!(
                "transaction account {} is not the custody account",
                tx.account
            )));
        }
        if tx.sequence.is_none() || tx.fee.is_none() {
            return Err(EngineError::Signing(
                "transaction needs Sequence and Fee before signing".to_string(),
            ));
        }

        tx.signing_pub_key = Some(self.public_key_hex.clone());
        tx.txn_signature = None;

        let mut message = SIGNING_PREFIX.to_vec();
        message.extend_from_slice(&codec::encode(&tx, true)?);
        let signature = self.signing_key.sign(&message);
        tx.txn_signature = Some(hex::encode_upper(signature.to_bytes()));

        let blob = codec::encode(&tx, false)?;
        let hash = transaction_id(&blob);

        Ok(SignedTransaction {
            blob: hex::encode_upper(&blob),
            hash,
            transaction: tx,
        })
    }
}

/// SHA-512Half over the id prefix and the signed blob
pub fn transaction_id(blob: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(TX_ID_PREFIX);
    hasher.update(blob);
    hex::encode_upper(&hasher.finalize()[..32])
}
