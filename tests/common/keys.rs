//! Deterministic keys for the replicas of a test, so that tests can sign messages on behalf of any
//! replica.

use pbft_rs::types::crypto_primitives::{Keypair, SigningKey, VerifyingKey};

pub(crate) fn signing_key(id: u64) -> SigningKey {
    SigningKey::from_bytes(&[id as u8 + 1; 32])
}

pub(crate) fn keypair(id: u64) -> Keypair {
    Keypair::new(signing_key(id))
}

/// Get the verifying keys of replicas `0..replica_count`, in order.
pub(crate) fn verifying_keys(replica_count: u64) -> Vec<VerifyingKey> {
    (0..replica_count).map(|id| keypair(id).public()).collect()
}
