/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definition of the client [`Request`] type and how its digest is computed.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::{CryptoHasher, Digest},
    data_types::{ClientID, CryptoHash},
};

/// An operation submitted by a client to be executed by every replica's [`App`](crate::app::App).
///
/// The `operation` bytes are opaque to the protocol. The pair `(client, timestamp)` identifies a
/// request, and a client's timestamps must increase from one request to the next. Replicas execute a
/// request only if its timestamp is above that of the last request they executed for the same
/// client, so two requests with the same identifier execute at most once between them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Request {
    pub client: ClientID,
    pub timestamp: u64,
    pub operation: Vec<u8>,
}

impl Request {
    pub fn new(client: ClientID, timestamp: u64, operation: Vec<u8>) -> Request {
        Request {
            client,
            timestamp,
            operation,
        }
    }

    /// Get the client-assigned identifier of this request.
    pub fn id(&self) -> (ClientID, u64) {
        (self.client, self.timestamp)
    }

    /// Compute the SHA256 hash over the Borsh serialization of this request.
    pub fn digest(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        // Safety: serializing into a Vec<u8> cannot fail.
        hasher.update(&self.client.try_to_vec().unwrap());
        hasher.update(&self.timestamp.try_to_vec().unwrap());
        hasher.update(&self.operation.try_to_vec().unwrap());
        CryptoHash::new(hasher.finalize().into())
    }
}
