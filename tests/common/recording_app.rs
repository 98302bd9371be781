//! [`RecordingApp`], a simple implementation of [`App`] used in all of the integration tests.

use std::sync::{Arc, Mutex};

use pbft_rs::{
    app::App,
    types::{
        data_types::{CryptoHash, SequenceNumber},
        request::Request,
    },
};
use sha2::{Digest, Sha256};

/// An app whose state is a hash chain over the digests of the requests it executed.
///
/// Every call to `execute` and `state_transfer_required` is recorded in shared logs, so that tests can
/// read them both through [`Pbft::app`](pbft_rs::pbft::implementation::Pbft::app) and, through a
/// [`RecordingAppHandle`], while the app is owned by a replica thread.
pub(crate) struct RecordingApp {
    state: CryptoHash,
    salt: u8,
    executed: Arc<Mutex<Vec<(SequenceNumber, CryptoHash)>>>,
    transfers: Arc<Mutex<Vec<(SequenceNumber, CryptoHash)>>>,
}

#[derive(Clone)]
pub(crate) struct RecordingAppHandle {
    executed: Arc<Mutex<Vec<(SequenceNumber, CryptoHash)>>>,
    transfers: Arc<Mutex<Vec<(SequenceNumber, CryptoHash)>>>,
}

impl RecordingApp {
    pub(crate) fn new() -> RecordingApp {
        Self::with_salt(0)
    }

    /// Create an app that computes different state digests than apps with another `salt`, for
    /// simulating a replica whose state diverged.
    pub(crate) fn with_salt(salt: u8) -> RecordingApp {
        RecordingApp {
            state: CryptoHash::null(),
            salt,
            executed: Arc::new(Mutex::new(Vec::new())),
            transfers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn handle(&self) -> RecordingAppHandle {
        RecordingAppHandle {
            executed: self.executed.clone(),
            transfers: self.transfers.clone(),
        }
    }

    /// Get the (sequence number, request digest) pairs executed so far, in execution order.
    pub(crate) fn executed(&self) -> Vec<(SequenceNumber, CryptoHash)> {
        self.executed.lock().unwrap().clone()
    }

    pub(crate) fn transfers(&self) -> Vec<(SequenceNumber, CryptoHash)> {
        self.transfers.lock().unwrap().clone()
    }

    /// Overwrite the state with one obtained from a peer.
    pub(crate) fn restore(&mut self, state: CryptoHash) {
        self.state = state;
    }
}

impl RecordingAppHandle {
    pub(crate) fn executed(&self) -> Vec<(SequenceNumber, CryptoHash)> {
        self.executed.lock().unwrap().clone()
    }

    pub(crate) fn transfers(&self) -> Vec<(SequenceNumber, CryptoHash)> {
        self.transfers.lock().unwrap().clone()
    }
}

impl App for RecordingApp {
    fn execute(&mut self, sequence: SequenceNumber, request: &Request) -> CryptoHash {
        let digest = request.digest();
        let mut hasher = Sha256::new();
        hasher.update(self.state.bytes());
        hasher.update(digest.bytes());
        hasher.update([self.salt]);
        self.state = CryptoHash::new(hasher.finalize().into());
        self.executed.lock().unwrap().push((sequence, digest));
        self.state
    }

    fn state_transfer_required(&mut self, target: SequenceNumber, digest: CryptoHash) {
        self.transfers.lock().unwrap().push((target, digest));
    }
}
