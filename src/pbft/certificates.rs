/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Counting of prepare and commit votes.
//!
//! The [`CertificateTracker`] keeps, for every (phase, view, sequence number) slot, the digest that
//! each replica voted for. A replica contributes at most one vote per slot: repeating the same vote is
//! a [`Duplicate`](RecordOutcome::Duplicate), and voting for a different digest is
//! [`Conflicting`](RecordOutcome::Conflicting) and leaves the first vote in place.

use std::collections::{HashMap, HashSet};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{CryptoHash, ReplicaID, SequenceNumber, ViewNumber};

/// The two voting phases of the protocol.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub enum Phase {
    Prepare,
    Commit,
}

/// Result of [recording](CertificateTracker::record) a vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The vote was counted.
    Accepted,
    /// The voter already voted for the same digest in this slot.
    Duplicate,
    /// The voter already voted for `previous`, a different digest, in this slot. The vote was not
    /// counted.
    Conflicting { previous: CryptoHash },
}

#[derive(Default)]
struct Certificate {
    votes: HashMap<ReplicaID, CryptoHash>,
    tallies: HashMap<CryptoHash, HashSet<ReplicaID>>,
}

type Slot = (Phase, ViewNumber, SequenceNumber);

/// Vote counter for the prepare and commit phases.
pub struct CertificateTracker {
    quorum: usize,
    certificates: HashMap<Slot, Certificate>,
}

impl CertificateTracker {
    /// Create an empty tracker that considers `quorum` distinct voters a quorum.
    pub fn new(quorum: usize) -> CertificateTracker {
        CertificateTracker {
            quorum,
            certificates: HashMap::new(),
        }
    }

    /// Record `voter`'s vote for `digest` in the slot `(phase, view, sequence)`.
    pub fn record(
        &mut self,
        phase: Phase,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: CryptoHash,
        voter: ReplicaID,
    ) -> RecordOutcome {
        let certificate = self
            .certificates
            .entry((phase, view, sequence))
            .or_default();

        match certificate.votes.get(&voter) {
            Some(previous) if *previous == digest => RecordOutcome::Duplicate,
            Some(previous) => RecordOutcome::Conflicting {
                previous: *previous,
            },
            None => {
                certificate.votes.insert(voter, digest);
                certificate.tallies.entry(digest).or_default().insert(voter);
                RecordOutcome::Accepted
            }
        }
    }

    /// Check whether a quorum of distinct replicas voted for `digest` in the slot
    /// `(phase, view, sequence)`.
    pub fn has_quorum(
        &self,
        phase: Phase,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: &CryptoHash,
    ) -> bool {
        self.tally(phase, view, sequence, digest)
            .is_some_and(|voters| voters.len() >= self.quorum)
    }

    /// Get the replicas that voted for `digest` in the slot `(phase, view, sequence)`, in ascending
    /// order.
    pub fn voters(
        &self,
        phase: Phase,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: &CryptoHash,
    ) -> Vec<ReplicaID> {
        let mut voters: Vec<ReplicaID> = self
            .tally(phase, view, sequence, digest)
            .map(|voters| voters.iter().copied().collect())
            .unwrap_or_default();
        voters.sort();
        voters
    }

    /// Remove every slot whose sequence number is at or below `sequence`. Idempotent.
    pub fn prune_below(&mut self, sequence: SequenceNumber) {
        self.certificates
            .retain(|(_, _, slot_sequence), _| *slot_sequence > sequence)
    }

    /// Remove every slot of a view lower than `view`.
    pub fn prune_views_below(&mut self, view: ViewNumber) {
        self.certificates
            .retain(|(_, slot_view, _), _| *slot_view >= view)
    }

    /// Get the number of slots that hold at least one vote.
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    fn tally(
        &self,
        phase: Phase,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: &CryptoHash,
    ) -> Option<&HashSet<ReplicaID>> {
        self.certificates
            .get(&(phase, view, sequence))
            .and_then(|certificate| certificate.tallies.get(digest))
    }
}
