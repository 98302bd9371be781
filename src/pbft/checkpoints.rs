/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Checkpoint votes, stable checkpoints, and the watermark window.
//!
//! A replica votes for a checkpoint after executing every sequence number that is a multiple of the
//! checkpoint interval. Once `2f+1` replicas voted for the same `(sequence, digest)`, the checkpoint
//! becomes stable: its sequence number becomes the low watermark, and the votes become the proof
//! that replicas carry into [view-changes](super::messages::ViewChange).
//!
//! Genesis, i.e., sequence number 0 with the null state digest, is stable from the start and needs
//! no proof.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::data_types::{CryptoHash, ReplicaID, SequenceNumber};

use super::{messages::Checkpoint, types::PbftConfiguration};

/// Result of [recording](CheckpointManager::record) a checkpoint vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// The sequence number is not a checkpoint sequence number, or lies outside of the window.
    Rejected,
    /// The voter already voted for the same digest.
    Duplicate,
    /// The voter already voted for `previous`, a different digest, at the same sequence number.
    Conflicting { previous: CryptoHash },
    /// The vote was counted, and no checkpoint became stable.
    Recorded,
    /// The vote made the checkpoint at `sequence` stable. `local` is the digest this replica voted
    /// for at `sequence`, if it voted.
    Stable {
        sequence: SequenceNumber,
        digest: CryptoHash,
        local: Option<CryptoHash>,
    },
}

/// Keeper of the checkpoint votes and the watermark window of one replica.
pub struct CheckpointManager {
    me: ReplicaID,
    interval: u64,
    window: u64,
    quorum: usize,
    low_watermark: SequenceNumber,
    stable_digest: CryptoHash,
    stable_proof: Vec<Checkpoint>,
    votes: BTreeMap<SequenceNumber, BTreeMap<ReplicaID, Checkpoint>>,
}

impl CheckpointManager {
    pub fn new(config: &PbftConfiguration) -> CheckpointManager {
        CheckpointManager {
            me: config.me,
            interval: config.checkpoint_interval,
            window: config.watermark_window,
            quorum: config.quorum(),
            low_watermark: SequenceNumber::init(),
            stable_digest: CryptoHash::null(),
            stable_proof: Vec::new(),
            votes: BTreeMap::new(),
        }
    }

    /// Get the sequence number of the last stable checkpoint.
    pub fn low_watermark(&self) -> SequenceNumber {
        self.low_watermark
    }

    /// Get the highest sequence number this replica currently processes.
    pub fn high_watermark(&self) -> SequenceNumber {
        self.low_watermark + self.window
    }

    /// Check whether `low_watermark < sequence <= high_watermark`.
    pub fn in_window(&self, sequence: SequenceNumber) -> bool {
        sequence > self.low_watermark && sequence <= self.high_watermark()
    }

    /// Check whether replicas vote for a checkpoint after executing `sequence`.
    pub fn is_checkpoint_sequence(&self, sequence: SequenceNumber) -> bool {
        sequence.int() > 0 && sequence.int() % self.interval == 0
    }

    /// Get the sequence number and state digest of the last stable checkpoint.
    pub fn stable_checkpoint(&self) -> (SequenceNumber, CryptoHash) {
        (self.low_watermark, self.stable_digest)
    }

    /// Get the votes that made the last stable checkpoint stable. Empty for genesis.
    pub fn stable_proof(&self) -> &[Checkpoint] {
        &self.stable_proof
    }

    /// Record a checkpoint vote.
    pub fn record(&mut self, checkpoint: &Checkpoint) -> CheckpointOutcome {
        if !self.is_checkpoint_sequence(checkpoint.sequence) || !self.in_window(checkpoint.sequence)
        {
            return CheckpointOutcome::Rejected;
        }

        let votes = self.votes.entry(checkpoint.sequence).or_default();
        match votes.get(&checkpoint.replica_id) {
            Some(previous) if previous.digest == checkpoint.digest => {
                return CheckpointOutcome::Duplicate
            }
            Some(previous) => {
                return CheckpointOutcome::Conflicting {
                    previous: previous.digest,
                }
            }
            None => {
                votes.insert(checkpoint.replica_id, checkpoint.clone());
            }
        }

        let proof: Vec<Checkpoint> = votes
            .values()
            .filter(|vote| vote.digest == checkpoint.digest)
            .cloned()
            .collect();
        if proof.len() < self.quorum {
            return CheckpointOutcome::Recorded;
        }

        let local = self.local_digest(checkpoint.sequence);
        self.install(checkpoint.sequence, checkpoint.digest, proof);
        CheckpointOutcome::Stable {
            sequence: checkpoint.sequence,
            digest: checkpoint.digest,
            local,
        }
    }

    /// Get the digest this replica voted for at `sequence`, if the vote is still kept.
    pub fn local_digest(&self, sequence: SequenceNumber) -> Option<CryptoHash> {
        self.votes
            .get(&sequence)
            .and_then(|votes| votes.get(&self.me))
            .map(|vote| vote.digest)
    }

    /// Make the checkpoint at `sequence` stable with the given `proof`, if it is above the current low
    /// watermark. Votes at or below `sequence` are discarded. Returns whether the low watermark moved.
    pub fn install(
        &mut self,
        sequence: SequenceNumber,
        digest: CryptoHash,
        proof: Vec<Checkpoint>,
    ) -> bool {
        if sequence <= self.low_watermark {
            return false;
        }
        self.low_watermark = sequence;
        self.stable_digest = digest;
        self.stable_proof = proof;
        self.votes = self.votes.split_off(&sequence.next());
        true
    }
}

/// Check that `proof` makes the checkpoint at `sequence` stable, and return its state digest.
///
/// The proof of genesis (sequence number 0) must be empty. Any other proof must consist of votes for
/// `sequence` and one digest, signed by at least a quorum of distinct members of the replica set.
pub fn verify_checkpoint_proof(
    sequence: SequenceNumber,
    proof: &[Checkpoint],
    config: &PbftConfiguration,
) -> Option<CryptoHash> {
    if sequence == SequenceNumber::init() {
        return proof.is_empty().then(CryptoHash::null);
    }
    if sequence.int() % config.checkpoint_interval != 0 {
        return None;
    }

    let digest = proof.first()?.digest;
    let mut voters = BTreeSet::new();
    for vote in proof {
        if vote.sequence != sequence
            || vote.digest != digest
            || !voters.insert(vote.replica_id)
            || !config.is_signed_by(vote, vote.replica_id)
        {
            return None;
        }
    }

    (voters.len() >= config.quorum()).then_some(digest)
}
