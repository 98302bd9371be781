/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-sequence-number record of the agreement progress of a replica.

use std::collections::BTreeMap;

use crate::types::data_types::{CryptoHash, SequenceNumber};

use super::messages::{PrePrepare, Prepare, PreparedProof};

/// How far a sequence number has progressed through the three phases in the current view.
///
/// The variants are ordered, so `phase >= EntryPhase::Prepared` reads "at least prepared". Entering a
/// new view resets every entry to `Pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryPhase {
    /// Votes were seen, but no pre-prepare was accepted in the current view.
    Pending,
    PrePrepared,
    Prepared,
    /// Committed-locally.
    Committed,
}

/// What a replica knows about a single sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: SequenceNumber,

    /// The pre-prepare accepted in the current view.
    pub pre_prepare: Option<PrePrepare>,

    pub phase: EntryPhase,

    /// The signed prepare votes counted for this sequence number, which become part of its prepared
    /// certificate.
    pub prepares: Vec<Prepare>,

    /// The prepared certificate of the highest view in which this sequence number was prepared at
    /// this replica. Carried into view-changes, and kept when entering a new view.
    pub prepared_proof: Option<PreparedProof>,
}

impl LogEntry {
    pub fn new(sequence: SequenceNumber) -> LogEntry {
        LogEntry {
            sequence,
            pre_prepare: None,
            phase: EntryPhase::Pending,
            prepares: Vec::new(),
            prepared_proof: None,
        }
    }

    /// Get the digest of the accepted pre-prepare, if any.
    pub fn digest(&self) -> Option<CryptoHash> {
        self.pre_prepare.as_ref().map(|pre_prepare| pre_prepare.digest)
    }
}

/// Ordered collection of [`LogEntry`]s, garbage collected from below.
///
/// The log remembers the highest sequence number it was pruned at (its "floor"), and never holds
/// entries at or below it again.
pub struct MessageLog {
    entries: BTreeMap<SequenceNumber, LogEntry>,
    floor: SequenceNumber,
}

impl MessageLog {
    pub fn new() -> MessageLog {
        MessageLog {
            entries: BTreeMap::new(),
            floor: SequenceNumber::init(),
        }
    }

    /// Insert `entry`, replacing any entry with the same sequence number. Returns `false` and drops
    /// the entry if its sequence number is at or below the floor.
    pub fn append(&mut self, entry: LogEntry) -> bool {
        if entry.sequence <= self.floor {
            return false;
        }
        self.entries.insert(entry.sequence, entry);
        true
    }

    pub fn get(&self, sequence: SequenceNumber) -> Option<&LogEntry> {
        self.entries.get(&sequence)
    }

    pub fn get_mut(&mut self, sequence: SequenceNumber) -> Option<&mut LogEntry> {
        self.entries.get_mut(&sequence)
    }

    /// Get the entry for `sequence`, creating a [`Pending`](EntryPhase::Pending) entry if there is none.
    /// Returns `None` if `sequence` is at or below the floor.
    pub fn get_or_insert(&mut self, sequence: SequenceNumber) -> Option<&mut LogEntry> {
        if sequence <= self.floor {
            return None;
        }
        Some(
            self.entries
                .entry(sequence)
                .or_insert_with(|| LogEntry::new(sequence)),
        )
    }

    /// Remove every entry at or below `sequence`, and raise the floor to `sequence`. Calling this
    /// with a sequence number at or below the current floor does nothing.
    pub fn prune_below(&mut self, sequence: SequenceNumber) {
        if sequence <= self.floor {
            return;
        }
        self.entries = self.entries.split_off(&sequence.next());
        self.floor = sequence;
    }

    /// Iterate over the entries in ascending sequence number order.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.values()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut LogEntry> {
        self.entries.values_mut()
    }

    pub fn floor(&self) -> SequenceNumber {
        self.floor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}
