/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of types specific to the [PBFT](crate::pbft::implementation::Pbft) protocol.

use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    io,
    time::Duration,
};

use crate::types::{
    crypto_primitives::VerifyingKey,
    data_types::{ReplicaID, SequenceNumber, ViewNumber},
    signed_messages::SignedMessage,
};

/// Immutable parameters that determine the behavior of a [`Pbft`](super::implementation::Pbft)
/// replica.
///
/// Values of this type are produced by [`Configuration::validate`](crate::replica::Configuration::validate),
/// which guarantees that:
/// 1. the number of `replicas` is of the form `3f+1`,
/// 2. `me` is a position in `replicas`,
/// 3. `checkpoint_interval` is non-zero and not larger than `watermark_window`, and
/// 4. both timeouts are non-zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PbftConfiguration {
    pub me: ReplicaID,
    /// The verifying key of every replica, indexed by [`ReplicaID`].
    pub replicas: Vec<VerifyingKey>,
    pub checkpoint_interval: u64,
    pub watermark_window: u64,
    pub request_timeout: Duration,
    pub view_change_timeout: Duration,
}

impl PbftConfiguration {
    /// Get `n`, the number of replicas in the replica set.
    pub fn replica_count(&self) -> u64 {
        self.replicas.len() as u64
    }

    /// Get `f`, the number of faulty replicas the replica set tolerates.
    pub fn max_faulty(&self) -> u64 {
        self.replica_count().saturating_sub(1) / 3
    }

    /// Get the quorum size `2f+1`.
    pub fn quorum(&self) -> usize {
        (2 * self.max_faulty() + 1) as usize
    }

    /// Check whether `replica` is a member of the replica set.
    pub fn is_member(&self, replica: ReplicaID) -> bool {
        replica.int() < self.replica_count()
    }

    /// Check whether `message` carries a correct signature of `signer`, a member of the replica set.
    pub fn is_signed_by(&self, message: &impl SignedMessage, signer: ReplicaID) -> bool {
        usize::try_from(signer.int())
            .ok()
            .and_then(|index| self.replicas.get(index))
            .is_some_and(|verifying_key| message.is_correct(verifying_key))
    }
}

/// The two states a replica can be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Ordering requests in the current view.
    Normal,

    /// Waiting for a valid [`NewView`](super::messages::NewView) for `target` or a higher view.
    ViewChanging { target: ViewNumber },
}

/// Counters and flags that tell how much unusable input a replica has received so far.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Envelopes whose payload could not be decoded.
    pub malformed_messages: u64,

    /// Decoded messages that broke a protocol rule and were ignored.
    pub rejected_messages: u64,

    /// Replicas that were caught sending two different digests for the same slot.
    pub equivocators: BTreeSet<ReplicaID>,
}

/// Why a decoded message was ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The `replica_id` of the message is not the replica the network delivered it from.
    OriginMismatch,
    /// The message names a replica outside of the replica set.
    UnknownReplica,
    /// The message is for a view other than the one the replica is processing.
    WrongView,
    /// The sender is not the primary of the message's view, or the primary sent a backup's vote.
    WrongPrimary,
    /// The replica is changing views and does not accept normal-case messages.
    ViewChangeInProgress,
    /// The signature of the message is not the sender's.
    InvalidSignature,
    /// The sequence number lies outside of the watermark window.
    OutsideWindow,
    /// The pre-prepare's digest does not match its request, or a null pre-prepare arrived outside
    /// of a new-view.
    MalformedPrePrepare,
    /// A different pre-prepare was already accepted for the same view and sequence number.
    ConflictingPrePrepare,
    /// The replica voted for a different digest in the same slot before.
    ConflictingVote,
    /// The checkpoint proof or a prepared certificate of a view-change does not hold up.
    InvalidViewChange,
    /// The view-change proof of a new-view does not hold up, or its pre-prepares do not assign the
    /// slots recomputed from the proof.
    InvalidNewView,
    /// The new-view drops or alters a request that is prepared at this replica.
    NewViewDropsPrepared,
}

/// Errors that [`Pbft`](super::implementation::Pbft) reports to its caller.
///
/// Protocol violations are not errors: they are ignored and counted in [`Diagnostics`].
#[derive(Debug)]
pub enum PbftError {
    /// The payload of an envelope could not be decoded.
    MalformedMessage(io::Error),

    /// [`state_transferred`](super::implementation::Pbft::state_transferred) was called while no
    /// state transfer was required.
    NoStateTransferRequired,

    /// [`state_transferred`](super::implementation::Pbft::state_transferred) reported a state older
    /// than the certified checkpoint the replica needs.
    StateTransferBelowTarget {
        target: SequenceNumber,
        sequence: SequenceNumber,
    },
}

impl From<io::Error> for PbftError {
    fn from(value: io::Error) -> Self {
        PbftError::MalformedMessage(value)
    }
}

impl Display for PbftError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PbftError::MalformedMessage(error) => write!(f, "malformed message: {}", error),
            PbftError::NoStateTransferRequired => write!(f, "no state transfer is required"),
            PbftError::StateTransferBelowTarget { target, sequence } => write!(
                f,
                "transferred state at sequence {} is below the required checkpoint {}",
                sequence, target
            ),
        }
    }
}

impl std::error::Error for PbftError {}
