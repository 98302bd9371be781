/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between replicas as part of the
//! [PBFT](crate::pbft::implementation::Pbft) protocol.
//!
//! ## Authentication
//!
//! The [network](crate::networking::network::Network) attaches the authenticated origin of every
//! envelope it delivers, and replicas check that every message that carries a `replica_id` was
//! delivered by that same replica.
//!
//! Messages that replicas relay inside proofs, namely [`PrePrepare`]s and [`Prepare`]s (in prepared
//! certificates), [`Checkpoint`]s (in checkpoint proofs), and [`ViewChange`]s (in new-views), are
//! additionally [signed](SignedMessage) by their sender, so that a replica relaying them cannot
//! forge them. [`Commit`]s and [`NewView`]s are only ever delivered by their sender and are not
//! signed.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    crypto_primitives::Keypair,
    data_types::{CryptoHash, ReplicaID, SequenceNumber, SignatureBytes, ViewNumber},
    request::Request,
    signed_messages::SignedMessage,
};

// Prefixes of the signed bytes, one per kind of signed message.
const PRE_PREPARE_TAG: u8 = 1;
const PREPARE_TAG: u8 = 2;
const CHECKPOINT_TAG: u8 = 4;
const VIEW_CHANGE_TAG: u8 = 5;

/// The seven kinds of message exchanged between replicas.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum PbftMessage {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(NewView),
}

impl PbftMessage {
    /// Get the name of this message's variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PbftMessage::Request(_) => "Request",
            PbftMessage::PrePrepare(_) => "PrePrepare",
            PbftMessage::Prepare(_) => "Prepare",
            PbftMessage::Commit(_) => "Commit",
            PbftMessage::Checkpoint(_) => "Checkpoint",
            PbftMessage::ViewChange(_) => "ViewChange",
            PbftMessage::NewView(_) => "NewView",
        }
    }
}

/// Assignment of the `sequence` number to a request by the primary of `view`, signed by the primary.
///
/// A `PrePrepare` either carries the request whose digest is `digest`, or carries no request and the
/// [null digest](CryptoHash::null). The latter is a "null request" that fills a gap in the sequence
/// numbers after a view change, and is never passed to the [`App`](crate::app::App).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrePrepare {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
    pub request: Option<Request>,
    pub signature: SignatureBytes,
}

impl PrePrepare {
    pub fn new(
        keypair: &Keypair,
        view: ViewNumber,
        sequence: SequenceNumber,
        request: Request,
    ) -> PrePrepare {
        Self::signed(keypair, view, sequence, request.digest(), Some(request))
    }

    /// Create a pre-prepare for the null request.
    pub fn null(keypair: &Keypair, view: ViewNumber, sequence: SequenceNumber) -> PrePrepare {
        Self::signed(keypair, view, sequence, CryptoHash::null(), None)
    }

    /// Sign a pre-prepare for `request` under the given `digest`, which the caller may have taken
    /// from elsewhere. Use [`is_well_formed`](Self::is_well_formed) to check that the two match.
    pub fn signed(
        keypair: &Keypair,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: CryptoHash,
        request: Option<Request>,
    ) -> PrePrepare {
        // Safety: serializing into a Vec<u8> cannot fail.
        let message_bytes = (PRE_PREPARE_TAG, view, sequence, digest).try_to_vec().unwrap();
        PrePrepare {
            view,
            sequence,
            digest,
            request,
            signature: keypair.sign(&message_bytes),
        }
    }

    pub fn is_null(&self) -> bool {
        self.request.is_none()
    }

    /// Check that `digest` binds the carried request, or that a pre-prepare without a request carries
    /// the null digest.
    pub fn is_well_formed(&self) -> bool {
        match &self.request {
            Some(request) => !self.digest.is_null() && request.digest() == self.digest,
            None => self.digest.is_null(),
        }
    }
}

impl SignedMessage for PrePrepare {
    fn message_bytes(&self) -> Vec<u8> {
        // Safety: serializing into a Vec<u8> cannot fail.
        (PRE_PREPARE_TAG, self.view, self.sequence, self.digest)
            .try_to_vec()
            .unwrap()
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

/// A backup's vote that it accepted the pre-prepare for `(view, sequence, digest)`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
    pub replica_id: ReplicaID,
    pub signature: SignatureBytes,
}

impl Prepare {
    pub fn new(
        keypair: &Keypair,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: CryptoHash,
        replica_id: ReplicaID,
    ) -> Prepare {
        // Safety: serializing into a Vec<u8> cannot fail.
        let message_bytes = (PREPARE_TAG, view, sequence, digest, replica_id)
            .try_to_vec()
            .unwrap();
        Prepare {
            view,
            sequence,
            digest,
            replica_id,
            signature: keypair.sign(&message_bytes),
        }
    }
}

impl SignedMessage for Prepare {
    fn message_bytes(&self) -> Vec<u8> {
        // Safety: serializing into a Vec<u8> cannot fail.
        (
            PREPARE_TAG,
            self.view,
            self.sequence,
            self.digest,
            self.replica_id,
        )
            .try_to_vec()
            .unwrap()
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

/// A replica's vote that `(view, sequence, digest)` is prepared at it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
    pub replica_id: ReplicaID,
}

/// A replica's claim that its application state after executing every request up to and including
/// `sequence` has the state digest `digest`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Checkpoint {
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
    pub replica_id: ReplicaID,
    pub signature: SignatureBytes,
}

impl Checkpoint {
    pub fn new(
        keypair: &Keypair,
        sequence: SequenceNumber,
        digest: CryptoHash,
        replica_id: ReplicaID,
    ) -> Checkpoint {
        // Safety: serializing into a Vec<u8> cannot fail.
        let message_bytes = (CHECKPOINT_TAG, sequence, digest, replica_id)
            .try_to_vec()
            .unwrap();
        Checkpoint {
            sequence,
            digest,
            replica_id,
            signature: keypair.sign(&message_bytes),
        }
    }
}

impl SignedMessage for Checkpoint {
    fn message_bytes(&self) -> Vec<u8> {
        // Safety: serializing into a Vec<u8> cannot fail.
        (CHECKPOINT_TAG, self.sequence, self.digest, self.replica_id)
            .try_to_vec()
            .unwrap()
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

/// A prepared certificate: the pre-prepare of a request and the matching prepare votes of at least
/// `2f` backups.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PreparedProof {
    pub pre_prepare: PrePrepare,
    pub prepares: Vec<Prepare>,
}

/// A replica's vote to move to `new_view`.
///
/// `checkpoint_proof` holds the `2f+1` checkpoint votes that made the checkpoint at
/// `last_stable_sequence` stable, and is empty if `last_stable_sequence` is 0. `prepared_set` holds a
/// prepared certificate for every sequence number above `last_stable_sequence` that is prepared at
/// the sender.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChange {
    pub new_view: ViewNumber,
    pub last_stable_sequence: SequenceNumber,
    pub checkpoint_proof: Vec<Checkpoint>,
    pub prepared_set: Vec<PreparedProof>,
    pub replica_id: ReplicaID,
    pub signature: SignatureBytes,
}

impl ViewChange {
    pub fn new(
        keypair: &Keypair,
        new_view: ViewNumber,
        last_stable_sequence: SequenceNumber,
        checkpoint_proof: Vec<Checkpoint>,
        prepared_set: Vec<PreparedProof>,
        replica_id: ReplicaID,
    ) -> ViewChange {
        let message_bytes = view_change_bytes(
            new_view,
            last_stable_sequence,
            &checkpoint_proof,
            &prepared_set,
            replica_id,
        );
        ViewChange {
            new_view,
            last_stable_sequence,
            checkpoint_proof,
            prepared_set,
            replica_id,
            signature: keypair.sign(&message_bytes),
        }
    }
}

impl SignedMessage for ViewChange {
    fn message_bytes(&self) -> Vec<u8> {
        view_change_bytes(
            self.new_view,
            self.last_stable_sequence,
            &self.checkpoint_proof,
            &self.prepared_set,
            self.replica_id,
        )
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

fn view_change_bytes(
    new_view: ViewNumber,
    last_stable_sequence: SequenceNumber,
    checkpoint_proof: &[Checkpoint],
    prepared_set: &[PreparedProof],
    replica_id: ReplicaID,
) -> Vec<u8> {
    let mut bytes = vec![VIEW_CHANGE_TAG];
    // Safety: writing into a Vec<u8> cannot fail.
    (new_view, last_stable_sequence, replica_id)
        .serialize(&mut bytes)
        .unwrap();
    checkpoint_proof.serialize(&mut bytes).unwrap();
    prepared_set.serialize(&mut bytes).unwrap();
    bytes
}

/// The primary of `view`'s announcement that the view has started.
///
/// `view_change_proof` holds the `2f+1` view-changes the primary collected for `view`, and
/// `pre_prepare_set` the pre-prepares, signed by the primary, for the slots that every replica
/// recomputes from them (see [`view_change::compute_new_view`](crate::pbft::view_change::compute_new_view)).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewView {
    pub view: ViewNumber,
    pub view_change_proof: Vec<ViewChange>,
    pub pre_prepare_set: Vec<PrePrepare>,
    pub replica_id: ReplicaID,
}

impl From<Request> for PbftMessage {
    fn from(value: Request) -> Self {
        PbftMessage::Request(value)
    }
}

impl From<PrePrepare> for PbftMessage {
    fn from(value: PrePrepare) -> Self {
        PbftMessage::PrePrepare(value)
    }
}

impl From<Prepare> for PbftMessage {
    fn from(value: Prepare) -> Self {
        PbftMessage::Prepare(value)
    }
}

impl From<Commit> for PbftMessage {
    fn from(value: Commit) -> Self {
        PbftMessage::Commit(value)
    }
}

impl From<Checkpoint> for PbftMessage {
    fn from(value: Checkpoint) -> Self {
        PbftMessage::Checkpoint(value)
    }
}

impl From<ViewChange> for PbftMessage {
    fn from(value: ViewChange) -> Self {
        PbftMessage::ViewChange(value)
    }
}

impl From<NewView> for PbftMessage {
    fn from(value: NewView) -> Self {
        PbftMessage::NewView(value)
    }
}
