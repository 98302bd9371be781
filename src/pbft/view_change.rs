/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Collection and validation of view-changes, and the deterministic construction of new-views.
//!
//! ## Recomputing the pre-prepares of a new view
//!
//! Given a quorum of valid [`ViewChange`]s for view `v`, [`compute_new_view`] determines:
//! 1. `min_s`: the highest `last_stable_sequence` among them, and
//! 2. `max_s`: the highest sequence number among their prepared certificates, or `min_s` if there
//!    are none above it.
//!
//! For every sequence number in `(min_s, max_s]`, the new view's pre-prepare carries the digest (and
//! the request) of the prepared certificate with the highest view among all view-changes, or the
//! null request if no view-change holds a certificate for that sequence number. Ties between
//! certificates of the same view are broken by the larger digest, so that every replica computes the
//! same set from the same proof.
//!
//! ## Signatures
//!
//! Every view-change in a proof, and every pre-prepare, prepare and checkpoint vote inside a
//! view-change, must carry a valid signature of the replica it names. The new primary relays these
//! messages, but cannot make them up.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{
    crypto_primitives::Keypair,
    data_types::{CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
    request::Request,
};

use super::{
    checkpoints::verify_checkpoint_proof,
    messages::{Checkpoint, NewView, PrePrepare, PreparedProof, ViewChange},
    roles::primary,
    types::PbftConfiguration,
};

/// Store of the view-changes a replica has received.
///
/// Only the view-change for the highest view is kept per sender, so the store never holds more
/// than one view-change per member of the replica set.
pub struct ViewChangeManager {
    quorum: usize,
    latest: BTreeMap<ReplicaID, ViewChange>,
}

impl ViewChangeManager {
    pub fn new(quorum: usize) -> ViewChangeManager {
        ViewChangeManager {
            quorum,
            latest: BTreeMap::new(),
        }
    }

    /// Store `view_change`. Returns `false` if its sender already has a view-change stored for the
    /// same or a higher view, in which case the stored one is kept.
    pub fn record(&mut self, view_change: ViewChange) -> bool {
        if self
            .latest
            .get(&view_change.replica_id)
            .is_some_and(|stored| stored.new_view >= view_change.new_view)
        {
            return false;
        }
        self.latest.insert(view_change.replica_id, view_change);
        true
    }

    /// Get the number of distinct replicas whose latest view-change targets `view`.
    pub fn count(&self, view: ViewNumber) -> usize {
        self.latest
            .values()
            .filter(|view_change| view_change.new_view == view)
            .count()
    }

    pub fn has_quorum(&self, view: ViewNumber) -> bool {
        self.count(view) >= self.quorum
    }

    /// Get every view-change stored for `view`, in ascending order of sender.
    pub fn proof(&self, view: ViewNumber) -> Vec<ViewChange> {
        self.latest
            .values()
            .filter(|view_change| view_change.new_view == view)
            .cloned()
            .collect()
    }

    /// Discard the view-changes for `view` and every lower view.
    pub fn discard_up_to(&mut self, view: ViewNumber) {
        self.latest
            .retain(|_, view_change| view_change.new_view > view);
    }

    /// Get the number of view-changes stored.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// The request a new view assigns to one sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
    /// `None` for the null request.
    pub request: Option<Request>,
}

impl Slot {
    /// Sign the pre-prepare that assigns this slot in `view`.
    pub fn pre_prepare(&self, keypair: &Keypair, view: ViewNumber) -> PrePrepare {
        PrePrepare::signed(
            keypair,
            view,
            self.sequence,
            self.digest,
            self.request.clone(),
        )
    }

    /// Check that `pre_prepare` assigns exactly this slot, whatever its view and signature.
    pub fn matches(&self, pre_prepare: &PrePrepare) -> bool {
        pre_prepare.sequence == self.sequence
            && pre_prepare.digest == self.digest
            && pre_prepare.request == self.request
    }
}

/// The outcome of [`compute_new_view`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewViewPlan {
    /// The highest stable checkpoint among the view-changes: `min_s`.
    pub checkpoint_sequence: SequenceNumber,
    pub checkpoint_digest: CryptoHash,
    pub checkpoint_proof: Vec<Checkpoint>,

    /// `max_s`.
    pub max_sequence: SequenceNumber,

    /// What the new view assigns to every sequence number in `(min_s, max_s]`.
    pub slots: Vec<Slot>,

    /// For every sequence number that a prepared certificate was selected for, the view and digest
    /// of that certificate.
    pub selected: BTreeMap<SequenceNumber, (ViewNumber, CryptoHash)>,
}

/// Compute the slots of a new view from a proof of view-changes, each of which must have passed
/// [`verify_view_change`]. Returns `None` if `proof` is empty.
pub fn compute_new_view(
    proof: &[ViewChange],
    config: &PbftConfiguration,
) -> Option<NewViewPlan> {
    let checkpoint_source = proof
        .iter()
        .max_by(|a, b| {
            a.last_stable_sequence
                .cmp(&b.last_stable_sequence)
                .then(b.replica_id.cmp(&a.replica_id))
        })?;
    let min_s = checkpoint_source.last_stable_sequence;
    let checkpoint_digest = verify_checkpoint_proof(
        min_s,
        &checkpoint_source.checkpoint_proof,
        config,
    )?;

    let mut selected: BTreeMap<SequenceNumber, &PrePrepare> = BTreeMap::new();
    for prepared in proof
        .iter()
        .flat_map(|view_change| view_change.prepared_set.iter())
        .map(|prepared| &prepared.pre_prepare)
        .filter(|pre_prepare| pre_prepare.sequence > min_s)
    {
        let replace = match selected.get(&prepared.sequence) {
            Some(current) => (prepared.view, prepared.digest) > (current.view, current.digest),
            None => true,
        };
        if replace {
            selected.insert(prepared.sequence, prepared);
        }
    }

    let max_s = selected.keys().next_back().copied().unwrap_or(min_s);
    let mut slots = Vec::new();
    let mut sequence = min_s;
    while sequence < max_s {
        sequence = sequence.next();
        let slot = match selected.get(&sequence) {
            Some(prepared) => Slot {
                sequence,
                digest: prepared.digest,
                request: prepared.request.clone(),
            },
            None => Slot {
                sequence,
                digest: CryptoHash::null(),
                request: None,
            },
        };
        slots.push(slot);
    }

    Some(NewViewPlan {
        checkpoint_sequence: min_s,
        checkpoint_digest,
        checkpoint_proof: checkpoint_source.checkpoint_proof.clone(),
        max_sequence: max_s,
        slots,
        selected: selected
            .into_iter()
            .map(|(sequence, prepared)| (sequence, (prepared.view, prepared.digest)))
            .collect(),
    })
}

/// Check the signature, the checkpoint proof and every prepared certificate of `view_change`.
pub fn verify_view_change(view_change: &ViewChange, config: &PbftConfiguration) -> bool {
    if !config.is_signed_by(view_change, view_change.replica_id) {
        return false;
    }
    if verify_checkpoint_proof(
        view_change.last_stable_sequence,
        &view_change.checkpoint_proof,
        config,
    )
    .is_none()
    {
        return false;
    }

    let mut sequences = BTreeSet::new();
    view_change.prepared_set.iter().all(|prepared| {
        sequences.insert(prepared.pre_prepare.sequence)
            && verify_prepared_proof(
                prepared,
                view_change.new_view,
                view_change.last_stable_sequence,
                config,
            )
    })
}

/// Check that `prepared` is a prepared certificate from a view below `new_view`, for a sequence number
/// inside the window above `last_stable`.
fn verify_prepared_proof(
    prepared: &PreparedProof,
    new_view: ViewNumber,
    last_stable: SequenceNumber,
    config: &PbftConfiguration,
) -> bool {
    let pre_prepare = &prepared.pre_prepare;
    if !pre_prepare.is_well_formed()
        || pre_prepare.view >= new_view
        || pre_prepare.sequence <= last_stable
        || pre_prepare.sequence > last_stable + config.watermark_window
    {
        return false;
    }

    let view_primary = primary(pre_prepare.view, config.replica_count());
    if !config.is_signed_by(pre_prepare, view_primary) {
        return false;
    }
    let mut voters = BTreeSet::new();
    for prepare in &prepared.prepares {
        if prepare.view != pre_prepare.view
            || prepare.sequence != pre_prepare.sequence
            || prepare.digest != pre_prepare.digest
            || prepare.replica_id == view_primary
            || !voters.insert(prepare.replica_id)
            || !config.is_signed_by(prepare, prepare.replica_id)
        {
            return false;
        }
    }

    voters.len() + 1 >= config.quorum()
}

/// Check `new_view` against the view-changes it carries, and return the recomputed plan if it holds
/// up.
///
/// The sender must be the primary of the view, the proof must hold valid view-changes for the view
/// from a quorum of distinct replicas, and the pre-prepares must assign exactly the recomputed slots
/// in the new view, each signed by the sender.
pub fn verify_new_view(new_view: &NewView, config: &PbftConfiguration) -> Option<NewViewPlan> {
    if new_view.replica_id != primary(new_view.view, config.replica_count()) {
        return None;
    }

    let mut senders = BTreeSet::new();
    for view_change in &new_view.view_change_proof {
        if view_change.new_view != new_view.view
            || !senders.insert(view_change.replica_id)
            || !verify_view_change(view_change, config)
        {
            return None;
        }
    }
    if senders.len() < config.quorum() {
        return None;
    }

    let plan = compute_new_view(&new_view.view_change_proof, config)?;
    if plan.slots.len() != new_view.pre_prepare_set.len() {
        return None;
    }
    let assigned = plan
        .slots
        .iter()
        .zip(&new_view.pre_prepare_set)
        .all(|(slot, pre_prepare)| {
            pre_prepare.view == new_view.view
                && slot.matches(pre_prepare)
                && config.is_signed_by(pre_prepare, new_view.replica_id)
        });
    assigned.then_some(plan)
}

/// Check whether `plan` drops or alters a request that is prepared at this replica.
///
/// A certificate of this replica is respected if the plan selects a certificate for the same
/// sequence number from a higher view, or from the same view with the same digest. Certificates at
/// or below the plan's checkpoint are covered by the checkpoint.
pub fn drops_prepared<'a>(
    plan: &NewViewPlan,
    own_prepared: impl IntoIterator<Item = &'a PreparedProof>,
) -> bool {
    own_prepared.into_iter().any(|prepared| {
        let own = &prepared.pre_prepare;
        if own.sequence <= plan.checkpoint_sequence {
            return false;
        }
        match plan.selected.get(&own.sequence) {
            Some((view, digest)) => *view < own.view || (*view == own.view && *digest != own.digest),
            None => true,
        }
    })
}
