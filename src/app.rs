/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`App`] trait, the replicated state machine that PBFT-rs orders requests for.
//!
//! The protocol treats requests as opaque. Once a request commits, the replica hands it to its `App`,
//! and the `App` returns the digest of its state after executing it. These digests are what replicas
//! compare when they vote for [checkpoints](crate::pbft::checkpoints).
//!
//! ## Determinism requirements
//!
//! Every replica must reach the same state digest after executing the same requests in the same
//! order. An `App` must therefore be deterministic: `execute` must depend only on the request and on
//! the state produced by the previous calls, never on the clock, randomness, or the local filesystem.

use crate::types::{
    data_types::{CryptoHash, SequenceNumber},
    request::Request,
};

pub trait App: Send {
    /// Execute `request`, which committed at `sequence`, and return the digest of the resulting
    /// application state.
    ///
    /// Called exactly once per committed sequence number that carries a request not executed
    /// before, in ascending order of sequence numbers. Null requests and re-proposals of requests
    /// that were already executed are skipped, so `sequence` may jump.
    fn execute(&mut self, sequence: SequenceNumber, request: &Request) -> CryptoHash;

    /// Called when the replica finds that its state disagrees with, or has fallen behind, the
    /// checkpoint at `target` that a quorum of replicas certified with `digest`.
    ///
    /// The replica stops executing until the `App` has obtained that state from its peers and
    /// reported it through [`Pbft::state_transferred`](crate::pbft::implementation::Pbft::state_transferred).
    fn state_transfer_required(&mut self, target: SequenceNumber, digest: CryptoHash);
}
