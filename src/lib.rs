/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of Practical Byzantine Fault Tolerance (PBFT), a state machine replication
//! protocol that keeps a fixed set of `3f+1` replicas consistent as long as at most `f` of them are
//! Byzantine.
//!
//! ## Overview
//!
//! Clients submit [requests](types::request::Request) to the replicas. The primary of the current
//! view assigns each request a sequence number, and the replicas agree on that assignment in three
//! phases (pre-prepare, prepare, commit) before passing the request to their [`App`](app::App) in
//! sequence number order. Periodic [checkpoints](pbft::checkpoints) bound the memory the replicas
//! use, and [view changes](pbft::view_change) replace a primary that stops making progress.
//!
//! The protocol itself lives in [`pbft::implementation::Pbft`], a single-threaded state machine
//! that does no I/O besides calling the [`Network`](networking::network::Network) and the `App`.
//! [`replica`] wraps it into background threads, and [`events`] lets users observe it.
//!
//! ## Out of scope
//!
//! PBFT-rs relies on the network to authenticate the origin of every envelope, and signs only the
//! messages that replicas relay inside proofs (see [`pbft::messages`]). Replies to clients,
//! persistence, and the transfer of application state between replicas are left to the user.

pub(crate) mod algorithm;

pub mod app;

pub(crate) mod event_bus;

pub mod events;

pub mod logging;

pub mod networking;

pub mod pbft;

pub mod replica;

pub mod types;
