//! Pluggable peer-to-peer (P2P) networking.
//!
//! Replicas exchange [`Envelope`](messages::Envelope)s through a user-provided implementation of the
//! [`Network`](network::Network) trait.

pub mod network;

pub mod messages;

pub(crate) mod receiving;

pub(crate) mod sending;
