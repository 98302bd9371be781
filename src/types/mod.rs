//! Types that are used across multiple components of PBFT-rs.
//!
//! Types specific to a single component of the protocol, e.g., the protocol messages or the
//! certificate tracker, can be found in the submodules of [`crate::pbft`].

pub mod crypto_primitives;

pub mod data_types;

pub mod request;

pub mod signed_messages;
