/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store numbers and bytes, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign, Sub},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Index of a replica in the static replica set.
///
/// Replica IDs range over `0..n`, where `n` is the number of
/// [replicas](crate::replica::Configuration::replicas), and a replica's ID is the position of its
/// verifying key in that list. The primary of a view is the replica whose ID equals `view mod n`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ReplicaID(u64);

impl ReplicaID {
    /// Create a new `ReplicaID` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` of this `ReplicaID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ReplicaID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// View number. Starts at 0 and increases every time a view change completes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// Create a new `ViewNumber` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the initial `ViewNumber`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `u64` of this `ViewNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ViewNumber {
    type Output = ViewNumber;

    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0.saturating_add(rhs))
    }
}

/// Position of a request in the total order agreed on by the replicas.
///
/// Sequence number 0 is never assigned to a request. It stands for the genesis checkpoint, i.e., the
/// state before any request has been executed.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Create a new `SequenceNumber` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the sequence number of the genesis checkpoint, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `u64` of this `SequenceNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the sequence number that directly follows this one.
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u64) -> Self::Output {
        SequenceNumber(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for SequenceNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs)
    }
}

impl Sub<SequenceNumber> for SequenceNumber {
    type Output = u64;

    fn sub(self, rhs: SequenceNumber) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

/// Identifier of the client that submitted a [`Request`](super::request::Request).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ClientID(u64);

impl ClientID {
    /// Create a new `ClientID` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` of this `ClientID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ClientID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 32-byte cryptographic hash.
///
/// # Choice of cryptographic hash function
///
/// Request digests are always SHA256 hashes over the Borsh serialization of the request (see
/// [`Request::digest`](super::request::Request::digest)). State digests are produced by the
/// [`App`](crate::app::App) and can come from any hash function with a 32-byte output.
///
/// # Null hash
///
/// The all-zero hash is reserved for the "null request", the no-op placeholder that a new primary
/// proposes for sequence numbers nobody prepared in previous views.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshDeserialize, BorshSerialize,
)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the all-zero `CryptoHash`.
    pub const fn null() -> Self {
        Self([0u8; 32])
    }

    /// Check whether this is the all-zero `CryptoHash`.
    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Bytes of an Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
