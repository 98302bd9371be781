/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that determine what role a replica plays in a given view.

use crate::types::data_types::{ReplicaID, ViewNumber};

/// Get the primary of `view`, that is, replica `view mod replica_count`.
///
/// # Precondition
///
/// `replica_count` is non-zero.
pub fn primary(view: ViewNumber, replica_count: u64) -> ReplicaID {
    ReplicaID::new(view.int() % replica_count)
}

/// Determine whether `replica` is the primary of `view`.
pub fn is_primary(replica: ReplicaID, view: ViewNumber, replica_count: u64) -> bool {
    primary(view, replica_count) == replica
}
