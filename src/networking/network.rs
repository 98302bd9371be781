use crate::types::data_types::ReplicaID;

use super::messages::Envelope;

/// Peer-to-peer transport between the replicas of the replica set.
///
/// The network is responsible for authenticating the origin of every envelope: the [`ReplicaID`]
/// returned from `recv` must be the replica that sent the envelope. Replicas rely on this instead of
/// signing messages.
pub trait Network: Clone + Send {
    /// Send an envelope to every other replica without blocking.
    fn broadcast(&mut self, envelope: Envelope);

    /// Send an envelope to the specified replica without blocking.
    fn send(&mut self, peer: ReplicaID, envelope: Envelope);

    /// Receive an envelope from any peer. Returns immediately with a None if no envelope is available now.
    fn recv(&mut self) -> Option<(ReplicaID, Envelope)>;
}
