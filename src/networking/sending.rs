//! Functions and types for sending messages to the P2P network.

use crate::{pbft::messages::PbftMessage, types::data_types::ReplicaID};

use super::{messages::Envelope, network::Network};

/// Handle for sending and broadcasting messages to the [`Network`].
///
/// It can be used to send or broadcast instances of any type that implement the
/// [`Into<PbftMessage>`] trait.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N) -> Self {
        Self { network }
    }

    pub(crate) fn send<S: Into<PbftMessage>>(&mut self, peer: ReplicaID, msg: S) {
        self.network
            .send(peer, Envelope::consensus(&msg.into()))
    }

    pub(crate) fn broadcast<S: Into<PbftMessage>>(&mut self, msg: S) {
        self.network.broadcast(Envelope::consensus(&msg.into()))
    }
}
