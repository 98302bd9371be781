use std::sync::{
    mpsc::{self, Receiver, Sender, TryRecvError},
    Arc, Mutex,
};

use pbft_rs::{
    networking::{messages::Envelope, network::Network},
    types::{data_types::ReplicaID, request::Request},
};

/// The origin that [`ClientStub`] attaches to the requests it submits.
pub(crate) const CLIENT_ORIGIN: ReplicaID = ReplicaID::new(u64::MAX);

/// A mock network stub which passes messages from and to threads using channels.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: ReplicaID,
    all_peers: Vec<Sender<(ReplicaID, Envelope)>>,
    inbox: Arc<Mutex<Receiver<(ReplicaID, Envelope)>>>,
}

impl Network for NetworkStub {
    fn broadcast(&mut self, envelope: Envelope) {
        for (peer, sender) in self.all_peers.iter().enumerate() {
            if peer as u64 != self.me.int() {
                let _ = sender.send((self.me, envelope.clone()));
            }
        }
    }

    fn send(&mut self, peer: ReplicaID, envelope: Envelope) {
        if let Some(sender) = self.all_peers.get(peer.int() as usize) {
            let _ = sender.send((self.me, envelope));
        }
    }

    fn recv(&mut self) -> Option<(ReplicaID, Envelope)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(o_m) => Some(o_m),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

/// Handle through which tests play the role of a client.
#[derive(Clone)]
pub(crate) struct ClientStub {
    all_peers: Vec<Sender<(ReplicaID, Envelope)>>,
}

impl ClientStub {
    /// Submit `request` to replica `to`.
    pub(crate) fn submit(&self, to: ReplicaID, request: &Request) {
        let _ = self.all_peers[to.int() as usize]
            .send((CLIENT_ORIGIN, Envelope::client_request(request)));
    }
}

/// Create network stubs connecting `replica_count` replicas, and a client stub that can submit
/// requests to any of them.
pub(crate) fn mock_network(replica_count: u64) -> (Vec<NetworkStub>, ClientStub) {
    let (all_peers, inboxes): (Vec<_>, Vec<_>) = (0..replica_count).map(|_| mpsc::channel()).unzip();

    let stubs = inboxes
        .into_iter()
        .enumerate()
        .map(|(me, inbox)| NetworkStub {
            me: ReplicaID::new(me as u64),
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect();

    (stubs, ClientStub { all_peers })
}
