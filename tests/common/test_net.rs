//! [`TestNet`], a deterministic, single-threaded harness that connects several [`Pbft`] replicas.
//!
//! Replicas do not run in threads. Instead, every envelope a replica hands to its [`TestNetwork`] is
//! queued as a [`Packet`], and the test decides when (and whether) each packet is delivered.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        mpsc::{self, Receiver},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use pbft_rs::{
    events::Event,
    networking::{messages::Envelope, network::Network},
    pbft::{implementation::Pbft, messages::PbftMessage, types::PbftConfiguration},
    types::{
        data_types::{ClientID, ReplicaID, SequenceNumber},
        request::Request,
    },
};

use super::{
    keys::{keypair, verifying_keys},
    network::CLIENT_ORIGIN,
    recording_app::RecordingApp,
};

/// An envelope in flight between two replicas.
#[derive(Clone, Debug)]
pub(crate) struct Packet {
    pub(crate) from: ReplicaID,
    pub(crate) to: ReplicaID,
    pub(crate) envelope: Envelope,
}

impl Packet {
    /// Decode the packet's payload, for use in intercepts.
    pub(crate) fn message(&self) -> Option<PbftMessage> {
        self.envelope.decode().ok()
    }
}

/// The [`Network`] of a replica in a [`TestNet`]: sending queues packets in the shared queue.
#[derive(Clone)]
pub(crate) struct TestNetwork {
    me: ReplicaID,
    replica_count: u64,
    queue: Arc<Mutex<VecDeque<Packet>>>,
}

impl Network for TestNetwork {
    fn broadcast(&mut self, envelope: Envelope) {
        let mut queue = self.queue.lock().unwrap();
        for peer in (0..self.replica_count).map(ReplicaID::new) {
            if peer != self.me {
                queue.push_back(Packet {
                    from: self.me,
                    to: peer,
                    envelope: envelope.clone(),
                });
            }
        }
    }

    fn send(&mut self, peer: ReplicaID, envelope: Envelope) {
        self.queue.lock().unwrap().push_back(Packet {
            from: self.me,
            to: peer,
            envelope,
        });
    }

    fn recv(&mut self) -> Option<(ReplicaID, Envelope)> {
        None
    }
}

pub(crate) type Intercept = Box<dyn FnMut(&mut Packet) -> bool>;

pub(crate) type TestReplica = Pbft<TestNetwork, RecordingApp>;

pub(crate) struct TestNet {
    pub(crate) replicas: Vec<TestReplica>,
    event_subscribers: Vec<Receiver<Event>>,
    queue: Arc<Mutex<VecDeque<Packet>>>,
    /// Replicas whose incoming and outgoing packets are dropped.
    down: HashSet<ReplicaID>,
    intercept: Option<Intercept>,
    next_client: u64,
}

impl TestNet {
    /// Create a net of `replica_count` replicas with a long request timeout, so that timers only
    /// matter when a test ticks them explicitly.
    pub(crate) fn new(replica_count: u64, checkpoint_interval: u64, watermark_window: u64) -> TestNet {
        Self::with_apps(
            replica_count,
            checkpoint_interval,
            watermark_window,
            (0..replica_count).map(|_| RecordingApp::new()).collect(),
        )
    }

    pub(crate) fn with_apps(
        replica_count: u64,
        checkpoint_interval: u64,
        watermark_window: u64,
        apps: Vec<RecordingApp>,
    ) -> TestNet {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let mut event_subscribers = Vec::new();
        let replicas = apps
            .into_iter()
            .enumerate()
            .map(|(me, app)| {
                let (event_publisher, event_subscriber) = mpsc::channel();
                event_subscribers.push(event_subscriber);
                let me = ReplicaID::new(me as u64);
                let network = TestNetwork {
                    me,
                    replica_count,
                    queue: queue.clone(),
                };
                Pbft::new(
                    config(me, replica_count, checkpoint_interval, watermark_window),
                    keypair(me.int()),
                    app,
                    network,
                    Some(event_publisher),
                )
            })
            .collect();

        TestNet {
            replicas,
            event_subscribers,
            queue,
            down: HashSet::new(),
            intercept: None,
            next_client: 0,
        }
    }

    pub(crate) fn replica(&self, id: u64) -> &TestReplica {
        &self.replicas[id as usize]
    }

    /// Take the events replica `id` published since the last call.
    pub(crate) fn events(&self, id: u64) -> Vec<Event> {
        self.event_subscribers[id as usize].try_iter().collect()
    }

    pub(crate) fn replica_mut(&mut self, id: u64) -> &mut TestReplica {
        &mut self.replicas[id as usize]
    }

    /// Install a closure that sees every packet before delivery. It may modify the packet, and drops
    /// it by returning `false`.
    pub(crate) fn set_intercept(&mut self, intercept: impl FnMut(&mut Packet) -> bool + 'static) {
        self.intercept = Some(Box::new(intercept));
    }

    pub(crate) fn clear_intercept(&mut self) {
        self.intercept = None;
    }

    /// Cut replica `id` off the network.
    pub(crate) fn take_down(&mut self, id: u64) {
        self.down.insert(ReplicaID::new(id));
    }

    pub(crate) fn bring_up(&mut self, id: u64) {
        self.down.remove(&ReplicaID::new(id));
    }

    /// Create a new request from a client that has not sent one before, so that requests never
    /// supersede each other whatever order they are assigned in.
    pub(crate) fn request(&mut self, operation: &[u8]) -> Request {
        self.next_client += 1;
        Request::new(ClientID::new(self.next_client), 1, operation.to_vec())
    }

    /// Deliver `request` to replica `to` as a client would.
    pub(crate) fn submit(&mut self, to: u64, request: &Request) {
        let _ = self.replicas[to as usize].receive(CLIENT_ORIGIN, Envelope::client_request(request));
    }

    /// Queue a packet as if `packet.from` had sent it.
    pub(crate) fn inject(&mut self, packet: Packet) {
        self.queue.lock().unwrap().push_back(packet);
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Deliver the packet at `index` of the queue. Returns `false` if there is no such packet.
    pub(crate) fn deliver_at(&mut self, index: usize) -> bool {
        let Some(mut packet) = self.queue.lock().unwrap().remove(index) else {
            return false;
        };
        if self.down.contains(&packet.from) || self.down.contains(&packet.to) {
            return true;
        }
        if let Some(intercept) = &mut self.intercept {
            if !intercept(&mut packet) {
                return true;
            }
        }
        if let Some(replica) = self.replicas.get_mut(packet.to.int() as usize) {
            let _ = replica.receive(packet.from, packet.envelope);
        }
        true
    }

    /// Deliver the oldest packet. Returns `false` if no packet was queued.
    pub(crate) fn step(&mut self) -> bool {
        self.deliver_at(0)
    }

    /// Deliver packets until none are left.
    pub(crate) fn run(&mut self) {
        let mut steps = 0;
        while self.step() {
            steps += 1;
            assert!(steps < 1_000_000, "the net did not quiesce");
        }
    }

    /// Drop every queued packet.
    pub(crate) fn drain(&mut self) {
        self.queue.lock().unwrap().clear();
    }

    /// Tick every replica that is up at `after` from now.
    pub(crate) fn tick_all(&mut self, after: Duration) {
        let now = Instant::now() + after;
        for replica in self.replicas.iter_mut() {
            if !self.down.contains(&replica.config().me) {
                replica.tick_at(now);
            }
        }
    }

    /// Get the ids of the replicas that are up.
    pub(crate) fn up(&self) -> Vec<u64> {
        (0..self.replicas.len() as u64)
            .filter(|id| !self.down.contains(&ReplicaID::new(*id)))
            .collect()
    }

    /// Assert that no two replicas executed different requests at the same sequence number.
    pub(crate) fn assert_consistent(&self) {
        let executions: Vec<_> = self.replicas.iter().map(|r| r.app().executed()).collect();
        for a in &executions {
            for b in &executions {
                for (sequence, digest) in a {
                    if let Some((_, other)) = b.iter().find(|(s, _)| s == sequence) {
                        assert_eq!(digest, other, "divergent execution at {}", sequence);
                    }
                }
            }
        }
    }

    pub(crate) fn last_executed(&self, id: u64) -> SequenceNumber {
        self.replica(id).last_executed()
    }
}

pub(crate) fn config(
    me: ReplicaID,
    replica_count: u64,
    checkpoint_interval: u64,
    watermark_window: u64,
) -> PbftConfiguration {
    PbftConfiguration {
        me,
        replicas: verifying_keys(replica_count),
        checkpoint_interval,
        watermark_window,
        request_timeout: Duration::from_secs(1),
        view_change_timeout: Duration::from_secs(1),
    }
}
