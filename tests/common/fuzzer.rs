//! Seeded generator of Byzantine traffic.

use pbft_rs::{
    networking::messages::Envelope,
    pbft::messages::{
        Checkpoint, Commit, NewView, PbftMessage, PrePrepare, Prepare, PreparedProof, ViewChange,
    },
    types::{
        crypto_primitives::Keypair,
        data_types::{ClientID, CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
        request::Request,
    },
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::test_net::Packet;

/// Produces random, but reproducible, protocol messages and mutations of packets.
///
/// Views, sequence numbers, and digests are drawn from small ranges, so that the garbage frequently
/// collides with the slots that correct replicas are working on. Every signed message is signed with
/// the Byzantine replica's own `keypair`, whichever replica it claims to come from.
pub(crate) struct Fuzzer {
    rng: StdRng,
    replica_count: u64,
    keypair: Keypair,
}

impl Fuzzer {
    pub(crate) fn new(seed: u64, replica_count: u64, keypair: Keypair) -> Fuzzer {
        Fuzzer {
            rng: StdRng::seed_from_u64(seed),
            replica_count,
            keypair,
        }
    }

    pub(crate) fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    fn view(&mut self) -> ViewNumber {
        ViewNumber::new(self.rng.gen_range(0, 3))
    }

    fn sequence(&mut self) -> SequenceNumber {
        SequenceNumber::new(self.rng.gen_range(0, 12))
    }

    fn replica(&mut self) -> ReplicaID {
        ReplicaID::new(self.rng.gen_range(0, self.replica_count + 1))
    }

    fn request(&mut self) -> Request {
        Request::new(
            ClientID::new(self.rng.gen_range(1000, 1002)),
            self.rng.gen_range(0, 4),
            vec![self.rng.gen_range(0, 4)],
        )
    }

    fn digest(&mut self) -> CryptoHash {
        match self.rng.gen_range(0, 4) {
            0 => CryptoHash::null(),
            1 => CryptoHash::new(self.rng.gen::<[u8; 32]>()),
            _ => self.request().digest(),
        }
    }

    fn pre_prepare(&mut self) -> PrePrepare {
        let (view, sequence) = (self.view(), self.sequence());
        match self.rng.gen_range(0, 4) {
            0 => PrePrepare::null(&self.keypair, view, sequence),
            1 => {
                let (digest, request) = (self.digest(), self.request());
                PrePrepare::signed(&self.keypair, view, sequence, digest, Some(request))
            }
            _ => {
                let request = self.request();
                PrePrepare::new(&self.keypair, view, sequence, request)
            }
        }
    }

    fn prepare(&mut self, from: ReplicaID) -> Prepare {
        let (view, sequence, digest) = (self.view(), self.sequence(), self.digest());
        Prepare::new(&self.keypair, view, sequence, digest, from)
    }

    fn view_change(&mut self, from: ReplicaID) -> ViewChange {
        let prepared_set = (0..self.rng.gen_range(0, 3))
            .map(|_| {
                let pre_prepare = self.pre_prepare();
                let prepares = (0..self.rng.gen_range(0, 4))
                    .map(|_| {
                        let replica_id = self.replica();
                        Prepare::new(
                            &self.keypair,
                            pre_prepare.view,
                            pre_prepare.sequence,
                            pre_prepare.digest,
                            replica_id,
                        )
                    })
                    .collect();
                PreparedProof {
                    pre_prepare,
                    prepares,
                }
            })
            .collect();
        let new_view = self.view();
        ViewChange::new(
            &self.keypair,
            new_view,
            SequenceNumber::init(),
            Vec::new(),
            prepared_set,
            from,
        )
    }

    /// Generate a message that replica `from` might send if it were Byzantine.
    pub(crate) fn random_message(&mut self, from: ReplicaID) -> PbftMessage {
        match self.rng.gen_range(0, 7) {
            0 => PbftMessage::Request(self.request()),
            1 => PbftMessage::PrePrepare(self.pre_prepare()),
            2 => PbftMessage::Prepare(self.prepare(from)),
            3 => {
                let prepare = self.prepare(from);
                PbftMessage::Commit(Commit {
                    view: prepare.view,
                    sequence: prepare.sequence,
                    digest: prepare.digest,
                    replica_id: prepare.replica_id,
                })
            }
            4 => {
                let sequence = SequenceNumber::new(self.rng.gen_range(0, 3) * 4);
                let digest = self.digest();
                PbftMessage::Checkpoint(Checkpoint::new(&self.keypair, sequence, digest, from))
            }
            5 => PbftMessage::ViewChange(self.view_change(from)),
            _ => {
                let view = self.view();
                let view_change_proof = (0..self.rng.gen_range(0, 4))
                    .map(|_| {
                        let replica = self.replica();
                        self.view_change(replica)
                    })
                    .collect();
                let pre_prepare_set = (0..self.rng.gen_range(0, 3))
                    .map(|_| self.pre_prepare())
                    .collect();
                PbftMessage::NewView(NewView {
                    view,
                    view_change_proof,
                    pre_prepare_set,
                    replica_id: from,
                })
            }
        }
    }

    /// Tamper with a packet sent by a Byzantine replica: replace it with garbage, alter the digest it
    /// votes for, or corrupt its payload bytes.
    pub(crate) fn mutate(&mut self, packet: &mut Packet) {
        match self.rng.gen_range(0, 3) {
            0 => packet.envelope = Envelope::consensus(&self.random_message(packet.from)),
            1 => {
                let digest = self.digest();
                let message = match packet.message() {
                    Some(PbftMessage::Prepare(prepare)) => PbftMessage::Prepare(Prepare::new(
                        &self.keypair,
                        prepare.view,
                        prepare.sequence,
                        digest,
                        prepare.replica_id,
                    )),
                    Some(PbftMessage::Commit(commit)) => {
                        PbftMessage::Commit(Commit { digest, ..commit })
                    }
                    Some(PbftMessage::Checkpoint(checkpoint)) => {
                        PbftMessage::Checkpoint(Checkpoint::new(
                            &self.keypair,
                            checkpoint.sequence,
                            digest,
                            checkpoint.replica_id,
                        ))
                    }
                    Some(message) => message,
                    None => return,
                };
                packet.envelope = Envelope::consensus(&message);
            }
            _ => {
                let payload = &mut packet.envelope.payload;
                if !payload.is_empty() {
                    let index = self.rng.gen_range(0, payload.len());
                    payload[index] = self.rng.gen();
                    let len = self.rng.gen_range(0, payload.len() + 1);
                    payload.truncate(len);
                }
            }
        }
    }
}
