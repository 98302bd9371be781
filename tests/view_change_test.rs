//! Tests of view changes: replacing a faulty primary, carrying prepared requests into the new view,
//! and validating view-change and new-view messages.

use std::{cell::RefCell, rc::Rc, time::Duration};

use log::LevelFilter;
use pbft_rs::{
    events::Event,
    networking::messages::Envelope,
    pbft::{
        messages::{Checkpoint, NewView, PbftMessage, PrePrepare, Prepare, PreparedProof, ViewChange},
        types::{PbftConfiguration, RejectReason, Status},
        view_change::{
            compute_new_view, drops_prepared, verify_new_view, verify_view_change, Slot,
            ViewChangeManager,
        },
    },
    types::{
        data_types::{ClientID, CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
        request::Request,
    },
};

mod common;

use crate::common::{
    keys::keypair,
    logging::setup_logger,
    test_net::{config, Packet, TestNet},
};

fn rejections(net: &TestNet, id: u64) -> Vec<RejectReason> {
    net.events(id)
        .into_iter()
        .filter_map(|event| match event {
            Event::RejectMessage(reject) => Some(reject.reason),
            _ => None,
        })
        .collect()
}

#[test]
fn silent_primary_is_replaced_test() {
    setup_logger(LevelFilter::Trace);

    let mut net = TestNet::new(4, 4, 8);
    net.take_down(0);

    let request = net.request(b"stuck");
    net.submit(1, &request);
    net.run();
    for id in 1..4 {
        assert_eq!(net.last_executed(id), SequenceNumber::init());
        assert!(net.replica(id).timer().is_some());
    }

    net.tick_all(Duration::from_secs(2));
    net.run();

    for id in 1..4 {
        let replica = net.replica(id);
        assert_eq!(replica.view(), ViewNumber::new(1));
        assert_eq!(replica.status(), Status::Normal);
        assert_eq!(
            replica.app().executed(),
            vec![(SequenceNumber::new(1), request.digest())]
        );
    }

    let started = net.events(2).into_iter().any(|event| match event {
        Event::StartView(start_view) => {
            start_view.view == ViewNumber::new(1) && start_view.primary == ReplicaID::new(1)
        }
        _ => false,
    });
    assert!(started);
}

#[test]
fn prepared_request_survives_view_change_test() {
    let mut net = TestNet::new(4, 4, 8);

    // Every replica prepares the request, but no commit gets through.
    net.set_intercept(|packet| !matches!(packet.message(), Some(PbftMessage::Commit(_))));
    let request = net.request(b"prepared");
    net.submit(0, &request);
    net.run();
    for id in 0..4 {
        let entry = net.replica(id).log_entry(SequenceNumber::new(1)).unwrap();
        assert!(entry.prepared_proof.is_some());
        assert_eq!(net.last_executed(id), SequenceNumber::init());
    }

    net.clear_intercept();
    net.take_down(0);
    net.tick_all(Duration::from_secs(2));
    net.run();

    // The new primary re-proposed the request with an unchanged digest.
    let new_view = net
        .events(1)
        .into_iter()
        .find_map(|event| match event {
            Event::NewView(new_view) => Some(new_view.new_view),
            _ => None,
        })
        .unwrap();
    assert_eq!(new_view.view, ViewNumber::new(1));
    assert_eq!(new_view.pre_prepare_set.len(), 1);
    assert_eq!(new_view.pre_prepare_set[0].digest, request.digest());

    for id in 1..4 {
        assert_eq!(
            net.replica(id).app().executed(),
            vec![(SequenceNumber::new(1), request.digest())]
        );
    }
    net.assert_consistent();
}

#[test]
fn view_change_timer_backs_off_test() {
    let mut net = TestNet::new(4, 4, 8);
    for id in [0, 1, 3] {
        net.take_down(id);
    }
    let request = net.request(b"alone");
    net.submit(2, &request);
    net.events(2);

    for after in [10, 20, 40] {
        net.tick_all(Duration::from_secs(after));
    }

    let (mut timeouts, mut targets) = (Vec::new(), Vec::new());
    for event in net.events(2) {
        match event {
            Event::ViewTimeout(view_timeout) => timeouts.push(view_timeout.timeout),
            Event::ViewChange(view_change) => targets.push(view_change.view_change.new_view.int()),
            _ => (),
        }
    }
    assert_eq!(
        timeouts,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(2)
        ]
    );
    assert_eq!(targets, vec![1, 2, 3]);
    assert_eq!(
        net.replica(2).status(),
        Status::ViewChanging {
            target: ViewNumber::new(3)
        }
    );
    assert_eq!(net.replica(2).view(), ViewNumber::init());
}

#[test]
fn initiated_view_change_is_joined_test() {
    let mut net = TestNet::new(4, 4, 8);
    for id in 1..4 {
        net.replica_mut(id).initiate_view_change();
    }
    net.run();

    for id in 0..4 {
        assert_eq!(net.replica(id).view(), ViewNumber::new(1));
        assert_eq!(net.replica(id).status(), Status::Normal);
    }
    // Replica 0 never timed out, but joined once a quorum moved on.
    assert!(net
        .events(0)
        .iter()
        .any(|event| matches!(event, Event::ViewChange(_))));

    // Requests are ordered by the new primary.
    let request = net.request(b"after");
    net.submit(0, &request);
    net.run();
    for id in 0..4 {
        assert_eq!(net.last_executed(id), SequenceNumber::new(1));
    }
}

#[test]
fn new_view_is_resent_to_late_replica_test() {
    let mut net = TestNet::new(4, 4, 8);

    // The primary never pre-prepares, and replica 3 hears nothing.
    net.set_intercept(|packet| {
        packet.to != ReplicaID::new(3)
            && !(packet.from == ReplicaID::new(0)
                && matches!(packet.message(), Some(PbftMessage::PrePrepare(_))))
    });
    let request = net.request(b"late");
    net.submit(1, &request);
    net.submit(3, &request);
    net.run();
    net.tick_all(Duration::from_secs(2));
    net.run();

    for id in 0..3 {
        assert_eq!(net.replica(id).view(), ViewNumber::new(1));
    }
    assert_eq!(
        net.replica(3).status(),
        Status::ViewChanging {
            target: ViewNumber::new(1)
        }
    );

    // Replica 3's view-change reaches the new primary again, which answers with its new-view.
    net.clear_intercept();
    let repeated = Packet {
        from: ReplicaID::new(3),
        to: ReplicaID::new(1),
        envelope: Envelope::consensus(&PbftMessage::ViewChange(view_change(1, 3, Vec::new()))),
    };
    net.inject(repeated.clone());
    net.run();

    assert_eq!(net.replica(3).view(), ViewNumber::new(1));
    assert_eq!(net.replica(3).status(), Status::Normal);
    net.assert_consistent();

    // Further copies get no answer.
    net.events(1);
    for _ in 0..3 {
        net.inject(repeated.clone());
        assert!(net.step());
        assert_eq!(net.pending(), 0);
    }
    assert_eq!(rejections(&net, 1), vec![RejectReason::WrongView; 3]);
}

#[test]
fn forged_view_change_proof_is_rejected_test() {
    let mut net = TestNet::new(4, 4, 8);

    // Every replica prepares the request, and the commits are held back.
    let held = Rc::new(RefCell::new(Vec::new()));
    let held_by_intercept = held.clone();
    net.set_intercept(move |packet| {
        if matches!(packet.message(), Some(PbftMessage::Commit(_))) {
            held_by_intercept.borrow_mut().push(packet.clone());
            return false;
        }
        true
    });
    let request = net.request(b"honest");
    net.submit(0, &request);
    net.run();

    // Replica 1, the primary of view 5, claims that every other replica moved to view 5 with a
    // certificate for another request at sequence number 1. It can only sign with its own key.
    let forger = keypair(1);
    let other = net.request(b"forged");
    let (view, sequence) = (ViewNumber::new(4), SequenceNumber::new(1));
    let certificate = PreparedProof {
        pre_prepare: PrePrepare::new(&forger, view, sequence, other.clone()),
        prepares: [1, 2]
            .into_iter()
            .map(|replica| {
                Prepare::new(&forger, view, sequence, other.digest(), ReplicaID::new(replica))
            })
            .collect(),
    };
    let view_change_proof: Vec<ViewChange> = [0, 2, 3]
        .into_iter()
        .map(|replica| {
            ViewChange::new(
                &forger,
                ViewNumber::new(5),
                SequenceNumber::init(),
                Vec::new(),
                vec![certificate.clone()],
                ReplicaID::new(replica),
            )
        })
        .collect();
    let plan = compute_new_view(&view_change_proof, &four_replicas()).unwrap();
    assert_eq!(plan.slots[0].digest, other.digest());
    let new_view = NewView {
        view: ViewNumber::new(5),
        view_change_proof,
        pre_prepare_set: plan
            .slots
            .iter()
            .map(|slot| slot.pre_prepare(&forger, ViewNumber::new(5)))
            .collect(),
        replica_id: ReplicaID::new(1),
    };

    net.events(3);
    for to in [0, 2, 3] {
        net.inject(Packet {
            from: ReplicaID::new(1),
            to: ReplicaID::new(to),
            envelope: Envelope::consensus(&PbftMessage::NewView(new_view.clone())),
        });
    }
    net.run();

    assert_eq!(rejections(&net, 3), vec![RejectReason::InvalidNewView]);
    for id in [0, 2, 3] {
        let replica = net.replica(id);
        assert_eq!(replica.view(), ViewNumber::init());
        assert_eq!(replica.status(), Status::Normal);
        assert_eq!(
            replica.log_entry(sequence).unwrap().digest(),
            Some(request.digest())
        );
    }

    // The honest request still commits everywhere.
    net.clear_intercept();
    for packet in held.borrow_mut().drain(..) {
        net.inject(packet);
    }
    net.run();
    for id in 0..4 {
        assert_eq!(
            net.replica(id).app().executed(),
            vec![(sequence, request.digest())]
        );
    }
    net.assert_consistent();
}

/* ↓↓↓ Validation of view-change and new-view messages ↓↓↓ */

fn four_replicas() -> PbftConfiguration {
    config(ReplicaID::new(0), 4, 4, 8)
}

fn request(tag: u8) -> Request {
    Request::new(ClientID::new(1), tag as u64, vec![tag])
}

/// A prepared certificate for `request` at `(view, sequence)`, signed by the primary of `view` and
/// the two backups after it.
fn prepared(view: u64, sequence: u64, request: Request) -> PreparedProof {
    let pre_prepare = PrePrepare::new(
        &keypair(view % 4),
        ViewNumber::new(view),
        SequenceNumber::new(sequence),
        request,
    );
    let prepares = (1..3)
        .map(|offset| prepare(&pre_prepare, (view + offset) % 4))
        .collect();
    PreparedProof {
        pre_prepare,
        prepares,
    }
}

fn prepare(pre_prepare: &PrePrepare, replica: u64) -> Prepare {
    Prepare::new(
        &keypair(replica),
        pre_prepare.view,
        pre_prepare.sequence,
        pre_prepare.digest,
        ReplicaID::new(replica),
    )
}

fn view_change(new_view: u64, replica: u64, prepared_set: Vec<PreparedProof>) -> ViewChange {
    stable_view_change(new_view, replica, 0, Vec::new(), prepared_set)
}

fn stable_view_change(
    new_view: u64,
    replica: u64,
    last_stable: u64,
    checkpoint_proof: Vec<Checkpoint>,
    prepared_set: Vec<PreparedProof>,
) -> ViewChange {
    ViewChange::new(
        &keypair(replica),
        ViewNumber::new(new_view),
        SequenceNumber::new(last_stable),
        checkpoint_proof,
        prepared_set,
        ReplicaID::new(replica),
    )
}

fn slot(sequence: u64, request: Option<Request>) -> Slot {
    Slot {
        sequence: SequenceNumber::new(sequence),
        digest: request.as_ref().map_or(CryptoHash::null(), Request::digest),
        request,
    }
}

fn proof_for_view_2() -> Vec<ViewChange> {
    vec![
        view_change(2, 0, vec![prepared(0, 1, request(1)), prepared(0, 3, request(3))]),
        view_change(2, 1, vec![prepared(1, 1, request(2))]),
        view_change(2, 3, Vec::new()),
    ]
}

#[test]
fn compute_new_view_test() {
    let config = four_replicas();
    let proof = proof_for_view_2();
    assert!(proof.iter().all(|vc| verify_view_change(vc, &config)));

    let plan = compute_new_view(&proof, &config).unwrap();
    assert_eq!(plan.checkpoint_sequence, SequenceNumber::init());
    assert_eq!(plan.max_sequence, SequenceNumber::new(3));

    // The certificate of the higher view wins, and the gap is filled with a null request.
    assert_eq!(
        plan.slots,
        vec![
            slot(1, Some(request(2))),
            slot(2, None),
            slot(3, Some(request(3))),
        ]
    );

    // Without certificates, the new view starts right after the checkpoint.
    let empty: Vec<_> = (0..3).map(|replica| view_change(2, replica, Vec::new())).collect();
    let plan = compute_new_view(&empty, &config).unwrap();
    assert!(plan.slots.is_empty());
    assert_eq!(plan.max_sequence, SequenceNumber::init());
}

#[test]
fn verify_new_view_test() {
    let config = four_replicas();
    let view = ViewNumber::new(2);
    let proof = proof_for_view_2();
    let plan = compute_new_view(&proof, &config).unwrap();

    let valid = NewView {
        view,
        view_change_proof: proof.clone(),
        pre_prepare_set: plan
            .slots
            .iter()
            .map(|slot| slot.pre_prepare(&keypair(2), view))
            .collect(),
        replica_id: ReplicaID::new(2),
    };
    assert_eq!(verify_new_view(&valid, &config), Some(plan.clone()));

    // Pre-prepares that differ from the recomputed ones.
    let mut altered = valid.clone();
    altered.pre_prepare_set[0] =
        PrePrepare::new(&keypair(2), view, SequenceNumber::new(1), request(1));
    assert!(verify_new_view(&altered, &config).is_none());

    // A pre-prepare missing.
    let mut missing = valid.clone();
    missing.pre_prepare_set.pop();
    assert!(verify_new_view(&missing, &config).is_none());

    // A pre-prepare for another view.
    let mut stale = valid.clone();
    stale.pre_prepare_set[1] = plan.slots[1].pre_prepare(&keypair(2), ViewNumber::new(1));
    assert!(verify_new_view(&stale, &config).is_none());

    // A pre-prepare signed by a replica other than the new primary.
    let mut wrong_signer = valid.clone();
    wrong_signer.pre_prepare_set[2] = plan.slots[2].pre_prepare(&keypair(1), view);
    assert!(verify_new_view(&wrong_signer, &config).is_none());

    // Sent by a replica other than the primary of the view.
    let mut wrong_sender = valid.clone();
    wrong_sender.replica_id = ReplicaID::new(1);
    assert!(verify_new_view(&wrong_sender, &config).is_none());

    // Too few view-changes.
    let mut too_few = valid.clone();
    too_few.view_change_proof.pop();
    assert!(verify_new_view(&too_few, &config).is_none());

    // A view-change the new primary made up in the name of replica 3.
    let mut forged = valid.clone();
    forged.view_change_proof[2] = ViewChange::new(
        &keypair(2),
        view,
        SequenceNumber::init(),
        Vec::new(),
        Vec::new(),
        ReplicaID::new(3),
    );
    assert!(verify_new_view(&forged, &config).is_none());

    // The same replica counted twice.
    let mut repeated = valid;
    repeated.view_change_proof[2] = repeated.view_change_proof[1].clone();
    assert!(verify_new_view(&repeated, &config).is_none());
}

#[test]
fn verify_view_change_test() {
    let config = four_replicas();

    // The primary's prepare is implicit in its pre-prepare and must not be listed.
    let mut with_primary = prepared(0, 1, request(1));
    with_primary.prepares[0] = prepare(&with_primary.pre_prepare, 0);
    assert!(!verify_view_change(&view_change(1, 2, vec![with_primary]), &config));

    // Too few prepares.
    let mut too_few = prepared(0, 1, request(1));
    too_few.prepares.pop();
    assert!(!verify_view_change(&view_change(1, 2, vec![too_few]), &config));

    // A certificate from the view being changed to.
    assert!(!verify_view_change(&view_change(1, 2, vec![prepared(1, 1, request(1))]), &config));

    // Genesis needs an empty checkpoint proof.
    let genesis_vote = Checkpoint::new(
        &keypair(2),
        SequenceNumber::init(),
        CryptoHash::null(),
        ReplicaID::new(2),
    );
    assert!(!verify_view_change(
        &stable_view_change(1, 2, 0, vec![genesis_vote], Vec::new()),
        &config
    ));

    // A certificate at or below the checkpoint it claims.
    let checkpoint_digest = CryptoHash::new([5; 32]);
    let checkpoint_proof: Vec<Checkpoint> = (0..3)
        .map(|replica| {
            Checkpoint::new(
                &keypair(replica),
                SequenceNumber::new(4),
                checkpoint_digest,
                ReplicaID::new(replica),
            )
        })
        .collect();
    let stable = stable_view_change(
        1,
        2,
        4,
        checkpoint_proof.clone(),
        vec![prepared(0, 5, request(5))],
    );
    assert!(verify_view_change(&stable, &config));
    let below = stable_view_change(
        1,
        2,
        4,
        checkpoint_proof.clone(),
        vec![prepared(0, 4, request(4))],
    );
    assert!(!verify_view_change(&below, &config));
}

#[test]
fn view_change_signatures_are_checked_test() {
    let config = four_replicas();
    let valid = view_change(1, 2, vec![prepared(0, 1, request(1))]);
    assert!(verify_view_change(&valid, &config));

    // Signed by a replica other than its sender.
    let impostor = ViewChange::new(
        &keypair(1),
        valid.new_view,
        valid.last_stable_sequence,
        valid.checkpoint_proof.clone(),
        valid.prepared_set.clone(),
        ReplicaID::new(2),
    );
    assert!(!verify_view_change(&impostor, &config));

    // Altered after it was signed.
    let mut altered = valid.clone();
    altered.new_view = ViewNumber::new(7);
    assert!(!verify_view_change(&altered, &config));

    // A pre-prepare not signed by the primary of its view.
    let mut pre_prepare_forged = prepared(0, 1, request(1));
    pre_prepare_forged.pre_prepare = PrePrepare::new(
        &keypair(2),
        ViewNumber::init(),
        SequenceNumber::new(1),
        request(1),
    );
    assert!(!verify_view_change(&view_change(1, 2, vec![pre_prepare_forged]), &config));

    // A prepare signed in the name of another backup.
    let mut prepare_forged = prepared(0, 1, request(1));
    let mut forged_prepare = prepare(&prepare_forged.pre_prepare, 2);
    forged_prepare.replica_id = ReplicaID::new(3);
    prepare_forged.prepares[0] = forged_prepare;
    assert!(!verify_view_change(&view_change(1, 2, vec![prepare_forged]), &config));

    // A checkpoint vote signed in the name of another replica.
    let mut checkpoint_proof: Vec<Checkpoint> = (0..3)
        .map(|replica| {
            Checkpoint::new(
                &keypair(replica),
                SequenceNumber::new(4),
                CryptoHash::new([5; 32]),
                ReplicaID::new(replica),
            )
        })
        .collect();
    checkpoint_proof[0] = Checkpoint::new(
        &keypair(2),
        SequenceNumber::new(4),
        CryptoHash::new([5; 32]),
        ReplicaID::new(0),
    );
    assert!(!verify_view_change(
        &stable_view_change(1, 2, 4, checkpoint_proof, Vec::new()),
        &config
    ));
}

#[test]
fn view_change_store_keeps_latest_per_replica_test() {
    let mut view_changes = ViewChangeManager::new(3);

    // A replica floods view-changes for ever higher views: only the last one is kept.
    for view in 1..=1000 {
        assert!(view_changes.record(view_change(view, 1, Vec::new())));
    }
    assert_eq!(view_changes.len(), 1);
    assert_eq!(view_changes.count(ViewNumber::new(1000)), 1);
    assert_eq!(view_changes.count(ViewNumber::new(7)), 0);

    // Lower and repeated views are refused.
    assert!(!view_changes.record(view_change(7, 1, Vec::new())));
    assert!(!view_changes.record(view_change(1000, 1, Vec::new())));
    assert_eq!(view_changes.len(), 1);

    // A replica that moves on leaves the quorum of its previous view.
    assert!(view_changes.record(view_change(1000, 2, Vec::new())));
    assert!(view_changes.record(view_change(1000, 3, Vec::new())));
    assert!(view_changes.has_quorum(ViewNumber::new(1000)));
    assert!(view_changes.record(view_change(1001, 3, Vec::new())));
    assert!(!view_changes.has_quorum(ViewNumber::new(1000)));
    assert_eq!(
        view_changes
            .proof(ViewNumber::new(1000))
            .iter()
            .map(|view_change| view_change.replica_id.int())
            .collect::<Vec<_>>(),
        vec![1, 2]
    );

    view_changes.discard_up_to(ViewNumber::new(1000));
    assert_eq!(view_changes.len(), 1);
    view_changes.discard_up_to(ViewNumber::new(1001));
    assert!(view_changes.is_empty());
}

#[test]
fn drops_prepared_test() {
    let config = four_replicas();
    let plan = compute_new_view(&proof_for_view_2(), &config).unwrap();

    // Superseded by a certificate from a higher view.
    assert!(!drops_prepared(&plan, [&prepared(0, 1, request(1))]));
    assert!(!drops_prepared(&plan, [&prepared(1, 1, request(2))]));

    // Same view, different digest.
    assert!(drops_prepared(&plan, [&prepared(0, 3, request(9))]));

    // Not carried into the new view at all.
    assert!(drops_prepared(&plan, [&prepared(1, 2, request(2))]));
}
