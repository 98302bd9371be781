/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events that a replica emits for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Events are published by
//! the [`Pbft`](crate::pbft::implementation::Pbft) state machine through its own event publisher and
//! delivered to the handlers registered on the replica's [event bus](crate::event_bus).

use std::{
    sync::mpsc::Sender,
    time::{Duration, SystemTime},
};

use crate::{
    pbft::{
        messages::{Checkpoint, Commit, NewView, PrePrepare, Prepare, ViewChange},
        types::RejectReason,
    },
    types::data_types::{ClientID, CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
};

pub enum Event {
    // Events that involve receiving a client request.
    ReceiveRequest(ReceiveRequestEvent),
    // Events that involve broadcasting a normal-case message.
    PrePrepare(PrePrepareEvent),
    Prepare(PrepareEvent),
    Commit(CommitEvent),
    Checkpoint(CheckpointEvent),
    // Events that involve receiving a normal-case message.
    ReceivePrePrepare(ReceivePrePrepareEvent),
    // Events that change the progress of a sequence number.
    Prepared(PreparedEvent),
    CommitLocal(CommitLocalEvent),
    Execute(ExecuteEvent),
    StableCheckpoint(StableCheckpointEvent),
    // View change events.
    ViewTimeout(ViewTimeoutEvent),
    ViewChange(ViewChangeEvent),
    ReceiveViewChange(ReceiveViewChangeEvent),
    NewView(NewViewEvent),
    StartView(StartViewEvent),
    // Events that report faults.
    RejectMessage(RejectMessageEvent),
    Equivocation(EquivocationEvent),
    StateTransferRequired(StateTransferRequiredEvent),
}

impl Event {
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            // The event bus may already be shut down while the algorithm thread finishes a message.
            let _ = event_publisher.send(self);
        }
    }
}

pub struct ReceiveRequestEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub client: ClientID,
    pub digest: CryptoHash,
}

pub struct PrePrepareEvent {
    pub timestamp: SystemTime,
    pub pre_prepare: PrePrepare,
}

pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub prepare: Prepare,
}

pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub commit: Commit,
}

pub struct CheckpointEvent {
    pub timestamp: SystemTime,
    pub checkpoint: Checkpoint,
}

pub struct ReceivePrePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub pre_prepare: PrePrepare,
}

pub struct PreparedEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
}

pub struct CommitLocalEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
}

/// Emitted for every sequence number the replica moves past, including null requests and
/// re-proposed duplicates. `request` is `None` for those, which are not passed to the app.
pub struct ExecuteEvent {
    pub timestamp: SystemTime,
    pub sequence: SequenceNumber,
    pub request: Option<CryptoHash>,
    pub state_digest: CryptoHash,
}

pub struct StableCheckpointEvent {
    pub timestamp: SystemTime,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
}

pub struct ViewTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub timeout: Duration,
}

pub struct ViewChangeEvent {
    pub timestamp: SystemTime,
    pub view_change: ViewChange,
}

pub struct ReceiveViewChangeEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub view_change: ViewChange,
}

pub struct NewViewEvent {
    pub timestamp: SystemTime,
    pub new_view: NewView,
}

pub struct StartViewEvent {
    pub timestamp: SystemTime,
    pub primary: ReplicaID,
    pub view: ViewNumber,
}

pub struct RejectMessageEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub kind: &'static str,
    pub reason: RejectReason,
}

pub struct EquivocationEvent {
    pub timestamp: SystemTime,
    pub offender: ReplicaID,
    pub sequence: SequenceNumber,
    pub first: CryptoHash,
    pub second: CryptoHash,
}

pub struct StateTransferRequiredEvent {
    pub timestamp: SystemTime,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
}
