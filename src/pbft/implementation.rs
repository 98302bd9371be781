/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of a PBFT replica.
//!
//! Main type: [`Pbft`].

use std::{
    cmp::max,
    collections::{HashMap, HashSet, VecDeque},
    sync::mpsc::Sender,
    time::{Instant, SystemTime},
};

use crate::{
    app::App,
    events::{
        CheckpointEvent, CommitEvent, CommitLocalEvent, EquivocationEvent, Event, ExecuteEvent,
        NewViewEvent, PrePrepareEvent, PrepareEvent, PreparedEvent, ReceivePrePrepareEvent,
        ReceiveRequestEvent, ReceiveViewChangeEvent, RejectMessageEvent, StableCheckpointEvent,
        StartViewEvent, StateTransferRequiredEvent, ViewChangeEvent, ViewTimeoutEvent,
    },
    networking::{
        messages::{Envelope, EnvelopeKind},
        network::Network,
        sending::SenderHandle,
    },
    types::{
        crypto_primitives::Keypair,
        data_types::{ClientID, CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
        request::Request,
    },
};

use super::{
    certificates::{CertificateTracker, Phase, RecordOutcome},
    checkpoints::{CheckpointManager, CheckpointOutcome},
    message_log::{EntryPhase, LogEntry, MessageLog},
    messages::{
        Checkpoint, Commit, NewView, PbftMessage, PrePrepare, Prepare, PreparedProof, ViewChange,
    },
    roles::{is_primary, primary},
    types::{Diagnostics, PbftConfiguration, PbftError, RejectReason, Status},
    view_change::{
        compute_new_view, drops_prepared, verify_new_view, verify_view_change, NewViewPlan,
        ViewChangeManager,
    },
};

/// A single replica of the PBFT protocol.
///
/// # Usage
///
/// `Pbft` is a single-threaded state machine driven from the outside by three kinds of input:
/// 1. [`receive`](Self::receive): an envelope arrived from the network.
/// 2. [`tick`](Self::tick) or [`tick_at`](Self::tick_at): time has passed. Expired timers start or
///    escalate a view change.
/// 3. [`initiate_view_change`](Self::initiate_view_change) and
///    [`state_transferred`](Self::state_transferred): administrative input.
///
/// Every output goes either to the [`Network`], to the [`App`], or to the event publisher.
/// [`Replica`](crate::replica::Replica) wraps a `Pbft` in a thread, but nothing stops users from
/// driving one by hand, which is what the tests do.
pub struct Pbft<N: Network, A: App> {
    config: PbftConfiguration,
    keypair: Keypair,
    app: A,
    sender_handle: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,

    view: ViewNumber,
    status: Status,

    log: MessageLog,
    certificates: CertificateTracker,
    checkpoints: CheckpointManager,
    view_changes: ViewChangeManager,

    /// The new-view this replica installed its current view with, if it built it as the primary.
    last_new_view: Option<NewView>,

    /// The replicas that `last_new_view` was sent to again in the current view.
    new_view_resent: HashSet<ReplicaID>,

    /// The highest sequence number assigned by this replica as the primary.
    next_sequence: SequenceNumber,
    last_executed: SequenceNumber,
    state_digest: CryptoHash,

    requests: RequestBook,
    timer: Option<Instant>,

    /// The certified checkpoint this replica waits for its app to transfer.
    state_transfer: Option<(SequenceNumber, CryptoHash)>,

    diagnostics: Diagnostics,
}

/// The client-assigned identifier of a request: its client and timestamp.
type RequestID = (ClientID, u64);

/// What a replica knows about the requests it has received.
#[derive(Default)]
struct RequestBook {
    /// Requests received but not yet executed.
    outstanding: HashMap<RequestID, Request>,

    /// The timestamp of the last request executed for each client.
    last_executed: HashMap<ClientID, u64>,

    /// Sequence numbers assigned to outstanding requests in the current view.
    assigned: HashMap<RequestID, SequenceNumber>,

    /// Requests waiting for the primary to assign them a sequence number, in arrival order.
    queue: VecDeque<RequestID>,
}

impl RequestBook {
    /// Check whether a request of the same client with the same or a later timestamp was executed.
    fn is_executed(&self, request: &Request) -> bool {
        self.last_executed
            .get(&request.client)
            .is_some_and(|last| request.timestamp <= *last)
    }

    /// Record that `request` was executed, and forget the outstanding requests of its client that it
    /// supersedes.
    fn mark_executed(&mut self, request: &Request) {
        let client = request.client;
        let last = self.last_executed.entry(client).or_insert(request.timestamp);
        *last = max(*last, request.timestamp);
        let last = *last;
        self.outstanding
            .retain(|(other, timestamp), _| *other != client || *timestamp > last);
        self.assigned
            .retain(|(other, timestamp), _| *other != client || *timestamp > last);
    }
}

impl<N: Network, A: App> Pbft<N, A> {
    /// Create a replica in view 0, at the genesis checkpoint, with nothing executed.
    pub fn new(
        config: PbftConfiguration,
        keypair: Keypair,
        app: A,
        network: N,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let quorum = config.quorum();
        Self {
            checkpoints: CheckpointManager::new(&config),
            certificates: CertificateTracker::new(quorum),
            view_changes: ViewChangeManager::new(quorum),
            log: MessageLog::new(),
            config,
            keypair,
            app,
            sender_handle: SenderHandle::new(network),
            event_publisher,
            view: ViewNumber::init(),
            status: Status::Normal,
            last_new_view: None,
            new_view_resent: HashSet::new(),
            next_sequence: SequenceNumber::init(),
            last_executed: SequenceNumber::init(),
            state_digest: CryptoHash::null(),
            requests: RequestBook::default(),
            timer: None,
            state_transfer: None,
            diagnostics: Diagnostics::default(),
        }
    }

    /// Process an envelope delivered by the network from `origin`.
    ///
    /// Returns an error only if the payload cannot be decoded. Decoded messages that break a protocol
    /// rule are ignored, and show up in [`diagnostics`](Self::diagnostics) and as
    /// [`RejectMessageEvent`]s.
    pub fn receive(&mut self, origin: ReplicaID, envelope: Envelope) -> Result<(), PbftError> {
        let msg = match envelope.decode() {
            Ok(msg) => msg,
            Err(err) => {
                self.diagnostics.malformed_messages += 1;
                return Err(err.into());
            }
        };

        if envelope.kind == EnvelopeKind::Consensus && !self.config.is_member(origin) {
            self.reject(origin, msg.kind(), RejectReason::UnknownReplica);
            return Ok(());
        }

        match msg {
            PbftMessage::Request(request) => self.on_receive_request(
                origin,
                request,
                envelope.kind == EnvelopeKind::ClientRequest,
            ),
            PbftMessage::PrePrepare(pre_prepare) => self.on_receive_pre_prepare(origin, pre_prepare),
            PbftMessage::Prepare(prepare) => self.on_receive_prepare(origin, prepare),
            PbftMessage::Commit(commit) => self.on_receive_commit(origin, commit),
            PbftMessage::Checkpoint(checkpoint) => self.on_receive_checkpoint(origin, checkpoint),
            PbftMessage::ViewChange(view_change) => {
                self.on_receive_view_change(origin, view_change)
            }
            PbftMessage::NewView(new_view) => self.on_receive_new_view(origin, new_view),
        }

        Ok(())
    }

    /// Check the timer against the current time.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now())
    }

    /// Check the timer against `now`. If it expired, start a view change to the next view, or, if a view
    /// change is already in progress, escalate it to the view after its target.
    pub fn tick_at(&mut self, now: Instant) {
        let Some(deadline) = self.timer else {
            return;
        };
        if now < deadline {
            return;
        }

        let (view, timeout) = match self.status {
            Status::Normal => (self.view, self.config.request_timeout),
            Status::ViewChanging { target } => (target, self.view_change_backoff(target)),
        };
        Event::ViewTimeout(ViewTimeoutEvent {
            timestamp: SystemTime::now(),
            view,
            timeout,
        })
        .publish(&self.event_publisher);

        self.start_view_change(view + 1, now);
    }

    /// Start a view change to the view after the current one, or after the current target if a view
    /// change is already in progress.
    pub fn initiate_view_change(&mut self) {
        let target = match self.status {
            Status::Normal => self.view + 1,
            Status::ViewChanging { target } => target + 1,
        };
        self.start_view_change(target, Instant::now());
    }

    /// Report that the app has obtained the state at `sequence`, whose digest is `digest`, from its
    /// peers. Execution resumes from `sequence`.
    pub fn state_transferred(
        &mut self,
        sequence: SequenceNumber,
        digest: CryptoHash,
    ) -> Result<(), PbftError> {
        let Some((target, _)) = self.state_transfer else {
            return Err(PbftError::NoStateTransferRequired);
        };
        if sequence < target {
            return Err(PbftError::StateTransferBelowTarget { target, sequence });
        }

        self.state_transfer = None;
        if sequence > self.last_executed {
            // Requests ordered up to `sequence` are part of the transferred state.
            let covered: Vec<Request> = self
                .log
                .entries()
                .filter(|entry| entry.sequence > self.last_executed && entry.sequence <= sequence)
                .filter_map(|entry| entry.pre_prepare.as_ref())
                .filter_map(|pre_prepare| pre_prepare.request.clone())
                .collect();
            for request in &covered {
                self.requests.mark_executed(request);
            }
            self.last_executed = sequence;
            self.state_digest = digest;
        }
        self.collect_garbage();
        if self.status == Status::Normal {
            self.timer = None;
            self.arm_timer(Instant::now());
        }
        self.execute_committed();
        Ok(())
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_primary(&self) -> bool {
        is_primary(self.config.me, self.view, self.config.replica_count())
    }

    pub fn last_executed(&self) -> SequenceNumber {
        self.last_executed
    }

    /// Get the digest the app returned for the last executed request.
    pub fn state_digest(&self) -> CryptoHash {
        self.state_digest
    }

    pub fn low_watermark(&self) -> SequenceNumber {
        self.checkpoints.low_watermark()
    }

    pub fn high_watermark(&self) -> SequenceNumber {
        self.checkpoints.high_watermark()
    }

    pub fn stable_checkpoint(&self) -> (SequenceNumber, CryptoHash) {
        self.checkpoints.stable_checkpoint()
    }

    pub fn log_entry(&self, sequence: SequenceNumber) -> Option<&LogEntry> {
        self.log.get(sequence)
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Get the number of requests received but not yet executed.
    pub fn outstanding_requests(&self) -> usize {
        self.requests.outstanding.len()
    }

    /// Get the sequence number and digest of the checkpoint this replica waits for a state transfer of.
    pub fn awaiting_state_transfer(&self) -> Option<(SequenceNumber, CryptoHash)> {
        self.state_transfer
    }

    pub fn timer(&self) -> Option<Instant> {
        self.timer
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    pub fn config(&self) -> &PbftConfiguration {
        &self.config
    }

    /* ↓↓↓ Requests ↓↓↓ */

    fn on_receive_request(&mut self, origin: ReplicaID, request: Request, from_client: bool) {
        let id = request.id();
        if self.requests.is_executed(&request) || self.requests.outstanding.contains_key(&id) {
            return;
        }

        Event::ReceiveRequest(ReceiveRequestEvent {
            timestamp: SystemTime::now(),
            origin,
            client: request.client,
            digest: request.digest(),
        })
        .publish(&self.event_publisher);

        self.requests.outstanding.insert(id, request.clone());
        if from_client {
            self.sender_handle.broadcast(request);
        }

        if self.is_primary() && self.status == Status::Normal {
            self.requests.queue.push_back(id);
            self.propose_queued();
        }
        self.arm_timer(Instant::now());
    }

    /// As the primary, assign sequence numbers to queued requests while the window allows it.
    fn propose_queued(&mut self) {
        if self.status != Status::Normal || !self.is_primary() {
            return;
        }

        while let Some(id) = self.requests.queue.front().copied() {
            if self.requests.assigned.contains_key(&id) {
                self.requests.queue.pop_front();
                continue;
            }
            let Some(request) = self.requests.outstanding.get(&id).cloned() else {
                self.requests.queue.pop_front();
                continue;
            };

            let sequence = max(self.next_sequence, self.checkpoints.low_watermark()).next();
            if !self.checkpoints.in_window(sequence) {
                break;
            }
            self.requests.queue.pop_front();
            self.next_sequence = sequence;

            let pre_prepare = PrePrepare::new(&self.keypair, self.view, sequence, request);
            self.sender_handle.broadcast(pre_prepare.clone());
            Event::PrePrepare(PrePrepareEvent {
                timestamp: SystemTime::now(),
                pre_prepare: pre_prepare.clone(),
            })
            .publish(&self.event_publisher);

            self.accept_pre_prepare(pre_prepare);
        }
    }

    /* ↓↓↓ Normal-case operation ↓↓↓ */

    fn on_receive_pre_prepare(&mut self, origin: ReplicaID, pre_prepare: PrePrepare) {
        Event::ReceivePrePrepare(ReceivePrePrepareEvent {
            timestamp: SystemTime::now(),
            origin,
            pre_prepare: pre_prepare.clone(),
        })
        .publish(&self.event_publisher);

        let kind = "PrePrepare";
        if self.status != Status::Normal {
            return self.reject(origin, kind, RejectReason::ViewChangeInProgress);
        }
        if pre_prepare.view != self.view {
            return self.reject(origin, kind, RejectReason::WrongView);
        }
        if origin != primary(self.view, self.config.replica_count()) || self.is_primary() {
            return self.reject(origin, kind, RejectReason::WrongPrimary);
        }
        if !self.config.is_signed_by(&pre_prepare, origin) {
            return self.reject(origin, kind, RejectReason::InvalidSignature);
        }
        if pre_prepare.is_null() || !pre_prepare.is_well_formed() {
            return self.reject(origin, kind, RejectReason::MalformedPrePrepare);
        }
        if !self.accepts_sequence(pre_prepare.sequence) {
            return self.reject(origin, kind, RejectReason::OutsideWindow);
        }

        if let Some(accepted) = self.log.get(pre_prepare.sequence).and_then(LogEntry::digest) {
            if accepted != pre_prepare.digest {
                self.flag_equivocation(origin, pre_prepare.sequence, accepted, pre_prepare.digest);
                self.reject(origin, kind, RejectReason::ConflictingPrePrepare);
            }
            return;
        }

        self.accept_pre_prepare(pre_prepare);
        self.arm_timer(Instant::now());
    }

    /// Accept `pre_prepare` for the current view: record it in the log, count it as the primary's
    /// prepare vote, and, as a backup, broadcast this replica's own prepare.
    fn accept_pre_prepare(&mut self, pre_prepare: PrePrepare) {
        let view = pre_prepare.view;
        let sequence = pre_prepare.sequence;
        let digest = pre_prepare.digest;

        if let Some(request) = &pre_prepare.request {
            if !self.requests.is_executed(request) {
                let id = request.id();
                self.requests
                    .outstanding
                    .entry(id)
                    .or_insert_with(|| request.clone());
                self.requests.assigned.insert(id, sequence);
            }
        }

        let Some(entry) = self.log.get_or_insert(sequence) else {
            return;
        };
        entry.pre_prepare = Some(pre_prepare);
        entry.phase = EntryPhase::PrePrepared;

        let view_primary = primary(view, self.config.replica_count());
        self.certificates
            .record(Phase::Prepare, view, sequence, digest, view_primary);

        if self.config.me != view_primary {
            let prepare = Prepare::new(&self.keypair, view, sequence, digest, self.config.me);
            if self
                .certificates
                .record(Phase::Prepare, view, sequence, digest, self.config.me)
                == RecordOutcome::Accepted
            {
                self.store_prepare(prepare.clone());
            }
            self.sender_handle.broadcast(prepare.clone());
            Event::Prepare(PrepareEvent {
                timestamp: SystemTime::now(),
                prepare,
            })
            .publish(&self.event_publisher);
        }

        self.try_advance(sequence);
    }

    fn on_receive_prepare(&mut self, origin: ReplicaID, prepare: Prepare) {
        let kind = "Prepare";
        if prepare.replica_id != origin {
            return self.reject(origin, kind, RejectReason::OriginMismatch);
        }
        if !self.accepts_votes_for(prepare.view) {
            return self.reject(origin, kind, RejectReason::WrongView);
        }
        if is_primary(origin, prepare.view, self.config.replica_count()) {
            return self.reject(origin, kind, RejectReason::WrongPrimary);
        }
        if !self.accepts_sequence(prepare.sequence) {
            return self.reject(origin, kind, RejectReason::OutsideWindow);
        }
        if !self.config.is_signed_by(&prepare, origin) {
            return self.reject(origin, kind, RejectReason::InvalidSignature);
        }

        let sequence = prepare.sequence;
        if self.record_vote(
            Phase::Prepare,
            kind,
            prepare.view,
            sequence,
            prepare.digest,
            origin,
        ) {
            self.store_prepare(prepare);
            self.try_advance(sequence);
        }
    }

    /// Keep a counted prepare vote for the prepared certificate of its sequence number.
    fn store_prepare(&mut self, prepare: Prepare) {
        if let Some(entry) = self.log.get_or_insert(prepare.sequence) {
            entry.prepares.push(prepare);
        }
    }

    fn on_receive_commit(&mut self, origin: ReplicaID, commit: Commit) {
        let kind = "Commit";
        if commit.replica_id != origin {
            return self.reject(origin, kind, RejectReason::OriginMismatch);
        }
        if !self.accepts_votes_for(commit.view) {
            return self.reject(origin, kind, RejectReason::WrongView);
        }
        if !self.accepts_sequence(commit.sequence) {
            return self.reject(origin, kind, RejectReason::OutsideWindow);
        }

        if self.record_vote(
            Phase::Commit,
            kind,
            commit.view,
            commit.sequence,
            commit.digest,
            origin,
        ) {
            self.try_advance(commit.sequence);
        }
    }

    /// Count a vote. Returns whether it was counted for the first time.
    fn record_vote(
        &mut self,
        phase: Phase,
        kind: &'static str,
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: CryptoHash,
        voter: ReplicaID,
    ) -> bool {
        match self
            .certificates
            .record(phase, view, sequence, digest, voter)
        {
            RecordOutcome::Accepted => {
                self.log.get_or_insert(sequence);
                true
            }
            RecordOutcome::Duplicate => false,
            RecordOutcome::Conflicting { previous } => {
                self.flag_equivocation(voter, sequence, previous, digest);
                self.reject(voter, kind, RejectReason::ConflictingVote);
                false
            }
        }
    }

    /// Move the entry at `sequence` to prepared and then committed-locally as far as the votes
    /// collected so far allow.
    fn try_advance(&mut self, sequence: SequenceNumber) {
        if self.status != Status::Normal {
            return;
        }
        let Some(entry) = self.log.get(sequence) else {
            return;
        };
        let Some(pre_prepare) = entry.pre_prepare.clone() else {
            return;
        };
        let (view, digest) = (pre_prepare.view, pre_prepare.digest);
        if view != self.view {
            return;
        }

        if entry.phase == EntryPhase::PrePrepared
            && self
                .certificates
                .has_quorum(Phase::Prepare, view, sequence, &digest)
        {
            let view_primary = primary(view, self.config.replica_count());
            let voters = self
                .certificates
                .voters(Phase::Prepare, view, sequence, &digest);
            let prepares = entry
                .prepares
                .iter()
                .filter(|prepare| {
                    prepare.view == view
                        && prepare.digest == digest
                        && prepare.replica_id != view_primary
                        && voters.contains(&prepare.replica_id)
                })
                .cloned()
                .collect();
            if let Some(entry) = self.log.get_mut(sequence) {
                entry.phase = EntryPhase::Prepared;
                entry.prepared_proof = Some(PreparedProof {
                    pre_prepare,
                    prepares,
                });
            }
            Event::Prepared(PreparedEvent {
                timestamp: SystemTime::now(),
                view,
                sequence,
                digest,
            })
            .publish(&self.event_publisher);

            let commit = Commit {
                view,
                sequence,
                digest,
                replica_id: self.config.me,
            };
            self.certificates
                .record(Phase::Commit, view, sequence, digest, self.config.me);
            self.sender_handle.broadcast(commit.clone());
            Event::Commit(CommitEvent {
                timestamp: SystemTime::now(),
                commit,
            })
            .publish(&self.event_publisher);
        }

        let prepared = self
            .log
            .get(sequence)
            .is_some_and(|entry| entry.phase == EntryPhase::Prepared);
        if prepared
            && self
                .certificates
                .has_quorum(Phase::Commit, view, sequence, &digest)
        {
            if let Some(entry) = self.log.get_mut(sequence) {
                entry.phase = EntryPhase::Committed;
            }
            Event::CommitLocal(CommitLocalEvent {
                timestamp: SystemTime::now(),
                view,
                sequence,
                digest,
            })
            .publish(&self.event_publisher);

            self.execute_committed();
        }
    }

    /// Execute committed-locally entries in sequence number order, stopping at the first gap.
    fn execute_committed(&mut self) {
        if self.state_transfer.is_some() {
            return;
        }

        let mut progressed = false;
        while self.state_transfer.is_none() {
            let sequence = self.last_executed.next();
            let Some(pre_prepare) = self
                .log
                .get(sequence)
                .filter(|entry| entry.phase == EntryPhase::Committed)
                .and_then(|entry| entry.pre_prepare.clone())
            else {
                break;
            };

            let executed_request = match pre_prepare.request {
                Some(request) if !self.requests.is_executed(&request) => {
                    self.state_digest = self.app.execute(sequence, &request);
                    self.requests.mark_executed(&request);
                    Some(pre_prepare.digest)
                }
                _ => None,
            };
            self.last_executed = sequence;
            progressed = true;

            Event::Execute(ExecuteEvent {
                timestamp: SystemTime::now(),
                sequence,
                request: executed_request,
                state_digest: self.state_digest,
            })
            .publish(&self.event_publisher);

            if self.checkpoints.is_checkpoint_sequence(sequence) {
                self.take_checkpoint(sequence);
            }
        }

        if progressed {
            self.collect_garbage();
            if self.status == Status::Normal {
                self.timer = None;
                self.arm_timer(Instant::now());
            }
        }
    }

    /* ↓↓↓ Checkpoints ↓↓↓ */

    /// Vote for the checkpoint at `sequence`, which was just executed.
    fn take_checkpoint(&mut self, sequence: SequenceNumber) {
        let (low_watermark, stable_digest) = self.checkpoints.stable_checkpoint();
        if sequence <= low_watermark {
            if sequence == low_watermark && stable_digest != self.state_digest {
                self.require_state_transfer(low_watermark, stable_digest);
            }
            return;
        }

        let checkpoint =
            Checkpoint::new(&self.keypair, sequence, self.state_digest, self.config.me);
        self.sender_handle.broadcast(checkpoint.clone());
        Event::Checkpoint(CheckpointEvent {
            timestamp: SystemTime::now(),
            checkpoint: checkpoint.clone(),
        })
        .publish(&self.event_publisher);

        if let CheckpointOutcome::Stable {
            sequence,
            digest,
            local,
        } = self.checkpoints.record(&checkpoint)
        {
            self.on_stable_checkpoint(sequence, digest, local);
        }
    }

    fn on_receive_checkpoint(&mut self, origin: ReplicaID, checkpoint: Checkpoint) {
        let kind = "Checkpoint";
        if checkpoint.replica_id != origin {
            return self.reject(origin, kind, RejectReason::OriginMismatch);
        }
        if !self.config.is_signed_by(&checkpoint, origin) {
            return self.reject(origin, kind, RejectReason::InvalidSignature);
        }

        match self.checkpoints.record(&checkpoint) {
            CheckpointOutcome::Rejected => self.reject(origin, kind, RejectReason::OutsideWindow),
            CheckpointOutcome::Duplicate | CheckpointOutcome::Recorded => (),
            CheckpointOutcome::Conflicting { previous } => {
                self.flag_equivocation(origin, checkpoint.sequence, previous, checkpoint.digest);
                self.reject(origin, kind, RejectReason::ConflictingVote);
            }
            CheckpointOutcome::Stable {
                sequence,
                digest,
                local,
            } => self.on_stable_checkpoint(sequence, digest, local),
        }
    }

    fn on_stable_checkpoint(
        &mut self,
        sequence: SequenceNumber,
        digest: CryptoHash,
        local: Option<CryptoHash>,
    ) {
        Event::StableCheckpoint(StableCheckpointEvent {
            timestamp: SystemTime::now(),
            sequence,
            digest,
        })
        .publish(&self.event_publisher);

        match local {
            Some(local) if local != digest => self.require_state_transfer(sequence, digest),
            None if self.last_executed < sequence && self.has_gap_up_to(sequence) => {
                self.require_state_transfer(sequence, digest)
            }
            _ => (),
        }

        self.collect_garbage();
        self.propose_queued();
    }

    /// Check whether some sequence number in `(last_executed, sequence]` has no accepted pre-prepare,
    /// so that execution cannot reach `sequence` on its own.
    fn has_gap_up_to(&self, sequence: SequenceNumber) -> bool {
        let mut next = self.last_executed;
        while next < sequence {
            next = next.next();
            if self.log.get(next).and_then(LogEntry::digest).is_none() {
                return true;
            }
        }
        false
    }

    fn require_state_transfer(&mut self, sequence: SequenceNumber, digest: CryptoHash) {
        if self
            .state_transfer
            .is_some_and(|(target, _)| target >= sequence)
        {
            return;
        }

        self.state_transfer = Some((sequence, digest));
        self.app.state_transfer_required(sequence, digest);
        Event::StateTransferRequired(StateTransferRequiredEvent {
            timestamp: SystemTime::now(),
            sequence,
            digest,
        })
        .publish(&self.event_publisher);
    }

    /// Discard log entries and votes that are both below the stable checkpoint and executed.
    fn collect_garbage(&mut self) {
        let floor = self.checkpoints.low_watermark().min(self.last_executed);
        if floor > self.log.floor() {
            self.log.prune_below(floor);
            self.certificates.prune_below(floor);
        }
    }

    /* ↓↓↓ View changes ↓↓↓ */

    fn view_change_backoff(&self, target: ViewNumber) -> std::time::Duration {
        let attempts = (target.int().saturating_sub(self.view.int()))
            .saturating_sub(1)
            .min(16) as u32;
        self.config.view_change_timeout.saturating_mul(1 << attempts)
    }

    /// Stop processing the current view and vote for moving to `target`.
    fn start_view_change(&mut self, target: ViewNumber, now: Instant) {
        let current_target = match self.status {
            Status::Normal => self.view,
            Status::ViewChanging { target } => target,
        };
        if target <= current_target {
            return;
        }

        self.status = Status::ViewChanging { target };
        let low_watermark = self.checkpoints.low_watermark();
        let prepared_set = self
            .log
            .entries()
            .filter(|entry| entry.sequence > low_watermark)
            .filter_map(|entry| entry.prepared_proof.clone())
            .collect();
        let view_change = ViewChange::new(
            &self.keypair,
            target,
            low_watermark,
            self.checkpoints.stable_proof().to_vec(),
            prepared_set,
            self.config.me,
        );
        self.view_changes.record(view_change.clone());
        self.sender_handle.broadcast(view_change.clone());
        Event::ViewChange(ViewChangeEvent {
            timestamp: SystemTime::now(),
            view_change,
        })
        .publish(&self.event_publisher);

        self.timer = now.checked_add(self.view_change_backoff(target));
        self.try_build_new_view(target);
    }

    fn on_receive_view_change(&mut self, origin: ReplicaID, view_change: ViewChange) {
        Event::ReceiveViewChange(ReceiveViewChangeEvent {
            timestamp: SystemTime::now(),
            origin,
            view_change: view_change.clone(),
        })
        .publish(&self.event_publisher);

        let kind = "ViewChange";
        if view_change.replica_id != origin {
            return self.reject(origin, kind, RejectReason::OriginMismatch);
        }
        if view_change.new_view <= self.view {
            // A replica that missed the new-view of the current view asks for it again. Each replica
            // gets it resent once per view.
            if view_change.new_view == self.view && self.status == Status::Normal {
                if let Some(new_view) = &self.last_new_view {
                    if self.new_view_resent.insert(origin) {
                        self.sender_handle.send(origin, new_view.clone());
                        return;
                    }
                }
            }
            return self.reject(origin, kind, RejectReason::WrongView);
        }
        if !verify_view_change(&view_change, &self.config) {
            return self.reject(origin, kind, RejectReason::InvalidViewChange);
        }

        let view = view_change.new_view;
        if !self.view_changes.record(view_change) {
            return;
        }

        let current_target = match self.status {
            Status::Normal => self.view,
            Status::ViewChanging { target } => target,
        };
        if view > current_target && self.view_changes.has_quorum(view) {
            self.start_view_change(view, Instant::now());
        } else {
            self.try_build_new_view(view);
        }
    }

    /// As the primary of `view`, announce the view once a quorum of view-changes for it arrived.
    fn try_build_new_view(&mut self, view: ViewNumber) {
        if self.status != (Status::ViewChanging { target: view })
            || !is_primary(self.config.me, view, self.config.replica_count())
            || !self.view_changes.has_quorum(view)
        {
            return;
        }

        let view_change_proof = self.view_changes.proof(view);
        let Some(plan) = compute_new_view(&view_change_proof, &self.config) else {
            return;
        };
        let pre_prepare_set: Vec<PrePrepare> = plan
            .slots
            .iter()
            .map(|slot| slot.pre_prepare(&self.keypair, view))
            .collect();
        let new_view = NewView {
            view,
            view_change_proof,
            pre_prepare_set: pre_prepare_set.clone(),
            replica_id: self.config.me,
        };
        self.sender_handle.broadcast(new_view.clone());
        Event::NewView(NewViewEvent {
            timestamp: SystemTime::now(),
            new_view: new_view.clone(),
        })
        .publish(&self.event_publisher);

        self.last_new_view = Some(new_view);
        self.install_view(view, plan, pre_prepare_set);
    }

    fn on_receive_new_view(&mut self, origin: ReplicaID, new_view: NewView) {
        let kind = "NewView";
        if new_view.replica_id != origin {
            return self.reject(origin, kind, RejectReason::OriginMismatch);
        }
        let lowest_acceptable = match self.status {
            Status::Normal => self.view + 1,
            Status::ViewChanging { target } => target,
        };
        if new_view.view < lowest_acceptable {
            if new_view.view == self.view && self.status == Status::Normal {
                return;
            }
            return self.reject(origin, kind, RejectReason::WrongView);
        }

        let Some(plan) = verify_new_view(&new_view, &self.config) else {
            return self.reject(origin, kind, RejectReason::InvalidNewView);
        };
        if drops_prepared(
            &plan,
            self.log
                .entries()
                .filter_map(|entry| entry.prepared_proof.as_ref()),
        ) {
            return self.reject(origin, kind, RejectReason::NewViewDropsPrepared);
        }

        self.last_new_view = None;
        self.install_view(new_view.view, plan, new_view.pre_prepare_set);
    }

    /// Enter `view`: adopt the plan's checkpoint, and run the new view's `pre_prepares`, which must
    /// assign the plan's slots, through the normal case.
    fn install_view(
        &mut self,
        view: ViewNumber,
        plan: NewViewPlan,
        pre_prepares: Vec<PrePrepare>,
    ) {
        self.view = view;
        self.status = Status::Normal;
        self.timer = None;
        self.new_view_resent.clear();
        self.view_changes.discard_up_to(view);
        self.certificates.prune_views_below(view);
        for entry in self.log.entries_mut() {
            entry.pre_prepare = None;
            entry.phase = EntryPhase::Pending;
            entry.prepares.retain(|prepare| prepare.view >= view);
        }
        self.requests.assigned.clear();
        self.requests.queue.clear();

        if self.checkpoints.install(
            plan.checkpoint_sequence,
            plan.checkpoint_digest,
            plan.checkpoint_proof,
        ) {
            Event::StableCheckpoint(StableCheckpointEvent {
                timestamp: SystemTime::now(),
                sequence: plan.checkpoint_sequence,
                digest: plan.checkpoint_digest,
            })
            .publish(&self.event_publisher);
        }
        let (low_watermark, stable_digest) = self.checkpoints.stable_checkpoint();
        if self.last_executed < low_watermark {
            self.require_state_transfer(low_watermark, stable_digest);
        }
        self.collect_garbage();
        self.next_sequence = max(plan.max_sequence, low_watermark);

        let view_primary = primary(view, self.config.replica_count());
        Event::StartView(StartViewEvent {
            timestamp: SystemTime::now(),
            primary: view_primary,
            view,
        })
        .publish(&self.event_publisher);

        for pre_prepare in pre_prepares {
            if self.accepts_sequence(pre_prepare.sequence) {
                self.accept_pre_prepare(pre_prepare);
            }
        }

        if self.is_primary() {
            let mut waiting: Vec<RequestID> = self
                .requests
                .outstanding
                .keys()
                .filter(|id| !self.requests.assigned.contains_key(*id))
                .copied()
                .collect();
            waiting.sort_by_key(|(client, timestamp)| (*timestamp, *client));
            self.requests.queue = waiting.into();
            self.propose_queued();
        }
        self.arm_timer(Instant::now());
    }

    /* ↓↓↓ Helpers ↓↓↓ */

    /// Check whether this replica processes pre-prepares and votes for `sequence`. Besides the
    /// watermark window, this includes sequence numbers below the stable checkpoint that this replica
    /// has not executed yet.
    fn accepts_sequence(&self, sequence: SequenceNumber) -> bool {
        let floor = self.checkpoints.low_watermark().min(self.last_executed);
        sequence > floor && sequence <= self.checkpoints.high_watermark()
    }

    /// Check whether this replica counts prepare and commit votes cast in `view`.
    fn accepts_votes_for(&self, view: ViewNumber) -> bool {
        match self.status {
            Status::Normal => view == self.view,
            Status::ViewChanging { target } => view == target,
        }
    }

    /// As a backup in the normal case, start the request timer if requests are outstanding and the
    /// timer is not already running.
    fn arm_timer(&mut self, now: Instant) {
        if self.timer.is_none()
            && self.status == Status::Normal
            && !self.is_primary()
            && !self.requests.outstanding.is_empty()
        {
            self.timer = now.checked_add(self.config.request_timeout);
        }
    }

    fn reject(&mut self, origin: ReplicaID, kind: &'static str, reason: RejectReason) {
        self.diagnostics.rejected_messages += 1;
        Event::RejectMessage(RejectMessageEvent {
            timestamp: SystemTime::now(),
            origin,
            kind,
            reason,
        })
        .publish(&self.event_publisher);
    }

    fn flag_equivocation(
        &mut self,
        offender: ReplicaID,
        sequence: SequenceNumber,
        first: CryptoHash,
        second: CryptoHash,
    ) {
        self.diagnostics.equivocators.insert(offender);
        Event::Equivocation(EquivocationEvent {
            timestamp: SystemTime::now(),
            offender,
            sequence,
            first,
            second,
        })
        .publish(&self.event_publisher);
    }
}
