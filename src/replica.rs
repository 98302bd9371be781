/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and initialize the storage of a replica.
//!
//! PBFT-rs works to safely replicate a state machine in multiple processes. In our terminology, these
//! processes are called 'replicas', and therefore the set of all replicas is called the 'replica set'.
//! The replica set is fixed: it consists of `n = 3f+1` replicas, identified by their Ed25519
//! verifying keys, and tolerates up to `f` of them being Byzantine. The ID of a replica is the
//! position of its verifying key in the list of replicas, which every replica must be configured
//! with in the same order.
//!
//! ## Starting a replica
//!
//! To start a replica, first build a [`Configuration`] and a [`ReplicaSpec`], then call
//! [`ReplicaSpec::start`]:
//!
//! ```ignore
//! let configuration = Configuration::builder()
//!     .me(ReplicaID::new(0))
//!     .keypair(signing_key)
//!     .replicas(verifying_keys)
//!     .checkpoint_interval(16)
//!     .watermark_window(64)
//!     .request_timeout(Duration::from_millis(500))
//!     .view_change_timeout(Duration::from_millis(500))
//!     .tick_interval(Duration::from_millis(10))
//!     .log_events(true)
//!     .build();
//!
//! let replica = ReplicaSpec::builder()
//!     .app(app)
//!     .network(network)
//!     .configuration(configuration)
//!     .on_execute(|event| println!("executed {}", event.sequence))
//!     .build()
//!     .start()?;
//! ```
//!
//! The returned [`Replica`] owns the background threads of the replica. Dropping it shuts them down.

use std::{
    fmt::{self, Display, Formatter},
    sync::mpsc::{self, Sender},
    thread::JoinHandle,
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::{
    algorithm::{AdminCommand, Algorithm},
    app::App,
    event_bus::*,
    events::*,
    networking::{network::Network, receiving::start_polling},
    pbft::{implementation::Pbft, types::PbftConfiguration},
    types::{
        crypto_primitives::{Keypair, SigningKey, VerifyingKey},
        data_types::{CryptoHash, ReplicaID, SequenceNumber},
    },
};

/// Stores the user-defined parameters required to start the replica, that is:
/// 1. The replica's own [ID](ReplicaID), and its [keypair](SigningKey).
/// 2. The verifying keys of the replicas in the replica set, in the order of their IDs.
/// 3. The checkpoint interval, i.e., how many sequence numbers lie between two checkpoints.
/// 4. The size of the watermark window, i.e., how far past the last stable checkpoint the primary may
///    assign sequence numbers.
/// 5. The request timeout, after which a backup with unexecuted requests suspects the primary.
/// 6. The base view-change timeout, which doubles with every view a view change skips.
/// 7. The tick interval, i.e., how often the algorithm thread checks its timers when idle.
/// 8. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Log Events
///
/// PBFT-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.keypair(...)`
    - `.replicas(...)`
    - `.checkpoint_interval(...)`
    - `.watermark_window(...)`
    - `.request_timeout(...)`
    - `.view_change_timeout(...)`
    - `.tick_interval(...)`
    - `.log_events(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the ID of this replica. Required."))]
    pub me: ReplicaID,
    #[builder(setter(doc = "Set the replica's keypair, used to sign messages. Required."))]
    pub keypair: SigningKey,
    #[builder(setter(doc = "Set the verifying keys of the replica set, indexed by replica ID. Must have 3f+1 entries. Required."))]
    pub replicas: Vec<VerifyingKey>,
    #[builder(setter(doc = "Set the number of sequence numbers between two checkpoints. Required."))]
    pub checkpoint_interval: u64,
    #[builder(setter(doc = "Set the size of the watermark window. Must be at least the checkpoint interval. Required."))]
    pub watermark_window: u64,
    #[builder(setter(doc = "Set the duration a backup waits for an outstanding request to execute before it suspects the primary. Required."))]
    pub request_timeout: Duration,
    #[builder(setter(doc = "Set the duration a replica waits for a new view before it moves on to the next one. Required."))]
    pub view_change_timeout: Duration,
    #[builder(setter(doc = "Set how often the algorithm thread checks its timers while no messages arrive. Required."))]
    pub tick_interval: Duration,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl Configuration {
    /// Check the configuration and extract the parameters of the [`Pbft`] state machine from it.
    pub fn validate(&self) -> Result<PbftConfiguration, ConfigurationError> {
        let replica_count = self.replicas.len() as u64;
        if replica_count % 3 != 1 {
            return Err(ConfigurationError::InvalidReplicaCount(replica_count));
        }
        if self.me.int() >= replica_count {
            return Err(ConfigurationError::UnknownReplica {
                me: self.me,
                replica_count,
            });
        }
        if self.replicas[self.me.int() as usize] != self.keypair.verifying_key() {
            return Err(ConfigurationError::KeypairMismatch(self.me));
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigurationError::ZeroCheckpointInterval);
        }
        if self.watermark_window < self.checkpoint_interval {
            return Err(ConfigurationError::WindowSmallerThanInterval {
                watermark_window: self.watermark_window,
                checkpoint_interval: self.checkpoint_interval,
            });
        }
        if self.request_timeout.is_zero() || self.view_change_timeout.is_zero() {
            return Err(ConfigurationError::ZeroTimeout);
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigurationError::ZeroTickInterval);
        }

        Ok(PbftConfiguration {
            me: self.me,
            replicas: self.replicas.clone(),
            checkpoint_interval: self.checkpoint_interval,
            watermark_window: self.watermark_window,
            request_timeout: self.request_timeout,
            view_change_timeout: self.view_change_timeout,
        })
    }
}

/// Ways in which a [`Configuration`] can be unusable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The replica count is not of the form `3f+1`.
    InvalidReplicaCount(u64),
    UnknownReplica {
        me: ReplicaID,
        replica_count: u64,
    },
    /// The keypair does not belong to the verifying key listed for this replica.
    KeypairMismatch(ReplicaID),
    ZeroCheckpointInterval,
    WindowSmallerThanInterval {
        watermark_window: u64,
        checkpoint_interval: u64,
    },
    ZeroTimeout,
    ZeroTickInterval,
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::InvalidReplicaCount(replica_count) => write!(
                f,
                "replica count {} is not of the form 3f+1",
                replica_count
            ),
            ConfigurationError::UnknownReplica { me, replica_count } => write!(
                f,
                "replica {} is not a member of a replica set of {}",
                me, replica_count
            ),
            ConfigurationError::KeypairMismatch(me) => write!(
                f,
                "keypair does not match the verifying key of replica {}",
                me
            ),
            ConfigurationError::ZeroCheckpointInterval => {
                write!(f, "checkpoint interval must be non-zero")
            }
            ConfigurationError::WindowSmallerThanInterval {
                watermark_window,
                checkpoint_interval,
            } => write!(
                f,
                "watermark window {} is smaller than checkpoint interval {}",
                watermark_window, checkpoint_interval
            ),
            ConfigurationError::ZeroTimeout => write!(f, "timeouts must be non-zero"),
            ConfigurationError::ZeroTickInterval => write!(f, "tick interval must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Stores all necessary parameters and trait implementations required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.app(...)`
    - `.network(...)`
    - `.configuration(...)`

    Optional:
    - `.on_receive_request(...)`
    - `.on_pre_prepare(...)`
    - `.on_prepare(...)`
    - `.on_commit(...)`
    - `.on_checkpoint(...)`
    - `.on_receive_pre_prepare(...)`
    - `.on_prepared(...)`
    - `.on_commit_local(...)`
    - `.on_execute(...)`
    - `.on_stable_checkpoint(...)`
    - `.on_view_timeout(...)`
    - `.on_view_change(...)`
    - `.on_receive_view_change(...)`
    - `.on_new_view(...)`
    - `.on_start_view(...)`
    - `.on_reject_message(...)`
    - `.on_equivocation(...)`
    - `.on_state_transfer_required(...)`
"))]
pub struct ReplicaSpec<A: App + 'static, N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the state machine to be replicated. The argument must implement the [App](crate::app::App) trait. Required."))]
    app: A,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveRequestEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a request it did not know. Optional."))]
    on_receive_request: Option<HandlerPtr<ReceiveRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PrePrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PrePrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica, as the primary, broadcasts a pre-prepare. Optional."))]
    on_pre_prepare: Option<HandlerPtr<PrePrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a prepare. Optional."))]
    on_prepare: Option<HandlerPtr<PrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a commit. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CheckpointEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a checkpoint vote. Optional."))]
    on_checkpoint: Option<HandlerPtr<CheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceivePrePrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceivePrePrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a pre-prepare. Optional."))]
    on_receive_pre_prepare: Option<HandlerPtr<ReceivePrePrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PreparedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PreparedEvent>),
    doc = "Register a handler closure to be invoked after a sequence number becomes prepared at the replica. Optional."))]
    on_prepared: Option<HandlerPtr<PreparedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitLocalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitLocalEvent>),
    doc = "Register a handler closure to be invoked after a sequence number becomes committed-locally at the replica. Optional."))]
    on_commit_local: Option<HandlerPtr<CommitLocalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ExecuteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ExecuteEvent>),
    doc = "Register a handler closure to be invoked after the replica moves past a sequence number in execution. Optional."))]
    on_execute: Option<HandlerPtr<ExecuteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StableCheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StableCheckpointEvent>),
    doc = "Register a handler closure to be invoked after a checkpoint becomes stable. Optional."))]
    on_stable_checkpoint: Option<HandlerPtr<StableCheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ViewTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ViewTimeoutEvent>),
    doc = "Register a handler closure to be invoked after the replica's request or view-change timer expires. Optional."))]
    on_view_timeout: Option<HandlerPtr<ViewTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a view-change. Optional."))]
    on_view_change: Option<HandlerPtr<ViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a view-change. Optional."))]
    on_receive_view_change: Option<HandlerPtr<ReceiveViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewViewEvent>),
    doc = "Register a handler closure to be invoked after the replica, as the new primary, broadcasts a new-view. Optional."))]
    on_new_view: Option<HandlerPtr<NewViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartViewEvent>),
    doc = "Register a handler closure to be invoked after the replica enters a new view. Optional."))]
    on_start_view: Option<HandlerPtr<StartViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RejectMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RejectMessageEvent>),
    doc = "Register a handler closure to be invoked after the replica ignores a message that breaks a protocol rule. Optional."))]
    on_reject_message: Option<HandlerPtr<RejectMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EquivocationEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EquivocationEvent>),
    doc = "Register a handler closure to be invoked after the replica catches a peer sending two different digests for the same slot. Optional."))]
    on_equivocation: Option<HandlerPtr<EquivocationEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StateTransferRequiredEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StateTransferRequiredEvent>),
    doc = "Register a handler closure to be invoked after the replica finds that it needs a state transfer. Optional."))]
    on_state_transfer_required: Option<HandlerPtr<StateTransferRequiredEvent>>,
}

impl<A: App + 'static, N: Network + 'static> ReplicaSpec<A, N> {
    /// Starts all threads and channels associated with running a replica, and returns the handles to
    /// them in a [Replica] struct.
    pub fn start(self) -> Result<Replica, ConfigurationError> {
        let pbft_config = self.configuration.validate()?;
        let log_events = self.configuration.log_events;

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, envelopes) = start_polling(self.network.clone(), poller_shutdown_receiver);

        let event_handlers = EventHandlers {
            receive_request_handlers: handlers(log_events, self.on_receive_request),
            pre_prepare_handlers: handlers(log_events, self.on_pre_prepare),
            prepare_handlers: handlers(log_events, self.on_prepare),
            commit_handlers: handlers(log_events, self.on_commit),
            checkpoint_handlers: handlers(log_events, self.on_checkpoint),
            receive_pre_prepare_handlers: handlers(log_events, self.on_receive_pre_prepare),
            prepared_handlers: handlers(log_events, self.on_prepared),
            commit_local_handlers: handlers(log_events, self.on_commit_local),
            execute_handlers: handlers(log_events, self.on_execute),
            stable_checkpoint_handlers: handlers(log_events, self.on_stable_checkpoint),
            view_timeout_handlers: handlers(log_events, self.on_view_timeout),
            view_change_handlers: handlers(log_events, self.on_view_change),
            receive_view_change_handlers: handlers(log_events, self.on_receive_view_change),
            new_view_handlers: handlers(log_events, self.on_new_view),
            start_view_handlers: handlers(log_events, self.on_start_view),
            reject_message_handlers: handlers(log_events, self.on_reject_message),
            equivocation_handlers: handlers(log_events, self.on_equivocation),
            state_transfer_required_handlers: handlers(
                log_events,
                self.on_state_transfer_required,
            ),
        };

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (admin, admin_commands) = mpsc::channel();
        let (algorithm_shutdown, algorithm_shutdown_receiver) = mpsc::channel();
        let pbft = Pbft::new(
            pbft_config,
            Keypair::new(self.configuration.keypair.clone()),
            self.app,
            self.network,
            event_publisher,
        );
        let algorithm = Algorithm::new(
            pbft,
            envelopes,
            admin_commands,
            self.configuration.tick_interval,
            algorithm_shutdown_receiver,
        )
        .start();

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
                let event_bus =
                    start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
                (Some(event_bus), Some(event_bus_shutdown))
            }
            None => (None, None),
        };

        Ok(Replica {
            admin,
            poller: Some(poller),
            poller_shutdown,
            algorithm: Some(algorithm),
            algorithm_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A handle to the background threads of a PBFT-rs replica. When this value is dropped, all
/// background threads are gracefully shut down.
pub struct Replica {
    admin: Sender<AdminCommand>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    algorithm: Option<JoinHandle<()>>,
    algorithm_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Replica {
    /// Make the replica start a view change to the next view, as if its timer had expired.
    pub fn initiate_view_change(&self) {
        // The algorithm thread lives as long as this handle.
        let _ = self.admin.send(AdminCommand::InitiateViewChange);
    }

    /// Report that the app has obtained the state at `sequence`, whose digest is `digest`, after a
    /// [`StateTransferRequiredEvent`].
    pub fn state_transferred(&self, sequence: SequenceNumber, digest: CryptoHash) {
        let _ = self
            .admin
            .send(AdminCommand::StateTransferred { sequence, digest });
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important, as the threads make
        // assumptions about the validity of their channels based on this. The algorithm thread receives
        // envelopes from the poller, and assumes that the poller will live longer than it.

        self.event_bus_shutdown
            .iter()
            .for_each(|shutdown| shutdown.send(()).unwrap());
        if let Some(event_bus) = self.event_bus.take() {
            event_bus.join().unwrap();
        }

        self.algorithm_shutdown.send(()).unwrap();
        if let Some(algorithm) = self.algorithm.take() {
            algorithm.join().unwrap();
        }

        self.poller_shutdown.send(()).unwrap();
        if let Some(poller) = self.poller.take() {
            poller.join().unwrap();
        }
    }
}
