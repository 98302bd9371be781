/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The algorithm thread, which drives a [`Pbft`] state machine.
//!
//! The thread is a loop that:
//! 1. Checks for the shutdown signal.
//! 2. Applies the [`AdminCommand`]s the [`Replica`](crate::replica::Replica) handle sent it.
//! 3. Waits up to one tick interval for an envelope from the poller thread, and hands it to
//!    [`Pbft::receive`].
//! 4. Calls [`Pbft::tick`], so that expired timers fire even when no envelopes arrive.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};

use crate::{
    app::App,
    logging::{secs_since_unix_epoch, MALFORMED_MESSAGE, STATE_TRANSFER_REJECTED},
    networking::{messages::Envelope, network::Network},
    pbft::implementation::Pbft,
    types::data_types::{CryptoHash, ReplicaID, SequenceNumber},
};

/// Administrative input that the [`Replica`](crate::replica::Replica) handle forwards to the algorithm
/// thread.
pub(crate) enum AdminCommand {
    InitiateViewChange,
    StateTransferred {
        sequence: SequenceNumber,
        digest: CryptoHash,
    },
}

pub(crate) struct Algorithm<N: Network + 'static, A: App + 'static> {
    pbft: Pbft<N, A>,
    envelopes: Receiver<(ReplicaID, Envelope)>,
    admin_commands: Receiver<AdminCommand>,
    tick_interval: Duration,
    shutdown_signal: Receiver<()>,
}

impl<N: Network + 'static, A: App + 'static> Algorithm<N, A> {
    pub(crate) fn new(
        pbft: Pbft<N, A>,
        envelopes: Receiver<(ReplicaID, Envelope)>,
        admin_commands: Receiver<AdminCommand>,
        tick_interval: Duration,
        shutdown_signal: Receiver<()>,
    ) -> Self {
        Self {
            pbft,
            envelopes,
            admin_commands,
            tick_interval,
            shutdown_signal,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || self.execute())
    }

    fn execute(&mut self) {
        loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Algorithm thread disconnected from main thread")
                }
            }

            while let Ok(command) = self.admin_commands.try_recv() {
                self.apply(command);
            }

            match self.envelopes.recv_timeout(self.tick_interval) {
                Ok((origin, envelope)) => {
                    if let Err(err) = self.pbft.receive(origin, envelope) {
                        log::debug!(
                            "{}, {}, {}, {}",
                            MALFORMED_MESSAGE,
                            secs_since_unix_epoch(SystemTime::now()),
                            origin,
                            err
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                // The poller outlives this thread.
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("Algorithm thread disconnected from poller thread")
                }
            }

            self.pbft.tick();
        }
    }

    fn apply(&mut self, command: AdminCommand) {
        match command {
            AdminCommand::InitiateViewChange => self.pbft.initiate_view_change(),
            AdminCommand::StateTransferred { sequence, digest } => {
                if let Err(err) = self.pbft.state_transferred(sequence, digest) {
                    log::warn!(
                        "{}, {}, {}",
                        STATE_TRANSFER_REJECTED,
                        secs_since_unix_epoch(SystemTime::now()),
                        err
                    );
                }
            }
        }
    }
}
