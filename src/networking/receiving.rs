//! Functions for receiving messages from the P2P network.

use std::{
    sync::mpsc::{self, Receiver, TryRecvError},
    thread::{self, JoinHandle},
};

use crate::types::data_types::ReplicaID;

use super::{messages::Envelope, network::Network};

/// Spawn the poller thread, which polls the [`Network`] for envelopes and forwards them, tagged with
/// their origin, to the [`Algorithm`](crate::algorithm::Algorithm) thread through the returned receiver.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, Receiver<(ReplicaID, Envelope)>) {
    let (to_envelope_receiver, envelope_receiver) = mpsc::channel();

    let poller_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some((origin, envelope)) = network.recv() {
            let _ = to_envelope_receiver.send((origin, envelope));
        } else {
            thread::yield_now()
        }
    });

    (poller_thread, envelope_receiver)
}
