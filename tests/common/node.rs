//! [`Node`], a replica running on its own threads, as a user of the library would run it.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use pbft_rs::{
    replica::{Configuration, Replica, ReplicaSpec},
    types::{
        crypto_primitives::{SigningKey, VerifyingKey},
        data_types::{CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
    },
};

use super::{
    network::NetworkStub,
    recording_app::{RecordingApp, RecordingAppHandle},
};

pub(crate) struct Node {
    replica: Replica,
    app: RecordingAppHandle,
    started_views: Arc<Mutex<Vec<ViewNumber>>>,
}

impl Node {
    pub(crate) fn new(
        keypair: SigningKey,
        replicas: Vec<VerifyingKey>,
        me: ReplicaID,
        network: NetworkStub,
    ) -> Node {
        let app = RecordingApp::new();
        let app_handle = app.handle();

        let configuration = Configuration::builder()
            .me(me)
            .keypair(keypair)
            .replicas(replicas)
            .checkpoint_interval(2)
            .watermark_window(8)
            .request_timeout(Duration::from_secs(2))
            .view_change_timeout(Duration::from_secs(2))
            .tick_interval(Duration::from_millis(10))
            .log_events(true)
            .build();

        let started_views = Arc::new(Mutex::new(Vec::new()));
        let views = started_views.clone();
        let replica = ReplicaSpec::builder()
            .app(app)
            .network(network)
            .configuration(configuration)
            .on_start_view(move |start_view| views.lock().unwrap().push(start_view.view))
            .build()
            .start()
            .unwrap();

        Node {
            replica,
            app: app_handle,
            started_views,
        }
    }

    pub(crate) fn executed(&self) -> Vec<(SequenceNumber, CryptoHash)> {
        self.app.executed()
    }

    /// Get the views this node entered through a view change, in order.
    pub(crate) fn started_views(&self) -> Vec<ViewNumber> {
        self.started_views.lock().unwrap().clone()
    }

    pub(crate) fn initiate_view_change(&self) {
        self.replica.initiate_view_change()
    }
}
