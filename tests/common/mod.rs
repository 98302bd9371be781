pub(crate) mod fuzzer;

pub(crate) mod keys;

pub(crate) mod logging;

pub(crate) mod network;

pub(crate) mod node;

pub(crate) mod recording_app;

pub(crate) mod test_net;
