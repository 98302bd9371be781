use std::{io, sync::Once, thread};

use log::LevelFilter;

static LOGGER_INIT: Once = Once::new();

// Set up a logger for every test binary that calls this, once. Lines are prefixed with the thread,
// since replicas in the threaded tests run the algorithm and event bus on their own threads.
pub(crate) fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(level)
            .level_for("pbft_rs", level)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}
