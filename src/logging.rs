/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via replica's
//! [config](crate::replica::Configuration).
//!
//! PBFT-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceivePrePrepare](crate::events::ReceivePrePrepareEvent) is printed:
//!
//! ```text
//! ReceivePrePrepare, 1701329264, 0, 2, 17, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the ID of the replica the pre-prepare came from.
//! - The fourth value is the view of the pre-prepare.
//! - The fifth value is the sequence number of the pre-prepare.
//! - The sixth value is the first seven characters of the Base64 encoding of the request digest.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const RECEIVE_REQUEST: &str = "ReceiveRequest";

pub const PRE_PREPARE: &str = "PrePrepare";
pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";
pub const CHECKPOINT: &str = "Checkpoint";

pub const RECEIVE_PRE_PREPARE: &str = "ReceivePrePrepare";

pub const PREPARED: &str = "Prepared";
pub const COMMIT_LOCAL: &str = "CommitLocal";
pub const EXECUTE: &str = "Execute";
pub const STABLE_CHECKPOINT: &str = "StableCheckpoint";

pub const VIEW_TIMEOUT: &str = "ViewTimeout";
pub const VIEW_CHANGE: &str = "ViewChange";
pub const RECEIVE_VIEW_CHANGE: &str = "ReceiveViewChange";
pub const NEW_VIEW: &str = "NewView";
pub const START_VIEW: &str = "StartView";

pub const REJECT_MESSAGE: &str = "RejectMessage";
pub const EQUIVOCATION: &str = "Equivocation";
pub const STATE_TRANSFER_REQUIRED: &str = "StateTransferRequired";

// Names of conditions that the algorithm thread logs directly, without an event:
pub const MALFORMED_MESSAGE: &str = "MalformedMessage";
pub const STATE_TRANSFER_REJECTED: &str = "StateTransferRejected";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ReceiveRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_request_event: &ReceiveRequestEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_REQUEST,
                secs_since_unix_epoch(receive_request_event.timestamp),
                receive_request_event.origin,
                receive_request_event.client,
                first_seven_base64_chars(&receive_request_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |pre_prepare_event: &PrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PRE_PREPARE,
                secs_since_unix_epoch(pre_prepare_event.timestamp),
                pre_prepare_event.pre_prepare.view,
                pre_prepare_event.pre_prepare.sequence,
                first_seven_base64_chars(&pre_prepare_event.pre_prepare.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prepare_event: &PrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PREPARE,
                secs_since_unix_epoch(prepare_event.timestamp),
                prepare_event.prepare.view,
                prepare_event.prepare.sequence,
                first_seven_base64_chars(&prepare_event.prepare.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                commit_event.commit.view,
                commit_event.commit.sequence,
                first_seven_base64_chars(&commit_event.commit.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |checkpoint_event: &CheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                CHECKPOINT,
                secs_since_unix_epoch(checkpoint_event.timestamp),
                checkpoint_event.checkpoint.sequence,
                first_seven_base64_chars(&checkpoint_event.checkpoint.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_pre_prepare_event: &ReceivePrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PRE_PREPARE,
                secs_since_unix_epoch(receive_pre_prepare_event.timestamp),
                receive_pre_prepare_event.origin,
                receive_pre_prepare_event.pre_prepare.view,
                receive_pre_prepare_event.pre_prepare.sequence,
                first_seven_base64_chars(&receive_pre_prepare_event.pre_prepare.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PreparedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prepared_event: &PreparedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PREPARED,
                secs_since_unix_epoch(prepared_event.timestamp),
                prepared_event.view,
                prepared_event.sequence,
                first_seven_base64_chars(&prepared_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitLocalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_local_event: &CommitLocalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT_LOCAL,
                secs_since_unix_epoch(commit_local_event.timestamp),
                commit_local_event.view,
                commit_local_event.sequence,
                first_seven_base64_chars(&commit_local_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ExecuteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |execute_event: &ExecuteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                EXECUTE,
                secs_since_unix_epoch(execute_event.timestamp),
                execute_event.sequence,
                execute_event
                    .request
                    .map(|digest| first_seven_base64_chars(&digest.bytes()))
                    .unwrap_or(String::from("null")),
                first_seven_base64_chars(&execute_event.state_digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for StableCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |stable_checkpoint_event: &StableCheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                STABLE_CHECKPOINT,
                secs_since_unix_epoch(stable_checkpoint_event.timestamp),
                stable_checkpoint_event.sequence,
                first_seven_base64_chars(&stable_checkpoint_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ViewTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |view_timeout_event: &ViewTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VIEW_TIMEOUT,
                secs_since_unix_epoch(view_timeout_event.timestamp),
                view_timeout_event.view,
                view_timeout_event.timeout.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |view_change_event: &ViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                VIEW_CHANGE,
                secs_since_unix_epoch(view_change_event.timestamp),
                view_change_event.view_change.new_view,
                view_change_event.view_change.last_stable_sequence,
                view_change_event.view_change.prepared_set.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_view_change_event: &ReceiveViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_VIEW_CHANGE,
                secs_since_unix_epoch(receive_view_change_event.timestamp),
                receive_view_change_event.origin,
                receive_view_change_event.view_change.new_view,
                receive_view_change_event.view_change.last_stable_sequence,
                receive_view_change_event.view_change.prepared_set.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_view_event: &NewViewEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_VIEW,
                secs_since_unix_epoch(new_view_event.timestamp),
                new_view_event.new_view.view,
                new_view_event.new_view.view_change_proof.len(),
                new_view_event.new_view.pre_prepare_set.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_view_event: &StartViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_VIEW,
                secs_since_unix_epoch(start_view_event.timestamp),
                start_view_event.primary,
                start_view_event.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for RejectMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reject_message_event: &RejectMessageEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                REJECT_MESSAGE,
                secs_since_unix_epoch(reject_message_event.timestamp),
                reject_message_event.origin,
                reject_message_event.kind,
                reject_message_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for EquivocationEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |equivocation_event: &EquivocationEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                EQUIVOCATION,
                secs_since_unix_epoch(equivocation_event.timestamp),
                equivocation_event.offender,
                equivocation_event.sequence,
                first_seven_base64_chars(&equivocation_event.first.bytes()),
                first_seven_base64_chars(&equivocation_event.second.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for StateTransferRequiredEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |state_transfer_required_event: &StateTransferRequiredEvent| {
            log::info!(
                "{}, {}, {}, {}",
                STATE_TRANSFER_REQUIRED,
                secs_since_unix_epoch(state_transfer_required_event.timestamp),
                state_transfer_required_event.sequence,
                first_seven_base64_chars(&state_transfer_required_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

pub(crate) fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
