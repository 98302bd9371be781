/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events) from the algorithm thread and fires
//! the handlers registered for them.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Build the list of handlers for one event type: the default logger if `log_events` is set,
/// followed by the user's handler, if any.
pub(crate) fn handlers<T: Logger>(
    log_events: bool,
    user_handler: Option<HandlerPtr<T>>,
) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(handler) = user_handler {
        handlers.push(handler);
    }
    handlers
}

pub(crate) struct EventHandlers {
    pub(crate) receive_request_handlers: Vec<HandlerPtr<ReceiveRequestEvent>>,
    pub(crate) pre_prepare_handlers: Vec<HandlerPtr<PrePrepareEvent>>,
    pub(crate) prepare_handlers: Vec<HandlerPtr<PrepareEvent>>,
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) checkpoint_handlers: Vec<HandlerPtr<CheckpointEvent>>,
    pub(crate) receive_pre_prepare_handlers: Vec<HandlerPtr<ReceivePrePrepareEvent>>,
    pub(crate) prepared_handlers: Vec<HandlerPtr<PreparedEvent>>,
    pub(crate) commit_local_handlers: Vec<HandlerPtr<CommitLocalEvent>>,
    pub(crate) execute_handlers: Vec<HandlerPtr<ExecuteEvent>>,
    pub(crate) stable_checkpoint_handlers: Vec<HandlerPtr<StableCheckpointEvent>>,
    pub(crate) view_timeout_handlers: Vec<HandlerPtr<ViewTimeoutEvent>>,
    pub(crate) view_change_handlers: Vec<HandlerPtr<ViewChangeEvent>>,
    pub(crate) receive_view_change_handlers: Vec<HandlerPtr<ReceiveViewChangeEvent>>,
    pub(crate) new_view_handlers: Vec<HandlerPtr<NewViewEvent>>,
    pub(crate) start_view_handlers: Vec<HandlerPtr<StartViewEvent>>,
    pub(crate) reject_message_handlers: Vec<HandlerPtr<RejectMessageEvent>>,
    pub(crate) equivocation_handlers: Vec<HandlerPtr<EquivocationEvent>>,
    pub(crate) state_transfer_required_handlers: Vec<HandlerPtr<StateTransferRequiredEvent>>,
}

impl EventHandlers {
    pub(crate) fn is_empty(&self) -> bool {
        self.receive_request_handlers.is_empty()
            && self.pre_prepare_handlers.is_empty()
            && self.prepare_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.checkpoint_handlers.is_empty()
            && self.receive_pre_prepare_handlers.is_empty()
            && self.prepared_handlers.is_empty()
            && self.commit_local_handlers.is_empty()
            && self.execute_handlers.is_empty()
            && self.stable_checkpoint_handlers.is_empty()
            && self.view_timeout_handlers.is_empty()
            && self.view_change_handlers.is_empty()
            && self.receive_view_change_handlers.is_empty()
            && self.new_view_handlers.is_empty()
            && self.start_view_handlers.is_empty()
            && self.reject_message_handlers.is_empty()
            && self.equivocation_handlers.is_empty()
            && self.state_transfer_required_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ReceiveRequest(receive_request_event) => self
                .receive_request_handlers
                .iter()
                .for_each(|handler| handler(&receive_request_event)),

            Event::PrePrepare(pre_prepare_event) => self
                .pre_prepare_handlers
                .iter()
                .for_each(|handler| handler(&pre_prepare_event)),

            Event::Prepare(prepare_event) => self
                .prepare_handlers
                .iter()
                .for_each(|handler| handler(&prepare_event)),

            Event::Commit(commit_event) => self
                .commit_handlers
                .iter()
                .for_each(|handler| handler(&commit_event)),

            Event::Checkpoint(checkpoint_event) => self
                .checkpoint_handlers
                .iter()
                .for_each(|handler| handler(&checkpoint_event)),

            Event::ReceivePrePrepare(receive_pre_prepare_event) => self
                .receive_pre_prepare_handlers
                .iter()
                .for_each(|handler| handler(&receive_pre_prepare_event)),

            Event::Prepared(prepared_event) => self
                .prepared_handlers
                .iter()
                .for_each(|handler| handler(&prepared_event)),

            Event::CommitLocal(commit_local_event) => self
                .commit_local_handlers
                .iter()
                .for_each(|handler| handler(&commit_local_event)),

            Event::Execute(execute_event) => self
                .execute_handlers
                .iter()
                .for_each(|handler| handler(&execute_event)),

            Event::StableCheckpoint(stable_checkpoint_event) => self
                .stable_checkpoint_handlers
                .iter()
                .for_each(|handler| handler(&stable_checkpoint_event)),

            Event::ViewTimeout(view_timeout_event) => self
                .view_timeout_handlers
                .iter()
                .for_each(|handler| handler(&view_timeout_event)),

            Event::ViewChange(view_change_event) => self
                .view_change_handlers
                .iter()
                .for_each(|handler| handler(&view_change_event)),

            Event::ReceiveViewChange(receive_view_change_event) => self
                .receive_view_change_handlers
                .iter()
                .for_each(|handler| handler(&receive_view_change_event)),

            Event::NewView(new_view_event) => self
                .new_view_handlers
                .iter()
                .for_each(|handler| handler(&new_view_event)),

            Event::StartView(start_view_event) => self
                .start_view_handlers
                .iter()
                .for_each(|handler| handler(&start_view_event)),

            Event::RejectMessage(reject_message_event) => self
                .reject_message_handlers
                .iter()
                .for_each(|handler| handler(&reject_message_event)),

            Event::Equivocation(equivocation_event) => self
                .equivocation_handlers
                .iter()
                .for_each(|handler| handler(&equivocation_event)),

            Event::StateTransferRequired(state_transfer_required_event) => self
                .state_transfer_required_handlers
                .iter()
                .for_each(|handler| handler(&state_transfer_required_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Event bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(Duration::from_millis(10)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // The algorithm thread has exited. Wait for the shutdown signal.
            Err(RecvTimeoutError::Disconnected) => thread::yield_now(),
        }
    })
}
