//! Mock observer for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::observer::{Observer, ObserverHandler, OperationUpdate, PollUpdate, SubmitAck};

/// Mock implementation of the Observer trait.
///
/// Holds the registered handler and lets tests deliver events to it, the way a
/// real observer would when it sees the corresponding network traffic.
#[derive(Default)]
pub struct MockObserver {
    handler: RwLock<Option<Arc<dyn ObserverHandler>>>,
    acks: AtomicUsize,
    polls: AtomicUsize,
}

impl MockObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_handler(&self) -> Option<Arc<dyn ObserverHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a handler has been registered.
    pub fn is_registered(&self) -> bool {
        self.current_handler().is_some()
    }

    /// Deliver a submission acknowledgement. Dropped if nothing is registered.
    pub fn emit_ack(&self, ack: SubmitAck) {
        self.acks.fetch_add(1, Ordering::SeqCst);
        if let Some(handler) = self.current_handler() {
            handler.on_submit_ack(ack);
        }
    }

    /// Deliver a poll update. Dropped if nothing is registered.
    pub fn emit_poll(&self, update: PollUpdate) {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(handler) = self.current_handler() {
            handler.on_poll_update(update);
        }
    }

    /// Report every operation in `op_names` as finished with `state`.
    pub fn emit_states(&self, op_names: &[String], state: &str) {
        self.emit_poll(PollUpdate {
            operations: op_names
                .iter()
                .map(|name| OperationUpdate {
                    op_name: name.clone(),
                    state: state.to_string(),
                    artifact_url: None,
                })
                .collect(),
        });
    }

    pub fn acks_delivered(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn polls_delivered(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl Observer for MockObserver {
    fn register(&self, handler: Arc<dyn ObserverHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}
