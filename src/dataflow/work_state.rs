use crate::consumers::ReceivedMessage;
use crate::messages::Message;
use std::collections::HashMap;
use task_local_extensions::Extensions;

/// The per-message context threaded through the stages of a
/// [`ConsumerDataflow`](super::ConsumerDataflow).
///
/// A `WorkState` is owned by one stage invocation at a time.
pub struct WorkState {
    received: ReceivedMessage,
    /// Typed values produced by a step for the next ones, e.g. the deserialized payload.
    pub data: Extensions,
    step_success: HashMap<String, bool>,
    fault: Option<StepFault>,
}

/// The first failure recorded on a [`WorkState`].
#[derive(Debug)]
pub struct StepFault {
    /// The name of the stage that failed.
    pub step: String,
    pub error: anyhow::Error,
}

impl WorkState {
    pub(crate) fn new(received: ReceivedMessage) -> Self {
        Self {
            received,
            data: Extensions::new(),
            step_success: HashMap::new(),
            fault: None,
        }
    }

    pub fn received(&self) -> &ReceivedMessage {
        &self.received
    }

    pub fn message(&self) -> &Message {
        &self.received.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.received.message
    }

    /// The value of type `T` stored in [`data`](WorkState::data), if any.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.data.get::<T>()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.data.get_mut::<T>()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.data.insert(value)
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.data.remove::<T>()
    }

    /// Whether the step named `step` ran and succeeded, `None` if it did not run.
    pub fn step_succeeded(&self, step: &str) -> Option<bool> {
        self.step_success.get(step).copied()
    }

    pub fn step_success(&self) -> &HashMap<String, bool> {
        &self.step_success
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    pub fn fault(&self) -> Option<&StepFault> {
        self.fault.as_ref()
    }

    pub(crate) fn record_success(&mut self, step: &str) {
        self.step_success.insert(step.to_owned(), true);
    }

    pub(crate) fn record_fault(&mut self, step: &str, error: anyhow::Error) {
        self.step_success.insert(step.to_owned(), false);
        if self.fault.is_none() {
            self.fault = Some(StepFault {
                step: step.to_owned(),
                error,
            });
        }
    }
}

impl std::fmt::Debug for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkState")
            .field("received", &self.received)
            .field("step_success", &self.step_success)
            .field("fault", &self.fault)
            .finish()
    }
}
