use crate::consumers::ConsumerError;

/// Error returned when starting a [`ConsumerDataflow`](super::ConsumerDataflow).
#[derive(thiserror::Error, Debug)]
pub enum DataflowError {
    #[error("The dataflow is already running")]
    AlreadyRunning,
    #[error("Failed to start a consumer of the dataflow")]
    Consumer(#[from] ConsumerError),
}
