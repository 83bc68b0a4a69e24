//! Staged, concurrent processing of consumed messages. Check out [`ConsumerDataflow`] as a
//! starting point.
mod consumer_dataflow;
mod error;
mod stage;
mod work_state;

pub use consumer_dataflow::{ConsumerDataflow, ConsumerDataflowBuilder};
pub use error::DataflowError;
pub use stage::{StageOptions, Step};
pub use work_state::{StepFault, WorkState};
