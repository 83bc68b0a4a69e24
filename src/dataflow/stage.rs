use crate::codecs::{Compressor, Encryptor, Serializer};
use crate::dataflow::WorkState;
use crate::messages::{COMPRESSED_MARKER, ENCRYPTED_MARKER};
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{error, warn};

/// Tuning of a single stage of a [`ConsumerDataflow`](super::ConsumerDataflow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StageOptions {
    /// How many messages the stage processes concurrently.
    pub max_degree_of_parallelism: usize,
    /// Emit messages in the order they entered the stage, rather than in completion order.
    pub ensure_ordered: bool,
    /// Capacity of the bounded buffer in front of the stage.
    pub capacity: usize,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: 1,
            ensure_ordered: true,
            capacity: 100,
        }
    }
}

impl StageOptions {
    pub fn new(max_degree_of_parallelism: usize, ensure_ordered: bool, capacity: usize) -> Self {
        Self {
            max_degree_of_parallelism,
            ensure_ordered,
            capacity,
        }
    }

    fn parallelism(&self) -> usize {
        self.max_degree_of_parallelism.max(1)
    }

    pub(crate) fn buffer(&self) -> usize {
        self.capacity.max(1)
    }
}

/// A unit of work applied to every message flowing through a
/// [`ConsumerDataflow`](super::ConsumerDataflow).
///
/// Returning an error (or panicking) faults the message: it skips the remaining steps and goes
/// to the error handling stage, then to finalization.
///
/// Synchronous closures with a matching signature are steps too:
///
/// ```rust
/// use carrot_flow::dataflow::WorkState;
///
/// fn require_payload(state: &mut WorkState) -> Result<(), anyhow::Error> {
///     anyhow::ensure!(!state.message().payload.is_empty(), "Empty payload");
///     Ok(())
/// }
/// ```
#[async_trait::async_trait]
pub trait Step: Send + Sync + 'static {
    async fn run(&self, state: &mut WorkState) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl<F> Step for F
where
    F: Fn(&mut WorkState) -> Result<(), anyhow::Error> + Send + Sync + 'static,
{
    async fn run(&self, state: &mut WorkState) -> Result<(), anyhow::Error> {
        (self)(state)
    }
}

/// A step and the options of the stage running it.
#[derive(Clone)]
pub(crate) struct StageDescriptor {
    pub(crate) name: Arc<str>,
    pub(crate) step: Arc<dyn Step>,
    pub(crate) options: StageOptions,
}

/// Decrypt payloads carrying the [`ENCRYPTED_MARKER`]. Other payloads are left untouched.
pub(crate) struct DecryptStep(pub(crate) Arc<dyn Encryptor>);

#[async_trait::async_trait]
impl Step for DecryptStep {
    async fn run(&self, state: &mut WorkState) -> Result<(), anyhow::Error> {
        let message = state.message_mut();
        let Some(encrypted_with) = message.encrypted_with() else {
            return Ok(());
        };
        anyhow::ensure!(
            encrypted_with == self.0.name(),
            "The payload was encrypted with {encrypted_with}, not {}",
            self.0.name()
        );
        message.payload = self.0.decrypt(&message.payload)?;
        message.metadata.remove(ENCRYPTED_MARKER);
        Ok(())
    }
}

/// Decompress payloads carrying the [`COMPRESSED_MARKER`]. Other payloads are left untouched.
pub(crate) struct DecompressStep(pub(crate) Arc<dyn Compressor>);

#[async_trait::async_trait]
impl Step for DecompressStep {
    async fn run(&self, state: &mut WorkState) -> Result<(), anyhow::Error> {
        let message = state.message_mut();
        let Some(compressed_with) = message.compressed_with() else {
            return Ok(());
        };
        anyhow::ensure!(
            compressed_with == self.0.name(),
            "The payload was compressed with {compressed_with}, not {}",
            self.0.name()
        );
        message.payload = self.0.decompress(&message.payload)?;
        message.metadata.remove(COMPRESSED_MARKER);
        Ok(())
    }
}

/// Deserialize the payload into a `T`, stored in the [`WorkState`] data.
pub(crate) struct BuildStateStep<S, T> {
    serializer: S,
    _state: PhantomData<fn() -> T>,
}

impl<S, T> BuildStateStep<S, T> {
    pub(crate) fn new(serializer: S) -> Self {
        Self {
            serializer,
            _state: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<S, T> Step for BuildStateStep<S, T>
where
    S: Serializer,
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn run(&self, state: &mut WorkState) -> Result<(), anyhow::Error> {
        let value: T = self.serializer.deserialize(&state.message().payload)?;
        state.insert(value);
        Ok(())
    }
}

/// Acks successful messages and rejects faulted ones, without requeueing them.
pub(crate) struct DefaultFinalization;

#[async_trait::async_trait]
impl Step for DefaultFinalization {
    async fn run(&self, state: &mut WorkState) -> Result<(), anyhow::Error> {
        let settled = if state.is_faulted() {
            state.received().reject(false).await
        } else {
            state.received().ack().await
        };
        if !settled {
            warn!(
                delivery_tag = state.received().delivery_tag(),
                "The message could not be settled with the broker"
            );
        }
        Ok(())
    }
}

fn into_stream<T: Send + 'static>(mut receiver: mpsc::Receiver<T>) -> impl Stream<Item = T> + Send {
    stream::poll_fn(move |cx| receiver.poll_recv(cx))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Run `step` on `state`, catching errors and panics.
async fn invoke(step: &dyn Step, state: &mut WorkState) -> Result<(), anyhow::Error> {
    match AssertUnwindSafe(step.run(state)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(anyhow::anyhow!(
            "The step panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

/// Map every item of `input` with `f` on the tokio worker pool, with up to
/// `max_degree_of_parallelism` invocations in flight, and feed the results to `on_output`.
async fn run_bounded<F, Fut, O, OFut>(
    input: mpsc::Receiver<WorkState>,
    options: StageOptions,
    f: F,
    mut on_output: O,
) where
    F: Fn(WorkState) -> Fut + Send,
    Fut: std::future::Future<Output = WorkState> + Send + 'static,
    O: FnMut(WorkState) -> OFut,
    OFut: std::future::Future<Output = ()>,
{
    let invocations = into_stream(input).map(move |state| tokio::spawn(f(state)));
    let mut outputs: BoxStream<'_, Result<WorkState, JoinError>> = if options.ensure_ordered {
        invocations.buffered(options.parallelism()).boxed()
    } else {
        invocations.buffer_unordered(options.parallelism()).boxed()
    };
    while let Some(output) = outputs.next().await {
        match output {
            Ok(state) => on_output(state).await,
            Err(e) => error!(error = ?e, "A stage invocation was cancelled"),
        }
    }
}

/// Run a processing stage until its input is closed and drained.
///
/// Successful messages go to `output`, faulted ones to `errors`.
pub(crate) async fn run_stage(
    stage: StageDescriptor,
    input: mpsc::Receiver<WorkState>,
    output: mpsc::Sender<WorkState>,
    errors: mpsc::Sender<WorkState>,
) {
    let StageDescriptor {
        name,
        step,
        options,
    } = stage;
    let execute = |mut state: WorkState| {
        let step = Arc::clone(&step);
        let name = Arc::clone(&name);
        async move {
            match invoke(step.as_ref(), &mut state).await {
                Ok(()) => state.record_success(&name),
                Err(e) => {
                    warn!(stage = %name, error = ?e, "A step failed");
                    state.record_fault(&name, e);
                }
            }
            state
        }
    };
    let forward = |state: WorkState| {
        let destination = if state.is_faulted() { &errors } else { &output };
        async move {
            if destination.send(state).await.is_err() {
                error!("The next stage is gone, dropping a message");
            }
        }
    };
    run_bounded(input, options, execute, forward).await;
}

/// Run the error handling stage: `step` (if any) sees every faulted message, which then
/// moves on to finalization whatever the outcome.
pub(crate) async fn run_error_stage(
    step: Option<Arc<dyn Step>>,
    options: StageOptions,
    input: mpsc::Receiver<WorkState>,
    output: mpsc::Sender<WorkState>,
) {
    let execute = |mut state: WorkState| {
        let step = step.clone();
        async move {
            if let Some(step) = step {
                if let Err(e) = invoke(step.as_ref(), &mut state).await {
                    error!(error = ?e, "The error handling step failed");
                }
            }
            state
        }
    };
    let forward = |state: WorkState| {
        let output = &output;
        async move {
            if output.send(state).await.is_err() {
                error!("The finalization stage is gone, dropping a message");
            }
        }
    };
    run_bounded(input, options, execute, forward).await;
}

/// Run the finalization stage: `step` runs exactly once per message, then the message is
/// marked as complete.
pub(crate) async fn run_finalization(
    step: Arc<dyn Step>,
    options: StageOptions,
    input: mpsc::Receiver<WorkState>,
) {
    let execute = |mut state: WorkState| {
        let step = Arc::clone(&step);
        async move {
            if let Err(e) = invoke(step.as_ref(), &mut state).await {
                error!(error = ?e, "The finalization step failed");
            }
            state.received().complete();
            state
        }
    };
    run_bounded(input, options, execute, |_| async {}).await;
}
