use crate::codecs::{Compressor, Encryptor, Serializer};
use crate::consumers::Consumer;
use crate::dataflow::stage::{
    run_error_stage, run_finalization, run_stage, BuildStateStep, DecompressStep, DecryptStep,
    DefaultFinalization, StageDescriptor,
};
use crate::dataflow::{DataflowError, StageOptions, Step, WorkState};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A staged processing pipeline fed by one or more [`Consumer`]s.
///
/// Every received message becomes a [`WorkState`] flowing through the stages, always in this
/// order:
/// 1. decryption, if configured;
/// 2. decompression, if configured;
/// 3. deserialization of the payload into the typed state, if configured;
/// 4. the steps added with [`ConsumerDataflowBuilder::add_step`], in registration order;
/// 5. finalization.
///
/// A message faulted by a stage skips the following ones: it goes through the error handling
/// stage, then finalization. Finalization runs exactly once per message. The default
/// finalization acks successful messages and rejects faulted ones, without requeueing them.
///
/// Stages are linked by bounded buffers and each runs up to `max_degree_of_parallelism`
/// invocations concurrently, see [`StageOptions`].
///
/// # How do I build a `ConsumerDataflow`?
///
/// The starting point is [`ConsumerDataflow::builder`].
pub struct ConsumerDataflow {
    name: String,
    consumers: Vec<Arc<Consumer>>,
    stages: Vec<StageDescriptor>,
    error_step: Option<Arc<dyn Step>>,
    error_options: StageOptions,
    finalization: Arc<dyn Step>,
    finalization_options: StageOptions,
    running: tokio::sync::Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl ConsumerDataflow {
    pub fn builder(name: impl Into<String>) -> ConsumerDataflowBuilder {
        ConsumerDataflowBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the consumers and the stages.
    ///
    /// If a consumer fails to start, the consumers already started are stopped and the error
    /// is returned.
    #[tracing::instrument(name = "dataflow_start", skip(self), fields(dataflow = %self.name))]
    pub async fn start(&self) -> Result<(), DataflowError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(DataflowError::AlreadyRunning);
        }

        for (i, consumer) in self.consumers.iter().enumerate() {
            if let Err(e) = consumer.start_consumer(false, false).await {
                error!(error = ?e, consumer = consumer.name(), "Failed to start consumer");
                for started in &self.consumers[..i] {
                    if let Err(e) = started.stop_consumer(true).await {
                        error!(error = ?e, consumer = started.name(), "Failed to stop consumer");
                    }
                }
                return Err(e.into());
            }
        }

        *running = Some(self.spawn_stages());
        info!(stages = self.stages.len(), "Dataflow started");
        Ok(())
    }

    /// Wire the stages together with bounded channels and spawn them, along with one feeder
    /// per consumer.
    fn spawn_stages(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(self.stages.len() + self.consumers.len() + 2);
        let (final_sender, final_receiver) = mpsc::channel(self.finalization_options.buffer());
        let (error_sender, error_receiver) = mpsc::channel(self.error_options.buffer());

        // The input of each stage. Finalization takes the output of the last one.
        let (mut senders, receivers): (Vec<_>, Vec<_>) = self
            .stages
            .iter()
            .map(|stage| mpsc::channel::<WorkState>(stage.options.buffer()))
            .unzip();
        senders.push(final_sender.clone());

        for ((stage, input), output) in self.stages.iter().zip(receivers).zip(&senders[1..]) {
            tasks.push(tokio::spawn(run_stage(
                stage.clone(),
                input,
                output.clone(),
                error_sender.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_error_stage(
            self.error_step.clone(),
            self.error_options,
            error_receiver,
            final_sender,
        )));
        tasks.push(tokio::spawn(run_finalization(
            Arc::clone(&self.finalization),
            self.finalization_options,
            final_receiver,
        )));

        let head = &senders[0];
        for consumer in &self.consumers {
            let head = head.clone();
            let mut messages = Box::pin(consumer.stream_until_consumer_stop());
            tasks.push(tokio::spawn(async move {
                while let Some(received) = messages.next().await {
                    if head.send(WorkState::new(received)).await.is_err() {
                        error!("The first stage of the dataflow is gone");
                        break;
                    }
                }
            }));
        }
        tasks
    }

    /// Stop the consumers gracefully and wait for every message they delivered to go through
    /// the whole pipeline.
    #[tracing::instrument(name = "dataflow_stop", skip(self), fields(dataflow = %self.name))]
    pub async fn stop(&self) {
        let Some(tasks) = self.running.lock().await.take() else {
            return;
        };
        for consumer in &self.consumers {
            if let Err(e) = consumer.stop_consumer(false).await {
                error!(error = ?e, consumer = consumer.name(), "Failed to stop consumer");
            }
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = ?e, "A dataflow task panicked");
            }
        }
        info!("Dataflow stopped");
    }

    /// Run the dataflow until `shutdown` is signalled, then stop it gracefully.
    pub async fn run_until_shutdown(
        &self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), DataflowError> {
        self.start().await?;
        shutdown.wait_for_signal().await;
        info!(dataflow = %self.name, "Dataflow received shutdown event");
        self.stop().await;
        Ok(())
    }

    /// Run the dataflow until the process receives SIGTERM.
    ///
    /// You usually want to invoke `run_until_sigterm` at the end of your `main` function.
    pub async fn run_until_sigterm(&self) -> Result<(), anyhow::Error> {
        self.run_until_shutdown(ShutdownHandler::sigterm()?).await?;
        Ok(())
    }
}

/// A builder for [`ConsumerDataflow`].
///
/// Use [`ConsumerDataflow::builder`] as entrypoint.
/// Stages that are given `None` as options use the default options, see
/// [`ConsumerDataflowBuilder::with_default_options`].
pub struct ConsumerDataflowBuilder {
    name: String,
    consumers: Vec<Arc<Consumer>>,
    default_options: StageOptions,
    decryption: Option<(Arc<dyn Encryptor>, Option<StageOptions>)>,
    decompression: Option<(Arc<dyn Compressor>, Option<StageOptions>)>,
    build_state: Option<(Arc<dyn Step>, Option<StageOptions>)>,
    steps: Vec<(String, Arc<dyn Step>, Option<StageOptions>)>,
    error_handling: Option<(Arc<dyn Step>, Option<StageOptions>)>,
    finalization: Option<(Arc<dyn Step>, Option<StageOptions>)>,
}

impl ConsumerDataflowBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            consumers: vec![],
            default_options: StageOptions::default(),
            decryption: None,
            decompression: None,
            build_state: None,
            steps: vec![],
            error_handling: None,
            finalization: None,
        }
    }

    /// Feed the dataflow with the messages of `consumer`. It can be called more than once.
    ///
    /// The dataflow starts and stops its consumers: they must not be used elsewhere.
    #[must_use]
    pub fn with_consumer(mut self, consumer: Arc<Consumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    #[must_use]
    pub fn with_default_options(mut self, options: StageOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Deserialize payloads into a `T` with `serializer`. Steps find it in [`WorkState::get`].
    #[must_use]
    pub fn with_build_state<T, S>(
        mut self,
        serializer: S,
        options: Option<StageOptions>,
    ) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
        S: Serializer,
    {
        let step: Arc<dyn Step> = Arc::new(BuildStateStep::<S, T>::new(serializer));
        self.build_state = Some((step, options));
        self
    }

    /// Decrypt payloads encrypted by `encryptor`, according to their `x-encrypted` metadata.
    #[must_use]
    pub fn with_decryption_step(
        mut self,
        encryptor: Arc<dyn Encryptor>,
        options: Option<StageOptions>,
    ) -> Self {
        self.decryption = Some((encryptor, options));
        self
    }

    /// Decompress payloads compressed by `compressor`, according to their `x-compressed`
    /// metadata.
    #[must_use]
    pub fn with_decompression_step(
        mut self,
        compressor: Arc<dyn Compressor>,
        options: Option<StageOptions>,
    ) -> Self {
        self.decompression = Some((compressor, options));
        self
    }

    /// Append a business logic step. Its success is recorded under `name` in the
    /// [`WorkState`].
    #[must_use]
    pub fn add_step<S: Step>(
        mut self,
        name: impl Into<String>,
        step: S,
        options: Option<StageOptions>,
    ) -> Self {
        let step: Arc<dyn Step> = Arc::new(step);
        self.steps.push((name.into(), step, options));
        self
    }

    /// Run `step` on every faulted message, before finalization.
    #[must_use]
    pub fn with_error_handling<S: Step>(
        mut self,
        step: S,
        options: Option<StageOptions>,
    ) -> Self {
        let step: Arc<dyn Step> = Arc::new(step);
        self.error_handling = Some((step, options));
        self
    }

    /// Replace the default finalization.
    ///
    /// `step` is in charge of settling the message with the broker: it runs exactly once per
    /// message, whether it was faulted or not.
    #[must_use]
    pub fn with_finalization<S: Step>(
        mut self,
        step: S,
        options: Option<StageOptions>,
    ) -> Self {
        let step: Arc<dyn Step> = Arc::new(step);
        self.finalization = Some((step, options));
        self
    }

    /// Finalise the builder and get an instance of [`ConsumerDataflow`].
    pub fn build(self) -> ConsumerDataflow {
        let defaults = self.default_options;
        let descriptor = |name: &str, step: Arc<dyn Step>, options: Option<StageOptions>| {
            StageDescriptor {
                name: name.into(),
                step,
                options: options.unwrap_or(defaults),
            }
        };

        let mut stages = vec![];
        if let Some((encryptor, options)) = self.decryption {
            let step: Arc<dyn Step> = Arc::new(DecryptStep(encryptor));
            stages.push(descriptor("decrypt", step, options));
        }
        if let Some((compressor, options)) = self.decompression {
            let step: Arc<dyn Step> = Arc::new(DecompressStep(compressor));
            stages.push(descriptor("decompress", step, options));
        }
        if let Some((step, options)) = self.build_state {
            stages.push(descriptor("build_state", step, options));
        }
        for (name, step, options) in self.steps {
            stages.push(descriptor(&name, step, options));
        }

        let (error_step, error_options) = match self.error_handling {
            Some((step, options)) => (Some(step), options.unwrap_or(defaults)),
            None => (None, defaults),
        };
        let (finalization, finalization_options) = match self.finalization {
            Some((step, options)) => (step, options.unwrap_or(defaults)),
            None => (Arc::new(DefaultFinalization) as Arc<dyn Step>, defaults),
        };

        ConsumerDataflow {
            name: self.name,
            consumers: self.consumers,
            stages,
            error_step,
            error_options,
            finalization,
            finalization_options,
            running: tokio::sync::Mutex::new(None),
        }
    }
}
