//! Isolated side of a session: owns the model handle, negotiates backend and
//! precision, streams tokens, and honors cooperative aborts.
//!
//! The executor runs as its own task and talks to the controller only through
//! [`Request`] and [`Response`] channels. Work is strictly sequential: while an
//! `INIT` or `GENERATE` is in flight the loop keeps draining requests so that an
//! `ABORT` can flip the active generation's flag, but a second `INIT` or
//! `GENERATE` is refused.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info, trace, warn};

use crate::{
    config::SessionTimeouts,
    error::SessionError,
    model::{
        BuildSpec, EngineError, InferenceEngine, ModelHandle, ProgressFn, RunParams, TokenStreamer,
    },
    protocol::{
        AbortPayload, Banner, DonePayload, GeneratePayload, GenerationOutcome, InitPayload,
        InitStep, Request, RequestId, RequestKind, Response, ResponseKind, SessionConfig, Stage,
        StatusPayload, TokenPayload,
    },
    session::{
        negotiation::{Backend, BuildProgress, Precision, ProgressThrottle, resolve},
        probe::CapabilityProbe,
        text::{clean_reply, extract_generated_text, is_garbled},
    },
};

pub const WARMUP_PROMPT: &str = "User: hi\nAssistant:";

const FETCH_MESSAGE: &str = "Fetching model files…";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutorState {
    Uninitialized,
    Initializing,
    Ready,
    Generating,
    Error,
}

#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Response>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Response>) -> Self {
        Self { tx }
    }

    fn post(&self, request_id: &RequestId, kind: ResponseKind) {
        if kind.is_terminal() {
            debug!(%request_id, "-> {}", kind.name());
        } else {
            trace!(%request_id, "-> {}", kind.name());
        }
        let _ = self.tx.send(Response {
            request_id: request_id.clone(),
            kind,
        });
    }

    fn status(&self, request_id: &RequestId, status: StatusPayload) {
        self.post(request_id, ResponseKind::Status(status));
    }

    fn banner(&self, request_id: &RequestId, message: String, from: &str, to: &str) {
        self.post(
            request_id,
            ResponseKind::Banner(Banner {
                message,
                from: from.to_string(),
                to: to.to_string(),
            }),
        );
    }
}

struct GenerationState {
    request_id: RequestId,
    abort_requested: Arc<AtomicBool>,
}

/// Holder for the single in-flight generation, shared with the message loop.
#[derive(Clone, Default)]
pub struct GenerationSlot(Arc<Mutex<Option<GenerationState>>>);

impl GenerationSlot {
    fn begin(&self, request_id: &RequestId) -> ActiveGeneration {
        let flag = Arc::new(AtomicBool::new(false));
        *self.0.lock() = Some(GenerationState {
            request_id: request_id.clone(),
            abort_requested: flag.clone(),
        });
        ActiveGeneration {
            slot: self.clone(),
            flag,
        }
    }

    /// Flags the active generation, if any. With a target, only a generation
    /// carrying that id is affected.
    pub fn request_abort(&self, target: Option<&RequestId>) -> bool {
        let guard = self.0.lock();
        match guard.as_ref() {
            Some(active) if target.is_none_or(|t| *t == active.request_id) => {
                active.abort_requested.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    fn active_request(&self) -> Option<RequestId> {
        self.0.lock().as_ref().map(|g| g.request_id.clone())
    }
}

/// Clears the slot when the generation settles.
struct ActiveGeneration {
    slot: GenerationSlot,
    flag: Arc<AtomicBool>,
}

impl ActiveGeneration {
    fn aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Drop for ActiveGeneration {
    fn drop(&mut self) {
        self.slot.0.lock().take();
    }
}

struct LoadedModel {
    handle: Arc<dyn ModelHandle>,
    config: SessionConfig,
}

enum Attempt {
    Cancelled { partial: String },
    Failed(SessionError),
}

pub struct SessionExecutor {
    engine: Arc<dyn InferenceEngine>,
    probe: Arc<dyn CapabilityProbe>,
    timeouts: SessionTimeouts,
    outbox: Outbox,
    generation: GenerationSlot,
    model: Option<LoadedModel>,
    state: ExecutorState,
}

/// Channels and task of a spawned executor.
pub struct ExecutorChannels {
    pub requests: mpsc::UnboundedSender<Request>,
    pub responses: mpsc::UnboundedReceiver<Response>,
    pub task: JoinHandle<()>,
}

pub fn spawn(
    engine: Arc<dyn InferenceEngine>,
    probe: Arc<dyn CapabilityProbe>,
    timeouts: SessionTimeouts,
) -> ExecutorChannels {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let executor = SessionExecutor::new(engine, probe, timeouts, Outbox::new(response_tx));
    let task = tokio::spawn(executor.run(request_rx));
    ExecutorChannels {
        requests: request_tx,
        responses: response_rx,
        task,
    }
}

type Inflight = Pin<Box<dyn Future<Output = SessionExecutor> + Send>>;

async fn settle(inflight: &mut Option<Inflight>) -> Option<SessionExecutor> {
    match inflight {
        Some(op) => Some(op.await),
        None => std::future::pending().await,
    }
}

fn acknowledge_abort(
    slot: &GenerationSlot,
    outbox: &Outbox,
    request_id: &RequestId,
    payload: AbortPayload,
) {
    let target = payload.target_request_id;
    if slot.request_abort(target.as_ref()) {
        info!(target_request = ?target, "abort requested");
        let ack_id = target.as_ref().unwrap_or(request_id);
        outbox.status(ack_id, StatusPayload::new(Stage::Abort, "Stopping..."));
    } else {
        outbox.status(
            request_id,
            StatusPayload::new(Stage::Abort, "No active generation"),
        );
    }
}

/// Wall clock that follows tokio's (possibly paused) timer.
fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn engine_failure(err: EngineError) -> SessionError {
    SessionError::Unclassified(err.to_string())
}

impl SessionExecutor {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        probe: Arc<dyn CapabilityProbe>,
        timeouts: SessionTimeouts,
        outbox: Outbox,
    ) -> Self {
        Self {
            engine,
            probe,
            timeouts,
            outbox,
            generation: GenerationSlot::default(),
            model: None,
            state: ExecutorState::Uninitialized,
        }
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.model.as_ref().map(|m| &m.config)
    }

    /// Serves requests until the controller drops its sender.
    pub async fn run(self, mut requests: mpsc::UnboundedReceiver<Request>) {
        let slot = self.generation.clone();
        let outbox = self.outbox.clone();
        let mut idle = Some(self);
        let mut inflight: Option<Inflight> = None;

        loop {
            tokio::select! {
                Some(executor) = settle(&mut inflight) => {
                    inflight = None;
                    idle = Some(executor);
                }
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    debug!(request_id = %request.request_id, "<- request");
                    match request.kind {
                        RequestKind::Abort(payload) => {
                            acknowledge_abort(&slot, &outbox, &request.request_id, payload)
                        }
                        _ => match idle.take() {
                            Some(executor) => inflight = Some(Box::pin(executor.handle(request))),
                            None => {
                                warn!(
                                    request_id = %request.request_id,
                                    active = ?slot.active_request(),
                                    "executor busy, refusing request"
                                );
                                let payload = SessionError::GenerationInProgress.to_payload(None);
                                outbox.post(&request.request_id, ResponseKind::Error(payload));
                            }
                        },
                    }
                }
            }
        }

        debug!("executor request channel closed");
    }

    async fn handle(mut self, request: Request) -> Self {
        let Request { request_id, kind } = request;
        let response = match kind {
            RequestKind::Init(payload) => match self.init(&request_id, payload).await {
                Ok(config) => ResponseKind::Ready { config },
                Err(err) => self.error_response(err),
            },
            RequestKind::Generate(payload) => match self.generate(&request_id, payload).await {
                Ok(outcome) => ResponseKind::Done(DonePayload {
                    text: outcome.text,
                    aborted: outcome.aborted,
                    config: self.config().cloned(),
                }),
                Err(err) => self.error_response(err),
            },
            RequestKind::Abort(payload) => {
                acknowledge_abort(&self.generation, &self.outbox, &request_id, payload);
                return self;
            }
        };
        self.outbox.post(&request_id, response);
        self
    }

    fn error_response(&self, err: SessionError) -> ResponseKind {
        warn!(error = %err, "request failed");
        ResponseKind::Error(err.to_payload(self.config().cloned()))
    }

    /// Negotiates, builds and warms up a fresh model, replacing any previous one.
    pub async fn init(
        &mut self,
        request_id: &RequestId,
        payload: InitPayload,
    ) -> Result<SessionConfig, SessionError> {
        if payload.model_id.trim().is_empty() {
            return Err(SessionError::BadRequest("model_id is required".into()));
        }

        self.model = None;
        self.state = ExecutorState::Initializing;

        match self.negotiate(request_id, &payload).await {
            Ok(loaded) => {
                let config = loaded.config.clone();
                info!(
                    model_id = %config.model_id,
                    backend = %config.backend,
                    precision = %config.precision,
                    "session ready"
                );
                self.model = Some(loaded);
                self.state = ExecutorState::Ready;
                Ok(config)
            }
            Err(err) => {
                self.state = ExecutorState::Error;
                Err(err)
            }
        }
    }

    async fn negotiate(
        &self,
        request_id: &RequestId,
        payload: &InitPayload,
    ) -> Result<LoadedModel, SessionError> {
        let accelerated = self.probe.accelerated_backend_available().await;
        let plan = resolve(payload.backend, payload.precision, accelerated);
        if plan.backend != payload.backend {
            info!(requested = %payload.backend, "accelerated backend not available on this host");
        }

        let spec = BuildSpec {
            model_id: payload.model_id.clone(),
            precision: plan.precision,
            backend: plan.backend,
        };

        self.outbox
            .status(request_id, StatusPayload::init(InitStep::Fetch, FETCH_MESSAGE, None));

        let primary = match self.build(request_id, &spec, true).await {
            Ok(handle) => self.warm_up(request_id, handle, spec.clone()).await,
            Err(err) => Err(err),
        };

        match primary {
            Ok(loaded) => Ok(loaded),
            Err(err @ SessionError::MissingPrecisionResource { .. }) if plan.backend.is_safe() => {
                self.fall_back_precision(request_id, &spec, &plan.fallbacks, payload.precision, err)
                    .await
            }
            Err(err) if !plan.backend.is_safe() && !err.is_timeout() => {
                warn!(error = %err, "accelerated backend failed to initialize");
                self.outbox.banner(
                    request_id,
                    "Fell back to the safe backend".to_string(),
                    Backend::Accelerated.as_str(),
                    Backend::Safe.as_str(),
                );
                Err(SessionError::BackendUnavailable(format!(
                    "accelerated backend init failed, retry on the safe backend in a fresh executor: {err}"
                )))
            }
            Err(err) => Err(err),
        }
    }

    async fn fall_back_precision(
        &self,
        request_id: &RequestId,
        spec: &BuildSpec,
        fallbacks: &[Precision],
        requested: Precision,
        original: SessionError,
    ) -> Result<LoadedModel, SessionError> {
        for &precision in fallbacks {
            self.outbox.status(
                request_id,
                StatusPayload::init(
                    InitStep::Fetch,
                    format!("{FETCH_MESSAGE} (precision {precision})"),
                    None,
                ),
            );

            let candidate = BuildSpec {
                precision,
                ..spec.clone()
            };
            match self.build(request_id, &candidate, false).await {
                Ok(handle) => {
                    warn!(from = %spec.precision, to = %precision, "precision substituted");
                    self.outbox.banner(
                        request_id,
                        format!(
                            "Requested precision \"{requested}\" not available for this model. Using \"{precision}\""
                        ),
                        requested.as_str(),
                        precision.as_str(),
                    );
                    return self.warm_up(request_id, handle, candidate).await;
                }
                Err(SessionError::MissingPrecisionResource { .. }) => {
                    debug!(%precision, "precision resource missing, trying next");
                }
                Err(err) => return Err(err),
            }
        }
        Err(original)
    }

    async fn build(
        &self,
        request_id: &RequestId,
        spec: &BuildSpec,
        report_progress: bool,
    ) -> Result<Arc<dyn ModelHandle>, SessionError> {
        let throttle = Arc::new(Mutex::new(ProgressThrottle::new()));
        let progress = report_progress.then(|| {
            let outbox = self.outbox.clone();
            let request_id = request_id.clone();
            let throttle = throttle.clone();
            Box::new(move |progress: BuildProgress| {
                let admitted = throttle.lock().admit(progress, clock());
                if let Some(percent) = admitted {
                    outbox.status(
                        &request_id,
                        StatusPayload::init(InitStep::Fetch, FETCH_MESSAGE, Some(percent)),
                    );
                }
            }) as ProgressFn
        });

        debug!(backend = %spec.backend, precision = %spec.precision, "building model");
        let handle = match timeout(self.timeouts.init, self.engine.build(spec, progress)).await {
            Err(_) => {
                return Err(SessionError::InitTimeout(
                    "Model initialization timed out".into(),
                ));
            }
            Ok(Err(err)) if err.is_missing_resource() => {
                return Err(SessionError::MissingPrecisionResource {
                    precision: spec.precision,
                    message: err.to_string(),
                });
            }
            Ok(Err(err)) => return Err(engine_failure(err)),
            Ok(Ok(handle)) => handle,
        };

        let held = throttle.lock().take_held(clock());
        if let Some((percent, wait)) = held {
            tokio::time::sleep(wait).await;
            self.outbox.status(
                request_id,
                StatusPayload::init(InitStep::Fetch, FETCH_MESSAGE, Some(percent)),
            );
        }
        Ok(Arc::from(handle))
    }

    async fn warm_up(
        &self,
        request_id: &RequestId,
        handle: Arc<dyn ModelHandle>,
        spec: BuildSpec,
    ) -> Result<LoadedModel, SessionError> {
        self.outbox.status(
            request_id,
            StatusPayload::init(InitStep::Runtime, "Initializing runtime…", None),
        );
        self.outbox.status(
            request_id,
            StatusPayload::init(InitStep::Warmup, "Warming up…", None),
        );

        let params = RunParams::warmup();
        let warmup = handle.run(WARMUP_PROMPT, &params, None);
        match timeout(self.timeouts.warmup, warmup).await {
            Err(_) => return Err(SessionError::InitTimeout("Warm-up timed out".into())),
            Ok(Err(err)) => return Err(engine_failure(err)),
            Ok(Ok(_)) => {}
        }

        Ok(LoadedModel {
            handle,
            config: SessionConfig {
                model_id: spec.model_id,
                precision: spec.precision,
                backend: spec.backend,
            },
        })
    }

    /// Streams one generation, falling back to the safe backend once when the
    /// accelerated backend produces garbled text.
    pub async fn generate(
        &mut self,
        request_id: &RequestId,
        payload: GeneratePayload,
    ) -> Result<GenerationOutcome, SessionError> {
        let (ExecutorState::Ready, Some(loaded)) = (self.state, self.model.as_ref()) else {
            return Err(SessionError::NotInitialized);
        };
        let handle = loaded.handle.clone();
        let config = loaded.config.clone();

        self.outbox
            .status(request_id, StatusPayload::new(Stage::Generate, "Generating"));
        self.state = ExecutorState::Generating;

        let active = self.generation.begin(request_id);
        let result = self
            .run_generation(request_id, &payload, handle, config, &active)
            .await;
        drop(active);

        self.state = if self.model.is_some() {
            ExecutorState::Ready
        } else {
            ExecutorState::Error
        };
        result
    }

    async fn run_generation(
        &mut self,
        request_id: &RequestId,
        payload: &GeneratePayload,
        handle: Arc<dyn ModelHandle>,
        config: SessionConfig,
        active: &ActiveGeneration,
    ) -> Result<GenerationOutcome, SessionError> {
        let text = match self
            .generate_once(request_id, &handle, payload, Some(active))
            .await
        {
            Ok(text) if active.aborted() => return Ok(self.finish_aborted(request_id, text)),
            Ok(text) => text,
            Err(Attempt::Cancelled { partial }) => {
                return Ok(self.finish_aborted(request_id, partial));
            }
            Err(Attempt::Failed(err)) => return Err(err),
        };

        if text.is_empty() {
            return Err(SessionError::EmptyResult);
        }

        if config.backend.is_safe() || !is_garbled(&text) {
            return Ok(GenerationOutcome {
                text,
                aborted: false,
            });
        }

        warn!("accelerated output looks garbled, rebuilding on the safe backend");
        self.outbox.banner(
            request_id,
            "Accelerated output looked corrupted. Fell back to the safe backend".to_string(),
            Backend::Accelerated.as_str(),
            Backend::Safe.as_str(),
        );
        self.outbox.status(
            request_id,
            StatusPayload::new(Stage::Generate, "Retrying on the safe backend"),
        );

        self.model = None;
        drop(handle);

        let spec = BuildSpec {
            model_id: config.model_id,
            precision: Backend::Safe.default_precision(),
            backend: Backend::Safe,
        };
        let handle = self.build(request_id, &spec, false).await?;
        self.model = Some(LoadedModel {
            handle: handle.clone(),
            config: SessionConfig {
                model_id: spec.model_id,
                precision: spec.precision,
                backend: spec.backend,
            },
        });

        match self.generate_once(request_id, &handle, payload, None).await {
            Ok(text) if text.is_empty() => Err(SessionError::EmptyResult),
            Ok(text) => Ok(GenerationOutcome {
                text,
                aborted: false,
            }),
            Err(Attempt::Cancelled { partial }) => Ok(self.finish_aborted(request_id, partial)),
            Err(Attempt::Failed(err)) => Err(err),
        }
    }

    async fn generate_once(
        &self,
        request_id: &RequestId,
        handle: &Arc<dyn ModelHandle>,
        payload: &GeneratePayload,
        active: Option<&ActiveGeneration>,
    ) -> Result<String, Attempt> {
        let params = RunParams::for_generation(payload.max_new_tokens, payload.temperature);
        let accumulated = Arc::new(Mutex::new(String::new()));

        let streamer = active.map(|active| {
            let flag = active.flag.clone();
            let accumulated = accumulated.clone();
            let outbox = self.outbox.clone();
            let request_id = request_id.clone();
            Box::new(move |fragment: &str| {
                if flag.load(Ordering::SeqCst) {
                    return Err(EngineError::Cancelled);
                }
                if fragment.is_empty() {
                    return Ok(());
                }
                accumulated.lock().push_str(fragment);
                outbox.post(
                    &request_id,
                    ResponseKind::Token(TokenPayload {
                        text: fragment.to_string(),
                        is_final: false,
                    }),
                );
                Ok(())
            }) as TokenStreamer
        });

        let outcome = timeout(
            self.timeouts.generate,
            handle.run(&payload.prompt, &params, streamer),
        )
        .await;
        let streamed = clean_reply(&accumulated.lock(), &payload.prompt);

        match outcome {
            Err(_) => {
                // Stop the abandoned run at its next token.
                if let Some(active) = active {
                    active.flag.store(true, Ordering::SeqCst);
                }
                Err(Attempt::Failed(SessionError::GenerateTimeout))
            }
            Ok(Err(EngineError::Cancelled)) => Err(Attempt::Cancelled { partial: streamed }),
            Ok(Err(err)) => Err(Attempt::Failed(engine_failure(err))),
            Ok(Ok(_)) if !streamed.is_empty() => Ok(streamed),
            Ok(Ok(output)) => {
                let extracted = extract_generated_text(&output, &payload.prompt);
                Ok(clean_reply(&extracted, &payload.prompt))
            }
        }
    }

    fn finish_aborted(&self, request_id: &RequestId, text: String) -> GenerationOutcome {
        info!(%request_id, "generation aborted");
        self.outbox
            .status(request_id, StatusPayload::new(Stage::Abort, "Aborted"));
        GenerationOutcome {
            text,
            aborted: true,
        }
    }
}
