//! Host side of a session: public lifecycle API, request correlation and
//! executor supervision.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::SessionTimeouts,
    error::SessionError,
    model::InferenceEngine,
    protocol::{
        AbortPayload, GeneratePayload, GenerationOutcome, InitPayload, Request, RequestId,
        RequestIdGenerator, RequestKind, Response, ResponseKind, SessionConfig,
    },
    session::{events::EventSink, executor, negotiation::Backend, probe::CapabilityProbe},
};

enum Terminal {
    Ready(SessionConfig),
    Done(GenerationOutcome),
}

struct PendingEntry {
    resolver: oneshot::Sender<Result<Terminal, SessionError>>,
    sink: Arc<dyn EventSink>,
}

struct ExecutorHandle {
    epoch: u64,
    requests: mpsc::UnboundedSender<Request>,
    task: AbortHandle,
    pump: JoinHandle<()>,
}

impl ExecutorHandle {
    fn terminate(self) {
        self.task.abort();
        self.pump.abort();
    }
}

#[derive(Default)]
struct ControllerState {
    executor: Option<ExecutorHandle>,
    pending: HashMap<RequestId, PendingEntry>,
    generation: Option<RequestId>,
    config: Option<SessionConfig>,
    epochs: u64,
}

impl ControllerState {
    fn drain_pending(&mut self) -> Vec<PendingEntry> {
        self.pending.drain().map(|(_, entry)| entry).collect()
    }
}

pub struct SessionController {
    engine: Arc<dyn InferenceEngine>,
    probe: Arc<dyn CapabilityProbe>,
    timeouts: SessionTimeouts,
    ids: RequestIdGenerator,
    state: Arc<Mutex<ControllerState>>,
}

impl SessionController {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        probe: Arc<dyn CapabilityProbe>,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            engine,
            probe,
            timeouts,
            ids: RequestIdGenerator::new(),
            state: Arc::new(Mutex::new(ControllerState::default())),
        }
    }

    /// Configuration committed by the last successful init, if still valid.
    pub fn config(&self) -> Option<SessionConfig> {
        self.state.lock().config.clone()
    }

    pub fn has_executor(&self) -> bool {
        self.state.lock().executor.is_some()
    }

    pub fn is_generating(&self) -> bool {
        self.state.lock().generation.is_some()
    }

    /// Negotiates a session. A restart-required failure on a non-safe backend
    /// is retried once in a fresh executor forced to the safe backend.
    pub async fn init(
        &self,
        payload: InitPayload,
        sink: Arc<dyn EventSink>,
    ) -> Result<SessionConfig, SessionError> {
        self.state.lock().config = None;
        info!(model_id = %payload.model_id, backend = %payload.backend, precision = %payload.precision, "initializing session");

        let outcome = match self
            .request(RequestKind::Init(payload.clone()), sink.clone())
            .await
        {
            Err(err) if err.requires_restart() && !payload.backend.is_safe() => {
                warn!(error = %err, "restarting executor on the safe backend");
                self.reset("restarting on the safe backend");
                let retry = InitPayload {
                    backend: Backend::Safe,
                    ..payload
                };
                self.request(RequestKind::Init(retry), sink).await
            }
            other => other,
        };

        let config = match outcome? {
            Terminal::Ready(config) => config,
            Terminal::Done(_) => return Err(SessionError::UnexpectedResponse("DONE")),
        };
        self.state.lock().config = Some(config.clone());
        Ok(config)
    }

    /// Runs one generation, forwarding streamed tokens to `sink`.
    pub async fn generate(
        &self,
        payload: GeneratePayload,
        sink: Arc<dyn EventSink>,
    ) -> Result<GenerationOutcome, SessionError> {
        match self.request(RequestKind::Generate(payload), sink).await? {
            Terminal::Done(outcome) => Ok(outcome),
            Terminal::Ready(_) => Err(SessionError::UnexpectedResponse("READY")),
        }
    }

    /// Asks the executor to stop the outstanding generation. Returns `false`
    /// when there is nothing to abort.
    pub fn abort(&self) -> bool {
        let state = self.state.lock();
        let (Some(target), Some(executor)) = (state.generation.clone(), state.executor.as_ref())
        else {
            debug!("abort ignored, no generation in flight");
            return false;
        };

        let request = Request {
            request_id: self.ids.next_id(),
            kind: RequestKind::Abort(AbortPayload {
                target_request_id: Some(target),
            }),
        };
        executor.requests.send(request).is_ok()
    }

    /// Discards the executor and rejects every pending request with `reason`.
    pub fn reset(&self, reason: &str) {
        let (executor, orphaned) = {
            let mut state = self.state.lock();
            state.config = None;
            state.generation = None;
            (state.executor.take(), state.drain_pending())
        };

        if let Some(executor) = executor {
            info!(epoch = executor.epoch, reason, "discarding executor");
            executor.terminate();
        }
        for entry in orphaned {
            let _ = entry
                .resolver
                .send(Err(SessionError::Reset(reason.to_string())));
        }
    }

    async fn request(
        &self,
        kind: RequestKind,
        sink: Arc<dyn EventSink>,
    ) -> Result<Terminal, SessionError> {
        let request_id = self.ids.next_id();
        let (resolver, resolved) = oneshot::channel();

        {
            let mut state = self.state.lock();
            let is_generation = matches!(kind, RequestKind::Generate(_));
            if is_generation {
                if state.generation.is_some() {
                    return Err(SessionError::GenerationInProgress);
                }
                if state.config.is_none() {
                    return Err(SessionError::NotInitialized);
                }
                state.generation = Some(request_id.clone());
            }

            let requests = self.ensure_executor(&mut state);
            state
                .pending
                .insert(request_id.clone(), PendingEntry { resolver, sink });

            debug!(%request_id, "-> request");
            if requests.send(Request { request_id: request_id.clone(), kind }).is_err() {
                state.pending.remove(&request_id);
                if is_generation {
                    state.generation = None;
                }
                return Err(SessionError::ExecutorCrash);
            }
        }

        resolved.await.map_err(|_| SessionError::ExecutorCrash)?
    }

    fn ensure_executor(&self, state: &mut ControllerState) -> mpsc::UnboundedSender<Request> {
        if let Some(executor) = &state.executor {
            return executor.requests.clone();
        }

        state.epochs += 1;
        let epoch = state.epochs;
        let channels = executor::spawn(self.engine.clone(), self.probe.clone(), self.timeouts);
        let task = channels.task.abort_handle();
        let pump = tokio::spawn(pump(
            Arc::downgrade(&self.state),
            epoch,
            channels.responses,
            channels.task,
        ));
        info!(epoch, "spawned executor");

        let requests = channels.requests.clone();
        state.executor = Some(ExecutorHandle {
            epoch,
            requests: channels.requests,
            task,
            pump,
        });
        requests
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(executor) = self.state.lock().executor.take() {
            executor.terminate();
        }
    }
}

/// Routes executor responses to pending entries and watches for the executor
/// task exiting underneath the controller.
async fn pump(
    state: Weak<Mutex<ControllerState>>,
    epoch: u64,
    mut responses: mpsc::UnboundedReceiver<Response>,
    mut task: JoinHandle<()>,
) {
    let exit = loop {
        tokio::select! {
            biased;
            Some(response) = responses.recv() => {
                let Some(state) = state.upgrade() else { return };
                dispatch(&state, response);
            }
            exit = &mut task => break exit,
        }
    };

    let Some(state) = state.upgrade() else { return };
    while let Ok(response) = responses.try_recv() {
        dispatch(&state, response);
    }

    match exit {
        Err(err) if err.is_panic() => error!(epoch, "executor panicked"),
        _ => warn!(epoch, "executor exited unexpectedly"),
    }

    let orphaned = {
        let mut guard = state.lock();
        if guard.executor.as_ref().is_some_and(|e| e.epoch == epoch) {
            guard.executor = None;
            guard.config = None;
            guard.generation = None;
            guard.drain_pending()
        } else {
            Vec::new()
        }
    };
    for entry in orphaned {
        let _ = entry.resolver.send(Err(SessionError::ExecutorCrash));
    }
}

fn dispatch(state: &Mutex<ControllerState>, response: Response) {
    let Response { request_id, kind } = response;
    match kind {
        ResponseKind::Token(token) => {
            if let Some(sink) = sink_for(state, &request_id) {
                sink.on_token(&token);
            }
        }
        ResponseKind::Status(status) => {
            if let Some(sink) = sink_for(state, &request_id) {
                sink.on_status(&status);
            }
        }
        ResponseKind::Banner(banner) => {
            if let Some(sink) = sink_for(state, &request_id) {
                sink.on_banner(&banner);
            }
        }
        ResponseKind::Ready { config } => settle(state, &request_id, Ok(Terminal::Ready(config))),
        ResponseKind::Done(done) => {
            if let Some(config) = done.config.clone() {
                let mut guard = state.lock();
                if guard.generation.as_ref() == Some(&request_id) {
                    guard.config = Some(config);
                }
            }
            settle(state, &request_id, Ok(Terminal::Done(done.into_outcome())));
        }
        ResponseKind::Error(payload) => {
            {
                let mut guard = state.lock();
                if guard.generation.as_ref() == Some(&request_id) {
                    guard.config = payload.config.clone();
                }
            }
            settle(state, &request_id, Err(SessionError::from(payload)));
        }
    }
}

fn sink_for(state: &Mutex<ControllerState>, request_id: &RequestId) -> Option<Arc<dyn EventSink>> {
    state
        .lock()
        .pending
        .get(request_id)
        .map(|entry| entry.sink.clone())
}

fn settle(
    state: &Mutex<ControllerState>,
    request_id: &RequestId,
    result: Result<Terminal, SessionError>,
) {
    let entry = {
        let mut guard = state.lock();
        if guard.generation.as_ref() == Some(request_id) {
            guard.generation = None;
        }
        guard.pending.remove(request_id)
    };

    match entry {
        Some(entry) => {
            let _ = entry.resolver.send(result);
        }
        None => debug!(%request_id, "terminal response for unknown request"),
    }
}
