// Scripted inference engine shared by the integration tests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use local_llm_session::{
    config::SessionTimeouts,
    model::{
        BuildSpec, EngineError, InferenceEngine, ModelHandle, ProgressFn, RunOutput, RunParams,
        TokenStreamer,
    },
    protocol::{GeneratePayload, InitPayload},
    session::{
        Backend, CapabilityProbe, Precision, SessionController, StaticProbe,
        negotiation::BuildProgress,
    },
};

pub const MODEL_ID: &str = "Xenova/distilgpt2";
pub const PROMPT: &str = "User: tell me something\nAssistant:";

/// What a handle built on one backend produces.
#[derive(Clone)]
pub struct Reply {
    pub fragments: Vec<String>,
    pub output: RunOutput,
    /// Waits on the engine gate before streaming this fragment index.
    pub pause_before: Option<usize>,
}

impl Reply {
    pub fn streamed(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            output: RunOutput::Text(fragments.concat()),
            pause_before: None,
        }
    }

    pub fn silent(output: RunOutput) -> Self {
        Self {
            fragments: Vec::new(),
            output,
            pause_before: None,
        }
    }

    pub fn paused_before(mut self, idx: usize) -> Self {
        self.pause_before = Some(idx);
        self
    }
}

pub struct ScriptedEngine {
    missing: Vec<(Backend, Precision)>,
    broken: Vec<Backend>,
    build_delay: Option<Duration>,
    warmup_delay: Option<Duration>,
    replies: HashMap<Backend, Reply>,
    crash_on_generate: bool,
    gate: Arc<Notify>,
    cancellations: Arc<AtomicUsize>,
    builds: Mutex<Vec<BuildSpec>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            missing: Vec::new(),
            broken: Vec::new(),
            build_delay: None,
            warmup_delay: None,
            replies: HashMap::new(),
            crash_on_generate: false,
            gate: Arc::new(Notify::new()),
            cancellations: Arc::new(AtomicUsize::new(0)),
            builds: Mutex::new(Vec::new()),
        }
    }

    pub fn missing(mut self, backend: Backend, precision: Precision) -> Self {
        self.missing.push((backend, precision));
        self
    }

    pub fn broken(mut self, backend: Backend) -> Self {
        self.broken.push(backend);
        self
    }

    pub fn build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    pub fn warmup_delay(mut self, delay: Duration) -> Self {
        self.warmup_delay = Some(delay);
        self
    }

    pub fn reply(mut self, backend: Backend, reply: Reply) -> Self {
        self.replies.insert(backend, reply);
        self
    }

    pub fn crash_on_generate(mut self) -> Self {
        self.crash_on_generate = true;
        self
    }

    pub fn gate(&self) -> Arc<Notify> {
        self.gate.clone()
    }

    /// Runs that stopped because the token streamer refused a fragment.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    pub fn builds(&self) -> Vec<(Backend, Precision)> {
        self.builds
            .lock()
            .iter()
            .map(|spec| (spec.backend, spec.precision))
            .collect()
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn build(
        &self,
        spec: &BuildSpec,
        progress: Option<ProgressFn>,
    ) -> Result<Box<dyn ModelHandle>, EngineError> {
        self.builds.lock().push(spec.clone());

        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        if self.broken.contains(&spec.backend) {
            return Err(EngineError::BackendUnavailable("device lost".into()));
        }
        if self.missing.contains(&(spec.backend, spec.precision)) {
            return Err(EngineError::Failed(format!(
                "Could not locate file: onnx/model_{}.onnx",
                spec.precision
            )));
        }

        if let Some(mut progress) = progress {
            progress(BuildProgress::Ratio(0.4));
            progress(BuildProgress::Ratio(1.0));
        }

        let reply = self
            .replies
            .get(&spec.backend)
            .cloned()
            .unwrap_or_else(|| Reply::streamed(&["Hello", " there"]));
        Ok(Box::new(ScriptedHandle {
            reply,
            gate: self.gate.clone(),
            cancellations: self.cancellations.clone(),
            warmup_delay: self.warmup_delay,
            crash_on_generate: self.crash_on_generate,
        }))
    }
}

struct ScriptedHandle {
    reply: Reply,
    gate: Arc<Notify>,
    cancellations: Arc<AtomicUsize>,
    warmup_delay: Option<Duration>,
    crash_on_generate: bool,
}

#[async_trait]
impl ModelHandle for ScriptedHandle {
    async fn run(
        &self,
        _prompt: &str,
        params: &RunParams,
        streamer: Option<TokenStreamer>,
    ) -> Result<RunOutput, EngineError> {
        let warm_up = streamer.is_none() && params.max_new_tokens == 1;
        if warm_up {
            if let Some(delay) = self.warmup_delay {
                tokio::time::sleep(delay).await;
            }
            return Ok(RunOutput::Text(String::new()));
        }
        if self.crash_on_generate {
            panic!("scripted executor crash");
        }

        if let Some(mut streamer) = streamer {
            for (idx, fragment) in self.reply.fragments.iter().enumerate() {
                if self.reply.pause_before == Some(idx) {
                    self.gate.notified().await;
                }
                if let Err(err) = streamer(fragment) {
                    self.cancellations.fetch_add(1, Ordering::SeqCst);
                    return Err(err);
                }
                tokio::task::yield_now().await;
            }
        } else if self.reply.pause_before.is_some() {
            self.gate.notified().await;
        }
        Ok(self.reply.output.clone())
    }
}

pub fn controller(
    engine: Arc<ScriptedEngine>,
    accelerated_available: bool,
    timeouts: SessionTimeouts,
) -> Arc<SessionController> {
    let probe: Arc<dyn CapabilityProbe> = Arc::new(StaticProbe(accelerated_available));
    Arc::new(SessionController::new(engine, probe, timeouts))
}

pub fn init_payload(backend: Backend, precision: Precision) -> InitPayload {
    InitPayload {
        model_id: MODEL_ID.to_string(),
        precision,
        backend,
    }
}

pub fn generate_payload() -> GeneratePayload {
    GeneratePayload {
        prompt: PROMPT.to_string(),
        max_new_tokens: 32,
        temperature: 0.0,
    }
}
