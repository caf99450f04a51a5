//! TorchScript engine: one traced causal LM per precision, decoded greedily
//! or by temperature sampling.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    model::{
        BuildSpec, EngineError, InferenceEngine, ModelHandle, ProgressFn, RunOutput, RunParams,
        TokenStreamer,
    },
    session::{
        negotiation::{Backend, BuildProgress},
        probe::CapabilityProbe,
        text::REPLACEMENT_CHAR,
    },
};

const EOS_TOKEN: i64 = 50256;
const TOKENIZER_FILE: &str = "tokenizer.json";

static CUDA_AVAILABLE: Lazy<bool> = Lazy::new(tch::Cuda::is_available);

/// Reports CUDA presence as accelerated-backend availability.
#[derive(Debug, Clone, Copy, Default)]
pub struct TchProbe;

#[async_trait]
impl CapabilityProbe for TchProbe {
    async fn accelerated_backend_available(&self) -> bool {
        *CUDA_AVAILABLE
    }
}

/// Loads `<model_dir>/<model_id>/model_<precision>.pt` plus its `tokenizer.json`.
#[derive(Debug, Clone)]
pub struct TchEngine {
    model_dir: PathBuf,
}

impl TchEngine {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    fn model_root(&self, model_id: &str) -> Result<PathBuf, EngineError> {
        if model_id.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(EngineError::Failed(format!("invalid model id '{model_id}'")));
        }
        Ok(self.model_dir.join(model_id))
    }
}

fn device_for(backend: Backend) -> Result<Device, EngineError> {
    match backend {
        Backend::Safe => Ok(Device::Cpu),
        Backend::Accelerated if *CUDA_AVAILABLE => Ok(Device::Cuda(0)),
        Backend::Accelerated => Err(EngineError::BackendUnavailable(
            "no CUDA device available".into(),
        )),
    }
}

#[async_trait]
impl InferenceEngine for TchEngine {
    async fn build(
        &self,
        spec: &BuildSpec,
        progress: Option<ProgressFn>,
    ) -> Result<Box<dyn ModelHandle>, EngineError> {
        let device = device_for(spec.backend)?;
        let root = self.model_root(&spec.model_id)?;
        let module_path = root.join(format!("model_{}.pt", spec.precision));
        if !module_path.exists() {
            return Err(EngineError::MissingResource {
                precision: spec.precision,
                detail: module_path.display().to_string(),
            });
        }

        let tokenizer_path = root.join(TOKENIZER_FILE);
        let precision = spec.precision;
        let handle = tokio::task::spawn_blocking(move || {
            TchHandle::load(&module_path, &tokenizer_path, device, progress)
        })
        .await
        .map_err(|e| EngineError::Failed(format!("model load task failed: {e}")))??;

        info!(model = %spec.model_id, %precision, ?device, "torchscript module loaded");
        Ok(Box::new(handle))
    }
}

struct Loaded {
    module: Mutex<tch::CModule>,
    tokenizer: Tokenizer,
    device: Device,
}

pub struct TchHandle {
    inner: Arc<Loaded>,
}

impl TchHandle {
    fn load(
        module_path: &Path,
        tokenizer_path: &Path,
        device: Device,
        mut progress: Option<ProgressFn>,
    ) -> Result<Self, EngineError> {
        let module_bytes = fs::metadata(module_path)
            .map_err(|e| EngineError::Failed(e.to_string()))?
            .len();
        let tokenizer_bytes = fs::metadata(tokenizer_path)
            .map_err(|_| EngineError::Failed(format!(
                "could not locate file: {}",
                tokenizer_path.display()
            )))?
            .len();
        let total = module_bytes + tokenizer_bytes;
        let mut report = |loaded: u64| {
            if let Some(progress) = progress.as_mut() {
                progress(BuildProgress::Bytes { loaded, total });
            }
        };

        report(0);
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| EngineError::Failed(format!("tokenizer: {e}")))?;
        report(tokenizer_bytes);

        let mut module = tch::CModule::load_on_device(module_path, device)
            .map_err(|e| EngineError::Failed(e.to_string()))?;
        module.set_eval();
        report(total);

        Ok(Self {
            inner: Arc::new(Loaded {
                module: Mutex::new(module),
                tokenizer,
                device,
            }),
        })
    }
}

#[async_trait]
impl ModelHandle for TchHandle {
    async fn run(
        &self,
        prompt: &str,
        params: &RunParams,
        streamer: Option<TokenStreamer>,
    ) -> Result<RunOutput, EngineError> {
        let inner = self.inner.clone();
        let prompt = prompt.to_string();
        let params = params.clone();

        tokio::task::spawn_blocking(move || inner.decode(&prompt, &params, streamer))
            .await
            .map_err(|e| EngineError::Failed(format!("generation task failed: {e}")))?
    }
}

impl Loaded {
    fn decode(
        &self,
        prompt: &str,
        params: &RunParams,
        mut streamer: Option<TokenStreamer>,
    ) -> Result<RunOutput, EngineError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| EngineError::Failed(format!("tokenizer: {e}")))?;
        let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if ids.is_empty() {
            ids.push(EOS_TOKEN);
        }
        let prompt_len = ids.len();
        let mut emitted = String::new();

        no_grad(|| {
            let module = self.module.lock();
            for _ in 0..params.max_new_tokens {
                let input = Tensor::from_slice(&ids)
                    .reshape([1, ids.len() as i64])
                    .to(self.device);
                let output = module
                    .forward_is(&[IValue::Tensor(input)])
                    .map_err(|e| EngineError::Failed(e.to_string()))?;
                let logits = match output {
                    IValue::Tensor(t) => t,
                    IValue::Tuple(ref items) => match items.first() {
                        Some(IValue::Tensor(t)) => t.shallow_clone(),
                        _ => return Err(EngineError::Failed("unexpected module output".into())),
                    },
                    _ => return Err(EngineError::Failed("unexpected module output".into())),
                };

                let last = logits
                    .select(1, -1)
                    .squeeze()
                    .to_kind(Kind::Float)
                    .to(Device::Cpu);
                let mut scores = Vec::<f32>::try_from(&last)
                    .map_err(|e| EngineError::Failed(e.to_string()))?;
                penalize(&mut scores, &ids[prompt_len..], params);

                let next = pick_token(&scores, params)?;
                if next == EOS_TOKEN {
                    break;
                }
                ids.push(next);

                if let Some(streamer) = streamer.as_mut() {
                    let text = self.decode_ids(&ids[prompt_len..])?;
                    if let Some(fragment) = next_fragment(&text, &emitted) {
                        streamer(fragment)?;
                        emitted = text;
                    }
                }
            }
            Ok::<(), EngineError>(())
        })?;

        debug!(generated = ids.len() - prompt_len, "decode finished");
        Ok(RunOutput::Text(self.decode_ids(&ids[prompt_len..])?))
    }

    fn decode_ids(&self, ids: &[i64]) -> Result<String, EngineError> {
        let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| EngineError::Failed(format!("tokenizer: {e}")))
    }
}

/// New text to stream after `emitted`. Byte-level tokenizers decode an
/// unfinished multi-byte character to U+FFFD, so emission waits until the
/// tail is complete and the decoded prefix matches what was already sent.
fn next_fragment<'a>(decoded: &'a str, emitted: &str) -> Option<&'a str> {
    if decoded.ends_with(REPLACEMENT_CHAR) {
        return None;
    }
    decoded
        .strip_prefix(emitted)
        .filter(|fragment| !fragment.is_empty())
}

fn penalize(scores: &mut [f32], generated: &[i64], params: &RunParams) {
    if params.repetition_penalty > 1.0 {
        let penalty = params.repetition_penalty as f32;
        let seen: HashSet<i64> = generated.iter().copied().collect();
        for id in seen {
            if let Some(score) = scores.get_mut(id as usize) {
                *score = if *score > 0.0 {
                    *score / penalty
                } else {
                    *score * penalty
                };
            }
        }
    }

    let n = params.no_repeat_ngram;
    if n > 0 && generated.len() + 1 >= n {
        let prefix = &generated[generated.len() + 1 - n..];
        for window in generated.windows(n) {
            if &window[..n - 1] == prefix {
                if let Some(score) = scores.get_mut(window[n - 1] as usize) {
                    *score = f32::NEG_INFINITY;
                }
            }
        }
    }
}

fn pick_token(scores: &[f32], params: &RunParams) -> Result<i64, EngineError> {
    if !params.do_sample || params.temperature <= 0.0 {
        return scores
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_finite())
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, _)| idx as i64)
            .ok_or_else(|| EngineError::Failed("no candidate token".into()));
    }

    let scaled = Tensor::from_slice(scores) / params.temperature;
    let sampled = scaled
        .softmax(-1, Kind::Float)
        .multinomial(1, false)
        .int64_value(&[0]);
    Ok(sampled)
}
