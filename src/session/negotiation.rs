use std::{fmt, str::FromStr, time::Duration, time::Instant};

use serde::{Deserialize, Serialize};

/// Minimum spacing between two fetch-progress updates.
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[serde(alias = "webgpu", alias = "cuda")]
    Accelerated,
    #[serde(alias = "wasm", alias = "cpu")]
    Safe,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Accelerated => "accelerated",
            Backend::Safe => "safe",
        }
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Backend::Safe)
    }

    /// Precision substituted when the requested one is `auto` or unsupported.
    pub fn default_precision(&self) -> Precision {
        match self {
            Backend::Accelerated => Precision::Fp16,
            Backend::Safe => Precision::Q8,
        }
    }

    pub fn supports(&self, precision: Precision) -> bool {
        match self {
            Backend::Accelerated => matches!(precision, Precision::Fp16 | Precision::Fp32),
            Backend::Safe => precision != Precision::Auto,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "accelerated" | "webgpu" | "cuda" | "gpu" => Ok(Backend::Accelerated),
            "safe" | "wasm" | "cpu" => Ok(Backend::Safe),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Auto,
    Fp32,
    Fp16,
    Q8,
    Q4,
    Q4f16,
    Int8,
    Uint8,
    Bnb4,
}

impl Precision {
    pub const ALL: [Precision; 9] = [
        Precision::Auto,
        Precision::Fp32,
        Precision::Fp16,
        Precision::Q8,
        Precision::Q4,
        Precision::Q4f16,
        Precision::Int8,
        Precision::Uint8,
        Precision::Bnb4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Auto => "auto",
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Q8 => "q8",
            Precision::Q4 => "q4",
            Precision::Q4f16 => "q4f16",
            Precision::Int8 => "int8",
            Precision::Uint8 => "uint8",
            Precision::Bnb4 => "bnb4",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lower = raw.trim().to_lowercase();
        Precision::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| format!("unknown precision '{raw}'"))
    }
}

/// Outcome of negotiating a requested backend/precision pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub backend: Backend,
    pub precision: Precision,
    /// Precisions to try in order when `precision` has no resource on `backend`.
    pub fallbacks: Vec<Precision>,
}

/// Resolves a request against the compatibility table. Total: every input
/// yields a concrete backend and a non-`auto` precision.
pub fn resolve(
    requested_backend: Backend,
    requested_precision: Precision,
    accelerated_available: bool,
) -> Resolution {
    let backend = match requested_backend {
        Backend::Accelerated if !accelerated_available => Backend::Safe,
        other => other,
    };

    let precision = if backend.supports(requested_precision) {
        requested_precision
    } else {
        backend.default_precision()
    };

    Resolution {
        backend,
        precision,
        fallbacks: precision_fallbacks(backend, precision),
    }
}

/// Ordered precisions to try after `committed` is missing. Only the safe
/// backend retries in place.
pub fn precision_fallbacks(backend: Backend, committed: Precision) -> Vec<Precision> {
    if !backend.is_safe() {
        return Vec::new();
    }

    let order: &[Precision] = match committed {
        Precision::Q8 => &[Precision::Int8, Precision::Uint8, Precision::Q4, Precision::Q4f16],
        Precision::Q4 => &[Precision::Q4f16, Precision::Bnb4, Precision::Int8, Precision::Uint8],
        _ => &[
            Precision::Int8,
            Precision::Uint8,
            Precision::Q4,
            Precision::Q4f16,
            Precision::Bnb4,
        ],
    };

    let mut out: Vec<Precision> = Vec::with_capacity(order.len());
    for &candidate in order {
        if candidate != committed && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

/// Raw progress report from the inference dependency while it fetches artifacts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BuildProgress {
    /// Either a fraction in `[0, 1]` or a percentage in `(1, 100]`.
    Ratio(f64),
    Bytes { loaded: u64, total: u64 },
}

impl BuildProgress {
    pub fn percent(&self) -> Option<u8> {
        let raw = match *self {
            BuildProgress::Ratio(value) if value > 1.0 && value <= 100.0 => value,
            BuildProgress::Ratio(value) if (0.0..=1.0).contains(&value) => value * 100.0,
            BuildProgress::Ratio(_) => return None,
            BuildProgress::Bytes { total: 0, .. } => return None,
            BuildProgress::Bytes { loaded, total } => loaded as f64 / total as f64 * 100.0,
        };
        Some(raw.clamp(0.0, 100.0).round() as u8)
    }
}

/// Rate limiter for fetch-progress status updates: at most one update per
/// [`PROGRESS_THROTTLE`]. A completion that lands inside the window is held
/// so it can be published once the window has passed.
#[derive(Debug, Default)]
pub struct ProgressThrottle {
    last: Option<(u8, Instant)>,
    held: Option<u8>,
}

impl ProgressThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the percentage to publish, or `None` when the update should be dropped.
    pub fn admit(&mut self, progress: BuildProgress, now: Instant) -> Option<u8> {
        let percent = progress.percent()?;
        if let Some((last_percent, last_at)) = self.last {
            if now.duration_since(last_at) < PROGRESS_THROTTLE {
                if percent == 100 && last_percent != 100 {
                    self.held = Some(percent);
                }
                return None;
            }
        }
        self.last = Some((percent, now));
        self.held = None;
        Some(percent)
    }

    /// Takes the held completion, with how long to wait before it may be published.
    pub fn take_held(&mut self, now: Instant) -> Option<(u8, Duration)> {
        let percent = self.held.take()?;
        let wait = self
            .last
            .map(|(_, at)| PROGRESS_THROTTLE.saturating_sub(now.duration_since(at)))
            .unwrap_or_default();
        self.last = Some((percent, now + wait));
        Some((percent, wait))
    }
}
