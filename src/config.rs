use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::session::negotiation::{Backend, Precision};

pub const MAX_NEW_TOKENS_RANGE: (usize, usize) = (1, 512);
pub const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);

/// Deadlines raced against every long executor operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub init: Duration,
    pub generate: Duration,
    pub warmup: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(120),
            generate: Duration::from_secs(120),
            warmup: Duration::from_secs(60),
        }
    }
}

/// User-tunable generation settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub precision: Precision,
    pub max_new_tokens: usize,
    pub temperature: f64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            precision: Precision::Auto,
            max_new_tokens: 128,
            temperature: 0.7,
        }
    }
}

impl GenerationSettings {
    /// Clamps numeric fields into their accepted ranges.
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        let temperature = if self.temperature.is_finite() {
            self.temperature.clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1)
        } else {
            defaults.temperature
        };
        Self {
            precision: self.precision,
            max_new_tokens: self
                .max_new_tokens
                .clamp(MAX_NEW_TOKENS_RANGE.0, MAX_NEW_TOKENS_RANGE.1),
            temperature,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub model_dir: PathBuf,
    pub catalog_path: Option<PathBuf>,
    /// Operator override for every catalog entry's preferred backend.
    pub backend: Option<Backend>,
    pub settings: GenerationSettings,
    pub timeouts: SessionTimeouts,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let model_id = env::var("MODEL_ID").unwrap_or_else(|_| "Xenova/distilgpt2".to_string());
        let model_dir = PathBuf::from(env::var("MODEL_DIR").unwrap_or_else(|_| "models".into()));
        let catalog_path = env::var("CATALOG_PATH").ok().map(PathBuf::from);

        let backend = env_parse::<Backend>("BACKEND");

        let defaults = GenerationSettings::default();
        let settings = GenerationSettings {
            precision: env::var("PRECISION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.precision),
            max_new_tokens: env_parse("MAX_NEW_TOKENS").unwrap_or(defaults.max_new_tokens),
            temperature: env_parse("TEMPERATURE").unwrap_or(defaults.temperature),
        }
        .normalized();

        let default_timeouts = SessionTimeouts::default();
        let timeouts = SessionTimeouts {
            init: env_secs("INIT_TIMEOUT_SECS").unwrap_or(default_timeouts.init),
            generate: env_secs("GENERATE_TIMEOUT_SECS").unwrap_or(default_timeouts.generate),
            warmup: env_secs("WARMUP_TIMEOUT_SECS").unwrap_or(default_timeouts.warmup),
        };

        Ok(Self {
            listen_addr,
            model_id,
            model_dir,
            catalog_path,
            backend,
            settings,
            timeouts,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
