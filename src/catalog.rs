use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    config::GenerationSettings,
    error::SessionError,
    protocol::InitPayload,
    session::negotiation::{Backend, Precision},
};

const TASK_TEXT_GENERATION: &str = "text-generation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub display_name: String,
    #[serde(default = "default_task")]
    pub task: String,
    #[serde(default)]
    pub recommended: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_precision")]
    pub default_precision: Precision,
    #[serde(default = "default_backend")]
    pub preferred_backend: Backend,
    #[serde(default)]
    pub approx_download_size_mb: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_task() -> String {
    TASK_TEXT_GENERATION.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_precision() -> Precision {
    Precision::Auto
}

fn default_backend() -> Backend {
    Backend::Safe
}

/// Ordered, read-only list of models a session can be initialized with.
#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn load_from_path(path: &Path) -> Result<Self, SessionError> {
        let raw = fs::read_to_string(path)?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&raw)
            .map_err(|e| SessionError::BadRequest(format!("invalid catalog file: {e}")))?;
        if entries.is_empty() {
            return Err(SessionError::BadRequest(
                "catalog must list at least one model".into(),
            ));
        }
        Ok(Self { entries })
    }

    pub fn fallback() -> Self {
        Self::new(vec![CatalogEntry {
            id: "Xenova/distilgpt2".to_string(),
            display_name: "DistilGPT-2 (tiny)".to_string(),
            task: default_task(),
            recommended: true,
            enabled: true,
            default_precision: Precision::Q8,
            preferred_backend: Backend::Accelerated,
            approx_download_size_mb: Some(80),
            notes: Some(
                "Good starter model for quick demos. Falls back to the safe backend if acceleration is unavailable."
                    .to_string(),
            ),
        }])
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// First enabled entry, preferring recommended ones.
    pub fn default_entry(&self) -> Option<&CatalogEntry> {
        let mut enabled = self.entries.iter().filter(|e| e.enabled);
        self.entries
            .iter()
            .find(|e| e.enabled && e.recommended)
            .or_else(|| enabled.next())
    }

    /// Entry to initialize: an explicitly requested model must exist and be
    /// enabled. Otherwise the configured model is used when listed, then the
    /// default entry.
    pub fn pick(
        &self,
        requested: Option<&str>,
        configured: &str,
    ) -> Result<&CatalogEntry, SessionError> {
        let enabled = |id: &str| self.get(id).filter(|e| e.enabled);
        match requested {
            Some(id) => enabled(id)
                .ok_or_else(|| SessionError::BadRequest(format!("unknown model '{id}'"))),
            None => enabled(configured)
                .or_else(|| self.default_entry())
                .ok_or_else(|| SessionError::BadRequest("catalog has no enabled model".into())),
        }
    }
}

impl CatalogEntry {
    /// Init parameters for this model. The settings precision wins unless it
    /// is `auto`, in which case the entry's default applies. A backend
    /// override replaces the entry's preferred backend.
    pub fn init_payload(
        &self,
        settings: &GenerationSettings,
        backend: Option<Backend>,
    ) -> InitPayload {
        let precision = match settings.precision {
            Precision::Auto => self.default_precision,
            chosen => chosen,
        };

        InitPayload {
            model_id: self.id.clone(),
            precision,
            backend: backend.unwrap_or(self.preferred_backend),
        }
    }
}
