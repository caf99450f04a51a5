use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling options handed to the inference dependency for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub do_sample: bool,
    pub repetition_penalty: f64,
    pub no_repeat_ngram: usize,
}

impl RunParams {
    pub fn for_generation(max_new_tokens: usize, temperature: f64) -> Self {
        Self {
            max_new_tokens,
            temperature,
            do_sample: temperature > 0.0,
            repetition_penalty: 1.1,
            no_repeat_ngram: 3,
        }
    }

    /// Single greedy token, used to force lazy compilation after a build.
    pub fn warmup() -> Self {
        Self {
            max_new_tokens: 1,
            temperature: 0.0,
            do_sample: false,
            repetition_penalty: 1.0,
            no_repeat_ngram: 0,
        }
    }
}

/// Final return value of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutput {
    /// Generated text, possibly prefixed by the prompt.
    Text(String),
    /// Chat-style transcript whose last entry is the reply.
    Messages(Vec<ChatMessage>),
}
