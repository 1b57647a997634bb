use serde::{Deserialize, Serialize};

use crate::error::{ChatError, CoreResult};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Sampling parameters handed to the backend for one generation session.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 200,
            temperature: 0.7,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_tokens == 0 {
            return Err(ChatError::Validation(
                "max_tokens must be a positive integer".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ChatError::Validation(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Body of `POST /api/chat` as received from the client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ChatRequest {
    /// Split into the conversation and the effective parameters, filling
    /// omitted fields from `defaults`. Fails before any backend call.
    pub fn into_parts(self, defaults: GenerationParams) -> CoreResult<(Vec<Message>, GenerationParams)> {
        if self.messages.is_empty() {
            return Err(ChatError::Validation("Messages cannot be empty".into()));
        }
        let params = GenerationParams {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
        };
        params.validate()?;
        Ok((self.messages, params))
    }
}
