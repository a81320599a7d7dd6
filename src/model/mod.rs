//! Generative model abstraction.
//!
//! Handlers never talk to Gemini directly. They ask a [`ModelProvider`] for a
//! [`GenerativeModel`], which is where the credential check happens, and then
//! send it a list of [`Part`]s.

mod gemini;

#[cfg(test)]
pub(crate) mod fake;

pub use gemini::{Gemini, GeminiProvider};

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

/// One piece of a multimodal prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: Vec<u8> },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Could not build model endpoint")]
    Endpoint(#[from] url::ParseError),

    #[error("Could not send request to model API")]
    Request(#[from] reqwest::Error),

    #[error("Model API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Could not decode model API response")]
    Decode(#[from] serde_json::Error),

    #[error("Model response contained no text")]
    EmptyResponse,

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait GenerativeModel: Send + Sync + fmt::Debug {
    /// Sends `parts` as one user turn and returns the text of the reply.
    ///
    /// `timeout` bounds the whole call; `None` leaves the client default.
    async fn generate_content(
        &self,
        parts: &[Part],
        timeout: Option<Duration>,
    ) -> Result<String, ModelError>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
#[error("Gemini API key is not configured")]
pub struct MissingApiKey;

/// Hands out a ready-to-use model, or fails when no credential is configured.
pub trait ModelProvider: Send + Sync + fmt::Debug {
    fn model(&self) -> Result<Arc<dyn GenerativeModel>, MissingApiKey>;
}
