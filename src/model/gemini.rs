use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use log::{debug, trace};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{GenerativeModel, MissingApiKey, ModelError, ModelProvider, Part};
use crate::config::{gemini_api_key, GeminiSettings};

/// Resolves `GEMINI_API_KEY` on every [`ModelProvider::model`] call.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    settings: GeminiSettings,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(settings: GeminiSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }
}

impl ModelProvider for GeminiProvider {
    fn model(&self) -> Result<Arc<dyn GenerativeModel>, MissingApiKey> {
        let api_key = gemini_api_key().ok_or(MissingApiKey)?;

        Ok(Arc::new(Gemini {
            client: self.client.clone(),
            api_key,
            api_base: self.settings.api_base.clone(),
            model: self.settings.model.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct Gemini {
    client: reqwest::Client,
    api_key: Secret<String>,
    api_base: String,
    model: String,
}

impl Gemini {
    fn endpoint(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!(
            "{}/models/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            self.model
        ))
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Text {
        text: &'a str,
    },
    #[serde(rename_all = "camelCase")]
    InlineData { inline_data: Blob<'a> },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob<'a> {
    mime_type: &'a str,
    data: String,
}

impl<'a> From<&'a Part> for RequestPart<'a> {
    fn from(part: &'a Part) -> Self {
        match part {
            Part::Text(text) => RequestPart::Text { text },
            Part::InlineData { mime_type, data } => RequestPart::InlineData {
                inline_data: Blob {
                    mime_type,
                    data: base64::engine::general_purpose::STANDARD.encode(data),
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate.
    fn text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect();

        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[async_trait]
impl GenerativeModel for Gemini {
    async fn generate_content(
        &self,
        parts: &[Part],
        timeout: Option<Duration>,
    ) -> Result<String, ModelError> {
        let request = GenerateContentRequest {
            contents: [Content {
                role: "user",
                parts: parts.iter().map(RequestPart::from).collect(),
            }],
        };

        debug!("Calling {} with {} parts", self.model, parts.len());

        let mut builder = self
            .client
            .post(self.endpoint()?)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        trace!("Model API answered {status}: {body}");

        if status != StatusCode::OK {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|err| err.error.message)
                .unwrap_or(body);
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str::<GenerateContentResponse>(&body)?
            .text()
            .ok_or(ModelError::EmptyResponse)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
