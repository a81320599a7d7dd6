//! Water-data extraction from test-strip photos.
//!
//! One extraction makes up to [`RetryPolicy::max_attempts`] calls to the model.
//! A transport failure or an unparsable reply costs one attempt and is
//! followed by a constant [`RetryPolicy::backoff`] before the next call. The
//! first reply that parses as a JSON object ends the loop.

use std::{collections::BTreeMap, time::Duration};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    model::{GenerativeModel, MissingApiKey, ModelError, ModelProvider, Part},
    models::ExtractionResult,
};

pub const DEFAULT_RETRIES: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub const EXTRACTION_PROMPT: &str = concat!(
    "This is a photo of an aquarium water test strip. ",
    "Detect the values of pH, KH, GH, NO2, NO3 and Cl2 in the photo and output them as JSON. ",
    r#"Example: {"ph": 7.0, "kh": 6, "gh": 8, "no2": 0.1, "no3": 10.0, "cl2": 0.0} "#,
    "If a value cannot be detected, leave it out of the JSON."
);

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?i:json)?\s*(?P<body>.*?)\s*```$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRIES,
            backoff: RETRY_DELAY,
            timeout: REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub water_data: ExtractionResult,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Gemini API key is not configured")]
    Configuration(#[from] MissingApiKey),

    #[error("Model did not return water data as JSON after {attempts} attempts")]
    Format {
        attempts: u32,
        raw_response: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not communicate with the model API after {attempts} attempts")]
    Service {
        attempts: u32,
        #[source]
        source: ModelError,
    },
}

/// Strips a surrounding ```` ```json ```` fence if there is one.
pub fn unwrap_fenced(text: &str) -> &str {
    let text = text.trim();
    FENCED_BLOCK
        .captures(text)
        .and_then(|captures| captures.name("body"))
        .map_or(text, |body| body.as_str())
}

/// Parses a model reply into detected readings. `null` readings count as undetected.
pub fn parse_water_data(text: &str) -> Result<ExtractionResult, serde_json::Error> {
    let readings: BTreeMap<String, Option<f64>> = serde_json::from_str(unwrap_fenced(text))?;

    Ok(readings
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key, value)))
        .collect())
}

async fn call_with_timeout(
    model: &dyn GenerativeModel,
    parts: &[Part],
    timeout: Duration,
) -> Result<String, ModelError> {
    tokio::time::timeout(timeout, model.generate_content(parts, Some(timeout)))
        .await
        .map_err(|_| ModelError::Timeout(timeout))?
}

pub async fn extract_water_data(
    provider: &dyn ModelProvider,
    image: Image,
    policy: RetryPolicy,
) -> Result<Extraction, ExtractionError> {
    let model = provider.model()?;

    let parts = [
        Part::text(EXTRACTION_PROMPT),
        Part::InlineData {
            mime_type: image.mime_type,
            data: image.data,
        },
    ];

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match call_with_timeout(model.as_ref(), &parts, policy.timeout).await {
            Ok(raw) => match parse_water_data(&raw) {
                Ok(water_data) => {
                    info!(
                        "Extracted {} readings on attempt {attempt}/{max_attempts}",
                        water_data.len()
                    );
                    return Ok(Extraction {
                        water_data,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    warn!("Attempt {attempt}/{max_attempts}: model reply is not valid JSON: {err}");
                    debug!("Raw model reply: {raw}");

                    if attempt == max_attempts {
                        return Err(ExtractionError::Format {
                            attempts: attempt,
                            raw_response: unwrap_fenced(&raw).to_string(),
                            source: err,
                        });
                    }
                }
            },
            Err(err) => {
                warn!("Attempt {attempt}/{max_attempts}: model call failed: {err}");

                if attempt == max_attempts {
                    return Err(ExtractionError::Service {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }

        tokio::time::sleep(policy.backoff).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_ulps_eq;
    use async_trait::async_trait;
    use test_case::test_case;
    use tokio::time::Instant;

    use super::*;
    use crate::model::fake::{FakeProvider, ScriptedModel};

    fn strip() -> Image {
        Image {
            mime_type: "image/gif".to_string(),
            data: b"GIF89a\x01\x00\x01\x00\x00\xff\x00,\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02D\x01\x00;"
                .to_vec(),
        }
    }

    #[test_case("```json\n{\"ph\": 7.5}\n```", "{\"ph\": 7.5}" ; "json fence")]
    #[test_case("```JSON{\"ph\": 7.5}```", "{\"ph\": 7.5}" ; "uppercase tag without newlines")]
    #[test_case("```\n{\"ph\": 7.5}\n```", "{\"ph\": 7.5}" ; "untagged fence")]
    #[test_case("  {\"ph\": 7.5}\n", "{\"ph\": 7.5}" ; "bare json is trimmed")]
    #[test_case("```json\n{\"ph\": 7.5}", "```json\n{\"ph\": 7.5}" ; "unterminated fence is left alone")]
    #[test_case("This is not JSON.", "This is not JSON." ; "prose")]
    fn unwrap_fenced_cases(input: &str, expected: &str) {
        assert_eq!(unwrap_fenced(input), expected);
    }

    #[test]
    fn fenced_and_bare_replies_parse_identically() {
        let bare = parse_water_data(r#"{"ph": 6.8, "nitrite": 0.05}"#).unwrap();
        let fenced = parse_water_data("```json\n{\"ph\": 6.8, \"nitrite\": 0.05}\n```").unwrap();
        assert_eq!(bare, fenced);
    }

    #[test]
    fn null_readings_are_undetected() {
        let data = parse_water_data(r#"{"ph": 7.0, "kh": null}"#).unwrap();
        assert_eq!(data.len(), 1);
        assert!(!data.contains_key("kh"));
    }

    #[test_case("[7.0, 6]" ; "array")]
    #[test_case(r#"{"ph": "seven"}"# ; "string value")]
    #[test_case("" ; "empty")]
    fn non_object_replies_are_format_errors(reply: &str) {
        assert!(parse_water_data(reply).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success_makes_one_call() {
        let model = ScriptedModel::new().replies("```json\n{\"ph\": 7.5, \"nitrate\": 10.0}\n```");
        let started = Instant::now();

        let extraction =
            extract_water_data(&FakeProvider::with(&model), strip(), RetryPolicy::default())
                .await
                .unwrap();

        assert_eq!(model.calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(extraction.attempts, 1);
        assert_eq!(extraction.water_data.len(), 2);
        assert_ulps_eq!(extraction.water_data["ph"], 7.5);
        assert_ulps_eq!(extraction.water_data["nitrate"], 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_malformed_replies() {
        let model = ScriptedModel::new()
            .replies("This is not JSON.")
            .replies("This is not JSON.")
            .replies("```json\n{\"ph\": 6.8, \"nitrite\": 0.05}\n```");
        let started = Instant::now();

        let extraction =
            extract_water_data(&FakeProvider::with(&model), strip(), RetryPolicy::default())
                .await
                .unwrap();

        assert_eq!(model.calls(), 3);
        assert_eq!(started.elapsed(), 2 * RETRY_DELAY);
        assert_eq!(extraction.attempts, 3);
        assert_ulps_eq!(extraction.water_data["ph"], 6.8);
        assert_ulps_eq!(extraction.water_data["nitrite"], 0.05);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_transport_errors() {
        let model = ScriptedModel::new()
            .fails("API temporary unavailable")
            .fails("Network timeout")
            .replies(r#"{"gh": 7.0, "kh": 5.0}"#);
        let started = Instant::now();

        let extraction =
            extract_water_data(&FakeProvider::with(&model), strip(), RetryPolicy::default())
                .await
                .unwrap();

        assert_eq!(model.calls(), 3);
        assert_eq!(started.elapsed(), 2 * RETRY_DELAY);
        assert_ulps_eq!(extraction.water_data["gh"], 7.0);
        assert_ulps_eq!(extraction.water_data["kh"], 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_replies_exhaust_the_budget() {
        let model = ScriptedModel::new().replies("Always invalid JSON.");
        let started = Instant::now();

        let err = extract_water_data(&FakeProvider::with(&model), strip(), RetryPolicy::default())
            .await
            .unwrap_err();

        assert_eq!(model.calls(), DEFAULT_RETRIES as usize);
        assert_eq!(started.elapsed(), (DEFAULT_RETRIES - 1) * RETRY_DELAY);
        match err {
            ExtractionError::Format {
                attempts,
                raw_response,
                ..
            } => {
                assert_eq!(attempts, DEFAULT_RETRIES);
                assert_eq!(raw_response, "Always invalid JSON.");
            }
            other => panic!("expected a format error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_exhaust_the_budget() {
        let model = ScriptedModel::new().fails("API consistently failing");
        let started = Instant::now();

        let err = extract_water_data(&FakeProvider::with(&model), strip(), RetryPolicy::default())
            .await
            .unwrap_err();

        assert_eq!(model.calls(), 3);
        assert_eq!(started.elapsed(), 2 * RETRY_DELAY);
        assert!(matches!(err, ExtractionError::Service { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn last_attempt_decides_the_error_kind() {
        let model = ScriptedModel::new()
            .replies("nope")
            .fails("boom")
            .replies("still nope");

        let err = extract_water_data(&FakeProvider::with(&model), strip(), RetryPolicy::default())
            .await
            .unwrap_err();

        assert_eq!(model.calls(), 3);
        assert!(matches!(err, ExtractionError::Format { ref raw_response, .. } if raw_response == "still nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_api_key_makes_no_calls() {
        let started = Instant::now();

        let err = extract_water_data(
            &FakeProvider::unconfigured(),
            strip(),
            RetryPolicy::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ExtractionError::Configuration(_)));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_never_waits() {
        let model = ScriptedModel::new().fails("down");
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let started = Instant::now();

        let err = extract_water_data(&FakeProvider::with(&model), strip(), policy)
            .await
            .unwrap_err();

        assert_eq!(model.calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(matches!(err, ExtractionError::Service { attempts: 1, .. }));
    }

    #[derive(Debug)]
    struct HangingModel;

    #[async_trait]
    impl GenerativeModel for HangingModel {
        async fn generate_content(
            &self,
            _parts: &[Part],
            _timeout: Option<Duration>,
        ) -> Result<String, ModelError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("{}".to_string())
        }

        fn model_name(&self) -> &str {
            "hanging"
        }
    }

    #[derive(Debug)]
    struct HangingProvider;

    impl ModelProvider for HangingProvider {
        fn model(&self) -> Result<Arc<dyn GenerativeModel>, MissingApiKey> {
            Ok(Arc::new(HangingModel))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_transport_errors() {
        let started = Instant::now();

        let err = extract_water_data(&HangingProvider, strip(), RetryPolicy::default())
            .await
            .unwrap_err();

        assert_eq!(started.elapsed(), 3 * REQUEST_TIMEOUT + 2 * RETRY_DELAY);
        assert!(matches!(
            err,
            ExtractionError::Service {
                source: ModelError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn image_is_sent_after_the_instruction() {
        let model = ScriptedModel::new().replies("{}");

        extract_water_data(&FakeProvider::with(&model), strip(), RetryPolicy::default())
            .await
            .unwrap();

        let prompts = model.prompts();
        assert_eq!(prompts[0][0], Part::text(EXTRACTION_PROMPT));
        assert!(matches!(
            &prompts[0][1],
            Part::InlineData { mime_type, .. } if mime_type == "image/gif"
        ));
    }
}
