use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{GenerativeModel, MissingApiKey, ModelError, ModelProvider, Part};

/// Replays a script of replies. Once the script runs out the last reply repeats.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<Result<String, String>>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<Part>>>,
}

impl ScriptedModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn replies(self: Arc<Self>, text: &str) -> Arc<Self> {
        self.push(Ok(text.to_string()));
        self
    }

    pub fn fails(self: Arc<Self>, message: &str) -> Arc<Self> {
        self.push(Err(message.to_string()));
        self
    }

    fn push(&self, reply: Result<String, String>) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Vec<Part>> {
        self.prompts.lock().unwrap().clone()
    }

    /// Text of the first part of the most recent prompt.
    pub fn last_prompt_text(&self) -> String {
        match self.prompts.lock().unwrap().last().and_then(|parts| parts.first()) {
            Some(Part::Text(text)) => text.clone(),
            other => panic!("expected a text part, got {other:?}"),
        }
    }
}

#[async_trait]
impl GenerativeModel for ScriptedModel {
    async fn generate_content(
        &self,
        parts: &[Part],
        _timeout: Option<Duration>,
    ) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(parts.to_vec());

        let reply = {
            let mut last = self.last.lock().unwrap();
            if let Some(reply) = self.script.lock().unwrap().pop_front() {
                *last = Some(reply);
            }
            last.clone().expect("ScriptedModel called without a script")
        };

        reply.map_err(ModelError::Other)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Provider handing out a fixed model, or none to simulate a missing API key.
#[derive(Debug, Clone)]
pub struct FakeProvider(pub Option<Arc<ScriptedModel>>);

impl FakeProvider {
    pub fn with(model: &Arc<ScriptedModel>) -> Self {
        Self(Some(Arc::clone(model)))
    }

    pub fn unconfigured() -> Self {
        Self(None)
    }
}

impl ModelProvider for FakeProvider {
    fn model(&self) -> Result<Arc<dyn GenerativeModel>, MissingApiKey> {
        self.0
            .clone()
            .map(|model| model as Arc<dyn GenerativeModel>)
            .ok_or(MissingApiKey)
    }
}
