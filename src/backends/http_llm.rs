//! LLM correction backend over a chat-completions endpoint.

use async_trait::async_trait;
use serde::Deserialize;

use crate::backend::{BackendError, LlmBackend};

/// The correction instruction is fixed; callers opt in or out of correction, they don't
/// customize the prompt.
const CORRECTION_PROMPT: &str = "Fix speech recognition errors, improve punctuation, and \
make this transcript more readable while preserving the original meaning and style. \
Output ONLY the corrected transcript with no preamble, commentary, or explanations.";

const TEMPERATURE: f64 = 0.1;
const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// HTTP [`LlmBackend`].
pub struct HttpLlmBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

impl HttpLlmBackend {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|err| BackendError::msg(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_owned(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    async fn correct(&self, text: &str) -> Result<String, BackendError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "temperature": TEMPERATURE,
                "messages": [
                    {"role": "system", "content": CORRECTION_PROMPT},
                    {"role": "user", "content": text}
                ]
            }))
            .send()
            .await
            .map_err(|err| BackendError::msg(format!("correction request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::new(Some(status.as_u16()), body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|err| BackendError::msg(format!("unparseable correction body: {err}")))?;
        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_owned())
            .ok_or_else(|| BackendError::msg("correction response had no choices"))
    }
}
