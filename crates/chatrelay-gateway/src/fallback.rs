//! Offline replies sent on the platform when no client takes a message.

use crate::config::FallbackSection;
use chatrelay_core::{RelayError, RelayResult};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const MODEL_TIMEOUT: Duration = Duration::from_secs(20);

const SYSTEM_PROMPT: &str = "You are a relay assistant. The user's main assistant is offline \
and cannot act on requests right now. Reply briefly, acknowledge the message, and say it \
can be resent later.";

struct ModelSettings {
    base_url: String,
    api_key: Option<String>,
    model: String,
}

pub struct Fallback {
    text: String,
    model: Option<ModelSettings>,
    http: reqwest::Client,
}

impl Fallback {
    pub fn new(section: &FallbackSection) -> Self {
        let model = section
            .model_endpoint
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .map(|url| ModelSettings {
                base_url: url.trim_end_matches('/').to_string(),
                api_key: section.model_api_key.clone().filter(|k| !k.is_empty()),
                model: section.model.clone(),
            });
        Self {
            text: section.text.clone(),
            model,
            http: reqwest::Client::new(),
        }
    }

    /// Reply for a message the client did not receive. Never fails: model
    /// errors degrade to the static text.
    pub async fn reply_for(&self, user_text: &str) -> String {
        let Some(model) = &self.model else {
            return self.text.clone();
        };
        match self.ask_model(model, user_text).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "fallback model failed, using static text");
                self.text.clone()
            }
        }
    }

    async fn ask_model(&self, model: &ModelSettings, user_text: &str) -> RelayResult<String> {
        let body = json!({
            "model": model.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_text },
            ],
        });
        let mut req = self
            .http
            .post(format!("{}/chat/completions", model.base_url))
            .timeout(MODEL_TIMEOUT)
            .json(&body);
        if let Some(key) = &model.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| RelayError::Downstream(format!("model request: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Downstream(format!("model returned {status}: {body}")));
        }
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Downstream(format!("model reply: {e}")))?;
        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .unwrap_or_default();
        if text.is_empty() {
            return Err(RelayError::Downstream("model reply has no content".into()));
        }
        debug!(model = %model.model, chars = text.chars().count(), "fallback model replied");
        Ok(text.to_string())
    }
}
