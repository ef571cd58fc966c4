//! Local chat endpoint (Ollama-style `/api/chat`).

use serde_json::json;
use tracing::{debug, error};

use super::{ChatFuture, ChatMessage, ChatProvider};
use crate::config::Settings;

pub struct OllamaProvider {
    base_url: String,
    model: String,
    num_predict: u32,
    num_ctx: u32,
    keep_alive: String,
}

/// Strip a trailing `/api` (and slashes) so the endpoint never doubles up.
pub fn normalize_base_url(raw: &str) -> String {
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if let Some(stripped) = base.strip_suffix("/api") {
        base = stripped.to_string();
    }
    base
}

impl OllamaProvider {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base_url: normalize_base_url(&settings.ollama_base_url),
            model: settings.ollama_model.clone(),
            num_predict: settings.ollama_num_predict,
            num_ctx: settings.ollama_num_ctx,
            keep_alive: settings.ollama_keep_alive.clone(),
        }
    }

    async fn chat_inner(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, String> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": self.num_predict,
                "num_ctx": self.num_ctx,
            },
            "keep_alive": self.keep_alive,
        });

        // Short-lived client per call; the outer LlmClient owns the deadline.
        let client = reqwest::Client::new();
        let response = client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("ollama request failed: {e}"))?;

        let status = response.status();
        if status.as_u16() == 404 {
            error!("ollama endpoint 404: base_url may include /api twice, endpoint={endpoint}");
        }
        if !status.is_success() {
            return Err(format!("ollama HTTP {status}"));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("ollama response not JSON: {e}"))?;
        let content = data
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            return Err("ollama empty response".to_string());
        }
        debug!("ollama response: {} chars", content.len());
        Ok(content)
    }
}

impl ChatProvider for OllamaProvider {
    fn chat<'a>(&'a self, messages: &'a [ChatMessage], temperature: f32) -> ChatFuture<'a> {
        Box::pin(self.chat_inner(messages, temperature))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalization() {
        assert_eq!(normalize_base_url("http://localhost:11434"), "http://localhost:11434");
        assert_eq!(normalize_base_url("http://localhost:11434/"), "http://localhost:11434");
        assert_eq!(normalize_base_url("http://localhost:11434/api"), "http://localhost:11434");
        assert_eq!(normalize_base_url("http://localhost:11434/api/"), "http://localhost:11434");
    }
}
