//! LLM augmentation transport.
//!
//! A single [`ChatProvider`] seam hides which chat backend is configured;
//! the rest of the crate only sees [`LlmClient`]. Every call is bounded by
//! the configured timeout, and a disabled client performs no I/O at all —
//! with the LLM off the whole pipeline is a pure function of the database.

pub mod local;
pub mod ops;
pub mod remote;

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use crate::cache::Cache;
use crate::config::{LlmProviderKind, Settings};

/// One chat turn.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Boxed future returned by [`ChatProvider::chat`].
///
/// Keeps the trait dyn-compatible so the client can hold any provider.
pub type ChatFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// A chat backend. Implementations send the messages and return the raw
/// assistant text; transport failures are plain `Err` strings.
pub trait ChatProvider: Send + Sync {
    fn chat<'a>(&'a self, messages: &'a [ChatMessage], temperature: f32) -> ChatFuture<'a>;

    /// Short provider label for logs.
    fn name(&self) -> &'static str;
}

/// Facade over the configured provider (or over nothing).
pub struct LlmClient {
    provider: Option<Box<dyn ChatProvider>>,
    timeout: Duration,
}

impl LlmClient {
    /// A client that reports unavailable and never performs I/O.
    pub fn disabled() -> Self {
        Self {
            provider: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Select a provider from settings. Missing credentials degrade to a
    /// disabled client rather than erroring — the pipeline treats that as
    /// `llm_disabled`.
    pub fn from_settings(settings: &Settings, cache: &Cache) -> Self {
        if !settings.llm_enabled {
            return Self::disabled();
        }
        let provider: Option<Box<dyn ChatProvider>> = match settings.llm_provider {
            LlmProviderKind::Disabled => None,
            LlmProviderKind::Local => {
                if settings.ollama_base_url.trim().is_empty()
                    || settings.ollama_model.trim().is_empty()
                {
                    debug!("local llm provider not configured, llm disabled");
                    None
                } else {
                    Some(Box::new(local::OllamaProvider::from_settings(settings)))
                }
            }
            LlmProviderKind::Remote => {
                if settings.gigachat_basic_auth_key.trim().is_empty()
                    || settings.gigachat_api_base_url.trim().is_empty()
                    || settings.gigachat_model.trim().is_empty()
                {
                    debug!("remote llm provider not configured, llm disabled");
                    None
                } else {
                    Some(Box::new(remote::GigaChatProvider::from_settings(
                        settings,
                        cache.clone(),
                    )))
                }
            }
        };
        Self {
            provider,
            timeout: Duration::from_secs(settings.llm_timeout_seconds.max(1)),
        }
    }

    /// Whether a provider is configured. All augmentation stages gate on
    /// this before attempting any call.
    pub fn available(&self) -> bool {
        self.provider.is_some()
    }

    /// Send a chat completion, bounded by the configured timeout. A timeout
    /// reads as `llm_timeout` in stage notes, not as a hard failure.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, String> {
        let Some(provider) = &self.provider else {
            return Err("llm disabled".to_string());
        };
        match tokio::time::timeout(self.timeout, provider.chat(messages, temperature)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "llm_timeout after {}s ({})",
                self.timeout.as_secs(),
                provider.name()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_client_errors_without_io() {
        let client = LlmClient::disabled();
        assert!(!client.available());
        let err = client
            .chat(&[ChatMessage::user("привет")], 0.1)
            .await
            .unwrap_err();
        assert!(err.contains("disabled"));
    }

    #[test]
    fn settings_without_credentials_disable() {
        let mut settings = Settings::default();
        settings.llm_enabled = true;
        settings.llm_provider = LlmProviderKind::Local;
        settings.ollama_model = String::new();
        let client = LlmClient::from_settings(&settings, &Cache::disabled());
        assert!(!client.available());

        settings.llm_provider = LlmProviderKind::Remote;
        let client = LlmClient::from_settings(&settings, &Cache::disabled());
        assert!(!client.available());
    }

    #[test]
    fn settings_with_local_model_enable() {
        let mut settings = Settings::default();
        settings.llm_enabled = true;
        settings.llm_provider = LlmProviderKind::Local;
        settings.ollama_model = "qwen2.5:3b".to_string();
        let client = LlmClient::from_settings(&settings, &Cache::disabled());
        assert!(client.available());
    }
}
