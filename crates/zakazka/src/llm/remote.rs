//! Remote OAuth-protected chat endpoint (GigaChat-style).
//!
//! Access tokens are cached (value + expiry) and refreshed 60 s before they
//! expire. A 401/403 from the chat endpoint invalidates the cached token and
//! retries exactly once with a fresh one.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, warn};

use super::{ChatFuture, ChatMessage, ChatProvider};
use crate::cache::Cache;
use crate::config::Settings;

/// Refresh this many milliseconds before the reported expiry.
const TOKEN_EARLY_REFRESH_MS: i64 = 60_000;

pub struct GigaChatProvider {
    basic_auth_key: String,
    oauth_url: String,
    api_base_url: String,
    model: String,
    scope: String,
    token_cache_prefix: String,
    cache: Cache,
}

fn request_uid() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("rq-{ts:x}-{count:04x}")
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl GigaChatProvider {
    pub fn from_settings(settings: &Settings, cache: Cache) -> Self {
        Self {
            basic_auth_key: settings.gigachat_basic_auth_key.clone(),
            oauth_url: settings.gigachat_oauth_url.clone(),
            api_base_url: settings.gigachat_api_base_url.trim_end_matches('/').to_string(),
            model: settings.gigachat_model.clone(),
            scope: settings.gigachat_scope.clone(),
            token_cache_prefix: settings.gigachat_token_cache_prefix.clone(),
            cache,
        }
    }

    fn token_key(&self) -> String {
        format!("{}:value", self.token_cache_prefix)
    }

    fn expires_key(&self) -> String {
        format!("{}:expires_at", self.token_cache_prefix)
    }

    async fn cached_token(&self) -> Option<String> {
        let token = self.cache.get_string(&self.token_key()).await?;
        let expires_raw = self.cache.get_string(&self.expires_key()).await?;
        let expires_at: i64 = expires_raw.trim().parse().ok()?;
        (expires_at - now_ms() > TOKEN_EARLY_REFRESH_MS).then_some(token)
    }

    async fn invalidate_token(&self) {
        self.cache.del(&self.token_key()).await;
        self.cache.del(&self.expires_key()).await;
    }

    async fn fetch_token(&self) -> Result<String, String> {
        let client = reqwest::Client::new();
        let response = client
            .post(&self.oauth_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .header("RqUID", request_uid())
            .header("Authorization", format!("Basic {}", self.basic_auth_key))
            .form(&[("scope", self.scope.as_str())])
            .send()
            .await
            .map_err(|e| format!("oauth request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("oauth HTTP {status}"));
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("oauth response not JSON: {e}"))?;

        let token = payload
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| "oauth response missing access_token".to_string())?
            .to_string();
        let expires_at = payload
            .get("expires_at")
            .and_then(|t| t.as_i64())
            .ok_or_else(|| "oauth response missing expires_at".to_string())?;

        let ttl_seconds = ((expires_at - now_ms()) / 1000 - 60).max(1) as u64;
        self.cache.set_ex(&self.token_key(), &token, ttl_seconds).await;
        self.cache
            .set_ex(&self.expires_key(), &expires_at.to_string(), ttl_seconds)
            .await;
        Ok(token)
    }

    async fn access_token(&self) -> Result<String, String> {
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }
        self.fetch_token().await
    }

    async fn post_chat(
        &self,
        token: &str,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, String> {
        let client = reqwest::Client::new();
        client
            .post(format!("{}/chat/completions", self.api_base_url))
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| format!("chat request failed: {e}"))
    }

    async fn chat_inner(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, String> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
        });

        let token = self.access_token().await?;
        let mut response = self.post_chat(&token, &payload).await?;

        if matches!(response.status().as_u16(), 401 | 403) {
            warn!("gigachat unauthorized, refreshing token");
            self.invalidate_token().await;
            let fresh = self.fetch_token().await?;
            response = self.post_chat(&fresh, &payload).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(format!("gigachat HTTP {status}"));
        }
        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("gigachat response not JSON: {e}"))?;
        let content = data
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            return Err("gigachat empty response".to_string());
        }
        debug!("gigachat response: {} chars", content.len());
        Ok(content)
    }
}

impl ChatProvider for GigaChatProvider {
    fn chat<'a>(&'a self, messages: &'a [ChatMessage], temperature: f32) -> ChatFuture<'a> {
        Box::pin(self.chat_inner(messages, temperature))
    }

    fn name(&self) -> &'static str {
        "gigachat"
    }
}
