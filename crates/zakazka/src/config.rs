//! Runtime configuration read from the environment.
//!
//! Every knob has a default that keeps the core deterministic: the LLM is
//! disabled, Redis is absent (caching degrades to direct DB reads), and the
//! store lives in a local SQLite file.

use std::env;

/// Which chat provider the LLM layer talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmProviderKind {
    #[default]
    Disabled,
    /// Local chat endpoint (Ollama-style `/api/chat`).
    Local,
    /// Remote OAuth-protected chat endpoint (GigaChat-style).
    Remote,
}

impl LlmProviderKind {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Self::Local,
            "remote" => Self::Remote,
            _ => Self::Disabled,
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database path.
    pub database_url: String,
    /// Redis URL; empty disables caching entirely.
    pub redis_url: String,

    pub llm_enabled: bool,
    pub llm_provider: LlmProviderKind,
    /// Timeout for a single LLM call, seconds.
    pub llm_timeout_seconds: u64,

    // Local provider shaping.
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub ollama_num_predict: u32,
    pub ollama_num_ctx: u32,
    pub ollama_keep_alive: String,

    // Remote provider.
    pub gigachat_basic_auth_key: String,
    pub gigachat_api_base_url: String,
    pub gigachat_oauth_url: String,
    pub gigachat_model: String,
    pub gigachat_scope: String,
    pub gigachat_token_cache_prefix: String,

    // Dialog-layer authorization hints (consumed outside the core).
    pub admin_phone: String,
    pub admin_tg_id: Option<i64>,
    pub manager_phone: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "zakazka.db".to_string(),
            redis_url: String::new(),
            llm_enabled: false,
            llm_provider: LlmProviderKind::Disabled,
            llm_timeout_seconds: 30,
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            ollama_model: String::new(),
            ollama_num_predict: 96,
            ollama_num_ctx: 1024,
            ollama_keep_alive: "10m".to_string(),
            gigachat_basic_auth_key: String::new(),
            gigachat_api_base_url: "https://gigachat.devices.sberbank.ru/api/v1".to_string(),
            gigachat_oauth_url: "https://ngw.devices.sberbank.ru:9443/api/v2/oauth".to_string(),
            gigachat_model: "GigaChat".to_string(),
            gigachat_scope: "GIGACHAT_API_PERS".to_string(),
            gigachat_token_cache_prefix: "gigachat:token".to_string(),
            admin_phone: String::new(),
            admin_tg_id: None,
            manager_phone: String::new(),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_i64_opt(key: &str) -> Option<i64> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Settings {
    /// Read settings from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("DATABASE_URL", &defaults.database_url),
            redis_url: env_string("REDIS_URL", ""),
            llm_enabled: env_bool("LLM_ENABLED", defaults.llm_enabled),
            llm_provider: LlmProviderKind::parse(&env_string("LLM_PROVIDER", "disabled")),
            llm_timeout_seconds: env_u64("LLM_TIMEOUT_SECONDS", defaults.llm_timeout_seconds),
            ollama_base_url: env_string("OLLAMA_BASE_URL", &defaults.ollama_base_url),
            ollama_model: env_string("OLLAMA_MODEL", ""),
            ollama_num_predict: env_u64("OLLAMA_NUM_PREDICT", defaults.ollama_num_predict as u64)
                as u32,
            ollama_num_ctx: env_u64("OLLAMA_NUM_CTX", defaults.ollama_num_ctx as u64) as u32,
            ollama_keep_alive: env_string("OLLAMA_KEEP_ALIVE", &defaults.ollama_keep_alive),
            gigachat_basic_auth_key: env_string("GIGACHAT_BASIC_AUTH_KEY", ""),
            gigachat_api_base_url: env_string(
                "GIGACHAT_API_BASE_URL",
                &defaults.gigachat_api_base_url,
            ),
            gigachat_oauth_url: env_string("GIGACHAT_OAUTH_URL", &defaults.gigachat_oauth_url),
            gigachat_model: env_string("GIGACHAT_MODEL", &defaults.gigachat_model),
            gigachat_scope: env_string("GIGACHAT_SCOPE", &defaults.gigachat_scope),
            gigachat_token_cache_prefix: env_string(
                "GIGACHAT_TOKEN_CACHE_PREFIX",
                &defaults.gigachat_token_cache_prefix,
            ),
            admin_phone: env_string("ADMIN_PHONE", ""),
            admin_tg_id: env_i64_opt("ADMIN_TG_ID"),
            manager_phone: env_string("MANAGER_PHONE", ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_the_core_deterministic() {
        let settings = Settings::default();
        assert!(!settings.llm_enabled);
        assert_eq!(settings.llm_provider, LlmProviderKind::Disabled);
        assert!(settings.redis_url.is_empty());
        assert_eq!(settings.llm_timeout_seconds, 30);
        assert_eq!(settings.ollama_num_predict, 96);
        assert_eq!(settings.ollama_num_ctx, 1024);
        assert_eq!(settings.ollama_keep_alive, "10m");
        assert_eq!(settings.gigachat_scope, "GIGACHAT_API_PERS");
    }

    #[test]
    fn provider_kind_parsing() {
        assert_eq!(LlmProviderKind::parse("local"), LlmProviderKind::Local);
        assert_eq!(LlmProviderKind::parse("Remote"), LlmProviderKind::Remote);
        assert_eq!(LlmProviderKind::parse("disabled"), LlmProviderKind::Disabled);
        assert_eq!(LlmProviderKind::parse("garbage"), LlmProviderKind::Disabled);
    }
}
