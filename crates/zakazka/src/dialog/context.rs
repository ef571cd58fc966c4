//! Short-lived per-chat dialog state.
//!
//! Contexts live in process memory with a 600 s TTL and are mirrored to
//! Redis (when configured) so a second process can pick up the dialog.
//! Losing this state loses no correctness — only conversational comfort.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cache::Cache;

/// Context TTL, seconds — also used as the Redis expiry.
pub const DIALOG_TTL_SECONDS: u64 = 600;

/// Broad conversation topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Order,
    Stock,
    Match,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastItem {
    pub raw: String,
    pub normalized: String,
}

/// Everything the dialog remembers between two messages of one chat.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DialogContext {
    pub last_state: Option<String>,
    pub last_items: Vec<LastItem>,
    pub topic: Topic,
    /// Current clarification page offset.
    pub clarify_offset: usize,
    /// Explicit org selection overriding membership resolution.
    pub org_override: Option<i64>,
}

struct Entry {
    context: DialogContext,
    expires_at: Instant,
}

/// Store of dialog contexts and clarification callback payloads, keyed by
/// chat id (and message id for callbacks).
pub struct DialogStore {
    ttl: Duration,
    contexts: Mutex<HashMap<i64, Entry>>,
    callbacks: Mutex<HashMap<String, (Value, Instant)>>,
    cache: Cache,
}

impl DialogStore {
    pub fn new(cache: Cache) -> Self {
        Self {
            ttl: Duration::from_secs(DIALOG_TTL_SECONDS),
            contexts: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            cache,
        }
    }

    #[cfg(test)]
    fn with_ttl(cache: Cache, ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::new(cache)
        }
    }

    fn context_key(chat_id: i64) -> String {
        format!("dialog_ctx:{chat_id}")
    }

    fn callback_key(chat_id: i64, message_id: i64) -> String {
        format!("candidates:{chat_id}:{message_id}")
    }

    /// Current context for a chat; a fresh default when nothing (valid)
    /// is stored.
    pub async fn get(&self, chat_id: i64) -> DialogContext {
        {
            let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
            match contexts.get(&chat_id) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return entry.context.clone();
                }
                Some(_) => {
                    contexts.remove(&chat_id);
                }
                None => {}
            }
        }
        if let Some(ctx) = self.cache.get_json::<DialogContext>(&Self::context_key(chat_id)).await
        {
            return ctx;
        }
        DialogContext::default()
    }

    /// Store the context for a chat, refreshing the TTL.
    pub async fn put(&self, chat_id: i64, context: DialogContext) {
        {
            let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
            contexts.insert(
                chat_id,
                Entry {
                    context: context.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
        self.cache
            .set_json(&Self::context_key(chat_id), &context, DIALOG_TTL_SECONDS)
            .await;
    }

    /// Cache a clarification payload under the message that rendered it.
    pub async fn put_candidates(&self, chat_id: i64, message_id: i64, payload: &Value) {
        let key = Self::callback_key(chat_id, message_id);
        {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            callbacks.insert(key.clone(), (payload.clone(), Instant::now() + self.ttl));
        }
        self.cache.set_json(&key, payload, DIALOG_TTL_SECONDS).await;
    }

    /// Fetch a clarification payload. Reads do not consume the entry —
    /// pagination taps the same message several times.
    pub async fn get_candidates(&self, chat_id: i64, message_id: i64) -> Option<Value> {
        let key = Self::callback_key(chat_id, message_id);
        {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            match callbacks.get(&key) {
                Some((payload, expires_at)) if *expires_at > Instant::now() => {
                    return Some(payload.clone());
                }
                Some(_) => {
                    callbacks.remove(&key);
                }
                None => {}
            }
        }
        self.cache.get_json::<Value>(&key).await
    }

    /// Drop expired in-memory entries (Redis expires on its own).
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| entry.expires_at > now);
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, (_, expires_at)| *expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn context_roundtrip_and_default() {
        let store = DialogStore::new(Cache::disabled());
        assert!(store.get(7).await.last_items.is_empty());

        let ctx = DialogContext {
            last_state: Some("S1_INTAKE".into()),
            last_items: vec![LastItem {
                raw: "нитки".into(),
                normalized: "нитки".into(),
            }],
            topic: Topic::Order,
            clarify_offset: 10,
            org_override: Some(3),
        };
        store.put(7, ctx.clone()).await;
        let loaded = store.get(7).await;
        assert_eq!(loaded.last_items, ctx.last_items);
        assert_eq!(loaded.clarify_offset, 10);
        assert_eq!(loaded.org_override, Some(3));
        // Other chats are unaffected.
        assert!(store.get(8).await.last_items.is_empty());
    }

    #[tokio::test]
    async fn expired_context_reads_as_fresh() {
        let store = DialogStore::with_ttl(Cache::disabled(), Duration::from_millis(0));
        store.put(1, DialogContext::default()).await;
        assert!(store.get(1).await.last_items.is_empty());
    }

    #[tokio::test]
    async fn callback_payloads_survive_repeated_reads() {
        let store = DialogStore::new(Cache::disabled());
        let payload = json!({"base_query": "молния", "options": ["а", "б"]});
        store.put_candidates(1, 100, &payload).await;
        assert_eq!(store.get_candidates(1, 100).await, Some(payload.clone()));
        assert_eq!(store.get_candidates(1, 100).await, Some(payload));
        assert_eq!(store.get_candidates(1, 101).await, None);
    }

    #[tokio::test]
    async fn purge_drops_expired_entries() {
        let store = DialogStore::with_ttl(Cache::disabled(), Duration::from_millis(0));
        store.put(1, DialogContext::default()).await;
        store.put_candidates(1, 5, &json!({})).await;
        store.purge_expired();
        assert!(store.get(1).await.last_items.is_empty());
        assert_eq!(store.get_candidates(1, 5).await, None);
    }
}
