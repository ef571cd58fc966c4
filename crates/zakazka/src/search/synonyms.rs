//! Token-level synonym rewrites applied before retrieval.
//!
//! The merged map (seeded defaults ← global rows ← tenant overrides) is
//! cached in Redis for 600 s per scope; a mutation invalidates the scope key.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::warn;

use crate::cache::Cache;
use crate::store::Db;

pub const ALIAS_CACHE_TTL: u64 = 600;

/// Rewrites every deployment starts with.
pub const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("спандбонд", "спанбонд"),
    ("спандбон", "спанбонд"),
    ("синтепонн", "синтепон"),
    ("ппу", "поролон"),
];

static SYN_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[\w-]+\b").unwrap());
static ARTICLE_ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:st\d{3,6}|[a-z]{1,3}\d{2,6}|\d{5,})\b").unwrap());

fn cache_key(org_id: Option<i64>) -> String {
    format!("search_alias_map:{}", org_id.unwrap_or(0))
}

/// The merged `src → dst` map for a tenant scope.
pub async fn alias_map(db: &Db, cache: &Cache, org_id: Option<i64>) -> BTreeMap<String, String> {
    let key = cache_key(org_id);
    if let Some(cached) = cache.get_json::<BTreeMap<String, String>>(&key).await {
        return cached;
    }

    let mut map: BTreeMap<String, String> = DEFAULT_ALIASES
        .iter()
        .map(|(src, dst)| (src.to_string(), dst.to_string()))
        .collect();
    match db.search_alias_rows(None) {
        Ok(rows) => map.extend(rows),
        Err(e) => warn!("failed to load global synonyms: {e}"),
    }
    if let Some(org) = org_id {
        match db.search_alias_rows(Some(org)) {
            Ok(rows) => map.extend(rows),
            Err(e) => warn!("failed to load org synonyms: {e}"),
        }
    }

    cache.set_json(&key, &map, ALIAS_CACHE_TTL).await;
    map
}

/// Drop the cached map for a scope after a mutation.
pub async fn invalidate_alias_cache(cache: &Cache, org_id: Option<i64>) {
    cache.del(&cache_key(org_id)).await;
}

/// Rewrite the query token-by-token. Returns the rewritten query and the
/// rewrites that actually applied. The `ппу → поролон` rewrite only fires on
/// short queries without an article anchor — "ппу ST5030" names a concrete
/// foam grade, not the generic material.
pub fn apply_token_synonyms(
    text: &str,
    map: &BTreeMap<String, String>,
) -> (String, BTreeMap<String, String>) {
    let raw = text.trim();
    if raw.is_empty() {
        return (String::new(), BTreeMap::new());
    }
    let lowered = raw.to_lowercase();
    let tokens: Vec<&str> = SYN_TOKEN_RE.find_iter(&lowered).map(|m| m.as_str()).collect();
    let short_query = tokens.len() <= 3 && !ARTICLE_ANCHOR_RE.is_match(&lowered);

    let mut applied = BTreeMap::new();
    let mut rewritten = Vec::with_capacity(tokens.len());
    for token in tokens {
        let replacement = if token == "ппу" {
            if short_query {
                map.get(token).cloned().unwrap_or_else(|| "поролон".to_string())
            } else {
                token.to_string()
            }
        } else {
            map.get(token).cloned().unwrap_or_else(|| token.to_string())
        };
        if replacement != token {
            applied.insert(token.to_string(), replacement.clone());
        }
        rewritten.push(replacement);
    }
    (rewritten.join(" ").trim().to_string(), applied)
}

/// Persist the default rewrites so admins can see and edit them.
pub async fn seed_default_aliases(db: &Db, cache: &Cache) -> Result<(), String> {
    for (src, dst) in DEFAULT_ALIASES {
        db.upsert_search_alias(None, src, dst, true)?;
    }
    invalidate_alias_cache(cache, None).await;
    Ok(())
}
