//! Category manifest for the LLM narrowing stage.
//!
//! The manifest flattens the category tree into `{id, path, count, examples}`
//! rows and is cached globally for 600 s — catalog imports are far rarer
//! than searches.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::cache::Cache;
use crate::store::Db;
use crate::store::catalog::CategoryRow;
use crate::text::tokens::shorten;

pub const MANIFEST_CACHE_KEY: &str = "category_manifest:v1";
const MANIFEST_CACHE_TTL: u64 = 600;
const EXAMPLES_PER_CATEGORY: usize = 5;
const EXAMPLE_MAX_CHARS: usize = 60;

/// Category paths that never make sense as narrowing targets.
const PATH_BLACKLIST: &[&str] = &[
    "удален", "удаленные", "устарел", "устарев", "наименован", "test", "cat",
];

/// How many filtered entries are offered to the LLM.
const NARROW_CONTEXT_LIMIT: usize = 150;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub category_id: i64,
    pub path: String,
    pub title: String,
    pub count_direct: i64,
    pub examples: Vec<String>,
}

fn build_path(category: &CategoryRow, by_id: &HashMap<i64, CategoryRow>) -> String {
    let mut parts = vec![category.title_ru.clone()];
    let mut visited = std::collections::HashSet::from([category.id]);
    let mut current = category;
    while let Some(parent_id) = current.parent_id {
        if !visited.insert(parent_id) {
            warn!("category cycle detected at id={parent_id}, truncating path");
            break;
        }
        let Some(parent) = by_id.get(&parent_id) else {
            break;
        };
        parts.push(parent.title_ru.clone());
        current = parent;
    }
    parts.reverse();
    parts.join("/")
}

/// Build (or fetch from cache) the full category manifest.
pub async fn category_manifest(db: &Db, cache: &Cache) -> Result<Vec<ManifestEntry>, String> {
    if let Some(cached) = cache.get_json::<Vec<ManifestEntry>>(MANIFEST_CACHE_KEY).await {
        return Ok(cached);
    }

    let categories = db.list_categories()?;
    let by_id: HashMap<i64, CategoryRow> =
        categories.iter().map(|c| (c.id, c.clone())).collect();
    let counts = db.product_counts_by_category()?;

    let mut manifest = Vec::with_capacity(categories.len());
    for category in &categories {
        let examples = db
            .category_examples(category.id, EXAMPLES_PER_CATEGORY)?
            .into_iter()
            .map(|t| shorten(&t, EXAMPLE_MAX_CHARS))
            .collect();
        manifest.push(ManifestEntry {
            category_id: category.id,
            path: build_path(category, &by_id),
            title: category.title_ru.clone(),
            count_direct: counts.get(&category.id).copied().unwrap_or(0),
            examples,
        });
    }

    cache.set_json(MANIFEST_CACHE_KEY, &manifest, MANIFEST_CACHE_TTL).await;
    Ok(manifest)
}

/// Filter the manifest down to plausible narrowing targets, strongest first.
pub fn filter_for_narrow(entries: &[ManifestEntry]) -> Vec<ManifestEntry> {
    let mut filtered: Vec<ManifestEntry> = entries
        .iter()
        .filter(|entry| {
            let title = entry.title.to_lowercase();
            let path = entry.path.to_lowercase();
            if PATH_BLACKLIST
                .iter()
                .any(|token| title.contains(token) || path.contains(token))
            {
                return false;
            }
            entry.count_direct > 0
        })
        .cloned()
        .map(|mut entry| {
            entry.examples.retain(|example| {
                example.chars().count() >= 2 && !example.chars().all(|c| c.is_ascii_digit())
            });
            entry
        })
        .filter(|entry| !entry.examples.is_empty())
        .collect();
    filtered.sort_by(|a, b| b.count_direct.cmp(&a.count_direct).then(a.category_id.cmp(&b.category_id)));
    filtered.truncate(NARROW_CONTEXT_LIMIT);
    for entry in &mut filtered {
        entry.examples.truncate(3);
    }
    filtered
}
