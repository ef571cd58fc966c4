//! The four LLM augmentation operations.
//!
//! Every operation degrades to identity/empty: an unavailable client, a
//! transport failure, malformed JSON, or a validation mismatch never
//! surfaces to the caller as an error — the pipeline simply proceeds with
//! what the deterministic stages produced.

use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;
use tracing::{debug, info};

use super::{ChatMessage, LlmClient};
use crate::cache::Cache;
use crate::search::Candidate;
use crate::search::manifest::{category_manifest, filter_for_narrow};
use crate::store::Db;
use crate::text::parser::ItemAttributes;
use crate::text::tokens::{TOKEN_RE, truncate_chars};

const REWRITE_MAX_TOKENS: usize = 6;
const ALTERNATIVES_MAX: usize = 5;
const ALTERNATIVE_MAX_CHARS: usize = 60;
const NARROW_MAX_CATEGORIES: usize = 5;
const RERANK_MAX_BEST: usize = 5;

// ── JSON extraction ────────────────────────────────────────────────

/// Extract the first balanced `{...}` object from free-form model output.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (idx, ch) in text.char_indices().skip_while(|(i, _)| *i < start) {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return text.get(start..idx + ch.len_utf8()).map(|s| s.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the earliest JSON array or object payload from model output.
pub fn extract_json_payload(text: &str) -> Option<serde_json::Value> {
    let mut starts: Vec<(usize, char)> = Vec::new();
    if let Some(i) = text.find('[') {
        starts.push((i, ']'));
    }
    if let Some(i) = text.find('{') {
        starts.push((i, '}'));
    }
    starts.sort_by_key(|(i, _)| *i);
    let (start, closer) = *starts.first()?;
    let end = text.rfind(closer)?;
    if end <= start {
        return None;
    }
    let snippet = text.get(start..=end)?;
    serde_json::from_str(snippet).ok()
}

// ── Rewrite ────────────────────────────────────────────────────────

/// Compress a noisy request into a short catalog query. Failure returns the
/// input unchanged.
pub async fn rewrite_query(llm: &LlmClient, text: &str) -> String {
    if !llm.available() {
        return text.to_string();
    }
    let prompt = "Перепиши пользовательский запрос в короткий поисковый запрос для товарного каталога. \
        Верни только одну строку без пояснений, 2-6 слов, без знаков препинания. \
        Убери мусор и вводные слова (мне нужно, пожалуйста, универсальные, по кор, наличие). \
        Сохрани критические токены: название товара, модель/серия, размеры, числа (например 70, 5, 308, ll70).";
    let raw = match llm
        .chat(
            &[ChatMessage::system(prompt), ChatMessage::user(text)],
            0.1,
        )
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            info!("llm rewrite failed: {e}");
            return text.to_string();
        }
    };
    parse_rewrite_content(&raw, text)
}

fn parse_rewrite_content(raw: &str, fallback: &str) -> String {
    let lowered = raw.to_lowercase();
    let tokens: Vec<&str> = TOKEN_RE
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .take(REWRITE_MAX_TOKENS)
        .collect();
    if tokens.is_empty() {
        fallback.to_string()
    } else {
        tokens.join(" ")
    }
}

// ── Normalize (suggest alternative queries) ────────────────────────

/// 3–5 alternative queries with quantities stripped. Failure returns `[]`.
pub async fn suggest_queries(llm: &LlmClient, user_text: &str) -> Vec<String> {
    if !llm.available() {
        return Vec::new();
    }
    let prompt = "Ты нормализуешь запросы для поиска по каталогу. \
        Ответь строго JSON в формате {\"alternatives\":[\"...\",\"...\",\"...\"],\"notes\":\"...\"}.\n\
        Правила:\n\
        - alternatives: 3-5 строк, максимум 60 символов каждая.\n\
        - Убери количества и единицы (10шт, 2рол, 1коробка).\n\
        - Преобразуй разговорные формы в нормальные термины.\n\
        - Числа и размеры сохраняй.\n\
        - Без лишнего текста вне JSON.";
    match llm
        .chat(
            &[ChatMessage::system(prompt), ChatMessage::user(user_text)],
            0.2,
        )
        .await
    {
        Ok(content) => parse_alternatives(&content),
        Err(e) => {
            info!("llm normalize failed: {e}");
            Vec::new()
        }
    }
}

fn parse_alternatives(content: &str) -> Vec<String> {
    let Some(data) = extract_json_payload(content) else {
        return Vec::new();
    };
    let Some(alternatives) = data.get("alternatives").and_then(|a| a.as_array()) else {
        return Vec::new();
    };
    let mut seen = std::collections::HashSet::new();
    let mut cleaned = Vec::new();
    for item in alternatives {
        let Some(value) = item.as_str() else { continue };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let value = truncate_chars(value, ALTERNATIVE_MAX_CHARS).trim_end().to_string();
        if !seen.insert(value.to_lowercase()) {
            continue;
        }
        cleaned.push(value);
        if cleaned.len() >= ALTERNATIVES_MAX {
            break;
        }
    }
    cleaned
}

// ── Narrow (categories) ────────────────────────────────────────────

/// Result of the category-narrowing call.
#[derive(Debug, Clone, PartialEq)]
pub struct NarrowOutcome {
    pub category_ids: Vec<i64>,
    pub confidence: f64,
    pub reason: String,
}

impl NarrowOutcome {
    fn failed(reason: &str) -> Self {
        Self {
            category_ids: Vec::new(),
            confidence: 0.0,
            reason: reason.to_string(),
        }
    }
}

static NARROW_QTY_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b\d+(?:[.,]\d+)?\s*(?:шт|штук|кг|уп|упаков\w*|кор|короб\w*|рол|рул|рулон|комплект|м|пог\.м)\b",
    )
    .unwrap()
});
static NARROW_DASH_QTY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-–—]\s*\d+\s*(?:рол|рул|рулон|уп|кор|шт|штук)\b").unwrap());
static NARROW_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

fn narrow_query(text: &str) -> String {
    let cleaned = text.to_lowercase();
    let cleaned = NARROW_DASH_QTY_RE.replace_all(&cleaned, "");
    let cleaned = NARROW_QTY_UNIT_RE.replace_all(&cleaned, "");
    NARROW_SPACE_RE.replace_all(&cleaned, " ").trim().to_string()
}

/// Ask the LLM to pick up to 5 categories *from the supplied manifest only*.
/// Any id outside the manifest rejects the whole response as `parse_failed`.
pub async fn narrow_categories(
    llm: &LlmClient,
    db: &Db,
    cache: &Cache,
    user_text: &str,
) -> NarrowOutcome {
    if !llm.available() {
        return NarrowOutcome::failed("llm_disabled");
    }
    let manifest = match category_manifest(db, cache).await {
        Ok(manifest) => manifest,
        Err(e) => {
            info!("category manifest failed: {e}");
            return NarrowOutcome::failed("manifest_failed");
        }
    };
    let filtered = filter_for_narrow(&manifest);
    let context_items: Vec<serde_json::Value> = filtered
        .iter()
        .map(|entry| {
            json!({
                "id": entry.category_id,
                "path": entry.path,
                "count": entry.count_direct,
                "examples": entry.examples,
            })
        })
        .collect();
    let allowed: Vec<i64> = filtered.iter().map(|e| e.category_id).collect();

    let prompt = "Выбери до 5 наиболее релевантных категорий для запроса. \
        Выбирай category_ids только из списка ids. Если не уверен — верни []. \
        Ответь строго JSON: {\"category_ids\":[1,2],\"confidence\":0.0,\"reason\":\"...\"}.";
    let user_payload = json!({
        "query": narrow_query(user_text),
        "categories": context_items,
    });
    match llm
        .chat(
            &[
                ChatMessage::system(prompt),
                ChatMessage::user(user_payload.to_string()),
            ],
            0.2,
        )
        .await
    {
        Ok(content) => validate_narrow_response(&content, &allowed),
        Err(e) => {
            info!("llm category narrow failed: {e}");
            NarrowOutcome::failed("llm_failed")
        }
    }
}

fn validate_narrow_response(content: &str, allowed: &[i64]) -> NarrowOutcome {
    let Some(data) = extract_json_payload(content) else {
        return NarrowOutcome::failed("parse_failed");
    };
    let Some(ids) = data.get("category_ids").and_then(|v| v.as_array()) else {
        return NarrowOutcome::failed("parse_failed");
    };
    let mut cleaned = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for value in ids {
        let Some(id) = value.as_i64() else {
            return NarrowOutcome::failed("parse_failed");
        };
        if !allowed.contains(&id) {
            return NarrowOutcome::failed("parse_failed");
        }
        if !seen.insert(id) {
            continue;
        }
        cleaned.push(id);
        if cleaned.len() >= NARROW_MAX_CATEGORIES {
            break;
        }
    }
    let confidence = data.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0);
    let reason = data
        .get("reason")
        .and_then(|r| r.as_str())
        .unwrap_or("")
        .to_string();
    NarrowOutcome {
        category_ids: cleaned,
        confidence,
        reason,
    }
}

// ── Rerank ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RerankEntry {
    pub product_id: i64,
    pub score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RerankOutcome {
    pub best: Vec<RerankEntry>,
}

/// Reorder 2–30 candidates by LLM relevance scores. Failure or fewer than
/// two candidates yields an empty outcome.
pub async fn rerank_products(
    llm: &LlmClient,
    query: &str,
    candidates: &[Candidate],
    attrs: Option<&ItemAttributes>,
) -> RerankOutcome {
    if candidates.len() < 2 || !llm.available() {
        return RerankOutcome::default();
    }
    let payload: Vec<serde_json::Value> = candidates
        .iter()
        .map(|c| {
            json!({
                "product_id": c.id,
                "title": c.title_ru,
                "category": c.category_id,
                "price": c.price,
                "stock": c.stock_qty,
            })
        })
        .collect();
    let attrs_json = attrs
        .map(|a| serde_json::to_value(a).unwrap_or_else(|_| json!({})))
        .unwrap_or_else(|| json!({}));

    let prompt = format!(
        "Ты ранжируешь список товаров по релевантности запросу. \
         Верни строго JSON: {{\"best\":[{{\"product_id\":int,\"score\":float,\"reason\":str}}],\
         \"need_clarify\":[{{\"field\":\"qty|unit|size|color|code|din\",\"reason\":str}}]}}. \
         best максимум 5, score 0..1. Без лишнего текста. \
         Запрос: {query}. Атрибуты: {attrs_json}. Кандидаты: {}",
        serde_json::Value::Array(payload)
    );
    match llm
        .chat(
            &[
                ChatMessage::system("Ты помощник по подбору товаров."),
                ChatMessage::user(prompt),
            ],
            0.1,
        )
        .await
    {
        Ok(content) => {
            let outcome = parse_rerank_content(&content);
            if let Some(top) = outcome.best.first() {
                info!(
                    "llm rerank best={} top_score={}",
                    top.product_id, top.score
                );
            }
            outcome
        }
        Err(e) => {
            info!("llm rerank failed: {e}");
            RerankOutcome::default()
        }
    }
}

fn parse_rerank_content(content: &str) -> RerankOutcome {
    let Some(raw) = extract_json_object(content) else {
        return RerankOutcome::default();
    };
    let Ok(data) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return RerankOutcome::default();
    };
    let Some(best_raw) = data.get("best").and_then(|b| b.as_array()) else {
        return RerankOutcome::default();
    };
    let mut seen = std::collections::HashSet::new();
    let mut best = Vec::new();
    for item in best_raw {
        let Some(product_id) = item.get("product_id").and_then(|p| p.as_i64()) else {
            continue;
        };
        if !seen.insert(product_id) {
            continue;
        }
        let score = item.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0);
        let reason = item
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        best.push(RerankEntry {
            product_id,
            score,
            reason,
        });
        if best.len() >= RERANK_MAX_BEST {
            break;
        }
    }
    debug!("rerank parsed {} entries", best.len());
    RerankOutcome { best }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_client_degrades_to_identity() {
        let llm = LlmClient::disabled();
        assert_eq!(rewrite_query(&llm, "мне нужно поролон").await, "мне нужно поролон");
        assert!(suggest_queries(&llm, "поролон").await.is_empty());
        let narrow = narrow_categories(
            &llm,
            &Db::open_in_memory().unwrap(),
            &Cache::disabled(),
            "поролон",
        )
        .await;
        assert_eq!(narrow.reason, "llm_disabled");
        assert_eq!(narrow.confidence, 0.0);
    }

    #[test]
    fn rewrite_parse_caps_tokens() {
        assert_eq!(
            parse_rewrite_content("Поролон Мебельный 50 мм листовой белый упаковка", "x"),
            "поролон мебельный 50 мм листовой белый"
        );
        assert_eq!(parse_rewrite_content("?!...", "исходный запрос"), "исходный запрос");
    }

    #[test]
    fn alternatives_are_deduped_and_capped() {
        let content = r#"{"alternatives":["Поролон 50мм","поролон 50мм","синтепон","",
            "спанбонд","молния","нитки","иголки"],"notes":""}"#;
        let parsed = parse_alternatives(content);
        assert_eq!(parsed.len(), 5);
        assert_eq!(parsed[0], "Поролон 50мм");
        assert!(!parsed.contains(&"".to_string()));
    }

    #[test]
    fn narrow_rejects_ids_outside_manifest() {
        let outcome =
            validate_narrow_response(r#"{"category_ids":[1,99],"confidence":0.9}"#, &[1, 2, 3]);
        assert_eq!(outcome.reason, "parse_failed");
        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome.category_ids.is_empty());
    }

    #[test]
    fn narrow_accepts_manifest_subset() {
        let outcome = validate_narrow_response(
            r#"Вот ответ: {"category_ids":[2,1,2],"confidence":0.7,"reason":"крепёж"}"#,
            &[1, 2, 3],
        );
        assert_eq!(outcome.category_ids, vec![2, 1]);
        assert!((outcome.confidence - 0.7).abs() < 1e-9);
        assert_eq!(outcome.reason, "крепёж");
    }

    #[test]
    fn rerank_parse_dedupes_and_caps() {
        let content = r#"{"best":[
            {"product_id":1,"score":0.9,"reason":"точный размер"},
            {"product_id":1,"score":0.8},
            {"product_id":2,"score":0.5},
            {"product_id":3,"score":0.4},
            {"product_id":4,"score":0.3},
            {"product_id":5,"score":0.2},
            {"product_id":6,"score":0.1}
        ],"need_clarify":[]}"#;
        let outcome = parse_rerank_content(content);
        assert_eq!(outcome.best.len(), 5);
        assert_eq!(outcome.best[0].product_id, 1);
        assert!((outcome.best[0].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn rerank_parse_tolerates_garbage() {
        assert!(parse_rerank_content("no json here").best.is_empty());
        assert!(parse_rerank_content("{\"best\": \"oops\"}").best.is_empty());
    }

    #[test]
    fn json_object_extraction_balances_braces() {
        assert_eq!(
            extract_json_object("prefix {\"a\": {\"b\": 1}} suffix"),
            Some("{\"a\": {\"b\": 1}}".to_string())
        );
        assert_eq!(extract_json_object("no object"), None);
    }

    #[test]
    fn narrow_query_strips_quantities() {
        assert_eq!(narrow_query("спанбонд 70 - 2 рул"), "спанбонд 70");
        assert_eq!(narrow_query("поролон 10шт"), "поролон");
    }
}
