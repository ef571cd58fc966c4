//! Shared token tables and query-shaping helpers.
//!
//! The stop-word, decorator, and color tables below are used by the catalog
//! index, the history retriever, the clarification builder, and the
//! orchestrator's attempt-query generation. Keeping them in one place is what
//! makes "token" mean the same thing across stages.

use regex::Regex;
use std::sync::LazyLock;

/// Word tokens: runs of lowercase latin/cyrillic letters and digits.
/// Callers are expected to pass text that went through [`normalize_query_text`]
/// (or at least lowercasing); [`tokenize`] lowercases defensively.
pub static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-zа-я0-9]+").unwrap());

/// Bare digit runs, including digits embedded in mixed tokens ("8x30" → 8, 30).
pub static NUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Size pair such as "8x30" / "8х30" / "8*30".
pub static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*[xх*]\s*(\d+)").unwrap());

static NON_ALNUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zа-я0-9]+").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Quantity/unit and measurement noise dropped from search tokens.
pub const STOP_WORDS: &[&str] = &[
    "шт", "штук", "кор", "короб", "коробка", "коробочки", "рул", "рулон", "рулонная", "уп",
    "упак", "упаковка", "мм", "см", "м", "м2", "кг", "гр", "г", "тип", "номер", "цвет", "no", "n",
];

/// The subset of [`STOP_WORDS`] that marks a quantity unit in the query
/// (used to decide whether a lone number is a quantity rather than a model
/// number).
pub const QTY_UNIT_TOKENS: &[&str] = &[
    "шт", "штук", "кор", "короб", "коробка", "коробочки", "рул", "рулон", "рулонная", "уп",
    "упак", "упаковка", "мм", "см", "м", "м2", "кг", "гр", "г",
];

/// Tokens that decorate a product phrase without narrowing it.
pub const DECORATOR_TOKENS: &[&str] = &[
    "светло", "темно", "универсальн", "по", "кор", "короб", "шт", "уп", "рул", "и", "на", "для",
    "нужно", "нужны", "дешев", "дешевая", "дешевый",
];

/// Color adjective roots recognized across the pipeline.
pub const COLOR_STEMS: &[&str] = &["сер", "беж", "бел", "черн", "син", "зел", "красн"];

const ADJ_ENDINGS: &[&str] = &[
    "ая", "яя", "ый", "ий", "ое", "ее", "ые", "ие", "ого", "ему", "ым", "ой", "ую", "юю",
];

/// Full color adjectives mapped straight to their search stem.
pub fn color_adjective_stem(token: &str) -> Option<&'static str> {
    match token {
        "серая" | "серый" | "серые" => Some("сер"),
        "белый" | "белая" | "белые" => Some("бел"),
        "черный" | "черная" => Some("черн"),
        "бежевый" | "бежевая" => Some("бежев"),
        _ => None,
    }
}

/// Short color roots mapped to the stem catalog titles actually use
/// ("беж" alone never appears in a title, "бежев(ый)" does).
pub fn color_stem_canonical(token: &str) -> Option<&'static str> {
    match token {
        "беж" => Some("бежев"),
        "сер" => Some("сер"),
        "бел" => Some("бел"),
        "черн" => Some("черн"),
        "син" => Some("син"),
        "зел" => Some("зел"),
        _ => None,
    }
}

/// The color root of a token, if the token *is* a color word.
///
/// A bare prefix test would swallow product names ("синтепон" starts with
/// "син"), so a prefixed token only counts as a color when little more than
/// an adjective ending follows the root.
pub fn color_stem_of(token: &str) -> Option<&'static str> {
    if let Some(stem) = color_adjective_stem(token) {
        return Some(stem);
    }
    COLOR_STEMS
        .iter()
        .find(|stem| {
            token.starts_with(*stem) && char_len(token) - char_len(stem) <= 3
        })
        .copied()
}

/// Whether the token is a color word.
pub fn is_color_token(token: &str) -> bool {
    color_stem_of(token).is_some()
}

/// Character (not byte) length — all thresholds in this crate are in chars.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Truncate to at most `max` characters.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Collapse whitespace and shorten to `limit` chars with an ellipsis.
pub fn shorten(text: &str, limit: usize) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if char_len(&cleaned) <= limit {
        return cleaned;
    }
    let mut head: String = cleaned.chars().take(limit.saturating_sub(1)).collect();
    while head.ends_with(' ') {
        head.pop();
    }
    format!("{head}…")
}

/// Lowercase (with ё→е) and split into word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase().replace('ё', "е");
    TOKEN_RE
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// True when the token is a pure digit run.
pub fn is_digit_token(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

/// Canonical query form: lowercase, ё→е, everything non-alphanumeric becomes
/// a single space.
pub fn normalize_query_text(text: &str) -> String {
    let lowered = text.to_lowercase().replace('ё', "е");
    let spaced = NON_ALNUM_RE.replace_all(&lowered, " ");
    SPACE_RE.replace_all(&spaced, " ").trim().to_string()
}

/// Normalization for catalog titles and SKUs before they land in the
/// `*_norm` columns: like [`normalize_query_text`], plus size separators are
/// unified to a latin `x` so a "8х30"/"8 * 30" title matches the "8x30" the
/// message normalizer produces.
pub fn normalize_catalog_text(text: &str) -> String {
    let lowered = text.to_lowercase().replace('ё', "е");
    let sized = SIZE_UNIFY_RE.replace_all(&lowered, "${1}x${2}");
    let sized = SIZE_UNIFY_RE.replace_all(&sized, "${1}x${2}");
    normalize_query_text(&sized)
}

static SIZE_UNIFY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)\s*[xх*×]\s*(\d)").unwrap());

/// Reduce a Russian adjective to its stem: known color adjectives map to
/// their color stem, everything else loses a recognized ending as long as a
/// stem of at least 3 chars remains. Digits and short tokens pass through.
pub fn normalize_ru_adj_stem(token: &str) -> String {
    if let Some(stem) = color_adjective_stem(token) {
        return stem.to_string();
    }
    if is_digit_token(token) || char_len(token) < 5 {
        return token.to_string();
    }
    for ending in ADJ_ENDINGS {
        if let Some(stem) = token.strip_suffix(ending) {
            if char_len(stem) >= 3 {
                return stem.to_string();
            }
        }
    }
    token.to_string()
}

/// Deduplicate, keeping first occurrence and dropping blanks.
pub fn dedupe_keep_order(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for v in values {
        let key = v.trim().to_string();
        if key.is_empty() || !seen.insert(key.clone()) {
            continue;
        }
        out.push(key);
    }
    out
}

/// Stemmed tokens and standalone numbers for trace entries.
pub fn extract_trace_tokens_numbers(query: &str) -> (Vec<String>, Vec<i64>) {
    let normalized = normalize_query_text(query);
    let mut tokens = Vec::new();
    let mut numbers = Vec::new();
    for m in TOKEN_RE.find_iter(&normalized) {
        let token = m.as_str();
        if is_digit_token(token) {
            if let Ok(n) = token.parse::<i64>() {
                numbers.push(n);
            }
            continue;
        }
        let stemmed = normalize_ru_adj_stem(token);
        if STOP_WORDS.contains(&stemmed.as_str()) {
            continue;
        }
        tokens.push(stemmed);
    }
    (tokens, numbers)
}

/// Tokens the core attempt-query keeps even when short.
const CORE_KEEP: &[&str] = &["тип", "din", "лл", "лл70", "ll", "ll70"];

/// Ordered attempt-query variants: full → reduced (no decorators/stop words)
/// → no-color → core (≤ 6 anchors), deduplicated.
pub fn build_attempt_queries(query: &str) -> Vec<String> {
    let normalized = normalize_query_text(query);
    let base_tokens: Vec<String> = TOKEN_RE
        .find_iter(&normalized)
        .map(|m| normalize_ru_adj_stem(m.as_str()))
        .collect();
    if base_tokens.is_empty() {
        return if normalized.is_empty() {
            Vec::new()
        } else {
            vec![normalized]
        };
    }

    let full_query = base_tokens.join(" ");

    let reduced_tokens: Vec<&String> = base_tokens
        .iter()
        .filter(|t| !DECORATOR_TOKENS.contains(&t.as_str()) && !STOP_WORDS.contains(&t.as_str()))
        .collect();
    let reduced_query = reduced_tokens
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let no_color_tokens: Vec<&String> = reduced_tokens
        .iter()
        .filter(|t| !COLOR_STEMS.contains(&t.as_str()))
        .copied()
        .collect();
    let no_color_query = no_color_tokens
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let core_tokens: Vec<&str> = no_color_tokens
        .iter()
        .map(|t| t.as_str())
        .filter(|t| {
            is_digit_token(t)
                || t.chars().any(|c| c.is_ascii_digit())
                || CORE_KEEP.contains(t)
                || char_len(t) >= 4
        })
        .take(6)
        .collect();
    let core_query = core_tokens.join(" ");

    dedupe_keep_order(vec![full_query, reduced_query, no_color_query, core_query])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_query_text_flattens_punctuation() {
        assert_eq!(normalize_query_text("Болт, 8*30 (дин 933)"), "болт 8 30 дин 933");
        assert_eq!(normalize_query_text("Жёлтый"), "желтый");
    }

    #[test]
    fn adj_stemmer_handles_colors_and_endings() {
        assert_eq!(normalize_ru_adj_stem("серая"), "сер");
        assert_eq!(normalize_ru_adj_stem("белый"), "бел");
        assert_eq!(normalize_ru_adj_stem("мебельный"), "мебельн");
        // Too short to stem.
        assert_eq!(normalize_ru_adj_stem("мел"), "мел");
        // Digits pass through.
        assert_eq!(normalize_ru_adj_stem("933"), "933");
    }

    #[test]
    fn attempt_queries_are_ordered_and_deduped() {
        let attempts = build_attempt_queries("нитки светло серые по 10 шт");
        assert_eq!(attempts[0], "нитки светло сер по 10 шт");
        // Reduced drops decorators and units, no-color additionally drops "сер".
        assert!(attempts.contains(&"нитки сер 10".to_string()));
        assert!(attempts.contains(&"нитки 10".to_string()));
        // All variants distinct.
        let mut unique = attempts.clone();
        unique.dedup();
        assert_eq!(unique, attempts);
    }

    #[test]
    fn attempt_queries_keep_digit_tokens_in_core() {
        let attempts = build_attempt_queries("механизм 308 лл70");
        let core = attempts.last().unwrap();
        assert!(core.contains("308"));
        assert!(core.contains("лл70"));
    }

    #[test]
    fn trace_tokens_split_numbers() {
        let (tokens, numbers) = extract_trace_tokens_numbers("болт 8x30 дин 933 шт");
        assert!(tokens.contains(&"болт".to_string()));
        assert!(tokens.contains(&"8x30".to_string()));
        assert_eq!(numbers, vec![933]);
        assert!(!tokens.contains(&"шт".to_string()));
    }

    #[test]
    fn shorten_appends_ellipsis() {
        assert_eq!(shorten("короткий", 20), "короткий");
        let long = "очень длинное название товара для проверки";
        let short = shorten(long, 10);
        assert!(short.ends_with('…'));
        assert!(char_len(&short) <= 10);
    }
}
