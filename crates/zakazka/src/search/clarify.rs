//! Clarification builder: bounded, paginated questions produced when
//! retrieval finds nothing (head-token suggestions) or far too much
//! (max-entropy facet values).

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::Candidate;
use crate::store::Db;
use crate::text::tokens::{TOKEN_RE, char_len, is_digit_token, shorten};

pub const CLARIFY_PAGE_SIZE: usize = 10;
pub const FACET_MAX_VALUES: usize = 30;
const HEAD_SUGGESTION_LIMIT: usize = 60;
const LABEL_MAX_CHARS: usize = 56;

const HEAD_STOP_TOKENS: &[&str] = &[
    "по", "и", "для", "на", "в", "с", "без", "шт", "штук", "кг", "мм", "см", "тип", "нужно",
    "добавь", "добавить",
];

static FACET_COLOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(бел|беж|сер|черн|син|зел|красн|коричн)[а-я]*").unwrap());
static FACET_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+x\d+\b").unwrap());
static FACET_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d{3,5})\)").unwrap());
static FACET_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bтип\s*\d+").unwrap());

/// What choosing an option does to the query.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApplyAction {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub append_tokens: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub restrict_category_ids: Vec<i64>,
}

impl ApplyAction {
    pub fn append(token: impl Into<String>) -> Self {
        Self {
            append_tokens: vec![token.into()],
            restrict_category_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClarifyOption {
    pub id: String,
    pub label: String,
    pub apply: ApplyAction,
}

/// A paginated clarification question.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Clarification {
    pub question: String,
    pub reason: String,
    pub options: Vec<ClarifyOption>,
    pub offset: usize,
    pub next_offset: Option<usize>,
    pub prev_offset: Option<usize>,
    pub total: usize,
}

/// A candidate phrase offered as an option.
#[derive(Debug, Clone)]
pub struct Suggestion {
    pub product_id: Option<i64>,
    pub title: String,
}

/// First query token that could name a product family.
pub fn extract_head_token(query: &str) -> Option<String> {
    let lowered = query.to_lowercase().replace('ё', "е");
    for m in TOKEN_RE.find_iter(&lowered) {
        let token = m.as_str();
        if HEAD_STOP_TOKENS.contains(&token) || is_digit_token(token) || char_len(token) < 4 {
            continue;
        }
        return Some(token.to_string());
    }
    None
}

/// Previously ordered products whose title matches the head token.
pub fn history_suggestions(
    db: &Db,
    org_id: i64,
    token: &str,
    limit: usize,
) -> Result<Vec<Suggestion>, String> {
    if token.is_empty() {
        return Ok(Vec::new());
    }
    Ok(db
        .history_title_matches(org_id, token, limit.min(HEAD_SUGGESTION_LIMIT))?
        .into_iter()
        .map(|(product_id, title)| Suggestion {
            product_id: Some(product_id),
            title,
        })
        .collect())
}

/// Shape suggestions into append-token options with absolute stable ids.
pub fn suggestions_to_options(suggestions: &[Suggestion]) -> Vec<ClarifyOption> {
    suggestions
        .iter()
        .enumerate()
        .map(|(i, s)| ClarifyOption {
            id: format!("opt_{}", i + 1),
            label: shorten(&s.title, LABEL_MAX_CHARS),
            apply: ApplyAction::append(s.title.clone()),
        })
        .collect()
}

/// The query a chosen option re-runs the pipeline with: the base query plus
/// the option's append tokens, with a reset clarify offset.
pub fn apply_option_query(base_query: &str, option: &ClarifyOption) -> String {
    let mut parts = vec![base_query.trim().to_string()];
    parts.extend(option.apply.append_tokens.iter().cloned());
    parts.join(" ").trim().to_string()
}

/// Default question for a clarification reason.
pub fn question_for_reason(reason: &str) -> &'static str {
    match reason {
        "no_candidates" => "Уточни товар:",
        _ => "Уточни вариант:",
    }
}

/// Paginate options into a clarification. A requested offset past the end is
/// clamped; `next`/`prev` offsets are only present when a page exists there.
pub fn build_clarification(
    reason: &str,
    options: Vec<ClarifyOption>,
    offset: usize,
    page_size: usize,
    question: &str,
) -> Clarification {
    let total = options.len();
    if total == 0 {
        return Clarification {
            question: "Не нашёл точный вариант. Уточни товар/артикул:".to_string(),
            reason: reason.to_string(),
            options: Vec::new(),
            offset: 0,
            next_offset: None,
            prev_offset: None,
            total: 0,
        };
    }

    let safe_offset = offset.min(total.saturating_sub(1));
    let page: Vec<ClarifyOption> = options
        .iter()
        .skip(safe_offset)
        .take(page_size)
        .cloned()
        .collect();
    let next_offset = (safe_offset + page_size < total).then_some(safe_offset + page_size);
    let prev_offset = if safe_offset >= page_size {
        Some(safe_offset - page_size)
    } else if safe_offset > 0 {
        Some(0)
    } else {
        None
    };

    Clarification {
        question: question.to_string(),
        reason: reason.to_string(),
        options: page,
        offset: safe_offset,
        next_offset,
        prev_offset,
        total,
    }
}

/// The color root a title mentions, if any ("бежевая" → "беж").
pub fn title_color_root(title: &str) -> Option<String> {
    let lowered = title.to_lowercase().replace('ё', "е");
    FACET_COLOR_RE
        .captures(&lowered)
        .map(|c| c.get(1).unwrap().as_str().to_string())
}

fn facet_value(facet: &str, title_lower: &str) -> Option<String> {
    match facet {
        "цвет" => FACET_COLOR_RE.find(title_lower).map(|m| m.as_str().to_string()),
        "размер" => FACET_SIZE_RE.find(title_lower).map(|m| m.as_str().to_string()),
        "код" => FACET_CODE_RE
            .captures(title_lower)
            .map(|c| c.get(1).unwrap().as_str().to_string()),
        "тип" => FACET_TYPE_RE.find(title_lower).map(|m| m.as_str().to_string()),
        _ => None,
    }
}

fn entropy(counts: &BTreeMap<String, usize>) -> f64 {
    let total: usize = counts.values().sum();
    if total == 0 {
        return 0.0;
    }
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / total as f64;
            -p * p.ln()
        })
        .sum()
}

/// Pick the facet that splits an over-broad candidate set best and emit its
/// values as append-token options. `None` when no facet has at least two
/// distinct values.
pub fn build_facet_options(
    candidates: &[Candidate],
    max_values: usize,
) -> Option<(String, Vec<ClarifyOption>)> {
    let titles: Vec<String> = candidates
        .iter()
        .map(|c| c.title_ru.to_lowercase().replace('ё', "е"))
        .collect();

    let mut best: Option<(f64, &str, BTreeMap<String, usize>)> = None;
    for facet in ["цвет", "размер", "код", "тип"] {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for title in &titles {
            if let Some(value) = facet_value(facet, title) {
                *counts.entry(value).or_insert(0) += 1;
            }
        }
        if counts.len() < 2 {
            continue;
        }
        let h = entropy(&counts);
        if best.as_ref().is_none_or(|(bh, _, _)| h > *bh) {
            best = Some((h, facet, counts));
        }
    }

    let (_, facet, counts) = best?;
    let mut values: Vec<(String, usize)> = counts.into_iter().collect();
    values.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    values.truncate(max_values);

    let options = values
        .into_iter()
        .enumerate()
        .map(|(i, (value, _))| ClarifyOption {
            id: format!("opt_{}", i + 1),
            label: value.clone(),
            apply: ApplyAction::append(value),
        })
        .collect();
    Some((facet.to_string(), options))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: i64, title: &str) -> Candidate {
        Candidate {
            id,
            sku: None,
            title_ru: title.to_string(),
            price: 1.0,
            stock_qty: 1,
            score: 0.0,
            category_id: None,
            attribute_conflict: false,
        }
    }

    #[test]
    fn head_token_skips_stops_digits_and_short() {
        assert_eq!(extract_head_token("добавь 3 нитки белые"), Some("нитки".into()));
        assert_eq!(extract_head_token("по 5 шт"), None);
        assert_eq!(extract_head_token("молния серая"), Some("молния".into()));
    }

    #[test]
    fn pagination_clamps_and_links() {
        let options: Vec<ClarifyOption> = (0..25)
            .map(|i| ClarifyOption {
                id: format!("opt_{}", i + 1),
                label: format!("вариант {i}"),
                apply: ApplyAction::append(format!("вариант {i}")),
            })
            .collect();

        let first = build_clarification("no_candidates", options.clone(), 0, 10, "Уточни товар:");
        assert_eq!(first.options.len(), 10);
        assert_eq!(first.next_offset, Some(10));
        assert_eq!(first.prev_offset, None);
        assert_eq!(first.total, 25);

        let last = build_clarification("no_candidates", options.clone(), 20, 10, "Уточни товар:");
        assert_eq!(last.options.len(), 5);
        assert_eq!(last.next_offset, None);
        assert_eq!(last.prev_offset, Some(10));

        let clamped = build_clarification("no_candidates", options, 999, 10, "Уточни товар:");
        assert_eq!(clamped.offset, 24);
    }

    #[test]
    fn empty_options_fall_back_to_plain_question() {
        let c = build_clarification("no_candidates", Vec::new(), 5, 10, "Уточни товар:");
        assert_eq!(c.total, 0);
        assert!(c.question.contains("артикул"));
        assert!(c.options.is_empty());
    }

    #[test]
    fn facet_prefers_the_most_divisive_axis() {
        let candidates: Vec<Candidate> = vec![
            candidate(1, "Спанбонд 70 белый"),
            candidate(2, "Спанбонд 70 белый широкий"),
            candidate(3, "Спанбонд 70 коричневый"),
            candidate(4, "Спанбонд 70 черный"),
        ];
        let (facet, options) = build_facet_options(&candidates, 30).unwrap();
        assert_eq!(facet, "цвет");
        let labels: Vec<&str> = options.iter().map(|o| o.label.as_str()).collect();
        assert!(labels.contains(&"белый"));
        assert!(labels.contains(&"черный"));
    }

    #[test]
    fn facet_requires_two_distinct_values() {
        let candidates = vec![
            candidate(1, "Спанбонд 70 белый"),
            candidate(2, "Спанбонд 80 белый"),
        ];
        // Color is uniform; size has two values and wins.
        let got = build_facet_options(&candidates, 30);
        assert!(got.is_none(), "no x-size in titles, color uniform: {got:?}");
    }

    #[test]
    fn size_facet_extracts_pairs() {
        let candidates = vec![
            candidate(1, "Болт 8x30 оцинкованный"),
            candidate(2, "Болт 8x40 оцинкованный"),
            candidate(3, "Болт 8x30 черный"),
        ];
        let (facet, options) = build_facet_options(&candidates, 30).unwrap();
        // Size splits 2/1; color appears once — only size qualifies.
        assert_eq!(facet, "размер");
        assert_eq!(options[0].label, "8x30");
    }

    #[test]
    fn suggestion_labels_are_shortened() {
        let suggestions = vec![Suggestion {
            product_id: Some(1),
            title: "Очень длинное название товара которое не помещается в кнопку никак".into(),
        }];
        let options = suggestions_to_options(&suggestions);
        assert!(char_len(&options[0].label) <= LABEL_MAX_CHARS);
        // The full title is still what gets appended.
        assert!(options[0].apply.append_tokens[0].contains("не помещается"));
    }
}
