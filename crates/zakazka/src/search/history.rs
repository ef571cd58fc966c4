//! Scored retrieval over what the organization has ordered before.
//!
//! Anchors and numbers gate hard (a candidate missing a required size or
//! model number never surfaces); order frequency and recency rank what's
//! left. The springs attribute does not gate — it penalizes and flags, so a
//! "с пружинами" query can still show the historical "без пружин" item with
//! `attribute_conflict` raised.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use super::Candidate;
use crate::store::Db;
use crate::store::stats::HISTORY_SCAN_LIMIT;
use crate::text::tokens::{
    NUM_RE, STOP_WORDS, TOKEN_RE, char_len, is_color_token, is_digit_token, normalize_query_text,
    tokenize,
};

static DIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:din|дин)\s*(\d{3,4})").unwrap());

const MAX_ANCHORS: usize = 2;
const OPTIONAL_BONUS: f64 = 0.35;
const CONFLICT_PENALTY: f64 = 0.8;

#[derive(Debug, PartialEq)]
struct HistoryQuery {
    anchors: Vec<String>,
    optional: Vec<String>,
    numbers: Vec<i64>,
    with_springs: bool,
}

/// Split a query into hard anchors, soft optional tokens, required numbers,
/// and the springs attribute. DIN numbers are deliberately not required —
/// organizations habitually reorder an equivalent item under another
/// standard, and the catalog stage already rewards exact DIN hits.
fn tokenize_history_query(query: &str) -> HistoryQuery {
    let normalized = normalize_query_text(query);

    let din_spans: Vec<(usize, usize)> = DIN_RE
        .captures_iter(&normalized)
        .filter_map(|c| c.get(1).map(|m| (m.start(), m.end())))
        .collect();
    let numbers: Vec<i64> = NUM_RE
        .find_iter(&normalized)
        .filter(|m| {
            !din_spans
                .iter()
                .any(|(s, e)| m.start() >= *s && m.end() <= *e)
        })
        .filter_map(|m| m.as_str().parse().ok())
        .collect();

    let mut anchors = Vec::new();
    let mut optional = Vec::new();
    for m in TOKEN_RE.find_iter(&normalized) {
        let token = m.as_str();
        if is_digit_token(token) || STOP_WORDS.contains(&token) {
            continue;
        }
        // Springs words are the attribute axis, not a match requirement.
        if token.starts_with("пружин") {
            continue;
        }
        let has_digits = token.chars().any(|c| c.is_ascii_digit());
        if !has_digits
            && !is_color_token(token)
            && char_len(token) >= 4
            && anchors.len() < MAX_ANCHORS
        {
            anchors.push(token.to_string());
            continue;
        }
        if !has_digits && char_len(token) >= 3 {
            optional.push(token.to_string());
        }
    }

    let with_springs = TOKEN_RE
        .find_iter(&normalized)
        .any(|m| m.as_str().starts_with("пружин"))
        && !normalized.contains("без пружин");

    HistoryQuery {
        anchors,
        optional,
        numbers,
        with_springs,
    }
}

fn anchor_matches(anchor: &str, words: &[String]) -> bool {
    words.iter().any(|w| w == anchor || w.starts_with(anchor))
}

/// Products the org has ordered before, matching and scored for the query.
pub fn search_history_products(
    db: &Db,
    org_id: i64,
    query: &str,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<Candidate>, String> {
    let hq = tokenize_history_query(query);
    if hq.anchors.is_empty() && hq.numbers.is_empty() {
        return Ok(Vec::new());
    }

    let rows = db.history_rows(org_id, HISTORY_SCAN_LIMIT)?;
    let mut scored: Vec<Candidate> = Vec::new();
    for row in rows {
        if hq
            .numbers
            .iter()
            .any(|n| !row.title_norm.contains(&n.to_string()))
        {
            continue;
        }
        let mut words = tokenize(&row.title_norm);
        words.extend(tokenize(&row.sku_norm));
        if hq.anchors.iter().any(|a| !anchor_matches(a, &words)) {
            continue;
        }

        let conflict = hq.with_springs && row.title_norm.contains("без пружин");
        let overlap = hq
            .optional
            .iter()
            .filter(|t| words.iter().any(|w| w == *t))
            .count() as f64;
        let recency = row
            .last_order_at
            .map(|last| {
                let days = (now - last).num_days().max(0) as f64;
                1.0 / (1.0 + days / 30.0)
            })
            .unwrap_or(0.0);
        let score = (1.0 + row.orders_count as f64).ln() + recency + OPTIONAL_BONUS * overlap
            - if conflict { CONFLICT_PENALTY } else { 0.0 };

        scored.push(Candidate {
            id: row.product_id,
            sku: row.sku,
            title_ru: row.title_ru,
            price: row.price,
            stock_qty: row.stock_qty,
            score,
            category_id: None,
            attribute_conflict: conflict,
        });
    }

    // A conflicting candidate never outranks a clean one, whatever the
    // frequency gap; within a group the score decides.
    scored.sort_by(|a, b| {
        a.attribute_conflict
            .cmp(&b.attribute_conflict)
            .then(
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.id.cmp(&b.id))
    });
    scored.truncate(limit);
    debug!(
        "history search org={org_id} anchors={:?} numbers={:?} results={}",
        hq.anchors,
        hq.numbers,
        scored.len()
    );
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::stats::OrderedLine;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn ordered(db: &Db, org: i64, product: i64, times: usize, at: DateTime<Utc>) {
        for _ in 0..times {
            db.upsert_org_product_stats(
                org,
                &[OrderedLine {
                    product_id: product,
                    qty: 10.0,
                    unit: Some("шт".into()),
                    ordered_at: Some(at),
                }],
            )
            .unwrap();
        }
    }

    #[test]
    fn query_tokenization_separates_anchors_and_numbers() {
        let hq = tokenize_history_query("болт 8x30 дин 933");
        assert_eq!(hq.anchors, vec!["болт"]);
        // The size numbers gate; the DIN number does not.
        assert_eq!(hq.numbers, vec![8, 30]);
        assert!(!hq.with_springs);
    }

    #[test]
    fn springs_detection() {
        let hq = tokenize_history_query("блок с пружинами");
        assert!(hq.with_springs);
        let hq = tokenize_history_query("блок без пружин");
        assert!(!hq.with_springs);
    }

    #[test]
    fn reorders_habitual_item_despite_other_din() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(5, None, "Болт мебельный 8 * 30 (din 603)", 2.0, 100, None)
            .unwrap();
        db.upsert_product(9, None, "Гайка м10", 1.0, 100, None).unwrap();
        ordered(&db, 1, 5, 10, ts(2026, 7, 20));
        ordered(&db, 1, 9, 3, ts(2026, 7, 20));

        let results =
            search_history_products(&db, 1, "болт 8x30 дин 933", 5, ts(2026, 7, 30)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 5);
        assert!(!results[0].attribute_conflict);
    }

    #[test]
    fn required_number_gates_hard() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(5, None, "Болт мебельный 8 * 30", 2.0, 100, None).unwrap();
        ordered(&db, 1, 5, 5, ts(2026, 7, 1));
        let results =
            search_history_products(&db, 1, "болт 10x40", 5, ts(2026, 7, 30)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn springs_conflict_is_flagged_and_penalized() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(1, None, "Блок независимый без пружин 1000", 50.0, 5, None)
            .unwrap();
        db.upsert_product(2, None, "Блок независимый с пружинами 1000", 60.0, 5, None)
            .unwrap();
        ordered(&db, 1, 1, 8, ts(2026, 7, 25));
        ordered(&db, 1, 2, 2, ts(2026, 7, 25));

        let results =
            search_history_products(&db, 1, "блок с пружинами 1000", 5, ts(2026, 7, 30)).unwrap();
        assert_eq!(results.len(), 2);
        // The no-springs item was ordered far more often, but the penalty
        // keeps the matching item on top; the conflicting one stays flagged.
        assert_eq!(results[0].id, 2);
        assert!(!results[0].attribute_conflict);
        assert_eq!(results[1].id, 1);
        assert!(results[1].attribute_conflict);
    }

    #[test]
    fn more_orders_rank_higher() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(1, None, "Нитки белые 40лл", 5.0, 50, None).unwrap();
        db.upsert_product(2, None, "Нитки белые 70лл", 5.0, 50, None).unwrap();
        ordered(&db, 1, 1, 2, ts(2026, 7, 1));
        ordered(&db, 1, 2, 9, ts(2026, 7, 1));
        let results = search_history_products(&db, 1, "нитки", 5, ts(2026, 7, 30)).unwrap();
        assert_eq!(results[0].id, 2);
    }

    #[test]
    fn tenant_isolation() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(1, None, "Поролон 50мм", 5.0, 50, None).unwrap();
        ordered(&db, 1, 1, 4, ts(2026, 7, 1));
        let other_org =
            search_history_products(&db, 2, "поролон", 5, ts(2026, 7, 30)).unwrap();
        assert!(other_org.is_empty());
    }
}
