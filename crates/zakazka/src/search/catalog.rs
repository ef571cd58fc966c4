//! Catalog index: token-AND / number-AND substring retrieval with a strict
//! post-filter. This is the canonical deterministic stage — it never talks
//! to the LLM.

use tracing::debug;

use super::Candidate;
use crate::store::catalog::{PrefetchFilter, ProductRow};
use crate::store::Db;
use crate::text::tokens::{
    QTY_UNIT_TOKENS, SIZE_RE, STOP_WORDS, TOKEN_RE, char_len, color_adjective_stem,
    color_stem_canonical, is_digit_token, normalize_query_text, tokenize,
};

/// How many rows the SQL prefetch may return before the strict post-filter.
const PREFETCH_LIMIT: usize = 100;

fn extract_numbers(normalized: &str) -> Vec<i64> {
    TOKEN_RE
        .find_iter(normalized)
        .filter_map(|m| {
            let t = m.as_str();
            is_digit_token(t).then(|| t.parse().ok()).flatten()
        })
        .collect()
}

fn extract_tokens(normalized: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for m in TOKEN_RE.find_iter(normalized) {
        let token = m.as_str();
        if is_digit_token(token) || STOP_WORDS.contains(&token) || char_len(token) <= 2 {
            continue;
        }
        let mapped = color_adjective_stem(token)
            .or_else(|| color_stem_canonical(token))
            .unwrap_or(token);
        tokens.push(mapped.to_string());
    }
    tokens
}

/// A single number next to a quantity unit is a quantity, not a model
/// number — drop it from the filter.
fn effective_numbers(normalized: &str, numbers: &[i64]) -> Vec<i64> {
    if numbers.is_empty() {
        return Vec::new();
    }
    let has_qty_units = TOKEN_RE
        .find_iter(normalized)
        .any(|m| QTY_UNIT_TOKENS.contains(&m.as_str()));
    if has_qty_units && numbers.len() == 1 {
        return Vec::new();
    }
    numbers.to_vec()
}

fn token_matches_words(token: &str, words: &[String]) -> bool {
    words.iter().any(|w| w == token || w.starts_with(token))
}

fn score_product(row: &ProductRow, q: &str, numbers: &[i64], query_has_din: bool) -> f64 {
    let mut score = 0.0;
    if !row.sku_norm.is_empty() && row.sku_norm.contains(q) {
        score += 3.0;
    }
    if row.title_norm.contains(q) {
        score += 1.5;
    }
    for n in numbers {
        if row.title_norm.contains(&n.to_string()) {
            score += 0.5;
        }
    }
    if query_has_din
        && numbers.contains(&933)
        && row.title_norm.contains("din")
        && row.title_norm.contains("933")
    {
        score += 2.5;
    }
    score
}

/// Deterministic catalog retrieval.
pub fn search_products(
    db: &Db,
    query: &str,
    limit: usize,
    category_ids: Option<&[i64]>,
    product_ids: Option<&[i64]>,
) -> Result<Vec<Candidate>, String> {
    let original = query.trim().to_lowercase();
    let q = normalize_query_text(query);
    let numbers = extract_numbers(&q);
    let tokens = extract_tokens(&q);
    let numbers_for_match = effective_numbers(&q, &numbers);

    let like_patterns: Vec<String> = if !numbers_for_match.is_empty() {
        numbers_for_match.iter().map(|n| format!("%{n}%")).collect()
    } else if !tokens.is_empty() {
        tokens.iter().map(|t| format!("%{t}%")).collect()
    } else {
        vec![format!("%{q}%")]
    };

    let mut rows = db.prefetch_products(&PrefetchFilter {
        like_patterns,
        category_ids: category_ids.map(|c| c.to_vec()),
        product_ids: product_ids.map(|p| p.to_vec()),
        limit: PREFETCH_LIMIT,
    })?;

    // Over-constrained number queries: retry on the size pair alone.
    if rows.is_empty() && numbers_for_match.len() >= 3 {
        let main_numbers: Vec<i64> = match SIZE_RE.captures(&original) {
            Some(caps) => vec![
                caps.get(1).unwrap().as_str().parse().unwrap_or(0),
                caps.get(2).unwrap().as_str().parse().unwrap_or(0),
            ],
            None => numbers_for_match.iter().take(2).copied().collect(),
        };
        rows = db.prefetch_products(&PrefetchFilter {
            like_patterns: main_numbers.iter().map(|n| format!("%{n}%")).collect(),
            limit: PREFETCH_LIMIT,
            ..Default::default()
        })?;
    }

    if !numbers_for_match.is_empty() {
        rows.retain(|row| {
            numbers_for_match
                .iter()
                .all(|n| row.title_norm.contains(&n.to_string()))
        });
    }

    if !tokens.is_empty() {
        rows.retain(|row| {
            let mut words = tokenize(&row.title_norm);
            words.extend(tokenize(&row.sku_norm));
            tokens.iter().all(|t| token_matches_words(t, &words))
        });
    }

    let query_has_din = original.contains("din") || original.contains("дин");
    let mut scored: Vec<Candidate> = rows
        .into_iter()
        .map(|row| {
            let score = score_product(&row, &q, &numbers, query_has_din);
            Candidate {
                id: row.id,
                sku: row.sku,
                title_ru: row.title_ru,
                price: row.price,
                stock_qty: row.stock_qty,
                score,
                category_id: row.category_id,
                attribute_conflict: false,
            }
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    scored.truncate(limit);
    debug!(
        "search_products query={q:?} numbers={numbers:?} results={}",
        scored.len()
    );
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(1, Some("BM-830"), "Болт мебельный 8 * 30 (din 603)", 2.0, 500, None)
            .unwrap();
        db.upsert_product(2, Some("B-830-933"), "Болт 8х30 DIN 933 оцинкованный", 3.0, 200, None)
            .unwrap();
        db.upsert_product(3, None, "Карандаш меловой белый для разметки", 15.0, 40, None)
            .unwrap();
        db.upsert_product(4, None, "Липа контактная белый 20мм", 5.0, 10, None)
            .unwrap();
        db.upsert_product(5, None, "Спанбонд 70 белый", 20.0, 100, None).unwrap();
        db.upsert_product(6, None, "Спанбонд 70 коричневый", 20.0, 90, None).unwrap();
        db
    }

    #[test]
    fn strict_filter_requires_every_number() {
        let db = fixture();
        let results = search_products(&db, "болт 8x30 din 933", 5, None, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 2);
    }

    #[test]
    fn din_bonus_boosts_exact_standard() {
        let db = fixture();
        let results = search_products(&db, "болт din 933", 5, None, None).unwrap();
        assert_eq!(results[0].id, 2);
        assert!(results[0].score >= 2.5);
    }

    #[test]
    fn color_token_excludes_other_colors() {
        let db = fixture();
        let results = search_products(&db, "спанбонд 70 белый", 5, None, None).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].title_ru.contains("белый"));
        assert!(!results[0].title_ru.contains("коричневый"));
    }

    #[test]
    fn qty_unit_discards_single_number() {
        let db = fixture();
        // "2" is a quantity, not a model number — must not filter on it.
        let results = search_products(&db, "мел белый 2 коробочки", 5, None, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 3);
        assert!(results[0].title_ru.to_lowercase().contains("мел"));
    }

    #[test]
    fn prefix_match_covers_inflected_words() {
        let db = fixture();
        // "меловой" prefix-matches "мел", "липа" does not contain "мел".
        let results = search_products(&db, "мел", 5, None, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 3);
    }

    #[test]
    fn product_id_restriction_applies() {
        let db = fixture();
        let results = search_products(&db, "спанбонд 70", 5, None, Some(&[6])).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 6);
    }

    #[test]
    fn every_result_satisfies_the_strict_property() {
        let db = fixture();
        let query = "болт 8x30 933";
        let q = normalize_query_text(query);
        let numbers = effective_numbers(&q, &extract_numbers(&q));
        let tokens = extract_tokens(&q);
        for candidate in search_products(&db, query, 10, None, None).unwrap() {
            let title_norm = crate::text::tokens::normalize_catalog_text(&candidate.title_ru);
            for n in &numbers {
                assert!(title_norm.contains(&n.to_string()), "{title_norm} missing {n}");
            }
            let mut words = tokenize(&title_norm);
            if let Some(sku) = &candidate.sku {
                words.extend(tokenize(sku));
            }
            for t in &tokens {
                assert!(token_matches_words(t, &words), "{title_norm} missing token {t}");
            }
        }
    }
}
