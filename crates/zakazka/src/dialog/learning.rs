//! The learning loop: turning confirmed resolutions into org aliases.
//!
//! The pipeline never writes — it only produces the artifacts. The dialog
//! layer calls in here after a successful ADD_ITEM (autolearn) or after the
//! user taps a concrete candidate (confirm).

use tracing::debug;

use crate::pipeline::PipelineResponse;
use crate::store::Db;
use crate::store::aliases::{normalize_alias_for_autolearn, upsert_org_alias_conn};
use crate::store::log::insert_search_log_conn;

/// A rerank this confident counts as a single-candidate resolution.
pub const RERANK_AUTOLEARN_THRESHOLD: f64 = 0.85;

fn autolearn_eligible(response: &PipelineResponse) -> Option<i64> {
    let top = response.results.first()?;
    if response.results.len() == 1 {
        return Some(top.id);
    }
    let confident = response
        .decision
        .rerank_top_score
        .is_some_and(|score| score >= RERANK_AUTOLEARN_THRESHOLD);
    confident
        .then(|| response.decision.rerank_best_ids.first().copied())
        .flatten()
}

/// Learn from a resolved ADD_ITEM when the outcome was unambiguous.
/// Returns whether an alias was written.
pub fn autolearn_from_result(
    db: &Db,
    org_id: i64,
    response: &PipelineResponse,
) -> Result<bool, String> {
    let Some(product_id) = autolearn_eligible(response) else {
        return Ok(false);
    };
    db.autolearn_org_alias(org_id, &response.decision.original_query, product_id)
}

/// The user explicitly confirmed a candidate — remember it unconditionally.
pub fn confirm_selection(
    db: &Db,
    org_id: i64,
    alias_text: &str,
    product_id: i64,
) -> Result<(), String> {
    db.upsert_org_alias(org_id, alias_text, product_id)
}

/// Finish an ADD_ITEM turn: autolearn (when eligible) and the audit-log row
/// commit together or not at all.
pub fn finalize_add_item(
    db: &Db,
    org_id: Option<i64>,
    user_id: Option<i64>,
    raw_text: &str,
    response: &PipelineResponse,
) -> Result<bool, String> {
    let parsed_json = serde_json::to_string(&response.decision)
        .map_err(|e| format!("failed to serialize decision: {e}"))?;
    let selected: Vec<_> = response.results.iter().take(5).collect();
    let selected_json = serde_json::to_string(&selected)
        .map_err(|e| format!("failed to serialize candidates: {e}"))?;
    let confidence = response.decision.rerank_top_score;

    let learn_target = org_id.and_then(|org| {
        autolearn_eligible(response).map(|product_id| (org, product_id))
    });

    db.in_transaction(|conn| {
        let mut learned = false;
        if let Some((org, product_id)) = learn_target {
            let normalized = normalize_alias_for_autolearn(&response.decision.original_query);
            if !normalized.is_empty() {
                upsert_org_alias_conn(conn, org, &normalized, product_id, chrono::Utc::now())?;
                learned = true;
            }
        }
        insert_search_log_conn(
            conn,
            user_id,
            raw_text,
            Some(&parsed_json),
            Some(&selected_json),
            confidence,
        )?;
        debug!("add-item finalized, learned={learned}");
        Ok(learned)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::llm::LlmClient;
    use crate::pipeline::{SearchRequest, run_search_pipeline};
    use crate::pipeline::decision::Decision;

    fn seeded_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.upsert_organization(1, "Мебель-Опт").unwrap();
        db.upsert_product(3, None, "Карандаш меловой белый для разметки", 15.0, 40, None)
            .unwrap();
        db.upsert_product(4, None, "Липа контактная белый 20мм", 5.0, 10, None)
            .unwrap();
        db
    }

    #[tokio::test]
    async fn autolearn_then_requery_hits_alias() {
        let db = seeded_db();
        let cache = Cache::disabled();
        let llm = LlmClient::disabled();

        let request = SearchRequest::new("мел белый 2 коробочки").with_org(1);
        let first = run_search_pipeline(&db, &cache, &llm, &request).await;
        assert_eq!(first.decision.decision, Decision::LocalOk);
        assert_eq!(first.results.len(), 1);
        assert!(autolearn_from_result(&db, 1, &first).unwrap());

        let second = run_search_pipeline(&db, &cache, &llm, &request).await;
        assert_eq!(second.decision.decision, Decision::AliasOk);
        assert_eq!(second.results[0].id, first.results[0].id);
    }

    #[tokio::test]
    async fn ambiguous_results_do_not_learn() {
        let db = seeded_db();
        db.upsert_product(5, None, "Карандаш меловой цветной", 15.0, 40, None)
            .unwrap();
        let cache = Cache::disabled();
        let llm = LlmClient::disabled();

        let response =
            run_search_pipeline(&db, &cache, &llm, &SearchRequest::new("карандаш меловой").with_org(1))
                .await;
        assert!(response.results.len() > 1);
        assert!(!autolearn_from_result(&db, 1, &response).unwrap());
    }

    #[tokio::test]
    async fn finalize_writes_log_and_alias_atomically() {
        let db = seeded_db();
        let cache = Cache::disabled();
        let llm = LlmClient::disabled();

        let response = run_search_pipeline(
            &db,
            &cache,
            &llm,
            &SearchRequest::new("мел белый").with_org(1).with_user(42),
        )
        .await;
        let learned =
            finalize_add_item(&db, Some(1), Some(42), "мел белый", &response).unwrap();
        assert!(learned);
        assert_eq!(db.search_log_count().unwrap(), 1);
        assert_eq!(
            db.find_org_alias_candidates(1, "мел белый", 5).unwrap(),
            vec![response.results[0].id]
        );
    }

    #[tokio::test]
    async fn confirm_reinforces_weight() {
        let db = seeded_db();
        confirm_selection(&db, 1, "мелок", 3).unwrap();
        confirm_selection(&db, 1, "мелок", 3).unwrap();
        assert_eq!(db.org_alias_weight(1, "мелок", 3).unwrap(), Some(2));
    }
}
