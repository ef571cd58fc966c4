//! Terminal pipeline outcomes and the stable decision payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::search::clarify::Clarification;
use crate::search::is_false;
use crate::text::parser::ParsedItem;

/// Terminal outcome of one pipeline invocation.
///
/// Control flow matches on this enum exhaustively — no string comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AliasOk,
    HistoryOk,
    LocalOk,
    LlmRewriteOk,
    LlmOk,
    LlmNarrowOk,
    NeedsClarification,
    NoMatch,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AliasOk => "alias_ok",
            Self::HistoryOk => "history_ok",
            Self::LocalOk => "local_ok",
            Self::LlmRewriteOk => "llm_rewrite_ok",
            Self::LlmOk => "llm_ok",
            Self::LlmNarrowOk => "llm_narrow_ok",
            Self::NeedsClarification => "needs_clarification",
            Self::NoMatch => "no_match",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a caller may want to know about how the decision was reached.
/// Field set is a stable contract with the dialog and admin layers.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionPayload {
    pub decision: Decision,
    pub parsed_items: Vec<ParsedItem>,
    pub original_query: String,
    pub alternatives: Vec<String>,
    pub used_alternative: Option<String>,
    pub candidates_count_final: usize,

    pub history_org_id: Option<i64>,
    pub history_candidates_count: i64,
    pub history_used: bool,
    pub history_query_used: Option<String>,
    pub history_candidates_found: usize,

    pub alias_candidates_count: usize,
    pub alias_used: bool,
    pub alias_query_used: Option<String>,
    pub alias_candidates_found: usize,

    pub category_ids: Vec<i64>,
    pub llm_narrow_confidence: Option<f64>,
    pub llm_narrow_reason: Option<String>,
    pub narrowed_query: Option<String>,

    pub rerank_used: bool,
    pub rerank_best_ids: Vec<i64>,
    pub rerank_top_score: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,

    pub candidates_count_before_llm: usize,
    pub llm_called: bool,
    pub llm_stage: String,

    pub synonym_retry_attempted: bool,
    pub synonym_map: BTreeMap<String, String>,
    pub query_retry: Option<String>,
    pub retry_results_count: usize,

    #[serde(skip_serializing_if = "is_false")]
    pub multi_item: bool,
}

impl DecisionPayload {
    /// A no-result payload — the base every invocation fills in.
    pub fn empty(original_query: &str) -> Self {
        Self {
            decision: Decision::NoMatch,
            parsed_items: Vec::new(),
            original_query: original_query.to_string(),
            alternatives: Vec::new(),
            used_alternative: None,
            candidates_count_final: 0,
            history_org_id: None,
            history_candidates_count: 0,
            history_used: false,
            history_query_used: None,
            history_candidates_found: 0,
            alias_candidates_count: 0,
            alias_used: false,
            alias_query_used: None,
            alias_candidates_found: 0,
            category_ids: Vec::new(),
            llm_narrow_confidence: None,
            llm_narrow_reason: None,
            narrowed_query: None,
            rerank_used: false,
            rerank_best_ids: Vec::new(),
            rerank_top_score: None,
            clarification: None,
            candidates_count_before_llm: 0,
            llm_called: false,
            llm_stage: "none".to_string(),
            synonym_retry_attempted: false,
            synonym_map: BTreeMap::new(),
            query_retry: None,
            retry_results_count: 0,
            multi_item: false,
        }
    }
}
