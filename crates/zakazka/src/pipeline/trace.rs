//! Structured trace emitted alongside every pipeline result.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::search::Candidate;
use crate::text::parser::ParsedItem;
use crate::text::tokens::extract_trace_tokens_numbers;

/// One retrieval attempt inside a stage.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptTrace {
    pub query_used: String,
    pub candidates_found: usize,
    pub note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates_count: Option<i64>,
}

/// One stage of the pipeline, with optional stage-specific extras.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StageTrace {
    pub name: String,
    pub query_used: String,
    pub tokens_used: Vec<String>,
    pub numbers_used: Vec<i64>,
    pub product_ids_filter_count: Option<usize>,
    pub category_ids_filter: Vec<i64>,
    pub candidates_before: usize,
    pub candidates_after: usize,
    pub top5_titles: Vec<String>,
    pub notes: String,

    // Attempt-driven stages (history, local).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_queries: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_query_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<Vec<AttemptTrace>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_total_available: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_used: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_conflict: Option<bool>,

    // LLM rewrite stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates_found: Option<usize>,

    // Synonym retry stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synonyms_applied: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synonym_map: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_retry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_results_count: Option<usize>,

    // Clarify stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarify_total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarify_offset: Option<usize>,
}

impl StageTrace {
    /// Base entry with the common field set filled in.
    pub fn entry(
        name: &str,
        query_used: &str,
        candidates_before: usize,
        candidates: &[Candidate],
        notes: impl Into<String>,
    ) -> Self {
        let (tokens_used, numbers_used) = extract_trace_tokens_numbers(query_used);
        Self {
            name: name.to_string(),
            query_used: query_used.to_string(),
            tokens_used,
            numbers_used,
            candidates_before,
            candidates_after: candidates.len(),
            top5_titles: candidates.iter().take(5).map(|c| c.title_ru.clone()).collect(),
            notes: notes.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceInput {
    pub raw_text: String,
    pub normalized_text: String,
    pub parsed_items: Vec<ParsedItem>,
    pub org_id: Option<i64>,
    pub user_id: Option<i64>,
}

/// Clarify summary attached at trace top level.
#[derive(Debug, Clone, Serialize)]
pub struct ClarifySummary {
    pub reason: String,
    pub options_count: usize,
    pub selected_facet: Option<String>,
    pub clarify_total: usize,
    pub clarify_offset: usize,
}

/// The full trace of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub input: TraceInput,
    pub history_attempts: Vec<AttemptTrace>,
    pub local_attempts: Vec<AttemptTrace>,
    pub candidates_count_before_llm: usize,
    pub llm_called: bool,
    pub llm_stage: String,
    pub synonym_retry_attempted: bool,
    pub synonym_map: BTreeMap<String, String>,
    pub query_retry: Option<String>,
    pub retry_results_count: usize,
    pub stages: Vec<StageTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarify: Option<ClarifySummary>,
}
