//! Retrieval stages: deterministic catalog index, per-tenant scored history,
//! synonym rewrites, the category manifest, and the clarification builder.

pub mod catalog;
pub mod clarify;
pub mod history;
pub mod manifest;
pub mod synonyms;

use serde::Serialize;

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}

/// A product candidate as returned from any retrieval stage.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Candidate {
    pub id: i64,
    pub sku: Option<String>,
    pub title_ru: String,
    pub price: f64,
    pub stock_qty: i64,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<i64>,
    /// Set by the history retriever when the candidate contradicts a
    /// requested attribute (currently the springs/no-springs axis).
    #[serde(skip_serializing_if = "is_false")]
    pub attribute_conflict: bool,
}
