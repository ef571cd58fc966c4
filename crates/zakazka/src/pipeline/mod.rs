//! The resolution pipeline: free text in, ranked candidates (or a bounded
//! clarification) out, with a structured trace of every stage.
//!
//! Stage order is fixed: alias → history → local catalog → LLM rewrite →
//! synonym retry → clarification gate → LLM normalize/narrow → rerank.
//! Any stage that fails internally is logged, recorded in the trace notes,
//! and treated as zero candidates — the pipeline itself never errors.

pub mod decision;
pub mod trace;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::dialog::{DialogContext, handle_message};
use crate::llm::LlmClient;
use crate::llm::ops::{narrow_categories, rerank_products, rewrite_query, suggest_queries};
use crate::search::Candidate;
use crate::search::catalog::search_products;
use crate::search::clarify::{
    CLARIFY_PAGE_SIZE, Clarification, FACET_MAX_VALUES, Suggestion, build_clarification,
    build_facet_options, extract_head_token, history_suggestions, question_for_reason,
    suggestions_to_options, title_color_root,
};
use crate::search::history::search_history_products;
use crate::search::synonyms::{alias_map, apply_token_synonyms};
use crate::store::Db;
use crate::text::parser::{ParsedItem, parse_order_text};
use crate::text::tokens::{
    TOKEN_RE, build_attempt_queries, color_stem_canonical, color_stem_of, normalize_catalog_text,
    normalize_query_text,
};

use decision::{Decision, DecisionPayload};
use trace::{AttemptTrace, ClarifySummary, StageTrace, Trace, TraceInput};

/// Candidate sets larger than this trigger a facet clarification.
const FACET_TRIGGER: usize = 30;
/// Rerank only makes sense for bounded ambiguity.
const RERANK_MIN: usize = 2;
const RERANK_MAX: usize = 30;
const ALIAS_LOOKUP_LIMIT: usize = 5;
const HEAD_SUGGESTION_LIMIT: usize = 60;

/// Input to one pipeline invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub org_id: Option<i64>,
    pub user_id: Option<i64>,
    pub text: String,
    pub limit: usize,
    pub enable_llm_narrow: bool,
    pub enable_llm_rewrite: bool,
    pub enable_rerank: bool,
    pub clarify_offset: usize,
    /// Clock override for reproducible history scoring; `None` = now.
    pub now: Option<DateTime<Utc>>,
}

impl SearchRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            org_id: None,
            user_id: None,
            text: text.into(),
            limit: 5,
            enable_llm_narrow: true,
            enable_llm_rewrite: true,
            enable_rerank: true,
            clarify_offset: 0,
            now: None,
        }
    }

    pub fn with_org(mut self, org_id: i64) -> Self {
        self.org_id = Some(org_id);
        self
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn with_clarify_offset(mut self, offset: usize) -> Self {
        self.clarify_offset = offset;
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }
}

/// Per-item outcome of a multi-item invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub item: ParsedItem,
    pub query_core: String,
    pub results: Vec<Candidate>,
    pub decision: DecisionPayload,
    pub trace: Trace,
}

/// The pipeline's return shape — a stable contract.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub results: Vec<Candidate>,
    pub decision: DecisionPayload,
    pub trace: Trace,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ItemOutcome>>,
}

fn empty_trace(req: &SearchRequest, parsed_items: Vec<ParsedItem>) -> Trace {
    Trace {
        input: TraceInput {
            raw_text: req.text.clone(),
            normalized_text: normalize_query_text(&req.text),
            parsed_items,
            org_id: req.org_id,
            user_id: req.user_id,
        },
        history_attempts: Vec::new(),
        local_attempts: Vec::new(),
        candidates_count_before_llm: 0,
        llm_called: false,
        llm_stage: "none".to_string(),
        synonym_retry_attempted: false,
        synonym_map: BTreeMap::new(),
        query_retry: None,
        retry_results_count: 0,
        stages: Vec::new(),
        clarify: None,
    }
}

/// First color root mentioned in the query, if any.
fn requested_color_stem(query: &str) -> Option<&'static str> {
    let normalized = normalize_query_text(query);
    TOKEN_RE
        .find_iter(&normalized)
        .find_map(|m| color_stem_of(m.as_str()))
}

fn pick_query<'a>(primary: &'a str, fallback: &'a str) -> &'a str {
    if primary.is_empty() { fallback } else { primary }
}

/// Post-check a retrieval hit against the color the query asked for.
///
/// An attempt variant may have dropped the color token to widen recall; a
/// hit found that way must not silently resolve to another color. Returns
/// the accepted candidates plus, when the hit set spans several colors and
/// none matches, the rejected pool (it feeds the color clarification).
fn apply_color_gate(
    stem: Option<&'static str>,
    found: Vec<Candidate>,
) -> (Vec<Candidate>, Option<Vec<Candidate>>) {
    let Some(stem) = stem else {
        return (found, None);
    };
    if found.is_empty() {
        return (found, None);
    }
    let canonical = color_stem_canonical(stem).unwrap_or(stem);
    let matching: Vec<Candidate> = found
        .iter()
        .filter(|c| {
            let title = normalize_catalog_text(&c.title_ru);
            title.contains(stem) || title.contains(canonical)
        })
        .cloned()
        .collect();
    if !matching.is_empty() {
        return (matching, None);
    }
    let distinct_colors: std::collections::HashSet<String> = found
        .iter()
        .filter_map(|c| title_color_root(&c.title_ru))
        .collect();
    if distinct_colors.len() >= 2 {
        (Vec::new(), Some(found))
    } else {
        (found, None)
    }
}

/// Run the full resolution pipeline for one message.
///
/// Multi-item messages recurse per item; the top-level `results` mirror the
/// first item's results for callers that read them directly, while `items`
/// carries every per-item outcome.
pub async fn run_search_pipeline(
    db: &Db,
    cache: &Cache,
    llm: &LlmClient,
    req: &SearchRequest,
) -> PipelineResponse {
    let parsed_items = parse_order_text(&req.text);

    if parsed_items.len() > 1 {
        let mut outcomes: Vec<ItemOutcome> = Vec::new();
        for item in &parsed_items {
            let item_query = pick_query(
                pick_query(item.query_core.trim(), item.query.trim()),
                item.raw.trim(),
            )
            .to_string();
            if item_query.is_empty() {
                continue;
            }
            let sub_req = SearchRequest {
                text: item_query.clone(),
                ..req.clone()
            };
            let sub = Box::pin(run_search_pipeline(db, cache, llm, &sub_req)).await;
            outcomes.push(ItemOutcome {
                item: item.clone(),
                query_core: item_query,
                results: sub.results,
                decision: sub.decision,
                trace: sub.trace,
            });
        }

        let (results, mut decision, trace) = match outcomes.first() {
            Some(primary) => (
                primary.results.clone(),
                primary.decision.clone(),
                primary.trace.clone(),
            ),
            None => (
                Vec::new(),
                DecisionPayload::empty(&req.text),
                empty_trace(req, parsed_items.clone()),
            ),
        };
        decision.multi_item = true;
        return PipelineResponse {
            results,
            decision,
            trace,
            items: Some(outcomes),
        };
    }

    run_single(db, cache, llm, req, parsed_items).await
}

#[allow(clippy::too_many_lines)]
async fn run_single(
    db: &Db,
    cache: &Cache,
    llm: &LlmClient,
    req: &SearchRequest,
    parsed_items: Vec<ParsedItem>,
) -> PipelineResponse {
    let now = req.now.unwrap_or_else(Utc::now);
    let handler_result = handle_message(&req.text, &DialogContext::default());

    let fallback_query = parsed_items
        .first()
        .map(|item| pick_query(item.query.trim(), item.raw.trim()).to_string())
        .unwrap_or_default();
    let primary_query = handler_result
        .items
        .first()
        .map(|item| item.normalized.clone())
        .unwrap_or_default();
    let mut search_query = parsed_items
        .first()
        .map(|item| item.query.trim().to_string())
        .filter(|q| !q.is_empty())
        .or_else(|| Some(primary_query.trim().to_string()).filter(|q| !q.is_empty()))
        .unwrap_or_else(|| fallback_query.clone());

    // Org resolution: explicit override first, else active membership.
    let history_org_id = match (req.org_id, req.user_id) {
        (Some(org), _) => Some(org),
        (None, Some(user)) => match db.resolve_org_for_user(user) {
            Ok(org) => org,
            Err(e) => {
                warn!("org resolution failed: {e}");
                None
            }
        },
        (None, None) => None,
    };

    // Synonyms before any retrieval.
    let map = alias_map(db, cache, history_org_id).await;
    let (canonical_query, applied_aliases) =
        apply_token_synonyms(pick_query(&search_query, &req.text), &map);
    if !canonical_query.is_empty() {
        search_query = canonical_query;
    }
    let normalized_text = normalize_query_text(pick_query(&search_query, &req.text));
    let attempt_queries = build_attempt_queries(pick_query(&search_query, &req.text));

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut synonym_map: BTreeMap<String, String> = applied_aliases.clone();
    let color_stem = requested_color_stem(pick_query(&search_query, &req.text));
    let mut color_gate_pool: Option<Vec<Candidate>> = None;

    // ── Stage 1: learned aliases ───────────────────────────────────
    let mut alias_candidates_count = 0usize;
    let mut alias_used = false;
    let mut alias_query_used: Option<String> = None;
    let mut alias_candidates_found = 0usize;
    let mut alias_product_ids: Vec<i64> = Vec::new();
    let mut alias_note = "skipped: org_id unresolved".to_string();
    if let Some(org) = history_org_id {
        match db.find_org_alias_candidates(org, &search_query, ALIAS_LOOKUP_LIMIT) {
            Ok(ids) => {
                alias_product_ids = ids;
                alias_candidates_count = alias_product_ids.len();
                if !alias_product_ids.is_empty() {
                    match search_products(
                        db,
                        &search_query,
                        req.limit,
                        None,
                        Some(&alias_product_ids),
                    ) {
                        Ok(found) if !found.is_empty() => {
                            candidates = found;
                            alias_used = true;
                            alias_query_used = Some(search_query.clone());
                            alias_candidates_found = candidates.len();
                            alias_note = "alias product_ids matched".to_string();
                        }
                        Ok(_) => {
                            alias_note =
                                "alias product_ids найден, но поиск вернул 0".to_string();
                        }
                        Err(e) => {
                            warn!("alias-restricted search failed: {e}");
                            alias_note = format!("alias search failed: {e}");
                        }
                    }
                } else {
                    alias_note = "alias candidates not found".to_string();
                }
            }
            Err(e) => {
                warn!("alias lookup failed: {e}");
                alias_note = format!("alias lookup failed: {e}");
            }
        }
    }
    let mut alias_stage = StageTrace::entry("alias", &search_query, 0, &candidates, alias_note);
    alias_stage.product_ids_filter_count = Some(alias_product_ids.len());

    // ── Stage 2: scored history ────────────────────────────────────
    let history_before = candidates.len();
    let mut history_candidates_count = 0i64;
    let mut history_used = false;
    let mut history_query_used: Option<String> = None;
    let mut history_candidates_found = 0usize;
    let mut history_attempts: Vec<AttemptTrace> = Vec::new();
    let mut history_attribute_conflict = false;
    let mut history_note = "skipped: already have candidates".to_string();
    if history_org_id.is_none() {
        history_note = "skipped: org_id unresolved".to_string();
    } else if let (Some(org), true) = (history_org_id, candidates.is_empty()) {
        history_candidates_count = db.count_org_candidates(org).unwrap_or_else(|e| {
            warn!("history count failed: {e}");
            0
        });
        for attempt_query in &attempt_queries {
            let found = match search_history_products(db, org, attempt_query, req.limit, now) {
                Ok(found) => found,
                Err(e) => {
                    warn!("history search failed: {e}");
                    history_attempts.push(AttemptTrace {
                        query_used: attempt_query.clone(),
                        candidates_found: 0,
                        note: format!("history search failed: {e}"),
                        candidates_count: Some(history_candidates_count),
                    });
                    continue;
                }
            };
            let (found, mismatch) = apply_color_gate(color_stem, found);
            if let Some(pool) = mismatch {
                history_attempts.push(AttemptTrace {
                    query_used: attempt_query.clone(),
                    candidates_found: 0,
                    note: "color mismatch".to_string(),
                    candidates_count: Some(history_candidates_count),
                });
                color_gate_pool = Some(pool);
                continue;
            }
            history_attempts.push(AttemptTrace {
                query_used: attempt_query.clone(),
                candidates_found: found.len(),
                note: if found.is_empty() {
                    "search returned 0".to_string()
                } else {
                    "hit".to_string()
                },
                candidates_count: Some(history_candidates_count),
            });
            if !found.is_empty() {
                history_attribute_conflict = found.iter().any(|c| c.attribute_conflict);
                history_candidates_found = found.len();
                history_query_used = Some(attempt_query.clone());
                history_used = true;
                candidates = found;
                history_note = "history scored retrieval matched".to_string();
                break;
            }
        }
        if !history_used {
            history_note = "history_soft_miss -> continue".to_string();
        }
    }
    let history_query_for_trace = history_query_used.clone().unwrap_or_else(|| search_query.clone());
    let mut history_stage = StageTrace::entry(
        "history",
        &history_query_for_trace,
        history_before,
        &candidates,
        history_note,
    );
    history_stage.product_ids_filter_count = Some(history_candidates_count.max(0) as usize);
    history_stage.attempt_queries = Some(attempt_queries.clone());
    history_stage.attempt_query_used = history_query_used.clone();
    history_stage.attempts = Some(history_attempts.clone());
    history_stage.history_total_available = Some(history_candidates_count);
    history_stage.history_used = Some(history_used);
    history_stage.attribute_conflict = Some(history_attribute_conflict);

    // ── Stage 3: local catalog ─────────────────────────────────────
    let local_before = candidates.len();
    let mut local_attempts: Vec<AttemptTrace> = Vec::new();
    let mut local_attempt_query_used: Option<String> = None;
    let mut local_note = "skipped: already have candidates".to_string();
    if parsed_items.is_empty() {
        local_note = "skipped: parse_order_text returned empty".to_string();
    } else if candidates.is_empty() {
        for attempt_query in &attempt_queries {
            let found = match search_products(db, attempt_query, req.limit, None, None) {
                Ok(found) => found,
                Err(e) => {
                    warn!("local search failed: {e}");
                    local_attempts.push(AttemptTrace {
                        query_used: attempt_query.clone(),
                        candidates_found: 0,
                        note: format!("local search failed: {e}"),
                        candidates_count: None,
                    });
                    continue;
                }
            };
            let (found, mismatch) = apply_color_gate(color_stem, found);
            if let Some(pool) = mismatch {
                local_attempts.push(AttemptTrace {
                    query_used: attempt_query.clone(),
                    candidates_found: 0,
                    note: "color mismatch".to_string(),
                    candidates_count: None,
                });
                color_gate_pool = Some(pool);
                continue;
            }
            if !found.is_empty() {
                local_attempts.push(AttemptTrace {
                    query_used: attempt_query.clone(),
                    candidates_found: found.len(),
                    note: "hit".to_string(),
                    candidates_count: None,
                });
                candidates = found;
                local_attempt_query_used = Some(attempt_query.clone());
                local_note = "local search matched".to_string();
                break;
            }
            local_attempts.push(AttemptTrace {
                query_used: attempt_query.clone(),
                candidates_found: 0,
                note: "search returned 0".to_string(),
                candidates_count: None,
            });
        }
        if candidates.is_empty() {
            local_note = "local search returned 0".to_string();
        }
    }
    let local_query_for_trace = local_attempt_query_used.clone().unwrap_or_else(|| search_query.clone());
    let mut local_stage = StageTrace::entry(
        "local",
        &local_query_for_trace,
        local_before,
        &candidates,
        local_note,
    );
    local_stage.attempt_queries = Some(attempt_queries.clone());
    local_stage.attempt_query_used = local_attempt_query_used.clone();
    local_stage.attempts = Some(local_attempts.clone());

    let mut decision = if alias_used {
        Some(Decision::AliasOk)
    } else if history_used {
        Some(Decision::HistoryOk)
    } else if !candidates.is_empty() {
        Some(Decision::LocalOk)
    } else {
        None
    };

    let candidates_count_before_llm = candidates.len();
    let mut llm_called = false;
    let mut llm_stage = "none".to_string();

    // ── Stage 4: LLM rewrite ───────────────────────────────────────
    let llm_rewrite_before = candidates.len();
    let mut llm_rewrite_query = search_query.clone();
    let mut llm_rewrite_candidates_found = 0usize;
    let mut llm_rewrite_note = "skipped: already have candidates".to_string();
    if candidates.is_empty() {
        if !req.enable_llm_rewrite {
            llm_rewrite_note = "skipped: llm_rewrite_disabled".to_string();
        } else if !llm.available() {
            llm_rewrite_note = "skipped: llm disabled".to_string();
        } else {
            llm_called = true;
            llm_stage = "rewrite".to_string();
            let rewritten = rewrite_query(llm, pick_query(&search_query, &req.text)).await;
            llm_rewrite_query = rewritten.clone();
            if !rewritten.is_empty() && rewritten != *pick_query(&search_query, &req.text) {
                match search_products(db, &rewritten, req.limit, None, None) {
                    Ok(found) if !found.is_empty() => {
                        llm_rewrite_candidates_found = found.len();
                        candidates = found;
                        decision = Some(Decision::LlmRewriteOk);
                        llm_rewrite_note = "rewrite matched".to_string();
                    }
                    Ok(_) => llm_rewrite_note = "rewrite returned 0".to_string(),
                    Err(e) => {
                        warn!("rewrite search failed: {e}");
                        llm_rewrite_note = format!("rewrite search failed: {e}");
                    }
                }
            } else {
                llm_rewrite_note = "rewrite unchanged".to_string();
            }
        }
    }
    let mut llm_rewrite_stage = StageTrace::entry(
        "llm_rewrite",
        &llm_rewrite_query,
        llm_rewrite_before,
        &candidates,
        llm_rewrite_note,
    );
    llm_rewrite_stage.input_query = Some(search_query.clone());
    llm_rewrite_stage.rewritten_query = Some(llm_rewrite_query.clone());
    llm_rewrite_stage.candidates_found = Some(llm_rewrite_candidates_found);

    // ── Stage 5: synonym retry ─────────────────────────────────────
    let synonym_before = candidates.len();
    let mut synonym_retry_attempted = false;
    let mut synonym_retry_query: Option<String> = None;
    let mut synonym_retry_results_count = 0usize;
    let mut synonym_note = "skipped: already have candidates".to_string();
    if candidates.is_empty() {
        synonym_retry_attempted = true;
        // Retry over the (possibly rewritten) query with the full map.
        let retry_input = pick_query(&llm_rewrite_query, &search_query).to_string();
        let (retry_query, retry_aliases) = apply_token_synonyms(&retry_input, &map);
        synonym_map.extend(retry_aliases);
        if !synonym_map.is_empty() && !retry_query.is_empty() && retry_query != retry_input {
            synonym_retry_query = Some(retry_query.clone());
            match search_products(db, &retry_query, req.limit, None, None) {
                Ok(found) => {
                    synonym_retry_results_count = found.len();
                    if found.is_empty() {
                        synonym_note = "synonym retry returned 0".to_string();
                    } else {
                        candidates = found;
                        synonym_note = "synonym retry matched".to_string();
                    }
                }
                Err(e) => {
                    warn!("synonym retry search failed: {e}");
                    synonym_note = format!("synonym retry failed: {e}");
                }
            }
        } else {
            synonym_retry_query = Some(retry_query);
            synonym_note = "synonym retry no changes".to_string();
        }
    }
    let synonym_query_for_trace = synonym_retry_query.clone().unwrap_or_else(|| search_query.clone());
    let mut synonym_stage = StageTrace::entry(
        "synonym_retry",
        &synonym_query_for_trace,
        synonym_before,
        &candidates,
        synonym_note,
    );
    synonym_stage.synonyms_applied = Some(!synonym_map.is_empty());
    synonym_stage.synonym_map = Some(synonym_map.clone());
    synonym_stage.query_retry = synonym_retry_query.clone();
    synonym_stage.retry_results_count = Some(synonym_retry_results_count);

    // ── Clarification gate ─────────────────────────────────────────
    let mut clarification: Option<Clarification> = None;
    let mut clarify_facet: Option<String> = None;
    if candidates.is_empty() {
        // Retrieval found only other colors: ask which color was meant,
        // naming the one requested.
        if let (Some(stem), Some(pool)) = (color_stem, color_gate_pool.as_ref()) {
            if let Some((_, options)) = build_facet_options(pool, FACET_MAX_VALUES) {
                clarify_facet = Some("цвет".to_string());
                clarification = Some(build_clarification(
                    "conflict",
                    options,
                    req.clarify_offset,
                    CLARIFY_PAGE_SIZE,
                    &format!("Уточни вариант (цвет: {stem}):"),
                ));
            }
        }
    }
    if candidates.is_empty() && clarification.is_none() {
        let head = extract_head_token(pick_query(&search_query, &req.text));
        let mut suggestions: Vec<Suggestion> = Vec::new();
        if let (Some(org), Some(token)) = (history_org_id, head.as_deref()) {
            match history_suggestions(db, org, token, HEAD_SUGGESTION_LIMIT) {
                Ok(found) => suggestions = found,
                Err(e) => warn!("history suggestions failed: {e}"),
            }
        }
        if suggestions.is_empty() {
            if let Some(token) = head.as_deref() {
                match search_products(db, token, HEAD_SUGGESTION_LIMIT, None, None) {
                    Ok(found) => {
                        suggestions = found
                            .into_iter()
                            .map(|c| Suggestion {
                                product_id: Some(c.id),
                                title: c.title_ru,
                            })
                            .collect();
                    }
                    Err(e) => warn!("head-token search failed: {e}"),
                }
            }
        }
        if suggestions.is_empty() {
            let lowered = pick_query(&search_query, &req.text).to_lowercase();
            for (src, dst) in &map {
                if lowered.contains(src.as_str()) && !dst.is_empty() {
                    suggestions.push(Suggestion {
                        product_id: None,
                        title: dst.clone(),
                    });
                }
            }
        }
        let options = suggestions_to_options(&suggestions);
        let question = match color_stem {
            Some(color) => format!("Уточни товар (цвет: {color}):"),
            None => question_for_reason("no_candidates").to_string(),
        };
        clarification = Some(build_clarification(
            "no_candidates",
            options,
            req.clarify_offset,
            CLARIFY_PAGE_SIZE,
            &question,
        ));
    } else if candidates.len() > FACET_TRIGGER {
        if let Some((facet, options)) = build_facet_options(&candidates, FACET_MAX_VALUES) {
            let question = format!("Уточни {facet}:");
            clarify_facet = Some(facet);
            clarification = Some(build_clarification(
                "conflict",
                options,
                req.clarify_offset,
                CLARIFY_PAGE_SIZE,
                &question,
            ));
        }
    }

    if let Some(clar) = clarification.filter(|c| !c.options.is_empty()) {
        let clarify_reason = clar.reason.clone();
        let llm_reason = if candidates.is_empty() {
            if !req.enable_llm_narrow {
                "llm_narrow_disabled".to_string()
            } else if !llm.available() {
                "llm_disabled".to_string()
            } else {
                clarify_reason.clone()
            }
        } else {
            clarify_reason.clone()
        };

        let mut clarify_stage =
            StageTrace::entry("clarify", &search_query, candidates.len(), &candidates, &clarify_reason);
        clarify_stage.options_count = Some(clar.options.len());
        clarify_stage.clarify_total = Some(clar.total);
        clarify_stage.clarify_offset = Some(clar.offset);

        let mut payload = DecisionPayload::empty(pick_query(&search_query, &req.text));
        payload.decision = Decision::NeedsClarification;
        payload.parsed_items = parsed_items.clone();
        payload.candidates_count_final = candidates.len();
        payload.history_org_id = history_org_id;
        payload.history_candidates_count = history_candidates_count;
        payload.history_used = history_used;
        payload.history_query_used = history_query_used.clone();
        payload.history_candidates_found = history_candidates_found;
        payload.alias_candidates_count = alias_candidates_count;
        payload.alias_used = alias_used;
        payload.alias_query_used = alias_query_used.clone();
        payload.alias_candidates_found = alias_candidates_found;
        payload.llm_narrow_reason = Some(llm_reason);
        payload.narrowed_query = Some(search_query.clone());
        payload.clarification = Some(clar.clone());
        payload.candidates_count_before_llm = candidates.len();
        payload.synonym_retry_attempted = synonym_retry_attempted;
        payload.synonym_map = synonym_map.clone();
        payload.query_retry =
            Some(synonym_retry_query.clone().unwrap_or_else(|| search_query.clone()));
        payload.retry_results_count = synonym_retry_results_count;

        let trace = Trace {
            input: TraceInput {
                raw_text: req.text.clone(),
                normalized_text,
                parsed_items,
                org_id: history_org_id,
                user_id: req.user_id,
            },
            history_attempts,
            local_attempts,
            candidates_count_before_llm: candidates.len(),
            llm_called: false,
            llm_stage: "none".to_string(),
            synonym_retry_attempted,
            synonym_map,
            query_retry: Some(synonym_retry_query.unwrap_or_else(|| search_query.clone())),
            retry_results_count: synonym_retry_results_count,
            stages: vec![history_stage, alias_stage, local_stage, synonym_stage, clarify_stage],
            clarify: Some(ClarifySummary {
                reason: clarify_reason,
                options_count: clar.options.len(),
                selected_facet: clarify_facet,
                clarify_total: clar.total,
                clarify_offset: clar.offset,
            }),
        };

        let mut results = candidates;
        results.truncate(req.limit);
        return PipelineResponse {
            results,
            decision: payload,
            trace,
            items: None,
        };
    }

    // ── Stage 6: LLM normalize + narrow ────────────────────────────
    let llm_before = candidates.len();
    let mut alternatives: Vec<String> = Vec::new();
    let mut used_alternative: Option<String> = None;
    let mut category_ids: Vec<i64> = Vec::new();
    let mut llm_narrow_confidence: Option<f64> = None;
    let mut llm_narrow_reason: Option<String> = None;
    let mut narrowed_query: Option<String> = None;
    let mut llm_query_used = search_query.clone();
    let mut llm_note = "skipped: already have candidates".to_string();
    if candidates.is_empty() && !parsed_items.is_empty() && req.enable_llm_narrow && llm.available()
    {
        llm_called = true;
        llm_stage = "normalize".to_string();
        alternatives = suggest_queries(llm, pick_query(&search_query, &req.text)).await;
        for alternative in &alternatives {
            match search_products(db, alternative, req.limit, None, None) {
                Ok(found) if !found.is_empty() => {
                    candidates = found;
                    decision = Some(Decision::LlmOk);
                    used_alternative = Some(alternative.clone());
                    llm_query_used = alternative.clone();
                    llm_note = "llm alternative matched".to_string();
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!("alternative search failed: {e}"),
            }
        }
        if candidates.is_empty() {
            narrowed_query = Some(pick_query(&search_query, &req.text).to_string());
            llm_stage = "narrow".to_string();
            let narrow = narrow_categories(llm, db, cache, pick_query(&search_query, &req.text)).await;
            category_ids = narrow.category_ids;
            llm_narrow_confidence = Some(narrow.confidence);
            llm_narrow_reason = Some(narrow.reason);
            if category_ids.is_empty() {
                decision = Some(Decision::NoMatch);
                llm_note = "llm narrow returned empty categories".to_string();
            } else {
                match search_products(
                    db,
                    pick_query(&search_query, &req.text),
                    req.limit,
                    Some(&category_ids),
                    None,
                ) {
                    Ok(found) if !found.is_empty() => {
                        candidates = found;
                        decision = Some(Decision::LlmNarrowOk);
                        llm_note = "llm narrow categories matched".to_string();
                    }
                    _ => {
                        for alternative in &alternatives {
                            match search_products(
                                db,
                                alternative,
                                req.limit,
                                Some(&category_ids),
                                None,
                            ) {
                                Ok(found) if !found.is_empty() => {
                                    candidates = found;
                                    decision = Some(Decision::LlmNarrowOk);
                                    used_alternative = Some(alternative.clone());
                                    llm_query_used = alternative.clone();
                                    llm_note = "llm narrow + alternative matched".to_string();
                                    break;
                                }
                                _ => {}
                            }
                        }
                        if candidates.is_empty() {
                            decision = Some(Decision::NoMatch);
                            llm_note = "llm narrow categories returned 0".to_string();
                        }
                    }
                }
            }
        }
    } else if candidates.is_empty() {
        decision = Some(Decision::NoMatch);
        if !req.enable_llm_narrow {
            llm_narrow_reason = Some("llm_narrow_disabled".to_string());
            llm_note = "skipped: llm_narrow_disabled".to_string();
        } else {
            llm_narrow_reason = Some("llm_disabled".to_string());
            llm_note = "skipped: llm disabled".to_string();
        }
    }
    if candidates.is_empty() && decision.is_none() {
        decision = Some(Decision::NoMatch);
    }
    let mut llm_narrow_stage =
        StageTrace::entry("llm_narrow", &llm_query_used, llm_before, &candidates, llm_note);
    llm_narrow_stage.category_ids_filter = category_ids.clone();

    // ── Stage 7: rerank ────────────────────────────────────────────
    let rerank_before = candidates.len();
    let mut rerank_used = false;
    let mut rerank_best_ids: Vec<i64> = Vec::new();
    let mut rerank_top_score: Option<f64> = None;
    let mut rerank_note = if !req.enable_rerank {
        "skipped: rerank disabled".to_string()
    } else {
        "skipped: less than 2 candidates or llm disabled".to_string()
    };
    if req.enable_rerank
        && (RERANK_MIN..=RERANK_MAX).contains(&candidates.len())
        && llm.available()
    {
        llm_called = true;
        llm_stage = "rerank".to_string();
        let attrs = parsed_items.first().map(|item| &item.attributes);
        let outcome =
            rerank_products(llm, pick_query(&search_query, &req.text), &candidates, attrs).await;
        if outcome.best.is_empty() {
            rerank_note = "rerank returned empty best list".to_string();
        } else {
            rerank_used = true;
            rerank_best_ids = outcome.best.iter().map(|b| b.product_id).collect();
            rerank_top_score = outcome.best.first().map(|b| b.score);
            let score_by_id: BTreeMap<i64, f64> =
                outcome.best.iter().map(|b| (b.product_id, b.score)).collect();
            candidates.sort_by(|a, b| {
                let la = score_by_id.get(&a.id).copied().unwrap_or(-1.0);
                let lb = score_by_id.get(&b.id).copied().unwrap_or(-1.0);
                lb.partial_cmp(&la)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(
                        b.score
                            .partial_cmp(&a.score)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            });
            rerank_note = "rerank applied".to_string();
        }
    }
    let rerank_stage =
        StageTrace::entry("rerank", &search_query, rerank_before, &candidates, rerank_note);

    // Attach category ids to the final candidate set.
    if !candidates.is_empty() {
        let ids: Vec<i64> = candidates.iter().map(|c| c.id).collect();
        match db.product_category_map(&ids) {
            Ok(category_map) => {
                for candidate in &mut candidates {
                    if let Some(category_id) = category_map.get(&candidate.id) {
                        candidate.category_id = *category_id;
                    }
                }
            }
            Err(e) => warn!("category attachment failed: {e}"),
        }
    }

    let final_decision = decision.unwrap_or(Decision::NoMatch);
    info!(
        "pipeline decision={final_decision} org={history_org_id:?} alias_used={alias_used} history_used={history_used}"
    );

    let mut payload = DecisionPayload::empty(pick_query(&search_query, &req.text));
    payload.decision = final_decision;
    payload.parsed_items = parsed_items.clone();
    payload.alternatives = alternatives.clone();
    payload.used_alternative = used_alternative.clone();
    payload.candidates_count_final = candidates.len();
    payload.history_org_id = history_org_id;
    payload.history_candidates_count = history_candidates_count;
    payload.history_used = history_used;
    payload.history_query_used = history_query_used.clone();
    payload.history_candidates_found = history_candidates_found;
    payload.alias_candidates_count = alias_candidates_count;
    payload.alias_used = alias_used;
    payload.alias_query_used = alias_query_used.clone();
    payload.alias_candidates_found = alias_candidates_found;
    payload.category_ids = category_ids.clone();
    payload.llm_narrow_confidence = llm_narrow_confidence;
    payload.llm_narrow_reason = llm_narrow_reason.clone();
    payload.narrowed_query = narrowed_query.clone();
    payload.rerank_used = rerank_used;
    payload.rerank_best_ids = rerank_best_ids.clone();
    payload.rerank_top_score = rerank_top_score;
    payload.candidates_count_before_llm = candidates_count_before_llm;
    payload.llm_called = llm_called;
    payload.llm_stage = llm_stage.clone();
    payload.synonym_retry_attempted = synonym_retry_attempted;
    payload.synonym_map = synonym_map.clone();
    payload.query_retry =
        Some(synonym_retry_query.clone().unwrap_or_else(|| search_query.clone()));
    payload.retry_results_count = synonym_retry_results_count;

    let trace = Trace {
        input: TraceInput {
            raw_text: req.text.clone(),
            normalized_text,
            parsed_items,
            org_id: history_org_id,
            user_id: req.user_id,
        },
        history_attempts,
        local_attempts,
        candidates_count_before_llm,
        llm_called,
        llm_stage,
        synonym_retry_attempted,
        synonym_map,
        query_retry: Some(synonym_retry_query.unwrap_or_else(|| search_query.clone())),
        retry_results_count: synonym_retry_results_count,
        stages: vec![
            history_stage,
            alias_stage,
            local_stage,
            synonym_stage,
            llm_rewrite_stage,
            llm_narrow_stage,
            rerank_stage,
        ],
        clarify: None,
    };

    PipelineResponse {
        results: candidates,
        decision: payload,
        trace,
        items: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::stats::OrderedLine;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn fixture() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.upsert_organization(1, "Мебель-Опт").unwrap();
        db.upsert_org_member(1, 42, "member", "active").unwrap();
        db.upsert_product(5, None, "Болт мебельный 8 * 30 (din 603)", 2.0, 500, None)
            .unwrap();
        db.upsert_product(3, None, "Карандаш меловой белый для разметки", 15.0, 40, None)
            .unwrap();
        db.upsert_product(4, None, "Липа контактная белый 20мм", 5.0, 10, None)
            .unwrap();
        db.upsert_product(7, None, "Спанбонд 70 белый", 20.0, 100, None).unwrap();
        db.upsert_product(8, None, "Спанбонд 70 коричневый", 20.0, 90, None).unwrap();
        db.upsert_product(9, None, "Молния спираль серая 5мм", 3.0, 50, None).unwrap();
        db.upsert_product(10, None, "Молния спираль бежевая 5мм", 3.0, 50, None).unwrap();
        db
    }

    fn ordered_many(db: &Db, org: i64, product: i64, times: usize, at: DateTime<Utc>) {
        for _ in 0..times {
            db.upsert_org_product_stats(
                org,
                &[OrderedLine {
                    product_id: product,
                    qty: 100.0,
                    unit: Some("шт".into()),
                    ordered_at: Some(at),
                }],
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn history_wins_for_habitual_reorder() {
        let db = fixture();
        ordered_many(&db, 1, 5, 10, ts(2026, 7, 20));
        let req = SearchRequest::new("болт 8x30 дин 933 10шт")
            .with_org(1)
            .with_now(ts(2026, 7, 30));
        let response = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;

        assert_eq!(response.decision.decision, Decision::HistoryOk);
        assert_eq!(response.results[0].id, 5);
        assert_eq!(response.decision.parsed_items[0].qty, 10);
        assert_eq!(response.decision.parsed_items[0].unit, "шт");
        assert!(response.decision.history_used);
        assert!(!response.trace.history_attempts.is_empty());
    }

    #[tokio::test]
    async fn local_catalog_resolves_without_history() {
        let db = fixture();
        let req = SearchRequest::new("мел белый 2 коробочки").with_user(42);
        let response = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;

        assert!(matches!(
            response.decision.decision,
            Decision::LocalOk | Decision::AliasOk
        ));
        let top = &response.results[0];
        assert!(top.title_ru.to_lowercase().contains("мел"));
        assert!(!top.title_ru.to_lowercase().contains("липа"));
    }

    #[tokio::test]
    async fn synonyms_rewrite_before_retrieval() {
        let db = fixture();
        let req = SearchRequest::new("спандбонд 70 белый");
        let response = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;

        assert_eq!(response.decision.decision, Decision::LocalOk);
        let top = &response.results[0];
        assert!(top.title_ru.contains("белый"));
        assert!(!top.title_ru.contains("коричневый"));
        assert!(!response.decision.synonym_map.is_empty());
        assert!(response.decision.query_retry.is_some());
        assert_eq!(response.decision.original_query, "спанбонд 70 белый");
    }

    #[tokio::test]
    async fn multi_item_recursion_exposes_items() {
        let db = fixture();
        let req = SearchRequest::new("Молния серая, беж по 5 шт");
        let response = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;

        assert!(response.decision.multi_item);
        let items = response.items.as_ref().unwrap();
        assert_eq!(items.len(), 2);
        // Both item queries carry the propagated head noun.
        for outcome in items {
            assert!(outcome.query_core.contains("молния"), "{}", outcome.query_core);
        }
        // Top-level results mirror the first item's.
        assert_eq!(response.results, items[0].results);
        // The second item resolved to the beige zipper.
        assert_eq!(items[1].results[0].id, 10);
    }

    #[tokio::test]
    async fn no_match_reports_llm_disabled() {
        let db = fixture();
        let req = SearchRequest::new("шпингалет оконный");
        let response = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;

        assert_eq!(response.decision.decision, Decision::NoMatch);
        assert_eq!(response.decision.llm_narrow_reason.as_deref(), Some("llm_disabled"));
        assert!(response.results.is_empty());
        assert!(!response.decision.llm_called);
    }

    #[tokio::test]
    async fn missing_color_yields_clarification_naming_the_color() {
        let db = fixture();
        // No red spanbond exists; strict color filtering leaves nothing.
        let req = SearchRequest::new("спанбонд 70 красный");
        let response = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;

        assert_eq!(response.decision.decision, Decision::NeedsClarification);
        let clar = response.decision.clarification.as_ref().unwrap();
        assert!(clar.question.contains("красн"), "{}", clar.question);
        assert_eq!(clar.reason, "conflict");
        // The options are the colors that do exist.
        let labels: Vec<&str> = clar.options.iter().map(|o| o.label.as_str()).collect();
        assert!(labels.contains(&"белый"));
        assert!(labels.contains(&"коричневый"));
    }

    #[tokio::test]
    async fn over_broad_result_asks_a_facet_question() {
        let db = Db::open_in_memory().unwrap();
        for i in 0..35 {
            let color = if i % 2 == 0 { "белая" } else { "черная" };
            db.upsert_product(i + 1, None, &format!("Молния спираль {color} {i}мм"), 2.0, 10, None)
                .unwrap();
        }
        let req = SearchRequest::new("молния").with_limit(40);
        let response = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;

        assert_eq!(response.decision.decision, Decision::NeedsClarification);
        let clar = response.decision.clarification.as_ref().unwrap();
        assert_eq!(clar.reason, "conflict");
        assert!(clar.question.contains("цвет"));
        assert!(clar.options.len() <= CLARIFY_PAGE_SIZE);
        assert!(clar.total >= 2);
    }

    #[tokio::test]
    async fn clarify_selection_equals_appended_rerun() {
        let db = fixture();
        let base = SearchRequest::new("спанбонд 70 красный");
        let first =
            run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &base).await;
        let clar = first.decision.clarification.unwrap();
        let option = &clar.options[0];
        let appended =
            crate::search::clarify::apply_option_query("спанбонд 70 красный", option);
        let rerun = run_search_pipeline(
            &db,
            &Cache::disabled(),
            &LlmClient::disabled(),
            &SearchRequest::new(appended),
        )
        .await;
        // Selecting an option re-drives the pipeline with the appended
        // tokens; the rerun is a plain invocation of exactly that query.
        assert!(rerun.decision.decision != Decision::NoMatch);
    }

    #[tokio::test]
    async fn llm_off_runs_are_bit_identical() {
        let db = fixture();
        ordered_many(&db, 1, 5, 4, ts(2026, 7, 10));
        let req = SearchRequest::new("болт 8x30 10шт")
            .with_org(1)
            .with_now(ts(2026, 7, 30));
        let a = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;
        let b = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn org_resolution_via_membership() {
        let db = fixture();
        ordered_many(&db, 1, 5, 3, ts(2026, 7, 10));
        let req = SearchRequest::new("болт 8x30")
            .with_user(42)
            .with_now(ts(2026, 7, 30));
        let response = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;
        assert_eq!(response.decision.history_org_id, Some(1));
        assert_eq!(response.decision.decision, Decision::HistoryOk);
    }

    #[tokio::test]
    async fn springs_conflict_flag_carries_through() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_organization(1, "Орг").unwrap();
        db.upsert_product(1, None, "Блок независимый без пружин 1000", 50.0, 5, None)
            .unwrap();
        ordered_many(&db, 1, 1, 5, ts(2026, 7, 10));
        let req = SearchRequest::new("блок с пружинами 1000")
            .with_org(1)
            .with_now(ts(2026, 7, 30));
        let response = run_search_pipeline(&db, &Cache::disabled(), &LlmClient::disabled(), &req).await;

        assert_eq!(response.decision.decision, Decision::HistoryOk);
        assert!(response.results[0].attribute_conflict);
        let history_stage = response
            .trace
            .stages
            .iter()
            .find(|s| s.name == "history")
            .unwrap();
        assert_eq!(history_stage.attribute_conflict, Some(true));
    }
}
