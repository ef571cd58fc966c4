//! Conversational ordering core for Russian-language B2B catalogs.
//!
//! `zakazka` turns a free-form chat message ("добавь 3 мотка ниток белых и
//! что там по поводу поролона, когда придет?") into actionable intents and
//! concrete catalog products. The heart of the crate is a staged resolution
//! pipeline: per-tenant learned aliases, purchase-history scoring, a strict
//! token/number catalog index, optional LLM augmentation, and a bounded
//! clarification dialog — all deterministic when the LLM is off, and every
//! decision fully traced.
//!
//! # Getting started
//!
//! ```ignore
//! use zakazka::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let settings = Settings::from_env();
//!     let db = Db::open(&settings.database_url)?;
//!     let cache = Cache::from_url(&settings.redis_url);
//!     let llm = LlmClient::from_settings(&settings, &cache);
//!
//!     let request = SearchRequest::new("болт 8x30 дин 933 10шт").with_org(1);
//!     let response = run_search_pipeline(&db, &cache, &llm, &request).await;
//!     println!("{} → {}", request.text, response.decision.decision);
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! If you're looking for how to...
//!
//! - **Resolve a message to products:** see
//!   [`run_search_pipeline`](pipeline::run_search_pipeline) and
//!   [`SearchRequest`](pipeline::SearchRequest). The return shape
//!   ([`PipelineResponse`](pipeline::PipelineResponse)) carries results, a
//!   [`DecisionPayload`](pipeline::decision::DecisionPayload), and the full
//!   [`Trace`](pipeline::trace::Trace).
//!
//! - **Route intents:** [`route_message`](intent::route_message) produces
//!   `ADD_ITEM` / `ASK_STOCK_ETA` / `MANAGER` / `UNKNOWN` actions; the
//!   heuristic is primary and the LLM only augments.
//!
//! - **Parse order lines:** [`parse_order_text`](text::parse_order_text)
//!   splits a message into items with quantity, unit, numbers, attributes,
//!   and the propagated head noun.
//!
//! - **Learn from confirmations:** see [`dialog::learning`] —
//!   autolearn on unambiguous resolutions, plain upserts on explicit taps.
//!
//! - **Hold dialog state:** [`DialogStore`](dialog::DialogStore) keeps
//!   per-chat context and clarification callbacks with a 600 s TTL.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`text`] | Normalization, tokenization tables, order parsing |
//! | [`intent`] | Rule-based intent router with optional LLM augmentation |
//! | [`store`] | SQLite store: catalog, aliases, stats, synonyms, audit log |
//! | [`search`] | Catalog index, history scoring, synonyms, clarifications |
//! | [`llm`] | Provider seam (local/remote) and the four augmentation ops |
//! | [`pipeline`] | The staged orchestrator, decision enum, and trace |
//! | [`dialog`] | Request-handler state machine and the learning loop |
//! | [`cache`] | Optional Redis layer — absent Redis degrades, never fails |
//! | [`config`] | Environment-driven settings |
//!
//! # Design principles
//!
//! 1. **Deterministic first.** Every LLM call is optional, timed out, and
//!    degrade-to-identity; with the LLM disabled two runs over the same
//!    store produce bit-identical results and decisions.
//!
//! 2. **Strict over clever.** The catalog index never returns a product
//!    missing a required number or token — a wrong confident answer costs
//!    a B2B customer real money; a clarification question costs a tap.
//!
//! 3. **Tenants never bleed.** Aliases, history, and synonym overrides are
//!    scoped per organization; learning in one org is invisible to another.
//!
//! 4. **Trace everything.** Each stage records what it searched, what it
//!    filtered, and why it was skipped — the answer to "why this product?"
//!    is in the payload, not in a log archaeology session.

pub mod cache;
pub mod config;
pub mod dialog;
pub mod intent;
pub mod llm;
pub mod pipeline;
pub mod prelude;
pub mod search;
pub mod store;
pub mod text;

pub use cache::Cache;
pub use config::Settings;
pub use llm::LlmClient;
pub use pipeline::{PipelineResponse, SearchRequest, run_search_pipeline};
pub use store::Db;
