//! Convenience re-exports for embedding the core.

pub use crate::cache::Cache;
pub use crate::config::{LlmProviderKind, Settings};
pub use crate::dialog::learning::{autolearn_from_result, confirm_selection, finalize_add_item};
pub use crate::dialog::{DialogContext, DialogStore, HandlerResult, handle_message};
pub use crate::intent::{Action, ActionType, RouterResult, route_message, stock_eta_reply};
pub use crate::llm::LlmClient;
pub use crate::pipeline::decision::{Decision, DecisionPayload};
pub use crate::pipeline::{ItemOutcome, PipelineResponse, SearchRequest, run_search_pipeline};
pub use crate::search::Candidate;
pub use crate::store::Db;
pub use crate::text::{ParsedItem, normalize_text, parse_order_text};
