//! Intent routing: free text → actionable actions.
//!
//! The rule-based heuristic is primary and fully deterministic; the LLM is
//! only consulted when the heuristic finds nothing meaningful, and its
//! output passes through the same language sanitizer before anyone sees it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::info;

use crate::llm::ops::extract_json_payload;
use crate::llm::{ChatMessage, LlmClient};
use crate::text::parser::parse_order_text;

/// The canned reply for non-Russian payloads.
pub const NON_RU_PROMPT: &str = "Уточните запрос по-русски";

static QTY_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?P<qty>\d+)\s*(?P<unit>мотка|мотков|моток|штук|шт|рулонов|рулона|рулон|упаковках|упаковки|упаковка|коробочки|коробки|коробку|коробка|пачки|пачка|кг)",
    )
    .unwrap()
});
static ADD_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)(?:добавьте|добавь|мне\s+нужно|в\s+заказ|пожалуйста|нужно|надо)\s+")
        .unwrap()
});
static ADD_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bи\s+что\b|\bи\s+кстати\b|\bа\s+также\b|,").unwrap());
static ADD_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:добавьте|добавь|добавить|нужно|надо|положи|закажи)\b|в\s+заказ")
        .unwrap()
});
static ETA_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)когда\s+(?:придет|придёт|будет|ожидается)|срок\s+поставки").unwrap()
});
static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:добавьте|добавь|добавить|нужно|надо|положи|закажи|пожалуйста|кстати)\b|в\s+заказ|мне\s+нужно|что\s+там|по\s+поводу",
    )
    .unwrap()
});
static LATIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z]").unwrap());
static CYRILLIC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)[а-яё]").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const NOISE_PHRASES: &[&str] = &[
    "что там",
    "по поводу",
    "и кстати",
    "а также",
    "пожалуйста",
    "мне нужно",
    "в заказ",
];

/// Closed subject list for stock-ETA questions.
const ETA_SUBJECTS: &[(&str, &str)] = &[
    ("поролон", "поролон"),
    ("ппу", "ппу"),
    ("синтепон", "синтепон"),
    ("спанбонд", "спанбонд"),
];

fn canonical_unit(unit: &str) -> String {
    match unit {
        "мотка" | "мотков" | "моток" => "моток",
        "штук" | "шт" => "шт",
        "рулона" | "рулонов" | "рулон" => "рулон",
        "упаковки" | "упаковках" | "упаковка" => "упаковка",
        "коробочки" | "коробки" | "коробку" | "коробка" => "коробка",
        "пачки" | "пачка" => "пачка",
        other => other,
    }
    .to_string()
}

/// Action kind emitted by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    AddItem,
    AskStockEta,
    Manager,
    Unknown,
}

/// One routed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_core: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Action {
    pub fn unknown() -> Self {
        Self {
            kind: ActionType::Unknown,
            query_core: None,
            subject: None,
            qty: None,
            unit: None,
        }
    }

    pub fn unknown_non_ru() -> Self {
        Self {
            query_core: Some(NON_RU_PROMPT.to_string()),
            ..Self::unknown()
        }
    }
}

/// Router output. Always holds at least one action.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RouterResult {
    pub actions: Vec<Action>,
}

fn is_latin_only(text: &str) -> bool {
    LATIN_RE.is_match(text) && !CYRILLIC_RE.is_match(text)
}

fn extract_add_item(text: &str) -> Option<Action> {
    let cleaned = SPACE_RE.replace_all(text.trim(), " ").to_string();
    if cleaned.is_empty() || !ADD_MARKER_RE.is_match(&cleaned) {
        return None;
    }

    let mut work = ADD_PREFIX_RE.replace(&cleaned.to_lowercase(), "").to_string();
    if let Some(m) = ADD_SPLIT_RE.find(&work) {
        work = work.get(..m.start()).unwrap_or("").trim().to_string();
    }
    for phrase in NOISE_PHRASES {
        work = work.replace(phrase, " ");
    }

    let mut qty: Option<f64> = None;
    let mut unit: Option<String> = None;
    if let Some(caps) = QTY_UNIT_RE.captures(&work) {
        let m = caps.get(0).unwrap();
        qty = caps.name("qty").and_then(|q| q.as_str().parse().ok());
        unit = caps.name("unit").map(|u| canonical_unit(u.as_str()));
        let head = work.get(..m.start()).unwrap_or("").to_string();
        let tail = work.get(m.end()..).unwrap_or("");
        work = format!("{} {}", head.trim(), tail.trim());
    }

    work = COMMAND_RE.replace_all(&work, " ").to_string();
    work = SPACE_RE.replace_all(&work, " ").to_string();
    let core = work.trim_matches([' ', ',', '.', '-']).to_string();
    if core.is_empty() {
        return None;
    }

    Some(Action {
        kind: ActionType::AddItem,
        query_core: Some(core),
        subject: None,
        qty: qty.or(Some(1.0)),
        unit,
    })
}

fn extract_eta_subject(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    ETA_SUBJECTS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, subject)| subject.to_string())
}

fn ensure_stock_eta(text: &str, mut actions: Vec<Action>) -> Vec<Action> {
    if actions.iter().any(|a| a.kind == ActionType::AskStockEta) {
        return actions;
    }
    if !ETA_HINT_RE.is_match(text) {
        return actions;
    }
    if let Some(subject) = extract_eta_subject(text) {
        actions.push(Action {
            kind: ActionType::AskStockEta,
            query_core: Some(subject.clone()),
            subject: Some(subject),
            qty: None,
            unit: None,
        });
    }
    actions
}

/// Drop ADD/ETA actions whose payload is not Russian. When everything was
/// dropped for language reasons, answer with the canned prompt.
fn sanitize_action_language(actions: Vec<Action>) -> Vec<Action> {
    let mut cleaned = Vec::new();
    let mut dropped_non_ru = false;
    for mut action in actions {
        match action.kind {
            ActionType::AddItem => {
                let query = action.query_core.as_deref().unwrap_or("").trim().to_string();
                if LATIN_RE.is_match(&query) && !CYRILLIC_RE.is_match(&query) {
                    dropped_non_ru = true;
                    continue;
                }
                action.query_core = Some(query);
            }
            ActionType::AskStockEta => {
                let subject = action
                    .subject
                    .clone()
                    .or_else(|| action.query_core.clone())
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                if LATIN_RE.is_match(&subject) && !CYRILLIC_RE.is_match(&subject) {
                    dropped_non_ru = true;
                    continue;
                }
                action.subject = (!subject.is_empty()).then_some(subject.clone());
                if action.query_core.is_none() {
                    action.query_core = action.subject.clone();
                }
            }
            _ => {}
        }
        cleaned.push(action);
    }
    if dropped_non_ru && cleaned.is_empty() {
        return vec![Action::unknown_non_ru()];
    }
    cleaned
}

fn fallback_actions(text: &str) -> RouterResult {
    if is_latin_only(text) {
        return RouterResult {
            actions: vec![Action::unknown_non_ru()],
        };
    }

    // ADD_ITEM requires an imperative marker; bare product enumerations
    // stay UNKNOWN (tightened routing — see DESIGN.md).
    let parsed = if ADD_MARKER_RE.is_match(text) {
        parse_order_text(text)
    } else {
        Vec::new()
    };
    let mut actions: Vec<Action> = parsed
        .into_iter()
        .filter_map(|item| {
            let query_core = if !item.query_core.trim().is_empty() {
                item.query_core.clone()
            } else {
                item.query.clone()
            };
            if query_core.trim().is_empty() {
                return None;
            }
            Some(Action {
                kind: ActionType::AddItem,
                query_core: Some(query_core),
                subject: None,
                qty: Some(item.qty as f64),
                unit: (!item.unit.is_empty()).then(|| item.unit.clone()),
            })
        })
        .collect();
    if actions.is_empty() {
        actions.push(Action::unknown());
    }
    RouterResult {
        actions: ensure_stock_eta(text, actions),
    }
}

fn actions_from_json(payload: &serde_json::Value) -> Option<Vec<Action>> {
    match payload {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| serde_json::from_value::<Action>(item.clone()).ok())
            .collect(),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::Array(items)) = map.get("actions") {
                items
                    .iter()
                    .map(|item| serde_json::from_value::<Action>(item.clone()).ok())
                    .collect()
            } else {
                serde_json::from_value::<Action>(payload.clone()).ok().map(|a| vec![a])
            }
        }
        _ => None,
    }
}

/// Parse actions from the message text, optionally merging a raw LLM payload.
/// Deterministic when `llm_payload` is `None`.
pub fn parse_actions_from_text(text: &str, llm_payload: Option<&str>) -> RouterResult {
    if let Some(raw) = llm_payload {
        if let Some(payload) = extract_json_payload(raw) {
            if let Some(mut actions) = actions_from_json(&payload) {
                if !actions.is_empty() {
                    for action in &mut actions {
                        if action.kind == ActionType::AskStockEta && action.subject.is_none() {
                            action.subject = action
                                .query_core
                                .clone()
                                .or_else(|| extract_eta_subject(text));
                            if action.query_core.is_none() {
                                action.query_core = action.subject.clone();
                            }
                        }
                    }
                    let actions = sanitize_action_language(actions);
                    return RouterResult {
                        actions: ensure_stock_eta(text, actions),
                    };
                }
            }
        }
        info!("intent router: LLM payload unusable, falling back to heuristics");
    }

    if let Some(add) = extract_add_item(text) {
        return RouterResult {
            actions: ensure_stock_eta(text, vec![add]),
        };
    }
    fallback_actions(text)
}

/// Route a message. The LLM is consulted only when the heuristic produced
/// nothing meaningful; with the LLM disabled this is a pure function.
pub async fn route_message(llm: &LlmClient, text: &str) -> RouterResult {
    let heuristic = parse_actions_from_text(text, None);
    let has_meaningful = heuristic.actions.iter().any(|a| {
        matches!(
            a.kind,
            ActionType::AddItem | ActionType::AskStockEta | ActionType::Manager
        )
    });
    if has_meaningful || !llm.available() {
        return heuristic;
    }

    let system_prompt = "Ты роутер намерений для B2B заказов. Верни ТОЛЬКО JSON без пояснений. \
        Допустимы 2 формата: массив действий или объект {\"actions\":[...]}. \
        Каждое действие: {\"type\":\"ADD_ITEM|ASK_STOCK_ETA|MANAGER|UNKNOWN\",\"query_core\":\"...\",\"subject\":\"...\",\"qty\":number,\"unit\":\"...\"}. \
        Если есть и добавление товара, и вопрос о сроке — верни оба действия.";
    match llm
        .chat(
            &[ChatMessage::system(system_prompt), ChatMessage::user(text)],
            0.1,
        )
        .await
    {
        Ok(content) => {
            let mut parsed = parse_actions_from_text(text, Some(&content));
            if parsed.actions.is_empty() {
                parsed.actions.push(Action::unknown_non_ru());
            }
            parsed
        }
        Err(e) => {
            info!("intent router LLM call failed, using heuristics: {e}");
            heuristic
        }
    }
}

/// Canned ETA reply for the dialog layer.
pub fn stock_eta_reply(query_core: &str) -> String {
    let subject = SPACE_RE.replace_all(query_core.trim(), " ").to_string();
    if subject.is_empty() {
        return "Уточню срок поставки и вернусь с ответом.".to_string();
    }
    format!(
        "По {subject} уточню срок поставки. Уточни, какой именно {subject}: марка/толщина/артикул."
    )
}
