//! Request-handler layer: lightweight intent scoring, item shaping, and the
//! per-dialog state machine that the chat transport drives.

pub mod context;
pub mod learning;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub use context::{DialogContext, DialogStore, Topic};

use crate::text::normalize::normalize_text;
use crate::text::parser::{ItemAttributes, parse_order_text};

// ── Types ──────────────────────────────────────────────────────────

/// Dialog state after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    #[serde(rename = "S0_IDLE")]
    Idle,
    #[serde(rename = "S1_INTAKE")]
    Intake,
    #[serde(rename = "S2_CLARIFY")]
    Clarify,
    #[serde(rename = "S5_DRAFT")]
    Draft,
    #[serde(rename = "S7_HANDOFF")]
    Handoff,
}

/// Which field a clarification asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarifyField {
    Item,
    Qty,
    Unit,
    Size,
    Color,
    TargetItem,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentCandidate {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub raw: String,
    pub normalized: String,
    pub qty: Option<f64>,
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "ItemAttributes::is_empty")]
    pub attributes: ItemAttributes,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeedClarification {
    pub field: ClarifyField,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ContextUpdates {
    pub last_items: Vec<context::LastItem>,
    pub topic: Topic,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerResult {
    pub intents: Vec<IntentCandidate>,
    pub state: State,
    pub items: Vec<Item>,
    pub need_clarification: Vec<NeedClarification>,
    pub context_updates: ContextUpdates,
}

// ── Intent scoring ─────────────────────────────────────────────────

const INTENT_KEYWORDS: &[(&str, &[&str])] = &[
    ("order.create", &["заказ", "оформить", "сделать заказ"]),
    ("order.add", &["добавьте", "добавь", "добавить", "в заказ", "нужно", "нужны"]),
    ("order.bulk", &["список", "перечень", "оптом"]),
    ("order.remove", &["убрать", "уберите", "удалить", "исключить"]),
    ("stock.check", &["есть", "в наличии", "наличие", "остаток"]),
    ("stock.forecast", &["когда", "срок", "будет", "ожидается"]),
    ("stock.reserve", &["резерв", "забронировать"]),
    ("product.match", &["подберите", "аналог", "подходит", "подобрать"]),
    ("draft.show", &["черновик", "показать заказ"]),
    ("draft.confirm", &["подтвердить", "подтверждаю"]),
    ("draft.cancel", &["отменить заказ", "отмена заказа", "отменить"]),
    ("handoff.manager", &["менеджер", "оператор", "свяжите"]),
    ("inquiry.general", &["как", "какой", "что", "где", "почему"]),
    ("smalltalk", &["привет", "спасибо", "добрый", "хорошего"]),
];

fn intent_weight(name: &str) -> f64 {
    match name {
        "draft.confirm" | "draft.cancel" | "handoff.manager" => 0.8,
        "stock.check" | "stock.forecast" | "stock.reserve" | "order.remove" => 0.6,
        _ => 0.4,
    }
}

static QTY_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bпо\s*\d+\s*(?:шт|штук)\b|\b\d+\s*(?:шт|штук|кг|уп|кор|м|пог\.м)\b").unwrap()
});

/// Score every known intent against the message; strongest first.
pub fn detect_intents(text: &str) -> Vec<IntentCandidate> {
    let lowered = text.to_lowercase();
    let mut scores: Vec<(usize, f64)> = Vec::new();

    fn bump(scores: &mut Vec<(usize, f64)>, idx: usize, add: f64) {
        if let Some(entry) = scores.iter_mut().find(|(i, _)| *i == idx) {
            entry.1 += add;
        } else {
            scores.push((idx, add));
        }
    }

    for (idx, (name, keywords)) in INTENT_KEYWORDS.iter().enumerate() {
        let weight = intent_weight(name);
        for keyword in *keywords {
            if lowered.contains(keyword) {
                bump(&mut scores, idx, weight);
            }
        }
    }
    if QTY_ONLY_RE.is_match(&lowered) {
        // Quantity patterns strongly suggest an order mutation.
        if let Some(idx) = INTENT_KEYWORDS.iter().position(|(n, _)| *n == "order.add") {
            bump(&mut scores, idx, 0.7);
        }
    }

    let mut intents: Vec<IntentCandidate> = scores
        .into_iter()
        .map(|(idx, score)| IntentCandidate {
            name: INTENT_KEYWORDS[idx].0.to_string(),
            confidence: score.min(1.0),
        })
        .collect();
    if intents.is_empty() {
        intents.push(IntentCandidate {
            name: "product.match".to_string(),
            confidence: 0.2,
        });
    }
    intents.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.name.cmp(&b.name))
    });
    intents
}

// ── Items ──────────────────────────────────────────────────────────

/// Shape parsed order lines into handler items. A quantity-only part is a
/// patch: with prior items in context it amends the last one, otherwise it
/// asks which item was meant.
pub fn parse_items(text: &str, has_context_items: bool) -> (Vec<Item>, Vec<NeedClarification>) {
    let mut items = Vec::new();
    let mut clarifications = Vec::new();
    for parsed in parse_order_text(text) {
        if parsed.is_patch() {
            if !has_context_items {
                clarifications.push(NeedClarification {
                    field: ClarifyField::TargetItem,
                    reason: format!("уточни, к какой позиции относится «{}»", parsed.raw),
                });
                continue;
            }
        } else if parsed.query.trim().is_empty() {
            continue;
        }
        items.push(Item {
            raw: parsed.raw.clone(),
            normalized: parsed.normalized.clone(),
            qty: Some(parsed.qty as f64),
            unit: (!parsed.unit.is_empty()).then(|| parsed.unit.clone()),
            attributes: parsed.attributes.clone(),
            confidence: 0.0,
        });
    }
    if items.is_empty() && clarifications.is_empty() {
        clarifications.push(NeedClarification {
            field: ClarifyField::Item,
            reason: "не удалось распознать позиции".to_string(),
        });
    }
    (items, clarifications)
}

// ── State machine ──────────────────────────────────────────────────

fn resolve_state(
    intents: &[IntentCandidate],
    items: &[Item],
    clarifications: &[NeedClarification],
) -> State {
    if !clarifications.is_empty() {
        return State::Clarify;
    }
    let top = intents.first().map(|i| i.name.as_str()).unwrap_or("");
    if top == "handoff.manager" {
        return State::Handoff;
    }
    if top.starts_with("draft") {
        return State::Draft;
    }
    if (top.starts_with("order") || top == "product.match") && !items.is_empty() {
        return State::Intake;
    }
    State::Idle
}

fn derive_topic(intents: &[IntentCandidate]) -> Topic {
    let Some(top) = intents.first() else {
        return Topic::Unknown;
    };
    if top.name.starts_with("order") || top.name.starts_with("draft") {
        Topic::Order
    } else if top.name.starts_with("stock") {
        Topic::Stock
    } else if top.name == "product.match" {
        Topic::Match
    } else {
        Topic::Unknown
    }
}

/// Handle one inbound message against the current dialog context.
pub fn handle_message(text: &str, ctx: &DialogContext) -> HandlerResult {
    let normalized = normalize_text(text);
    let intents = detect_intents(&normalized);
    let (items, need_clarification) = parse_items(&normalized, !ctx.last_items.is_empty());
    let state = resolve_state(&intents, &items, &need_clarification);
    let context_updates = ContextUpdates {
        last_items: items
            .iter()
            .map(|item| context::LastItem {
                raw: item.raw.clone(),
                normalized: item.normalized.clone(),
            })
            .collect(),
        topic: derive_topic(&intents),
    };
    HandlerResult {
        intents,
        state,
        items,
        need_clarification,
        context_updates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_message_reaches_intake() {
        let result = handle_message("добавь поролон 50мм 2 шт", &DialogContext::default());
        assert_eq!(result.state, State::Intake);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.context_updates.topic, Topic::Order);
        assert_eq!(result.intents[0].name, "order.add");
    }

    #[test]
    fn qty_only_without_context_asks_for_target() {
        let result = handle_message("по 10 шт", &DialogContext::default());
        assert_eq!(result.state, State::Clarify);
        assert!(result
            .need_clarification
            .iter()
            .any(|c| c.field == ClarifyField::TargetItem));
    }

    #[test]
    fn qty_only_with_context_patches() {
        let ctx = DialogContext {
            last_items: vec![context::LastItem {
                raw: "нитки белые".into(),
                normalized: "нитки белые".into(),
            }],
            ..DialogContext::default()
        };
        let result = handle_message("по 10 шт", &ctx);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].qty, Some(10.0));
        assert!(result.need_clarification.is_empty());
    }

    #[test]
    fn manager_request_hands_off() {
        let result = handle_message("позовите менеджера пожалуйста", &DialogContext::default());
        assert_eq!(result.state, State::Handoff);
    }

    #[test]
    fn stock_question_sets_stock_topic() {
        let result = handle_message("когда будет поролон в наличии?", &DialogContext::default());
        assert_eq!(result.context_updates.topic, Topic::Stock);
    }

    #[test]
    fn smalltalk_stays_idle() {
        let result = handle_message("привет", &DialogContext::default());
        // "привет" parses as a single no-quantity item, but smalltalk wins
        // the intent race, so the dialog stays idle.
        assert_eq!(result.state, State::Idle);
    }
}
