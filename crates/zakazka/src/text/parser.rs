//! Order-line parsing: split a message into item tuples with quantity,
//! unit, numbers, attributes, and a search-ready query core.
//!
//! A part that carries only a quantity ("1 кор", "по 10 шт") becomes a
//! *patch item* — `normalized` is set to [`PATCH_MARKER`] and the dialog
//! layer decides which previously mentioned item it amends.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use super::tokens::{NUM_RE, TOKEN_RE, char_len, is_digit_token};

/// Marker value of [`ParsedItem::normalized`] for quantity-only parts.
pub const PATCH_MARKER: &str = "__PATCH__";

static SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\n;,]+|\s+и\s+").unwrap());
static SIZE_X_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)\s*[xх*×]\s*(\d)").unwrap());
static SIZE_NA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d)\s+на\s+(\d)").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static QTY_THOUSAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*(?:тыс\.?|т\.?)\s*шт\b").unwrap());
static QTY_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d+)\s*(штук|шт|кг|упаковку|упаковка|упак|уп|коробочки|коробку|коробка|коробки|короб|кор|рулонов|рулона|рулон|рул|рол|пог\.?\s*м|комплектов|комплекта|комплект|компл|комп|м)\b",
    )
    .unwrap()
});

static SIZE_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+x\d+").unwrap());
static COLOR_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(беж|бел|сер|черн|син|зел|красн)[а-я]*").unwrap());
static CODE_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d{3,5})\)").unwrap());
static DIN_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:din|дин)\s*(\d{3,4})").unwrap());

const STOP_HEAD_WORDS: &[&str] = &[
    "по", "и", "для", "на", "в", "с", "без", "шт", "уп", "кг", "м", "мм", "см", "кор", "короб",
    "рул",
];
const COLOR_WORDS: &[&str] = &[
    "беж", "бежев", "бел", "белый", "сер", "серый", "серая", "черн", "черный", "син", "зел",
    "красн", "красный",
];
const QUERY_SERVICE_TOKENS: &[&str] = &["по", "и", "для", "на", "в", "с"];

/// Regex-extracted item attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ItemAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub din: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pack_qty: Option<i64>,
}

impl ItemAttributes {
    pub fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.color.is_none()
            && self.code.is_none()
            && self.din.is_none()
            && self.pack_qty.is_none()
    }
}

/// One parsed order line.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedItem {
    pub raw: String,
    pub normalized: String,
    pub qty: i64,
    pub unit: String,
    pub numbers: Vec<i64>,
    pub query: String,
    pub query_core: String,
    #[serde(skip_serializing_if = "ItemAttributes::is_empty")]
    pub attributes: ItemAttributes,
}

impl ParsedItem {
    /// Whether this item only patches the quantity of another item.
    pub fn is_patch(&self) -> bool {
        self.normalized == PATCH_MARKER
    }
}

fn normalize_part(text: &str) -> String {
    let mut normalized = text.to_lowercase().replace('ё', "е");
    normalized = SIZE_X_RE.replace_all(&normalized, "${1}x${2}").to_string();
    normalized = SIZE_NA_RE.replace_all(&normalized, "${1}x${2}").to_string();
    SPACE_RE.replace_all(&normalized, " ").trim().to_string()
}

fn canonical_unit(unit: &str) -> String {
    match unit {
        "штук" | "шт" => "шт",
        u if u.starts_with("упак") => "уп",
        "уп" => "уп",
        u if u.starts_with("короб") => "кор",
        "кор" => "кор",
        u if u.starts_with("рулон") => "рулон",
        "рул" | "рол" => "рулон",
        u if u.starts_with("комп") => "комплект",
        u if u.starts_with("пог") => "пог.м",
        other => other,
    }
    .to_string()
}

struct QtyExtract {
    qty: i64,
    unit: String,
    cleaned: String,
    pack: bool,
    matched: bool,
}

fn extract_qty_unit(text: &str) -> QtyExtract {
    if let Some(caps) = QTY_THOUSAND_RE.captures(text) {
        let m = caps.get(0).unwrap();
        let qty: i64 = caps.get(1).unwrap().as_str().parse().unwrap_or(1);
        let cleaned = remove_span(text, m.start(), m.end());
        return QtyExtract {
            qty: qty * 1000,
            unit: "шт".to_string(),
            cleaned,
            pack: false,
            matched: true,
        };
    }
    if let Some(caps) = QTY_UNIT_RE.captures(text) {
        let m = caps.get(0).unwrap();
        let qty: i64 = caps.get(1).unwrap().as_str().parse().unwrap_or(1);
        let unit = canonical_unit(caps.get(2).unwrap().as_str());
        let prefix = text.get(..m.start()).unwrap_or("");
        let pack = {
            let trimmed = prefix.trim_end();
            trimmed == "по" || trimmed.ends_with(" по")
        };
        let cleaned = remove_span(text, m.start(), m.end());
        return QtyExtract {
            qty,
            unit,
            cleaned,
            pack,
            matched: true,
        };
    }
    QtyExtract {
        qty: 1,
        unit: String::new(),
        cleaned: text.to_string(),
        pack: false,
        matched: false,
    }
}

fn remove_span(text: &str, start: usize, end: usize) -> String {
    let head = text.get(..start).unwrap_or("");
    let tail = text.get(end..).unwrap_or("");
    format!("{} {}", head.trim(), tail.trim()).trim().to_string()
}

fn to_query_core(cleaned: &str) -> String {
    let mut tokens: Vec<&str> = TOKEN_RE.find_iter(cleaned).map(|m| m.as_str()).collect();
    while let Some(last) = tokens.last() {
        if QUERY_SERVICE_TOKENS.contains(last) {
            tokens.pop();
        } else {
            break;
        }
    }
    tokens.join(" ")
}

fn head_token(query: &str) -> Option<String> {
    let mut best: Option<&str> = None;
    for m in TOKEN_RE.find_iter(query) {
        let token = m.as_str();
        if is_digit_token(token)
            || STOP_HEAD_WORDS.contains(&token)
            || COLOR_WORDS.contains(&token)
            || char_len(token) < 4
        {
            continue;
        }
        if best.is_none_or(|b| char_len(token) > char_len(b)) {
            best = Some(token);
        }
    }
    best.map(|t| t.to_string())
}

fn extract_attributes(normalized: &str, pack_qty: Option<i64>) -> ItemAttributes {
    ItemAttributes {
        size: SIZE_ATTR_RE
            .find(normalized)
            .map(|m| m.as_str().to_string()),
        color: COLOR_ATTR_RE
            .captures(normalized)
            .map(|c| c.get(1).unwrap().as_str().to_string()),
        code: CODE_ATTR_RE
            .captures(normalized)
            .map(|c| c.get(1).unwrap().as_str().to_string()),
        din: DIN_ATTR_RE
            .captures(normalized)
            .map(|c| c.get(1).unwrap().as_str().to_string()),
        pack_qty,
    }
}

/// Propagate the head noun of an earlier item into later head-less items
/// ("Молния серая, беж по 5 шт" — the second item inherits "молния").
/// Expressed as a two-pass fold: heads first, rewrites second.
fn propagate_head(items: &mut [ParsedItem]) {
    let heads: Vec<Option<String>> = items.iter().map(|i| head_token(&i.query)).collect();

    let mut prev_head: Option<String> = None;
    for (item, head) in items.iter_mut().zip(heads) {
        if let Some(head) = head {
            prev_head = Some(head);
            let core = to_query_core(&item.query);
            item.query_core = if core.is_empty() {
                item.query.clone()
            } else {
                core
            };
            continue;
        }
        if let Some(prev) = &prev_head {
            if !item.query.is_empty() {
                item.query = format!("{prev} {}", item.query);
            }
        }
        let core = to_query_core(&item.query);
        item.query_core = if core.is_empty() {
            item.query.clone()
        } else {
            core
        };
    }
}

/// Parse free order text into one or more items.
pub fn parse_order_text(text: &str) -> Vec<ParsedItem> {
    let mut items = Vec::new();
    for part in SPLIT_RE.split(text) {
        let raw = part.trim();
        if raw.is_empty() {
            continue;
        }
        let normalized = normalize_part(raw);
        let extract = extract_qty_unit(&normalized);
        let mut numbers: Vec<i64> = NUM_RE
            .find_iter(&extract.cleaned)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        if !extract.unit.is_empty() {
            numbers.retain(|n| *n != extract.qty);
        }
        let query = {
            let core = to_query_core(&extract.cleaned);
            if core.is_empty() {
                extract.cleaned.trim().to_string()
            } else {
                core
            }
        };
        let pack_qty = extract.pack.then_some(extract.qty);
        let attributes = extract_attributes(&normalized, pack_qty);
        let is_patch = query.is_empty() && extract.matched;
        items.push(ParsedItem {
            raw: raw.to_string(),
            normalized: if is_patch {
                PATCH_MARKER.to_string()
            } else {
                normalized
            },
            qty: extract.qty,
            unit: extract.unit,
            numbers,
            query,
            query_core: String::new(),
            attributes,
        });
    }
    propagate_head(&mut items);
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thousand_pieces_expand() {
        let items = parse_order_text("гайка ус 6мм-2т.шт");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].qty, 2000);
        assert_eq!(items[0].unit, "шт");
        assert!(items[0].numbers.contains(&6));
        assert!(!items[0].numbers.contains(&2));
    }

    #[test]
    fn size_and_din_numbers_survive() {
        let items = parse_order_text("болт 8*30 дин 933 10шт");
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.qty, 10);
        assert_eq!(item.unit, "шт");
        for n in [8, 30, 933] {
            assert!(item.numbers.contains(&n), "missing {n}");
        }
        assert!(!item.numbers.contains(&10));
        assert_eq!(item.attributes.size.as_deref(), Some("8x30"));
        assert_eq!(item.attributes.din.as_deref(), Some("933"));
    }

    #[test]
    fn yellow_thousands() {
        let items = parse_order_text("саморез 4х25 -4т.шт жёлтый");
        assert_eq!(items[0].qty, 4000);
        assert_eq!(items[0].unit, "шт");
        assert!(items[0].numbers.contains(&4));
        assert!(items[0].numbers.contains(&25));
    }

    #[test]
    fn head_noun_propagates_across_elided_items() {
        let items = parse_order_text("Молния серая, беж по 5 шт");
        assert_eq!(items.len(), 2);
        assert!(items[0].query_core.contains("молния"));
        assert!(items[1].query_core.contains("молния"));
        assert_eq!(items[1].qty, 5);
        assert_eq!(items[1].unit, "шт");
        assert_eq!(items[1].attributes.color.as_deref(), Some("беж"));
        assert_eq!(items[1].attributes.pack_qty, Some(5));
    }

    #[test]
    fn quantity_only_part_becomes_patch() {
        let items = parse_order_text("нитки белые; 1 кор");
        assert_eq!(items.len(), 2);
        assert!(!items[0].is_patch());
        assert!(items[1].is_patch());
        assert_eq!(items[1].normalized, PATCH_MARKER);
        assert_eq!(items[1].qty, 1);
        assert_eq!(items[1].unit, "кор");
    }

    #[test]
    fn conjunction_splits_items() {
        let items = parse_order_text("поролон 50мм и синтепон 300");
        assert_eq!(items.len(), 2);
        assert!(items[0].query.contains("поролон"));
        assert!(items[1].query.contains("синтепон"));
    }

    #[test]
    fn pack_pattern_sets_unit_and_pack_qty() {
        let items = parse_order_text("молния по 10 шт");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].qty, 10);
        assert_eq!(items[0].unit, "шт");
        assert_eq!(items[0].attributes.pack_qty, Some(10));
        assert_eq!(items[0].query_core, "молния");
    }

    #[test]
    fn unit_canonicalization() {
        for (raw, unit) in [
            ("нитки 2 коробочки", "кор"),
            ("нитки 2 упаковку", "уп"),
            ("пленка 3 рулона", "рулон"),
            ("механизм 2 комплект", "комплект"),
        ] {
            let items = parse_order_text(raw);
            assert_eq!(items[0].unit, unit, "raw: {raw}");
        }
    }
}
