//! Inbound message normalization.
//!
//! Every rule is idempotent and the whole chain is total: any string in,
//! a normalized string out. Order matters — greeting stripping runs before
//! lowercasing so the rules can stay case-insensitive, size unification runs
//! before whitespace collapsing so `8 х 30` becomes one token.

use regex::Regex;
use std::sync::LazyLock;

static ADDRESSEE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*партнер-м\s*,\s*").unwrap());
static GREETING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:здравствуйте|добрый\s+день|добрый\s+вечер|привет)\b[\s!,.]*").unwrap()
});
static SIZE_X_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)\s*[xх*×]\s*(\d)").unwrap());
static SIZE_NA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d)\s+на\s+(\d)").unwrap());
static THOUSAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*(?:тыс\.?|т\.?)\s*шт\b").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Normalize a raw chat message for routing and parsing.
pub fn normalize_text(text: &str) -> String {
    let trimmed = text.trim();
    let without_addressee = ADDRESSEE_RE.replace(trimmed, "");

    // Greetings can stack ("Привет, добрый день!"), strip until stable.
    let mut head = without_addressee.to_string();
    loop {
        let stripped = GREETING_RE.replace(&head, "").to_string();
        if stripped == head {
            break;
        }
        head = stripped;
    }

    let mut normalized = head.to_lowercase().replace('ё', "е");
    normalized = SIZE_X_RE.replace_all(&normalized, "${1}x${2}").to_string();
    normalized = SIZE_NA_RE.replace_all(&normalized, "${1}x${2}").to_string();
    normalized = THOUSAND_RE.replace_all(&normalized, "${1}000 шт").to_string();
    SPACE_RE.replace_all(&normalized, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_addressee_and_greeting() {
        assert_eq!(
            normalize_text("Партнер-М, добрый день! нужен поролон"),
            "нужен поролон"
        );
        assert_eq!(normalize_text("Здравствуйте! болт 8х30"), "болт 8x30");
    }

    #[test]
    fn unifies_size_separators() {
        assert_eq!(normalize_text("8х30"), "8x30");
        assert_eq!(normalize_text("1010 x 40"), "1010x40");
        assert_eq!(normalize_text("120 на 60"), "120x60");
        assert_eq!(normalize_text("механизм подъёма"), "механизм подъема");
    }

    #[test]
    fn expands_thousand_pieces() {
        assert_eq!(normalize_text("гайка 2 т.шт"), "гайка 2000 шт");
        assert_eq!(normalize_text("гайка 2т шт"), "гайка 2000 шт");
        assert_eq!(normalize_text("саморез 4 тыс шт"), "саморез 4000 шт");
    }

    #[test]
    fn idempotent() {
        for raw in [
            "Партнер-М, привет! Молния серая, беж по 5 шт",
            "болт 8*30 дин 933 10шт",
            "2 т.шт",
            "  много   пробелов  ",
        ] {
            let once = normalize_text(raw);
            assert_eq!(normalize_text(&once), once, "input: {raw:?}");
        }
    }
}
