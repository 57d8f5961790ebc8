use regex::Regex;
use std::sync::OnceLock;

use crate::models::panel::Correction;

static DISALLOWED: OnceLock<Regex> = OnceLock::new();
static WHITESPACE: OnceLock<Regex> = OnceLock::new();

fn disallowed() -> &'static Regex {
    DISALLOWED.get_or_init(|| Regex::new(r"[^A-Za-z0-9 :.\-]").expect("static regex"))
}

fn whitespace() -> &'static Regex {
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Cleans recognized text for pattern matching.
#[derive(Debug, Clone)]
pub struct TextNormalizer {
    corrections: Vec<Correction>,
}

impl TextNormalizer {
    pub fn new(corrections: Vec<Correction>) -> Self {
        Self { corrections }
    }

    /// Collapse whitespace, blank out characters outside `[A-Za-z0-9 :.-]`,
    /// apply the OCR-confusion corrections, collapse again and trim.
    pub fn normalize(&self, raw: &str) -> String {
        let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut text = disallowed().replace_all(&text, " ").into_owned();

        for correction in &self.corrections {
            if text.contains(&correction.from) {
                text = text.replace(&correction.from, &correction.to);
            }
        }

        whitespace().replace_all(&text, " ").trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::panel::PanelTable;

    fn normalizer() -> TextNormalizer {
        TextNormalizer::new(PanelTable::default().corrections)
    }

    #[test]
    fn test_collapses_whitespace_and_trims() {
        assert_eq!(normalizer().normalize("  THC \t\n POS  "), "THC POS");
    }

    #[test]
    fn test_strips_disallowed_characters() {
        assert_eq!(
            normalizer().normalize("THC|POS; COC_NEG 12/04/2024"),
            "THC POS COC NEG 12 04 2024"
        );
        assert_eq!(normalizer().normalize("Lot: A-12.5"), "Lot: A-12.5");
    }

    #[test]
    fn test_applies_confusion_corrections() {
        assert_eq!(normalizer().normalize("P0S"), "POS");
        assert_eq!(normalizer().normalize("THC NEO"), "THC NEG");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let n = normalizer();
        let samples = [
            "",
            "   ",
            "THC POSITIVE COC NEGATIVE",
            "t h c\tP0S\n\nOPI:NEO",
            "P0P0SS NNEOO",
            "MAMP/POS  BZO#NEG ",
            "déjà vu P0S ~~~ NEO!!",
            "2024-01-05 12:30 ID.0042",
        ];
        for sample in samples {
            let once = n.normalize(sample);
            assert_eq!(n.normalize(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn test_no_corrections_configured() {
        let n = TextNormalizer::new(Vec::new());
        assert_eq!(n.normalize("P0S"), "P0S");
    }
}
