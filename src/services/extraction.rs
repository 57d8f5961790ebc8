use regex::{Regex, RegexBuilder};

use crate::models::panel::{PanelTable, PanelTableError};
use crate::models::test_record::{PanelResults, Verdict};

struct CompiledPanel {
    name: String,
    patterns: Vec<Regex>,
}

/// Applies the panel table's match rules to normalized text.
pub struct PanelExtractor {
    panels: Vec<CompiledPanel>,
}

impl PanelExtractor {
    /// Compile every rule in the table. Each pattern must expose the verdict
    /// token as capture group 1.
    pub fn new(table: &PanelTable) -> Result<Self, PanelTableError> {
        table.check()?;

        let panels = table
            .panels
            .iter()
            .map(|panel| {
                let patterns = panel
                    .rules
                    .iter()
                    .map(|rule| {
                        let regex = RegexBuilder::new(&rule.to_regex_source())
                            .case_insensitive(true)
                            .build()
                            .map_err(|source| PanelTableError::Pattern {
                                panel: panel.name.clone(),
                                source,
                            })?;
                        if regex.captures_len() < 2 {
                            return Err(PanelTableError::MissingCapture(panel.name.clone()));
                        }
                        Ok(regex)
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(CompiledPanel {
                    name: panel.name.clone(),
                    patterns,
                })
            })
            .collect::<Result<Vec<_>, PanelTableError>>()?;

        Ok(Self { panels })
    }

    pub fn panel_names(&self) -> impl Iterator<Item = &str> {
        self.panels.iter().map(|p| p.name.as_str())
    }

    /// Verdict for every configured panel; panels without a match are
    /// `Not Found`.
    pub fn extract(&self, text: &str) -> PanelResults {
        let upper = text.to_uppercase();
        self.panels
            .iter()
            .map(|panel| (panel.name.clone(), Self::panel_verdict(panel, &upper)))
            .collect()
    }

    /// First pattern whose captured token normalizes to a verdict wins.
    fn panel_verdict(panel: &CompiledPanel, upper: &str) -> Verdict {
        panel
            .patterns
            .iter()
            .find_map(|pattern| {
                pattern
                    .captures(upper)
                    .and_then(|caps| caps.get(1))
                    .and_then(|token| verdict_from_token(token.as_str()))
            })
            .unwrap_or(Verdict::NotFound)
    }
}

/// `POS`/`POSITIVE` and `NEG`/`NEGATIVE`, case-insensitively.
pub fn verdict_from_token(token: &str) -> Option<Verdict> {
    match token.trim().to_uppercase().as_str() {
        "POS" | "POSITIVE" => Some(Verdict::Positive),
        "NEG" | "NEGATIVE" => Some(Verdict::Negative),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::panel::{MatchRule, PanelDefinition};

    fn extractor() -> PanelExtractor {
        PanelExtractor::new(&PanelTable::default()).unwrap()
    }

    #[test]
    fn test_two_panel_printout() {
        let results = extractor().extract("THC POSITIVE COC NEGATIVE");
        assert_eq!(results.len(), 6);
        assert_eq!(results["THC"], Verdict::Positive);
        assert_eq!(results["Cocaine"], Verdict::Negative);
        for panel in ["Opiates", "Amphetamines", "Methamphetamines", "Benzodiazepines"] {
            assert_eq!(results[panel], Verdict::NotFound);
        }
    }

    #[test]
    fn test_short_and_long_tokens_case_insensitive() {
        let results = extractor().extract("opi pos amp Neg bzo negative thc Positive");
        assert_eq!(results["Opiates"], Verdict::Positive);
        assert_eq!(results["Amphetamines"], Verdict::Negative);
        assert_eq!(results["Benzodiazepines"], Verdict::Negative);
        assert_eq!(results["THC"], Verdict::Positive);
    }

    #[test]
    fn test_amp_does_not_match_inside_mamp() {
        let results = extractor().extract("MAMP POS");
        assert_eq!(results["Methamphetamines"], Verdict::Positive);
        assert_eq!(results["Amphetamines"], Verdict::NotFound);
    }

    #[test]
    fn test_token_must_follow_code() {
        let results = extractor().extract("POS THC COC 12 NEG");
        assert!(results.values().all(|v| *v == Verdict::NotFound));
    }

    #[test]
    fn test_token_must_be_whole_word() {
        let results = extractor().extract("THC POSSIBLE COC NEGATIVES");
        assert_eq!(results["THC"], Verdict::NotFound);
        assert_eq!(results["Cocaine"], Verdict::NotFound);
    }

    #[test]
    fn test_no_panel_codes() {
        let results = extractor().extract("SOTOXA MOBILE TEST SYSTEM 2024-01-05");
        assert!(results.values().all(|v| *v == Verdict::NotFound));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let table = PanelTable {
            panels: vec![PanelDefinition {
                name: "Fentanyl".to_string(),
                rules: vec![
                    MatchRule::Pattern {
                        pattern: r"FENTANYL\s*:\s*(POS|NEG)\b".to_string(),
                    },
                    MatchRule::Code {
                        code: "FYL".to_string(),
                    },
                ],
            }],
            corrections: Vec::new(),
        };
        let extractor = PanelExtractor::new(&table).unwrap();
        let results = extractor.extract("FYL NEG FENTANYL: POS");
        assert_eq!(results["Fentanyl"], Verdict::Positive);

        let results = extractor.extract("FYL NEG");
        assert_eq!(results["Fentanyl"], Verdict::Negative);
    }

    #[test]
    fn test_pattern_without_capture_rejected() {
        let table = PanelTable {
            panels: vec![PanelDefinition {
                name: "THC".to_string(),
                rules: vec![MatchRule::Pattern {
                    pattern: r"THC\s+POS".to_string(),
                }],
            }],
            corrections: Vec::new(),
        };
        assert!(matches!(
            PanelExtractor::new(&table),
            Err(PanelTableError::MissingCapture(_))
        ));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let table = PanelTable {
            panels: vec![PanelDefinition {
                name: "THC".to_string(),
                rules: vec![MatchRule::Pattern {
                    pattern: r"THC\s+(POS".to_string(),
                }],
            }],
            corrections: Vec::new(),
        };
        assert!(matches!(
            PanelExtractor::new(&table),
            Err(PanelTableError::Pattern { .. })
        ));
    }
}
