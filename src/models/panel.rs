use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Verdict tokens a panel rule may capture, longest first so `POSITIVE`
/// is not cut short at `POS`.
pub const VERDICT_TOKENS: &str = "POSITIVE|NEGATIVE|POS|NEG";

/// Panel definitions and OCR-confusion corrections, loaded as data so
/// panels can be added without code changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PanelTable {
    pub panels: Vec<PanelDefinition>,
    #[serde(default)]
    pub corrections: Vec<Correction>,
}

/// One drug panel and its ordered match rules. The first rule that
/// matches decides the verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PanelDefinition {
    pub name: String,
    pub rules: Vec<MatchRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchRule {
    /// Device short code (e.g. `THC`) followed by a verdict token.
    Code { code: String },
    /// Raw regex; capture group 1 must be the verdict token.
    Pattern { pattern: String },
}

impl MatchRule {
    /// Regex source for this rule, matched against upper-cased text.
    pub fn to_regex_source(&self) -> String {
        match self {
            MatchRule::Code { code } => format!(
                r"\b{}\s+({})\b",
                regex::escape(&code.to_uppercase()),
                VERDICT_TOKENS
            ),
            MatchRule::Pattern { pattern } => pattern.clone(),
        }
    }
}

/// Literal substring replacement applied during normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Correction {
    pub from: String,
    pub to: String,
}

impl Correction {
    fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl PanelTable {
    pub fn from_json_str(json: &str) -> Result<Self, PanelTableError> {
        let table: PanelTable = serde_json::from_str(json)?;
        table.check()?;
        Ok(table)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, PanelTableError> {
        let json = std::fs::read_to_string(path).map_err(|source| PanelTableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Panel names in table order.
    pub fn panel_names(&self) -> impl Iterator<Item = &str> {
        self.panels.iter().map(|p| p.name.as_str())
    }

    /// Structural checks; regex compilation happens in the extractor.
    pub fn check(&self) -> Result<(), PanelTableError> {
        if self.panels.is_empty() {
            return Err(PanelTableError::Empty);
        }

        let mut seen = HashSet::new();
        for panel in &self.panels {
            if panel.name.trim().is_empty() {
                return Err(PanelTableError::Invalid("panel name is empty".to_string()));
            }
            if !seen.insert(panel.name.as_str()) {
                return Err(PanelTableError::DuplicatePanel(panel.name.clone()));
            }
            if panel.rules.is_empty() {
                return Err(PanelTableError::Invalid(format!(
                    "panel {} has no match rules",
                    panel.name
                )));
            }
        }

        if self.corrections.iter().any(|c| c.from.is_empty()) {
            return Err(PanelTableError::Invalid(
                "correction with empty source text".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for PanelTable {
    /// Six-panel SoToxa printout layout.
    fn default() -> Self {
        let panel = |name: &str, code: &str| PanelDefinition {
            name: name.to_string(),
            rules: vec![MatchRule::Code {
                code: code.to_string(),
            }],
        };

        Self {
            panels: vec![
                panel("THC", "THC"),
                panel("Cocaine", "COC"),
                panel("Opiates", "OPI"),
                panel("Amphetamines", "AMP"),
                panel("Methamphetamines", "MAMP"),
                panel("Benzodiazepines", "BZO"),
            ],
            corrections: vec![Correction::new("P0S", "POS"), Correction::new("NEO", "NEG")],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PanelTableError {
    #[error("Failed to read panel table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse panel table: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Panel table defines no panels")]
    Empty,

    #[error("Panel {0} is defined more than once")]
    DuplicatePanel(String),

    #[error("Invalid pattern for panel {panel}: {source}")]
    Pattern {
        panel: String,
        #[source]
        source: regex::Error,
    },

    #[error("Pattern for panel {0} has no capture group for the verdict token")]
    MissingCapture(String),

    #[error("Invalid panel table: {0}")]
    Invalid(String),
}
