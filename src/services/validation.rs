use crate::models::test_record::{PanelResults, Verdict};

/// Accept a batch of verdicts when at least one panel was read.
///
/// A scan yielding no recognizable panel at all is treated as a
/// recognition failure (bad scan, wrong crop, wrong device) and is
/// eligible for another attempt.
pub fn is_acceptable(results: &PanelResults) -> bool {
    results.values().any(|v| *v != Verdict::NotFound)
}

/// Number of panels that produced a verdict.
pub fn panels_found(results: &PanelResults) -> usize {
    results.values().filter(|v| **v != Verdict::NotFound).count()
}
