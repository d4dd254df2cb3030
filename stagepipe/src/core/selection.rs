//! Stage selection strings.
//!
//! A selection is a string whose characters are stage indices (`"012"` selects
//! stages 0, 1 and 2), or the keyword `all`. It is resolved once, before any
//! stage runs, into one runnable flag per stage.

use crate::error::FatalError;

/// Keyword that enables every stage.
pub const ALL: &str = "all";

/// Resolve `selection` into one runnable flag per stage.
///
/// Whitespace is ignored and repeated indices are harmless. Any other
/// character, or an index beyond `stage_count`, is a configuration error.
pub fn resolve_selection(selection: &str, stage_count: usize) -> Result<Vec<bool>, FatalError> {
    let selection = selection.trim();
    if selection.eq_ignore_ascii_case(ALL) {
        return Ok(vec![true; stage_count]);
    }

    let mut runnable = vec![false; stage_count];
    for ch in selection.chars().filter(|c| !c.is_whitespace()) {
        let index = ch.to_digit(10).ok_or_else(|| {
            FatalError::configuration(format!(
                "stage selection '{selection}': '{ch}' is not a stage index"
            ))
        })? as usize;
        let slot = runnable.get_mut(index).ok_or_else(|| {
            FatalError::configuration(format!(
                "stage selection '{selection}': no stage {index} (pipeline has {stage_count})"
            ))
        })?;
        *slot = true;
    }
    Ok(runnable)
}
