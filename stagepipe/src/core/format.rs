//! Column formatting for pipeline log lines.
//!
//! Log calls carry optional width hints: the left part of a line is padded on
//! the right to `left` columns, a status token is right-aligned in `right`
//! columns. A trailing newline is preserved outside the padding.

/// Width hints for one log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pad {
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl Pad {
    pub const NONE: Pad = Pad {
        left: None,
        right: None,
    };

    pub fn left(width: usize) -> Self {
        Self {
            left: Some(width),
            right: None,
        }
    }

    pub fn right(width: usize) -> Self {
        Self {
            left: None,
            right: Some(width),
        }
    }
}

/// Apply `pad` to `text`.
///
/// Text longer than the width is never truncated.
pub fn pad_text(text: &str, pad: Pad) -> String {
    let (body, newline) = match text.strip_suffix('\n') {
        Some(body) => (body, "\n"),
        None => (text, ""),
    };
    let body = match (pad.left, pad.right) {
        (Some(width), _) => format!("{body:<width$}"),
        (None, Some(width)) => format!("{body:>width$}"),
        (None, None) => body.to_string(),
    };
    format!("{body}{newline}")
}

/// Format a two-column check line: `label` padded to `left`, `[ status ]`
/// right-aligned in `right`.
pub fn check_line(label: &str, status: &str, left: usize, right: usize) -> String {
    let status = format!("[ {status} ]");
    format!(
        "{}{}\n",
        pad_text(label, Pad::left(left)),
        pad_text(&status, Pad::right(right))
    )
}
