//! Debugger output parsing: prompt detection, advisory classification, and
//! log sanitization.
//!
//! The prompt is the only completion authority. Classification is used for
//! log detail and health probes; it never decides when a command is done.

use regex::Regex;
use std::sync::LazyLock;

/// The debugger's ready-for-input marker: digits, colon, digits,
/// greater-than at the start of a trimmed line (e.g. `0:000>`, `3:017>`).
static PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+:\d+>").expect("invalid prompt regex"));

const ERROR_KEYWORDS: &[&str] = &["error", "unable to", "invalid", "failed"];
const WARNING_KEYWORDS: &[&str] = &["warning", "warn", "caution"];
const SUCCESS_KEYWORDS: &[&str] = &["success", "ok", "complete"];

/// Marker prefix used to bracket commands when sentinel framing is enabled.
pub const SYNC_MARKER_PREFIX: &str = "CRASHDBG_SYNC_";

/// Appended to log text that was cut at the length cap.
const TRUNCATION_SUFFIX: &str = "... [truncated]";

/// True iff the trimmed line starts with the debugger prompt.
#[must_use]
pub fn is_command_complete(line: &str) -> bool {
    PROMPT.is_match(line.trim_start())
}

/// Advisory classification of an output chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputClass {
    pub is_empty: bool,
    pub has_error: bool,
    pub has_warning: bool,
    pub has_success: bool,
    pub has_prompt: bool,
}

/// Classify a chunk against the case-insensitive keyword sets.
#[must_use]
pub fn classify(chunk: &str) -> OutputClass {
    if chunk.trim().is_empty() {
        return OutputClass {
            is_empty: true,
            ..OutputClass::default()
        };
    }
    let lower = chunk.to_lowercase();
    OutputClass {
        is_empty: false,
        has_error: ERROR_KEYWORDS.iter().any(|k| lower.contains(k)),
        has_warning: WARNING_KEYWORDS.iter().any(|k| lower.contains(k)),
        has_success: SUCCESS_KEYWORDS.iter().any(|k| lower.contains(k)),
        has_prompt: chunk.lines().any(is_command_complete),
    }
}

/// Sanitize a chunk for logging: NUL bytes become a visible two-character
/// escape, and text beyond `max_len` is cut with a fixed suffix.
#[must_use]
pub fn format_for_logging(chunk: &str, max_len: usize) -> String {
    let sanitized = chunk.replace('\0', "\\0");
    if sanitized.len() <= max_len {
        return sanitized;
    }
    // Cut on a char boundary at or below the cap.
    let mut cut = max_len;
    while cut > 0 && !sanitized.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &sanitized[..cut], TRUNCATION_SUFFIX)
}

/// Unique sync marker for one command.
#[must_use]
pub fn sync_marker(command_id: &str) -> String {
    format!("{SYNC_MARKER_PREFIX}{command_id}__")
}

/// The debugger command that echoes a sync marker back to us.
#[must_use]
pub fn sync_echo_command(marker: &str) -> String {
    format!(".echo {marker}")
}

/// True iff the line is the echoed sync marker (and not our own command
/// being echoed back, which would still contain `.echo`).
#[must_use]
pub fn is_sync_marker(line: &str, marker: &str) -> bool {
    let trimmed = line.trim();
    trimmed.contains(marker) && !trimmed.contains(".echo")
}

/// True for lines that look like internal sync plumbing and should be kept
/// out of command output.
#[must_use]
pub fn is_internal_marker(line: &str) -> bool {
    line.contains(SYNC_MARKER_PREFIX)
}
