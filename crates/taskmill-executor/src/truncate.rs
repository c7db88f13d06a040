//! Output truncation for captured logs and response bodies stored on a task.
//!
//! Middle omission keeps both the start of the output (install noise, the
//! first traceback frames) and the end (the final error line).

/// Characters kept from captured container output or a response body.
pub const DEFAULT_MAX_CHARS: usize = 64 * 1024;

/// Truncate `output` to at most `max_chars` characters plus a marker.
///
/// The split is done on characters, never inside a multi-byte sequence.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.len() <= max_chars {
        return output.to_owned();
    }

    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let half = max_chars / 2;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();
    let omitted = total - 2 * half;

    format!("{head}\n\n... [OUTPUT TRUNCATED: {omitted} chars omitted] ...\n\n{tail}")
}
