//! Secret Redaction
//!
//! Scrubs credentials from anything captured from an external process
//! before it reaches a caller, a log line or the trace. Patterns err on
//! the side of over-matching.

use once_cell::sync::Lazy;
use regex::Regex;

/// Fixed replacement for every scrubbed value.
pub const REDACTED: &str = "[redacted]";

static BEARER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bBearer\s+[A-Za-z0-9._~+/=-]+").expect("valid bearer pattern")
});

/// `NAME=value` where NAME ends in a secret-ish word (OPENAI_API_KEY, token, DB_PASSWORD...).
static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b([A-Z0-9_]*(?:TOKEN|SECRET|PASSWORD|PASSWD|API[_-]?KEY|ACCESS[_-]?KEY|PRIVATE[_-]?KEY))\s*=\s*("[^"]*"|'[^']*'|[^\s&;,]+)"#,
    )
    .expect("valid key=value pattern")
});

/// `"token": "..."` style JSON fields, string or bare scalar values.
///
/// Also matches fields inside JSON that was itself serialized into a
/// string (`\"token\":\"...\"`), as gateway tool envelopes carry their
/// payload. `q` keeps the escaping so the envelope stays valid JSON.
static JSON_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?P<q>\\?)"(?P<key>[A-Za-z0-9_-]*(?:token|password|passwd|secret|api[_-]?key))\\?"\s*:\s*(?:"(?:[^"\\]|\\.)*"|\\"[^"]*?\\"|[^,}\]\s\\]+)"#,
    )
    .expect("valid json field pattern")
});

/// `--token abc` style flags.
static CLI_FLAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(--(?:token|password|secret|api[_-]?key))\s+([^\s-][^\s]*)")
        .expect("valid flag pattern")
});

/// Returns `input` with every recognised secret replaced by [`REDACTED`].
pub fn redact_text(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let text = BEARER.replace_all(input, format!("Bearer {}", REDACTED).as_str());
    let text = KEY_VALUE.replace_all(&text, format!("${{1}}={}", REDACTED).as_str());
    let text = JSON_FIELD.replace_all(
        &text,
        format!("${{q}}\"${{key}}${{q}}\":${{q}}\"{}${{q}}\"", REDACTED).as_str(),
    );
    let text = CLI_FLAG.replace_all(&text, format!("${{1}} {}", REDACTED).as_str());
    text.into_owned()
}

/// Redacts each argument and joins them for logging.
pub fn redact_args(args: &[String]) -> String {
    redact_text(&args.join(" "))
}
