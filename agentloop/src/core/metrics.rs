//! Numeric counters scraped from agent output.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::core::types::Metrics;

// Agent CLIs print either `Tokens used: 1,234` or a `tokens used` header followed by
// the number on the next line. Some split the count into input and output lines.
static TOKENS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(total|input|output|prompt|completion)[ \t]+)?tokens([ \t]+used)?[ \t]*[:=]?[ \t]*\r?\n?[ \t]*([0-9][0-9,_]*)",
    )
    .unwrap()
});

static TOOL_CALLS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\btool[ \t_-]*(?:calls?|uses?|invocations?)[ \t]*[:=]?[ \t]*([0-9][0-9,_]*)")
        .unwrap()
});

/// Build metrics from the output and the caller-measured duration.
///
/// When a counter is printed several times, the last value wins (agents print
/// running totals).
pub fn extract_metrics(output: &str, duration: Duration) -> Metrics {
    Metrics {
        tokens_used: tokens_used(output),
        tool_calls: last_number(&TOOL_CALLS_RE, output),
        ..Metrics::with_duration(duration)
    }
}

/// A `total`/`used` count beats input plus output, which beats a bare `tokens N`.
fn tokens_used(output: &str) -> Option<u64> {
    let (mut total, mut input, mut produced, mut bare) = (None, None, None, None);
    for caps in TOKENS_RE.captures_iter(output) {
        let Some(count) = caps.get(3).and_then(|m| parse_grouped(m.as_str())) else {
            continue;
        };
        let label = caps.get(1).map(|m| m.as_str().to_ascii_lowercase());
        match label.as_deref() {
            Some("total") => total = Some(count),
            Some("input" | "prompt") => input = Some(count),
            Some("output" | "completion") => produced = Some(count),
            _ if caps.get(2).is_some() => total = Some(count),
            _ => bare = Some(count),
        }
    }
    let split = match (input, produced) {
        (None, None) => None,
        (input, produced) => Some(input.unwrap_or(0) + produced.unwrap_or(0)),
    };
    total.or(split).or(bare)
}

fn last_number(re: &Regex, output: &str) -> Option<u64> {
    re.captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| parse_grouped(m.as_str()))
        .last()
}

fn parse_grouped(raw: &str) -> Option<u64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}
