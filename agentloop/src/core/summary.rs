//! One-paragraph summaries of agent output.

/// Summaries are strictly shorter than this many characters.
pub const SUMMARY_LIMIT: usize = 500;

const MAX_SUMMARY_LINES: usize = 3;

/// Join the leading informative lines of `output`, truncated below [`SUMMARY_LIMIT`].
///
/// Blank lines, code fences and lines made only of punctuation or box-drawing
/// characters carry no information and are skipped.
pub fn summarize(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| is_informative(line))
        .take(MAX_SUMMARY_LINES)
        .collect();
    truncate_chars(&lines.join(" "), SUMMARY_LIMIT - 1)
}

fn is_informative(line: &str) -> bool {
    !line.is_empty() && !line.starts_with("```") && line.chars().any(char::is_alphanumeric)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
