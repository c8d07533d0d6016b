//! Status classification from exit code and free-form output.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::ResultStatus;

// Test-runner tallies such as `0 failed` or `warnings: 0` report the absence of a
// problem and are removed before keyword matching.
static ZERO_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:0|no)[ \t]+(?:tests?[ \t]+)?(?:failed|failures?|errors?|warnings?)\b|\b(?:failed|failures?|errors?|warnings?)[ \t]*[:=][ \t]*0\b",
    )
    .unwrap()
});

static FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)\b(failed|failure|fatal|panicked|aborted)\b|^\s*error(\[\w+\])?:").unwrap()
});

static WARNING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*warn(ing)?\b|\bwarnings?:|\bpartially\b|\bincomplete\b").unwrap()
});

static RECOVERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(partial(ly)? (success|complete|completed|done)|recovered|some (tasks?|steps?|tests?) (passed|completed|succeeded)|completed with (errors|warnings))\b",
    )
    .unwrap()
});

/// Classify an attempt.
///
/// - exit 0, no failure or warning phrasing: `Success`
/// - exit 0 with warning (or failure) phrasing: `Partial`
/// - non-zero exit: `Failure`, unless the output reports recovered/partial progress
/// - killed (no exit code): `Failure`
pub fn classify_status(exit_code: Option<i32>, output: &str) -> ResultStatus {
    match exit_code {
        Some(0) => {
            let output = without_zero_counts(output);
            if FAILURE_RE.is_match(&output) || WARNING_RE.is_match(&output) {
                ResultStatus::Partial
            } else {
                ResultStatus::Success
            }
        }
        Some(_) if RECOVERED_RE.is_match(output) => ResultStatus::Partial,
        _ => ResultStatus::Failure,
    }
}

fn without_zero_counts(output: &str) -> Cow<'_, str> {
    ZERO_COUNT_RE.replace_all(output, "")
}

/// Exit-code-only classification for degraded results.
pub fn status_from_exit_code(exit_code: Option<i32>) -> ResultStatus {
    match exit_code {
        Some(0) => ResultStatus::Success,
        _ => ResultStatus::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_exit_is_success() {
        assert_eq!(
            classify_status(Some(0), "All done. 0 errors, 12 tests passed."),
            ResultStatus::Success
        );
    }

    #[test]
    fn empty_output_with_clean_exit_is_success() {
        assert_eq!(classify_status(Some(0), ""), ResultStatus::Success);
    }

    #[test]
    fn warnings_with_clean_exit_are_partial() {
        assert_eq!(
            classify_status(Some(0), "warning: unused variable `x`\nfinished"),
            ResultStatus::Partial
        );
    }

    #[test]
    fn failure_keywords_with_clean_exit_are_partial() {
        assert_eq!(
            classify_status(Some(0), "2 tests FAILED but the change is in"),
            ResultStatus::Partial
        );
    }

    #[test]
    fn zero_failure_tallies_are_success() {
        assert_eq!(
            classify_status(Some(0), "test result: ok. 12 passed; 0 failed; 0 ignored\nAll done."),
            ResultStatus::Success
        );
        assert_eq!(
            classify_status(Some(0), "== 40 passed, no errors ==\nFailures: 0, Warnings: 0"),
            ResultStatus::Success
        );
    }

    #[test]
    fn non_zero_failure_tallies_are_partial() {
        assert_eq!(
            classify_status(Some(0), "test result: FAILED. 10 passed; 2 failed"),
            ResultStatus::Partial
        );
        assert_eq!(
            classify_status(Some(0), "10 failed; 0 passed"),
            ResultStatus::Partial
        );
    }

    #[test]
    fn non_zero_exit_is_failure() {
        assert_eq!(
            classify_status(Some(1), "Task FAILED due to compilation errors."),
            ResultStatus::Failure
        );
    }

    #[test]
    fn non_zero_exit_with_recovered_progress_is_partial() {
        assert_eq!(
            classify_status(Some(2), "Partially completed: 3 of 5 steps done"),
            ResultStatus::Partial
        );
        assert_eq!(
            classify_status(Some(1), "some tests passed before the timeout"),
            ResultStatus::Partial
        );
    }

    #[test]
    fn killed_process_is_failure() {
        assert_eq!(classify_status(None, "partially done"), ResultStatus::Failure);
    }
}
