//! Condense a validation transcript into a short error summary.

/// Maximum number of diagnostic lines kept in a summary.
pub const MAX_SUMMARY_ENTRIES: usize = 3;

/// Summary used when a transcript carries no output at all.
pub const UNKNOWN_ERROR: &str = "unknown error (no output)";

const SEPARATOR: &str = " | ";

/// True if a line looks like a diagnostic: an error/exception marker, an
/// assertion failure, a failing test, or a pytest `E ` detail line.
pub fn is_diagnostic_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lower = trimmed.to_lowercase();
    lower.contains("error:")
        || lower.contains("exception:")
        || lower.contains("assertionerror")
        || (lower.contains("assert") && lower.contains("failed"))
        || (lower.contains("failed") && (lower.contains("test") || lower.contains("::")))
        || trimmed.starts_with("E ")
}

/// Extract at most [`MAX_SUMMARY_ENTRIES`] diagnostic lines, deduplicated in
/// first-seen order and joined with `" | "`.
///
/// Falls back to the last non-empty lines when nothing matches, and to
/// [`UNKNOWN_ERROR`] when there is no output.
pub fn extract_error_summary(transcript: &str) -> String {
    let mut picked: Vec<&str> = Vec::new();
    for line in transcript.lines() {
        if picked.len() == MAX_SUMMARY_ENTRIES {
            break;
        }
        if !is_diagnostic_line(line) {
            continue;
        }
        let trimmed = line.trim();
        if !picked.contains(&trimmed) {
            picked.push(trimmed);
        }
    }
    if !picked.is_empty() {
        return picked.join(SEPARATOR);
    }

    let non_empty: Vec<&str> = transcript
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if non_empty.is_empty() {
        return UNKNOWN_ERROR.to_string();
    }
    let start = non_empty.len().saturating_sub(MAX_SUMMARY_ENTRIES);
    non_empty[start..].join(SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTEST_FAILURE: &str = "\
=== TESTS ===
collected 2 items
test_calc.py::test_add PASSED
test_calc.py::test_sub FAILED
E       assert 1 == 2
E       assert 1 == 2
FAILED test_calc.py::test_sub - AssertionError: assert 1 == 2
";

    #[test]
    fn keeps_first_three_distinct_markers_in_order() {
        let summary = extract_error_summary(PYTEST_FAILURE);
        assert_eq!(
            summary,
            "test_calc.py::test_sub FAILED | E       assert 1 == 2 | \
             FAILED test_calc.py::test_sub - AssertionError: assert 1 == 2"
        );
    }

    #[test]
    fn never_more_than_three_entries() {
        let transcript = (0..10)
            .map(|i| format!("SyntaxError: bad token {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let summary = extract_error_summary(&transcript);
        assert_eq!(summary.split(SEPARATOR).count(), MAX_SUMMARY_ENTRIES);
        assert!(summary.starts_with("SyntaxError: bad token 0"));
    }

    #[test]
    fn falls_back_to_trailing_lines() {
        let transcript = "first\n\nsecond\nthird\nfourth\n   \n";
        assert_eq!(extract_error_summary(transcript), "second | third | fourth");
    }

    #[test]
    fn empty_output_yields_sentinel() {
        assert_eq!(extract_error_summary(""), UNKNOWN_ERROR);
        assert_eq!(extract_error_summary("  \n\t\n"), UNKNOWN_ERROR);
    }

    #[test]
    fn deterministic_for_same_input() {
        assert_eq!(
            extract_error_summary(PYTEST_FAILURE),
            extract_error_summary(PYTEST_FAILURE)
        );
    }

    #[test]
    fn marker_matching_is_case_insensitive() {
        assert!(is_diagnostic_line("TypeError: unsupported operand"));
        assert!(is_diagnostic_line("  RuntimeException: nope"));
        assert!(is_diagnostic_line("tests failed: 3"));
        assert!(!is_diagnostic_line("all good"));
        assert!(!is_diagnostic_line("exit code: 1"));
    }
}
