//! Completion promise parsing.
//!
//! A worker claims a stage is finished by printing `<promise>TEXT</promise>` on
//! a line of its own. Tags are case-sensitive; leading and trailing whitespace
//! on the line is tolerated, anything else on the line is not.

const OPEN_TAG: &str = "<promise>";
const CLOSE_TAG: &str = "</promise>";

/// Outcome of structural promise validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseCheck {
    /// No standalone promise line in the output.
    Missing,
    /// A promise line exists but its text differs from the expected one.
    Mismatch { found: String },
    /// A standalone promise line carries exactly the expected text.
    Valid,
}

/// Extract the text of the first standalone promise line.
pub fn extract_promise(output: &str) -> Option<&str> {
    output.lines().find_map(parse_promise_line)
}

fn parse_promise_line(line: &str) -> Option<&str> {
    let inner = line
        .trim()
        .strip_prefix(OPEN_TAG)?
        .strip_suffix(CLOSE_TAG)?;
    if inner.contains(OPEN_TAG) || inner.contains(CLOSE_TAG) {
        return None;
    }
    Some(inner)
}

/// Validate that `output` carries a well-formed promise equal to `expected`.
///
/// Every verification strategy runs this first; a non-`Valid` result always
/// rejects.
pub fn check_structure(output: &str, expected: &str) -> PromiseCheck {
    match extract_promise(output) {
        None => PromiseCheck::Missing,
        Some(found) if found == expected => PromiseCheck::Valid,
        Some(found) => PromiseCheck::Mismatch {
            found: found.to_string(),
        },
    }
}

/// Render the promise line a worker is expected to print.
pub fn render_promise(text: &str) -> String {
    format!("{OPEN_TAG}{text}{CLOSE_TAG}")
}
