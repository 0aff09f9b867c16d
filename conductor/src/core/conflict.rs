//! Git conflict marker detection and capability output cleanup.

/// True if `content` still contains any git conflict marker line.
pub fn has_conflict_markers(content: &str) -> bool {
    content.lines().any(is_marker_line)
}

fn is_marker_line(line: &str) -> bool {
    line.starts_with("<<<<<<< ")
        || line == "<<<<<<<"
        || line.starts_with(">>>>>>> ")
        || line == ">>>>>>>"
        || line == "======="
        || line.starts_with("||||||| ")
}

/// Strip one wrapping markdown code fence, if the whole text is fenced.
///
/// Resolution capabilities are asked for raw file content but sometimes wrap
/// it in ```` ```lang ```` anyway.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !(trimmed.starts_with("```") && trimmed.ends_with("```")) || trimmed.len() < 6 {
        return text.to_string();
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() < 2 {
        return text.to_string();
    }
    let mut body = lines[1..lines.len() - 1].join("\n");
    body.push('\n');
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_each_marker_kind() {
        assert!(has_conflict_markers("a\n<<<<<<< HEAD\nb\n"));
        assert!(has_conflict_markers("a\n=======\nb\n"));
        assert!(has_conflict_markers(">>>>>>> task/T-1\n"));
        assert!(has_conflict_markers("||||||| base\n"));
    }

    #[test]
    fn ignores_marker_like_text_inside_lines() {
        assert!(!has_conflict_markers("let s = \"=======\";\n"));
        assert!(!has_conflict_markers("// <<<<<<< is a marker\n"));
        assert!(!has_conflict_markers("========\n"));
    }

    #[test]
    fn strips_wrapping_fence() {
        let fenced = "```rust\nfn main() {}\n```";
        assert_eq!(strip_code_fence(fenced), "fn main() {}\n");
    }

    #[test]
    fn leaves_unfenced_text_alone() {
        let plain = "fn main() {}\n";
        assert_eq!(strip_code_fence(plain), plain);
    }
}
