//! Prompt builder for stage workers and merge resolution.

use anyhow::Result;
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::promise::render_promise;
use crate::core::types::{AgentRole, FailureInfo, Stage, Task};

const STAGE_TEMPLATE: &str = include_str!("prompts/stage.md");
const RESOLVE_TEMPLATE: &str = include_str!("prompts/resolve.md");
const REGENERATE_TEMPLATE: &str = include_str!("prompts/regenerate.md");

/// Default byte budget for stage prompts.
pub const DEFAULT_PROMPT_BUDGET: usize = 32_000;

/// Template engine wrapper around minijinja.
#[derive(Debug)]
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("stage", STAGE_TEMPLATE)
            .expect("stage template should be valid");
        env.add_template("resolve", RESOLVE_TEMPLATE)
            .expect("resolve template should be valid");
        env.add_template("regenerate", REGENERATE_TEMPLATE)
            .expect("regenerate template should be valid");
        Self { env }
    }

    /// Render the prompt for one pipeline stage, dropping optional sections to
    /// stay within `budget_bytes`.
    pub fn render_stage(&self, input: &StagePrompt<'_>, budget_bytes: usize) -> Result<String> {
        let spec = input.task.completion_spec.as_ref();
        let template = self.env.get_template("stage")?;
        let rendered = template.render(context! {
            role => input.role.as_str(),
            stage => input.stage.as_str(),
            task => input.task,
            promise_line => render_promise(input.promise),
            outcome => spec.map(|s| s.outcome.trim()).filter(|s| !s.is_empty()),
            acceptance => spec.map(|s| s.acceptance_criteria.clone()).unwrap_or_default(),
            failure => input.previous_failure,
        })?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, budget_bytes);
        Ok(render_sections(&sections))
    }

    /// Prompt asking for a marker-free version of one conflicted file.
    pub fn render_resolve(&self, path: &str, conflicted: &str) -> Result<String> {
        let template = self.env.get_template("resolve")?;
        Ok(template.render(context! { path => path, content => conflicted })?)
    }

    /// Prompt asking for one file regenerated from both branch versions.
    pub fn render_regenerate(&self, path: &str, ours: &str, theirs: &str) -> Result<String> {
        let template = self.env.get_template("regenerate")?;
        Ok(template.render(context! { path => path, ours => ours, theirs => theirs })?)
    }
}

/// Inputs for a stage prompt.
#[derive(Debug, Clone, Copy)]
pub struct StagePrompt<'a> {
    pub task: &'a Task,
    pub stage: Stage,
    pub role: AgentRole,
    pub promise: &'a str,
    pub previous_failure: Option<&'a FailureInfo>,
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    use std::sync::LazyLock;
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex should be valid")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, body_start, key, required)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map(|next| next.0)
            .unwrap_or(rendered.len());
        let content = rendered[*body_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections, least important first, until within budget.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in ["failure", "acceptance", "outcome"] {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CompletionSpec, FailureReason};
    use crate::test_support::task;

    fn spec_task() -> Task {
        let mut t = task("TASK-07", 1).build();
        t.title = "Add login".to_string();
        t.completion_spec = Some(CompletionSpec {
            outcome: "Users can log in".to_string(),
            acceptance_criteria: vec!["valid password works".to_string()],
            criteria: Default::default(),
        });
        t
    }

    #[test]
    fn stage_prompt_carries_promise_and_sections_in_order() {
        let t = spec_task();
        let prompt = PromptEngine::new()
            .render_stage(
                &StagePrompt {
                    task: &t,
                    stage: Stage::Testing,
                    role: AgentRole::Tester,
                    promise: "TESTS PASSED",
                    previous_failure: None,
                },
                DEFAULT_PROMPT_BUDGET,
            )
            .expect("render");

        assert!(prompt.contains("<promise>TESTS PASSED</promise>"));
        assert!(prompt.contains("stage `testing`"));
        let contract = prompt.find("### Stage Contract").expect("contract");
        let task_pos = prompt.find("### Task").expect("task");
        let acceptance = prompt.find("### Acceptance Criteria").expect("acceptance");
        assert!(contract < task_pos && task_pos < acceptance);
        assert!(prompt.contains("- valid password works"));
        assert!(!prompt.contains("### Previous Failure"));
    }

    #[test]
    fn tight_budget_drops_failure_before_acceptance() {
        let t = spec_task();
        let failure = FailureInfo {
            stage: Stage::Implementing,
            iterations_used: 3,
            last_output: "x".repeat(4000),
            reason: FailureReason::StageRetriesExhausted,
            recorded_at: t.created_at,
        };
        let input = StagePrompt {
            task: &t,
            stage: Stage::Implementing,
            role: AgentRole::Coder,
            promise: "IMPLEMENTATION COMPLETE",
            previous_failure: Some(&failure),
        };
        let engine = PromptEngine::new();

        let full = engine.render_stage(&input, 100_000).expect("render");
        assert!(full.contains("### Previous Failure"));

        let tight = engine.render_stage(&input, 2_000).expect("render");
        assert!(!tight.contains("### Previous Failure"));
        assert!(tight.contains("### Acceptance Criteria"));
        assert!(tight.contains("<promise>IMPLEMENTATION COMPLETE</promise>"));
    }

    #[test]
    fn regenerate_prompt_includes_both_versions() {
        let prompt = PromptEngine::new()
            .render_regenerate("src/lib.rs", "fn ours() {}", "fn theirs() {}")
            .expect("render");
        assert!(prompt.contains("fn ours() {}"));
        assert!(prompt.contains("fn theirs() {}"));
        assert!(prompt.contains("`src/lib.rs`"));
    }
}
