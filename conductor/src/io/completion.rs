//! Completion spec files supplied at task creation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::types::CompletionSpec;

const COMPLETION_SPEC_SCHEMA: &str = include_str!("../../schemas/completion_spec.schema.json");

/// Read, schema-check and decode a completion spec JSON file.
pub fn load_completion_spec(path: &Path) -> Result<CompletionSpec> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_completion_spec(&raw).with_context(|| format!("load completion spec {}", path.display()))
}

pub fn parse_completion_spec(raw: &str) -> Result<CompletionSpec> {
    let instance: Value = serde_json::from_str(raw).context("parse completion spec json")?;
    validate_schema(&instance)?;
    serde_json::from_value(instance).context("decode completion spec")
}

/// Validate against the embedded JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(COMPLETION_SPEC_SCHEMA).context("parse completion spec schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AgentRole, VerificationMethod};

    #[test]
    fn accepts_full_spec() {
        let raw = r#"{
            "outcome": "Login works",
            "acceptance_criteria": ["valid password logs in"],
            "criteria": {
                "tester": {
                    "promise": "TESTS PASSED",
                    "max_iterations": 5,
                    "verification": {"method": "external", "command": "cargo test"}
                },
                "qa": {
                    "promise": "QA PASSED",
                    "max_iterations": 2,
                    "verification": {
                        "method": "multi_stage",
                        "policy": "require_all",
                        "stages": [{"method": "semantic"}, {"method": "string_match"}]
                    }
                }
            }
        }"#;
        let spec = parse_completion_spec(raw).expect("valid");
        assert_eq!(spec.criteria[&AgentRole::Tester].max_iterations, 5);
        assert!(matches!(
            spec.criteria[&AgentRole::Qa].verification,
            VerificationMethod::MultiStage { .. }
        ));
    }

    #[test]
    fn rejects_unknown_role_and_bad_iterations() {
        let raw = r#"{"outcome": "x", "criteria": {"designer": {"promise": "OK", "max_iterations": 1}}}"#;
        assert!(parse_completion_spec(raw).is_err());

        let raw = r#"{"outcome": "x", "criteria": {"coder": {"promise": "OK", "max_iterations": 0}}}"#;
        let err = parse_completion_spec(raw).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn rejects_promise_with_tags() {
        let raw = r#"{"outcome": "x", "criteria": {"coder": {"promise": "<promise>OK</promise>", "max_iterations": 1}}}"#;
        assert!(parse_completion_spec(raw).is_err());
    }

    #[test]
    fn loads_from_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("spec.json");
        fs::write(&path, r#"{"outcome": "done"}"#).expect("write");
        let spec = load_completion_spec(&path).expect("load");
        assert_eq!(spec.outcome, "done");
        assert!(spec.criteria.is_empty());
    }
}
