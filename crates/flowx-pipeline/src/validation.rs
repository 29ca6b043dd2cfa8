//! Pipeline validation: lint rules and diagnostics.
//!
//! Provides built-in rules that check a parsed [`Pipeline`] before it is run.
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail
//! when any `Error`-severity issue is found.

use std::collections::HashSet;

use flowx_dag::{NodeSource, Pipeline, RoleRef, SplitterKind, ENTRY_NODE, EXIT_NODE};
use flowx_tools::language_separators;
use flowx_types::{FlowError, Result};

use crate::reference::{extract_reference, parse_reference};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        })
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic>;
}

fn is_reserved(name: &str) -> bool {
    name == ENTRY_NODE || name == EXIT_NODE
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct UniqueNamesRule;
impl LintRule for UniqueNamesRule {
    fn name(&self) -> &str { "unique_names" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut diagnostics = Vec::new();
        for node in &pipeline.nodes {
            let problem = if node.name.is_empty() {
                Some("A node has an empty name".to_string())
            } else if is_reserved(&node.name) {
                Some(format!("Node name '{}' is reserved", node.name))
            } else if !seen.insert(node.name.as_str()) {
                Some(format!("Node name '{}' is used more than once", node.name))
            } else {
                None
            };
            if let Some(message) = problem {
                diagnostics.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message,
                    node: Some(node.name.clone()),
                    fix: Some("Give every node a unique name other than inputs/outputs".into()),
                });
            }
        }
        diagnostics
    }
}

struct ExitReferenceRule;
impl LintRule for ExitReferenceRule {
    fn name(&self) -> &str { "exit_reference" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let error = |message: String| {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message,
                node: Some(EXIT_NODE.into()),
                fix: Some("Set outputs.reference to ${<node>.output}".into()),
            }]
        };
        let Some(raw) = pipeline.exit_reference.as_deref().filter(|r| !r.is_empty()) else {
            return error("outputs.reference not defined".into());
        };
        let Some(reference) = parse_reference(raw) else {
            return error(format!("outputs.reference '{raw}' is not a ${{node.field}} reference"));
        };
        if reference.namespace != ENTRY_NODE && pipeline.node(reference.namespace).is_none() {
            return error(format!(
                "outputs.reference names unknown node '{}'",
                reference.namespace
            ));
        }
        vec![]
    }
}

struct RoleExistsRule;
impl LintRule for RoleExistsRule {
    fn name(&self) -> &str { "role_exists" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        pipeline
            .nodes
            .iter()
            .filter_map(|n| match &n.role {
                Some(RoleRef::Named(role)) if pipeline.role(role).is_none() => Some((n, role)),
                _ => None,
            })
            .map(|(n, role)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Node '{}' uses undeclared role '{role}'", n.name),
                node: Some(n.name.clone()),
                fix: Some(format!("Declare role '{role}' under roles")),
            })
            .collect()
    }
}

struct SourceTextRule;
impl LintRule for SourceTextRule {
    fn name(&self) -> &str { "source_text" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        pipeline
            .nodes
            .iter()
            .filter(|n| matches!(n.source, NodeSource::Prompt(_) | NodeSource::Scheme(_)))
            .filter(|n| n.source.text().is_empty())
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("{} node '{}' has neither code nor path", n.kind(), n.name),
                node: Some(n.name.clone()),
                fix: Some("Add source.code or source.path".into()),
            })
            .collect()
    }
}

struct DocSourceRule;
impl LintRule for DocSourceRule {
    fn name(&self) -> &str { "doc_source" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for node in &pipeline.nodes {
            let NodeSource::Doc(doc) = &node.source else {
                continue;
            };
            if doc.url.is_none() && doc.path.is_none() && doc.reference.is_none() {
                diagnostics.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Doc node '{}' has no url, path or reference", node.name),
                    node: Some(node.name.clone()),
                    fix: Some("Add one of source.url, source.path, source.reference".into()),
                });
            }
            let Some(splitter) = doc.splitter.as_ref().filter(|s| s.name == SplitterKind::Code)
            else {
                continue;
            };
            match splitter.language.as_deref() {
                None => diagnostics.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Doc node '{}' uses the code splitter without a language", node.name),
                    node: Some(node.name.clone()),
                    fix: Some("Set splitter.language".into()),
                }),
                Some(lang) if language_separators(lang).is_none() => diagnostics.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Doc node '{}' names unsupported language '{lang}'", node.name),
                    node: Some(node.name.clone()),
                    fix: None,
                }),
                Some(_) => {}
            }
        }
        diagnostics
    }
}

struct ReferenceSyntaxRule;
impl LintRule for ReferenceSyntaxRule {
    fn name(&self) -> &str { "reference_syntax" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for node in &pipeline.nodes {
            for raw in node.reference_bearing() {
                let looks_like = raw.starts_with("${") && raw.ends_with('}');
                let problem = match parse_reference(raw) {
                    Some(r) if r.field.is_none() => Some(format!("reference '{raw}' names no field")),
                    None if looks_like && extract_reference(raw).is_none() => {
                        Some(format!("reference '{raw}' is malformed"))
                    }
                    _ => None,
                };
                if let Some(problem) = problem {
                    diagnostics.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!("Node '{}': {problem}", node.name),
                        node: Some(node.name.clone()),
                        fix: Some("Write references as ${namespace.field}".into()),
                    });
                }
            }
        }
        diagnostics
    }
}

struct KnownNamespaceRule;
impl LintRule for KnownNamespaceRule {
    fn name(&self) -> &str { "known_namespace" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for node in &pipeline.nodes {
            for reference in node.reference_bearing().into_iter().filter_map(parse_reference) {
                let ns = reference.namespace;
                if ns == node.name || pipeline.contains(ns) {
                    continue;
                }
                diagnostics.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!(
                        "Node '{}' references '{ns}', which is not a node; it must be supplied as a context namespace",
                        node.name
                    ),
                    node: Some(node.name.clone()),
                    fix: None,
                });
            }
        }
        diagnostics
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(pipeline: &Pipeline) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(UniqueNamesRule),
        Box::new(ExitReferenceRule),
        Box::new(RoleExistsRule),
        Box::new(SourceTextRule),
        Box::new(DocSourceRule),
        Box::new(ReferenceSyntaxRule),
        Box::new(KnownNamespaceRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(pipeline));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(pipeline: &Pipeline) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(pipeline);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(FlowError::Configuration(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Pipeline {
        flowx_dag::parse(yaml).unwrap()
    }

    fn has(diags: &[Diagnostic], rule: &str, severity: Severity) -> bool {
        diags.iter().any(|d| d.rule == rule && d.severity == severity)
    }

    #[test]
    fn valid_pipeline_passes() {
        let p = parse(r#"
outputs:
  reference: ${summarize.output}
nodes:
  - name: summarize
    source:
      code: "Summarize {text}"
    inputs:
      text: ${inputs.input_text}
"#);
        let diags = validate(&p);
        assert!(diags.is_empty(), "Expected no diagnostics, got: {diags:?}");
        assert!(validate_or_raise(&p).is_ok());
    }

    #[test]
    fn missing_exit_reference_error() {
        let p = parse(r#"
nodes:
  - name: a
    source:
      code: "hi"
"#);
        let diags = validate(&p);
        assert!(diags
            .iter()
            .any(|d| d.rule == "exit_reference" && d.message == "outputs.reference not defined"));
    }

    #[test]
    fn dangling_exit_reference_error() {
        let p = Pipeline::new(vec![flowx_dag::Node::prompt("a", "x")], "${ghost.output}");
        assert!(has(&validate(&p), "exit_reference", Severity::Error));
    }

    #[test]
    fn duplicate_and_reserved_names_error() {
        let p = Pipeline::new(
            vec![
                flowx_dag::Node::prompt("a", "x"),
                flowx_dag::Node::prompt("a", "y"),
                flowx_dag::Node::prompt("outputs", "z"),
            ],
            "${a.output}",
        );
        let diags = validate(&p);
        let count = diags.iter().filter(|d| d.rule == "unique_names").count();
        assert_eq!(count, 2, "{diags:?}");
    }

    #[test]
    fn unknown_role_error() {
        let p = parse(r#"
outputs:
  reference: ${a.output}
nodes:
  - name: a
    role: critic
    source:
      code: "hi"
"#);
        assert!(has(&validate(&p), "role_exists", Severity::Error));
    }

    #[test]
    fn code_splitter_without_language_error() {
        let p = parse(r#"
outputs:
  reference: ${load.output}
nodes:
  - name: load
    type: doc
    source:
      path: main.txt
      splitter:
        name: code
"#);
        let diags = validate(&p);
        assert!(has(&diags, "doc_source", Severity::Error), "{diags:?}");
    }

    #[test]
    fn reference_without_field_error() {
        let p = Pipeline::new(
            vec![flowx_dag::Node::prompt("a", "{x}").with_input("x", "${inputs}")],
            "${a.output}",
        );
        assert!(has(&validate(&p), "reference_syntax", Severity::Error));
    }

    #[test]
    fn unknown_namespace_is_only_a_warning() {
        let p = Pipeline::new(
            vec![flowx_dag::Node::prompt("a", "{x}").with_input("x", "${ctx.flag}")],
            "${a.output}",
        );
        let diags = validate(&p);
        assert!(has(&diags, "known_namespace", Severity::Warning));
        assert!(validate_or_raise(&p).is_ok());
    }

    #[test]
    fn validate_or_raise_joins_error_messages() {
        let p = Pipeline::new(
            vec![flowx_dag::Node::prompt("a", "x").with_input("x", "${inputs}")],
            "${ghost.output}",
        );
        let err = validate_or_raise(&p).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("ghost"), "{text}");
        assert!(text.contains("; "), "{text}");
    }
}
