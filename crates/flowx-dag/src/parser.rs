use std::collections::HashSet;

use flowx_types::{FlowError, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::ast::{FlowDocument, NodeDef};
use crate::model::{
    DocSource, Node, NodeKind, NodeSource, Pipeline, PromptSource, RetrieveSource, Role,
    SchemeSource, ENTRY_NODE, EXIT_NODE,
};

/// Parse a YAML flow definition into a validated [`Pipeline`].
pub fn parse(input: &str) -> Result<Pipeline> {
    let document: FlowDocument =
        serde_yaml::from_str(input).map_err(|e| FlowError::Parse(e.to_string()))?;
    Pipeline::from_document(document)
}

impl Pipeline {
    /// Convert a raw document, checking node names and kind-specific sources.
    pub fn from_document(document: FlowDocument) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(document.nodes.len());
        for def in document.nodes {
            if def.name.trim().is_empty() {
                return Err(FlowError::config("node name must not be empty"));
            }
            if def.name == ENTRY_NODE || def.name == EXIT_NODE {
                return Err(FlowError::config(format!(
                    "node name `{}` is reserved",
                    def.name
                )));
            }
            if !seen.insert(def.name.clone()) {
                return Err(FlowError::config(format!(
                    "duplicate node name `{}`",
                    def.name
                )));
            }
            nodes.push(convert_node(def)?);
        }

        let exit_reference = document
            .outputs
            .get("reference")
            .and_then(Value::as_str)
            .map(String::from);

        let roles = document
            .roles
            .into_iter()
            .map(|r| Role {
                name: r.name,
                source: r.source,
            })
            .collect();

        tracing::debug!(nodes = nodes.len(), "parsed flow definition");

        Ok(Pipeline {
            entry: document.inputs,
            exit_reference,
            nodes,
            roles,
            desc: document.desc,
            tips: document.tips,
        })
    }
}

fn convert_node(def: NodeDef) -> Result<Node> {
    let kind = match def.kind.as_deref() {
        None | Some("") => NodeKind::Prompt,
        Some(k) => k.parse::<NodeKind>().map_err(|_| {
            FlowError::config(format!("node `{}` has unknown kind `{k}`", def.name))
        })?,
    };

    let mut source_map = def.source;
    // `func` may sit on the source or on the node itself.
    let source_func = source_map
        .remove("func")
        .and_then(|v| v.as_str().map(String::from));
    let func = source_func.or(def.func);

    let source = match kind {
        NodeKind::Prompt => NodeSource::Prompt(typed_source::<PromptSource>(&def.name, kind, source_map)?),
        NodeKind::Scheme => NodeSource::Scheme(typed_source::<SchemeSource>(&def.name, kind, source_map)?),
        NodeKind::Doc => {
            let doc = typed_source::<DocSource>(&def.name, kind, source_map)?;
            if doc.url.is_none() && doc.path.is_none() && doc.reference.is_none() {
                return Err(FlowError::config(format!(
                    "doc node `{}` needs one of `url`, `path` or `reference`",
                    def.name
                )));
            }
            NodeSource::Doc(doc)
        }
        NodeKind::Retrieve => NodeSource::Retrieve(typed_source::<RetrieveSource>(&def.name, kind, source_map)?),
    };

    Ok(Node {
        name: def.name,
        role: def.role,
        source,
        func,
        inputs: def.inputs,
        resolved_inputs: None,
        output: None,
        extra: def.extra,
    })
}

fn typed_source<T: DeserializeOwned>(
    node: &str,
    kind: NodeKind,
    source: Map<String, Value>,
) -> Result<T> {
    serde_json::from_value(Value::Object(source))
        .map_err(|e| FlowError::config(format!("node `{node}` has an invalid {kind} source: {e}")))
}
