//! Per-node preparation: base text, reference resolution, and hooks.

use flowx_dag::{
    is_library_key, Library, Node, NodeOutput, NodeSource, Pipeline, RoleRef, TextSource,
    ENTRY_NODE, ENTRY_PROMPT_FIELD, NODE_FIELDS,
};
use flowx_types::{FlowContext, FlowError, Lookup, Namespaces, Result};
use serde_json::{Map, Value};

use crate::hooks::{HookEvaluator, HOOK_NODE_KEY};
use crate::reference::{extract_reference, parse_reference, substitute_placeholders};

/// Which pass a node is being prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Preview: no external calls, inputs are left as written.
    Dry,
    /// Real execution: resolved inputs are written back to the node.
    Live,
}

/// A node's resolved request text and reference-bearing values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prepared {
    pub prompt: String,
    pub inputs: Map<String, Value>,
    /// Resolved kind-specific descriptor values (`query`, `doc`, `url`,
    /// `path`, `reference`), keyed by field name.
    pub fields: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Base text
// ---------------------------------------------------------------------------

/// Text stored in the library under `key`.
///
/// A missing key that looks like a file the library build should have read
/// is reported as "not built"; anything else as "not found".
pub fn library_text(library: &Library, key: &str) -> Result<String> {
    if let Some(text) = library.get(key) {
        return Ok(text.to_string());
    }
    if is_library_key(key) {
        Err(FlowError::config(format!(
            "{key} not build, you need build-lib first."
        )))
    } else {
        Err(FlowError::config(format!("{key} not found")))
    }
}

fn text_source(source: &TextSource, library: &Library) -> Result<Option<String>> {
    match (&source.code, &source.path) {
        (Some(code), _) => Ok(Some(code.clone())),
        (None, Some(path)) => library_text(library, path).map(Some),
        (None, None) => Ok(None),
    }
}

/// Role text prepended to a node's prompt, empty when the node has no role.
pub fn role_text(node: &Node, pipeline: &Pipeline, library: &Library) -> Result<String> {
    let source = match &node.role {
        None => return Ok(String::new()),
        Some(RoleRef::Inline { source }) => source,
        Some(RoleRef::Named(name)) => {
            &pipeline
                .role(name)
                .ok_or_else(|| FlowError::config(format!("{name} Not Found")))?
                .source
        }
    };
    Ok(text_source(source, library)?.unwrap_or_default())
}

/// Role text followed by the node's own source text.
///
/// Prompt and scheme nodes must carry source text; doc and retrieve nodes
/// use it only when present.
pub fn base_text(node: &Node, pipeline: &Pipeline, library: &Library) -> Result<String> {
    let role = role_text(node, pipeline, library)?;
    let body = match text_source(&node.source.text(), library)? {
        Some(text) => text,
        None => match node.source {
            NodeSource::Prompt(_) | NodeSource::Scheme(_) => {
                return Err(FlowError::config(format!("{} source not found", node.name)));
            }
            NodeSource::Doc(_) | NodeSource::Retrieve(_) => String::new(),
        },
    };
    Ok(role + body.as_str())
}

// ---------------------------------------------------------------------------
// Reference resolution
// ---------------------------------------------------------------------------

/// Memo scope for values `node` reads from context namespace `namespace`.
fn memo_scope(node: &str, namespace: &str) -> String {
    format!("{node}:{namespace}")
}

/// Resolve one raw field value of `node`.
///
/// Plain text comes back unchanged. A reference is looked up in the context
/// namespaces first, then in the entry fields or the named node. Context
/// values are recorded in the memo on a dry pass and read back from it on
/// the live pass.
pub async fn resolve_value(
    raw: &str,
    node: &Node,
    pipeline: &Pipeline,
    namespaces: &Namespaces,
    context: &FlowContext,
    pass: Pass,
) -> Result<Value> {
    let Some(reference) = parse_reference(raw) else {
        return Ok(Value::String(raw.to_string()));
    };
    let namespace = reference.namespace;
    let field = reference.field()?;
    let fail = |message: String| FlowError::reference(&node.name, message);

    if namespaces.contains(namespace) {
        let scope = memo_scope(&node.name, namespace);
        if pass == Pass::Live {
            if let Some(value) = context.recall(&scope, field).await {
                return Ok(value);
            }
        }
        return match namespaces.lookup(namespace, field) {
            Lookup::Value(value) => {
                if pass == Pass::Dry {
                    context.remember(scope, field, value.clone()).await;
                }
                Ok(value)
            }
            _ => Err(fail(format!("{namespace}.{field} not defined"))),
        };
    }

    if namespace == ENTRY_NODE {
        return match pipeline.entry.get(field) {
            Some(value) if !value.is_null() => Ok(value.clone()),
            _ if field == ENTRY_PROMPT_FIELD => Ok(Value::String(String::new())),
            _ => Err(fail(format!("{namespace}.{field} not found"))),
        };
    }

    let target = if namespace == node.name {
        Some(node)
    } else {
        pipeline.node(namespace)
    };
    let target = target.ok_or_else(|| fail(format!("{namespace} Node Not Found")))?;
    target
        .field(field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| fail(format!("{namespace}.{field} not found")))
}

/// Resolve a raw value and, when it was plain text rather than a reference,
/// fill its `{key}` placeholders.
async fn resolve_text_field(
    raw: &str,
    node: &Node,
    pipeline: &Pipeline,
    namespaces: &Namespaces,
    context: &FlowContext,
    pass: Pass,
    inputs: &Map<String, Value>,
) -> Result<Value> {
    if extract_reference(raw).is_some() {
        resolve_value(raw, node, pipeline, namespaces, context, pass).await
    } else {
        Ok(Value::String(substitute_placeholders(raw, inputs, &pipeline.entry)))
    }
}

/// Resolve every reference the node carries and build its request text.
///
/// On a live pass the resolved inputs are stored beside the node's input
/// definitions, which stay untouched so the pipeline can be planned again.
pub async fn prepare(
    node: &mut Node,
    pipeline: &Pipeline,
    library: &Library,
    context: &FlowContext,
    pass: Pass,
) -> Result<Prepared> {
    let base = base_text(node, pipeline, library)?;
    let namespaces = context.namespaces().await;

    let mut inputs = Map::new();
    for (key, raw) in &node.inputs {
        let value = match raw.as_str() {
            Some(text) => resolve_value(text, node, pipeline, &namespaces, context, pass).await?,
            None => raw.clone(),
        };
        inputs.insert(key.clone(), value);
    }
    // Plain-text inputs may themselves hold placeholders.
    let snapshot = inputs.clone();
    for (key, raw) in &node.inputs {
        if let Some(text) = raw.as_str() {
            if extract_reference(text).is_none() && text.contains('{') {
                inputs.insert(
                    key.clone(),
                    Value::String(substitute_placeholders(text, &snapshot, &pipeline.entry)),
                );
            }
        }
    }

    let mut fields = Map::new();
    match &node.source {
        NodeSource::Retrieve(r) => {
            let query = resolve_text_field(
                &r.query, node, pipeline, &namespaces, context, pass, &inputs,
            )
            .await?;
            fields.insert("query".into(), query);
            let doc = resolve_value(&r.doc, node, pipeline, &namespaces, context, pass).await?;
            fields.insert("doc".into(), doc);
        }
        NodeSource::Doc(d) => {
            for (name, raw) in [("url", &d.url), ("path", &d.path), ("reference", &d.reference)] {
                if let Some(raw) = raw {
                    let value = resolve_text_field(
                        raw, node, pipeline, &namespaces, context, pass, &inputs,
                    )
                    .await?;
                    fields.insert(name.into(), value);
                }
            }
        }
        NodeSource::Prompt(_) | NodeSource::Scheme(_) => {}
    }

    let prompt = substitute_placeholders(&base, &inputs, &pipeline.entry);
    if pass == Pass::Live {
        node.resolved_inputs = Some(inputs.clone());
    }

    Ok(Prepared {
        prompt,
        inputs,
        fields,
    })
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Source text of a `func` value: a library entry, or inline code.
pub fn hook_source(func: &str, library: &Library) -> Result<String> {
    match library.get(func) {
        Some(text) => Ok(text.to_string()),
        None if is_library_key(func) => library_text(library, func),
        None => Ok(func.to_string()),
    }
}

/// Run the node's hook, if it has one.
///
/// The scope holds every context namespace plus the node under `node`.
/// Afterwards the namespaces replace the context's, the node's output is
/// taken back only if the hook changed it, changed inputs are taken back,
/// and any other new or changed field lands in `extra`. Returns whether
/// the output changed.
pub async fn run_hook(
    node: &mut Node,
    evaluator: &dyn HookEvaluator,
    library: &Library,
    context: &FlowContext,
) -> Result<bool> {
    let Some(func) = node.func.clone() else {
        return Ok(false);
    };
    let source = hook_source(&func, library)?;

    let before = node.to_value();
    let mut scope = context.namespaces().await.into_map();
    scope.insert(HOOK_NODE_KEY.to_string(), before.clone());

    evaluator
        .evaluate(&source, &mut scope)
        .map_err(|message| FlowError::Evaluation {
            node: node.name.clone(),
            message,
        })?;

    let after = scope.remove(HOOK_NODE_KEY);
    context.replace_namespaces(scope).await;

    let Some(Value::Object(after)) = after else {
        return Ok(false);
    };
    let unchanged = |key: &str| before.get(key) == after.get(key);

    let output_changed = !unchanged("output");
    if output_changed {
        node.output = after.get("output").cloned().map(NodeOutput::from_value);
    }
    if !unchanged("inputs") {
        if let Some(Value::Object(inputs)) = after.get("inputs") {
            node.resolved_inputs = Some(inputs.clone());
        }
    }
    for (key, value) in &after {
        if !NODE_FIELDS.contains(&key.as_str()) && !unchanged(key) {
            node.extra.insert(key.clone(), value.clone());
        }
    }

    tracing::debug!(node = %node.name, output_changed, "hook evaluated");
    Ok(output_changed)
}
