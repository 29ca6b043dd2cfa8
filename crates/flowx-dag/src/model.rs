use std::fmt;
use std::str::FromStr;

use flowx_types::{Chunk, FlowError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ast::{RoleRef, TextSource};

/// Name of the synthetic entry node.
pub const ENTRY_NODE: &str = "inputs";
/// Name of the synthetic exit node.
pub const EXIT_NODE: &str = "outputs";
/// Entry field carrying the caller's initial prompt.
pub const ENTRY_PROMPT_FIELD: &str = "input_text";

// ---------------------------------------------------------------------------
// Node kinds and kind-specific sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Prompt,
    Scheme,
    Doc,
    Retrieve,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Prompt => "prompt",
            NodeKind::Scheme => "scheme",
            NodeKind::Doc => "doc",
            NodeKind::Retrieve => "retrieve",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prompt" => Ok(NodeKind::Prompt),
            "scheme" => Ok(NodeKind::Scheme),
            "doc" => Ok(NodeKind::Doc),
            "retrieve" => Ok(NodeKind::Retrieve),
            other => Err(FlowError::config(format!("unknown node kind `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSource {
    #[serde(flatten)]
    pub text: TextSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeSource {
    #[serde(flatten)]
    pub text: TextSource,
    /// Library key or inline JSON Schema text.
    pub schema: String,
    /// Definition inside the schema's `$defs`/`definitions` to target.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Library key of the document body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Reference to an upstream chunk list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splitter: Option<SplitterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveSource {
    pub query: String,
    pub doc: String,
    #[serde(default, alias = "k", skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// The kind of a node together with its kind-specific source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NodeSource {
    Prompt(PromptSource),
    Scheme(SchemeSource),
    Doc(DocSource),
    Retrieve(RetrieveSource),
}

impl NodeSource {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeSource::Prompt(_) => NodeKind::Prompt,
            NodeSource::Scheme(_) => NodeKind::Scheme,
            NodeSource::Doc(_) => NodeKind::Doc,
            NodeSource::Retrieve(_) => NodeKind::Retrieve,
        }
    }

    /// Literal text the node's generated prompt starts from.
    pub fn text(&self) -> TextSource {
        match self {
            NodeSource::Prompt(p) => p.text.clone(),
            NodeSource::Scheme(s) => s.text.clone(),
            NodeSource::Doc(d) => TextSource {
                code: d.code.clone(),
                path: None,
            },
            NodeSource::Retrieve(r) => TextSource {
                code: r.code.clone(),
                path: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Splitter configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitterKind {
    Character,
    Recursive,
    Token,
    #[default]
    Markdown,
    Html,
    Code,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitterConfig {
    #[serde(default, alias = "type")]
    pub name: SplitterKind,
    #[serde(default = "default_chunk_size", alias = "chunkSize")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap", alias = "chunkOverlap")]
    pub chunk_overlap: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separators: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, alias = "encodingName", skip_serializing_if = "Option::is_none")]
    pub encoding_name: Option<String>,
}

fn default_chunk_size() -> usize {
    1024
}

fn default_chunk_overlap() -> usize {
    20
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            name: SplitterKind::Markdown,
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            separator: None,
            separators: None,
            language: None,
            encoding_name: None,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeOutput {
    Text(String),
    Chunks(Vec<Chunk>),
    Structured(Value),
}

impl NodeOutput {
    pub fn to_value(&self) -> Value {
        match self {
            NodeOutput::Text(s) => Value::String(s.clone()),
            NodeOutput::Chunks(chunks) => {
                serde_json::to_value(chunks).unwrap_or(Value::Array(Vec::new()))
            }
            NodeOutput::Structured(v) => v.clone(),
        }
    }

    /// Interpret a JSON value (e.g. one written by a hook) as an output.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => NodeOutput::Text(s),
            Value::Array(ref items) if !items.is_empty() => match Chunk::list_from_value(&value) {
                Some(chunks) => NodeOutput::Chunks(chunks),
                None => NodeOutput::Structured(value),
            },
            other => NodeOutput::Structured(other),
        }
    }

    /// Placeholder stored by a dry run for a node of `kind`.
    pub fn placeholder(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Prompt | NodeKind::Scheme => NodeOutput::Text(String::new()),
            NodeKind::Doc | NodeKind::Retrieve => NodeOutput::Chunks(Vec::new()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            NodeOutput::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_chunks(&self) -> Option<&[Chunk]> {
        match self {
            NodeOutput::Chunks(c) => Some(c),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Fields of a node addressable by reference and by hooks. Anything else a
/// hook writes lands in [`Node::extra`].
pub const NODE_FIELDS: &[&str] = &["name", "kind", "role", "source", "inputs", "func", "output"];

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub role: Option<RoleRef>,
    pub source: NodeSource,
    /// Post-execution hook: inline source text or a library key.
    pub func: Option<String>,
    /// Input definitions as written. Graph building and path checks read these.
    pub inputs: Map<String, Value>,
    /// Inputs after reference resolution, set by the live pass.
    pub resolved_inputs: Option<Map<String, Value>>,
    pub output: Option<NodeOutput>,
    pub extra: Map<String, Value>,
}

impl Node {
    /// A prompt node with inline text, mostly for programmatic construction.
    pub fn prompt(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: None,
            source: NodeSource::Prompt(PromptSource {
                text: TextSource {
                    code: Some(code.into()),
                    path: None,
                },
            }),
            func: None,
            inputs: Map::new(),
            resolved_inputs: None,
            output: None,
            extra: Map::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), Value::String(value.into()));
        self
    }

    pub fn with_func(mut self, func: impl Into<String>) -> Self {
        self.func = Some(func.into());
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.source.kind()
    }

    /// Raw values that may hold a `${ns.field}` reference, in scan order:
    /// every input, then the kind-specific descriptor fields.
    pub fn reference_bearing(&self) -> Vec<&str> {
        let mut values: Vec<&str> = self.inputs.values().filter_map(Value::as_str).collect();
        match &self.source {
            NodeSource::Retrieve(r) => {
                values.push(&r.query);
                values.push(&r.doc);
            }
            NodeSource::Doc(d) => {
                values.extend(
                    [&d.url, &d.path, &d.reference]
                        .into_iter()
                        .filter_map(|v| v.as_deref()),
                );
            }
            NodeSource::Prompt(_) | NodeSource::Scheme(_) => {}
        }
        values
    }

    /// Resolved inputs once the node has run, its definitions before that.
    pub fn effective_inputs(&self) -> &Map<String, Value> {
        self.resolved_inputs.as_ref().unwrap_or(&self.inputs)
    }

    /// Read a top-level field the way references and hooks see it.
    pub fn field(&self, field: &str) -> Option<Value> {
        match field {
            "name" => Some(Value::String(self.name.clone())),
            "kind" => Some(Value::String(self.kind().to_string())),
            "role" => self.role.as_ref().and_then(|r| serde_json::to_value(r).ok()),
            "source" => serde_json::to_value(&self.source).ok(),
            "inputs" => Some(Value::Object(self.effective_inputs().clone())),
            "func" => self.func.clone().map(Value::String),
            "output" => self.output.as_ref().map(NodeOutput::to_value),
            other => self.extra.get(other).cloned(),
        }
    }

    /// Whole-node JSON view, with passthrough fields flattened in.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for key in NODE_FIELDS {
            map.insert((*key).to_string(), self.field(key).unwrap_or(Value::Null));
        }
        for (k, v) in &self.extra {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    pub name: String,
    pub source: TextSource,
}

/// A validated flow: entry fields, exit reference, nodes in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    pub entry: Map<String, Value>,
    pub exit_reference: Option<String>,
    pub nodes: Vec<Node>,
    pub roles: Vec<Role>,
    pub desc: Option<Value>,
    pub tips: Option<Value>,
}

impl Pipeline {
    pub fn new(nodes: Vec<Node>, exit_reference: impl Into<String>) -> Self {
        Self {
            nodes,
            exit_reference: Some(exit_reference.into()),
            ..Default::default()
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Every node name the graph knows: entry, exit, then declared nodes.
    pub fn node_names(&self) -> Vec<&str> {
        let mut names = vec![ENTRY_NODE, EXIT_NODE];
        names.extend(self.nodes.iter().map(|n| n.name.as_str()));
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        name == ENTRY_NODE || name == EXIT_NODE || self.node(name).is_some()
    }

    pub fn input_text(&self) -> Option<&str> {
        self.entry.get(ENTRY_PROMPT_FIELD).and_then(Value::as_str)
    }

    pub fn set_input_text(&mut self, text: impl Into<String>) {
        self.entry
            .insert(ENTRY_PROMPT_FIELD.to_string(), Value::String(text.into()));
    }
}
