// ---------------------------------------------------------------------------
// Library: path-keyed literal text loaded before a run
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::path::Path;

use flowx_types::{FlowError, Result};
use serde::{Deserialize, Serialize};

use crate::ast::{RoleRef, TextSource};
use crate::model::{NodeSource, Pipeline};

/// File name of a serialized library inside a content root.
pub const LIBRARY_FILE: &str = "flow.lib.json";

/// Extensions that mark a string as a library key rather than inline text.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "js", "rhai", "json", "prompt"];

/// `true` when `value` looks like a library key: a single line ending in one
/// of [`TEXT_EXTENSIONS`].
pub fn is_library_key(value: &str) -> bool {
    if value.contains('\n') || value.contains('{') {
        return false;
    }
    Path::new(value.trim())
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| TEXT_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Mapping from library keys to literal text. Read-only during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Library {
    entries: BTreeMap<String, String>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert unless the key is already present. Returns whether it was added.
    pub fn insert(&mut self, key: impl Into<String>, text: impl Into<String>) -> bool {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, text.into());
        true
    }

    /// Merge `other` in; existing keys are left untouched.
    pub fn merge(&mut self, other: Library) -> usize {
        let mut added = 0;
        for (key, text) in other.entries {
            if self.insert(key, text) {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Every library key the pipeline will ask for at run time, in node order.
pub fn required_keys(pipeline: &Pipeline) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    let mut push = |key: &str| {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    };

    for role in &pipeline.roles {
        if let Some(path) = &role.source.path {
            push(path);
        }
    }

    for node in &pipeline.nodes {
        if let Some(RoleRef::Inline {
            source: TextSource { path: Some(path), .. },
        }) = &node.role
        {
            push(path);
        }
        match &node.source {
            NodeSource::Prompt(p) => {
                if let Some(path) = &p.text.path {
                    push(path);
                }
            }
            NodeSource::Scheme(s) => {
                if let Some(path) = &s.text.path {
                    push(path);
                }
                if is_library_key(&s.schema) {
                    push(&s.schema);
                }
            }
            NodeSource::Doc(d) => {
                if let Some(path) = &d.path {
                    push(path);
                }
            }
            NodeSource::Retrieve(_) => {}
        }
        if let Some(func) = &node.func {
            if is_library_key(func) {
                push(func);
            }
        }
    }
    keys
}

/// Populate `library` from files under `root`.
///
/// A `flow.lib.json` in `root` is merged in first. Keys already present are
/// never re-read, so repeated builds are incremental. Returns the number of
/// entries added.
pub fn build_library(pipeline: &Pipeline, root: &Path, library: &mut Library) -> Result<usize> {
    let mut added = 0;

    let seed = root.join(LIBRARY_FILE);
    if seed.is_file() {
        added += library.merge(Library::load(&seed)?);
    }

    for key in required_keys(pipeline) {
        if library.contains(&key) {
            continue;
        }
        let file = root.join(&key);
        let text = std::fs::read_to_string(&file).map_err(|e| {
            FlowError::config(format!("{key} could not be read from {}: {e}", root.display()))
        })?;
        tracing::debug!(key = %key, bytes = text.len(), "library entry loaded");
        library.insert(key, text);
        added += 1;
    }

    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    #[test]
    fn library_key_detection() {
        assert!(is_library_key("prompts/answer.txt"));
        assert!(is_library_key("hook.rhai"));
        assert!(!is_library_key("node.output = 1;"));
        assert!(!is_library_key("{\"type\": \"object\"}"));
        assert!(!is_library_key("data.csv"));
    }

    #[test]
    fn insert_keeps_existing_entries() {
        let mut lib = Library::new();
        assert!(lib.insert("a.txt", "first"));
        assert!(!lib.insert("a.txt", "second"));
        assert_eq!(lib.get("a.txt"), Some("first"));
    }

    #[test]
    fn required_keys_cover_every_source() {
        let pipeline = parse(
            r#"
roles:
  - name: r
    source:
      path: roles/r.txt
nodes:
  - name: P
    source:
      path: p.txt
      func: hooks/p.rhai
  - name: S
    kind: scheme
    source:
      code: make json
      schema: schema.json
  - name: D
    kind: doc
    source:
      path: docs/guide.md
  - name: Q
    source:
      path: p.txt
"#,
        )
        .unwrap();
        assert_eq!(
            required_keys(&pipeline),
            vec![
                "roles/r.txt",
                "p.txt",
                "hooks/p.rhai",
                "schema.json",
                "docs/guide.md"
            ]
        );
    }

    #[test]
    fn build_library_reads_files_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("p.txt"), "Hello {name}").unwrap();
        std::fs::write(dir.path().join("q.txt"), "from disk").unwrap();
        let mut seed = Library::new();
        seed.insert("extra.txt", "seeded");
        seed.save(&dir.path().join(LIBRARY_FILE)).unwrap();

        let pipeline = parse(
            "nodes:\n  - name: P\n    source:\n      path: p.txt\n  - name: Q\n    source:\n      path: q.txt\n",
        )
        .unwrap();

        let mut library = Library::new();
        library.insert("q.txt", "already built");
        let added = build_library(&pipeline, dir.path(), &mut library).unwrap();

        assert_eq!(added, 2);
        assert_eq!(library.get("p.txt"), Some("Hello {name}"));
        assert_eq!(library.get("q.txt"), Some("already built"));
        assert_eq!(library.get("extra.txt"), Some("seeded"));
    }

    #[test]
    fn build_library_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = parse("nodes:\n  - name: P\n    source:\n      path: nope.txt\n").unwrap();
        let err = build_library(&pipeline, dir.path(), &mut Library::new()).unwrap_err();
        assert!(err.to_string().contains("nope.txt"));
    }
}
