//! Execution-order discovery over the derived edge set.

use std::collections::{HashMap, HashSet};

use flowx_dag::{Pipeline, ENTRY_NODE, EXIT_NODE};
use flowx_types::{FlowError, Namespaces, Result};

use crate::graph::EdgeSet;
use crate::reference::parse_reference;

// ---------------------------------------------------------------------------
// Validity check
// ---------------------------------------------------------------------------

/// Whether `path`, read left to right, is an executable order.
///
/// Each real node must find every reference it carries already satisfied:
/// by itself, by a node earlier in the path, or by a context namespace whose
/// field is defined. The first node that is not ready fails the whole
/// candidate. Entry and exit are always consumed.
pub fn check_path<S: AsRef<str>>(
    path: &[S],
    pipeline: &Pipeline,
    namespaces: &Namespaces,
) -> Result<bool> {
    let mut done: HashSet<&str> = HashSet::from([ENTRY_NODE]);

    for name in path.iter().map(AsRef::as_ref) {
        if name == ENTRY_NODE || name == EXIT_NODE {
            continue;
        }
        let node = pipeline
            .node(name)
            .ok_or_else(|| FlowError::config(format!("{name} Node Not Found")))?;

        let ready = node
            .reference_bearing()
            .into_iter()
            .filter_map(parse_reference)
            .all(|r| {
                r.namespace == name
                    || done.contains(r.namespace)
                    || r
                        .field
                        .is_some_and(|field| namespaces.is_resolvable(r.namespace, field))
            });
        if !ready {
            return Ok(false);
        }
        done.insert(name);
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Path search
// ---------------------------------------------------------------------------

/// Node names interned to indices, with adjacency in edge insertion order.
struct Arena<'a> {
    names: Vec<&'a str>,
    adjacency: Vec<Vec<usize>>,
}

impl<'a> Arena<'a> {
    fn build(edges: &'a EdgeSet) -> Self {
        let mut index: HashMap<&'a str, usize> = HashMap::new();
        let mut names: Vec<&'a str> = Vec::new();
        let mut intern = |name: &'a str, names: &mut Vec<&'a str>| -> usize {
            *index.entry(name).or_insert_with(|| {
                names.push(name);
                names.len() - 1
            })
        };

        intern(ENTRY_NODE, &mut names);
        intern(EXIT_NODE, &mut names);
        let pairs: Vec<(usize, usize)> = edges
            .iter()
            .map(|e| {
                let s = intern(&e.source, &mut names);
                let t = intern(&e.target, &mut names);
                (s, t)
            })
            .collect();

        let mut adjacency = vec![Vec::new(); names.len()];
        for (s, t) in pairs {
            adjacency[s].push(t);
        }
        Self { names, adjacency }
    }

    fn resolve(&self, path: &[usize]) -> Vec<String> {
        path.iter().map(|&i| self.names[i].to_string()).collect()
    }
}

struct Frame {
    node: usize,
    cursor: usize,
}

/// Find the flow path for a pipeline.
///
/// Depth-first search from the entry, following edges in insertion order and
/// marking nodes visited only on the current branch. The first path reaching
/// the exit that passes [`check_path`] wins; exit-reaching paths that fail
/// are recorded. If none passes, each direct `entry -> X` edge whose two-node
/// prefix is valid is spliced onto the first recorded path that contains the
/// entry but not `X`, and the first splice that passes is returned.
pub fn find_execution_path(
    edges: &EdgeSet,
    pipeline: &Pipeline,
    namespaces: &Namespaces,
) -> Result<Vec<String>> {
    let arena = Arena::build(edges);
    let (entry, exit) = (0, 1);

    let mut visited = vec![false; arena.names.len()];
    let mut path = vec![entry];
    let mut stack = vec![Frame {
        node: entry,
        cursor: 0,
    }];
    let mut invalid: Vec<Vec<String>> = Vec::new();
    visited[entry] = true;

    while let Some(frame) = stack.last_mut() {
        let Some(&next) = arena.adjacency[frame.node].get(frame.cursor) else {
            visited[frame.node] = false;
            path.pop();
            stack.pop();
            continue;
        };
        frame.cursor += 1;
        if visited[next] {
            continue;
        }

        if next == exit {
            path.push(exit);
            let candidate = arena.resolve(&path);
            path.pop();
            if check_path(&candidate, pipeline, namespaces)? {
                tracing::info!(path = ?candidate, "execution path found");
                return Ok(candidate);
            }
            tracing::debug!(path = ?candidate, "candidate path rejected");
            invalid.push(candidate);
            continue;
        }

        visited[next] = true;
        path.push(next);
        stack.push(Frame {
            node: next,
            cursor: 0,
        });
    }

    for target in edges.successors(ENTRY_NODE) {
        let head = [ENTRY_NODE, target];
        if !check_path(&head, pipeline, namespaces)? {
            continue;
        }
        let recorded = invalid
            .iter()
            .find(|p| !p.iter().any(|n| n == target) && p.iter().any(|n| n == ENTRY_NODE));
        let Some(recorded) = recorded else {
            continue;
        };

        let mut candidate: Vec<String> = head.iter().map(|s| s.to_string()).collect();
        candidate.extend(recorded.iter().skip(1).cloned());
        if check_path(&candidate, pipeline, namespaces)? {
            tracing::info!(path = ?candidate, "execution path stitched");
            return Ok(candidate);
        }
    }

    Err(FlowError::PathNotFound {
        entry: ENTRY_NODE.into(),
        exit: EXIT_NODE.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_edges;
    use flowx_dag::Node;
    use serde_json::{json, Map, Value};

    fn namespaces(value: Value) -> Namespaces {
        match value {
            Value::Object(m) => Namespaces::new(m),
            _ => Namespaces::default(),
        }
    }

    fn plan(pipeline: &Pipeline, ns: &Namespaces) -> Result<Vec<String>> {
        let edges = build_edges(pipeline, ns)?;
        find_execution_path(&edges, pipeline, ns)
    }

    #[test]
    fn linear_path() {
        let pipeline = Pipeline::new(
            vec![Node::prompt("A", "{q}").with_input("q", "${inputs.input_text}")],
            "${A.output}",
        );
        let path = plan(&pipeline, &Namespaces::default()).unwrap();
        assert_eq!(path, vec!["inputs", "A", "outputs"]);
    }

    #[test]
    fn chain_in_dependency_order() {
        let pipeline = Pipeline::new(
            vec![
                Node::prompt("C", "{b}").with_input("b", "${B.output}"),
                Node::prompt("B", "{a}").with_input("a", "${A.output}"),
                Node::prompt("A", "start"),
            ],
            "${C.output}",
        );
        let path = plan(&pipeline, &Namespaces::default()).unwrap();
        assert_eq!(path, vec!["inputs", "A", "B", "C", "outputs"]);
    }

    #[test]
    fn diamond_is_stitched_by_fallback() {
        // D needs both B and C; only one of them lies on any DFS branch, so
        // the fallback splices `inputs -> B` onto the recorded C branch.
        let pipeline = Pipeline::new(
            vec![
                Node::prompt("B", "b"),
                Node::prompt("C", "c"),
                Node::prompt("D", "{b}{c}")
                    .with_input("b", "${B.output}")
                    .with_input("c", "${C.output}"),
            ],
            "${D.output}",
        );
        let ns = Namespaces::default();
        let path = plan(&pipeline, &ns).unwrap();
        assert_eq!(path, vec!["inputs", "B", "C", "D", "outputs"]);
        assert!(check_path(&path, &pipeline, &ns).unwrap());
    }

    #[test]
    fn accepted_path_passes_its_own_check() {
        let pipeline = Pipeline::new(
            vec![
                Node::prompt("A", "a"),
                Node::prompt("B", "{x}").with_input("x", "${A.output}"),
                Node::prompt("E", "{y}{z}")
                    .with_input("y", "${B.output}")
                    .with_input("z", "${inputs.input_text}"),
            ],
            "${E.output}",
        );
        let ns = Namespaces::default();
        let path = plan(&pipeline, &ns).unwrap();
        assert!(check_path(&path, &pipeline, &ns).unwrap());
        assert_eq!(path.first().map(String::as_str), Some("inputs"));
        assert_eq!(path.last().map(String::as_str), Some("outputs"));
    }

    #[test]
    fn cycle_has_no_path() {
        let pipeline = Pipeline::new(
            vec![
                Node::prompt("A", "{b}").with_input("b", "${B.output}"),
                Node::prompt("B", "{a}").with_input("a", "${A.output}"),
            ],
            "${A.output}",
        );
        let err = plan(&pipeline, &Namespaces::default()).unwrap_err();
        assert!(matches!(err, FlowError::PathNotFound { .. }));
    }

    #[test]
    fn undefined_context_field_is_not_ready() {
        let ns = namespaces(json!({"ctx": {"flag": null}}));
        let pipeline = Pipeline::new(
            vec![Node::prompt("B", "{f}").with_input("f", "${ctx.flag}")],
            "${B.output}",
        );
        assert!(!check_path(&["inputs", "B", "outputs"], &pipeline, &ns).unwrap());
        assert!(matches!(
            plan(&pipeline, &ns).unwrap_err(),
            FlowError::PathNotFound { .. }
        ));

        let ns = namespaces(json!({"ctx": {"flag": true}}));
        assert!(check_path(&["inputs", "B", "outputs"], &pipeline, &ns).unwrap());
    }

    #[test]
    fn out_of_order_candidate_fails() {
        let pipeline = Pipeline::new(
            vec![
                Node::prompt("A", "a"),
                Node::prompt("B", "{a}").with_input("a", "${A.output}"),
            ],
            "${B.output}",
        );
        let ns = Namespaces::default();
        assert!(!check_path(&["inputs", "B", "A", "outputs"], &pipeline, &ns).unwrap());
        assert!(check_path(&["inputs", "A", "B", "outputs"], &pipeline, &ns).unwrap());
    }

    #[test]
    fn unknown_node_in_path_is_configuration_error() {
        let pipeline = Pipeline::new(vec![], "${inputs.input_text}");
        let err = check_path(&["inputs", "ghost"], &pipeline, &Namespaces::default()).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: ghost Node Not Found");
    }

    #[test]
    fn empty_edge_set_has_no_path() {
        let pipeline = Pipeline::new(vec![], "${A.output}");
        let err = find_execution_path(&EdgeSet::new(), &pipeline, &Namespaces::new(Map::new()))
            .unwrap_err();
        assert!(matches!(err, FlowError::PathNotFound { .. }));
    }
}
