//! Flow definitions for FlowX pipelines.
//!
//! Parses the YAML flow format into a typed [`Pipeline`]: a list of
//! [`Node`]s, each a closed variant over prompt/scheme/doc/retrieve sources,
//! framed by the synthetic `inputs` and `outputs` nodes. Also owns the
//! [`Library`] of path-keyed texts that sources may point at.
//!
//! # Example
//! ```
//! let yaml = r#"
//! outputs:
//!   reference: ${greet.output}
//! nodes:
//!   - name: greet
//!     source:
//!       code: "Say hello to {who}"
//!     inputs:
//!       who: ${inputs.input_text}
//! "#;
//! let pipeline = flowx_dag::parse(yaml).unwrap();
//! assert_eq!(pipeline.nodes.len(), 1);
//! assert_eq!(pipeline.nodes[0].kind(), flowx_dag::NodeKind::Prompt);
//! ```

pub mod ast;
mod library;
mod model;
mod parser;

pub use ast::{FlowDocument, NodeDef, RoleDef, RoleRef, TextSource};
pub use library::{build_library, is_library_key, required_keys, Library, LIBRARY_FILE, TEXT_EXTENSIONS};
pub use model::*;
pub use parser::parse;
