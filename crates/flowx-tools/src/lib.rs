//! Document tooling for FlowX doc and retrieve nodes.
//!
//! Provides the [`TextSplitter`] strategies (character, recursive, token,
//! markdown, html, code), the [`DocumentFetcher`] trait with an HTTP
//! implementation, and an in-memory cosine-similarity [`MemoryVectorStore`].

pub mod fetch;
pub mod splitter;
pub mod vector;

pub use fetch::{csv_to_text, extract_file_extension, html_to_text, DocumentFetcher, HttpFetcher};
pub use splitter::{language_separators, splitter_for, TextSplitter};
pub use vector::{cosine_similarity, MemoryVectorStore, DEFAULT_TOP_K};
