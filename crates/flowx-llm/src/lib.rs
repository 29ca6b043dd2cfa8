//! Language-model seams for FlowX.
//!
//! Nodes talk to the outside world through two caller-supplied traits:
//! [`NodeRequester`] (node + resolved prompt → text) and [`Embedder`]
//! (text → vector). [`OpenAiClient`] implements both against any
//! OpenAI-compatible HTTP endpoint.

mod openai;
mod requester;
mod types;

pub use openai::OpenAiClient;
pub use requester::*;
pub use types::*;
