//! Query parsing.
//!
//! The parser turns user query strings into `index::query::Query`
//! trees, consulting the schema for per-field compilation.

pub mod parser;

pub use parser::{ParseError, QueryParser};
