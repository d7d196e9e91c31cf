//! Lathe Pipeline DSL
//!
//! Turns declarative pipeline scripts into the typed AST defined in
//! `lathe-core`.
//! It includes:
//! - Lexer producing position-tagged tokens
//! - Recursive-descent parser building the pipeline document
//! - Error type carrying the offending token and its position

pub mod error;
pub mod lexer;
pub mod parser;

pub use error::ParseError;
pub use parser::parse_pipeline;

pub use lathe_core::domain::pipeline::{Agent, Param, Pipeline, Stage, Step};
