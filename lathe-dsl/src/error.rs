//! Error types for pipeline parsing

use thiserror::Error;

/// Result type alias for parser operations
pub type Result<T> = std::result::Result<T, ParseError>;

/// Errors raised while turning pipeline text into an AST
///
/// Every variant is a rejected pipeline: it is reported to the submitter and
/// the pipeline never starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A character no token rule matches
    #[error("unexpected character '{found}' at line {line}, column {column}")]
    UnexpectedChar {
        found: char,
        line: usize,
        column: usize,
    },

    /// A quoted string without its closing quote
    #[error("unterminated string starting at line {line}, column {column}")]
    UnterminatedString { line: usize, column: usize },

    /// A token that does not fit the grammar at this position
    #[error("expected {expected}, found {found} at line {line}, column {column}")]
    UnexpectedToken {
        expected: String,
        found: String,
        line: usize,
        column: usize,
    },

    /// Input ended inside an open block
    #[error("expected {expected}, found end of input")]
    UnexpectedEof { expected: String },

    /// Well-formed input that violates a document invariant
    #[error("invalid pipeline: {0}")]
    Invalid(String),
}

impl ParseError {
    /// Position of the offending input, when known
    pub fn position(&self) -> Option<(usize, usize)> {
        match self {
            ParseError::UnexpectedChar { line, column, .. }
            | ParseError::UnterminatedString { line, column }
            | ParseError::UnexpectedToken { line, column, .. } => Some((*line, *column)),
            ParseError::UnexpectedEof { .. } | ParseError::Invalid(_) => None,
        }
    }
}
