//! Expr is the boundary to the expression language.
//!
//! Only three capabilities cross it: compiling source to a program,
//! evaluating a program against variables, and inspecting a parsed AST for
//! the identifiers it touches. Everything else in the crate works with plain
//! strings and `serde_json::Value`s.

pub mod eval;
pub mod inspect;
pub mod scan;

pub use eval::{coerce_string, compile, evaluate, evaluate_all, evaluate_bool, parse_ast};
pub use inspect::{inspect, Dependency, Inspection};
pub use scan::{extract_expressions, scan, ScannedField};

/// Error is the set of expression failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Parse indicates the expression source did not compile.
    #[error("failed to parse expression {expression:?}: {detail}")]
    Parse {
        /// The expression source.
        expression: String,
        /// The parser's message.
        detail: String,
    },
    /// Eval indicates evaluation failed against the provided variables.
    #[error("failed to evaluate expression {expression:?}: {detail}")]
    Eval {
        /// The expression source.
        expression: String,
        /// The interpreter's message.
        detail: String,
    },
    /// UnterminatedExpression indicates a `${` with no matching `}`.
    #[error("unterminated expression in {input:?}")]
    UnterminatedExpression {
        /// The string being scanned.
        input: String,
    },
    /// NonBoolean indicates a gate expression that did not yield a boolean.
    #[error("expression {expression:?} must evaluate to a boolean, got {got}")]
    NonBoolean {
        /// The expression source.
        expression: String,
        /// A description of the value produced instead.
        got: String,
    },
    /// NotStringCoercible indicates a mixed-field expression whose value
    /// cannot be concatenated into a string.
    #[error("expression {expression:?} is not string-coercible: got {got}")]
    NotStringCoercible {
        /// The expression source.
        expression: String,
        /// A description of the value produced.
        got: String,
    },
    /// UnsupportedValue indicates an evaluation result with no JSON
    /// representation.
    #[error("unsupported value from expression {expression:?}: {detail}")]
    UnsupportedValue {
        /// The expression source.
        expression: String,
        /// A description of the value.
        detail: String,
    },
}

/// Result typedef for expression operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
