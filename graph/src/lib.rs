#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Graph compiles ResourceGraphDefinitions into runnable graphs.
//!
//! The crate is a pure library: it parses field paths, transforms the terse
//! user schema notation into OpenAPI, isolates and analyzes `${…}`
//! expressions, emulates typed dummy objects, infers the status schema, and
//! assembles everything into an immutable [`Graph`](builder::Graph) the
//! controller executes. The only seam to a live cluster is the
//! [`SchemaSource`](builder::SchemaSource) trait.

pub mod builder;
pub mod dag;
pub mod emulator;
pub mod expr;
pub mod fieldpath;
pub mod infer;
pub mod resource;
pub mod simpleschema;

pub use builder::{Graph, GraphBuilder, ResolvedSchema, SchemaSource, StaticSchemaSource};
pub use resource::{FieldKind, Resource, ResourceField};

/// Error is the set of compilation failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Dag wraps a dependency-graph failure, cycles included.
    #[error("dependency graph error: {0}")]
    Dag(#[from] dag::Error),
    /// FieldPath wraps a field-path parse failure.
    #[error("field path error: {0}")]
    FieldPath(#[from] fieldpath::Error),
    /// SimpleSchema wraps a schema transformation failure.
    #[error("schema error: {0}")]
    SimpleSchema(#[from] simpleschema::Error),
    /// Emulate wraps an object emulation failure.
    #[error("emulation error: {0}")]
    Emulate(#[from] emulator::Error),
    /// Infer wraps a status-schema inference failure.
    #[error("status inference error: {0}")]
    Infer(#[from] infer::Error),
    /// Expr wraps an expression failure.
    #[error("expression error: {0}")]
    Expr(#[from] expr::Error),

    /// InvalidKind indicates a kind that is not UpperCamelCase.
    #[error("invalid kind {kind:?}: must be UpperCamelCase")]
    InvalidKind {
        /// The kind as written.
        kind: String,
    },
    /// InvalidApiVersion indicates a malformed version string.
    #[error("invalid apiVersion {version:?}: must match v<N>, v<N>alpha<N>, or v<N>beta<N>")]
    InvalidApiVersion {
        /// The version as written.
        version: String,
    },
    /// InvalidResourceId indicates an id that is not lowerCamelCase.
    #[error("invalid resource id {id:?}: must be lowerCamelCase")]
    InvalidResourceId {
        /// The id as written.
        id: String,
    },
    /// ReservedId indicates an id the expression language already claims.
    #[error("resource id {id:?} is a reserved word")]
    ReservedId {
        /// The id as written.
        id: String,
    },
    /// DuplicateId indicates two members sharing an id.
    #[error("duplicate resource id {id:?}")]
    DuplicateId {
        /// The repeated id.
        id: String,
    },
    /// MalformedTemplate indicates a member template missing its identity
    /// fields.
    #[error("resource {id:?}: malformed template: {detail}")]
    MalformedTemplate {
        /// The member id.
        id: String,
        /// What was wrong.
        detail: String,
    },
    /// CrdExpression indicates a CustomResourceDefinition member carrying
    /// expressions, which is not allowed.
    #[error("resource {id:?}: CRD templates may not contain expressions (found at {path})")]
    CrdExpression {
        /// The member id.
        id: String,
        /// Where the first expression was found.
        path: String,
    },
    /// ExpressionCompile indicates an expression that did not parse.
    #[error("resource {id:?}: {path}: {detail}")]
    ExpressionCompile {
        /// The member id (or `schema` for status fields).
        id: String,
        /// The field path carrying the expression.
        path: String,
        /// The parser's message, including the expression.
        detail: String,
    },
    /// UnknownReference indicates an expression reading an identifier that
    /// names no resource.
    #[error("resource {id:?}: {path}: unknown reference {name:?} in {expression:?}")]
    UnknownReference {
        /// The member id (or `schema` for status fields).
        id: String,
        /// The field path carrying the expression.
        path: String,
        /// The expression source.
        expression: String,
        /// The unresolved identifier.
        name: String,
    },
    /// GateReference indicates a readyWhen/includeWhen expression reading a
    /// resource it may not.
    #[error("resource {id:?}: gate {expression:?} may not reference {referenced:?}")]
    GateReference {
        /// The member id.
        id: String,
        /// The gate expression.
        expression: String,
        /// The resource it referenced.
        referenced: String,
    },
    /// TypeMismatch indicates a dry run producing a value the template
    /// field cannot hold.
    #[error(
        "resource {id:?}: {path}: expression {expression:?} evaluates to {got}, expected {expected}"
    )]
    TypeMismatch {
        /// The member id.
        id: String,
        /// The field path.
        path: String,
        /// The expression source.
        expression: String,
        /// The declared type at the path.
        expected: String,
        /// The evaluated type.
        got: String,
    },
    /// SchemaNotFound indicates the schema source does not serve the kind.
    #[error("no schema found for {0}")]
    SchemaNotFound(String),
    /// SchemaResolution indicates the schema source itself failed.
    #[error("schema resolution failed: {0}")]
    SchemaResolution(String),
    /// Other is a catch-all error.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result typedef for compilation.
pub type Result<T, E = Error> = std::result::Result<T, E>;
