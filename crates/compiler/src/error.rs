//! The compile-time error taxonomy.
//!
//! Every failure is fatal: no partial or degraded SQL is ever returned. The
//! caller is expected to surface these verbatim as compile errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("'{name}' not found{context}")]
    FieldNotFound { name: String, context: String },

    #[error("join '{0}' not found in result set")]
    JoinNotFound(String),

    #[error("source '{0}' not found in model")]
    SourceNotFound(String),

    #[error("redefinition of '{0}'")]
    Redefinition(String),

    #[error("ambiguous output field name '{0}'")]
    AmbiguousOutputName(String),

    #[error("FULL JOIN not supported by dialect '{0}'")]
    FullJoinNotSupported(String),

    #[error("function `{function}` is not defined for '{dialect}' dialect")]
    FunctionNotDefinedForDialect { function: String, dialect: String },

    #[error("function `{function}` does not support fanning out in {dialect}")]
    AggDistinctNotSupported { function: String, dialect: String },

    #[error(
        "function `{function}` does not support fanning out with an order by in {dialect}"
    )]
    OrderedAggDistinctNotSupported { function: String, dialect: String },

    #[error("aggregate fields cannot be used in select - '{0}'")]
    AggregateInProject(String),

    #[error("nested views cannot be used in select - '{0}'")]
    NestedViewInProject(String),

    #[error("already in all(); cannot nest within an all() calculation")]
    UngroupInUngroup,

    #[error("{kind}(): unknown field name \"{name}\" or name not in scope")]
    UngroupFieldNotInScope { kind: &'static str, name: String },

    #[error("unknown field in ORDER BY '{0}'")]
    UnknownOrderBy(String),

    #[error("invalid ORDER BY index '{0}'")]
    UnknownOrderByIndex(usize),

    #[error("cannot generate SQL, no value for parameter '{0}'")]
    NoParameterValue(String),

    #[error("parameter '{0}' was expected to be a filter expression")]
    ParameterNotFilter(String),

    #[error("cannot reference '{0}' as a scalar")]
    NotScalar(String),

    #[error("can only use filter expression literals or parameters as filter expressions")]
    FilterNotLiteral,

    #[error("cannot allocate unique alias name for '{0}'")]
    AliasOverflow(String),

    #[error(transparent)]
    Dialect(#[from] dialect::DialectError),

    #[error(transparent)]
    FilterParse(#[from] filters::FilterParseError),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CompileError>;

pub(crate) fn internal(msg: impl Into<String>) -> CompileError {
    CompileError::Internal(msg.into())
}
