//! The filter expression language.
//!
//! A small predicate grammar with one sub-language per data type
//! (string/number/boolean/temporal), independent of the main expression
//! tree. This crate only parses; SQL lowering lives with the compiler so the
//! dialect layer stays out of here.

use thiserror::Error;

pub mod ast;
mod parser;

pub use parser::{
    parse_boolean_filter, parse_number_filter, parse_string_filter, parse_temporal_filter,
};

#[derive(Debug, Error)]
pub enum FilterParseError {
    /// Carries the parser's diagnostic verbatim.
    #[error("filter expression parse error: {0}")]
    Syntax(String),
}
