//! Semantic model for the analytical query compiler.
//!
//! Everything in this crate is plain data: schema nodes ([`schema::StructDef`]),
//! expression trees ([`expr::Expr`]), pipeline segments and queries
//! ([`pipeline`]), and function overload tables ([`funcs`]). The model is
//! produced by an external front end and consumed read-only by the compiler;
//! it carries no SQL knowledge of its own.

pub mod expr;
pub mod funcs;
pub mod pipeline;
pub mod schema;
