//! Function call definitions.
//!
//! A `function_call` expression carries its own overload table: the front end
//! has already matched argument types, so the compiler only needs the chosen
//! overload's per-dialect body and parameter shapes.

use crate::expr::{Expr, ExpressionType};
use crate::pipeline::OrderDirection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub overload: FunctionOverloadDef,
    pub args: Vec<Expr>,
    pub order_by: Vec<FunctionOrderBy>,
    pub limit: Option<u64>,
    /// Output field names to add to an analytic PARTITION BY.
    pub partition_by: Vec<String>,
    /// Joined struct the call aggregates over, when not the defining struct.
    pub struct_path: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionOverloadDef {
    pub return_expression_type: ExpressionType,
    /// Symmetric aggregates (min/max style) never need distinct-key rewrites.
    pub is_symmetric: bool,
    pub params: Vec<FunctionParameterDef>,
    /// Dialect name to implementation body. A call on a dialect missing from
    /// this table is a compile error.
    pub dialect: HashMap<String, FunctionDialectDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDialectDef {
    /// Implementation body with `FunctionParameter` / `Spread` /
    /// `AggregateOrderBy` / `AggregateLimit` placeholders.
    pub e: Expr,
    pub needs_window_order_by: bool,
    pub between: Option<WindowFrame>,
    /// Which argument an order-by without an expression defaults to.
    pub default_order_by_arg_index: usize,
}

impl FunctionDialectDef {
    pub fn new(e: Expr) -> Self {
        FunctionDialectDef {
            e,
            needs_window_order_by: false,
            between: None,
            default_order_by_arg_index: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowFrame {
    pub preceding: FrameBound,
    pub following: FrameBound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameBound {
    Unbounded,
    Rows(i64),
    /// Bound taken from a literal argument, by parameter name.
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParameterDef {
    pub name: String,
    pub is_variadic: bool,
    /// Constant-requiring parameters (separators, formats) never get filter
    /// wrapping applied to their arguments.
    pub is_constant: bool,
}

impl FunctionParameterDef {
    pub fn value(name: impl Into<String>) -> Self {
        FunctionParameterDef {
            name: name.into(),
            is_variadic: false,
            is_constant: false,
        }
    }

    pub fn constant(name: impl Into<String>) -> Self {
        FunctionParameterDef {
            name: name.into(),
            is_variadic: false,
            is_constant: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionOrderBy {
    /// `None` means "order by the default argument of the overload".
    pub e: Option<Expr>,
    pub dir: Option<OrderDirection>,
}
