//! The expression tree.
//!
//! A closed sum type over every node kind the compiler understands. Dialects
//! get first refusal on a node during lowering (date arithmetic, casts), so
//! the tree also carries the time nodes (`Trunc`, `Delta`, `Extract`, ...)
//! that only a dialect can render.

use crate::funcs::FunctionCall;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Equal,
    NotEqual,
    And,
    Or,
    Like,
    NotLike,
}

impl BinaryOp {
    /// The raw SQL spelling of the operator, without any NULL normalization.
    pub fn sql(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Greater => ">",
            BinaryOp::Less => "<",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::LessOrEqual => "<=",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "!=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Like => "LIKE",
            BinaryOp::NotLike => "NOT LIKE",
        }
    }

    pub fn is_arithmetic_or_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Subtract
                | BinaryOp::Multiply
                | BinaryOp::Divide
                | BinaryOp::Modulo
                | BinaryOp::Greater
                | BinaryOp::Less
                | BinaryOp::GreaterOrEqual
                | BinaryOp::LessOrEqual
                | BinaryOp::Equal
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunction {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Distinct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UngroupKind {
    All,
    Exclude,
}

impl UngroupKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            UngroupKind::All => "all",
            UngroupKind::Exclude => "exclude",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimestampUnit {
    pub fn sql(&self) -> &'static str {
        match self {
            TimestampUnit::Second => "SECOND",
            TimestampUnit::Minute => "MINUTE",
            TimestampUnit::Hour => "HOUR",
            TimestampUnit::Day => "DAY",
            TimestampUnit::Week => "WEEK",
            TimestampUnit::Month => "MONTH",
            TimestampUnit::Quarter => "QUARTER",
            TimestampUnit::Year => "YEAR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractUnit {
    Second,
    Minute,
    Hour,
    Day,
    DayOfWeek,
    DayOfYear,
    Week,
    Month,
    Quarter,
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalType {
    Date,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    Plus,
    Minus,
}

impl DeltaOp {
    pub fn sql(&self) -> &'static str {
        match self {
            DeltaOp::Plus => "+",
            DeltaOp::Minus => "-",
        }
    }
}

/// The type a `cast` lowers to, either a model type or a raw dialect type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastType {
    String,
    Number,
    Boolean,
    Date,
    Timestamp,
    SqlNative(String),
}

/// Which filter sub-language a `filterMatch` node applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    String,
    Number,
    Boolean,
    Date,
    Timestamp,
}

/// One branch of a CASE expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseWhen {
    pub when: Expr,
    pub then: Expr,
}

/// A filter riding along with an expression or a pipeline segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub e: Expr,
    pub expression_type: ExpressionType,
    /// Source text of the condition, kept for error reporting.
    pub code: Option<String>,
}

/// Classification of what an expression computes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionType {
    #[default]
    Scalar,
    Aggregate,
    Analytic,
    UngroupedAggregate,
}

impl ExpressionType {
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            ExpressionType::Aggregate | ExpressionType::UngroupedAggregate
        )
    }

    pub fn is_analytic(&self) -> bool {
        matches!(self, ExpressionType::Analytic)
    }

    /// Anything that cannot be computed row-by-row over the input.
    pub fn is_calculation(&self) -> bool {
        self.is_aggregate() || self.is_analytic()
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, ExpressionType::Scalar)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Reference to a field by dotted path from the current struct context.
    Field { path: Vec<String> },
    /// Reference to a source parameter.
    Parameter { path: Vec<String> },
    /// Reference to the source itself, or to a joined source by path.
    SourceReference { path: Option<Vec<String>> },
    /// Reference to a field of the current query output (analytic contexts).
    OutputField { name: String },
    StringLiteral { literal: String },
    NumberLiteral { literal: String },
    True,
    False,
    Null,
    TimeLiteral {
        literal: String,
        temporal_type: TemporalType,
        timezone: Option<String>,
    },
    Now,
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    In {
        not: bool,
        e: Box<Expr>,
        one_of: Vec<Expr>,
    },
    Coalesce {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Parens { e: Box<Expr> },
    Not { e: Box<Expr> },
    UnaryMinus { e: Box<Expr> },
    IsNull { e: Box<Expr> },
    IsNotNull { e: Box<Expr> },
    Case {
        value: Option<Box<Expr>>,
        whens: Vec<CaseWhen>,
        else_value: Option<Box<Expr>>,
    },
    /// An expression computed only over rows matching the filter list.
    Filtered {
        e: Box<Expr>,
        filter_list: Vec<FilterCondition>,
    },
    Aggregate {
        function: AggregateFunction,
        e: Box<Expr>,
        /// Path to the joined struct the aggregate computes over, when it is
        /// not the struct the expression is defined in.
        struct_path: Option<Vec<String>>,
    },
    /// `all()` / `exclude()`: compute over a different grouping partition.
    Ungroup {
        kind: UngroupKind,
        e: Box<Expr>,
        fields: Vec<String>,
    },
    FunctionCall(FunctionCall),
    /// Placeholder inside a function overload body, replaced at expansion.
    FunctionParameter { name: String },
    /// Spread of a variadic function parameter, replaced at expansion.
    Spread { e: Box<Expr> },
    /// Placeholder for an aggregate ORDER BY inside an overload body.
    AggregateOrderBy {
        prefix: Option<String>,
        suffix: Option<String>,
    },
    /// Placeholder for an aggregate LIMIT inside an overload body.
    AggregateLimit,
    /// Literal SQL fragments interleaved with sub-expressions. There is one
    /// fragment for each argument slot, plus a trailing fragment.
    GenericSql { src: Vec<String>, args: Vec<Expr> },
    /// Apply a filter-expression-language predicate to an expression.
    FilterMatch {
        data_type: FilterKind,
        e: Box<Expr>,
        filter: Box<Expr>,
    },
    /// Unparsed filter expression source, only legal under `FilterMatch`.
    FilterLiteral { filter_src: String },
    Trunc {
        e: Box<Expr>,
        temporal_type: TemporalType,
        units: TimestampUnit,
    },
    Extract {
        e: Box<Expr>,
        units: ExtractUnit,
    },
    Delta {
        op: DeltaOp,
        base: Box<Expr>,
        temporal_type: TemporalType,
        delta: Box<Expr>,
        units: TimestampUnit,
    },
    Cast {
        e: Box<Expr>,
        dst_type: CastType,
        safe: bool,
    },
    /// The empty expression, produced when expanding away optional pieces.
    Empty,
}

impl Expr {
    pub fn string_literal(s: impl Into<String>) -> Expr {
        Expr::StringLiteral { literal: s.into() }
    }

    pub fn number_literal(s: impl Into<String>) -> Expr {
        Expr::NumberLiteral { literal: s.into() }
    }

    pub fn field(path: &[&str]) -> Expr {
        Expr::Field {
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// True for nodes with sub-expressions; such nodes are wrapped in
    /// parentheses when compiled as a child of another node.
    pub fn has_children(&self) -> bool {
        !matches!(
            self,
            Expr::Field { .. }
                | Expr::Parameter { .. }
                | Expr::SourceReference { .. }
                | Expr::OutputField { .. }
                | Expr::StringLiteral { .. }
                | Expr::NumberLiteral { .. }
                | Expr::True
                | Expr::False
                | Expr::Null
                | Expr::TimeLiteral { .. }
                | Expr::Now
                | Expr::FunctionParameter { .. }
                | Expr::AggregateOrderBy { .. }
                | Expr::AggregateLimit
                | Expr::FilterLiteral { .. }
                | Expr::Empty
        )
    }

    /// Rewrite the tree bottom-up. `f` is offered every node after its
    /// children have been rewritten; returning `None` keeps the node.
    pub fn map(&self, f: &mut impl FnMut(&Expr) -> Option<Expr>) -> Expr {
        let mapped = self.map_children(&mut |c: &Expr| c.map(&mut *f));
        f(&mapped).unwrap_or(mapped)
    }

    /// Rewrite the tree top-down. When `f` replaces a node, the replacement
    /// is kept as-is and not descended into.
    pub fn map_pre(&self, f: &mut impl FnMut(&Expr) -> Option<Expr>) -> Expr {
        match f(self) {
            Some(replacement) => replacement,
            None => self.map_children(&mut |c: &Expr| c.map_pre(&mut *f)),
        }
    }

    fn map_children(&self, rec: &mut impl FnMut(&Expr) -> Expr) -> Expr {
        match self {
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(rec(left)),
                right: Box::new(rec(right)),
            },
            Expr::In { not, e, one_of } => Expr::In {
                not: *not,
                e: Box::new(rec(e)),
                one_of: one_of.iter().map(|x| rec(x)).collect(),
            },
            Expr::Coalesce { left, right } => Expr::Coalesce {
                left: Box::new(rec(left)),
                right: Box::new(rec(right)),
            },
            Expr::Parens { e } => Expr::Parens { e: Box::new(rec(e)) },
            Expr::Not { e } => Expr::Not { e: Box::new(rec(e)) },
            Expr::UnaryMinus { e } => Expr::UnaryMinus { e: Box::new(rec(e)) },
            Expr::IsNull { e } => Expr::IsNull { e: Box::new(rec(e)) },
            Expr::IsNotNull { e } => Expr::IsNotNull { e: Box::new(rec(e)) },
            Expr::Case {
                value,
                whens,
                else_value,
            } => Expr::Case {
                value: value.as_ref().map(|v| Box::new(rec(v))),
                whens: whens
                    .iter()
                    .map(|w| CaseWhen {
                        when: rec(&w.when),
                        then: rec(&w.then),
                    })
                    .collect(),
                else_value: else_value.as_ref().map(|v| Box::new(rec(v))),
            },
            Expr::Filtered { e, filter_list } => Expr::Filtered {
                e: Box::new(rec(e)),
                filter_list: filter_list
                    .iter()
                    .map(|c| FilterCondition {
                        e: rec(&c.e),
                        expression_type: c.expression_type,
                        code: c.code.clone(),
                    })
                    .collect(),
            },
            Expr::Aggregate {
                function,
                e,
                struct_path,
            } => Expr::Aggregate {
                function: *function,
                e: Box::new(rec(e)),
                struct_path: struct_path.clone(),
            },
            Expr::Ungroup { kind, e, fields } => Expr::Ungroup {
                kind: *kind,
                e: Box::new(rec(e)),
                fields: fields.clone(),
            },
            Expr::FunctionCall(call) => {
                let mut call = call.clone();
                call.args = call.args.iter().map(|a| rec(a)).collect();
                Expr::FunctionCall(call)
            }
            Expr::Spread { e } => Expr::Spread { e: Box::new(rec(e)) },
            Expr::GenericSql { src, args } => Expr::GenericSql {
                src: src.clone(),
                args: args.iter().map(|a| rec(a)).collect(),
            },
            Expr::FilterMatch {
                data_type,
                e,
                filter,
            } => Expr::FilterMatch {
                data_type: *data_type,
                e: Box::new(rec(e)),
                filter: Box::new(rec(filter)),
            },
            Expr::Trunc {
                e,
                temporal_type,
                units,
            } => Expr::Trunc {
                e: Box::new(rec(e)),
                temporal_type: *temporal_type,
                units: *units,
            },
            Expr::Extract { e, units } => Expr::Extract {
                e: Box::new(rec(e)),
                units: *units,
            },
            Expr::Delta {
                op,
                base,
                temporal_type,
                delta,
                units,
            } => Expr::Delta {
                op: *op,
                base: Box::new(rec(base)),
                temporal_type: *temporal_type,
                delta: Box::new(rec(delta)),
                units: *units,
            },
            Expr::Cast { e, dst_type, safe } => Expr::Cast {
                e: Box::new(rec(e)),
                dst_type: dst_type.clone(),
                safe: *safe,
            },
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_map_replaces_parameters() {
        let e = Expr::binary(
            BinaryOp::Add,
            Expr::FunctionParameter {
                name: "value".to_string(),
            },
            Expr::number_literal("1"),
        );
        let replaced = e.map(&mut |node| match node {
            Expr::FunctionParameter { .. } => Some(Expr::field(&["x"])),
            _ => None,
        });
        assert_eq!(
            replaced,
            Expr::binary(BinaryOp::Add, Expr::field(&["x"]), Expr::number_literal("1"))
        );
    }

    #[test]
    fn test_leaf_nodes_have_no_children() {
        assert!(!Expr::Null.has_children());
        assert!(!Expr::field(&["a", "b"]).has_children());
        assert!(
            Expr::binary(BinaryOp::Equal, Expr::field(&["a"]), Expr::Null).has_children()
        );
    }
}
