//! Schema nodes: sources, joined structs, and their fields.

use crate::expr::{Expr, ExpressionType, FilterCondition, TimestampUnit};
use crate::pipeline::{Query, TurtleDef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a joined struct relates to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    One,
    Many,
    Cross,
}

/// The physical join operation requested for an explicit join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixOperation {
    Left,
    Right,
    Full,
    Inner,
}

impl MatrixOperation {
    pub fn sql(&self) -> &'static str {
        match self {
            MatrixOperation::Left => "LEFT",
            MatrixOperation::Right => "RIGHT",
            MatrixOperation::Full => "FULL",
            MatrixOperation::Inner => "INNER",
        }
    }
}

/// Join relationship carried by a struct used as a join field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub join: JoinType,
    pub matrix_operation: Option<MatrixOperation>,
    pub on_expression: Option<Expr>,
}

/// What a struct is physically backed by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructKind {
    /// A physical table.
    Table { table_path: String },
    /// A literal SELECT supplied by the model.
    SqlSelect { select_str: String },
    /// The output of another query, expanded lazily at model load.
    QuerySource { query: Box<Query> },
    /// A composite source, resolved before compilation reaches us.
    Composite,
    /// Wraps a previous pipeline stage by name; `StructDef::name` is the
    /// stage name.
    Finalize,
    /// Head of a nested turtle pipeline; the SQL unnesting the parent stage.
    NestSource { pipe_sql: String },
    /// The output shape of a compiled query.
    QueryResult,
    /// An inline record field.
    Record,
    /// A repeated field.
    Array { element: ElementType },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Record,
    Scalar(AtomicType),
}

impl StructKind {
    /// Source structs can stand on their own in a FROM clause and carry
    /// dialect/connection information; records and arrays cannot.
    pub fn is_source(&self) -> bool {
        !matches!(self, StructKind::Record | StructKind::Array { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub kind: StructKind,
    pub fields: Vec<FieldDef>,
    /// Dialect name; meaningful on source structs, inherited otherwise.
    pub dialect: String,
    pub connection: String,
    pub primary_key: Option<String>,
    pub filter_list: Vec<FilterCondition>,
    /// Present when this struct is used as a join field.
    pub join: Option<JoinSpec>,
    /// A computed record/array is defined by an expression in its parent.
    pub e: Option<Expr>,
    pub parameters: HashMap<String, Parameter>,
    pub arguments: HashMap<String, Parameter>,
}

impl StructDef {
    pub fn table(name: &str, table_path: &str, dialect: &str, connection: &str) -> StructDef {
        StructDef {
            name: name.to_string(),
            kind: StructKind::Table {
                table_path: table_path.to_string(),
            },
            fields: Vec::new(),
            dialect: dialect.to_string(),
            connection: connection.to_string(),
            primary_key: None,
            filter_list: Vec::new(),
            join: None,
            e: None,
            parameters: HashMap::new(),
            arguments: HashMap::new(),
        }
    }
}

/// A source parameter or argument binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberType {
    Integer,
    Float,
}

/// Atomic scalar field types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicType {
    String,
    Number {
        number_type: NumberType,
    },
    Boolean,
    Date {
        timeframe: Option<TimestampUnit>,
    },
    Timestamp {
        timeframe: Option<TimestampUnit>,
    },
    Json,
    /// A native database type we pass through without interpreting.
    SqlNative {
        raw_type: Option<String>,
    },
}

impl AtomicType {
    /// The type name used in dialect field references and index output.
    pub fn type_name(&self) -> &'static str {
        match self {
            AtomicType::String => "string",
            AtomicType::Number { .. } => "number",
            AtomicType::Boolean => "boolean",
            AtomicType::Date { .. } => "date",
            AtomicType::Timestamp { .. } => "timestamp",
            AtomicType::Json => "json",
            AtomicType::SqlNative { .. } => "sql native",
        }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, AtomicType::Date { .. } | AtomicType::Timestamp { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Atomic(AtomicType),
    /// A named, embeddable pipeline.
    Turtle(TurtleDef),
    /// A field that is itself a struct: a joined source, record, or array.
    Join(StructDef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    /// Output rename; the identifier when present.
    pub rename: Option<String>,
    pub kind: FieldKind,
    /// Computed fields carry an expression in their defining struct context.
    pub e: Option<Expr>,
    pub expression_type: ExpressionType,
    /// Source text of the expression, kept for error reporting.
    pub code: Option<String>,
}

impl FieldDef {
    pub fn atomic(name: &str, atomic: AtomicType) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            rename: None,
            kind: FieldKind::Atomic(atomic),
            e: None,
            expression_type: ExpressionType::Scalar,
            code: None,
        }
    }

    pub fn string(name: &str) -> FieldDef {
        FieldDef::atomic(name, AtomicType::String)
    }

    pub fn number(name: &str) -> FieldDef {
        FieldDef::atomic(
            name,
            AtomicType::Number {
                number_type: NumberType::Float,
            },
        )
    }

    pub fn integer(name: &str) -> FieldDef {
        FieldDef::atomic(
            name,
            AtomicType::Number {
                number_type: NumberType::Integer,
            },
        )
    }

    pub fn measure(name: &str, e: Expr) -> FieldDef {
        let mut f = FieldDef::number(name);
        f.e = Some(e);
        f.expression_type = ExpressionType::Aggregate;
        f
    }

    pub fn dimension(name: &str, atomic: AtomicType, e: Expr) -> FieldDef {
        let mut f = FieldDef::atomic(name, atomic);
        f.e = Some(e);
        f
    }

    /// The name this field is known by in its struct's namespace.
    pub fn identifier(&self) -> &str {
        self.rename.as_deref().unwrap_or(&self.name)
    }

    pub fn atomic_type(&self) -> Option<&AtomicType> {
        match &self.kind {
            FieldKind::Atomic(t) => Some(t),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            FieldKind::Atomic(t) => t.type_name(),
            FieldKind::Turtle(_) => "turtle",
            FieldKind::Join(s) => match &s.kind {
                StructKind::Record => "record",
                StructKind::Array { .. } => "array",
                _ => "source",
            },
        }
    }

    /// Atomic fields whose value is stored, not computed.
    pub fn is_physical(&self) -> bool {
        matches!(self.kind, FieldKind::Atomic(_)) && self.e.is_none()
    }
}

/// Tracks why a join needs a synthesized distinct key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueKeyRequirement {
    pub is_count: bool,
}

pub fn merge_unique_key_requirement(
    a: Option<UniqueKeyRequirement>,
    b: Option<UniqueKeyRequirement>,
) -> Option<UniqueKeyRequirement> {
    match (a, b) {
        (Some(x), Some(y)) => Some(UniqueKeyRequirement {
            is_count: x.is_count && y.is_count,
        }),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_prefers_rename() {
        let mut f = FieldDef::string("flight_count");
        assert_eq!(f.identifier(), "flight_count");
        f.rename = Some("flights".to_string());
        assert_eq!(f.identifier(), "flights");
    }

    #[test]
    fn test_merge_unique_key_requirement_count_only_when_both_count() {
        let count = Some(UniqueKeyRequirement { is_count: true });
        let other = Some(UniqueKeyRequirement { is_count: false });
        assert_eq!(
            merge_unique_key_requirement(count, other),
            Some(UniqueKeyRequirement { is_count: false })
        );
        assert_eq!(merge_unique_key_requirement(count, None), count);
        assert_eq!(merge_unique_key_requirement(None, None), None);
    }
}
