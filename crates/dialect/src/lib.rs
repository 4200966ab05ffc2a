//! Database-specific SQL syntax.
//!
//! The [`Dialect`] trait is the pluggable capability the compiler consumes:
//! capability flags, syntax providers for everything that varies between
//! engines, and an opt-in [`Dialect::expr_to_sql`] override that lets a
//! dialect translate whole expression nodes (date arithmetic, casts) after
//! their children have been compiled. A missing capability is always a hard
//! error, never a silent fallback.

use model::expr::{CastType, DeltaOp, Expr, ExtractUnit, TemporalType, TimestampUnit};
use model::pipeline::Sampling;
use thiserror::Error;

mod duckdb;
mod mysql;
mod postgres;
mod standardsql;

pub use duckdb::DuckDb;
pub use mysql::MySql;
pub use postgres::Postgres;
pub use standardsql::StandardSql;

#[derive(Debug, Error)]
pub enum DialectError {
    #[error("unknown dialect '{0}'")]
    UnknownDialect(String),

    #[error("dialect '{dialect}' does not support {feature}")]
    NotSupported { dialect: String, feature: String },
}

pub type Result<T> = std::result::Result<T, DialectError>;

/// Information about the query being compiled that syntax providers may need.
#[derive(Debug, Clone, Default)]
pub struct QueryInfo {
    pub query_timezone: Option<String>,
}

/// What kind of parent a field reference addresses through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldReferenceType {
    Table,
    Record,
    ArrayScalar,
    ArrayRecord,
    NestSource,
}

/// A field as dialect aggregation builders see it.
#[derive(Debug, Clone)]
pub struct DialectField {
    pub type_name: String,
    pub sql_expression: String,
    pub sql_output_name: String,
    pub raw_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderByClauseType {
    Ordinal,
    OutputName,
    Expression,
}

/// Which clause is asking for ORDER BY rendering; some engines treat
/// analytic and aggregate ordering differently from the outer query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderByRequest {
    Query,
    Turtle,
    Analytical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitClause {
    Limit,
    Top,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeOp {
    Like,
    NotLike,
}

impl LikeOp {
    pub fn sql(&self) -> &'static str {
        match self {
            LikeOp::Like => "LIKE",
            LikeOp::NotLike => "NOT LIKE",
        }
    }
}

/// The already-compiled SQL of an expression node's children, handed to
/// [`Dialect::expr_to_sql`] so overrides never re-walk the tree.
#[derive(Debug, Clone, Default)]
pub struct CompiledKids {
    pub e: Option<String>,
    pub left: Option<String>,
    pub right: Option<String>,
    pub args: Vec<String>,
}

impl CompiledKids {
    pub fn single(sql: String) -> CompiledKids {
        CompiledKids {
            e: Some(sql),
            ..CompiledKids::default()
        }
    }

    pub fn pair(left: String, right: String) -> CompiledKids {
        CompiledKids {
            left: Some(left),
            right: Some(right),
            ..CompiledKids::default()
        }
    }
}

pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    // Capability flags. The compiler treats an absent capability as a fatal
    // compile error; nothing here ever degrades output silently.
    fn supports_full_join(&self) -> bool {
        true
    }
    fn supports_agg_distinct(&self) -> bool;
    fn supports_sum_distinct_function(&self) -> bool;
    fn unnest_with_numbers(&self) -> bool {
        false
    }
    fn supports_unnest_array_agg(&self) -> bool;
    fn supports_cte_in_correlated_subqueries(&self) -> bool;
    fn has_final_stage(&self) -> bool {
        false
    }
    fn division_is_integer(&self) -> bool {
        false
    }
    fn dont_union_index(&self) -> bool {
        false
    }
    fn cant_partition_window_functions_on_expressions(&self) -> bool {
        false
    }
    fn supports_select_replace(&self) -> bool {
        false
    }
    fn supports_complex_filtered_sources(&self) -> bool {
        true
    }
    fn limit_clause(&self) -> LimitClause {
        LimitClause::Limit
    }
    fn order_by_clause(&self) -> OrderByClauseType {
        OrderByClauseType::Ordinal
    }
    fn default_number_type(&self) -> &'static str;
    fn default_decimal_type(&self) -> &'static str {
        "NUMERIC"
    }
    fn udf_prefix(&self) -> &'static str;
    fn default_sampling(&self) -> Option<Sampling> {
        None
    }

    // Identifiers and literals.
    fn quote_table_path(&self, table_path: &str) -> String;
    fn sql_maybe_quote_identifier(&self, identifier: &str) -> String;
    fn sql_literal_string(&self, literal: &str) -> String {
        format!("'{}'", literal.replace('\'', "''"))
    }
    fn sql_literal_number(&self, literal: &str) -> String {
        literal.to_string()
    }
    fn cast_to_string(&self, expression: &str) -> String;
    fn concat(&self, values: &[String]) -> String {
        values.join(" || ")
    }
    fn sql_date_to_string(&self, sql_date_exp: &str) -> String;

    fn sql_like(&self, op: LikeOp, left: &str, pattern: &str) -> String {
        format!("{} {} {}", left, op.sql(), self.sql_literal_string(pattern))
    }

    // Group-set machinery for multi-level aggregation in one scan.
    fn sql_group_set_table(&self, group_set_count: u32) -> String;
    fn sql_any_value(&self, group_set: u32, field_name: &str) -> String;
    fn sql_aggregate_turtle(
        &self,
        group_set: u32,
        fields: &[DialectField],
        order_by: &str,
        limit: Option<u64>,
    ) -> String;
    fn sql_any_value_turtle(&self, group_set: u32, fields: &[DialectField]) -> String;
    fn sql_any_value_last_turtle(&self, name: &str, group_set: u32, sql_name: &str) -> String;
    fn sql_coalesce_measures_inline(&self, group_set: u32, fields: &[DialectField]) -> String;

    // Joins and unnesting.
    fn sql_unnest_alias(
        &self,
        source: &str,
        alias: &str,
        fields: &[DialectField],
        need_distinct_key: bool,
        is_array: bool,
        is_in_nested_pipeline: bool,
    ) -> String;
    fn sql_select_alias_as_struct(&self, alias: &str, fields: &[DialectField]) -> String;
    fn sql_field_reference(
        &self,
        parent_alias: &str,
        parent_type: FieldReferenceType,
        child_name: &str,
        child_type: &str,
    ) -> String;
    fn sql_make_unnest_key(&self, parent_key_sql: &str, row_id_sql: &str) -> String {
        if parent_key_sql.is_empty() {
            self.cast_to_string(row_id_sql)
        } else {
            self.concat(&[
                parent_key_sql.to_string(),
                "'x'".to_string(),
                self.cast_to_string(row_id_sql),
            ])
        }
    }

    // Symmetric-safe aggregation.
    fn sql_generate_uuid(&self) -> String;
    fn sql_sum_distinct_hashed_key(&self, sql_distinct_key: &str) -> String;
    /// Native SUM/AVG-over-distinct-key, for dialects that have one.
    fn sql_sum_distinct(&self, key: &str, value: &str, func: &str) -> Result<String>;
    /// Names the packed values will be visible under inside
    /// [`Dialect::sql_agg_distinct`]'s body.
    fn agg_distinct_val_names(&self, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("a.val{i}")).collect()
    }
    fn sql_agg_distinct(&self, key: &str, values: &[String], body_sql: &str) -> Result<String>;
    fn sql_string_agg_distinct(
        &self,
        distinct_key: &str,
        value_sql: &str,
        separator_sql: &str,
    ) -> Result<String>;

    // Pipelines and stages.
    fn sql_unnest_pipeline_head(
        &self,
        is_singleton: bool,
        source_sql: &str,
        fields: &[DialectField],
    ) -> String;
    fn sql_create_function(&self, id: &str, func_text: &str) -> String;
    fn sql_create_function_combine_last_stage(
        &self,
        last_stage_name: &str,
        fields: &[DialectField],
        order_by: Option<&str>,
    ) -> String;
    fn sql_create_table_as_select(&self, table_name: &str, sql: &str) -> Result<String>;
    fn sql_final_stage(&self, _last_stage_name: &str, _fields: &[String]) -> Result<String> {
        Err(DialectError::NotSupported {
            dialect: self.name().to_string(),
            feature: "a final stage".to_string(),
        })
    }
    fn sql_sample_table(&self, table_sql: &str, sample: Option<&Sampling>) -> Result<String> {
        match sample {
            None => Ok(table_sql.to_string()),
            Some(_) => Err(DialectError::NotSupported {
                dialect: self.name().to_string(),
                feature: "sampling".to_string(),
            }),
        }
    }
    fn sql_order_by(&self, terms: &[String], request: OrderByRequest) -> String {
        let _ = request;
        format!("ORDER BY {}", terms.join(","))
    }

    // Time.
    fn sql_now(&self) -> String;
    fn sql_trunc(
        &self,
        qi: &QueryInfo,
        sql: &str,
        temporal_type: TemporalType,
        units: TimestampUnit,
    ) -> String;
    fn sql_alter_time(
        &self,
        op: DeltaOp,
        base_sql: &str,
        temporal_type: TemporalType,
        delta_sql: &str,
        units: TimestampUnit,
    ) -> String;
    fn sql_extract(&self, qi: &QueryInfo, sql: &str, units: ExtractUnit) -> String;
    fn sql_cast(&self, qi: &QueryInfo, expr_sql: &str, dst_type: &CastType, safe: bool) -> String;
    fn sql_literal_time(
        &self,
        qi: &QueryInfo,
        literal: &str,
        temporal_type: TemporalType,
        timezone: Option<&str>,
    ) -> String;

    /// First refusal on a whole node. The children in `kids` are already
    /// compiled. Returning `None` hands the node to the core dispatch table.
    fn expr_to_sql(&self, qi: &QueryInfo, expr: &Expr, kids: &CompiledKids) -> Option<String> {
        self.translate_time_node(qi, expr, kids)
    }

    /// Default translation of the nodes only a dialect can render.
    fn translate_time_node(
        &self,
        qi: &QueryInfo,
        expr: &Expr,
        kids: &CompiledKids,
    ) -> Option<String> {
        match expr {
            Expr::Now => Some(self.sql_now()),
            Expr::TimeLiteral {
                literal,
                temporal_type,
                timezone,
            } => Some(self.sql_literal_time(qi, literal, *temporal_type, timezone.as_deref())),
            Expr::Trunc {
                temporal_type,
                units,
                ..
            } => Some(self.sql_trunc(qi, kids.e.as_ref()?, *temporal_type, *units)),
            Expr::Extract { units, .. } => Some(self.sql_extract(qi, kids.e.as_ref()?, *units)),
            Expr::Delta {
                op,
                temporal_type,
                units,
                ..
            } => Some(self.sql_alter_time(
                *op,
                kids.left.as_ref()?,
                *temporal_type,
                kids.right.as_ref()?,
                *units,
            )),
            Expr::Cast { dst_type, safe, .. } => {
                Some(self.sql_cast(qi, kids.e.as_ref()?, dst_type, *safe))
            }
            Expr::Binary {
                op: model::expr::BinaryOp::Divide,
                ..
            } if self.division_is_integer() => Some(format!(
                "{}*1.0/{}",
                kids.left.as_ref()?,
                kids.right.as_ref()?
            )),
            _ => None,
        }
    }
}

/// Look up a registered dialect by its model name.
pub fn dialect_for_name(name: &str) -> Result<&'static dyn Dialect> {
    static STANDARD_SQL: StandardSql = StandardSql;
    static DUCKDB: DuckDb = DuckDb;
    static POSTGRES: Postgres = Postgres;
    static MYSQL: MySql = MySql;
    match name {
        "standardsql" => Ok(&STANDARD_SQL),
        "duckdb" => Ok(&DUCKDB),
        "postgres" => Ok(&POSTGRES),
        "mysql" => Ok(&MYSQL),
        other => Err(DialectError::UnknownDialect(other.to_string())),
    }
}

pub(crate) fn indent(sql: &str) -> String {
    sql.lines()
        .map(|line| format!("  {line}\n"))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_registry() {
        assert_eq!(dialect_for_name("duckdb").unwrap().name(), "duckdb");
        assert_eq!(dialect_for_name("postgres").unwrap().name(), "postgres");
        assert!(matches!(
            dialect_for_name("oracle"),
            Err(DialectError::UnknownDialect(_))
        ));
    }

    #[test]
    fn test_default_like_quotes_pattern() {
        let d = dialect_for_name("duckdb").unwrap();
        assert_eq!(
            d.sql_like(LikeOp::Like, "base.name", "O'Hare%"),
            "base.name LIKE 'O''Hare%'"
        );
    }

    #[test]
    fn test_time_node_translation_uses_compiled_kids() {
        let d = dialect_for_name("postgres").unwrap();
        let qi = QueryInfo::default();
        let expr = Expr::Trunc {
            e: Box::new(Expr::field(&["dep_time"])),
            temporal_type: TemporalType::Timestamp,
            units: TimestampUnit::Month,
        };
        let sql = d
            .expr_to_sql(&qi, &expr, &CompiledKids::single("base.dep_time".into()))
            .unwrap();
        assert_eq!(sql, "DATE_TRUNC('month',base.dep_time)");
    }
}
