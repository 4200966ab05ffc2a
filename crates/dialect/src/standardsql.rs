//! BigQuery-flavored standard SQL.

use crate::{
    indent, Dialect, DialectError, DialectField, FieldReferenceType, LikeOp, OrderByRequest,
    QueryInfo, Result,
};
use model::expr::{CastType, DeltaOp, ExtractUnit, TemporalType, TimestampUnit};
use model::pipeline::Sampling;

#[derive(Debug, Clone)]
pub struct StandardSql;

impl StandardSql {
    fn cast_type_name(&self, t: &CastType) -> String {
        match t {
            CastType::String => "STRING".to_string(),
            CastType::Number => "FLOAT64".to_string(),
            CastType::Boolean => "BOOL".to_string(),
            CastType::Date => "DATE".to_string(),
            CastType::Timestamp => "TIMESTAMP".to_string(),
            CastType::SqlNative(raw) => raw.clone(),
        }
    }
}

impl Dialect for StandardSql {
    fn name(&self) -> &'static str {
        "standardsql"
    }

    fn supports_agg_distinct(&self) -> bool {
        false
    }

    fn supports_sum_distinct_function(&self) -> bool {
        false
    }

    fn supports_unnest_array_agg(&self) -> bool {
        false
    }

    fn supports_cte_in_correlated_subqueries(&self) -> bool {
        false
    }

    fn dont_union_index(&self) -> bool {
        // can't use a sample table more than once in a query
        true
    }

    fn cant_partition_window_functions_on_expressions(&self) -> bool {
        true
    }

    fn supports_select_replace(&self) -> bool {
        true
    }

    fn default_number_type(&self) -> &'static str {
        "FLOAT64"
    }

    fn udf_prefix(&self) -> &'static str {
        "__udf"
    }

    fn default_sampling(&self) -> Option<Sampling> {
        Some(Sampling::Enable(false))
    }

    fn quote_table_path(&self, table_path: &str) -> String {
        format!("`{table_path}`")
    }

    fn sql_maybe_quote_identifier(&self, identifier: &str) -> String {
        format!("`{identifier}`")
    }

    fn cast_to_string(&self, expression: &str) -> String {
        format!("CAST({expression} as STRING)")
    }

    fn sql_date_to_string(&self, sql_date_exp: &str) -> String {
        format!("CAST(DATE({sql_date_exp}) AS STRING)")
    }

    fn sql_group_set_table(&self, group_set_count: u32) -> String {
        format!(
            "CROSS JOIN (SELECT row_number() OVER() -1  group_set FROM UNNEST(GENERATE_ARRAY(0,{group_set_count},1)))"
        )
    }

    fn sql_any_value(&self, group_set: u32, field_name: &str) -> String {
        format!("ANY_VALUE(CASE WHEN group_set={group_set} THEN {field_name} END)")
    }

    fn sql_aggregate_turtle(
        &self,
        group_set: u32,
        fields: &[DialectField],
        order_by: &str,
        limit: Option<u64>,
    ) -> String {
        let fields = fields
            .iter()
            .map(|f| format!("\n  {} as {}", f.sql_expression, f.sql_output_name))
            .collect::<Vec<_>>()
            .join(", ");
        let limit = match limit {
            Some(n) => format!(" LIMIT {n}"),
            None => String::new(),
        };
        format!(
            "ARRAY_AGG(CASE WHEN group_set={group_set} THEN STRUCT({fields}\n  ) END IGNORE NULLS {order_by}{limit})"
        )
    }

    fn sql_any_value_turtle(&self, group_set: u32, fields: &[DialectField]) -> String {
        let fields = fields
            .iter()
            .map(|f| format!("{} as {}", f.sql_expression, f.sql_output_name))
            .collect::<Vec<_>>()
            .join(", ");
        format!("ANY_VALUE(CASE WHEN group_set={group_set} THEN STRUCT({fields}) END)")
    }

    fn sql_any_value_last_turtle(&self, name: &str, group_set: u32, sql_name: &str) -> String {
        format!("ANY_VALUE(CASE WHEN group_set={group_set} THEN {name} END) as {sql_name}")
    }

    fn sql_coalesce_measures_inline(&self, group_set: u32, fields: &[DialectField]) -> String {
        let fields_sql = fields
            .iter()
            .map(|f| format!("{} as {}", f.sql_expression, f.sql_output_name))
            .collect::<Vec<_>>()
            .join(", ");
        let null_fields = fields
            .iter()
            .map(|f| format!("NULL as {}", f.sql_output_name))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "COALESCE(ANY_VALUE(CASE WHEN group_set={group_set} THEN STRUCT({fields_sql}) END), STRUCT({null_fields}))"
        )
    }

    fn sql_unnest_alias(
        &self,
        source: &str,
        alias: &str,
        _fields: &[DialectField],
        need_distinct_key: bool,
        is_array: bool,
        _is_in_nested_pipeline: bool,
    ) -> String {
        if is_array {
            if need_distinct_key {
                format!(
                    "LEFT JOIN UNNEST(ARRAY(( SELECT AS STRUCT row_number() over() as __row_id, value FROM UNNEST({source}) value))) as {alias}"
                )
            } else {
                format!(
                    "LEFT JOIN UNNEST(ARRAY((SELECT AS STRUCT value FROM unnest({source}) value))) as {alias}"
                )
            }
        } else if need_distinct_key {
            format!(
                "LEFT JOIN UNNEST(ARRAY(( SELECT AS STRUCT row_number() over() as __row_id, * FROM UNNEST({source})))) as {alias}"
            )
        } else {
            format!("LEFT JOIN UNNEST({source}) as {alias}")
        }
    }

    fn sql_select_alias_as_struct(&self, alias: &str, _fields: &[DialectField]) -> String {
        format!("(SELECT AS STRUCT {alias}.*)")
    }

    fn sql_field_reference(
        &self,
        parent_alias: &str,
        _parent_type: FieldReferenceType,
        child_name: &str,
        _child_type: &str,
    ) -> String {
        format!("{parent_alias}.{}", self.sql_maybe_quote_identifier(child_name))
    }

    fn sql_generate_uuid(&self) -> String {
        "GENERATE_UUID()".to_string()
    }

    fn sql_sum_distinct_hashed_key(&self, sql_distinct_key: &str) -> String {
        let key = format!("CAST({sql_distinct_key} AS STRING)");
        let upper = format!(
            "cast(cast(concat('0x', substr(to_hex(md5({key})), 1, 15)) as int64) as numeric) * 4294967296"
        );
        let lower = format!(
            "cast(cast(concat('0x', substr(to_hex(md5({key})), 16, 8)) as int64) as numeric)"
        );
        format!("({upper} + {lower}) * 0.000000001")
    }

    fn sql_sum_distinct(&self, _key: &str, _value: &str, _func: &str) -> Result<String> {
        Err(DialectError::NotSupported {
            dialect: self.name().to_string(),
            feature: "a native sum-distinct function".to_string(),
        })
    }

    fn sql_agg_distinct(&self, _key: &str, _values: &[String], _body_sql: &str) -> Result<String> {
        Err(DialectError::NotSupported {
            dialect: self.name().to_string(),
            feature: "aggregating over a fanned-out join".to_string(),
        })
    }

    fn sql_string_agg_distinct(
        &self,
        _distinct_key: &str,
        value_sql: &str,
        separator_sql: &str,
    ) -> Result<String> {
        if separator_sql.is_empty() {
            Ok(format!("STRING_AGG(DISTINCT {value_sql})"))
        } else {
            Ok(format!("STRING_AGG(DISTINCT {value_sql}, {separator_sql})"))
        }
    }

    fn sql_unnest_pipeline_head(
        &self,
        is_singleton: bool,
        source_sql: &str,
        _fields: &[DialectField],
    ) -> String {
        let p = if is_singleton {
            format!("[{source_sql}]")
        } else {
            source_sql.to_string()
        };
        format!("UNNEST({p})")
    }

    fn sql_create_function(&self, id: &str, func_text: &str) -> String {
        format!(
            "CREATE TEMPORARY FUNCTION {id}(__param ANY TYPE) AS ((\n{}));\n",
            indent(func_text)
        )
    }

    fn sql_create_function_combine_last_stage(
        &self,
        last_stage_name: &str,
        _fields: &[DialectField],
        _order_by: Option<&str>,
    ) -> String {
        format!("SELECT ARRAY((SELECT AS STRUCT * FROM {last_stage_name}))\n")
    }

    fn sql_create_table_as_select(&self, table_name: &str, sql: &str) -> Result<String> {
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS `{table_name}`\nOPTIONS (\n    expiration_timestamp=TIMESTAMP_ADD(current_timestamp(),  INTERVAL 1 hour)\n)\nAS (\n{sql}\n);\n"
        ))
    }

    fn sql_order_by(&self, terms: &[String], request: OrderByRequest) -> String {
        match request {
            OrderByRequest::Analytical | OrderByRequest::Turtle => {
                format!("ORDER BY {}", terms.join(","))
            }
            OrderByRequest::Query => format!(
                "ORDER BY {}",
                terms
                    .iter()
                    .map(|t| format!("{t} NULLS LAST"))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }

    fn sql_sample_table(&self, table_sql: &str, sample: Option<&Sampling>) -> Result<String> {
        match sample {
            None | Some(Sampling::Enable(false)) => Ok(table_sql.to_string()),
            Some(Sampling::Rows(_)) | Some(Sampling::Enable(true)) => Ok(format!(
                "(SELECT * FROM {table_sql} TABLESAMPLE SYSTEM (1 PERCENT))"
            )),
            Some(Sampling::Percent(p)) => Ok(format!(
                "(SELECT * FROM {table_sql} TABLESAMPLE SYSTEM ({p} PERCENT))"
            )),
        }
    }

    fn sql_now(&self) -> String {
        "CURRENT_TIMESTAMP()".to_string()
    }

    fn sql_trunc(
        &self,
        _qi: &QueryInfo,
        sql: &str,
        temporal_type: TemporalType,
        units: TimestampUnit,
    ) -> String {
        match temporal_type {
            TemporalType::Timestamp => format!("TIMESTAMP_TRUNC({sql}, {})", units.sql()),
            TemporalType::Date => format!("DATE_TRUNC({sql}, {})", units.sql()),
        }
    }

    fn sql_alter_time(
        &self,
        op: DeltaOp,
        base_sql: &str,
        temporal_type: TemporalType,
        delta_sql: &str,
        units: TimestampUnit,
    ) -> String {
        let func = match (temporal_type, op) {
            (TemporalType::Timestamp, DeltaOp::Plus) => "TIMESTAMP_ADD",
            (TemporalType::Timestamp, DeltaOp::Minus) => "TIMESTAMP_SUB",
            (TemporalType::Date, DeltaOp::Plus) => "DATE_ADD",
            (TemporalType::Date, DeltaOp::Minus) => "DATE_SUB",
        };
        format!("{func}({base_sql}, INTERVAL {delta_sql} {})", units.sql())
    }

    fn sql_extract(&self, _qi: &QueryInfo, sql: &str, units: ExtractUnit) -> String {
        let unit = match units {
            ExtractUnit::DayOfWeek => "DAYOFWEEK",
            ExtractUnit::DayOfYear => "DAYOFYEAR",
            ExtractUnit::Second => "SECOND",
            ExtractUnit::Minute => "MINUTE",
            ExtractUnit::Hour => "HOUR",
            ExtractUnit::Day => "DAY",
            ExtractUnit::Week => "WEEK",
            ExtractUnit::Month => "MONTH",
            ExtractUnit::Quarter => "QUARTER",
            ExtractUnit::Year => "YEAR",
        };
        format!("EXTRACT({unit} FROM {sql})")
    }

    fn sql_cast(&self, _qi: &QueryInfo, expr_sql: &str, dst_type: &CastType, safe: bool) -> String {
        let func = if safe { "SAFE_CAST" } else { "CAST" };
        format!("{func}({expr_sql} AS {})", self.cast_type_name(dst_type))
    }

    fn sql_literal_time(
        &self,
        _qi: &QueryInfo,
        literal: &str,
        temporal_type: TemporalType,
        timezone: Option<&str>,
    ) -> String {
        match temporal_type {
            TemporalType::Date => format!("DATE '{literal}'"),
            TemporalType::Timestamp => match timezone {
                Some(tz) => format!("TIMESTAMP('{literal}', '{tz}')"),
                None => format!("TIMESTAMP '{literal}'"),
            },
        }
    }

    fn sql_like(&self, op: LikeOp, left: &str, pattern: &str) -> String {
        // backslash escapes survive into the literal, doubled for BigQuery
        let escaped = pattern.replace('\\', "\\\\").replace('\'', "''");
        format!("{} {} '{escaped}'", left, op.sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_group_set_table() {
        let d = StandardSql;
        assert_eq!(
            d.sql_group_set_table(3),
            "CROSS JOIN (SELECT row_number() OVER() -1  group_set FROM UNNEST(GENERATE_ARRAY(0,3,1)))"
        );
    }

    #[test]
    fn test_agg_distinct_is_a_hard_error() {
        let d = StandardSql;
        assert!(d.sql_agg_distinct("k", &[], "x").is_err());
        assert!(d.sql_sum_distinct("k", "v", "SUM").is_err());
    }

    #[test]
    fn test_any_value_case_wraps_group_set() {
        let d = StandardSql;
        assert_eq!(
            d.sql_any_value(4, "`total__4`"),
            "ANY_VALUE(CASE WHEN group_set=4 THEN `total__4` END)"
        );
    }
}
