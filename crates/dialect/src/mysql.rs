//! MySQL.
//!
//! No FULL JOIN, so any query whose join graph wants one fails hard. Nested
//! results are built out of JSON_OBJECT/GROUP_CONCAT, and arrays come back in
//! through JSON_TABLE.

use crate::{
    Dialect, DialectField, FieldReferenceType, OrderByRequest, QueryInfo, Result,
};
use model::expr::{CastType, DeltaOp, ExtractUnit, TemporalType, TimestampUnit};
use model::pipeline::Sampling;

#[derive(Debug, Clone)]
pub struct MySql;

impl MySql {
    fn cast_type_name(&self, t: &CastType) -> String {
        match t {
            CastType::String => "CHAR".to_string(),
            CastType::Number => "DOUBLE".to_string(),
            CastType::Boolean => "UNSIGNED".to_string(),
            CastType::Date => "DATE".to_string(),
            CastType::Timestamp => "DATETIME".to_string(),
            CastType::SqlNative(raw) => raw.clone(),
        }
    }

    fn json_column_type(type_name: &str) -> &'static str {
        match type_name {
            "number" => "DOUBLE",
            "boolean" => "BOOLEAN",
            "date" => "DATE",
            "timestamp" => "DATETIME",
            _ => "VARCHAR(255)",
        }
    }
}

impl Dialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn supports_full_join(&self) -> bool {
        false
    }

    fn supports_agg_distinct(&self) -> bool {
        true
    }

    fn supports_sum_distinct_function(&self) -> bool {
        true
    }

    fn supports_unnest_array_agg(&self) -> bool {
        true
    }

    fn supports_cte_in_correlated_subqueries(&self) -> bool {
        true
    }

    fn division_is_integer(&self) -> bool {
        true
    }

    fn default_number_type(&self) -> &'static str {
        "DOUBLE"
    }

    fn udf_prefix(&self) -> &'static str {
        "__udf"
    }

    fn quote_table_path(&self, table_path: &str) -> String {
        table_path
            .split('.')
            .map(|part| self.sql_maybe_quote_identifier(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn sql_maybe_quote_identifier(&self, identifier: &str) -> String {
        format!("`{}`", identifier.replace('`', "``"))
    }

    fn cast_to_string(&self, expression: &str) -> String {
        format!("CAST({expression} AS CHAR)")
    }

    fn concat(&self, values: &[String]) -> String {
        format!("CONCAT({})", values.join(", "))
    }

    fn sql_date_to_string(&self, sql_date_exp: &str) -> String {
        format!("DATE_FORMAT({sql_date_exp}, '%Y-%m-%d')")
    }

    fn sql_group_set_table(&self, group_set_count: u32) -> String {
        format!(
            "CROSS JOIN (select number - 1 as group_set from JSON_TABLE(cast(concat(\"[1\", repeat(\",1\", {group_set_count}), \"]\") as JSON),\"$[*]\" COLUMNS(number FOR ORDINALITY)) group_set) as group_set"
        )
    }

    fn sql_any_value(&self, _group_set: u32, field_name: &str) -> String {
        format!("MAX({field_name})")
    }

    fn sql_aggregate_turtle(
        &self,
        group_set: u32,
        fields: &[DialectField],
        order_by: &str,
        _limit: Option<u64>,
    ) -> String {
        let pairs = fields
            .iter()
            .map(|f| format!("\"{}\", {}", f.raw_name, f.sql_expression))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CAST(CONCAT('[', COALESCE(GROUP_CONCAT(IF(group_set={group_set}, JSON_OBJECT({pairs}), NULL) {order_by} SEPARATOR ','), ''), ']') AS JSON)"
        )
    }

    fn sql_any_value_turtle(&self, group_set: u32, fields: &[DialectField]) -> String {
        let pairs = fields
            .iter()
            .map(|f| format!("\"{}\", {}", f.raw_name, f.sql_expression))
            .collect::<Vec<_>>()
            .join(", ");
        format!("MAX(IF(group_set={group_set}, JSON_OBJECT({pairs}), NULL))")
    }

    fn sql_any_value_last_turtle(&self, name: &str, group_set: u32, sql_name: &str) -> String {
        format!("MAX(IF(group_set={group_set}, {name}, NULL)) as {sql_name}")
    }

    fn sql_coalesce_measures_inline(&self, group_set: u32, fields: &[DialectField]) -> String {
        let pairs = fields
            .iter()
            .map(|f| format!("\"{}\", {}", f.raw_name, f.sql_expression))
            .collect::<Vec<_>>()
            .join(", ");
        format!("MAX(IF(group_set={group_set}, JSON_OBJECT({pairs}), NULL))")
    }

    fn sql_unnest_alias(
        &self,
        source: &str,
        alias: &str,
        fields: &[DialectField],
        need_distinct_key: bool,
        _is_array: bool,
        _is_in_nested_pipeline: bool,
    ) -> String {
        let mut columns: Vec<String> = fields
            .iter()
            .map(|f| {
                format!(
                    "{} {} PATH \"$.{}\"",
                    self.sql_maybe_quote_identifier(&f.sql_output_name),
                    MySql::json_column_type(&f.type_name),
                    f.raw_name
                )
            })
            .collect();
        if need_distinct_key {
            columns.push("__row_id FOR ORDINALITY".to_string());
        }
        format!(
            "LEFT JOIN JSON_TABLE({source}, \"$[*]\" COLUMNS ({})) as {alias} ON 1=1",
            columns.join(",\n")
        )
    }

    fn sql_select_alias_as_struct(&self, alias: &str, fields: &[DialectField]) -> String {
        let pairs = fields
            .iter()
            .map(|f| format!("\"{}\", {}.{}", f.raw_name, alias, f.sql_output_name))
            .collect::<Vec<_>>()
            .join(", ");
        format!("JSON_OBJECT({pairs})")
    }

    fn sql_field_reference(
        &self,
        parent_alias: &str,
        parent_type: FieldReferenceType,
        child_name: &str,
        child_type: &str,
    ) -> String {
        if parent_type == FieldReferenceType::Table {
            return format!("{parent_alias}.{}", self.sql_maybe_quote_identifier(child_name));
        }
        let text = format!(
            "JSON_UNQUOTE(JSON_EXTRACT({parent_alias}, '$.{child_name}'))"
        );
        match child_type {
            "number" => format!("CAST({text} AS DOUBLE)"),
            "boolean" => format!("CAST({text} AS UNSIGNED)"),
            "date" => format!("CAST({text} AS DATE)"),
            "timestamp" => format!("CAST({text} AS DATETIME)"),
            _ => text,
        }
    }

    fn sql_generate_uuid(&self) -> String {
        "CONCAT(ROW_NUMBER() OVER(), UUID())".to_string()
    }

    fn sql_sum_distinct_hashed_key(&self, _sql_distinct_key: &str) -> String {
        // native sum-distinct function, never consulted
        String::new()
    }

    fn sql_sum_distinct(&self, key: &str, value: &str, func: &str) -> Result<String> {
        let key = format!("CONCAT({key}, '')");
        let upper = format!(
            "CAST(CONV(SUBSTRING(MD5({key}), 1, 16), 16, 10) AS DECIMAL(55, 10)) * 4294967296"
        );
        let lower = format!(
            "CAST(CONV(SUBSTRING(MD5({key}), 16, 8), 16, 10) AS DECIMAL(55, 10))"
        );
        let hash_key = format!("({upper} + {lower})");
        let v = format!("CAST(COALESCE({value},0) as DECIMAL(55, 10))");
        let sql_sum = format!("(SUM(DISTINCT {hash_key} + {v}) - SUM(DISTINCT {hash_key}))");
        match func {
            "AVG" => Ok(format!(
                "({sql_sum})/NULLIF(COUNT(DISTINCT CASE WHEN {value} IS NOT NULL THEN {key} END),0)"
            )),
            _ => Ok(sql_sum),
        }
    }

    fn agg_distinct_val_names(&self, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| format!("JSON_UNQUOTE(JSON_EXTRACT(a.packed, '$.val{i}'))"))
            .collect()
    }

    fn sql_agg_distinct(&self, key: &str, values: &[String], body_sql: &str) -> Result<String> {
        let pairs = values
            .iter()
            .enumerate()
            .map(|(i, v)| format!("\"val{i}\", {v}"))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!(
            "(\n  SELECT {body_sql} as value\n  FROM JSON_TABLE(\n    CAST(CONCAT('[', GROUP_CONCAT(DISTINCT JSON_OBJECT(\"key\", {key}, {pairs})), ']') AS JSON),\n    \"$[*]\" COLUMNS (packed JSON PATH \"$\")\n  ) a\n)"
        ))
    }

    fn sql_string_agg_distinct(
        &self,
        _distinct_key: &str,
        value_sql: &str,
        separator_sql: &str,
    ) -> Result<String> {
        let sep = if separator_sql.is_empty() {
            "','".to_string()
        } else {
            separator_sql.to_string()
        };
        Ok(format!(
            "GROUP_CONCAT(DISTINCT {value_sql} SEPARATOR {sep})"
        ))
    }

    fn sql_unnest_pipeline_head(
        &self,
        is_singleton: bool,
        source_sql: &str,
        fields: &[DialectField],
    ) -> String {
        let source = if is_singleton {
            format!("JSON_ARRAY({source_sql})")
        } else {
            source_sql.to_string()
        };
        let columns = fields
            .iter()
            .map(|f| {
                format!(
                    "{} {} PATH \"$.{}\"",
                    self.sql_maybe_quote_identifier(&f.sql_output_name),
                    MySql::json_column_type(&f.type_name),
                    f.raw_name
                )
            })
            .collect::<Vec<_>>()
            .join(",\n");
        format!("JSON_TABLE({source}, \"$[*]\" COLUMNS ({columns}))")
    }

    fn sql_create_function(&self, id: &str, func_text: &str) -> String {
        format!("CREATE FUNCTION {id}(__param JSON) RETURNS JSON\nRETURN (\n{func_text}\n);\n")
    }

    fn sql_create_function_combine_last_stage(
        &self,
        last_stage_name: &str,
        fields: &[DialectField],
        _order_by: Option<&str>,
    ) -> String {
        let pairs = fields
            .iter()
            .map(|f| format!("\"{}\", {}", f.raw_name, f.sql_output_name))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT JSON_ARRAYAGG(JSON_OBJECT({pairs})) FROM {last_stage_name}\n"
        )
    }

    fn sql_create_table_as_select(&self, _table_name: &str, _sql: &str) -> Result<String> {
        Err(crate::DialectError::NotSupported {
            dialect: self.name().to_string(),
            feature: "persisted derived tables".to_string(),
        })
    }

    fn sql_order_by(&self, terms: &[String], _request: OrderByRequest) -> String {
        format!("ORDER BY {}", terms.join(","))
    }

    fn sql_now(&self) -> String {
        "CURRENT_TIMESTAMP()".to_string()
    }

    fn sql_trunc(
        &self,
        _qi: &QueryInfo,
        sql: &str,
        _temporal_type: TemporalType,
        units: TimestampUnit,
    ) -> String {
        match units {
            TimestampUnit::Second => format!("STR_TO_DATE(DATE_FORMAT({sql}, '%Y-%m-%d %H:%i:%s'), '%Y-%m-%d %H:%i:%s')"),
            TimestampUnit::Minute => format!("STR_TO_DATE(DATE_FORMAT({sql}, '%Y-%m-%d %H:%i:00'), '%Y-%m-%d %H:%i:%s')"),
            TimestampUnit::Hour => format!("STR_TO_DATE(DATE_FORMAT({sql}, '%Y-%m-%d %H:00:00'), '%Y-%m-%d %H:%i:%s')"),
            TimestampUnit::Day => format!("DATE({sql})"),
            TimestampUnit::Week => {
                format!("DATE(DATE_SUB({sql}, INTERVAL DAYOFWEEK({sql})-1 DAY))")
            }
            TimestampUnit::Month => {
                format!("STR_TO_DATE(DATE_FORMAT({sql}, '%Y-%m-01'), '%Y-%m-%d')")
            }
            TimestampUnit::Quarter => format!(
                "MAKEDATE(YEAR({sql}), 1) + INTERVAL (QUARTER({sql})-1)*3 MONTH"
            ),
            TimestampUnit::Year => {
                format!("STR_TO_DATE(DATE_FORMAT({sql}, '%Y-01-01'), '%Y-%m-%d')")
            }
        }
    }

    fn sql_alter_time(
        &self,
        op: DeltaOp,
        base_sql: &str,
        _temporal_type: TemporalType,
        delta_sql: &str,
        units: TimestampUnit,
    ) -> String {
        let func = match op {
            DeltaOp::Plus => "DATE_ADD",
            DeltaOp::Minus => "DATE_SUB",
        };
        format!("{func}({base_sql}, INTERVAL {delta_sql} {})", units.sql())
    }

    fn sql_extract(&self, _qi: &QueryInfo, sql: &str, units: ExtractUnit) -> String {
        match units {
            ExtractUnit::DayOfWeek => format!("DAYOFWEEK({sql})"),
            ExtractUnit::DayOfYear => format!("DAYOFYEAR({sql})"),
            other => {
                let unit = match other {
                    ExtractUnit::Second => "SECOND",
                    ExtractUnit::Minute => "MINUTE",
                    ExtractUnit::Hour => "HOUR",
                    ExtractUnit::Day => "DAY",
                    ExtractUnit::Week => "WEEK",
                    ExtractUnit::Month => "MONTH",
                    ExtractUnit::Quarter => "QUARTER",
                    ExtractUnit::Year => "YEAR",
                    _ => unreachable!(),
                };
                format!("EXTRACT({unit} FROM {sql})")
            }
        }
    }

    fn sql_cast(&self, _qi: &QueryInfo, expr_sql: &str, dst_type: &CastType, _safe: bool) -> String {
        format!("CAST({expr_sql} AS {})", self.cast_type_name(dst_type))
    }

    fn sql_literal_time(
        &self,
        _qi: &QueryInfo,
        literal: &str,
        temporal_type: TemporalType,
        timezone: Option<&str>,
    ) -> String {
        match temporal_type {
            TemporalType::Date => format!("DATE('{literal}')"),
            TemporalType::Timestamp => match timezone {
                Some(tz) => format!("CONVERT_TZ('{literal}', @@session.time_zone, '{tz}')"),
                None => format!("TIMESTAMP('{literal}')"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_full_join() {
        assert!(!MySql.supports_full_join());
    }

    #[test]
    fn test_identifier_quoting_doubles_backticks() {
        assert_eq!(MySql.sql_maybe_quote_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_concat_is_a_function_call() {
        assert_eq!(
            MySql.concat(&["a".to_string(), "' to '".to_string(), "b".to_string()]),
            "CONCAT(a, ' to ', b)"
        );
    }
}
