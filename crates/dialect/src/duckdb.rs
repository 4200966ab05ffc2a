//! DuckDB.

use crate::{
    indent, Dialect, DialectField, FieldReferenceType, OrderByRequest, QueryInfo, Result,
};
use model::expr::{CastType, DeltaOp, ExtractUnit, TemporalType, TimestampUnit};
use model::pipeline::Sampling;

#[derive(Debug, Clone)]
pub struct DuckDb;

impl DuckDb {
    fn cast_type_name(&self, t: &CastType) -> String {
        match t {
            CastType::String => "VARCHAR".to_string(),
            CastType::Number => "DOUBLE".to_string(),
            CastType::Boolean => "BOOLEAN".to_string(),
            CastType::Date => "DATE".to_string(),
            CastType::Timestamp => "TIMESTAMP".to_string(),
            CastType::SqlNative(raw) => raw.clone(),
        }
    }
}

impl Dialect for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
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

    fn dont_union_index(&self) -> bool {
        true
    }

    fn default_number_type(&self) -> &'static str {
        "DOUBLE"
    }

    fn udf_prefix(&self) -> &'static str {
        "__udf"
    }

    fn default_sampling(&self) -> Option<Sampling> {
        Some(Sampling::Rows(50000))
    }

    fn quote_table_path(&self, table_path: &str) -> String {
        if table_path.contains(['/', '*', ':', ';', '-']) {
            format!("'{table_path}'")
        } else {
            table_path.to_string()
        }
    }

    fn sql_maybe_quote_identifier(&self, identifier: &str) -> String {
        format!("\"{identifier}\"")
    }

    fn cast_to_string(&self, expression: &str) -> String {
        format!("({expression})::varchar")
    }

    fn sql_date_to_string(&self, sql_date_exp: &str) -> String {
        format!("({sql_date_exp})::date::varchar")
    }

    fn sql_literal_number(&self, literal: &str) -> String {
        // fractional literals come back as exact decimals unless cast
        if literal.contains('.') {
            format!("{literal}::DOUBLE")
        } else {
            literal.to_string()
        }
    }

    fn sql_group_set_table(&self, group_set_count: u32) -> String {
        format!(
            "CROSS JOIN (SELECT UNNEST(GENERATE_SERIES(0,{group_set_count},1)) as group_set  ) as group_set"
        )
    }

    fn sql_any_value(&self, _group_set: u32, field_name: &str) -> String {
        format!("FIRST({field_name}) FILTER (WHERE {field_name} IS NOT NULL)")
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
            .map(|f| format!("\n  {}: {}", f.sql_output_name, f.sql_expression))
            .collect::<Vec<_>>()
            .join(", ");
        let list = format!(
            "COALESCE(LIST({{{fields}}} {order_by}) FILTER (WHERE group_set={group_set}),[])"
        );
        match limit {
            Some(n) => format!("{list}[1:{n}]"),
            None => list,
        }
    }

    fn sql_any_value_turtle(&self, group_set: u32, fields: &[DialectField]) -> String {
        let fields = fields
            .iter()
            .map(|f| format!("{}:={}", f.sql_output_name, f.sql_expression))
            .collect::<Vec<_>>()
            .join(", ");
        format!("ANY_VALUE(CASE WHEN group_set={group_set} THEN STRUCT_PACK({fields}) END)")
    }

    fn sql_any_value_last_turtle(&self, name: &str, group_set: u32, sql_name: &str) -> String {
        format!("MAX(CASE WHEN group_set={group_set} THEN {name} END) as {sql_name}")
    }

    fn sql_coalesce_measures_inline(&self, group_set: u32, fields: &[DialectField]) -> String {
        let fields_sql = fields
            .iter()
            .map(|f| format!("{}: {} ", f.sql_output_name, f.sql_expression))
            .collect::<Vec<_>>()
            .join(", ");
        let null_fields = fields
            .iter()
            .map(|f| format!("{}: NULL", f.sql_output_name))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "COALESCE(FIRST({{{fields_sql}}}) FILTER(WHERE group_set={group_set}), {{{null_fields}}})"
        )
    }

    fn sql_unnest_alias(
        &self,
        source: &str,
        alias: &str,
        _fields: &[DialectField],
        _need_distinct_key: bool,
        _is_array: bool,
        _is_in_nested_pipeline: bool,
    ) -> String {
        format!(
            "LEFT JOIN LATERAL UNNEST({source}) WITH ORDINALITY as {alias}_outer({alias}, __row_id) ON true"
        )
    }

    fn sql_select_alias_as_struct(&self, alias: &str, fields: &[DialectField]) -> String {
        format!(
            "STRUCT_PACK({})",
            fields
                .iter()
                .map(|f| format!("{}.{}", alias, f.sql_output_name))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    fn sql_field_reference(
        &self,
        parent_alias: &str,
        parent_type: FieldReferenceType,
        child_name: &str,
        _child_type: &str,
    ) -> String {
        if child_name == "__row_id" {
            format!("{parent_alias}_outer.__row_id")
        } else if parent_type == FieldReferenceType::ArrayScalar {
            parent_alias.to_string()
        } else {
            format!("{parent_alias}.{}", self.sql_maybe_quote_identifier(child_name))
        }
    }

    fn sql_generate_uuid(&self) -> String {
        "GEN_RANDOM_UUID()".to_string()
    }

    fn sql_sum_distinct_hashed_key(&self, _sql_distinct_key: &str) -> String {
        // native sum-distinct function, never consulted
        String::new()
    }

    fn sql_sum_distinct(&self, key: &str, value: &str, func: &str) -> Result<String> {
        Ok(format!(
            "(\n  SELECT {func}(a.val) as value\n  FROM (\n    SELECT UNNEST(list(distinct {{key:{key}, val: {value}}})) a\n  )\n)"
        ))
    }

    fn sql_agg_distinct(&self, key: &str, values: &[String], body_sql: &str) -> Result<String> {
        let packed = values
            .iter()
            .enumerate()
            .map(|(i, v)| format!("val{i}: {v}"))
            .collect::<Vec<_>>()
            .join(",");
        Ok(format!(
            "(\n  SELECT {body_sql} as value\n  FROM (\n    SELECT UNNEST(list(distinct {{key:{key}, {packed}}})) a\n  )\n)"
        ))
    }

    fn sql_string_agg_distinct(
        &self,
        distinct_key: &str,
        value_sql: &str,
        separator_sql: &str,
    ) -> Result<String> {
        let sep = if separator_sql.is_empty() {
            "','".to_string()
        } else {
            separator_sql.to_string()
        };
        Ok(format!(
            "STRING_AGG(DISTINCT {value_sql}, {sep}) FILTER (WHERE {distinct_key} IS NOT NULL)"
        ))
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
        format!("(SELECT UNNEST({p}) as base)")
    }

    fn sql_create_function(&self, id: &str, func_text: &str) -> String {
        format!(
            "DROP MACRO IF EXISTS {id};\nCREATE MACRO {id}(_param) AS (\n{});\n",
            indent(func_text)
        )
    }

    fn sql_create_function_combine_last_stage(
        &self,
        last_stage_name: &str,
        fields: &[DialectField],
        order_by: Option<&str>,
    ) -> String {
        let packed = fields
            .iter()
            .map(|f| self.sql_maybe_quote_identifier(&f.sql_output_name))
            .collect::<Vec<_>>()
            .join(",");
        let o = order_by.map(|o| format!(" {o}")).unwrap_or_default();
        format!("SELECT LIST(STRUCT_PACK({packed}){o}) FROM {last_stage_name}\n")
    }

    fn sql_create_table_as_select(&self, table_name: &str, sql: &str) -> Result<String> {
        Ok(format!("CREATE TABLE IF NOT EXISTS {table_name} AS (\n{sql}\n);\n"))
    }

    fn sql_order_by(&self, terms: &[String], _request: OrderByRequest) -> String {
        format!(
            "ORDER BY {}",
            terms
                .iter()
                .map(|t| format!("{t} NULLS LAST"))
                .collect::<Vec<_>>()
                .join(",")
        )
    }

    fn sql_sample_table(&self, table_sql: &str, sample: Option<&Sampling>) -> Result<String> {
        let sample = match sample {
            Some(Sampling::Enable(true)) => self.default_sampling(),
            Some(s) => Some(*s),
            None => None,
        };
        Ok(match sample {
            Some(Sampling::Rows(rows)) => {
                format!("(SELECT * FROM {table_sql} USING SAMPLE {rows})")
            }
            Some(Sampling::Percent(p)) => {
                format!("(SELECT * FROM {table_sql} USING SAMPLE {p} PERCENT (bernoulli))")
            }
            _ => table_sql.to_string(),
        })
    }

    fn sql_now(&self) -> String {
        "CURRENT_TIMESTAMP".to_string()
    }

    fn sql_trunc(
        &self,
        _qi: &QueryInfo,
        sql: &str,
        _temporal_type: TemporalType,
        units: TimestampUnit,
    ) -> String {
        format!("DATE_TRUNC('{}',{sql})", units.sql().to_lowercase())
    }

    fn sql_alter_time(
        &self,
        op: DeltaOp,
        base_sql: &str,
        _temporal_type: TemporalType,
        delta_sql: &str,
        units: TimestampUnit,
    ) -> String {
        format!(
            "({base_sql}){}INTERVAL ({delta_sql}) {}",
            op.sql(),
            units.sql()
        )
    }

    fn sql_extract(&self, _qi: &QueryInfo, sql: &str, units: ExtractUnit) -> String {
        let unit = match units {
            ExtractUnit::DayOfWeek => "dayofweek",
            ExtractUnit::DayOfYear => "dayofyear",
            ExtractUnit::Second => "second",
            ExtractUnit::Minute => "minute",
            ExtractUnit::Hour => "hour",
            ExtractUnit::Day => "day",
            ExtractUnit::Week => "week",
            ExtractUnit::Month => "month",
            ExtractUnit::Quarter => "quarter",
            ExtractUnit::Year => "year",
        };
        format!("EXTRACT({unit} FROM {sql})")
    }

    fn sql_cast(&self, _qi: &QueryInfo, expr_sql: &str, dst_type: &CastType, safe: bool) -> String {
        let func = if safe { "TRY_CAST" } else { "CAST" };
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
                Some(tz) => format!("TIMESTAMPTZ '{literal} {tz}'"),
                None => format!("TIMESTAMP '{literal}'"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_turtle_filters_on_group_set() {
        let d = DuckDb;
        let fields = vec![DialectField {
            type_name: "string".to_string(),
            sql_expression: "\"name__1\"".to_string(),
            sql_output_name: "\"name\"".to_string(),
            raw_name: "name".to_string(),
        }];
        assert_eq!(
            d.sql_aggregate_turtle(1, &fields, "ORDER BY 1", None),
            "COALESCE(LIST({\n  \"name\": \"name__1\"} ORDER BY 1) FILTER (WHERE group_set=1),[])"
        );
    }

    #[test]
    fn test_row_id_addresses_the_ordinality_alias() {
        let d = DuckDb;
        assert_eq!(
            d.sql_field_reference("seats", FieldReferenceType::ArrayScalar, "__row_id", "string"),
            "seats_outer.__row_id"
        );
        assert_eq!(
            d.sql_field_reference("seats", FieldReferenceType::ArrayScalar, "value", "string"),
            "seats"
        );
    }

    #[test]
    fn test_sum_distinct_uses_list_unnest() {
        let d = DuckDb;
        let sql = d.sql_sum_distinct("k.pk", "x.val", "SUM").unwrap();
        assert!(sql.contains("UNNEST(list(distinct {key:k.pk, val: x.val}))"));
    }
}
