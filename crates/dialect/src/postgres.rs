//! PostgreSQL.
//!
//! Nested results ride through JSONB; the final stage turns each row into a
//! single JSON document because drivers cannot read anonymous records.

use crate::{indent, Dialect, DialectField, FieldReferenceType, QueryInfo, Result};
use model::expr::{CastType, DeltaOp, ExtractUnit, TemporalType, TimestampUnit};
use model::pipeline::Sampling;

#[derive(Debug, Clone)]
pub struct Postgres;

impl Postgres {
    fn cast_type_name(&self, t: &CastType) -> String {
        match t {
            CastType::String => "VARCHAR".to_string(),
            CastType::Number => "DOUBLE PRECISION".to_string(),
            CastType::Boolean => "BOOLEAN".to_string(),
            CastType::Date => "DATE".to_string(),
            CastType::Timestamp => "TIMESTAMP".to_string(),
            CastType::SqlNative(raw) => raw.clone(),
        }
    }
}

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
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

    fn has_final_stage(&self) -> bool {
        true
    }

    fn division_is_integer(&self) -> bool {
        true
    }

    fn supports_complex_filtered_sources(&self) -> bool {
        false
    }

    fn default_number_type(&self) -> &'static str {
        "DOUBLE PRECISION"
    }

    fn udf_prefix(&self) -> &'static str {
        "pg_temp.__udf"
    }

    fn default_sampling(&self) -> Option<Sampling> {
        Some(Sampling::Rows(50000))
    }

    fn quote_table_path(&self, table_path: &str) -> String {
        table_path.to_string()
    }

    fn sql_maybe_quote_identifier(&self, identifier: &str) -> String {
        format!("\"{identifier}\"")
    }

    fn cast_to_string(&self, expression: &str) -> String {
        format!("CAST({expression} as VARCHAR)")
    }

    fn sql_date_to_string(&self, sql_date_exp: &str) -> String {
        format!("CAST(DATE({sql_date_exp}) AS VARCHAR)")
    }

    fn sql_group_set_table(&self, group_set_count: u32) -> String {
        format!("CROSS JOIN GENERATE_SERIES(0,{group_set_count},1) as group_set")
    }

    fn sql_any_value(&self, _group_set: u32, field_name: &str) -> String {
        format!("MAX({field_name})")
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
        let agg = format!(
            "COALESCE(TO_JSONB((ARRAY_AGG((SELECT TO_JSONB(__x) FROM (SELECT {fields}\n  ) as __x) {order_by} ) FILTER (WHERE group_set={group_set}))),'[]'::JSONB)"
        );
        match limit {
            Some(n) => format!("jsonb_path_query_array({agg}, '$[0 to {}]')", n - 1),
            None => agg,
        }
    }

    fn sql_any_value_turtle(&self, group_set: u32, fields: &[DialectField]) -> String {
        let pairs = fields
            .iter()
            .map(|f| {
                format!(
                    "'{}', {}",
                    f.raw_name.replace('\'', "''"),
                    f.sql_expression
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "MAX(CASE WHEN group_set={group_set} THEN JSONB_BUILD_OBJECT({pairs}) END)"
        )
    }

    fn sql_any_value_last_turtle(&self, name: &str, group_set: u32, sql_name: &str) -> String {
        format!("MAX(CASE WHEN group_set={group_set} THEN {name} END) as {sql_name}")
    }

    fn sql_coalesce_measures_inline(&self, group_set: u32, fields: &[DialectField]) -> String {
        let pairs = fields
            .iter()
            .map(|f| {
                format!(
                    "'{}', {}",
                    f.raw_name.replace('\'', "''"),
                    f.sql_expression
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "MAX(CASE WHEN group_set={group_set} THEN JSONB_BUILD_OBJECT({pairs}) END)"
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
                    "LEFT JOIN UNNEST(ARRAY((SELECT jsonb_build_object('__row_id', row_number() over (), 'value', v) FROM JSONB_ARRAY_ELEMENTS(TO_JSONB({source})) as v))) as {alias} ON true"
                )
            } else {
                format!(
                    "LEFT JOIN UNNEST(ARRAY((SELECT jsonb_build_object('value', v) FROM JSONB_ARRAY_ELEMENTS(TO_JSONB({source})) as v))) as {alias} ON true"
                )
            }
        } else if need_distinct_key {
            format!(
                "LEFT JOIN UNNEST(ARRAY((SELECT jsonb_set(v, '{{__row_id}}', to_jsonb(row_number() over ())) FROM JSONB_ARRAY_ELEMENTS(TO_JSONB({source})) as v))) as {alias} ON true"
            )
        } else {
            format!(
                "LEFT JOIN JSONB_ARRAY_ELEMENTS(TO_JSONB({source})) as {alias} ON true"
            )
        }
    }

    fn sql_select_alias_as_struct(&self, alias: &str, _fields: &[DialectField]) -> String {
        format!("ROW({alias})")
    }

    fn sql_field_reference(
        &self,
        parent_alias: &str,
        parent_type: FieldReferenceType,
        child_name: &str,
        child_type: &str,
    ) -> String {
        if child_name == "__row_id" {
            return format!("({parent_alias}->>'__row_id')");
        }
        if parent_type == FieldReferenceType::Table {
            return format!("{parent_alias}.{}", self.sql_maybe_quote_identifier(child_name));
        }
        let text = format!("JSONB_EXTRACT_PATH_TEXT({parent_alias},'{child_name}')");
        match child_type {
            "string" | "json" | "sql native" => text,
            "number" => format!("{text}::double precision"),
            "boolean" => format!("{text}::boolean"),
            "date" => format!("{text}::date"),
            "timestamp" => format!("{text}::timestamp"),
            _ => text,
        }
    }

    fn sql_generate_uuid(&self) -> String {
        "GEN_RANDOM_UUID()".to_string()
    }

    fn sql_sum_distinct_hashed_key(&self, sql_distinct_key: &str) -> String {
        format!(
            "('x' || MD5({sql_distinct_key}::varchar))::bit(64)::bigint::DECIMAL(65,0)  *18446744073709551616 + ('x' || SUBSTR(MD5({sql_distinct_key}::varchar),17))::bit(64)::bigint::DECIMAL(65,0)"
        )
    }

    fn sql_sum_distinct(&self, key: &str, value: &str, func: &str) -> Result<String> {
        let hash_key = self.sql_sum_distinct_hashed_key(key);
        // NUMERIC has arbitrary precision, a plain ROUND after CAST is exact
        let v = format!("ROUND(CAST(COALESCE({value}, 0) AS NUMERIC), 9)");
        let sql_sum = format!("(SUM(DISTINCT ({hash_key}) + {v}) - SUM(DISTINCT ({hash_key})))");
        match func {
            "AVG" => Ok(format!(
                "({sql_sum})/NULLIF(COUNT(DISTINCT CASE WHEN {value} IS NOT NULL THEN {key} END),0)"
            )),
            _ => Ok(sql_sum),
        }
    }

    fn agg_distinct_val_names(&self, count: usize) -> Vec<String> {
        // row_to_json names row members f1, f2, ...; f1 is the key
        (0..count).map(|i| format!("(a::json->>'f{}')", i + 2)).collect()
    }

    fn sql_agg_distinct(&self, key: &str, values: &[String], body_sql: &str) -> Result<String> {
        Ok(format!(
            "(\n  SELECT {body_sql} as value\n  FROM (\n    SELECT UNNEST(array_agg(distinct row_to_json(row({key},{}))::text)) a\n  ) a\n)",
            values.join(",")
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
        Ok(format!("STRING_AGG(DISTINCT {value_sql}, {sep})"))
    }

    fn sql_unnest_pipeline_head(
        &self,
        is_singleton: bool,
        source_sql: &str,
        _fields: &[DialectField],
    ) -> String {
        if is_singleton {
            format!("UNNEST(ARRAY((SELECT {source_sql})))")
        } else {
            format!("JSONB_ARRAY_ELEMENTS({source_sql})")
        }
    }

    fn sql_create_function(&self, id: &str, func_text: &str) -> String {
        format!(
            "CREATE FUNCTION {id}(JSONB) RETURNS JSONB AS $$\n{}\n$$ LANGUAGE SQL;\n",
            indent(func_text)
        )
    }

    fn sql_create_function_combine_last_stage(
        &self,
        last_stage_name: &str,
        _fields: &[DialectField],
        _order_by: Option<&str>,
    ) -> String {
        format!("SELECT JSONB_AGG({last_stage_name}) FROM {last_stage_name}\n")
    }

    fn sql_create_table_as_select(&self, _table_name: &str, _sql: &str) -> Result<String> {
        Err(crate::DialectError::NotSupported {
            dialect: self.name().to_string(),
            feature: "persisted derived tables".to_string(),
        })
    }

    fn sql_final_stage(&self, last_stage_name: &str, _fields: &[String]) -> Result<String> {
        Ok(format!(
            "SELECT row_to_json(finalStage) as row FROM {last_stage_name} AS finalStage"
        ))
    }

    fn sql_sample_table(&self, table_sql: &str, sample: Option<&Sampling>) -> Result<String> {
        let sample = match sample {
            Some(Sampling::Enable(true)) => self.default_sampling(),
            Some(s) => Some(*s),
            None => None,
        };
        Ok(match sample {
            Some(Sampling::Rows(rows)) => {
                format!("(SELECT * FROM {table_sql} TABLESAMPLE SYSTEM_ROWS({rows}))")
            }
            Some(Sampling::Percent(p)) => {
                format!("(SELECT * FROM {table_sql} TABLESAMPLE SYSTEM ({p}))")
            }
            _ => table_sql.to_string(),
        })
    }

    fn sql_now(&self) -> String {
        "LOCALTIMESTAMP".to_string()
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
            "({base_sql}){}({delta_sql})*interval '1 {}'",
            op.sql(),
            units.sql().to_lowercase()
        )
    }

    fn sql_extract(&self, _qi: &QueryInfo, sql: &str, units: ExtractUnit) -> String {
        match units {
            ExtractUnit::DayOfWeek => format!("EXTRACT(dow FROM {sql})+1"),
            ExtractUnit::DayOfYear => format!("EXTRACT(doy FROM {sql})"),
            other => {
                let unit = match other {
                    ExtractUnit::Second => "second",
                    ExtractUnit::Minute => "minute",
                    ExtractUnit::Hour => "hour",
                    ExtractUnit::Day => "day",
                    ExtractUnit::Week => "week",
                    ExtractUnit::Month => "month",
                    ExtractUnit::Quarter => "quarter",
                    ExtractUnit::Year => "year",
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
            TemporalType::Date => format!("DATE '{literal}'"),
            TemporalType::Timestamp => match timezone {
                Some(tz) => format!("TIMESTAMP '{literal}' AT TIME ZONE '{tz}'"),
                None => format!("TIMESTAMP '{literal}'"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_set_table_uses_generate_series() {
        let d = Postgres;
        assert_eq!(
            d.sql_group_set_table(2),
            "CROSS JOIN GENERATE_SERIES(0,2,1) as group_set"
        );
    }

    #[test]
    fn test_json_field_reference_casts_by_type() {
        let d = Postgres;
        assert_eq!(
            d.sql_field_reference("aircraft_0", FieldReferenceType::Record, "seats", "number"),
            "JSONB_EXTRACT_PATH_TEXT(aircraft_0,'seats')::double precision"
        );
    }

    #[test]
    fn test_final_stage_wraps_rows_in_json() {
        let d = Postgres;
        assert_eq!(
            d.sql_final_stage("__stage2", &[]).unwrap(),
            "SELECT row_to_json(finalStage) as row FROM __stage2 AS finalStage"
        );
    }

    #[test]
    fn test_agg_distinct_packs_row_to_json() {
        let d = Postgres;
        let names = d.agg_distinct_val_names(2);
        assert_eq!(names, vec!["(a::json->>'f2')", "(a::json->>'f3')"]);
        let sql = d
            .sql_agg_distinct("base.__distinct_key", &["v1".into(), "v2".into()], "SUM(x)")
            .unwrap();
        assert!(sql.contains("row_to_json(row(base.__distinct_key,v1,v2))"));
    }
}
