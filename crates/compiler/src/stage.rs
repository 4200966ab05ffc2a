//! Accumulates the CTE stages (and persisted-table preambles) of one
//! compilation and stitches them into the final SQL text.

use crate::error::{internal, Result};
use dialect::{Dialect, DialectField};

#[derive(Debug)]
pub struct StageWriter {
    pub withs: Vec<String>,
    pub pdts: Vec<String>,
    /// When false (correlated subqueries on dialects that cannot nest CTEs)
    /// each stage is folded inline instead of named.
    pub use_cte: bool,
    stage_prefix: &'static str,
}

impl StageWriter {
    pub fn new(use_cte: bool) -> StageWriter {
        StageWriter {
            withs: Vec::new(),
            pdts: Vec::new(),
            use_cte,
            stage_prefix: "__stage",
        }
    }

    fn stage_name(&self, id: usize) -> String {
        format!("{}{id}", self.stage_prefix)
    }

    /// Record a stage and return the name by which later stages reference it.
    pub fn add_stage(&mut self, sql: &str) -> String {
        if self.use_cte {
            self.withs.push(sql.to_string());
            let name = self.stage_name(self.withs.len() - 1);
            tracing::debug!(stage = %name, "added stage");
            name
        } else {
            if self.withs.is_empty() {
                self.withs.push(sql.to_string());
            } else {
                self.withs[0] = sql.to_string();
            }
            crate::sql::indent(&format!("\n({sql})\n"))
        }
    }

    /// Persist a derived table and return the table reference to select from.
    pub fn add_materialized_query(&mut self, base_name: &str, dialect: &dyn Dialect, sql: &str) -> Result<String> {
        let table_name = format!("scratch.{base_name}{:x}", md5::compute(sql));
        self.pdts.push(dialect.sql_create_table_as_select(&table_name, sql)?);
        Ok(table_name)
    }

    /// All stages except (optionally) the last, as a WITH clause.
    pub fn combine_stages(&self, include_last_stage: bool) -> (String, Option<String>) {
        if !self.use_cte {
            let only = self.withs.first().cloned().unwrap_or_default();
            return (only.clone(), Some(only));
        }
        let mut last_stage_name = self.stage_name(0);
        let mut prefix = "WITH ".to_string();
        let mut w = String::new();
        let end = if include_last_stage {
            self.withs.len()
        } else {
            self.withs.len().saturating_sub(1)
        };
        for (i, sql) in self.withs.iter().take(end).enumerate() {
            last_stage_name = self.stage_name(i);
            w.push_str(&format!(
                "{prefix}{last_stage_name} AS (\n{})\n",
                crate::sql::indent(sql)
            ));
            prefix = ", ".to_string();
        }
        (w, Some(last_stage_name))
    }

    /// The full SQL: persisted-table preambles, then the WITH chain, then the
    /// last stage as the final SELECT.
    pub fn generate_sql_stages(&self) -> Result<String> {
        let last_stage = self
            .withs
            .last()
            .ok_or_else(|| internal("no SQL generated"))?;
        let pdts = self.pdts.join("\n");
        let (sql, _) = self.combine_stages(false);
        Ok(format!("{pdts}{sql}{last_stage}"))
    }

    /// Wrap this writer's stages as a correlated scalar subquery building an
    /// array of the last stage's rows.
    pub fn generate_correlated_subquery(
        &self,
        dialect: &dyn Dialect,
        fields: &[DialectField],
        order_by: Option<&str>,
    ) -> Result<String> {
        if !self.use_cte {
            let only = self.withs.first().ok_or_else(|| internal("no SQL generated"))?;
            Ok(dialect.sql_create_function_combine_last_stage(
                &format!("({only})"),
                fields,
                order_by,
            ))
        } else {
            let (sql, last_stage_name) = self.combine_stages(true);
            let last = last_stage_name.ok_or_else(|| internal("no stage to combine"))?;
            Ok(format!(
                "{sql}{}",
                dialect.sql_create_function_combine_last_stage(&last, fields, order_by)
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_are_sequential() {
        let mut w = StageWriter::new(true);
        assert_eq!(w.add_stage("SELECT 1"), "__stage0");
        assert_eq!(w.add_stage("SELECT * FROM __stage0"), "__stage1");
        let sql = w.generate_sql_stages().unwrap();
        assert_eq!(
            sql,
            "WITH __stage0 AS (\n  SELECT 1\n)\nSELECT * FROM __stage0"
        );
    }

    #[test]
    fn test_inline_mode_folds_stages() {
        let mut w = StageWriter::new(false);
        let ref0 = w.add_stage("SELECT 1");
        assert!(ref0.contains("(SELECT 1)"));
        assert_eq!(w.withs.len(), 1);
    }

    #[test]
    fn test_no_stages_is_an_error() {
        let w = StageWriter::new(true);
        assert!(w.generate_sql_stages().is_err());
    }
}
