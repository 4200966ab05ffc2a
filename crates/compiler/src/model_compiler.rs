//! The top-level compilation entry point.
//!
//! A [`QueryModel`] holds the named sources of one semantic model (with
//! query-defined sources resolved to their output shapes) and compiles
//! [`Query`] requests into SQL text. Compilation is a pure function of its
//! inputs: the model holds no per-query state, and the only cache is the
//! append-only search-index SQL memo owned by each model instance.

use crate::error::{internal, CompileError, Result};
use crate::query::QueryQuery;
use crate::stage::StageWriter;
use async_trait::async_trait;
use dialect::{dialect_for_name, Dialect};
use model::pipeline::{
    IndexFieldDef, IndexSegment, ModelDef, PipeSegment, Query, StructRef, TurtleDef,
};
use model::schema::{FieldKind, StructDef, StructKind};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::debug;

/// The result of compiling one query: a sequence of named CTE stages plus
/// optional persisted-table preambles, with the final SELECT targeting the
/// last stage.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub last_stage_name: String,
    pub output_struct: StructDef,
    pub connection_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunSqlOptions {
    pub row_limit: Option<usize>,
}

/// The execution boundary. Only the search-index helper calls this; the
/// compiler itself never leaves process.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn run_sql(&self, sql: &str, options: &RunSqlOptions) -> Result<Vec<serde_json::Value>>;
    async fn manifest_temporary_table(&self, sql: &str) -> Result<String>;
    fn can_persist(&self) -> bool;
}

/// One row of a search index result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchIndexResult {
    #[serde(rename = "fieldName")]
    pub field_name: String,
    #[serde(rename = "fieldPath", default)]
    pub field_path: Option<String>,
    #[serde(rename = "fieldValue")]
    pub field_value: Option<String>,
    #[serde(rename = "fieldType")]
    pub field_type: String,
    pub weight: i64,
}

pub struct QueryModel {
    structs: HashMap<String, StructDef>,
    /// explore name -> compiled index SQL; entries are immutable once set.
    search_sql_memo: RefCell<HashMap<String, String>>,
}

impl QueryModel {
    pub fn new(model_def: ModelDef) -> Result<QueryModel> {
        let mut model = QueryModel {
            structs: HashMap::new(),
            search_sql_memo: RefCell::new(HashMap::new()),
        };
        for def in model_def.contents {
            model.structs.insert(def.name.clone(), def);
        }
        // query-defined sources get their output fields folded in up front
        let names: Vec<String> = model.structs.keys().cloned().collect();
        for name in names {
            let def = model.structs.get(&name).expect("known name").clone();
            let resolved = model.resolve_query_sources(def)?;
            model.structs.insert(name, resolved);
        }
        Ok(model)
    }

    pub fn get_struct_by_name(&self, name: &str) -> Result<&StructDef> {
        self.structs
            .get(name)
            .ok_or_else(|| CompileError::SourceNotFound(name.to_string()))
    }

    fn resolve_query_sources(&self, mut def: StructDef) -> Result<StructDef> {
        if let StructKind::QuerySource { query } = &def.kind {
            let mut writer = StageWriter::new(true);
            let (_, result_struct) = self.load_query_into(query, &mut writer)?;
            for field in result_struct.fields {
                if !def
                    .fields
                    .iter()
                    .any(|f| f.identifier() == field.identifier())
                {
                    def.fields.push(field);
                }
            }
            if def.primary_key.is_none() {
                def.primary_key = result_struct.primary_key;
            }
        }
        for field in &mut def.fields {
            if let FieldKind::Join(struct_def) = &mut field.kind {
                *struct_def = self.resolve_query_sources(struct_def.clone())?;
            }
        }
        Ok(def)
    }

    fn struct_from_ref(&self, struct_ref: &StructRef) -> Result<StructDef> {
        match struct_ref {
            StructRef::Named(name) => self.get_struct_by_name(name).cloned(),
            StructRef::Inline(def) => self.resolve_query_sources((**def).clone()),
        }
    }

    /// Compile a query into an existing stage writer, returning the last
    /// stage name and the output shape.
    pub(crate) fn load_query_into(
        &self,
        query: &Query,
        writer: &mut StageWriter,
    ) -> Result<(String, StructDef)> {
        let source = self.struct_from_ref(&query.struct_ref)?;

        let mut pipeline = query.pipeline.clone();
        if let Some(head) = &query.pipe_head {
            let turtle = source
                .fields
                .iter()
                .find_map(|f| match (&f.kind, f.identifier()) {
                    (FieldKind::Turtle(t), name) if name == head => Some(t.clone()),
                    _ => None,
                })
                .ok_or_else(|| CompileError::FieldNotFound {
                    name: head.clone(),
                    context: format!(" in {}", source.name),
                })?;
            let mut combined = turtle.pipeline;
            combined.extend(pipeline);
            pipeline = combined;
        }

        let mut turtle = TurtleDef::new("ignoreme", pipeline);
        if !query.filter_list.is_empty() {
            match turtle.pipeline.first_mut() {
                Some(PipeSegment::Reduce(seg)) | Some(PipeSegment::Project(seg)) => {
                    let mut filters = query.filter_list.clone();
                    filters.extend(seg.filter_list.drain(..));
                    seg.filter_list = filters;
                }
                Some(PipeSegment::Index(seg)) => {
                    let mut filters = query.filter_list.clone();
                    filters.extend(seg.filter_list.drain(..));
                    seg.filter_list = filters;
                }
                _ => {}
            }
        }

        let mut q = QueryQuery::make_query(
            self,
            &turtle,
            source,
            &query.source_arguments,
            false,
        )?;
        q.generate_sql_from_pipeline(writer)
    }

    pub fn compile_query(&self, query: &Query) -> Result<CompiledQuery> {
        self.compile_query_with_final_stage(query, true)
    }

    fn compile_query_with_final_stage(
        &self,
        query: &Query,
        finalize: bool,
    ) -> Result<CompiledQuery> {
        let mut writer = StageWriter::new(true);
        let (mut last_stage_name, output_struct) = self.load_query_into(query, &mut writer)?;
        let dialect = dialect_for_name(&output_struct.dialect)?;
        if finalize && dialect.has_final_stage() {
            let field_names: Vec<String> = output_struct
                .fields
                .iter()
                .filter(|f| !matches!(f.kind, FieldKind::Turtle(_)))
                .map(|f| dialect.sql_maybe_quote_identifier(f.identifier()))
                .collect();
            last_stage_name =
                writer.add_stage(&dialect.sql_final_stage(&last_stage_name, &field_names)?);
        }
        let sql = writer.generate_sql_stages()?;
        debug!(
            last_stage = %last_stage_name,
            connection = %output_struct.connection,
            "compiled query"
        );
        Ok(CompiledQuery {
            sql,
            last_stage_name,
            connection_name: output_struct.connection.clone(),
            output_struct,
        })
    }

    /// Build (or reuse) the search index for a source, persist it through the
    /// connection, and search it.
    pub async fn search_index(
        &self,
        connection: &dyn Connection,
        explore: &str,
        search_value: &str,
        limit: Option<u64>,
        search_field: Option<&str>,
    ) -> Result<Option<Vec<SearchIndexResult>>> {
        if !connection.can_persist() {
            return Ok(None);
        }
        let struct_def = self.get_struct_by_name(explore)?;
        let dialect = dialect_for_name(&struct_def.dialect)?;

        let modelled_index = struct_def.fields.iter().any(|f| {
            matches!(f.kind, FieldKind::Turtle(_)) && f.identifier() == "search_index"
        });
        let index_query = if modelled_index {
            Query {
                struct_ref: StructRef::Named(explore.to_string()),
                pipe_head: Some("search_index".to_string()),
                pipeline: Vec::new(),
                filter_list: Vec::new(),
                source_arguments: HashMap::new(),
                materialize: false,
            }
        } else {
            // index every atomic field the source exposes
            let index_fields: Vec<IndexFieldDef> = struct_def
                .fields
                .iter()
                .filter(|f| matches!(f.kind, FieldKind::Atomic(_)))
                .map(|f| IndexFieldDef {
                    path: vec![f.identifier().to_string()],
                })
                .collect();
            Query {
                struct_ref: StructRef::Named(explore.to_string()),
                pipe_head: None,
                pipeline: vec![PipeSegment::Index(IndexSegment {
                    index_fields,
                    weight_measure: None,
                    sample: dialect.default_sampling(),
                    filter_list: Vec::new(),
                    limit: None,
                })],
                filter_list: Vec::new(),
                source_arguments: HashMap::new(),
                materialize: false,
            }
        };

        let field_name_column = dialect.sql_maybe_quote_identifier("fieldName");
        let field_value_column = dialect.sql_maybe_quote_identifier("fieldValue");
        let field_type_column = dialect.sql_maybe_quote_identifier("fieldType");

        let index_sql = {
            let memo = self.search_sql_memo.borrow();
            memo.get(explore).cloned()
        };
        let index_sql = match index_sql {
            Some(sql) => sql,
            None => {
                let sql = self
                    .compile_query_with_final_stage(&index_query, false)?
                    .sql;
                self.search_sql_memo
                    .borrow_mut()
                    .insert(explore.to_string(), sql.clone());
                sql
            }
        };

        let index_table = connection.manifest_temporary_table(&index_sql).await?;
        let starts_with = dialect.sql_literal_string(&format!("{search_value}%"));
        let contains = dialect.sql_literal_string(&format!("%{search_value}%"));
        let field_filter = match search_field {
            Some(field) => format!(
                " AND {field_name_column} = {} \n",
                dialect.sql_literal_string(field)
            ),
            None => String::new(),
        };
        let mut query = format!(
            "SELECT\n  {field_name_column},\n  {field_value_column},\n  {field_type_column},\n  weight,\n  CASE WHEN lower({field_value_column}) LIKE lower({starts_with}) THEN 1 ELSE 0 END as match_first\nFROM {index_table}\nWHERE lower({field_value_column}) LIKE lower({contains}){field_filter}\nORDER BY CASE WHEN lower({field_value_column}) LIKE lower({starts_with}) THEN 1 ELSE 0 END DESC, weight DESC\nLIMIT {}\n",
            limit.unwrap_or(1000)
        );
        if dialect.has_final_stage() {
            query = format!(
                "WITH __stage0 AS(\n{query}\n)\n{}",
                dialect.sql_final_stage(
                    "__stage0",
                    &[
                        field_name_column,
                        field_value_column,
                        field_type_column,
                        "weight".to_string(),
                        "match_first".to_string(),
                    ],
                )?
            );
        }
        let rows = connection
            .run_sql(&query, &RunSqlOptions {
                row_limit: Some(1000),
            })
            .await?;
        let mut results = Vec::new();
        for row in rows {
            results.push(
                serde_json::from_value::<SearchIndexResult>(row)
                    .map_err(|e| internal(format!("bad search index row: {e}")))?,
            );
        }
        Ok(Some(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::expr::{AggregateFunction, Expr};
    use model::pipeline::{QueryFieldDef, QuerySegment};
    use model::schema::FieldDef;

    fn simple_model() -> ModelDef {
        let mut flights = StructDef::table("flights", "airlines.flights", "duckdb", "duckdb");
        flights.fields.push(FieldDef::string("carrier"));
        flights.fields.push(FieldDef::string("origin"));
        flights.fields.push(FieldDef::measure(
            "flight_count",
            Expr::Aggregate {
                function: AggregateFunction::Count,
                e: Box::new(Expr::Empty),
                struct_path: None,
            },
        ));
        ModelDef {
            contents: vec![flights],
        }
    }

    fn reduce(fields: &[&[&str]]) -> PipeSegment {
        PipeSegment::Reduce(QuerySegment {
            query_fields: fields.iter().map(|p| QueryFieldDef::path(p)).collect(),
            ..QuerySegment::default()
        })
    }

    #[test]
    fn test_compile_is_idempotent() {
        let model = QueryModel::new(simple_model()).unwrap();
        let query = Query::against(
            "flights",
            vec![reduce(&[&["carrier"], &["flight_count"]])],
        );
        let first = model.compile_query(&query).unwrap();
        let second = model.compile_query(&query).unwrap();
        assert_eq!(first.sql, second.sql);
        assert_eq!(first.last_stage_name, second.last_stage_name);
    }

    #[test]
    fn test_unknown_source_fails() {
        let model = QueryModel::new(simple_model()).unwrap();
        let query = Query::against("airports", vec![reduce(&[&["code"]])]);
        assert!(matches!(
            model.compile_query(&query),
            Err(CompileError::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_field_names_missing_segment() {
        let model = QueryModel::new(simple_model()).unwrap();
        let query = Query::against("flights", vec![reduce(&[&["color"]])]);
        match model.compile_query(&query) {
            Err(CompileError::FieldNotFound { name, .. }) => assert_eq!(name, "color"),
            other => panic!("expected field-not-found, got {other:?}"),
        }
    }
}
