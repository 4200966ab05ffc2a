//! The query compiler: orchestrates one `Query` through field expansion,
//! join discovery, group-set numbering, and SQL stage emission.
//!
//! Simple reduces over a single table compile to one stage. Anything with
//! nesting or ungrouping takes the complex path: a stage-0 scan grouped by a
//! synthetic `group_set` dimension, depth-N folding stages that aggregate
//! children into parents, and a combine stage that assembles nested results.

use crate::error::{internal, CompileError, Result};
use crate::expr::{
    expr_to_sql, instance_expression, instance_get_sql, sql_full_child_reference, Scope,
};
use crate::fields::{is_basic_aggregate, is_basic_calculation, is_basic_scalar, is_scalar_field};
use crate::graph::{FieldRef, NodeField, QueryGraph, StructId, DISTINCT_KEY, ROOT};
use crate::model_compiler::QueryModel;
use crate::result::{
    FieldInstanceField, FieldUsage, RepeatedResultType, ResultId, ResultTree, Slot, ROOT_RESULT,
};
use crate::sql::{case_group, indent, AndChain, GenerateState};
use crate::stage::StageWriter;
use dialect::{Dialect, DialectField, OrderByClauseType, OrderByRequest};
use model::expr::{AggregateFunction, Expr, FilterCondition};
use model::pipeline::{
    IndexFieldDef, IndexSegment, OrderByTarget, PipeSegment, QueryFieldDef, TurtleDef,
};
use model::schema::{
    ElementType, FieldDef, FieldKind, MatrixOperation, Parameter, StructDef, StructKind,
    UniqueKeyRequirement,
};
use std::collections::HashMap;
use tracing::debug;

fn path_to_col(path: &[String]) -> String {
    path.iter()
        .map(|el| {
            el.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || "-_.!~*'()".contains(c) {
                        c.to_string()
                    } else {
                        let mut buf = [0u8; 4];
                        c.encode_utf8(&mut buf)
                            .bytes()
                            .map(|b| format!("%{b:02X}"))
                            .collect()
                    }
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Output context shared by the stage-0 and depth-N field generators.
#[derive(Debug, Default)]
struct StageOutput {
    sql: Vec<String>,
    lateral_join_sql_expressions: Vec<String>,
    dimension_indexes: Vec<usize>,
    field_index: usize,
    /// (from_group, to_group) remappings performed by a folding stage.
    groups_aggregated: Vec<(u32, u32)>,
    /// (sql_field_name, pipeline_sql) for turtles needing a secondary stage.
    output_pipelined_sql: Vec<(String, String)>,
}

impl StageOutput {
    fn stage0() -> StageOutput {
        StageOutput {
            sql: vec!["group_set".to_string()],
            dimension_indexes: vec![1],
            field_index: 2,
            ..StageOutput::default()
        }
    }
}

pub(crate) struct QueryQuery<'m> {
    model: &'m QueryModel,
    turtle: TurtleDef,
    graph: QueryGraph,
    tree: ResultTree,
    prepared: bool,
    max_depth: usize,
    max_group_set: u32,
    result_stage: Option<String>,
    is_joined_subquery: bool,
    /// Index queries: output name to source path.
    index_paths: HashMap<String, Vec<String>>,
}

impl<'m> QueryQuery<'m> {
    pub fn make_query(
        model: &'m QueryModel,
        turtle: &TurtleDef,
        source_def: StructDef,
        source_arguments: &HashMap<String, Parameter>,
        is_joined_subquery: bool,
    ) -> Result<QueryQuery<'m>> {
        let mut source_def = source_def;
        let mut turtle = turtle.clone();
        if turtle.pipeline.is_empty() {
            return Err(internal("query pipeline is empty"));
        }

        // fold the source's own filters into the first stage
        if !source_def.filter_list.is_empty() {
            match turtle.pipeline.first_mut() {
                Some(PipeSegment::Reduce(seg)) | Some(PipeSegment::Project(seg)) => {
                    seg.filter_list.extend(source_def.filter_list.clone());
                }
                Some(PipeSegment::Index(seg)) => {
                    seg.filter_list.extend(source_def.filter_list.clone());
                }
                _ => {}
            }
        }

        // stage-scoped declarations extend the source for this query only
        if let Some(seg) = first_query_segment_mut(&mut turtle)
            && !seg.extend_source.is_empty()
        {
            source_def.fields.extend(seg.extend_source.drain(..));
        }

        let graph = QueryGraph::build(source_def, source_arguments)?;
        let tree = ResultTree::new(turtle.clone());
        Ok(QueryQuery {
            model,
            turtle,
            graph,
            tree,
            prepared: false,
            max_depth: 0,
            max_group_set: 0,
            result_stage: None,
            is_joined_subquery,
            index_paths: HashMap::new(),
        })
    }

    fn scope(&self) -> Scope<'_> {
        Scope {
            graph: &self.graph,
            tree: &self.tree,
        }
    }

    fn dialect(&self) -> &'static dyn Dialect {
        self.graph.dialect()
    }

    fn first_segment(&self) -> &PipeSegment {
        &self.turtle.pipeline[0]
    }

    fn in_nested_pipeline(&self) -> bool {
        matches!(self.graph.node(ROOT).def.kind, StructKind::NestSource { .. })
    }

    // ---------------- prepare ----------------

    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        self.tree.add_struct_to_join(&self.graph, ROOT, None)?;
        if matches!(self.first_segment(), PipeSegment::Index(_)) {
            self.expand_index_fields()?;
        } else {
            self.expand_fields(ROOT_RESULT)?;
        }
        self.discover_dependencies(ROOT_RESULT)?;
        self.tree.calculate_symmetric_aggregates(&self.graph)?;
        self.prepared = true;
        Ok(())
    }

    fn segment_fields(&self, result: ResultId) -> Vec<QueryFieldDef> {
        match self.tree.node(result).first_segment() {
            PipeSegment::Reduce(q) | PipeSegment::Project(q) => q.query_fields.clone(),
            _ => Vec::new(),
        }
    }

    fn expand_fields(&mut self, result: ResultId) -> Result<()> {
        let mut result_index = 1;
        for f in self.segment_fields(result) {
            let (as_name, fref) = self.expand_field(&f)?;
            match fref {
                FieldRef::Turtle { def, .. } => {
                    if self.first_segment().is_project() {
                        return Err(CompileError::NestedViewInProject(def.name.clone()));
                    }
                    let child = self.tree.add_child_result(result, def);
                    self.expand_fields(child)?;
                    self.tree.attach(result, as_name, child);
                }
                FieldRef::Atomic(a) => {
                    if is_basic_aggregate(&a.def) && self.first_segment().is_project() {
                        return Err(CompileError::AggregateInProject(as_name));
                    }
                    if a.def.e.is_some()
                        && a.def.expression_type.is_analytic()
                        && self
                            .dialect()
                            .cant_partition_window_functions_on_expressions()
                        && self.tree.node(result).first_segment().is_reduce()
                    {
                        self.tree.is_complex_query = true;
                        self.tree.query_uses_partitioning = true;
                    }
                    self.tree.add_field(
                        result,
                        &as_name,
                        FieldInstanceField::new(
                            a.owner,
                            a.def,
                            FieldUsage::Result { result_index },
                        ),
                    )?;
                }
                FieldRef::Join { id, .. } => {
                    let def = join_field_def(&self.graph, id);
                    self.tree.add_field(
                        result,
                        &as_name,
                        FieldInstanceField::new(
                            id,
                            def,
                            FieldUsage::Result { result_index },
                        ),
                    )?;
                }
            }
            result_index += 1;
        }
        Ok(())
    }

    fn expand_field(&self, f: &QueryFieldDef) -> Result<(String, FieldRef)> {
        match f {
            QueryFieldDef::FieldRef { path } => {
                let fref = self.graph.field_by_name(ROOT, path)?;
                let as_name = match &fref {
                    FieldRef::Atomic(a) => a.def.identifier().to_string(),
                    FieldRef::Turtle { def, .. } => def.name.clone(),
                    FieldRef::Join { id, .. } => self.graph.node(*id).def.name.clone(),
                };
                Ok((as_name, fref))
            }
            QueryFieldDef::Def(def) => {
                let as_name = def.identifier().to_string();
                match &def.kind {
                    FieldKind::Atomic(_) => Ok((
                        as_name,
                        FieldRef::Atomic(crate::graph::AtomicRef {
                            owner: ROOT,
                            def: (**def).clone(),
                        }),
                    )),
                    FieldKind::Turtle(t) => Ok((
                        as_name,
                        FieldRef::Turtle {
                            owner: ROOT,
                            def: t.clone(),
                        },
                    )),
                    FieldKind::Join(_) => Err(internal(
                        "joined sources must be declared in the source, not a stage",
                    )),
                }
            }
        }
    }

    /// Walk every referenced expression to discover joins, unique-key
    /// requirements, ungroupings, and window usage.
    fn discover_dependencies(&mut self, result: ResultId) -> Result<()> {
        // field instances
        let field_list: Vec<(StructId, FieldDef)> = self
            .tree
            .fields(result)
            .map(|(_, fi)| (fi.owner, fi.def.clone()))
            .collect();
        for (owner, def) in field_list {
            match &def.e {
                Some(e) => self.walk_expr_dependencies(result, owner, e)?,
                None => {
                    if matches!(def.kind, FieldKind::Atomic(_)) {
                        let jp = self.graph.joinable_parent(owner);
                        self.tree.add_struct_to_join(&self.graph, jp, None)?;
                    } else if let FieldKind::Join(_) = def.kind {
                        let jp = self.graph.joinable_parent(owner);
                        self.tree.add_struct_to_join(&self.graph, jp, None)?;
                    }
                }
            }
        }
        // stage filters
        let filters: Vec<FilterCondition> = self
            .tree
            .node(result)
            .first_segment()
            .filter_list()
            .to_vec();
        for cond in filters {
            self.walk_expr_dependencies(result, ROOT, &cond.e)?;
        }
        for child in self.tree.structs(result) {
            self.discover_dependencies(child)?;
        }
        Ok(())
    }

    fn walk_expr_dependencies(
        &mut self,
        result: ResultId,
        context: StructId,
        e: &Expr,
    ) -> Result<()> {
        match e {
            Expr::Field { path } => {
                match self.graph.field_by_name(context, path)? {
                    FieldRef::Atomic(a) => {
                        if let Some(inner) = &a.def.e {
                            self.walk_expr_dependencies(result, a.owner, inner)?;
                        } else {
                            let jp = self.graph.joinable_parent(a.owner);
                            self.tree.add_struct_to_join(&self.graph, jp, None)?;
                        }
                    }
                    FieldRef::Join { id, .. } => {
                        let jp = self.graph.joinable_parent(id);
                        self.tree.add_struct_to_join(&self.graph, jp, None)?;
                    }
                    FieldRef::Turtle { .. } => {}
                }
            }
            Expr::Aggregate {
                function,
                e,
                struct_path,
            } => {
                let target = match struct_path {
                    Some(path) => self.graph.struct_by_path(context, path)?,
                    None => context,
                };
                let jp = self.graph.joinable_parent(target);
                self.tree.add_struct_to_join(
                    &self.graph,
                    jp,
                    Some(UniqueKeyRequirement {
                        is_count: *function == AggregateFunction::Count,
                    }),
                )?;
                self.walk_expr_dependencies(result, context, e)?;
            }
            Expr::FunctionCall(call) => {
                if call.overload.return_expression_type.is_aggregate() {
                    let target = match &call.struct_path {
                        Some(path) => self.graph.struct_by_path(context, path)?,
                        None => context,
                    };
                    let jp = self.graph.joinable_parent(target);
                    self.tree.add_struct_to_join(
                        &self.graph,
                        jp,
                        Some(UniqueKeyRequirement { is_count: false }),
                    )?;
                }
                if call.overload.return_expression_type.is_analytic() {
                    self.tree.query_uses_partitioning = true;
                    if self
                        .dialect()
                        .cant_partition_window_functions_on_expressions()
                        && self.tree.node(ROOT_RESULT).first_segment().is_reduce()
                    {
                        self.tree.is_complex_query = true;
                    }
                }
                for arg in &call.args {
                    self.walk_expr_dependencies(result, context, arg)?;
                }
            }
            Expr::Ungroup { kind, e, fields } => {
                self.tree.is_complex_query = true;
                self.tree.query_uses_partitioning = true;
                if !fields.is_empty() {
                    self.tree.record_ungrouped_set(result, *kind, fields.clone());
                } else {
                    let node = self.tree.node_mut(result);
                    node.result_uses_ungrouped = true;
                }
                self.walk_expr_dependencies(result, context, e)?;
            }
            Expr::Filtered { e, filter_list } => {
                self.walk_expr_dependencies(result, context, e)?;
                for cond in filter_list {
                    self.walk_expr_dependencies(result, context, &cond.e)?;
                }
            }
            other => self.walk_children_dependencies(result, context, other)?,
        }
        Ok(())
    }

    fn walk_children_dependencies(
        &mut self,
        result: ResultId,
        context: StructId,
        e: &Expr,
    ) -> Result<()> {
        match e {
            Expr::Binary { left, right, .. } | Expr::Coalesce { left, right } => {
                self.walk_expr_dependencies(result, context, left)?;
                self.walk_expr_dependencies(result, context, right)?;
            }
            Expr::Delta { base, delta, .. } => {
                self.walk_expr_dependencies(result, context, base)?;
                self.walk_expr_dependencies(result, context, delta)?;
            }
            Expr::Parens { e }
            | Expr::Not { e }
            | Expr::UnaryMinus { e }
            | Expr::IsNull { e }
            | Expr::IsNotNull { e }
            | Expr::Trunc { e, .. }
            | Expr::Extract { e, .. }
            | Expr::Cast { e, .. }
            | Expr::Spread { e } => {
                self.walk_expr_dependencies(result, context, e)?;
            }
            Expr::In { e, one_of, .. } => {
                self.walk_expr_dependencies(result, context, e)?;
                for o in one_of {
                    self.walk_expr_dependencies(result, context, o)?;
                }
            }
            Expr::Case {
                value,
                whens,
                else_value,
            } => {
                if let Some(v) = value {
                    self.walk_expr_dependencies(result, context, v)?;
                }
                for w in whens {
                    self.walk_expr_dependencies(result, context, &w.when)?;
                    self.walk_expr_dependencies(result, context, &w.then)?;
                }
                if let Some(v) = else_value {
                    self.walk_expr_dependencies(result, context, v)?;
                }
            }
            Expr::GenericSql { args, .. } => {
                for a in args {
                    self.walk_expr_dependencies(result, context, a)?;
                }
            }
            Expr::FilterMatch { e, filter, .. } => {
                self.walk_expr_dependencies(result, context, e)?;
                self.walk_expr_dependencies(result, context, filter)?;
            }
            _ => {}
        }
        Ok(())
    }

    // ---------------- shared SQL pieces ----------------

    fn struct_source_sql(&self, sid: StructId, writer: &mut StageWriter) -> Result<String> {
        let def = &self.graph.node(sid).def;
        match &def.kind {
            StructKind::Table { table_path } => Ok(self.dialect().quote_table_path(table_path)),
            StructKind::Composite => Ok("{COMPOSITE SOURCE}".to_string()),
            StructKind::Finalize => Ok(def.name.clone()),
            StructKind::SqlSelect { select_str } => Ok(format!("({select_str})")),
            StructKind::NestSource { pipe_sql } => Ok(pipe_sql.clone()),
            StructKind::QuerySource { query } => {
                if query.materialize {
                    let compiled = self.model.compile_query(query)?;
                    writer.add_materialized_query(&def.name, self.dialect(), &compiled.sql)
                } else {
                    let (last_stage_name, _) = self.model.load_query_into(query, writer)?;
                    Ok(last_stage_name)
                }
            }
            _ => Err(internal(format!(
                "cannot create SQL for struct '{}' used as a source",
                def.name
            ))),
        }
    }

    /// BigQuery pseudo columns are lost by `SELECT *`; pass them through when
    /// synthesizing unique keys so filters still push down.
    fn generate_sql_passthrough_keys(&self, sid: StructId) -> String {
        if self.dialect().name() != "standardsql" {
            return String::new();
        }
        let pseudo = ["_TABLE_SUFFIX", "_PARTITIONDATE", "_PARTITIONTIME"];
        let present: Vec<&str> = pseudo
            .into_iter()
            .filter(|name| self.graph.node(sid).child(name).is_some())
            .collect();
        if present.is_empty() {
            String::new()
        } else {
            format!(", {}", present.join(", "))
        }
    }

    fn with_unique_key(&self, sid: StructId, struct_sql: &str) -> String {
        let pass_keys = self.generate_sql_passthrough_keys(sid);
        format!(
            "(SELECT {} as {}, x.* {pass_keys} FROM {struct_sql} as x)",
            self.dialect().sql_generate_uuid(),
            self.dialect().sql_maybe_quote_identifier(DISTINCT_KEY)
        )
    }

    fn generate_sql_joins(&mut self, writer: &mut StageWriter) -> Result<String> {
        let mut s = String::new();
        if self.tree.joins.is_empty() {
            return Err(internal("queries must start from a base table"));
        }
        let root_sid = self.tree.joins[0].struct_id;
        let root_alias = self.tree.joins[0].alias.clone();
        let root_make_unique = self.tree.joins[0].make_unique_key;
        let mut struct_sql = self.struct_source_sql(root_sid, writer)?;

        if let PipeSegment::Index(seg) = self.first_segment() {
            struct_sql = self
                .dialect()
                .sql_sample_table(&struct_sql, seg.sample.as_ref())?;
            if seg.sample.is_some() {
                struct_sql =
                    writer.add_stage(&format!("SELECT * from {struct_sql} as x limit 100000 "));
            }
        }

        let root_node = self.graph.node(root_sid);
        if root_node.parent.is_none() && root_node.def.kind.is_source() {
            if root_make_unique {
                struct_sql = self.with_unique_key(root_sid, &struct_sql);
            }
            s.push_str(&format!("FROM {struct_sql} as {root_alias}\n"));
        } else {
            return Err(internal("queries must start from a base table"));
        }

        // arrays get unnested before the table joins that may reference them
        let mut children = self.tree.joins[0].children.clone();
        children.sort_by_key(|idx| {
            !matches!(
                self.graph.node(self.tree.joins[*idx].struct_id).def.kind,
                StructKind::Array { .. }
            )
        });
        for child in children {
            s.push_str(&self.generate_sql_join_block(writer, child, 0)?);
        }
        Ok(s)
    }

    fn generate_sql_join_block(
        &mut self,
        writer: &mut StageWriter,
        join_idx: usize,
        depth: usize,
    ) -> Result<String> {
        let mut s = String::new();
        let sid = self.tree.joins[join_idx].struct_id;
        let alias = self.tree.joins[join_idx].alias.clone();
        let make_unique_key = self.tree.joins[join_idx].make_unique_key;
        let children = self.tree.joins[join_idx].children.clone();
        let def = self.graph.node(sid).def.clone();

        if def.kind.is_source() && def.join.is_some() {
            let join_spec = def.join.as_ref().expect("checked join");
            let mut struct_sql = self.struct_source_sql(sid, writer)?;
            let matrix_operation = join_spec.matrix_operation.unwrap_or(MatrixOperation::Left);
            if matrix_operation == MatrixOperation::Full && !self.dialect().supports_full_join() {
                return Err(CompileError::FullJoinNotSupported(
                    self.dialect().name().to_string(),
                ));
            }
            if make_unique_key {
                struct_sql = self.with_unique_key(sid, &struct_sql);
            }
            let parent = self
                .graph
                .node(sid)
                .parent
                .ok_or_else(|| internal("expected joined struct to have a parent"))?;
            let on_condition = match &join_spec.on_expression {
                Some(e) => {
                    let scope = self.scope();
                    expr_to_sql(&scope, ROOT_RESULT, parent, e, &GenerateState::default())?
                }
                None => "1=1".to_string(),
            };

            let conditions: Option<Vec<String>> = if def.filter_list.is_empty() {
                None
            } else {
                let scope = self.scope();
                let mut c = Vec::new();
                for cond in &def.filter_list {
                    c.push(expr_to_sql(
                        &scope,
                        ROOT_RESULT,
                        sid,
                        &cond.e,
                        &GenerateState::default(),
                    )?);
                }
                Some(c)
            };

            if children.is_empty()
                || conditions.is_none()
                || !self.dialect().supports_complex_filtered_sources()
            {
                let filters = match &conditions {
                    Some(c) if !c.is_empty() => format!(" AND ({})", c.join(" AND ")),
                    _ => String::new(),
                };
                s.push_str(&format!(
                    " {} JOIN {struct_sql} AS {alias}\n  ON {on_condition}{filters}\n",
                    matrix_operation.sql()
                ));
            } else {
                // filtered source with children: push the filter into a
                // subquery so child join conditions stay attached
                let mut select = format!("SELECT {alias}.*");
                let mut joins = String::new();
                for child_idx in &children {
                    joins.push_str(&self.generate_sql_join_block(writer, *child_idx, depth + 1)?);
                    let child_join = &self.tree.joins[*child_idx];
                    select.push_str(&format!(
                        ", {} AS {}",
                        self.dialect().sql_select_alias_as_struct(
                            &child_join.alias,
                            &child_join.dialect_field_list(&self.graph)
                        ),
                        child_join.alias
                    ));
                }
                select.push_str(&format!(
                    "\nFROM {struct_sql} AS {alias}\n{joins}\nWHERE {}\n",
                    conditions.as_ref().expect("checked conditions").join(" AND ")
                ));
                s.push_str(&format!(
                    "{} JOIN (\n{}) AS {alias}\n  ON {on_condition}\n",
                    matrix_operation.sql(),
                    indent(&select)
                ));
                return Ok(s);
            }
        } else if let StructKind::Array { element } = &def.kind {
            let parent = self
                .graph
                .node(sid)
                .parent
                .ok_or_else(|| internal("nested structure with no parent"))?;
            let array_expression = match &def.e {
                Some(e) => {
                    let scope = self.scope();
                    expr_to_sql(&scope, ROOT_RESULT, parent, e, &GenerateState::default())?
                }
                None => {
                    let scope = self.scope();
                    sql_full_child_reference(&scope, ROOT_RESULT, parent, &def.name, depth == 0)?
                }
            };
            let field_list = self.tree.joins[join_idx].dialect_field_list(&self.graph);
            s.push_str(&format!(
                "{}\n",
                self.dialect().sql_unnest_alias(
                    &array_expression,
                    &alias,
                    &field_list,
                    make_unique_key,
                    matches!(element, ElementType::Scalar(_)),
                    self.in_nested_pipeline(),
                )
            ));
        } else if matches!(def.kind, StructKind::Record) {
            return Err(internal("records should never appear in join trees"));
        } else {
            return Err(internal(format!(
                "join type not implemented for '{}'",
                def.name
            )));
        }

        for child_idx in children {
            s.push_str(&self.generate_sql_join_block(writer, child_idx, depth + 1)?);
        }
        Ok(s)
    }

    fn generate_sql_filters(&self, result: ResultId, which: FilterWhich) -> Result<AndChain> {
        let mut chain = AndChain::new();
        let scope = self.scope();
        for cond in self.tree.node(result).first_segment().filter_list() {
            let wanted = match which {
                FilterWhich::Where => cond.expression_type.is_scalar(),
                FilterWhich::Having => cond.expression_type.is_calculation(),
            };
            if wanted {
                chain.add(expr_to_sql(
                    &scope,
                    result,
                    ROOT,
                    &cond.e,
                    &GenerateState::default(),
                )?);
            }
        }
        Ok(chain)
    }

    fn generate_sql_order_by(&self, result: ResultId) -> Result<String> {
        let Some(segment) = self.tree.node(result).first_segment().query_segment() else {
            return Ok(String::new());
        };

        if self.first_segment().is_project() && segment.order_by.is_none() {
            return Ok(String::new());
        }
        // intermediate pipeline stages without a limit don't need ordering
        if self.turtle.pipeline.len() > 1 && segment.limit.is_none() {
            return Ok(String::new());
        }
        if self.tree.get_repeated_result_type(result) == RepeatedResultType::InlineAllNumbers {
            return Ok(String::new());
        }
        if self.is_joined_subquery && self.turtle.pipeline.len() == 1 && segment.limit.is_none() {
            return Ok(String::new());
        }

        let order_by = segment
            .order_by
            .clone()
            .unwrap_or_else(|| self.tree.calculate_default_order_by(result));
        let mut terms: Vec<String> = Vec::new();
        let scope = self.scope();
        for ob in &order_by {
            let dir = ob.dir.map(|d| d.sql()).unwrap_or("ASC");
            let (name, fi) = match &ob.field {
                OrderByTarget::Name(name) => {
                    let fi = self
                        .tree
                        .get_field(result, name)
                        .map_err(|_| CompileError::UnknownOrderBy(name.clone()))?;
                    if !fi.usage.is_result() {
                        return Err(CompileError::UnknownOrderBy(name.clone()));
                    }
                    (name.clone(), fi)
                }
                OrderByTarget::Index(i) => {
                    let (name, fi) = self.tree.get_field_by_number(result, *i)?;
                    (name.to_string(), fi)
                }
            };
            match self.dialect().order_by_clause() {
                OrderByClauseType::Ordinal => {
                    let index = match fi.usage {
                        FieldUsage::Result { result_index } => result_index,
                        _ => return Err(CompileError::UnknownOrderBy(name)),
                    };
                    terms.push(format!("{index} {dir}"));
                }
                OrderByClauseType::OutputName => {
                    terms.push(format!(
                        "{} {dir}",
                        self.dialect().sql_maybe_quote_identifier(&name)
                    ));
                }
                OrderByClauseType::Expression => {
                    terms.push(format!("{} {dir}", instance_get_sql(&scope, result, fi)?));
                }
            }
        }
        if terms.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(
            "{}\n",
            self.dialect().sql_order_by(&terms, OrderByRequest::Query)
        ))
    }

    // ---------------- simple path ----------------

    fn generate_simple_sql(&mut self, writer: &mut StageWriter) -> Result<String> {
        let mut s = String::from("SELECT \n");
        let mut field_sql: Vec<String> = Vec::new();
        {
            let scope = self.scope();
            for (name, fi) in self.tree.fields(ROOT_RESULT) {
                if fi.usage.is_result() {
                    let sql_name = self.dialect().sql_maybe_quote_identifier(name);
                    field_sql.push(format!(
                        " {} as {sql_name}",
                        instance_expression(&scope, ROOT_RESULT, fi)?
                    ));
                }
            }
        }
        s.push_str(&indent(&field_sql.join(",\n")));

        s.push_str(&self.generate_sql_joins(writer)?);
        s.push_str(&self.generate_sql_filters(ROOT_RESULT, FilterWhich::Where)?.clause("where"));

        if self.first_segment().is_reduce() {
            let group_indexes: Vec<String> = self
                .tree
                .fields(ROOT_RESULT)
                .filter(|(_, fi)| fi.usage.is_result() && is_scalar_field(&fi.def))
                .filter_map(|(_, fi)| match fi.usage {
                    FieldUsage::Result { result_index } => Some(result_index.to_string()),
                    _ => None,
                })
                .collect();
            if !group_indexes.is_empty() {
                s.push_str(&format!("GROUP BY {}\n", group_indexes.join(",")));
            }
        }

        s.push_str(&self.generate_sql_filters(ROOT_RESULT, FilterWhich::Having)?.clause("having"));
        s.push_str(&self.generate_sql_order_by(ROOT_RESULT)?);
        if let Some(limit) = self.first_segment().limit() {
            s.push_str(&format!("LIMIT {limit}\n"));
        }
        let stage = writer.add_stage(&s);
        self.result_stage = Some(stage.clone());
        Ok(stage)
    }

    // ---------------- complex path ----------------

    fn quoted_stage_name(&self, name: &str, group_set: u32) -> String {
        self.dialect()
            .sql_maybe_quote_identifier(&format!("{name}__{group_set}"))
    }

    fn generate_stage0_fields(
        &mut self,
        result: ResultId,
        output: &mut StageOutput,
        writer: &mut StageWriter,
    ) -> Result<()> {
        // dimensions first, then everything else
        let mut scalar_names: Vec<String> = Vec::new();
        let mut other_names: Vec<String> = Vec::new();
        for (name, slot) in &self.tree.node(result).fields {
            match slot {
                Slot::Field(f) if is_scalar_field(&f.def) => scalar_names.push(name.clone()),
                _ => other_names.push(name.clone()),
            }
        }
        let group_set = self.tree.node(result).group_set;

        for name in scalar_names.into_iter().chain(other_names) {
            let output_name = self.quoted_stage_name(&name, group_set);
            let slot_is_field = self.tree.has_field(result, &name);
            if slot_is_field {
                let (usage, scalar, calculation, number_typed) = {
                    let fi = self.tree.get_field(result, &name)?;
                    (
                        fi.usage.clone(),
                        is_scalar_field(&fi.def),
                        is_basic_calculation(&fi.def),
                        matches!(
                            fi.def.atomic_type(),
                            Some(model::schema::AtomicType::Number { .. })
                        ),
                    )
                };
                if !usage.is_result() {
                    continue;
                }
                let exp = {
                    let scope = self.scope();
                    let fi = self.tree.get_field(result, &name)?;
                    instance_get_sql(&scope, result, fi)?
                };
                if scalar {
                    if self
                        .dialect()
                        .cant_partition_window_functions_on_expressions()
                        && self.tree.query_uses_partitioning
                        && self.tree.node(result).first_segment().is_reduce()
                    {
                        // expressions (and floats) can't be partition keys, so
                        // they ride through a lateral join bag by name
                        let output_field_name = format!("__lateral_join_bag.{output_name}");
                        output
                            .lateral_join_sql_expressions
                            .push(format!("{exp} as {output_name}"));
                        output.sql.push(output_field_name.clone());
                        self.tree.get_field_mut(result, &name)?.analytical_sql =
                            Some(output_field_name);
                        if number_typed {
                            let string_name = self
                                .dialect()
                                .sql_maybe_quote_identifier(&format!("{name}__{group_set}_string"));
                            let string_field_name = format!("__lateral_join_bag.{string_name}");
                            output.sql.push(string_field_name.clone());
                            output.dimension_indexes.push(output.field_index);
                            output.field_index += 1;
                            output.lateral_join_sql_expressions.push(format!(
                                "CAST({exp} as STRING) as {string_name}"
                            ));
                            self.tree.get_field_mut(result, &name)?.partition_sql =
                                Some(string_field_name);
                        }
                    } else {
                        output.sql.push(format!("{exp} as {output_name}"));
                    }
                    output.dimension_indexes.push(output.field_index);
                    output.field_index += 1;
                } else if calculation {
                    output.sql.push(format!("{exp} as {output_name}"));
                    output.field_index += 1;
                }
            } else {
                // a nested result
                let child = self
                    .tree
                    .node(result)
                    .fields
                    .iter()
                    .find_map(|(n, s)| match s {
                        Slot::Query(q) if *n == name => Some(*q),
                        _ => None,
                    })
                    .ok_or_else(|| internal("nested result disappeared"))?;
                if self.tree.node(child).first_segment().is_reduce() {
                    self.generate_stage0_fields(child, output, writer)?;
                } else if self.tree.node(child).first_segment().is_project() {
                    let s = self.generate_turtle_sql(child, writer, &output_name, output)?;
                    output.sql.push(format!("{s} as {output_name}"));
                    output.field_index += 1;
                }
            }
        }

        // leaf havings fold into the root chain; parents of nested results
        // need deletion flags instead
        let having = self.generate_sql_filters(result, FilterWhich::Having)?;
        if !having.empty() {
            let node_group = self.tree.node(result).group_set;
            if self.tree.node(result).child_groups.len() == 1 {
                self.tree.havings.add(format!(
                    "(group_set<>{node_group} OR (group_set={node_group} AND {}))",
                    having.sql()
                ));
            } else {
                self.tree.node_mut(result).has_having = true;
                output.sql.push(format!(
                    "CASE WHEN group_set={node_group} THEN CASE WHEN {} THEN 0 ELSE 1 END END as __delete__{node_group}",
                    having.sql()
                ));
                output.field_index += 1;
            }
        }
        Ok(())
    }

    fn generate_sql_where_children(&self, result: ResultId) -> Result<AndChain> {
        let mut wheres = AndChain::new();
        for child in self.tree.structs(result) {
            let turtle_where = self.generate_sql_filters(child, FilterWhich::Where)?;
            if turtle_where.present() {
                let group_sets = self
                    .tree
                    .node(child)
                    .child_groups
                    .iter()
                    .map(|g| g.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                wheres.add(format!(
                    "(group_set NOT IN ({group_sets}) OR (group_set IN ({group_sets}) AND {}))",
                    turtle_where.sql()
                ));
            }
            wheres.add_chain(self.generate_sql_where_children(child)?);
        }
        Ok(wheres)
    }

    fn generate_sql_where_turtled(&self) -> Result<String> {
        let mut wheres = self.generate_sql_filters(ROOT_RESULT, FilterWhich::Where)?;
        wheres.add_chain(self.generate_sql_where_children(ROOT_RESULT)?);
        Ok(wheres.clause("where"))
    }

    /// Nested havings and limits: compute per-partition deletion flags and
    /// row numbers, then filter flagged rows in follow-up stages.
    fn generate_sql_having_limit(
        &mut self,
        writer: &mut StageWriter,
        last_stage_name: &str,
    ) -> Result<String> {
        let mut last_stage_name = last_stage_name.to_string();
        let with_having_or_limit = self.tree.select_structs(ROOT_RESULT, &|node| {
            node.has_having || node.get_limit().is_some()
        });
        if with_having_or_limit.is_empty() {
            return Ok(last_stage_name);
        }

        let mut partition_sql: HashMap<u32, String> = HashMap::new();
        let mut has_any_limits = false;
        let mut has_results_with_children = false;
        for result in self.tree.select_structs(ROOT_RESULT, &|_| true) {
            let node = self.tree.node(result);
            let has_limit = node.get_limit().is_some();
            has_results_with_children |=
                node.child_groups.len() > 1 && (has_limit || node.has_having);
            has_any_limits |= has_limit;

            let mut dimensions: Vec<String> = Vec::new();
            let mut r = Some(result);
            while let Some(rid) = r {
                for (name, fi) in self.tree.fields(rid) {
                    if is_scalar_field(&fi.def) {
                        dimensions
                            .push(self.quoted_stage_name(name, self.tree.node(rid).group_set));
                    }
                }
                r = self.tree.node(rid).parent;
            }
            let partition = if dimensions.is_empty() {
                String::new()
            } else {
                format!(
                    "PARTITION BY {}",
                    dimensions
                        .iter()
                        .map(|d| self.dialect().cast_to_string(d))
                        .collect::<Vec<_>>()
                        .join(",")
                )
            };
            partition_sql.insert(self.tree.node(result).group_set, partition);
        }

        let mut limit_expressions: Vec<String> = Vec::new();
        let mut limit_simple_filters: Vec<String> = Vec::new();
        let mut limit_complex_clauses: HashMap<u32, String> = HashMap::new();
        for result in &with_having_or_limit {
            let node = self.tree.node(*result);
            let group_set = node.group_set;
            let Some(limit) = node.get_limit() else {
                continue;
            };
            let order_by_def = node
                .first_segment()
                .query_segment()
                .and_then(|q| q.order_by.clone())
                .unwrap_or_else(|| self.tree.calculate_default_order_by(*result));
            let mut ob_sql: Vec<String> = Vec::new();
            for ordering in &order_by_def {
                let name = match &ordering.field {
                    OrderByTarget::Name(name) => name.clone(),
                    OrderByTarget::Index(i) => {
                        self.tree.get_field_by_number(*result, *i)?.0.to_string()
                    }
                };
                let dir = ordering.dir.map(|d| d.sql()).unwrap_or("ASC");
                ob_sql.push(format!(" {} {dir}", self.quoted_stage_name(&name, group_set)));
            }

            let mut p = match node.parent {
                Some(parent) => {
                    let parent_group = self.tree.node(parent).group_set;
                    match partition_sql.get(&parent_group) {
                        Some(sql) if !sql.is_empty() => format!("{sql}, group_set"),
                        _ => "PARTITION BY group_set".to_string(),
                    }
                }
                None => "PARTITION BY group_set".to_string(),
            };
            if node.has_having {
                // don't count rows a having already deleted
                p = format!("{p}, __delete__{group_set}");
            }
            limit_expressions.push(format!(
                "CASE WHEN GROUP_SET={group_set} THEN\n   ROW_NUMBER() OVER ({p} ORDER BY {}) END  as __row_number__{group_set}",
                ob_sql.join(",")
            ));
            let filter_clause = format!(
                "(GROUP_SET = {group_set} AND __row_number__{group_set} > {limit})"
            );
            if node.child_groups.len() == 1 {
                limit_simple_filters.push(filter_clause);
            } else {
                limit_complex_clauses.insert(
                    group_set,
                    format!("CASE WHEN {filter_clause} THEN 1 ELSE 0 END"),
                );
            }
        }

        if !limit_expressions.is_empty() && has_any_limits {
            last_stage_name = writer.add_stage(&format!(
                "SELECT\n  *,\n {} \nFROM {last_stage_name}\n",
                limit_expressions.join(",\n")
            ));
        }
        let simple_limits = if limit_simple_filters.is_empty() {
            "1=1".to_string()
        } else {
            format!(" NOT ({})", limit_simple_filters.join("\n OR "))
        };
        if has_any_limits && !has_results_with_children {
            last_stage_name = writer.add_stage(&format!(
                "SELECT * FROM {last_stage_name}\n WHERE {simple_limits}\n"
            ));
        } else if has_results_with_children {
            let mut having_fields: Vec<String> = Vec::new();
            let mut havings = AndChain::new();
            for result in &with_having_or_limit {
                let node = self.tree.node(*result);
                let group_set = node.group_set;
                let mut test_key: Vec<String> = Vec::new();
                if node.has_having && node.child_groups.len() > 1 {
                    test_key.push(format!("__delete__{group_set}"));
                }
                if let Some(limit_clause) = limit_complex_clauses.get(&group_set) {
                    test_key.push(limit_clause.clone());
                }
                if !test_key.is_empty() && node.child_groups.len() > 1 {
                    let child_groups = node
                        .child_groups
                        .iter()
                        .map(|g| g.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    having_fields.push(format!(
                        "MAX(CASE WHEN group_set IN ({child_groups}) THEN {}\n   END) OVER({}) as __shaving__{group_set}",
                        test_key.join(" + "),
                        partition_sql.get(&group_set).cloned().unwrap_or_default()
                    ));
                    havings.add(format!(
                        "group_set IN ({child_groups}) AND __shaving__{group_set} > 0"
                    ));
                }
            }
            last_stage_name = writer.add_stage(&format!(
                "SELECT\n  *,\n  {} \nFROM {last_stage_name} WHERE {simple_limits}\n",
                having_fields.join(",\n  ")
            ));
            last_stage_name = writer.add_stage(&format!(
                "SELECT *\nFROM {last_stage_name}\nWHERE NOT ({})\n",
                havings.sql_or()
            ));
        }
        Ok(last_stage_name)
    }

    fn generate_pipelined_stages(
        &self,
        output_pipelined: &[(String, String)],
        last_stage_name: String,
        writer: &mut StageWriter,
    ) -> Result<String> {
        if output_pipelined.is_empty() {
            return Ok(last_stage_name);
        }
        let pipelines_sql = output_pipelined
            .iter()
            .map(|(name, sql)| format!("{sql} as {name}"))
            .collect::<Vec<_>>()
            .join(",\n");
        let sql = if self.dialect().supports_select_replace() {
            format!("SELECT * replace ({pipelines_sql}) FROM {last_stage_name}\n")
        } else {
            let replaced: Vec<&String> = output_pipelined.iter().map(|(n, _)| n).collect();
            let kept: Vec<String> = self
                .tree
                .node(ROOT_RESULT)
                .fields
                .iter()
                .map(|(name, _)| self.dialect().sql_maybe_quote_identifier(name))
                .filter(|n| !replaced.contains(&n))
                .collect();
            format!(
                "SELECT {}{pipelines_sql} FROM {last_stage_name}",
                if kept.is_empty() {
                    String::new()
                } else {
                    format!("{}, ", kept.join(", "))
                }
            )
        };
        Ok(writer.add_stage(&sql))
    }

    fn generate_sql_stage0(&mut self, writer: &mut StageWriter) -> Result<String> {
        if self.first_segment().is_project() {
            return Err(internal("PROJECT cannot be used on queries with turtles"));
        }

        let mut s = String::from("SELECT\n");
        let mut from = self.generate_sql_joins(writer)?;
        let wheres = self.generate_sql_where_turtled()?;

        let mut output = StageOutput::stage0();
        self.generate_stage0_fields(ROOT_RESULT, &mut output, writer)?;

        let group_by = format!(
            "GROUP BY {}\n",
            output
                .dimension_indexes
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );

        from.push_str(&format!(
            "{}\n",
            self.dialect().sql_group_set_table(self.max_group_set)
        ));
        if !output.lateral_join_sql_expressions.is_empty() {
            from.push_str(&format!(
                "LEFT JOIN UNNEST([STRUCT({})]) as __lateral_join_bag\n",
                output.lateral_join_sql_expressions.join(",\n")
            ));
        }
        s.push_str(&indent(&output.sql.join(",\n")));
        s.push_str(&from);
        s.push_str(&wheres);
        s.push_str(&group_by);
        s.push_str(&self.tree.havings.clause("having"));

        let result_stage = writer.add_stage(&s);
        let after_having = self.generate_sql_having_limit(writer, &result_stage)?;
        let final_stage =
            self.generate_pipelined_stages(&output.output_pipelined_sql, after_having, writer)?;
        self.result_stage = Some(final_stage.clone());
        Ok(final_stage)
    }

    fn generate_depth_n_fields(
        &mut self,
        depth: usize,
        result: ResultId,
        output: &mut StageOutput,
        writer: &mut StageWriter,
    ) -> Result<()> {
        let group_set = self.tree.node(result).group_set;
        let names: Vec<String> = self
            .tree
            .node(result)
            .fields
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            let sql_field_name = self.quoted_stage_name(&name, group_set);
            if self.tree.has_field(result, &name) {
                let fi = self.tree.get_field(result, &name)?;
                if !fi.usage.is_result() {
                    continue;
                }
                if is_scalar_field(&fi.def) {
                    let node = self.tree.node(result);
                    let groups = if node.group_set > 0 {
                        node.child_groups.clone()
                    } else {
                        Vec::new()
                    };
                    output
                        .sql
                        .push(format!("{} as {sql_field_name}", case_group(&groups, &sql_field_name)));
                    output.dimension_indexes.push(output.field_index);
                    output.field_index += 1;
                } else if is_basic_calculation(&fi.def) {
                    output.sql.push(format!(
                        "{} as {sql_field_name}",
                        self.dialect().sql_any_value(group_set, &sql_field_name)
                    ));
                    output.field_index += 1;
                }
            } else {
                let child = self
                    .tree
                    .node(result)
                    .fields
                    .iter()
                    .find_map(|(n, s)| match s {
                        Slot::Query(q) if *n == name => Some(*q),
                        _ => None,
                    })
                    .ok_or_else(|| internal("nested result disappeared"))?;
                let child_depth = self.tree.node(child).depth;
                if child_depth > depth {
                    // already folded in a deeper stage
                } else if child_depth == depth {
                    let s = self.generate_turtle_sql(child, writer, &sql_field_name, output)?;
                    output
                        .groups_aggregated
                        .push((self.tree.node(child).group_set, group_set));
                    output.sql.push(format!("{s} as {sql_field_name}"));
                    output.field_index += 1;
                } else {
                    self.generate_depth_n_fields(depth, child, output, writer)?;
                }
            }
        }
        if !output.groups_aggregated.is_empty() {
            let mut remap = String::from("CASE ");
            for (from_group, to_group) in &output.groups_aggregated {
                remap.push_str(&format!("WHEN group_set={from_group} THEN {to_group} "));
            }
            remap.push_str("ELSE group_set END as group_set");
            output.sql[0] = remap;
        }
        Ok(())
    }

    fn generate_sql_depth_n(
        &mut self,
        depth: usize,
        writer: &mut StageWriter,
        stage_name: &str,
    ) -> Result<String> {
        let mut s = String::from("SELECT \n");
        let mut output = StageOutput::stage0();
        self.generate_depth_n_fields(depth, ROOT_RESULT, &mut output, writer)?;
        s.push_str(&indent(&output.sql.join(",\n")));
        s.push_str(&format!("FROM {stage_name}\n"));
        let where_sql = self.tree.eliminate_compute_groups_sql();
        if !where_sql.is_empty() {
            s.push_str(&format!("WHERE {where_sql}\n"));
        }
        if !output.dimension_indexes.is_empty() {
            s.push_str(&format!(
                "GROUP BY {}\n",
                output
                    .dimension_indexes
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        }
        let stage = writer.add_stage(&s);
        let stage = self.generate_pipelined_stages(&output.output_pipelined_sql, stage, writer)?;
        self.result_stage = Some(stage.clone());
        Ok(stage)
    }

    fn generate_sql_combine_turtles(
        &mut self,
        writer: &mut StageWriter,
        stage0_name: &str,
    ) -> Result<String> {
        let mut s = String::from("SELECT\n");
        let mut fields_sql: Vec<String> = Vec::new();
        let mut field_index = 1;
        let mut dimension_indexes: Vec<usize> = Vec::new();
        let mut output = StageOutput::default();
        let root_group = self.tree.node(ROOT_RESULT).group_set;
        let names: Vec<String> = self
            .tree
            .node(ROOT_RESULT)
            .fields
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            let sql_name = self.dialect().sql_maybe_quote_identifier(&name);
            if self.tree.has_field(ROOT_RESULT, &name) {
                let fi = self.tree.get_field(ROOT_RESULT, &name)?;
                if !fi.usage.is_result() {
                    continue;
                }
                if is_scalar_field(&fi.def) {
                    fields_sql.push(format!(
                        "{} as {sql_name}",
                        self.quoted_stage_name(&name, root_group)
                    ));
                    dimension_indexes.push(field_index);
                    field_index += 1;
                } else if is_basic_calculation(&fi.def) {
                    fields_sql.push(self.dialect().sql_any_value_last_turtle(
                        &self.quoted_stage_name(&name, root_group),
                        root_group,
                        &sql_name,
                    ));
                    field_index += 1;
                }
            } else {
                let child = self
                    .tree
                    .node(ROOT_RESULT)
                    .fields
                    .iter()
                    .find_map(|(n, slot)| match slot {
                        Slot::Query(q) if *n == name => Some(*q),
                        _ => None,
                    })
                    .ok_or_else(|| internal("nested result disappeared"))?;
                if self.tree.node(child).first_segment().is_reduce() {
                    let turtle =
                        self.generate_turtle_sql(child, writer, &sql_name, &mut output)?;
                    fields_sql.push(format!("{turtle} as {sql_name}"));
                    field_index += 1;
                } else if self.tree.node(child).first_segment().is_project() {
                    fields_sql.push(self.dialect().sql_any_value_last_turtle(
                        &self.quoted_stage_name(&name, root_group),
                        root_group,
                        &sql_name,
                    ));
                    field_index += 1;
                }
            }
        }
        s.push_str(&indent(&fields_sql.join(",\n")));
        s.push_str(&format!("\nFROM {stage0_name}\n"));

        let where_sql = self.tree.eliminate_compute_groups_sql();
        if !where_sql.is_empty() {
            s.push_str(&format!("WHERE {where_sql}\n"));
        }
        if !dimension_indexes.is_empty() {
            s.push_str(&format!(
                "GROUP BY {}\n",
                dimension_indexes
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        }
        s.push_str(&self.generate_sql_order_by(ROOT_RESULT)?);
        if let Some(limit) = self.first_segment().limit() {
            s.push_str(&format!("LIMIT {limit}\n"));
        }

        let stage = writer.add_stage(&s);
        let stage = self.generate_pipelined_stages(&output.output_pipelined_sql, stage, writer)?;
        self.result_stage = Some(stage.clone());
        Ok(stage)
    }

    fn build_dialect_field_list(&self, result: ResultId) -> Result<Vec<DialectField>> {
        let mut list = Vec::new();
        let reduce = self.tree.node(result).first_segment().is_reduce();
        let group_set = self.tree.node(result).group_set;
        let scope = self.scope();
        for (name, slot) in &self.tree.node(result).fields {
            let sql_name = self.dialect().sql_maybe_quote_identifier(name);
            match slot {
                Slot::Query(child) if reduce => {
                    let repeated = self.tree.get_repeated_result_type(*child);
                    list.push(DialectField {
                        type_name: if repeated == RepeatedResultType::Nested {
                            "array".to_string()
                        } else {
                            "record".to_string()
                        },
                        sql_expression: self.quoted_stage_name(name, group_set),
                        sql_output_name: sql_name,
                        raw_name: name.clone(),
                    });
                }
                Slot::Field(fi) if fi.usage.is_result() => {
                    if matches!(fi.def.kind, FieldKind::Atomic(_)) {
                        let sql_expression = if reduce {
                            self.quoted_stage_name(name, group_set)
                        } else {
                            instance_expression(&scope, result, fi)?
                        };
                        list.push(DialectField {
                            type_name: fi.def.type_name().to_string(),
                            sql_expression,
                            sql_output_name: sql_name,
                            raw_name: name.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(list)
    }

    fn generate_turtle_sql(
        &self,
        result: ResultId,
        writer: &mut StageWriter,
        sql_field_name: &str,
        output: &mut StageOutput,
    ) -> Result<String> {
        let node = self.tree.node(result);
        let group_set = node.group_set;

        // turtle-local ordering
        let mut ob_sql: Vec<String> = Vec::new();
        let order_by_def = node
            .first_segment()
            .query_segment()
            .and_then(|q| q.order_by.clone())
            .unwrap_or_else(|| self.tree.calculate_default_order_by(result));
        let scope = self.scope();
        for ordering in &order_by_def {
            let name = match &ordering.field {
                OrderByTarget::Name(n) => n.clone(),
                OrderByTarget::Index(i) => self.tree.get_field_by_number(result, *i)?.0.to_string(),
            };
            let dir = ordering.dir.map(|d| d.sql()).unwrap_or("ASC");
            if node.first_segment().is_reduce() {
                ob_sql.push(format!(" {} {dir}", self.quoted_stage_name(&name, group_set)));
            } else if node.first_segment().is_project() {
                let fi = self.tree.get_field(result, &name)?;
                ob_sql.push(format!(
                    " {} {dir}",
                    instance_expression(&scope, result, fi)?
                ));
            }
        }
        let order_by = if ob_sql.is_empty() {
            String::new()
        } else {
            format!(
                " {}",
                self.dialect().sql_order_by(&ob_sql, OrderByRequest::Turtle)
            )
        };

        let dialect_field_list = self.build_dialect_field_list(result)?;
        let repeated = self.tree.get_repeated_result_type(result);
        let mut ret = match repeated {
            RepeatedResultType::InlineAllNumbers => self
                .dialect()
                .sql_coalesce_measures_inline(group_set, &dialect_field_list),
            RepeatedResultType::Inline => self
                .dialect()
                .sql_any_value_turtle(group_set, &dialect_field_list),
            RepeatedResultType::Nested => self.dialect().sql_aggregate_turtle(
                group_set,
                &dialect_field_list,
                &order_by,
                None,
            ),
        };

        // a multi-segment turtle compiles as its own pipeline and is grafted
        // back in as a correlated subquery or a dedicated output stage
        let mut child_writer =
            StageWriter::new(self.dialect().supports_cte_in_correlated_subqueries());
        let source_expression = if self.dialect().supports_unnest_array_agg() {
            ret.clone()
        } else {
            sql_field_name.to_string()
        };
        let (_struct_def, pipe_out, _repeated) =
            self.generate_turtle_pipeline_sql(result, &mut child_writer, &source_expression)?;
        if pipe_out.is_some() {
            let fields = self.build_dialect_field_list(result)?;
            let sql = child_writer.generate_correlated_subquery(
                self.dialect(),
                &fields,
                None,
            )?;
            if self.dialect().supports_unnest_array_agg() {
                ret = format!("({sql})");
            } else {
                output
                    .output_pipelined_sql
                    .push((sql_field_name.to_string(), format!("({sql})")));
            }
        }
        Ok(ret)
    }

    /// Compile the tail of a turtle's pipeline (if any) against an unnested
    /// view of its first stage.
    fn generate_turtle_pipeline_sql(
        &self,
        result: ResultId,
        writer: &mut StageWriter,
        source_sql_expression: &str,
    ) -> Result<(StructDef, Option<String>, RepeatedResultType)> {
        let mut struct_def = self.get_result_struct_def(result, false)?;
        let repeated = self.tree.get_repeated_result_type(result);
        let node = self.tree.node(result);
        if node.turtle.pipeline.len() <= 1 {
            return Ok((struct_def, None, repeated));
        }

        let pipeline: Vec<PipeSegment> = node.turtle.pipeline[1..].to_vec();
        let fields = dialect_fields_of_struct(&struct_def, self.dialect());
        let pipe_sql = self.dialect().sql_unnest_pipeline_head(
            repeated == RepeatedResultType::InlineAllNumbers,
            source_sql_expression,
            &fields,
        );
        let input_struct = StructDef {
            name: "~pipe~".to_string(),
            kind: StructKind::NestSource { pipe_sql },
            fields: struct_def.fields.clone(),
            dialect: struct_def.dialect.clone(),
            connection: struct_def.connection.clone(),
            primary_key: None,
            filter_list: Vec::new(),
            join: None,
            e: None,
            parameters: HashMap::new(),
            arguments: HashMap::new(),
        };
        let tail = TurtleDef::new("starthere", pipeline);
        let mut q = QueryQuery::make_query(
            self.model,
            &tail,
            input_struct,
            &HashMap::new(),
            self.is_joined_subquery,
        )?;
        let (last_stage, out_struct) = q.generate_sql_from_pipeline(writer)?;
        let out_repeated = q.tree.get_repeated_result_type(ROOT_RESULT);
        struct_def = out_struct;
        Ok((struct_def, Some(last_stage), out_repeated))
    }

    /// The output shape of this query (or of one nested result).
    pub fn get_result_struct_def(&self, result: ResultId, is_root: bool) -> Result<StructDef> {
        let mut fields: Vec<FieldDef> = Vec::new();
        let mut primary_key: Option<String> = None;
        let mut dim_count = 0;

        for (name, slot) in &self.tree.node(result).fields {
            match slot {
                Slot::Query(child) => {
                    let (child_struct, _, repeated) = self.generate_turtle_pipeline_sql(
                        *child,
                        &mut StageWriter::new(true),
                        "<nosource>",
                    )?;
                    let join = if repeated == RepeatedResultType::Nested {
                        model::schema::JoinType::Many
                    } else {
                        model::schema::JoinType::One
                    };
                    let kind = if repeated == RepeatedResultType::Nested {
                        StructKind::Array {
                            element: ElementType::Record,
                        }
                    } else {
                        StructKind::Record
                    };
                    fields.push(FieldDef {
                        name: name.clone(),
                        rename: None,
                        kind: FieldKind::Join(StructDef {
                            name: name.clone(),
                            kind,
                            fields: child_struct.fields,
                            dialect: child_struct.dialect,
                            connection: child_struct.connection,
                            primary_key: None,
                            filter_list: Vec::new(),
                            join: Some(model::schema::JoinSpec {
                                join,
                                matrix_operation: None,
                                on_expression: None,
                            }),
                            e: None,
                            parameters: HashMap::new(),
                            arguments: HashMap::new(),
                        }),
                        e: None,
                        expression_type: Default::default(),
                        code: None,
                    });
                }
                Slot::Field(fi) => {
                    if !fi.usage.is_result() {
                        continue;
                    }
                    if is_basic_scalar(&fi.def) {
                        if dim_count == 0 && is_root {
                            primary_key = Some(name.clone());
                        } else {
                            primary_key = None;
                        }
                        dim_count += 1;
                    }
                    // computations are resolved in the output shape
                    let mut out = fi.def.clone();
                    out.name = name.clone();
                    out.rename = None;
                    out.e = None;
                    out.code = None;
                    out.expression_type = Default::default();
                    fields.push(out);
                }
            }
        }
        Ok(StructDef {
            name: self
                .result_stage
                .clone()
                .unwrap_or_else(|| "result".to_string()),
            kind: StructKind::QueryResult,
            fields,
            dialect: self.dialect().name().to_string(),
            connection: self.graph.connection_name().to_string(),
            primary_key,
            filter_list: Vec::new(),
            join: None,
            e: None,
            parameters: HashMap::new(),
            arguments: HashMap::new(),
        })
    }

    fn generate_complex_sql(&mut self, writer: &mut StageWriter) -> Result<String> {
        let mut stage_name = self.generate_sql_stage0(writer)?;
        if self.max_depth > 1 {
            let mut depth = self.max_depth;
            while depth > 1 {
                stage_name = self.generate_sql_depth_n(depth, writer, &stage_name)?;
                depth -= 1;
            }
        }
        self.generate_sql_combine_turtles(writer, &stage_name)
    }

    pub fn generate_sql(&mut self, writer: &mut StageWriter) -> Result<String> {
        if self.is_index() {
            return self.generate_index_sql(writer);
        }
        if self.is_raw() {
            return self.generate_raw_sql(writer);
        }

        let (next, max_depth, _children, is_complex) =
            self.tree.compute_groups(ROOT_RESULT, 0, 0);
        self.max_depth = max_depth;
        self.max_group_set = next.saturating_sub(1);
        self.tree.assign_fields_to_groups(ROOT_RESULT)?;

        self.tree.is_complex_query |= max_depth > 0 || is_complex;
        debug!(
            complex = self.tree.is_complex_query,
            max_group_set = self.max_group_set,
            "generating query SQL"
        );
        if self.tree.is_complex_query {
            self.generate_complex_sql(writer)
        } else {
            self.generate_simple_sql(writer)
        }
    }

    pub fn generate_sql_from_pipeline(
        &mut self,
        writer: &mut StageWriter,
    ) -> Result<(String, StructDef)> {
        self.prepare()?;
        let mut last_stage_name = self.generate_sql(writer)?;
        let mut output_struct = if self.is_index() {
            self.index_result_struct_def()
        } else if self.is_raw() {
            self.raw_result_struct_def()?
        } else {
            self.get_result_struct_def(ROOT_RESULT, true)?
        };

        if self.turtle.pipeline.len() > 1 {
            for transform in self.turtle.pipeline[1..].to_vec() {
                let mut finalize = output_struct.clone();
                finalize.name = last_stage_name.clone();
                finalize.kind = StructKind::Finalize;
                let turtle = TurtleDef::new("~computeLastStage~", vec![transform]);
                let mut q = QueryQuery::make_query(
                    self.model,
                    &turtle,
                    finalize,
                    &HashMap::new(),
                    self.is_joined_subquery,
                )?;
                q.prepare()?;
                last_stage_name = q.generate_sql(writer)?;
                output_struct = q.get_result_struct_def(ROOT_RESULT, true)?;
            }
        }
        Ok((last_stage_name, output_struct))
    }

    // ---------------- raw ----------------

    fn generate_raw_sql(&mut self, writer: &mut StageWriter) -> Result<String> {
        match &self.graph.node(ROOT).def.kind {
            StructKind::SqlSelect { select_str } => {
                let stage = writer.add_stage(select_str);
                self.result_stage = Some(stage.clone());
                Ok(stage)
            }
            _ => Err(internal("raw queries currently only support SQL sources")),
        }
    }

    // ---------------- index ----------------

    fn expand_index_fields(&mut self) -> Result<()> {
        let PipeSegment::Index(seg) = self.first_segment().clone() else {
            return Ok(());
        };
        let mut result_index = 1;
        for f in &seg.index_fields {
            let as_name = f.path.join(".");
            let fref = self.graph.field_by_name(ROOT, &f.path)?.as_atomic(&f.path)?;
            self.index_paths.insert(as_name.clone(), f.path.clone());
            self.tree.add_field(
                ROOT_RESULT,
                &as_name,
                FieldInstanceField::new(
                    fref.owner,
                    fref.def,
                    FieldUsage::Result { result_index },
                ),
            )?;
            result_index += 1;
        }
        if let Some(measure) = &seg.weight_measure {
            let fref = self
                .graph
                .field_by_name(ROOT, &[measure.clone()])?
                .as_atomic(&[measure.clone()])?;
            self.tree.add_field(
                ROOT_RESULT,
                measure,
                FieldInstanceField::new(
                    fref.owner,
                    fref.def,
                    FieldUsage::Result { result_index },
                ),
            )?;
        }
        Ok(())
    }

    /// Indexes over different fan-out branches cannot always share one
    /// grouped pass; split the fields into per-branch stages and union them.
    fn index_fields_to_stages(&self, seg: &IndexSegment) -> Vec<Vec<IndexFieldDef>> {
        if self.dialect().dont_union_index() {
            return vec![seg.index_fields.clone()];
        }
        let mut stages: Vec<Vec<IndexFieldDef>> = Vec::new();
        let mut stage_map: HashMap<String, usize> = HashMap::new();
        for fref in &seg.index_fields {
            if fref.path.len() > 1 {
                let stage_root = path_to_col(&fref.path[..fref.path.len() - 1]);
                if let Some(&idx) = stage_map.get(&stage_root) {
                    stages[idx].push(fref.clone());
                    continue;
                }
                let first = self.graph.node(ROOT).child(&fref.path[0]);
                if let Some(NodeField::Join(join_id)) = first {
                    let join_def = &self.graph.node(*join_id).def;
                    let is_many = join_def
                        .join
                        .as_ref()
                        .is_some_and(|j| j.join == model::schema::JoinType::Many);
                    if is_many && join_def.fields.len() > 1 {
                        stage_map.insert(stage_root, stages.len());
                        stages.push(vec![fref.clone()]);
                        continue;
                    }
                }
            }
            if stages.is_empty() {
                stages.push(Vec::new());
            }
            stages[0].push(fref.clone());
        }
        if stages.is_empty() {
            stages.push(Vec::new());
        }
        stages
    }

    fn generate_index_sql(&mut self, writer: &mut StageWriter) -> Result<String> {
        let PipeSegment::Index(seg) = self.first_segment().clone() else {
            return Err(internal("not an index segment"));
        };
        let mut output_stage_names: Vec<String> = Vec::new();
        for fields in self.index_fields_to_stages(&seg) {
            let mut stage_seg = seg.clone();
            stage_seg.index_fields = fields;
            let turtle = TurtleDef::new(
                &self.turtle.name,
                vec![PipeSegment::Index(stage_seg)],
            );
            let mut q = QueryQuery::make_query(
                self.model,
                &turtle,
                self.graph.node(ROOT).def.clone(),
                &HashMap::new(),
                self.is_joined_subquery,
            )?;
            q.prepare()?;
            let stage = q.generate_index_stage_sql(writer)?;
            output_stage_names.push(stage);
        }
        let stage = if output_stage_names.len() == 1 {
            output_stage_names.pop().expect("one stage")
        } else {
            writer.add_stage(
                &output_stage_names
                    .iter()
                    .map(|n| format!("SELECT * FROM {n}\n"))
                    .collect::<Vec<_>>()
                    .join(" UNION ALL \n"),
            )
        };
        self.result_stage = Some(stage.clone());
        Ok(stage)
    }

    /// One row per (field, value) pair with a computed weight.
    fn generate_index_stage_sql(&mut self, writer: &mut StageWriter) -> Result<String> {
        let PipeSegment::Index(seg) = self.first_segment().clone() else {
            return Err(internal("not an index segment"));
        };
        let dialect = self.dialect();
        let field_name_column = dialect.sql_maybe_quote_identifier("fieldName");
        let field_path_column = dialect.sql_maybe_quote_identifier("fieldPath");
        let field_value_column = dialect.sql_maybe_quote_identifier("fieldValue");
        let field_type_column = dialect.sql_maybe_quote_identifier("fieldType");
        let field_range_column = dialect.sql_maybe_quote_identifier("fieldRange");
        let weight_column = dialect.sql_maybe_quote_identifier("weight");

        let mut measure_sql = "COUNT(*)".to_string();
        if let Some(measure_name) = &seg.weight_measure {
            let scope = self.scope();
            let fi = self.tree.get_field(ROOT_RESULT, measure_name)?;
            measure_sql = instance_expression(&scope, ROOT_RESULT, fi)?;
        }

        struct IndexField {
            name: String,
            path: Vec<String>,
            type_name: String,
            expression: String,
        }
        let mut index_fields: Vec<IndexField> = Vec::new();
        {
            let scope = self.scope();
            for (name, fi) in self.tree.fields(ROOT_RESULT) {
                if fi.usage.is_result()
                    && is_scalar_field(&fi.def)
                    && seg.weight_measure.as_deref() != Some(name)
                {
                    index_fields.push(IndexField {
                        name: name.to_string(),
                        path: self.index_paths.get(name).cloned().unwrap_or_default(),
                        type_name: fi.def.type_name().to_string(),
                        expression: instance_expression(&scope, ROOT_RESULT, fi)?,
                    });
                }
            }
        }
        self.max_group_set = index_fields.len().saturating_sub(1) as u32;

        let mut s = String::from("SELECT\n  group_set,\n");

        s.push_str("  CASE group_set\n");
        for (i, f) in index_fields.iter().enumerate() {
            s.push_str(&format!("    WHEN {i} THEN '{}'\n", f.name));
        }
        s.push_str(&format!("  END as {field_name_column},\n"));

        s.push_str("  CASE group_set\n");
        for (i, f) in index_fields.iter().enumerate() {
            s.push_str(&format!("    WHEN {i} THEN '{}'\n", path_to_col(&f.path)));
        }
        s.push_str(&format!("  END as {field_path_column},\n"));

        s.push_str("  CASE group_set\n");
        for (i, f) in index_fields.iter().enumerate() {
            s.push_str(&format!("    WHEN {i} THEN '{}'\n", f.type_name));
        }
        s.push_str(&format!("  END as {field_type_column},"));

        s.push_str(&format!(
            "  CASE group_set WHEN 99999 THEN {}\n",
            dialect.cast_to_string("NULL")
        ));
        for (i, f) in index_fields.iter().enumerate() {
            if f.type_name == "string" {
                s.push_str(&format!("    WHEN {i} THEN {}\n", f.expression));
            }
        }
        s.push_str(&format!("  END as {field_value_column},\n"));

        s.push_str(&format!(" {measure_sql} as {weight_column},\n"));

        // force at least one arm so the CASE always typechecks
        s.push_str("  CASE group_set\n    WHEN 99999 THEN ''");
        for (i, f) in index_fields.iter().enumerate() {
            if f.type_name == "number" {
                s.push_str(&format!(
                    "    WHEN {i} THEN {}\n",
                    dialect.concat(&[
                        format!("MIN({})", dialect.cast_to_string(&f.expression)),
                        "' to '".to_string(),
                        dialect.cast_to_string(&format!("MAX({})", f.expression)),
                    ])
                ));
            }
            if f.type_name == "date" || f.type_name == "timestamp" {
                s.push_str(&format!(
                    "    WHEN {i} THEN {}\n",
                    dialect.concat(&[
                        format!("MIN({})", dialect.sql_date_to_string(&f.expression)),
                        "' to '".to_string(),
                        format!("MAX({})", dialect.sql_date_to_string(&f.expression)),
                    ])
                ));
            }
        }
        s.push_str(&format!("  END as {field_range_column}\n"));

        s.push_str(&self.generate_sql_joins(writer)?);
        s.push_str(&format!(
            "{}\n",
            dialect.sql_group_set_table(self.max_group_set)
        ));
        s.push_str(&self.generate_sql_filters(ROOT_RESULT, FilterWhich::Where)?.clause("where"));
        s.push_str("GROUP BY 1,2,3,4,5\n");
        if let Some(limit) = seg.limit {
            s.push_str(&format!("LIMIT {limit}\n"));
        }

        let result_stage = writer.add_stage(&s);
        let stage = writer.add_stage(&format!(
            "SELECT\n  {field_name_column},\n  {field_path_column},\n  {field_type_column},\n  COALESCE({field_value_column}, {field_range_column}) as {field_value_column},\n  {weight_column}\nFROM {result_stage}\n"
        ));
        self.result_stage = Some(stage.clone());
        Ok(stage)
    }

    /// All indexes share one output schema.
    pub fn index_result_struct_def(&self) -> StructDef {
        StructDef {
            name: self
                .result_stage
                .clone()
                .unwrap_or_else(|| "result".to_string()),
            kind: StructKind::QueryResult,
            fields: vec![
                FieldDef::string("fieldName"),
                FieldDef::string("fieldPath"),
                FieldDef::string("fieldValue"),
                FieldDef::string("fieldType"),
                FieldDef::integer("weight"),
            ],
            dialect: self.dialect().name().to_string(),
            connection: self.graph.connection_name().to_string(),
            primary_key: None,
            filter_list: Vec::new(),
            join: None,
            e: None,
            parameters: HashMap::new(),
            arguments: HashMap::new(),
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self.first_segment(), PipeSegment::Index(_))
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.first_segment(), PipeSegment::Raw)
    }

    pub fn raw_result_struct_def(&self) -> Result<StructDef> {
        let def = &self.graph.node(ROOT).def;
        if !def.kind.is_source() {
            return Err(internal("raw result requires a source struct"));
        }
        let mut out = def.clone();
        out.kind = StructKind::QueryResult;
        Ok(out)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FilterWhich {
    Where,
    Having,
}

fn first_query_segment_mut(turtle: &mut TurtleDef) -> Option<&mut model::pipeline::QuerySegment> {
    match turtle.pipeline.first_mut() {
        Some(PipeSegment::Reduce(q)) | Some(PipeSegment::Project(q)) => Some(q),
        _ => None,
    }
}

fn join_field_def(graph: &QueryGraph, id: StructId) -> FieldDef {
    let def = graph.node(id).def.clone();
    FieldDef {
        name: def.name.clone(),
        rename: None,
        kind: FieldKind::Join(def),
        e: None,
        expression_type: Default::default(),
        code: None,
    }
}

fn dialect_fields_of_struct(def: &StructDef, d: &dyn dialect::Dialect) -> Vec<DialectField> {
    def.fields
        .iter()
        .filter(|f| matches!(f.kind, FieldKind::Atomic(_)) || matches!(f.kind, FieldKind::Join(_)))
        .map(|f| DialectField {
            type_name: f.type_name().to_string(),
            sql_expression: d.sql_maybe_quote_identifier(f.identifier()),
            sql_output_name: d.sql_maybe_quote_identifier(f.identifier()),
            raw_name: f.identifier().to_string(),
        })
        .collect()
}

