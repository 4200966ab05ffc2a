//! Lowers an expression tree to a SQL string.
//!
//! Compilation is a pure post-order fold: each node's children are compiled
//! first and the results handed, alongside the node, to the active dialect
//! for first refusal; only then does the fixed dispatch table run. Nothing is
//! ever stashed on the tree itself.

use crate::error::{internal, CompileError, Result};
use crate::fields::is_scalar_field;
use crate::filter_compile;
use crate::graph::{FieldRef, QueryGraph, StructId, DISTINCT_KEY};
use crate::result::{FieldInstanceField, ResultId, ResultTree};
use crate::sql::{case_group, compose_generic_sql, AndChain, GenerateState, SqlPart};
use dialect::{CompiledKids, Dialect, LikeOp, OrderByRequest, QueryInfo};
use model::expr::{AggregateFunction, BinaryOp, Expr, UngroupKind};
use model::funcs::{
    FrameBound, FunctionCall, FunctionDialectDef, FunctionOrderBy, FunctionOverloadDef,
    FunctionParameterDef,
};
use model::schema::{FieldKind, StructKind};

/// Read-only compilation context for one query.
pub(crate) struct Scope<'a> {
    pub graph: &'a QueryGraph,
    pub tree: &'a ResultTree,
}

impl<'a> Scope<'a> {
    pub fn dialect(&self) -> &'static dyn Dialect {
        self.graph.dialect()
    }

    pub fn qi(&self, result: ResultId) -> QueryInfo {
        QueryInfo {
            query_timezone: self.tree.query_timezone(result),
        }
    }
}

fn sub_expr(
    s: &Scope,
    result: ResultId,
    context: StructId,
    e: &Expr,
    state: &GenerateState,
) -> Result<String> {
    let sql = expr_to_sql(s, result, context, e, state)?;
    Ok(if e.has_children() {
        format!("({sql})")
    } else {
        sql
    })
}

pub(crate) fn expr_to_sql(
    s: &Scope,
    result: ResultId,
    context: StructId,
    expr: &Expr,
    state: &GenerateState,
) -> Result<String> {
    // compile children first so dialect overrides see finished SQL
    let kids = match expr {
        Expr::Binary { left, right, .. } | Expr::Coalesce { left, right } => CompiledKids::pair(
            sub_expr(s, result, context, left, state)?,
            sub_expr(s, result, context, right, state)?,
        ),
        Expr::Delta { base, delta, .. } => CompiledKids::pair(
            sub_expr(s, result, context, base, state)?,
            sub_expr(s, result, context, delta, state)?,
        ),
        Expr::Parens { e }
        | Expr::Not { e }
        | Expr::UnaryMinus { e }
        | Expr::IsNull { e }
        | Expr::IsNotNull { e }
        | Expr::Trunc { e, .. }
        | Expr::Extract { e, .. }
        | Expr::Cast { e, .. } => CompiledKids::single(expr_to_sql(s, result, context, e, state)?),
        Expr::In { e, one_of, .. } => {
            let mut kids = CompiledKids::single(sub_expr(s, result, context, e, state)?);
            for o in one_of {
                kids.args.push(sub_expr(s, result, context, o, state)?);
            }
            kids
        }
        _ => CompiledKids::default(),
    };

    let qi = s.qi(result);
    if let Some(sql) = s.dialect().expr_to_sql(&qi, expr, &kids) {
        return Ok(sql);
    }

    match expr {
        Expr::Field { path } => generate_field_fragment(s, result, context, path, state),
        Expr::Parameter { path } => generate_parameter_fragment(s, result, context, path, state),
        Expr::SourceReference { path } => match path {
            None => s.graph.sql_identifier(context),
            Some(path) => match s.graph.field_by_name(context, path)? {
                FieldRef::Atomic(a) => Ok(a.def.identifier().to_string()),
                FieldRef::Join { id, .. } => s.graph.identifier(id),
                FieldRef::Turtle { def, .. } => Ok(def.name),
            },
        },
        Expr::OutputField { name } => {
            let fi = s.tree.get_field(result, name)?;
            Ok(format!(
                "({})",
                instance_analytical_sql(s, result, fi, false)?
            ))
        }
        Expr::StringLiteral { literal } => Ok(s.dialect().sql_literal_string(literal)),
        Expr::NumberLiteral { literal } => Ok(s.dialect().sql_literal_number(literal)),
        Expr::True => Ok("true".to_string()),
        Expr::False => Ok("false".to_string()),
        Expr::Null => Ok("NULL".to_string()),
        Expr::Binary { op, right, .. } => {
            let left_sql = kids.left.as_deref().unwrap_or_default();
            let right_sql = kids.right.as_deref().unwrap_or_default();
            match op {
                BinaryOp::NotEqual => {
                    // inequality always returns a two-valued boolean
                    Ok(format!("COALESCE({left_sql}!={right_sql},true)"))
                }
                BinaryOp::And | BinaryOp::Or => {
                    Ok(format!("{left_sql} {} {right_sql}", op.sql()))
                }
                BinaryOp::Like | BinaryOp::NotLike => {
                    let like_op = if *op == BinaryOp::Like {
                        LikeOp::Like
                    } else {
                        LikeOp::NotLike
                    };
                    let compare = match &**right {
                        Expr::StringLiteral { literal } => {
                            s.dialect().sql_like(like_op, left_sql, literal)
                        }
                        _ => format!("{left_sql} {} {right_sql}", like_op.sql()),
                    };
                    Ok(if *op == BinaryOp::Like {
                        compare
                    } else {
                        format!("COALESCE({compare},true)")
                    })
                }
                _ => Ok(format!("{left_sql}{}{right_sql}", op.sql())),
            }
        }
        Expr::In { not, .. } => {
            let e_sql = kids.e.as_deref().unwrap_or_default();
            let one_of = kids.args.join(",");
            let op = if *not { "NOT IN" } else { "IN" };
            Ok(format!("{e_sql} {op} ({one_of})"))
        }
        Expr::Coalesce { .. } => Ok(format!(
            "COALESCE({},{})",
            kids.left.as_deref().unwrap_or_default(),
            kids.right.as_deref().unwrap_or_default()
        )),
        Expr::Parens { .. } => Ok(format!("({})", kids.e.as_deref().unwrap_or_default())),
        Expr::Not { .. } => Ok(format!(
            "COALESCE(NOT {},TRUE)",
            kids.e.as_deref().unwrap_or_default()
        )),
        Expr::UnaryMinus { .. } => Ok(format!("-{}", kids.e.as_deref().unwrap_or_default())),
        Expr::IsNull { .. } => Ok(format!("{} IS NULL", kids.e.as_deref().unwrap_or_default())),
        Expr::IsNotNull { .. } => Ok(format!(
            "{} IS NOT NULL",
            kids.e.as_deref().unwrap_or_default()
        )),
        Expr::Case {
            value,
            whens,
            else_value,
        } => {
            let mut parts = vec!["CASE".to_string()];
            if let Some(v) = value {
                parts.push(sub_expr(s, result, context, v, state)?);
            }
            for w in whens {
                parts.push(format!(
                    "WHEN {} THEN {}",
                    sub_expr(s, result, context, &w.when, state)?,
                    sub_expr(s, result, context, &w.then, state)?
                ));
            }
            if let Some(e) = else_value {
                parts.push(format!("ELSE {}", sub_expr(s, result, context, e, state)?));
            }
            parts.push("END".to_string());
            Ok(parts.join(" "))
        }
        Expr::Filtered { e, filter_list } => {
            let mut all_where = AndChain::with(state.where_sql.as_deref());
            for cond in filter_list {
                all_where.add(expr_to_sql(
                    s,
                    result,
                    context,
                    &cond.e,
                    &state.with_where(None),
                )?);
            }
            expr_to_sql(
                s,
                result,
                context,
                e,
                &state.with_where(Some(all_where.sql())),
            )
        }
        Expr::Aggregate {
            function,
            e,
            struct_path,
        } => {
            let agg = match function {
                AggregateFunction::Sum => {
                    generate_sum_fragment(s, result, context, e, struct_path, state)?
                }
                AggregateFunction::Avg => {
                    generate_avg_fragment(s, result, context, e, struct_path, state)?
                }
                AggregateFunction::Count => {
                    generate_count_fragment(s, result, context, struct_path, state)?
                }
                AggregateFunction::Min | AggregateFunction::Max | AggregateFunction::Distinct => {
                    generate_symmetric_fragment(s, result, context, e, *function, state)?
                }
            };
            if s.tree.is_complex_query {
                let group_set = state
                    .total_group_set
                    .unwrap_or(s.tree.node(result).group_set);
                Ok(case_group(&[group_set], &agg))
            } else {
                Ok(agg)
            }
        }
        Expr::Ungroup { kind, e, fields } => {
            generate_ungrouped_fragment(s, result, context, *kind, e, fields, state)
        }
        Expr::FunctionCall(call) => generate_function_call(s, result, context, call, state),
        Expr::FunctionParameter { .. } => Err(internal(
            "function parameter fragment remaining during SQL generation",
        )),
        Expr::Spread { .. } => Err(internal(
            "function call expansion failed to process a spread node",
        )),
        Expr::AggregateOrderBy { .. } | Expr::AggregateLimit => Ok(String::new()),
        Expr::GenericSql { src, args } => {
            let mut out = String::new();
            for (i, piece) in src.iter().enumerate() {
                out.push_str(piece);
                if let Some(arg) = args.get(i) {
                    out.push_str(&expr_to_sql(s, result, context, arg, state)?);
                }
            }
            Ok(out)
        }
        Expr::FilterMatch {
            data_type,
            e,
            filter,
        } => generate_applied_filter(s, result, context, *data_type, e, filter, state),
        Expr::FilterLiteral { .. } => Err(internal(
            "filter expression value should not be used directly",
        )),
        Expr::Empty => Ok(String::new()),
        // time nodes are translated by the dialect's first refusal above
        Expr::TimeLiteral { .. }
        | Expr::Now
        | Expr::Trunc { .. }
        | Expr::Extract { .. }
        | Expr::Delta { .. }
        | Expr::Cast { .. } => Err(internal("dialect did not translate a time node")),
    }
}

/// The SQL for one field instance, generated against its *defining* struct.
pub(crate) fn instance_expression(
    s: &Scope,
    result: ResultId,
    fi: &FieldInstanceField,
) -> Result<String> {
    if matches!(fi.def.kind, FieldKind::Atomic(_)) && fi.def.name == DISTINCT_KEY {
        return generate_distinct_key_sql(s, result, fi.owner);
    }
    if let Some(e) = &fi.def.e {
        return expr_to_sql(s, result, fi.owner, e, &GenerateState::default());
    }
    sql_full_child_reference(
        s,
        result,
        fi.owner,
        &fi.def.name,
        s.graph.node(fi.owner).is_record(),
    )
}

/// Instance expression, wrapped for the group sets it belongs to.
pub(crate) fn instance_get_sql(
    s: &Scope,
    result: ResultId,
    fi: &FieldInstanceField,
) -> Result<String> {
    let exp = instance_expression(s, result, fi)?;
    if is_scalar_field(&fi.def) {
        let node = s.tree.node(result);
        let groups: Vec<u32> = if node.group_set > 0 {
            node.child_groups
                .iter()
                .chain(fi.additional_group_sets.iter())
                .copied()
                .collect()
        } else {
            Vec::new()
        };
        return Ok(case_group(&groups, &exp));
    }
    Ok(exp)
}

/// The name of the field inside window calculations, when one was assigned
/// during stage generation.
pub(crate) fn instance_analytical_sql(
    s: &Scope,
    result: ResultId,
    fi: &FieldInstanceField,
    for_partition: bool,
) -> Result<String> {
    match &fi.analytical_sql {
        None => instance_get_sql(s, result, fi),
        Some(analytical) => {
            if for_partition && fi.partition_sql.is_some() {
                Ok(fi.partition_sql.clone().unwrap())
            } else {
                Ok(analytical.clone())
            }
        }
    }
}

pub(crate) fn generate_field_fragment(
    s: &Scope,
    result: ResultId,
    context: StructId,
    path: &[String],
    state: &GenerateState,
) -> Result<String> {
    let fref = s.graph.field_by_name(context, path)?.as_atomic(path)?;
    if let Some(e) = &fref.def.e {
        let sql = expr_to_sql(s, result, fref.owner, e, state)?;
        return Ok(format!("({sql})"));
    }
    if fref.def.name == DISTINCT_KEY {
        return generate_distinct_key_sql(s, result, fref.owner);
    }
    sql_full_child_reference(
        s,
        result,
        fref.owner,
        &fref.def.name,
        s.graph.node(fref.owner).is_record(),
    )
}

/// Dialect child reference, expanding a computed record's defining
/// expression when needed.
pub(crate) fn sql_full_child_reference(
    s: &Scope,
    result: ResultId,
    owner: StructId,
    name: &str,
    expand: bool,
) -> Result<String> {
    let node = s.graph.node(owner);
    let computed_inline = matches!(
        node.def.kind,
        StructKind::Record | StructKind::Array { .. }
    ) && node.def.e.is_some();
    if expand && computed_inline {
        let parent = node
            .parent
            .ok_or_else(|| internal(format!("cannot expand reference to {name} without parent")))?;
        let e = node.def.e.as_ref().expect("checked computed");
        let parent_ref = expr_to_sql(s, result, parent, e, &GenerateState::default())?;
        let child_type = match node.child(name) {
            Some(crate::graph::NodeField::Atomic(def)) => def.type_name(),
            _ => "unknown",
        };
        return Ok(s.dialect().sql_field_reference(
            &parent_ref,
            s.graph.reference_type(owner),
            name,
            child_type,
        ));
    }
    s.graph.sql_child_reference_plain(owner, name)
}

/// The expression that identifies one source row of a struct, for
/// symmetric-safe aggregation.
pub(crate) fn generate_distinct_key_sql(
    s: &Scope,
    result: ResultId,
    owner: StructId,
) -> Result<String> {
    let node = s.graph.node(owner);
    if let Some(pk) = s.graph.primary_key(owner) {
        return generate_field_fragment(
            s,
            result,
            owner,
            &[pk.def.identifier().to_string()],
            &GenerateState::default(),
        );
    }
    if node.is_array() {
        let parent_key_sql = match node.parent {
            Some(parent) if s.graph.distinct_key_owner(parent).is_ok() => {
                generate_field_fragment(
                    s,
                    result,
                    parent,
                    &[DISTINCT_KEY.to_string()],
                    &GenerateState::default(),
                )?
            }
            _ => String::new(),
        };
        let row_id = s.dialect().sql_field_reference(
            &s.graph.identifier(owner)?,
            dialect::FieldReferenceType::Table,
            "__row_id",
            "string",
        );
        return Ok(s.dialect().sql_make_unnest_key(&parent_key_sql, &row_id));
    }
    Ok(s.dialect().sql_field_reference(
        &s.graph.identifier(owner)?,
        dialect::FieldReferenceType::Table,
        DISTINCT_KEY,
        "string",
    ))
}

fn generate_parameter_fragment(
    s: &Scope,
    result: ResultId,
    context: StructId,
    path: &[String],
    state: &GenerateState,
) -> Result<String> {
    let name = path
        .first()
        .ok_or_else(|| internal("empty parameter path"))?;
    let argument = s
        .graph
        .argument(context, name)
        .ok_or_else(|| CompileError::NoParameterValue(name.clone()))?;
    match &argument.value {
        Some(value) => {
            let value = value.clone();
            expr_to_sql(s, result, context, &value, state)
        }
        None => Err(CompileError::NoParameterValue(name.clone())),
    }
}

/// Apply the active filter predicate to a row-wise expression.
pub(crate) fn generate_dim_fragment(
    s: &Scope,
    result: ResultId,
    context: StructId,
    expr: &Expr,
    state: &GenerateState,
) -> Result<String> {
    let dim = expr_to_sql(s, result, context, expr, state)?;
    Ok(match &state.where_sql {
        Some(where_sql) => format!("CASE WHEN {where_sql} THEN {dim} END"),
        None => dim,
    })
}

fn generate_ungrouped_fragment(
    s: &Scope,
    result: ResultId,
    context: StructId,
    kind: UngroupKind,
    e: &Expr,
    fields: &[String],
    state: &GenerateState,
) -> Result<String> {
    if state.total_group_set.is_some() {
        return Err(CompileError::UngroupInUngroup);
    }

    let ungroup = if !fields.is_empty() {
        Some(
            s.tree
                .find_ungrouped_set(result, kind, fields)
                .ok_or_else(|| internal("cannot find group set for ungrouping"))?,
        )
    } else {
        None
    };
    let total_group_set = match &ungroup {
        Some((set, _)) => set.group_set,
        None => s.tree.parent_group_set(result),
    };

    let inner = expr_to_sql(s, result, context, e, &state.with_total(total_group_set))?;

    let partitions = s.tree.get_ungroup_partitions(
        result,
        ungroup.as_ref().map(|(set, f)| (set, f.as_slice())),
    )?;
    let mut partition_sqls = Vec::new();
    for (pid, name) in partitions {
        let fi = s.tree.get_field(pid, &name)?;
        partition_sqls.push(instance_analytical_sql(s, pid, fi, true)?);
    }
    let partition_by = if partition_sqls.is_empty() {
        String::new()
    } else {
        format!("PARTITION BY {}", partition_sqls.join(", "))
    };
    Ok(format!("MAX({inner}) OVER ({partition_by})"))
}

/// Whether aggregating over this struct would double-count through fan-out,
/// and if so, the distinct key to aggregate with.
pub(crate) fn generate_distinct_key_if_necessary(
    s: &Scope,
    result: ResultId,
    context: StructId,
    struct_path: &Option<Vec<String>>,
) -> Result<Option<String>> {
    let target = match struct_path {
        Some(path) => s.graph.struct_by_path(context, path)?,
        None => context,
    };
    let join_alias = s.graph.identifier(s.graph.joinable_parent(target))?;
    let join = s.tree.join_by_alias(&join_alias)?;
    if join.leafiest {
        Ok(None)
    } else {
        let key_owner = s.graph.distinct_key_owner(target)?;
        Ok(Some(generate_distinct_key_sql(s, result, key_owner)?))
    }
}

/// The hash-packed distinct sum for dialects without a native primitive.
fn sql_sum_distinct_generic(d: &dyn Dialect, sql_exp: &str, distinct_key: &str) -> String {
    let unique_int = d.sql_sum_distinct_hashed_key(distinct_key);
    let safe_value = format!("CAST(COALESCE({sql_exp}, 0) AS {})", d.default_decimal_type());
    let rounded_value = format!("ROUND({safe_value}*1, 9)");
    let sum_sql = format!(
        "(\n  SUM(DISTINCT {rounded_value} + {unique_int})\n  - SUM(DISTINCT {unique_int})\n)"
    );
    format!("CAST(({sum_sql}/1) AS {})", d.default_number_type())
}

fn generate_sum_fragment(
    s: &Scope,
    result: ResultId,
    context: StructId,
    e: &Expr,
    struct_path: &Option<Vec<String>>,
    state: &GenerateState,
) -> Result<String> {
    let dim_sql = generate_dim_fragment(s, result, context, e, state)?;
    let distinct_key_sql = generate_distinct_key_if_necessary(s, result, context, struct_path)?;
    let ret = match distinct_key_sql {
        Some(key) => {
            if s.dialect().supports_sum_distinct_function() {
                s.dialect().sql_sum_distinct(&key, &dim_sql, "SUM")?
            } else {
                sql_sum_distinct_generic(s.dialect(), &dim_sql, &key)
            }
        }
        None => format!("SUM({dim_sql})"),
    };
    Ok(format!("COALESCE({ret},0)"))
}

fn generate_avg_fragment(
    s: &Scope,
    result: ResultId,
    context: StructId,
    e: &Expr,
    struct_path: &Option<Vec<String>>,
    state: &GenerateState,
) -> Result<String> {
    let dim_sql = generate_dim_fragment(s, result, context, e, state)?;
    let distinct_key_sql = generate_distinct_key_if_necessary(s, result, context, struct_path)?;
    match distinct_key_sql {
        Some(key) => {
            if s.dialect().supports_sum_distinct_function() {
                Ok(s.dialect().sql_sum_distinct(&key, &dim_sql, "AVG")?)
            } else {
                let count_key = match &state.where_sql {
                    Some(where_sql) => format!("CASE WHEN {where_sql} THEN {key} END"),
                    None => key.clone(),
                };
                let sum_sql = sql_sum_distinct_generic(s.dialect(), &dim_sql, &key);
                Ok(format!(
                    "({sum_sql})/NULLIF(COUNT(DISTINCT CASE WHEN {dim_sql} IS NOT NULL THEN {count_key} END),0)"
                ))
            }
        }
        None => Ok(format!("AVG({dim_sql})")),
    }
}

fn generate_count_fragment(
    s: &Scope,
    result: ResultId,
    context: StructId,
    struct_path: &Option<Vec<String>>,
    state: &GenerateState,
) -> Result<String> {
    let target = match struct_path {
        Some(path) => s.graph.struct_by_path(context, path)?,
        None => context,
    };
    let join_alias = s.graph.identifier(s.graph.joinable_parent(target))?;
    let join = s.tree.join_by_alias(&join_alias)?;

    let mut func = "COUNT(";
    let mut thing = "1".to_string();
    if !join.leafiest || join.make_unique_key {
        func = "COUNT(DISTINCT ";
        let key_owner = s.graph.distinct_key_owner(target)?;
        thing = generate_distinct_key_sql(s, result, key_owner)?;
    }

    Ok(match &state.where_sql {
        Some(where_sql) => format!("{func}CASE WHEN {where_sql} THEN {thing} END)"),
        None => format!("{func}{thing})"),
    })
}

fn generate_symmetric_fragment(
    s: &Scope,
    result: ResultId,
    context: StructId,
    e: &Expr,
    function: AggregateFunction,
    state: &GenerateState,
) -> Result<String> {
    let dim_sql = generate_dim_fragment(s, result, context, e, state)?;
    let f = match function {
        AggregateFunction::Distinct => "count(distinct ",
        AggregateFunction::Min => "min(",
        AggregateFunction::Max => "max(",
        _ => return Err(internal("not a symmetric aggregate")),
    };
    Ok(format!("{f}{dim_sql})"))
}

fn generate_applied_filter(
    s: &Scope,
    result: ResultId,
    context: StructId,
    data_type: model::expr::FilterKind,
    e: &Expr,
    filter: &Expr,
    state: &GenerateState,
) -> Result<String> {
    let mut filter_expr = filter;
    while let Expr::Parens { e } = filter_expr {
        filter_expr = &**e;
    }
    let resolved;
    if let Expr::Parameter { path } = filter_expr {
        let name = path
            .first()
            .ok_or_else(|| internal("empty parameter path"))?;
        let argument = s
            .graph
            .argument(context, name)
            .ok_or_else(|| CompileError::NoParameterValue(name.clone()))?;
        match &argument.value {
            Some(value) => {
                resolved = value.clone();
                filter_expr = &resolved;
            }
            None => return Err(CompileError::ParameterNotFilter(name.clone())),
        }
    }
    let Expr::FilterLiteral { filter_src } = filter_expr else {
        return Err(CompileError::FilterNotLiteral);
    };

    let target_sql = expr_to_sql(s, result, context, e, state)?;
    let qi = s.qi(result);
    filter_compile::compile_filter_source(data_type, filter_src, &target_sql, s.dialect(), &qi)
}

// ---------------- function calls ----------------

fn get_param_for_arg_index(params: &[FunctionParameterDef], arg_index: usize) -> Option<&FunctionParameterDef> {
    params[..arg_index.min(params.len())]
        .iter()
        .find(|p| p.is_variadic)
        .or_else(|| params.get(arg_index))
}

fn literal_sql_expr(sql: String) -> Expr {
    compose_generic_sql(vec![SqlPart::Str(sql)])
}

fn expand_function_call(
    dialect_name: &str,
    function_name: &str,
    overload: &FunctionOverloadDef,
    args: &[Expr],
    order_by: Option<&str>,
    limit: Option<&str>,
) -> Result<Expr> {
    let dialect_def = overload.dialect.get(dialect_name).ok_or_else(|| {
        CompileError::FunctionNotDefinedForDialect {
            function: function_name.to_string(),
            dialect: dialect_name.to_string(),
        }
    })?;

    let with_commas = |es: Vec<Expr>| -> Expr {
        let mut parts = Vec::new();
        for (i, e) in es.into_iter().enumerate() {
            if i > 0 {
                parts.push(SqlPart::Str(",".to_string()));
            }
            parts.push(SqlPart::Expr(e));
        }
        compose_generic_sql(parts)
    };

    let arg_indexes = |param: &FunctionParameterDef, param_index: usize| -> Vec<usize> {
        if param.is_variadic {
            (param_index..args.len()).collect()
        } else {
            vec![param_index]
        }
    };

    let expanded = dialect_def.e.map_pre(&mut |fragment| match fragment {
        Expr::Spread { e } => match &**e {
            Expr::FunctionParameter { name } => {
                let (idx, param) = overload
                    .params
                    .iter()
                    .enumerate()
                    .find(|(_, p)| p.name == *name)?;
                let spread: Vec<Expr> = arg_indexes(param, idx)
                    .into_iter()
                    .filter_map(|i| args.get(i).cloned())
                    .collect();
                Some(with_commas(spread))
            }
            _ => None,
        },
        Expr::FunctionParameter { name } => {
            let (idx, param) = overload
                .params
                .iter()
                .enumerate()
                .find(|(_, p)| p.name == *name)?;
            if param.is_variadic {
                let spread: Vec<Expr> = arg_indexes(param, idx)
                    .into_iter()
                    .filter_map(|i| args.get(i).cloned())
                    .collect();
                Some(with_commas(spread))
            } else {
                args.get(idx).cloned()
            }
        }
        Expr::AggregateOrderBy { prefix, suffix } => Some(match order_by {
            Some(ob) => literal_sql_expr(format!(
                " {}{ob}{}",
                prefix.clone().unwrap_or_default(),
                suffix.clone().unwrap_or_default()
            )),
            None => Expr::Empty,
        }),
        Expr::AggregateLimit => Some(match limit {
            Some(l) => literal_sql_expr(format!(" {l}")),
            None => Expr::Empty,
        }),
        _ => None,
    });
    Ok(expanded)
}

fn get_function_order_by(
    s: &Scope,
    result: ResultId,
    context: StructId,
    state: &GenerateState,
    order_by: &[FunctionOrderBy],
    args: &[Expr],
    dialect_def: &FunctionDialectDef,
) -> Result<Option<String>> {
    if order_by.is_empty() {
        return Ok(None);
    }
    let mut terms = Vec::new();
    for ob in order_by {
        let expr = match &ob.e {
            Some(e) => e,
            None => args
                .get(dialect_def.default_order_by_arg_index)
                .ok_or_else(|| internal("function order by has no argument to default to"))?,
        };
        let osql = generate_dim_fragment(s, result, context, expr, state)?;
        let dir = match ob.dir {
            Some(d) => format!(" {}", d.sql()),
            None => String::new(),
        };
        terms.push(format!("{osql}{dir}"));
    }
    Ok(Some(format!("ORDER BY {}", terms.join(", "))))
}

fn generate_asymmetric_string_agg(
    s: &Scope,
    result: ResultId,
    context: StructId,
    call: &FunctionCall,
    distinct_key: &str,
    state: &GenerateState,
) -> Result<String> {
    if !call.order_by.is_empty() {
        return Err(CompileError::OrderedAggDistinctNotSupported {
            function: call.name.clone(),
            dialect: s.dialect().name().to_string(),
        });
    }
    let value_sql = generate_dim_fragment(
        s,
        result,
        context,
        call.args
            .first()
            .ok_or_else(|| internal("string_agg requires a value argument"))?,
        state,
    )?;
    let separator_sql = match call.args.get(1) {
        Some(sep) => generate_dim_fragment(s, result, context, sep, state)?,
        None => String::new(),
    };
    Ok(s.dialect()
        .sql_string_agg_distinct(distinct_key, &value_sql, &separator_sql)?)
}

fn generate_function_call(
    s: &Scope,
    result: ResultId,
    context: StructId,
    call: &FunctionCall,
    state: &GenerateState,
) -> Result<String> {
    let dialect_name = s.dialect().name();
    let overload = &call.overload;
    let dialect_def = overload.dialect.get(dialect_name).ok_or_else(|| {
        CompileError::FunctionNotDefinedForDialect {
            function: call.name.clone(),
            dialect: dialect_name.to_string(),
        }
    })?;

    let distinct_key = if overload.return_expression_type.is_aggregate() && !overload.is_symmetric
    {
        generate_distinct_key_if_necessary(s, result, context, &call.struct_path)?
    } else {
        None
    };
    let aggregate_limit = call.limit.map(|l| format!("LIMIT {l}"));

    if let Some(key) = &distinct_key {
        if !s.dialect().supports_agg_distinct() {
            if call.name == "string_agg" {
                return generate_asymmetric_string_agg(s, result, context, call, key, state);
            }
            return Err(CompileError::AggDistinctNotSupported {
                function: call.name.clone(),
                dialect: dialect_name.to_string(),
            });
        }

        // pack arguments and orderings through the distinct rewrite
        let mut packed_values: Vec<String> = Vec::new();
        for arg in &call.args {
            packed_values.push(generate_dim_fragment(s, result, context, arg, state)?);
        }
        let n_args = packed_values.len();
        for ob in &call.order_by {
            let expr = match &ob.e {
                Some(e) => e,
                None => call
                    .args
                    .get(dialect_def.default_order_by_arg_index)
                    .ok_or_else(|| internal("function order by has no argument to default to"))?,
            };
            packed_values.push(generate_dim_fragment(s, result, context, expr, state)?);
        }
        let val_names = s.dialect().agg_distinct_val_names(packed_values.len());

        let mut new_args: Vec<Expr> = Vec::new();
        for (i, arg) in call.args.iter().enumerate() {
            // constant-requiring arguments keep the actual expression
            let constant = get_param_for_arg_index(&overload.params, i)
                .map(|p| p.is_constant)
                .unwrap_or(false);
            if constant {
                new_args.push(arg.clone());
            } else {
                new_args.push(literal_sql_expr(val_names[i].clone()));
            }
        }
        let new_order_by: Vec<FunctionOrderBy> = call
            .order_by
            .iter()
            .enumerate()
            .map(|(i, ob)| FunctionOrderBy {
                e: Some(literal_sql_expr(val_names[n_args + i].clone())),
                dir: ob.dir,
            })
            .collect();
        let order_by_sql = get_function_order_by(
            s,
            result,
            context,
            state,
            &new_order_by,
            &new_args,
            dialect_def,
        )?;
        let expanded = expand_function_call(
            dialect_name,
            &call.name,
            overload,
            &new_args,
            order_by_sql.as_deref(),
            aggregate_limit.as_deref(),
        )?;
        let body = expr_to_sql(s, result, context, &expanded, state)?;
        return Ok(s.dialect().sql_agg_distinct(key, &packed_values, &body)?);
    }

    let mapped_args: Vec<Expr> = if overload.return_expression_type.is_aggregate() {
        let mut mapped = Vec::new();
        for (i, arg) in call.args.iter().enumerate() {
            let constant = get_param_for_arg_index(&overload.params, i)
                .map(|p| p.is_constant)
                .unwrap_or(false);
            if constant {
                mapped.push(arg.clone());
            } else {
                mapped.push(literal_sql_expr(generate_dim_fragment(
                    s, result, context, arg, state,
                )?));
            }
        }
        mapped
    } else {
        call.args.clone()
    };

    let order_by_sql = get_function_order_by(
        s,
        result,
        context,
        state,
        &call.order_by,
        &call.args,
        dialect_def,
    )?;
    let expanded = expand_function_call(
        dialect_name,
        &call.name,
        overload,
        &mapped_args,
        order_by_sql.as_deref(),
        aggregate_limit.as_deref(),
    )?;

    if overload.return_expression_type.is_analytic() {
        let mut extra_partitions = Vec::new();
        for output_name in &call.partition_by {
            let fi = s.tree.get_field(result, output_name)?;
            extra_partitions.push(format!(
                "({})",
                instance_analytical_sql(s, result, fi, false)?
            ));
        }
        return generate_analytic_fragment(
            s,
            result,
            context,
            &expanded,
            overload,
            dialect_def,
            state,
            &call.args,
            extra_partitions,
            order_by_sql,
        );
    }
    expr_to_sql(s, result, context, &expanded, state)
}

fn get_analytic_partitions(
    s: &Scope,
    result: ResultId,
    extra_partition_fields: &[String],
) -> Result<Vec<String>> {
    let mut ret = Vec::new();
    let mut p = s.tree.node(result).parent;
    while let Some(pid) = p {
        for (_, fi) in s.tree.fields(pid) {
            if crate::fields::is_basic_scalar(&fi.def) && fi.usage.is_result() {
                ret.push(instance_analytical_sql(s, pid, fi, true)?);
            }
        }
        p = s.tree.node(pid).parent;
    }
    ret.extend(extra_partition_fields.iter().cloned());
    Ok(ret)
}

#[allow(clippy::too_many_arguments)]
fn generate_analytic_fragment(
    s: &Scope,
    result: ResultId,
    context: StructId,
    expanded: &Expr,
    overload: &FunctionOverloadDef,
    dialect_def: &FunctionDialectDef,
    state: &GenerateState,
    args: &[Expr],
    extra_partitions: Vec<String>,
    func_ordering: Option<String>,
) -> Result<String> {
    let is_complex = s.tree.is_complex_query;
    let partition_fields = get_analytic_partitions(s, result, &extra_partitions)?;
    let mut all_partitions: Vec<String> = Vec::new();
    if is_complex {
        all_partitions.push("group_set".to_string());
    }
    all_partitions.extend(partition_fields);
    let partition_by = if all_partitions.is_empty() {
        String::new()
    } else {
        format!("PARTITION BY {}", all_partitions.join(", "))
    };

    let mut order_by = func_ordering.clone().unwrap_or_default();
    if func_ordering.is_none() && dialect_def.needs_window_order_by {
        let node = s.tree.node(result);
        let order_by_def = node
            .first_segment()
            .query_segment()
            .and_then(|q| q.order_by.clone())
            .unwrap_or_else(|| s.tree.calculate_default_order_by(result));
        let mut ob_sql: Vec<String> = Vec::new();
        for ordering in &order_by_def {
            let fi = match &ordering.field {
                model::pipeline::OrderByTarget::Name(name) => s.tree.get_field(result, name)?,
                model::pipeline::OrderByTarget::Index(i) => {
                    s.tree.get_field_by_number(result, *i)?.1
                }
            };
            // ordering by another analytic would recurse forever
            if fi.def.expression_type.is_analytic() {
                continue;
            }
            let order_sql = if node.first_segment().is_reduce() {
                instance_analytical_sql(s, result, fi, false)?
            } else {
                instance_expression(s, result, fi)?
            };
            let dir = ordering
                .dir
                .map(|d| d.sql())
                .unwrap_or("ASC");
            ob_sql.push(format!(" {order_sql} {dir}"));
        }
        if !ob_sql.is_empty() {
            order_by = format!(
                " {}",
                s.dialect().sql_order_by(&ob_sql, OrderByRequest::Analytical)
            );
        }
    }

    let mut between = String::new();
    if let Some(frame) = &dialect_def.between {
        let resolve = |bound: &FrameBound| -> Result<String> {
            Ok(match bound {
                FrameBound::Unbounded => "UNBOUNDED".to_string(),
                FrameBound::Rows(n) => n.to_string(),
                FrameBound::Param(name) => {
                    let arg_index = overload
                        .params
                        .iter()
                        .position(|p| p.name == *name)
                        .ok_or_else(|| internal("window frame names an unknown parameter"))?;
                    match args.get(arg_index) {
                        Some(Expr::NumberLiteral { literal }) => literal.clone(),
                        _ => {
                            return Err(internal("invalid number of rows for window spec"));
                        }
                    }
                }
            })
        };
        between = format!(
            "ROWS BETWEEN {} PRECEDING AND {} FOLLOWING",
            resolve(&frame.preceding)?,
            resolve(&frame.following)?
        );
    }

    let func_sql = expr_to_sql(s, result, context, expanded, state)?;
    let ret = format!("{func_sql} OVER({partition_by} {order_by} {between})");
    if is_complex {
        Ok(format!(
            "CASE WHEN group_set={} THEN {ret} END",
            s.tree.node(result).group_set
        ))
    } else {
        Ok(ret)
    }
}
