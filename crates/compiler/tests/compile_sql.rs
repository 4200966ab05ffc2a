//! End-to-end compilation scenarios: model in, SQL text out.

use compiler::{CompileError, QueryModel};
use model::expr::{AggregateFunction, BinaryOp, Expr, ExpressionType};
use model::funcs::{
    FunctionCall, FunctionDialectDef, FunctionOverloadDef, FunctionParameterDef,
};
use model::pipeline::{
    IndexFieldDef, IndexSegment, ModelDef, PipeSegment, Query, QueryFieldDef, QuerySegment,
    StructRef, TurtleDef,
};
use model::schema::{
    AtomicType, FieldDef, FieldKind, JoinSpec, JoinType, MatrixOperation, StructDef,
};
use std::collections::HashMap;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn count_measure(name: &str) -> FieldDef {
    FieldDef::measure(
        name,
        Expr::Aggregate {
            function: AggregateFunction::Count,
            e: Box::new(Expr::Empty),
            struct_path: None,
        },
    )
}

fn sum_measure(name: &str, path: &[&str]) -> FieldDef {
    let struct_path: Vec<String> = path[..path.len() - 1].iter().map(|s| s.to_string()).collect();
    FieldDef::measure(
        name,
        Expr::Aggregate {
            function: AggregateFunction::Sum,
            e: Box::new(Expr::field(path)),
            struct_path: if struct_path.is_empty() {
                None
            } else {
                Some(struct_path)
            },
        },
    )
}

fn join_many(name: &str, def: StructDef, on: Expr) -> FieldDef {
    let mut def = def;
    def.name = name.to_string();
    def.join = Some(JoinSpec {
        join: JoinType::Many,
        matrix_operation: None,
        on_expression: Some(on),
    });
    FieldDef {
        name: name.to_string(),
        rename: None,
        kind: FieldKind::Join(def),
        e: None,
        expression_type: ExpressionType::Scalar,
        code: None,
    }
}

fn reduce(fields: Vec<QueryFieldDef>) -> PipeSegment {
    PipeSegment::Reduce(QuerySegment {
        query_fields: fields,
        ..QuerySegment::default()
    })
}

fn paths(paths: &[&[&str]]) -> Vec<QueryFieldDef> {
    paths.iter().map(|p| QueryFieldDef::path(p)).collect()
}

fn flights_model(dialect: &str) -> ModelDef {
    let mut flights = StructDef::table("flights", "airlines.flights", dialect, dialect);
    flights.fields.push(FieldDef::string("carrier"));
    flights.fields.push(FieldDef::string("origin"));
    flights.fields.push(FieldDef::integer("distance"));
    flights.fields.push(count_measure("flight_count"));
    ModelDef {
        contents: vec![flights],
    }
}

/// users joined one-to-many to both orders and events: two fan-out branches,
/// so neither branch may use natural aggregation.
fn branched_model(dialect: &str) -> ModelDef {
    let mut orders = StructDef::table("orders", "shop.orders", dialect, dialect);
    orders.fields.push(FieldDef::string("status"));
    orders.fields.push(FieldDef::integer("amount"));
    orders.fields.push(FieldDef::string("user_id"));

    let mut events = StructDef::table("events", "shop.events", dialect, dialect);
    events.fields.push(FieldDef::string("kind"));
    events.fields.push(FieldDef::string("user_id"));

    let mut users = StructDef::table("users", "shop.users", dialect, dialect);
    users.primary_key = Some("id".to_string());
    users.fields.push(FieldDef::string("id"));
    users.fields.push(FieldDef::string("name"));
    users.fields.push(count_measure("user_count"));
    users.fields.push(join_many(
        "orders",
        orders,
        Expr::binary(
            BinaryOp::Equal,
            Expr::field(&["id"]),
            Expr::field(&["orders", "user_id"]),
        ),
    ));
    users.fields.push(join_many(
        "events",
        events,
        Expr::binary(
            BinaryOp::Equal,
            Expr::field(&["id"]),
            Expr::field(&["events", "user_id"]),
        ),
    ));
    ModelDef {
        contents: vec![users],
    }
}

#[test]
fn test_plain_reduce_compiles_to_single_stage() {
    init_tracing();
    let model = QueryModel::new(flights_model("duckdb")).unwrap();
    let query = Query::against(
        "flights",
        vec![reduce(paths(&[
            &["carrier"],
            &["origin"],
            &["flight_count"],
        ]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    assert!(!compiled.sql.contains("group_set"), "{}", compiled.sql);
    assert!(!compiled.sql.contains("WITH "), "{}", compiled.sql);
    assert!(compiled.sql.contains("GROUP BY 1,2"), "{}", compiled.sql);
    assert!(compiled.sql.contains("COUNT(1)"), "{}", compiled.sql);
    assert_eq!(compiled.last_stage_name, "__stage0");
    assert_eq!(compiled.connection_name, "duckdb");
}

#[test]
fn test_nested_turtle_takes_group_set_path() {
    init_tracing();
    let mut model_def = flights_model("duckdb");
    model_def.contents[0].fields.push(FieldDef {
        name: "by_origin".to_string(),
        rename: None,
        kind: FieldKind::Turtle(TurtleDef::new(
            "by_origin",
            vec![reduce(paths(&[&["origin"], &["flight_count"]]))],
        )),
        e: None,
        expression_type: ExpressionType::Scalar,
        code: None,
    });
    let model = QueryModel::new(model_def).unwrap();
    let query = Query::against(
        "flights",
        vec![reduce(paths(&[
            &["carrier"],
            &["flight_count"],
            &["by_origin"],
        ]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    // one scan computes both levels
    assert!(
        compiled
            .sql
            .contains("CROSS JOIN (SELECT UNNEST(GENERATE_SERIES(0,1,1)) as group_set"),
        "{}",
        compiled.sql
    );
    assert!(compiled.sql.contains("\"origin__1\""), "{}", compiled.sql);
    assert!(
        compiled.sql.contains("FILTER (WHERE group_set=1)"),
        "{}",
        compiled.sql
    );
    // nested output column keeps the turtle's name
    assert!(compiled.sql.contains("as \"by_origin\""), "{}", compiled.sql);
    // nested array-of-records in the output shape
    let nested = compiled
        .output_struct
        .fields
        .iter()
        .find(|f| f.identifier() == "by_origin")
        .unwrap();
    assert!(matches!(nested.kind, FieldKind::Join(_)));
}

#[test]
fn test_branched_fanout_synthesizes_distinct_keys() {
    let mut model_def = branched_model("duckdb");
    model_def.contents[0]
        .fields
        .push(sum_measure("total_amount", &["orders", "amount"]));
    model_def.contents[0].fields.push(FieldDef::measure(
        "event_count",
        Expr::Aggregate {
            function: AggregateFunction::Count,
            e: Box::new(Expr::Empty),
            struct_path: Some(vec!["events".to_string()]),
        },
    ));
    let model = QueryModel::new(model_def).unwrap();
    let query = Query::against(
        "users",
        vec![reduce(paths(&[
            &["name"],
            &["total_amount"],
            &["event_count"],
        ]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    // two one-to-many branches: no leafiest join anywhere, so the sum gets a
    // synthesized distinct key inside the join's subquery
    assert!(
        compiled.sql.contains("GEN_RANDOM_UUID() as \"__distinct_key\""),
        "{}",
        compiled.sql
    );
    assert!(
        compiled.sql.contains("UNNEST(list(distinct {key:"),
        "{}",
        compiled.sql
    );
    assert!(compiled.sql.contains("COUNT(DISTINCT "), "{}", compiled.sql);
}

#[test]
fn test_nested_sum_over_non_leafiest_join_uses_distinct_key() {
    let mut model_def = branched_model("duckdb");
    model_def.contents[0]
        .fields
        .push(sum_measure("total_amount", &["orders", "amount"]));
    model_def.contents[0].fields.push(FieldDef::measure(
        "event_count",
        Expr::Aggregate {
            function: AggregateFunction::Count,
            e: Box::new(Expr::Empty),
            struct_path: Some(vec!["events".to_string()]),
        },
    ));
    model_def.contents[0].fields.push(FieldDef {
        name: "by_status".to_string(),
        rename: None,
        kind: FieldKind::Turtle(TurtleDef::new(
            "by_status",
            vec![reduce(paths(&[
                &["orders", "status"],
                &["total_amount"],
            ]))],
        )),
        e: None,
        expression_type: ExpressionType::Scalar,
        code: None,
    });
    let model = QueryModel::new(model_def).unwrap();
    let query = Query::against(
        "users",
        vec![reduce(paths(&[
            &["name"],
            &["event_count"],
            &["by_status"],
        ]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    // both branches are referenced, so the orders join is not leafiest and
    // the nested sum must dedup through the synthesized key
    assert!(
        compiled.sql.contains("GEN_RANDOM_UUID() as \"__distinct_key\""),
        "{}",
        compiled.sql
    );
    assert!(
        compiled.sql.contains("orders_0.\"__distinct_key\""),
        "{}",
        compiled.sql
    );
    assert!(compiled.sql.contains("group_set=1"), "{}", compiled.sql);
}

#[test]
fn test_single_fanout_chain_keeps_natural_aggregation() {
    let mut model_def = branched_model("duckdb");
    model_def.contents[0]
        .fields
        .push(sum_measure("total_amount", &["orders", "amount"]));
    let model = QueryModel::new(model_def).unwrap();
    // only the orders branch is referenced, so it is leafiest and its sum
    // stays a natural SUM
    let query = Query::against(
        "users",
        vec![reduce(paths(&[&["name"], &["total_amount"]]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    assert!(!compiled.sql.contains("__distinct_key"), "{}", compiled.sql);
    assert!(compiled.sql.contains("COALESCE(SUM("), "{}", compiled.sql);
}

#[test]
fn test_cross_join_forces_symmetric_count() {
    let mut model_def = branched_model("duckdb");
    // make the orders join a cross join: everything must go symmetric
    for f in &mut model_def.contents[0].fields {
        if f.name == "orders"
            && let FieldKind::Join(def) = &mut f.kind
        {
            def.join.as_mut().unwrap().join = JoinType::Cross;
        }
    }
    let model = QueryModel::new(model_def).unwrap();
    let query = Query::against(
        "users",
        vec![reduce(paths(&[
            &["name"],
            &["orders", "status"],
            &["user_count"],
        ]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    // user_count counts the base table, but nothing is leafiest any more, so
    // the count dedups on the primary key
    assert!(
        compiled.sql.contains("COUNT(DISTINCT base.\"id\")"),
        "{}",
        compiled.sql
    );
}

#[test]
fn test_full_join_requires_dialect_support() {
    let mut model_def = branched_model("mysql");
    for f in &mut model_def.contents[0].fields {
        if f.name == "orders"
            && let FieldKind::Join(def) = &mut f.kind
        {
            def.join.as_mut().unwrap().matrix_operation = Some(MatrixOperation::Full);
        }
    }
    let model = QueryModel::new(model_def).unwrap();
    let query = Query::against(
        "users",
        vec![reduce(paths(&[&["name"], &["orders", "status"]]))],
    );
    match model.compile_query(&query) {
        Err(CompileError::FullJoinNotSupported(d)) => assert_eq!(d, "mysql"),
        other => panic!("expected full-join error, got {other:?}"),
    }
}

#[test]
fn test_index_weight_defaults_to_count_star() {
    let model = QueryModel::new(flights_model("duckdb")).unwrap();
    let query = Query::against(
        "flights",
        vec![PipeSegment::Index(IndexSegment {
            index_fields: vec![
                IndexFieldDef {
                    path: vec!["carrier".to_string()],
                },
                IndexFieldDef {
                    path: vec!["origin".to_string()],
                },
            ],
            weight_measure: None,
            sample: None,
            filter_list: Vec::new(),
            limit: None,
        })],
    );
    let compiled = model.compile_query(&query).unwrap();
    assert!(
        compiled.sql.contains("COUNT(*) as \"weight\""),
        "{}",
        compiled.sql
    );
    assert!(compiled.sql.contains("\"fieldName\""), "{}", compiled.sql);
    assert!(
        compiled.sql.contains("COALESCE(\"fieldValue\", \"fieldRange\")"),
        "{}",
        compiled.sql
    );
    // stable index output schema
    let names: Vec<&str> = compiled
        .output_struct
        .fields
        .iter()
        .map(|f| f.identifier())
        .collect();
    assert_eq!(
        names,
        vec!["fieldName", "fieldPath", "fieldValue", "fieldType", "weight"]
    );
}

#[test]
fn test_index_weight_measure_overrides_count() {
    let model = QueryModel::new(flights_model("duckdb")).unwrap();
    let query = Query::against(
        "flights",
        vec![PipeSegment::Index(IndexSegment {
            index_fields: vec![IndexFieldDef {
                path: vec!["carrier".to_string()],
            }],
            weight_measure: Some("flight_count".to_string()),
            sample: None,
            filter_list: Vec::new(),
            limit: None,
        })],
    );
    let compiled = model.compile_query(&query).unwrap();
    assert!(
        compiled.sql.contains("COUNT(1) as \"weight\""),
        "{}",
        compiled.sql
    );
}

#[test]
fn test_multi_segment_pipeline_chains_ctes() {
    let model = QueryModel::new(flights_model("duckdb")).unwrap();
    let query = Query::against(
        "flights",
        vec![
            reduce(paths(&[&["carrier"], &["flight_count"]])),
            PipeSegment::Project(QuerySegment {
                query_fields: paths(&[&["carrier"]]),
                ..QuerySegment::default()
            }),
        ],
    );
    let compiled = model.compile_query(&query).unwrap();
    assert!(
        compiled.sql.contains("WITH __stage0 AS ("),
        "{}",
        compiled.sql
    );
    assert!(compiled.sql.contains("FROM __stage0"), "{}", compiled.sql);
    assert_eq!(compiled.last_stage_name, "__stage1");
}

#[test]
fn test_turtle_pipeline_without_unnest_array_agg_goes_pipelined() {
    // standardsql cannot UNNEST(ARRAY_AGG(...)) inline, so a two-segment
    // turtle becomes a dedicated replacement stage instead
    let mut model_def = flights_model("standardsql");
    model_def.contents[0].fields.push(FieldDef {
        name: "top_origins".to_string(),
        rename: None,
        kind: FieldKind::Turtle(TurtleDef::new(
            "top_origins",
            vec![
                reduce(paths(&[&["origin"], &["flight_count"]])),
                PipeSegment::Project(QuerySegment {
                    query_fields: paths(&[&["origin"]]),
                    ..QuerySegment::default()
                }),
            ],
        )),
        e: None,
        expression_type: ExpressionType::Scalar,
        code: None,
    });
    let model = QueryModel::new(model_def).unwrap();
    let query = Query::against(
        "flights",
        vec![reduce(paths(&[&["carrier"], &["top_origins"]]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    assert!(
        compiled.sql.contains("SELECT * replace ("),
        "{}",
        compiled.sql
    );
    assert!(
        compiled.sql.contains("SELECT ARRAY((SELECT AS STRUCT"),
        "{}",
        compiled.sql
    );
}

#[test]
fn test_ungrouped_aggregate_excludes_compute_groups() {
    let mut model_def = flights_model("duckdb");
    model_def.contents[0].fields.push(FieldDef::measure(
        "all_flights",
        Expr::Ungroup {
            kind: model::expr::UngroupKind::All,
            e: Box::new(Expr::Aggregate {
                function: AggregateFunction::Count,
                e: Box::new(Expr::Empty),
                struct_path: None,
            }),
            fields: vec![],
        },
    ));
    let model = QueryModel::new(model_def).unwrap();
    let query = Query::against(
        "flights",
        vec![reduce(paths(&[&["carrier"], &["all_flights"]]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    assert!(
        compiled.sql.contains("group_set NOT IN (0)"),
        "{}",
        compiled.sql
    );
    assert!(compiled.sql.contains("MAX("), "{}", compiled.sql);
    assert!(compiled.sql.contains("OVER ("), "{}", compiled.sql);
}

#[test]
fn test_not_equal_dimension_is_null_total() {
    let mut model_def = flights_model("duckdb");
    model_def.contents[0].fields.push(FieldDef::dimension(
        "not_united",
        AtomicType::Boolean,
        Expr::binary(
            BinaryOp::NotEqual,
            Expr::field(&["carrier"]),
            Expr::string_literal("UA"),
        ),
    ));
    let model = QueryModel::new(model_def).unwrap();
    let query = Query::against(
        "flights",
        vec![reduce(paths(&[&["not_united"], &["flight_count"]]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    assert!(
        compiled.sql.contains("COALESCE(base.\"carrier\"!='UA',true)"),
        "{}",
        compiled.sql
    );
}

#[test]
fn test_function_call_expands_overload_body() {
    let mut overload_dialects = HashMap::new();
    overload_dialects.insert(
        "duckdb".to_string(),
        FunctionDialectDef::new(Expr::GenericSql {
            src: vec!["UPPER(".to_string(), ")".to_string()],
            args: vec![Expr::FunctionParameter {
                name: "value".to_string(),
            }],
        }),
    );
    let call = FunctionCall {
        name: "upper".to_string(),
        overload: FunctionOverloadDef {
            return_expression_type: ExpressionType::Scalar,
            is_symmetric: false,
            params: vec![FunctionParameterDef::value("value")],
            dialect: overload_dialects,
        },
        args: vec![Expr::field(&["carrier"])],
        order_by: vec![],
        limit: None,
        partition_by: vec![],
        struct_path: None,
    };
    let mut model_def = flights_model("duckdb");
    model_def.contents[0].fields.push(FieldDef::dimension(
        "carrier_upper",
        AtomicType::String,
        Expr::FunctionCall(call),
    ));
    let model = QueryModel::new(model_def).unwrap();
    let query = Query::against(
        "flights",
        vec![reduce(paths(&[&["carrier_upper"], &["flight_count"]]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    assert!(
        compiled.sql.contains("UPPER(base.\"carrier\")"),
        "{}",
        compiled.sql
    );
}

#[test]
fn test_function_call_missing_dialect_is_fatal() {
    let call = FunctionCall {
        name: "sketchy".to_string(),
        overload: FunctionOverloadDef {
            return_expression_type: ExpressionType::Scalar,
            is_symmetric: false,
            params: vec![],
            dialect: HashMap::new(),
        },
        args: vec![],
        order_by: vec![],
        limit: None,
        partition_by: vec![],
        struct_path: None,
    };
    let mut model_def = flights_model("duckdb");
    model_def.contents[0].fields.push(FieldDef::dimension(
        "sketchy",
        AtomicType::String,
        Expr::FunctionCall(call),
    ));
    let model = QueryModel::new(model_def).unwrap();
    let query = Query::against("flights", vec![reduce(paths(&[&["sketchy"]]))]);
    match model.compile_query(&query) {
        Err(CompileError::FunctionNotDefinedForDialect { function, dialect }) => {
            assert_eq!(function, "sketchy");
            assert_eq!(dialect, "duckdb");
        }
        other => panic!("expected function-not-defined, got {other:?}"),
    }
}

#[test]
fn test_filter_match_applies_parsed_predicate() {
    let model = QueryModel::new(flights_model("duckdb")).unwrap();
    let mut query = Query::against(
        "flights",
        vec![reduce(paths(&[&["carrier"], &["flight_count"]]))],
    );
    query.filter_list.push(model::expr::FilterCondition {
        e: Expr::FilterMatch {
            data_type: model::expr::FilterKind::String,
            e: Box::new(Expr::field(&["carrier"])),
            filter: Box::new(Expr::FilterLiteral {
                filter_src: "UA, DL".to_string(),
            }),
        },
        expression_type: ExpressionType::Scalar,
        code: Some("carrier ~ f'UA, DL'".to_string()),
    });
    let compiled = model.compile_query(&query).unwrap();
    assert!(
        compiled
            .sql
            .contains("WHERE base.\"carrier\" = 'UA' OR base.\"carrier\" = 'DL'"),
        "{}",
        compiled.sql
    );
}

#[test]
fn test_bad_filter_expression_surfaces_parser_diagnostic() {
    let model = QueryModel::new(flights_model("duckdb")).unwrap();
    let mut query = Query::against("flights", vec![reduce(paths(&[&["carrier"]]))]);
    query.filter_list.push(model::expr::FilterCondition {
        e: Expr::FilterMatch {
            data_type: model::expr::FilterKind::Number,
            e: Box::new(Expr::field(&["distance"])),
            filter: Box::new(Expr::FilterLiteral {
                filter_src: ">> nonsense".to_string(),
            }),
        },
        expression_type: ExpressionType::Scalar,
        code: None,
    });
    match model.compile_query(&query) {
        Err(CompileError::FilterParse(e)) => {
            assert!(format!("{e}").contains("expected"), "{e}");
        }
        other => panic!("expected filter parse error, got {other:?}"),
    }
}

#[test]
fn test_postgres_gets_a_final_stage() {
    let model = QueryModel::new(flights_model("postgres")).unwrap();
    let query = Query::against(
        "flights",
        vec![reduce(paths(&[&["carrier"], &["flight_count"]]))],
    );
    let compiled = model.compile_query(&query).unwrap();
    assert!(
        compiled.sql.contains("SELECT row_to_json(finalStage) as row FROM __stage0"),
        "{}",
        compiled.sql
    );
    assert_eq!(compiled.last_stage_name, "__stage1");
}

#[test]
fn test_query_source_resolves_output_fields() {
    let mut model_def = flights_model("duckdb");
    let inner = Query::against(
        "flights",
        vec![reduce(paths(&[&["carrier"], &["flight_count"]]))],
    );
    model_def.contents.push(StructDef {
        name: "carrier_facts".to_string(),
        kind: model::schema::StructKind::QuerySource {
            query: Box::new(inner),
        },
        fields: vec![],
        dialect: "duckdb".to_string(),
        connection: "duckdb".to_string(),
        primary_key: None,
        filter_list: vec![],
        join: None,
        e: None,
        parameters: HashMap::new(),
        arguments: HashMap::new(),
    });
    let model = QueryModel::new(model_def).unwrap();
    // fields of the inner query's output are addressable
    let query = Query {
        struct_ref: StructRef::Named("carrier_facts".to_string()),
        pipe_head: None,
        pipeline: vec![PipeSegment::Project(QuerySegment {
            query_fields: paths(&[&["carrier"], &["flight_count"]]),
            ..QuerySegment::default()
        })],
        filter_list: vec![],
        source_arguments: HashMap::new(),
        materialize: false,
    };
    let compiled = model.compile_query(&query).unwrap();
    // the inner query becomes an earlier CTE stage feeding the outer one
    assert!(compiled.sql.contains("WITH __stage0"), "{}", compiled.sql);
    assert!(compiled.sql.contains("FROM __stage0"), "{}", compiled.sql);
}
