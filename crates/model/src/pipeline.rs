//! Pipelines: the segments a query or turtle is made of.

use crate::expr::FilterCondition;
use crate::schema::{FieldDef, Parameter, StructDef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn sql(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderByTarget {
    /// Order by an output field name.
    Name(String),
    /// Order by a 1-based output column index.
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: OrderByTarget,
    pub dir: Option<OrderDirection>,
}

/// Sampling request for index sources.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    Enable(bool),
    Rows(u64),
    Percent(f64),
}

/// A field requested by a query segment: a reference into the source
/// namespace or an inline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFieldDef {
    FieldRef { path: Vec<String> },
    Def(Box<FieldDef>),
}

impl QueryFieldDef {
    pub fn path(p: &[&str]) -> QueryFieldDef {
        QueryFieldDef::FieldRef {
            path: p.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A grouping or projection stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuerySegment {
    pub query_fields: Vec<QueryFieldDef>,
    pub filter_list: Vec<FilterCondition>,
    pub order_by: Option<Vec<OrderBy>>,
    pub limit: Option<u64>,
    /// Declarations added to the source for the duration of this stage.
    pub extend_source: Vec<FieldDef>,
    pub query_timezone: Option<String>,
}

/// A search-index build stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexSegment {
    pub index_fields: Vec<IndexFieldDef>,
    pub weight_measure: Option<String>,
    pub sample: Option<Sampling>,
    pub filter_list: Vec<FilterCondition>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFieldDef {
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeSegment {
    Reduce(QuerySegment),
    Project(QuerySegment),
    Index(IndexSegment),
    /// Pass the source struct's literal SQL straight through.
    Raw,
}

impl PipeSegment {
    pub fn query_segment(&self) -> Option<&QuerySegment> {
        match self {
            PipeSegment::Reduce(q) | PipeSegment::Project(q) => Some(q),
            _ => None,
        }
    }

    pub fn filter_list(&self) -> &[FilterCondition] {
        match self {
            PipeSegment::Reduce(q) | PipeSegment::Project(q) => &q.filter_list,
            PipeSegment::Index(i) => &i.filter_list,
            PipeSegment::Raw => &[],
        }
    }

    pub fn limit(&self) -> Option<u64> {
        match self {
            PipeSegment::Reduce(q) | PipeSegment::Project(q) => q.limit,
            PipeSegment::Index(i) => i.limit,
            PipeSegment::Raw => None,
        }
    }

    pub fn is_reduce(&self) -> bool {
        matches!(self, PipeSegment::Reduce(_))
    }

    pub fn is_project(&self) -> bool {
        matches!(self, PipeSegment::Project(_))
    }
}

/// A named pipeline: the compilable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurtleDef {
    pub name: String,
    pub pipeline: Vec<PipeSegment>,
}

impl TurtleDef {
    pub fn new(name: &str, pipeline: Vec<PipeSegment>) -> TurtleDef {
        TurtleDef {
            name: name.to_string(),
            pipeline,
        }
    }
}

/// How a query names its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructRef {
    Named(String),
    Inline(Box<StructDef>),
}

/// A compilation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub struct_ref: StructRef,
    /// Run an existing named turtle of the source before `pipeline`.
    pub pipe_head: Option<String>,
    pub pipeline: Vec<PipeSegment>,
    pub filter_list: Vec<FilterCondition>,
    pub source_arguments: HashMap<String, Parameter>,
    /// Persist this query as a derived table when referenced as a source.
    pub materialize: bool,
}

impl Query {
    pub fn against(source: &str, pipeline: Vec<PipeSegment>) -> Query {
        Query {
            struct_ref: StructRef::Named(source.to_string()),
            pipe_head: None,
            pipeline,
            filter_list: Vec::new(),
            source_arguments: HashMap::new(),
            materialize: false,
        }
    }
}

/// The model handed to the compiler: named sources.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelDef {
    pub contents: Vec<StructDef>,
}
