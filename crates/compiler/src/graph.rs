//! The schema graph: an arena of struct nodes built from a `StructDef` tree.
//!
//! Nodes reference each other by index instead of back-pointers; the graph is
//! immutable once built, except for the lazily-populated alias map. One graph
//! is built per query compilation and discarded with it.

use crate::error::{internal, CompileError, Result};
use dialect::{dialect_for_name, Dialect};
use model::schema::{FieldDef, FieldKind, Parameter, StructDef, StructKind};
use model::pipeline::TurtleDef;
use std::cell::RefCell;
use std::collections::HashMap;

pub const DISTINCT_KEY: &str = "__distinct_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructId(pub usize);

/// How a name resolves inside a struct's namespace.
#[derive(Debug, Clone)]
pub enum NodeField {
    Atomic(FieldDef),
    Join(StructId),
    Turtle(TurtleDef),
}

#[derive(Debug)]
pub struct StructNode {
    pub parent: Option<StructId>,
    pub def: StructDef,
    /// Namespace in insertion order; identifiers are unique per struct.
    pub fields: Vec<(String, NodeField)>,
    pub arguments: HashMap<String, Parameter>,
}

impl StructNode {
    pub fn child(&self, name: &str) -> Option<&NodeField> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    pub fn is_record(&self) -> bool {
        matches!(self.def.kind, StructKind::Record)
    }

    pub fn is_array(&self) -> bool {
        matches!(self.def.kind, StructKind::Array { .. })
    }
}

/// An atomic field resolved to its defining struct. Owns its definition so
/// that synthesized fields (timeframe truncations) resolve like any other.
#[derive(Debug, Clone)]
pub struct AtomicRef {
    pub owner: StructId,
    pub def: FieldDef,
}

#[derive(Debug, Clone)]
pub enum FieldRef {
    Atomic(AtomicRef),
    Join { owner: StructId, id: StructId },
    Turtle { owner: StructId, def: TurtleDef },
}

impl FieldRef {
    pub fn as_atomic(self, path: &[String]) -> Result<AtomicRef> {
        match self {
            FieldRef::Atomic(a) => Ok(a),
            _ => Err(CompileError::NotScalar(path.join("."))),
        }
    }
}

fn timeframe_from_name(name: &str) -> Option<model::expr::TimestampUnit> {
    use model::expr::TimestampUnit::*;
    Some(match name {
        "second" => Second,
        "minute" => Minute,
        "hour" => Hour,
        "day" => Day,
        "week" => Week,
        "month" => Month,
        "quarter" => Quarter,
        "year" => Year,
        _ => return None,
    })
}

/// Clone a temporal field at a requested truncation, wrapping its base
/// expression in a `trunc` node.
fn truncated_child(def: &FieldDef, unit: model::expr::TimestampUnit) -> Option<FieldDef> {
    use model::expr::{Expr, TemporalType};
    use model::schema::AtomicType;
    let (temporal_type, new_atomic) = match def.atomic_type()? {
        AtomicType::Date { .. } => (
            TemporalType::Date,
            AtomicType::Date {
                timeframe: Some(unit),
            },
        ),
        AtomicType::Timestamp { .. } => (
            TemporalType::Timestamp,
            AtomicType::Timestamp {
                timeframe: Some(unit),
            },
        ),
        _ => return None,
    };
    let base = def.e.clone().unwrap_or(Expr::Field {
        path: vec![def.name.clone()],
    });
    let mut child = def.clone();
    child.kind = FieldKind::Atomic(new_atomic);
    child.rename = Some(format!("{}_{}", def.identifier(), unit.sql().to_lowercase()));
    child.e = Some(Expr::Trunc {
        e: Box::new(base),
        temporal_type,
        units: unit,
    });
    Some(child)
}

pub struct QueryGraph {
    nodes: Vec<StructNode>,
    dialect: &'static dyn Dialect,
    connection_name: String,
    /// Full output path to allocated SQL alias.
    alias_map: RefCell<HashMap<String, String>>,
}

impl std::fmt::Debug for QueryGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryGraph")
            .field("nodes", &self.nodes)
            .field("connection_name", &self.connection_name)
            .field("alias_map", &self.alias_map)
            .finish_non_exhaustive()
    }
}

pub const ROOT: StructId = StructId(0);

fn identifier_normalize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_string()
            } else {
                "_o_".to_string()
            }
        })
        .collect()
}

impl QueryGraph {
    pub fn build(def: StructDef, source_arguments: &HashMap<String, Parameter>) -> Result<QueryGraph> {
        if !def.kind.is_source() {
            return Err(internal("root struct must be a source"));
        }
        let dialect = dialect_for_name(&def.dialect)?;
        let mut graph = QueryGraph {
            nodes: Vec::new(),
            dialect,
            connection_name: def.connection.clone(),
            alias_map: RefCell::new(HashMap::new()),
        };
        graph.add_node(None, def, Some(source_arguments))?;
        Ok(graph)
    }

    fn add_node(
        &mut self,
        parent: Option<StructId>,
        def: StructDef,
        source_arguments: Option<&HashMap<String, Parameter>>,
    ) -> Result<StructId> {
        let id = StructId(self.nodes.len());

        // parameters supply defaults, arguments override them
        let mut arguments: HashMap<String, Parameter> = def.parameters.clone();
        for (name, arg) in &def.arguments {
            arguments.insert(name.clone(), arg.clone());
        }
        if let Some(args) = source_arguments {
            for (name, arg) in args {
                arguments.insert(name.clone(), arg.clone());
            }
        }

        self.nodes.push(StructNode {
            parent,
            def: def.clone(),
            fields: Vec::new(),
            arguments,
        });

        let mut fields: Vec<(String, NodeField)> = Vec::new();
        let mut has_distinct_key = false;
        for field in &def.fields {
            let name = field.identifier().to_string();
            if fields.iter().any(|(n, _)| *n == name) {
                return Err(CompileError::Redefinition(name));
            }
            has_distinct_key |= name == DISTINCT_KEY;
            let node_field = match &field.kind {
                FieldKind::Atomic(_) => NodeField::Atomic(field.clone()),
                FieldKind::Turtle(turtle) => NodeField::Turtle(turtle.clone()),
                FieldKind::Join(struct_def) => {
                    let child = self.add_node(Some(id), struct_def.clone(), None)?;
                    NodeField::Join(child)
                }
            };
            fields.push((name, node_field));
        }
        if !has_distinct_key {
            fields.push((
                DISTINCT_KEY.to_string(),
                NodeField::Atomic(FieldDef::string(DISTINCT_KEY)),
            ));
        }
        self.nodes[id.0].fields = fields;
        Ok(id)
    }

    pub fn node(&self, id: StructId) -> &StructNode {
        &self.nodes[id.0]
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// Resolve a dotted path, walking through joined structs. A temporal
    /// field followed by a timeframe name (`dep_time.month`) resolves to an
    /// on-demand truncation child. The error names the first missing segment.
    pub fn field_by_name(&self, from: StructId, path: &[String]) -> Result<FieldRef> {
        if path.is_empty() {
            return Err(internal("empty field path"));
        }
        let not_found = |segment: &str| {
            let context = if path.len() > 1 {
                format!(" in {}", path.join("."))
            } else {
                String::new()
            };
            CompileError::FieldNotFound {
                name: segment.to_string(),
                context,
            }
        };
        let mut look_in = Some(from);
        let mut found: Option<(StructId, &NodeField)> = None;
        let mut segments = path.iter().enumerate();
        for (i, segment) in &mut segments {
            let owner = look_in.ok_or_else(|| {
                // a temporal field may still have a truncation request behind it
                not_found(segment)
            });
            let owner = match owner {
                Ok(owner) => owner,
                Err(e) => {
                    if let (Some((prev_owner, NodeField::Atomic(def))), Some(unit)) =
                        (found, timeframe_from_name(segment))
                        && i == path.len() - 1
                        && let Some(child) = truncated_child(def, unit)
                    {
                        return Ok(FieldRef::Atomic(AtomicRef {
                            owner: prev_owner,
                            def: child,
                        }));
                    }
                    return Err(e);
                }
            };
            match self.node(owner).child(segment) {
                Some(field) => {
                    found = Some((owner, field));
                    look_in = match field {
                        NodeField::Join(id) => Some(*id),
                        _ => None,
                    };
                }
                None => return Err(not_found(segment)),
            }
        }
        let (owner, field) = found.expect("non-empty path resolved");
        Ok(match field {
            NodeField::Atomic(def) => FieldRef::Atomic(AtomicRef {
                owner,
                def: def.clone(),
            }),
            NodeField::Join(id) => FieldRef::Join { owner, id: *id },
            NodeField::Turtle(def) => FieldRef::Turtle {
                owner,
                def: def.clone(),
            },
        })
    }

    /// Resolve a path that must end at a joined struct; an empty path is the
    /// starting struct itself.
    pub fn struct_by_path(&self, from: StructId, path: &[String]) -> Result<StructId> {
        if path.is_empty() {
            return Ok(from);
        }
        match self.field_by_name(from, path)? {
            FieldRef::Join { id, .. } => Ok(id),
            _ => Err(CompileError::NotScalar(path.join("."))),
        }
    }

    /// Walk up through inline records to the nearest physically-joinable
    /// struct.
    pub fn joinable_parent(&self, id: StructId) -> StructId {
        let mut current = id;
        while self.node(current).is_record() {
            match self.node(current).parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// The dotted model path of this struct, with a trailing dot.
    pub fn full_output_name(&self, id: StructId) -> String {
        match self.node(id).parent {
            Some(parent) => format!(
                "{}{}.",
                self.full_output_name(parent),
                self.node(id).def.name
            ),
            None => String::new(),
        }
    }

    /// A collision-free SQL alias for this struct's join path.
    pub fn alias_identifier(&self, id: StructId) -> Result<String> {
        let path = self.full_output_name(id);
        if let Some(alias) = self.alias_map.borrow().get(&path) {
            return Ok(alias.clone());
        }
        let base = identifier_normalize(&self.node(id).def.name);
        let mut map = self.alias_map.borrow_mut();
        let mut n = 0;
        loop {
            let candidate = format!("{base}_{n}");
            if !map.values().any(|v| *v == candidate) {
                map.insert(path, candidate.clone());
                return Ok(candidate);
            }
            n += 1;
            if n >= 1000 {
                return Err(CompileError::AliasOverflow(base));
            }
        }
    }

    /// The name this struct is addressed by in generated SQL.
    pub fn identifier(&self, id: StructId) -> Result<String> {
        let node = self.node(id);
        if node.parent.is_none() && node.def.kind.is_source() {
            return Ok("base".to_string());
        }
        if node.is_record() {
            if node.def.e.is_some() {
                return Err(internal(format!(
                    "record field '{}' alias not pre-computed",
                    node.def.name
                )));
            }
            if let Some(parent) = node.parent {
                return self.sql_child_reference_plain(parent, &node.def.name);
            }
        }
        self.alias_identifier(id)
    }

    /// Like [`QueryGraph::identifier`] but with the row-numbered addressing
    /// some dialects need for unnested arrays.
    pub fn sql_identifier(&self, id: StructId) -> Result<String> {
        let node = self.node(id);
        if self.dialect.unnest_with_numbers() && node.is_array() {
            if let Some(parent) = node.parent {
                return Ok(format!(
                    "{}.{}[{}.__row_id]",
                    self.sql_identifier(parent)?,
                    node.def.name,
                    self.identifier(id)?
                ));
            }
        }
        self.identifier(id)
    }

    /// Dialect reference to a child of this struct, without expression
    /// expansion (computed records are handled by the expression compiler).
    pub fn sql_child_reference_plain(&self, id: StructId, name: &str) -> Result<String> {
        let parent_ref = self.sql_identifier(id)?;
        let child_type = match self.node(id).child(name) {
            Some(NodeField::Atomic(def)) => def.type_name(),
            Some(NodeField::Join(_)) => "record",
            Some(NodeField::Turtle(_)) => "turtle",
            None => "unknown",
        };
        Ok(self.dialect.sql_field_reference(
            &parent_ref,
            self.reference_type(id),
            name,
            child_type,
        ))
    }

    pub fn reference_type(&self, id: StructId) -> dialect::FieldReferenceType {
        use model::schema::ElementType;
        match &self.node(id).def.kind {
            StructKind::Record => dialect::FieldReferenceType::Record,
            StructKind::Array { element } => match element {
                ElementType::Record => dialect::FieldReferenceType::ArrayRecord,
                ElementType::Scalar(_) => dialect::FieldReferenceType::ArrayScalar,
            },
            StructKind::NestSource { .. } => dialect::FieldReferenceType::NestSource,
            _ => dialect::FieldReferenceType::Table,
        }
    }

    /// The primary key field of a struct, when declared.
    pub fn primary_key(&self, id: StructId) -> Option<AtomicRef> {
        let node = self.node(id);
        if !node.def.kind.is_source() {
            return None;
        }
        let pk = node.def.primary_key.as_ref()?;
        match node.child(pk) {
            Some(NodeField::Atomic(def)) => Some(AtomicRef {
                owner: id,
                def: def.clone(),
            }),
            _ => None,
        }
    }

    /// The struct whose distinct key detects fan-out duplication: records
    /// delegate to their parent.
    pub fn distinct_key_owner(&self, id: StructId) -> Result<StructId> {
        let mut current = id;
        while self.node(current).is_record() {
            match self.node(current).parent {
                Some(parent) => current = parent,
                None => {
                    return Err(internal("record struct cannot supply a distinct key"));
                }
            }
        }
        Ok(current)
    }

    /// Look up a source argument, walking outward through enclosing structs.
    pub fn argument<'g>(&'g self, from: StructId, name: &str) -> Option<&'g Parameter> {
        let mut current = Some(from);
        while let Some(id) = current {
            if let Some(arg) = self.node(id).arguments.get(name) {
                return Some(arg);
            }
            current = self.node(id).parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::schema::AtomicType;

    fn flights() -> StructDef {
        let mut def = StructDef::table("flights", "airlines.flights", "duckdb", "duckdb");
        def.fields.push(FieldDef::string("carrier"));
        def.fields.push(FieldDef::string("origin"));
        let mut carriers = StructDef::table("carriers", "airlines.carriers", "duckdb", "duckdb");
        carriers.fields.push(FieldDef::string("code"));
        carriers.fields.push(FieldDef::string("nickname"));
        def.fields.push(FieldDef {
            name: "carriers".to_string(),
            rename: None,
            kind: FieldKind::Join(carriers),
            e: None,
            expression_type: Default::default(),
            code: None,
        });
        def
    }

    #[test]
    fn test_path_resolution_walks_joins() {
        let graph = QueryGraph::build(flights(), &HashMap::new()).unwrap();
        let f = graph
            .field_by_name(ROOT, &["carriers".to_string(), "nickname".to_string()])
            .unwrap();
        match f {
            FieldRef::Atomic(a) => {
                assert_eq!(a.def.name, "nickname");
                assert_ne!(a.owner, ROOT);
            }
            other => panic!("expected atomic, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_segment_is_named() {
        let graph = QueryGraph::build(flights(), &HashMap::new()).unwrap();
        let err = graph
            .field_by_name(ROOT, &["carriers".to_string(), "color".to_string()])
            .unwrap_err();
        match err {
            CompileError::FieldNotFound { name, .. } => assert_eq!(name, "color"),
            other => panic!("wrong error {other:?}"),
        }
    }

    #[test]
    fn test_root_is_base_and_joins_get_aliases() {
        let graph = QueryGraph::build(flights(), &HashMap::new()).unwrap();
        assert_eq!(graph.identifier(ROOT).unwrap(), "base");
        let join = graph
            .struct_by_path(ROOT, &["carriers".to_string()])
            .unwrap();
        assert_eq!(graph.identifier(join).unwrap(), "carriers_0");
        // stable on re-request
        assert_eq!(graph.identifier(join).unwrap(), "carriers_0");
    }

    #[test]
    fn test_every_struct_gets_a_distinct_key() {
        let graph = QueryGraph::build(flights(), &HashMap::new()).unwrap();
        assert!(graph.node(ROOT).child(DISTINCT_KEY).is_some());
        let join = graph
            .struct_by_path(ROOT, &["carriers".to_string()])
            .unwrap();
        assert!(graph.node(join).child(DISTINCT_KEY).is_some());
    }

    #[test]
    fn test_duplicate_field_is_redefinition() {
        let mut def = flights();
        def.fields.push(FieldDef::atomic("carrier", AtomicType::String));
        match QueryGraph::build(def, &HashMap::new()) {
            Err(CompileError::Redefinition(name)) => assert_eq!(name, "carrier"),
            other => panic!("expected redefinition, got {other:?}"),
        }
    }
}
