//! One entry per distinct joinable struct in a query's join graph.

use crate::error::{internal, Result};
use crate::graph::{QueryGraph, StructId};
use dialect::DialectField;
use model::schema::{JoinType, MatrixOperation, StructKind, UniqueKeyRequirement};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRelationship {
    Root,
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

#[derive(Debug)]
pub struct JoinInstance {
    pub struct_id: StructId,
    pub alias: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub leafiest: bool,
    pub make_unique_key: bool,
    pub unique_key_requirement: Option<UniqueKeyRequirement>,
}

impl JoinInstance {
    pub fn new(struct_id: StructId, alias: String, parent: Option<usize>) -> JoinInstance {
        JoinInstance {
            struct_id,
            alias,
            parent,
            children: Vec::new(),
            leafiest: false,
            make_unique_key: false,
            unique_key_requirement: None,
        }
    }

    pub fn parent_relationship(&self, graph: &QueryGraph) -> Result<ParentRelationship> {
        let node = graph.node(self.struct_id);
        if node.parent.is_none() {
            return Ok(ParentRelationship::Root);
        }
        Ok(match &node.def.kind {
            StructKind::Record => ParentRelationship::OneToOne,
            StructKind::Array { .. } => ParentRelationship::OneToMany,
            _ => match node.def.join.as_ref().map(|j| j.join) {
                Some(JoinType::One) => ParentRelationship::ManyToOne,
                Some(JoinType::Many) => ParentRelationship::OneToMany,
                Some(JoinType::Cross) => ParentRelationship::ManyToMany,
                None => {
                    return Err(internal(format!(
                        "unknown relationship to parent for '{}'",
                        node.def.name
                    )));
                }
            },
        })
    }

    /// Outer joins can produce rows on either side, so nothing downstream of
    /// one may use natural aggregation.
    pub fn force_all_symmetric_calculations(&self, graph: &QueryGraph) -> bool {
        matches!(
            graph
                .node(self.struct_id)
                .def
                .join
                .as_ref()
                .and_then(|j| j.matrix_operation),
            Some(MatrixOperation::Full) | Some(MatrixOperation::Right)
        )
    }

    /// The physical fields a dialect needs named to unnest this struct.
    pub fn dialect_field_list(&self, graph: &QueryGraph) -> Vec<DialectField> {
        graph
            .node(self.struct_id)
            .def
            .fields
            .iter()
            .filter(|f| f.is_physical())
            .map(|f| DialectField {
                type_name: f.type_name().to_string(),
                sql_expression: f.identifier().to_string(),
                sql_output_name: f.identifier().to_string(),
                raw_name: f.identifier().to_string(),
            })
            .collect()
    }
}
