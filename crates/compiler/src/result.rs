//! The result-set model: which fields each pipeline stage produces, their
//! group-set numbering, and the join/having state accumulated while
//! compiling one query.
//!
//! Results form a tree (the root stage plus one node per nested turtle),
//! stored as an arena indexed by [`ResultId`].

use crate::error::{internal, CompileError, Result};
use crate::fields::{is_analytic, is_basic_aggregate, is_basic_scalar, is_scalar_field, is_temporal};
use crate::graph::{QueryGraph, StructId};
use crate::join::JoinInstance;
use crate::sql::{grouping_key, AndChain};
use model::expr::UngroupKind;
use model::pipeline::{OrderBy, OrderByTarget, OrderDirection, PipeSegment, TurtleDef};
use model::schema::{
    merge_unique_key_requirement, FieldDef, FieldKind, UniqueKeyRequirement,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultId(pub usize);

pub const ROOT_RESULT: ResultId = ResultId(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUsage {
    Result { result_index: usize },
    Where,
    Dependant,
}

impl FieldUsage {
    pub fn is_result(&self) -> bool {
        matches!(self, FieldUsage::Result { .. })
    }
}

/// A field slotted into a stage's output.
#[derive(Debug, Clone)]
pub struct FieldInstanceField {
    /// The struct the field is defined in (not the one referencing it).
    pub owner: StructId,
    pub def: FieldDef,
    pub usage: FieldUsage,
    /// Extra group sets this field participates in via ungroup partitions.
    pub additional_group_sets: Vec<u32>,
    /// Name to use inside window calculations, when it differs.
    pub analytical_sql: Option<String>,
    /// Name to use in a PARTITION BY, when it differs.
    pub partition_sql: Option<String>,
}

impl FieldInstanceField {
    pub fn new(owner: StructId, def: FieldDef, usage: FieldUsage) -> FieldInstanceField {
        FieldInstanceField {
            owner,
            def,
            usage,
            additional_group_sets: Vec::new(),
            analytical_sql: None,
            partition_sql: None,
        }
    }
}

#[derive(Debug)]
pub enum Slot {
    Field(FieldInstanceField),
    Query(ResultId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UngroupSet {
    pub kind: UngroupKind,
    pub group_set: u32,
}

/// How a nested turtle's rows are rendered into its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatedResultType {
    Nested,
    Inline,
    InlineAllNumbers,
}

#[derive(Debug)]
pub struct ResultNode {
    pub parent: Option<ResultId>,
    pub turtle: TurtleDef,
    pub fields: Vec<(String, Slot)>,
    pub group_set: u32,
    pub depth: usize,
    pub child_groups: Vec<u32>,
    pub has_having: bool,
    /// One per distinct ungrouping expression, keyed by `grouping_key`.
    pub ungrouped_sets: Vec<(String, UngroupSet, Vec<String>)>,
    pub result_uses_ungrouped: bool,
}

impl ResultNode {
    pub fn first_segment(&self) -> &PipeSegment {
        &self.turtle.pipeline[0]
    }

    pub fn get_limit(&self) -> Option<u64> {
        match self.first_segment() {
            PipeSegment::Reduce(q) | PipeSegment::Project(q) => q.limit,
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ResultTree {
    nodes: Vec<ResultNode>,
    pub joins: Vec<JoinInstance>,
    pub havings: AndChain,
    pub is_complex_query: bool,
    pub query_uses_partitioning: bool,
    pub compute_only_groups: Vec<u32>,
    pub eliminated_compute_groups: bool,
}

impl ResultTree {
    pub fn new(turtle: TurtleDef) -> ResultTree {
        ResultTree {
            nodes: vec![ResultNode {
                parent: None,
                turtle,
                fields: Vec::new(),
                group_set: 0,
                depth: 0,
                child_groups: Vec::new(),
                has_having: false,
                ungrouped_sets: Vec::new(),
                result_uses_ungrouped: false,
            }],
            joins: Vec::new(),
            havings: AndChain::new(),
            is_complex_query: false,
            query_uses_partitioning: false,
            compute_only_groups: Vec::new(),
            eliminated_compute_groups: false,
        }
    }

    pub fn node(&self, id: ResultId) -> &ResultNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: ResultId) -> &mut ResultNode {
        &mut self.nodes[id.0]
    }

    pub fn add_child_result(&mut self, parent: ResultId, turtle: TurtleDef) -> ResultId {
        let id = ResultId(self.nodes.len());
        self.nodes.push(ResultNode {
            parent: Some(parent),
            turtle,
            fields: Vec::new(),
            group_set: 0,
            depth: 0,
            child_groups: Vec::new(),
            has_having: false,
            ungrouped_sets: Vec::new(),
            result_uses_ungrouped: false,
        });
        id
    }

    pub fn attach(&mut self, parent: ResultId, name: String, child: ResultId) {
        self.nodes[parent.0].fields.push((name, Slot::Query(child)));
    }

    pub fn parent_group_set(&self, id: ResultId) -> u32 {
        match self.node(id).parent {
            Some(p) => self.node(p).group_set,
            None => 0,
        }
    }

    /// Innermost query timezone that applies to this result.
    pub fn query_timezone(&self, id: ResultId) -> Option<String> {
        let node = self.node(id);
        if let Some(q) = node.first_segment().query_segment()
            && let Some(tz) = &q.query_timezone
        {
            return Some(tz.clone());
        }
        node.parent.and_then(|p| self.query_timezone(p))
    }

    pub fn add_field(
        &mut self,
        id: ResultId,
        name: &str,
        field: FieldInstanceField,
    ) -> Result<()> {
        let node = &mut self.nodes[id.0];
        if let Some((_, slot)) = node.fields.iter().find(|(n, _)| n == name) {
            match slot {
                Slot::Query(_) => {
                    return Err(CompileError::Redefinition(name.to_string()));
                }
                Slot::Field(existing) => {
                    if existing.usage.is_result() {
                        if field.usage.is_result() {
                            return Err(CompileError::AmbiguousOutputName(name.to_string()));
                        }
                        // already in the result, nothing to do
                        return Ok(());
                    }
                }
            }
        }
        if let Some(slot) = node
            .fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
        {
            *slot = Slot::Field(field);
        } else {
            node.fields.push((name.to_string(), Slot::Field(field)));
        }
        Ok(())
    }

    pub fn has_field(&self, id: ResultId, name: &str) -> bool {
        matches!(
            self.node(id).fields.iter().find(|(n, _)| n == name),
            Some((_, Slot::Field(_)))
        )
    }

    pub fn get_field(&self, id: ResultId, name: &str) -> Result<&FieldInstanceField> {
        match self.node(id).fields.iter().find(|(n, _)| n == name) {
            Some((_, Slot::Field(f))) => Ok(f),
            Some((_, Slot::Query(_))) => Err(internal(format!("can't use a query here {name}"))),
            None => Err(internal(format!("field not defined {name}"))),
        }
    }

    pub fn get_field_mut(&mut self, id: ResultId, name: &str) -> Result<&mut FieldInstanceField> {
        match self.nodes[id.0].fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, Slot::Field(f))) => Ok(f),
            _ => Err(internal(format!("field not defined {name}"))),
        }
    }

    /// Resolve a 1-based output column index to its field.
    pub fn get_field_by_number(
        &self,
        id: ResultId,
        index: usize,
    ) -> Result<(&str, &FieldInstanceField)> {
        for (name, slot) in &self.node(id).fields {
            if let Slot::Field(f) = slot
                && f.usage == (FieldUsage::Result { result_index: index })
            {
                return Ok((name, f));
            }
        }
        Err(CompileError::UnknownOrderByIndex(index))
    }

    /// All field instances of a node, with their output names.
    pub fn fields(&self, id: ResultId) -> impl Iterator<Item = (&str, &FieldInstanceField)> {
        self.node(id).fields.iter().filter_map(|(n, s)| match s {
            Slot::Field(f) => Some((n.as_str(), f)),
            Slot::Query(_) => None,
        })
    }

    /// Nested results of a node.
    pub fn structs(&self, id: ResultId) -> Vec<ResultId> {
        self.node(id)
            .fields
            .iter()
            .filter_map(|(_, s)| match s {
                Slot::Query(q) => Some(*q),
                _ => None,
            })
            .collect()
    }

    /// Pre-order selection of result nodes matching a predicate.
    pub fn select_structs(&self, id: ResultId, f: &impl Fn(&ResultNode) -> bool) -> Vec<ResultId> {
        let mut out = Vec::new();
        self.select_structs_into(id, f, &mut out);
        out
    }

    fn select_structs_into(
        &self,
        id: ResultId,
        f: &impl Fn(&ResultNode) -> bool,
        out: &mut Vec<ResultId>,
    ) {
        if f(self.node(id)) {
            out.push(id);
        }
        for child in self.structs(id) {
            self.select_structs_into(child, f, out);
        }
    }

    /// Depth-first group-set numbering: every result (plus one set per
    /// distinct ungrouping partition) gets a unique integer, nested turtles
    /// receiving successively larger ids.
    pub fn compute_groups(
        &mut self,
        id: ResultId,
        mut next: u32,
        depth: usize,
    ) -> (u32, usize, Vec<u32>, bool) {
        if next == 0 && self.node(id).result_uses_ungrouped {
            self.compute_only_groups.push(next);
            next += 1;
        }
        for i in 0..self.nodes[id.0].ungrouped_sets.len() {
            self.nodes[id.0].ungrouped_sets[i].1.group_set = next;
            self.compute_only_groups.push(next);
            next += 1;
        }

        self.nodes[id.0].group_set = next;
        self.nodes[id.0].depth = depth;
        next += 1;

        let mut max_depth = depth;
        let mut is_complex = false;
        let mut children = vec![self.nodes[id.0].group_set];
        for child in self.structs(id) {
            is_complex = true;
            if self.node(child).first_segment().is_reduce() {
                let (n, d, mut kids, _) = self.compute_groups(child, next, depth + 1);
                next = n;
                children.append(&mut kids);
                max_depth = max_depth.max(d);
            }
        }
        self.nodes[id.0].child_groups = children.clone();
        (next, max_depth, children, is_complex)
    }

    /// Absent an explicit order-by: first temporal or aggregate result field
    /// descending, else the first plain field ascending.
    pub fn calculate_default_order_by(&self, id: ResultId) -> Vec<OrderBy> {
        let mut first_field = None;
        for (_, f) in self.fields(id) {
            if let FieldUsage::Result { result_index } = f.usage {
                if matches!(f.def.kind, FieldKind::Turtle(_) | FieldKind::Join(_))
                    || is_analytic(&f.def)
                {
                    continue;
                }
                first_field.get_or_insert(result_index);
                if is_temporal(&f.def) || is_basic_aggregate(&f.def) {
                    return vec![OrderBy {
                        field: OrderByTarget::Index(result_index),
                        dir: Some(OrderDirection::Desc),
                    }];
                }
            }
        }
        match first_field {
            Some(index) => vec![OrderBy {
                field: OrderByTarget::Index(index),
                dir: Some(OrderDirection::Asc),
            }],
            None => Vec::new(),
        }
    }

    /// All-measure turtles come back as a single record; anything with a
    /// scalar dimension must repeat.
    pub fn get_repeated_result_type(&self, id: ResultId) -> RepeatedResultType {
        let mut ret = RepeatedResultType::InlineAllNumbers;
        for (_, f) in self.fields(id) {
            if f.usage.is_result() {
                if is_basic_scalar(&f.def) {
                    return RepeatedResultType::Nested;
                }
                if matches!(f.def.kind, FieldKind::Join(_)) {
                    ret = RepeatedResultType::Inline;
                }
            }
        }
        ret
    }

    pub fn record_ungrouped_set(&mut self, id: ResultId, kind: UngroupKind, fields: Vec<String>) {
        let key = grouping_key(kind, &fields);
        let node = &mut self.nodes[id.0];
        node.result_uses_ungrouped = true;
        if !node.ungrouped_sets.iter().any(|(k, _, _)| *k == key) {
            node.ungrouped_sets
                .push((key, UngroupSet { kind, group_set: 0 }, fields));
        }
    }

    pub fn find_ungrouped_set(
        &self,
        id: ResultId,
        kind: UngroupKind,
        fields: &[String],
    ) -> Option<(UngroupSet, Vec<String>)> {
        let key = grouping_key(kind, fields);
        self.node(id)
            .ungrouped_sets
            .iter()
            .find(|(k, _, _)| *k == key)
            .map(|(_, s, f)| (*s, f.clone()))
    }

    /// The partition fields for an ungrouped calculation: scalars of this
    /// result and its ancestors, minus the ungrouped dimensions.
    pub fn get_ungroup_partitions(
        &self,
        id: ResultId,
        ungroup: Option<(&UngroupSet, &[String])>,
    ) -> Result<Vec<(ResultId, String)>> {
        let mut ret: Vec<(ResultId, String)> = Vec::new();
        let mut in_scope: Vec<String> = Vec::new();
        let (kind, named_fields): (Option<UngroupKind>, Vec<String>) = match ungroup {
            Some((set, fields)) => (Some(set.kind), fields.to_vec()),
            None => (None, Vec::new()),
        };

        let exclude_fields: Vec<String> = if kind.is_none() || kind == Some(UngroupKind::All) {
            // all() with names keeps those names grouped; everything else at
            // this level becomes the exclusion set
            self.fields(id)
                .filter(|(_, f)| {
                    is_basic_scalar(&f.def)
                        && f.usage.is_result()
                        && !named_fields.contains(&f.def.identifier().to_string())
                })
                .map(|(_, f)| f.def.identifier().to_string())
                .collect()
        } else {
            named_fields.clone()
        };

        let mut p = Some(id);
        let mut first_scope = true;
        while let Some(pid) = p {
            if first_scope || kind == Some(UngroupKind::Exclude) {
                in_scope.extend(
                    self.fields(pid)
                        .filter(|(_, f)| is_scalar_field(&f.def) && f.usage.is_result())
                        .map(|(_, f)| f.def.identifier().to_string()),
                );
            }
            for (name, f) in self.fields(pid) {
                if is_scalar_field(&f.def)
                    && f.usage.is_result()
                    && !exclude_fields.contains(&f.def.identifier().to_string())
                {
                    ret.push((pid, name.to_string()));
                }
            }
            p = self.node(pid).parent;
            first_scope = false;
        }

        for field_name in &named_fields {
            if !in_scope.contains(field_name) {
                return Err(CompileError::UngroupFieldNotInScope {
                    kind: match kind {
                        Some(UngroupKind::Exclude) => "exclude",
                        _ => "all",
                    },
                    name: field_name.clone(),
                });
            }
        }
        Ok(ret)
    }

    /// After numbering, tag each partition field with the ungroup sets it
    /// participates in.
    pub fn assign_fields_to_groups(&mut self, id: ResultId) -> Result<()> {
        let sets: Vec<(UngroupSet, Vec<String>)> = self.nodes[id.0]
            .ungrouped_sets
            .iter()
            .map(|(_, s, f)| (*s, f.clone()))
            .collect();
        for (set, fields) in sets {
            let partitions = self.get_ungroup_partitions(id, Some((&set, &fields)))?;
            for (pid, name) in partitions {
                self.get_field_mut(pid, &name)?
                    .additional_group_sets
                    .push(set.group_set);
            }
        }
        for child in self.structs(id) {
            self.assign_fields_to_groups(child)?;
        }
        Ok(())
    }

    /// Immediately after stage 0 the groups used only for ungroup
    /// calculations are dropped; this must happen exactly once.
    pub fn eliminate_compute_groups_sql(&mut self) -> String {
        if self.eliminated_compute_groups || self.compute_only_groups.is_empty() {
            String::new()
        } else {
            self.eliminated_compute_groups = true;
            format!(
                "group_set NOT IN ({})",
                self.compute_only_groups
                    .iter()
                    .map(|g| g.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            )
        }
    }

    pub fn join_index(&self, alias: &str) -> Option<usize> {
        self.joins.iter().position(|j| j.alias == alias)
    }

    pub fn join_by_alias(&self, alias: &str) -> Result<&JoinInstance> {
        self.join_index(alias)
            .map(|i| &self.joins[i])
            .ok_or_else(|| CompileError::JoinNotFound(alias.to_string()))
    }

    /// Add a struct to the join graph, joining its parents first so SQL
    /// emission order is deterministic.
    pub fn add_struct_to_join(
        &mut self,
        graph: &QueryGraph,
        sid: StructId,
        requirement: Option<UniqueKeyRequirement>,
    ) -> Result<()> {
        let name = graph.identifier(sid)?;
        if let Some(idx) = self.join_index(&name) {
            self.joins[idx].unique_key_requirement = merge_unique_key_requirement(
                self.joins[idx].unique_key_requirement,
                requirement,
            );
            return Ok(());
        }

        let mut parent_idx = None;
        if let Some(parent) = graph.node(sid).parent {
            let parent_struct = graph.joinable_parent(parent);
            self.add_struct_to_join(graph, parent_struct, None)?;
            parent_idx = self.join_index(&graph.identifier(parent_struct)?);
        }

        if self.join_index(&name).is_none() {
            let idx = self.joins.len();
            self.joins.push(JoinInstance::new(sid, name.clone(), parent_idx));
            if let Some(p) = parent_idx {
                self.joins[p].children.push(idx);
            }
        }
        let idx = self.join_index(&name).expect("join just added");
        self.joins[idx].unique_key_requirement =
            merge_unique_key_requirement(self.joins[idx].unique_key_requirement, requirement);
        Ok(())
    }

    /// Decide which single join (if any) may use natural aggregation, then
    /// mark every join that must synthesize a distinct key.
    pub fn calculate_symmetric_aggregates(&mut self, graph: &QueryGraph) -> Result<()> {
        use crate::join::ParentRelationship as Rel;

        #[derive(Clone, Copy, PartialEq)]
        enum Leafiest {
            Unset,
            Never,
            Join(usize),
        }

        let mut leafiest = Leafiest::Unset;
        for idx in 0..self.joins.len() {
            let rel = self.joins[idx].parent_relationship(graph)?;
            if rel == Rel::ManyToMany || self.joins[idx].force_all_symmetric_calculations(graph) {
                leafiest = Leafiest::Never;
            } else if leafiest == Leafiest::Unset {
                leafiest = Leafiest::Join(idx);
            } else if rel == Rel::OneToMany {
                // only an unbranched one-to-many chain can extend leafiest
                let current = match leafiest {
                    Leafiest::Join(i) => Some(i),
                    _ => None,
                };
                let parent = graph.node(self.joins[idx].struct_id).parent;
                match (current, parent) {
                    (Some(l), Some(p)) if graph.identifier(p)? == self.joins[l].alias => {
                        leafiest = Leafiest::Join(idx);
                    }
                    _ => leafiest = Leafiest::Never,
                }
            }
        }
        for (idx, join) in self.joins.iter_mut().enumerate() {
            join.leafiest = leafiest == Leafiest::Join(idx);
        }

        // nested unique keys depend on the primary key of the parent chain
        for idx in 0..self.joins.len() {
            let join = &self.joins[idx];
            let needs_key = (join.leafiest
                && join.parent.is_some()
                && join.unique_key_requirement.is_some_and(|r| r.is_count))
                || (!join.leafiest && join.unique_key_requirement.is_some());
            if needs_key {
                let mut j = Some(idx);
                while let Some(ji) = j {
                    if graph.primary_key(self.joins[ji].struct_id).is_none() {
                        self.joins[ji].make_unique_key = true;
                    }
                    j = if graph.node(self.joins[ji].struct_id).is_array() {
                        self.joins[ji].parent
                    } else {
                        None
                    };
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::pipeline::QuerySegment;

    fn reduce_turtle(name: &str) -> TurtleDef {
        TurtleDef::new(name, vec![PipeSegment::Reduce(QuerySegment::default())])
    }

    fn field(name: &str, usage: FieldUsage) -> FieldInstanceField {
        FieldInstanceField::new(crate::graph::ROOT, FieldDef::string(name), usage)
    }

    #[test]
    fn test_group_sets_are_disjoint() {
        let mut tree = ResultTree::new(reduce_turtle("q"));
        let by_carrier = tree.add_child_result(ROOT_RESULT, reduce_turtle("by_carrier"));
        tree.attach(ROOT_RESULT, "by_carrier".to_string(), by_carrier);
        let by_origin = tree.add_child_result(ROOT_RESULT, reduce_turtle("by_origin"));
        tree.attach(ROOT_RESULT, "by_origin".to_string(), by_origin);

        let (next, max_depth, children, is_complex) =
            tree.compute_groups(ROOT_RESULT, 0, 0);
        assert_eq!(next, 3);
        assert_eq!(max_depth, 1);
        assert!(is_complex);
        assert_eq!(children, vec![0, 1, 2]);
        let mut seen = vec![
            tree.node(ROOT_RESULT).group_set,
            tree.node(by_carrier).group_set,
            tree.node(by_origin).group_set,
        ];
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_ungroup_sets_are_compute_only() {
        let mut tree = ResultTree::new(reduce_turtle("q"));
        tree.record_ungrouped_set(ROOT_RESULT, UngroupKind::All, vec![]);
        let (next, _, _, _) = tree.compute_groups(ROOT_RESULT, 0, 0);
        assert_eq!(next, 3);
        // group 0 for the root total, group 1 for the all() partition
        assert_eq!(tree.compute_only_groups, vec![0, 1]);
        assert_eq!(tree.node(ROOT_RESULT).group_set, 2);
        assert_eq!(
            tree.eliminate_compute_groups_sql(),
            "group_set NOT IN (0,1)"
        );
        assert_eq!(tree.eliminate_compute_groups_sql(), "");
    }

    #[test]
    fn test_duplicate_result_field_is_ambiguous() {
        let mut tree = ResultTree::new(reduce_turtle("q"));
        tree.add_field(
            ROOT_RESULT,
            "carrier",
            field("carrier", FieldUsage::Result { result_index: 1 }),
        )
        .unwrap();
        let err = tree
            .add_field(
                ROOT_RESULT,
                "carrier",
                field("carrier", FieldUsage::Result { result_index: 2 }),
            )
            .unwrap_err();
        assert!(matches!(err, CompileError::AmbiguousOutputName(_)));
        // a where-usage re-add of a result field is silently kept
        tree.add_field(ROOT_RESULT, "carrier", field("carrier", FieldUsage::Where))
            .unwrap();
    }

    #[test]
    fn test_default_order_by_prefers_measures_descending() {
        let mut tree = ResultTree::new(reduce_turtle("q"));
        tree.add_field(
            ROOT_RESULT,
            "carrier",
            field("carrier", FieldUsage::Result { result_index: 1 }),
        )
        .unwrap();
        let mut count = FieldDef::measure(
            "flight_count",
            model::expr::Expr::Aggregate {
                function: model::expr::AggregateFunction::Count,
                e: Box::new(model::expr::Expr::Empty),
                struct_path: None,
            },
        );
        count.rename = None;
        tree.add_field(
            ROOT_RESULT,
            "flight_count",
            FieldInstanceField::new(
                crate::graph::ROOT,
                count,
                FieldUsage::Result { result_index: 2 },
            ),
        )
        .unwrap();
        let ob = tree.calculate_default_order_by(ROOT_RESULT);
        assert_eq!(
            ob,
            vec![OrderBy {
                field: OrderByTarget::Index(2),
                dir: Some(OrderDirection::Desc),
            }]
        );
    }
}
