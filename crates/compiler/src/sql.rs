//! Small SQL-assembly helpers shared across the compiler.

use model::expr::{Expr, UngroupKind};

/// Indent every line of a SQL fragment by one level.
pub fn indent(sql: &str) -> String {
    sql.lines()
        .map(|line| format!("  {line}\n"))
        .collect::<Vec<_>>()
        .join("")
}

/// Wrap an expression so it only applies to the given group sets.
pub fn case_group(group_sets: &[u32], s: &str) -> String {
    if group_sets.is_empty() {
        s.to_string()
    } else if group_sets.len() == 1 {
        format!("CASE WHEN group_set={} THEN\n  {s}\n  END", group_sets[0])
    } else {
        format!(
            "CASE WHEN group_set IN ({}) THEN\n  {s}\n  END",
            group_sets
                .iter()
                .map(|g| g.to_string())
                .collect::<Vec<_>>()
                .join(",")
        )
    }
}

/// Key identifying one distinct ungrouping partition within a result.
pub fn grouping_key(kind: UngroupKind, fields: &[String]) -> String {
    format!("{}:{}", kind.keyword(), fields.join(","))
}

/// A conjunction of SQL boolean clauses, built up incrementally.
#[derive(Debug, Clone, Default)]
pub struct AndChain {
    clauses: Vec<String>,
}

impl AndChain {
    pub fn new() -> AndChain {
        AndChain::default()
    }

    pub fn with(initial: Option<&str>) -> AndChain {
        let mut chain = AndChain::new();
        if let Some(sql) = initial {
            chain.add(sql);
        }
        chain
    }

    pub fn add(&mut self, clause: impl Into<String>) {
        let clause = clause.into();
        if !clause.is_empty() {
            self.clauses.push(clause);
        }
    }

    pub fn add_chain(&mut self, other: AndChain) {
        self.clauses.extend(other.clauses);
    }

    pub fn empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn present(&self) -> bool {
        !self.empty()
    }

    pub fn sql(&self) -> String {
        self.clauses.join(" AND ")
    }

    pub fn sql_or(&self) -> String {
        self.clauses.join(" OR ")
    }

    /// The whole chain as a `WHERE`/`HAVING` clause, or nothing.
    pub fn clause(&self, keyword: &str) -> String {
        if self.empty() {
            String::new()
        } else {
            format!("{} {}\n", keyword.to_uppercase(), self.sql())
        }
    }
}

/// Context threaded by value through expression compilation. Branches clone
/// and override one field at a time, so sibling branches never see each
/// other's state.
#[derive(Debug, Clone, Default)]
pub struct GenerateState {
    pub where_sql: Option<String>,
    /// Threaded for compatibility; nothing reads it today.
    pub apply_value: Option<String>,
    pub total_group_set: Option<u32>,
}

impl GenerateState {
    pub fn with_where(&self, sql: Option<String>) -> GenerateState {
        GenerateState {
            where_sql: sql,
            apply_value: self.apply_value.clone(),
            total_group_set: self.total_group_set,
        }
    }

    pub fn with_apply(&self, value: String) -> GenerateState {
        GenerateState {
            where_sql: self.where_sql.clone(),
            apply_value: Some(value),
            total_group_set: self.total_group_set,
        }
    }

    pub fn with_total(&self, group_set: u32) -> GenerateState {
        GenerateState {
            where_sql: self.where_sql.clone(),
            apply_value: self.apply_value.clone(),
            total_group_set: Some(group_set),
        }
    }
}

/// One piece of a generic SQL expression under assembly.
pub enum SqlPart {
    Str(String),
    Expr(Expr),
}

/// Build a `GenericSql` expression from interleaved strings and
/// sub-expressions, keeping the one-string-per-argument-slot invariant.
pub fn compose_generic_sql(parts: Vec<SqlPart>) -> Expr {
    let mut src: Vec<String> = Vec::new();
    let mut args: Vec<Expr> = Vec::new();
    let mut current = String::new();
    for part in parts {
        match part {
            SqlPart::Str(s) => current.push_str(&s),
            SqlPart::Expr(e) => {
                src.push(std::mem::take(&mut current));
                args.push(e);
            }
        }
    }
    src.push(current);
    Expr::GenericSql { src, args }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_chain_clause() {
        let mut chain = AndChain::new();
        assert_eq!(chain.clause("where"), "");
        chain.add("a=1");
        chain.add("b=2");
        assert_eq!(chain.clause("where"), "WHERE a=1 AND b=2\n");
        assert_eq!(chain.sql_or(), "a=1 OR b=2");
    }

    #[test]
    fn test_case_group_single_and_many() {
        assert_eq!(case_group(&[], "x"), "x");
        assert_eq!(case_group(&[3], "x"), "CASE WHEN group_set=3 THEN\n  x\n  END");
        assert_eq!(
            case_group(&[1, 2], "x"),
            "CASE WHEN group_set IN (1,2) THEN\n  x\n  END"
        );
    }

    #[test]
    fn test_generate_state_branches_are_independent() {
        let base = GenerateState::default();
        let with_where = base.with_where(Some("x>1".to_string()));
        let with_total = with_where.with_total(4);
        assert_eq!(base.where_sql, None);
        assert_eq!(with_where.total_group_set, None);
        assert_eq!(with_total.where_sql.as_deref(), Some("x>1"));
        assert_eq!(with_total.total_group_set, Some(4));
    }

    #[test]
    fn test_compose_generic_sql_slots() {
        let e = compose_generic_sql(vec![
            SqlPart::Str("ROUND(".to_string()),
            SqlPart::Expr(Expr::field(&["x"])),
            SqlPart::Str(", 2)".to_string()),
        ]);
        match e {
            Expr::GenericSql { src, args } => {
                assert_eq!(src, vec!["ROUND(".to_string(), ", 2)".to_string()]);
                assert_eq!(args.len(), 1);
            }
            _ => panic!("expected GenericSql"),
        }
    }
}
