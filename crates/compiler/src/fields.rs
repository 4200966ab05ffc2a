//! Field classification helpers.
//!
//! The result-set model and stage writer constantly need to know whether a
//! field is a plain dimension, a measure, or an analytic calculation; these
//! predicates keep those decisions in one place.

use model::schema::{FieldDef, FieldKind};

/// An atomic field whose expression computes row-by-row.
pub fn is_scalar_field(def: &FieldDef) -> bool {
    matches!(def.kind, FieldKind::Atomic(_)) && !def.expression_type.is_calculation()
}

/// An atomic, scalar, non-analytic field (a dimension).
pub fn is_basic_scalar(def: &FieldDef) -> bool {
    matches!(def.kind, FieldKind::Atomic(_)) && def.expression_type.is_scalar()
}

/// An atomic aggregate (a measure).
pub fn is_basic_aggregate(def: &FieldDef) -> bool {
    matches!(def.kind, FieldKind::Atomic(_)) && def.expression_type.is_aggregate()
}

/// An atomic aggregate or analytic: anything needing grouped evaluation.
pub fn is_basic_calculation(def: &FieldDef) -> bool {
    matches!(def.kind, FieldKind::Atomic(_)) && def.expression_type.is_calculation()
}

pub fn is_analytic(def: &FieldDef) -> bool {
    def.expression_type.is_analytic()
}

pub fn is_temporal(def: &FieldDef) -> bool {
    def.atomic_type().is_some_and(|t| t.is_temporal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::expr::{AggregateFunction, Expr, ExpressionType};

    #[test]
    fn test_measure_is_calculation_not_scalar() {
        let m = FieldDef::measure(
            "flight_count",
            Expr::Aggregate {
                function: AggregateFunction::Count,
                e: Box::new(Expr::Empty),
                struct_path: None,
            },
        );
        assert!(is_basic_aggregate(&m));
        assert!(is_basic_calculation(&m));
        assert!(!is_basic_scalar(&m));
        assert!(!is_scalar_field(&m));
    }

    #[test]
    fn test_analytic_is_calculation_but_not_aggregate() {
        let mut f = FieldDef::number("row");
        f.expression_type = ExpressionType::Analytic;
        assert!(is_basic_calculation(&f));
        assert!(!is_basic_aggregate(&f));
        assert!(is_analytic(&f));
    }
}
