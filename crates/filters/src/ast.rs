//! ASTs for the four filter sub-languages.
//!
//! These trees are produced by parsing and consumed by the SQL lowering in
//! the compiler crate; they carry no SQL of their own.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringFilter {
    Null { not: bool },
    Empty { not: bool },
    Equals { values: Vec<String>, not: bool },
    Contains { values: Vec<String>, not: bool },
    Starts { values: Vec<String>, not: bool },
    Ends { values: Vec<String>, not: bool },
    /// A raw LIKE pattern; values are ready-to-use patterns with literal
    /// `%`/`_` backslash-escaped and wildcards left raw.
    Like { escaped_values: Vec<String>, not: bool },
    Paren { expr: Box<StringFilter>, not: bool },
    And { members: Vec<StringFilter> },
    Or { members: Vec<StringFilter> },
    /// The `,` combinator: include/exclude set semantics.
    Comma { members: Vec<StringFilter> },
}

impl StringFilter {
    pub fn negated(self) -> StringFilter {
        match self {
            StringFilter::Null { not } => StringFilter::Null { not: !not },
            StringFilter::Empty { not } => StringFilter::Empty { not: !not },
            StringFilter::Equals { values, not } => StringFilter::Equals { values, not: !not },
            StringFilter::Contains { values, not } => StringFilter::Contains { values, not: !not },
            StringFilter::Starts { values, not } => StringFilter::Starts { values, not: !not },
            StringFilter::Ends { values, not } => StringFilter::Ends { values, not: !not },
            StringFilter::Like {
                escaped_values,
                not,
            } => StringFilter::Like {
                escaped_values,
                not: !not,
            },
            StringFilter::Paren { expr, not } => StringFilter::Paren { expr, not: !not },
            other => StringFilter::Paren {
                expr: Box::new(other),
                not: true,
            },
        }
    }

    pub fn is_not(&self) -> bool {
        match self {
            StringFilter::Null { not }
            | StringFilter::Empty { not }
            | StringFilter::Equals { not, .. }
            | StringFilter::Contains { not, .. }
            | StringFilter::Starts { not, .. }
            | StringFilter::Ends { not, .. }
            | StringFilter::Like { not, .. }
            | StringFilter::Paren { not, .. } => *not,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumberRangeOperator {
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
}

impl NumberRangeOperator {
    pub fn sql(&self) -> &'static str {
        match self {
            NumberRangeOperator::Greater => ">",
            NumberRangeOperator::Less => "<",
            NumberRangeOperator::GreaterOrEqual => ">=",
            NumberRangeOperator::LessOrEqual => "<=",
        }
    }

    pub fn inverted(&self) -> NumberRangeOperator {
        match self {
            NumberRangeOperator::Greater => NumberRangeOperator::LessOrEqual,
            NumberRangeOperator::Less => NumberRangeOperator::GreaterOrEqual,
            NumberRangeOperator::GreaterOrEqual => NumberRangeOperator::Less,
            NumberRangeOperator::LessOrEqual => NumberRangeOperator::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberFilter {
    Equals {
        values: Vec<String>,
        not: bool,
    },
    Compare {
        op: NumberRangeOperator,
        values: Vec<String>,
        not: bool,
    },
    Range {
        start_op: NumberRangeOperator,
        start_value: String,
        end_op: NumberRangeOperator,
        end_value: String,
        not: bool,
    },
    Null {
        not: bool,
    },
    Paren {
        expr: Box<NumberFilter>,
        not: bool,
    },
    And {
        members: Vec<NumberFilter>,
    },
    Or {
        members: Vec<NumberFilter>,
    },
}

impl NumberFilter {
    pub fn negated(self) -> NumberFilter {
        match self {
            NumberFilter::Equals { values, not } => NumberFilter::Equals { values, not: !not },
            NumberFilter::Compare { op, values, not } => NumberFilter::Compare {
                op,
                values,
                not: !not,
            },
            NumberFilter::Range {
                start_op,
                start_value,
                end_op,
                end_value,
                not,
            } => NumberFilter::Range {
                start_op,
                start_value,
                end_op,
                end_value,
                not: !not,
            },
            NumberFilter::Null { not } => NumberFilter::Null { not: !not },
            NumberFilter::Paren { expr, not } => NumberFilter::Paren { expr, not: !not },
            other => NumberFilter::Paren {
                expr: Box::new(other),
                not: true,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BooleanFilter {
    True { not: bool },
    False { not: bool },
    EqTrue { not: bool },
    EqFalse { not: bool },
    Null { not: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

/// The grain a temporal literal was written at; decides the width of the
/// implied interval (`2024-03` covers the whole month).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiteralGrain {
    Year,
    Quarter,
    Month,
    Week,
    Day,
    Minute,
    Second,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Moment {
    Now,
    Today,
    Yesterday,
    Tomorrow,
    This(TemporalUnit),
    LastUnit(TemporalUnit),
    NextUnit(TemporalUnit),
    Ago { n: String, units: TemporalUnit },
    FromNow { n: String, units: TemporalUnit },
    Literal { literal: String, grain: LiteralGrain },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalFilter {
    After {
        moment: Moment,
        not: bool,
    },
    Before {
        moment: Moment,
        not: bool,
    },
    In {
        moment: Moment,
        not: bool,
    },
    For {
        begin: Moment,
        n: String,
        units: TemporalUnit,
        not: bool,
    },
    InLast {
        n: String,
        units: TemporalUnit,
        not: bool,
    },
    Next {
        n: String,
        units: TemporalUnit,
        not: bool,
    },
    To {
        from: Moment,
        to: Moment,
        not: bool,
    },
    Null {
        not: bool,
    },
    Paren {
        expr: Box<TemporalFilter>,
        not: bool,
    },
    And {
        members: Vec<TemporalFilter>,
    },
    Or {
        members: Vec<TemporalFilter>,
    },
}

impl TemporalFilter {
    pub fn negated(self) -> TemporalFilter {
        match self {
            TemporalFilter::After { moment, not } => TemporalFilter::After { moment, not: !not },
            TemporalFilter::Before { moment, not } => TemporalFilter::Before { moment, not: !not },
            TemporalFilter::In { moment, not } => TemporalFilter::In { moment, not: !not },
            TemporalFilter::For {
                begin,
                n,
                units,
                not,
            } => TemporalFilter::For {
                begin,
                n,
                units,
                not: !not,
            },
            TemporalFilter::InLast { n, units, not } => TemporalFilter::InLast {
                n,
                units,
                not: !not,
            },
            TemporalFilter::Next { n, units, not } => TemporalFilter::Next {
                n,
                units,
                not: !not,
            },
            TemporalFilter::To { from, to, not } => TemporalFilter::To { from, to, not: !not },
            TemporalFilter::Null { not } => TemporalFilter::Null { not: !not },
            TemporalFilter::Paren { expr, not } => TemporalFilter::Paren { expr, not: !not },
            other => TemporalFilter::Paren {
                expr: Box::new(other),
                not: true,
            },
        }
    }
}

/// A parsed filter of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterExpression {
    String(StringFilter),
    Number(NumberFilter),
    Boolean(BooleanFilter),
    Temporal(TemporalFilter),
}
