//! Lowers parsed filter expressions to SQL booleans.
//!
//! This is the SQL half of the filter expression language; parsing lives in
//! the `filters` crate. Invoked only through the `filterMatch` expression
//! node and pipeline filter lists.

use crate::error::Result;
use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime};
use dialect::{Dialect, LikeOp, QueryInfo};
use filters::ast::{
    BooleanFilter, LiteralGrain, Moment, NumberFilter, NumberRangeOperator, StringFilter,
    TemporalFilter, TemporalUnit,
};
use filters::{
    parse_boolean_filter, parse_number_filter, parse_string_filter, parse_temporal_filter,
    FilterParseError,
};
use model::expr::{CastType, DeltaOp, FilterKind, TemporalType, TimestampUnit};

/// Parse and compile a filter source string against a target expression.
pub fn compile_filter_source(
    kind: FilterKind,
    filter_src: &str,
    x: &str,
    d: &dyn Dialect,
    qi: &QueryInfo,
) -> Result<String> {
    match kind {
        FilterKind::String => Ok(string_compile(&parse_string_filter(filter_src)?, x, d)),
        FilterKind::Number => Ok(number_compile(&parse_number_filter(filter_src)?, x, d)),
        FilterKind::Boolean => Ok(boolean_compile(&parse_boolean_filter(filter_src)?, x, d)),
        FilterKind::Date => {
            temporal_compile(&parse_temporal_filter(filter_src)?, x, d, TemporalType::Date, qi)
        }
        FilterKind::Timestamp => temporal_compile(
            &parse_temporal_filter(filter_src)?,
            x,
            d,
            TemporalType::Timestamp,
            qi,
        ),
    }
}

fn escape_for_like(v: &str) -> String {
    v.chars()
        .map(|c| match c {
            '%' | '_' | '\\' => format!("\\{c}"),
            _ => c.to_string(),
        })
        .collect()
}

fn unlike(disliked: Vec<String>, x: &str) -> String {
    let unlike_sql = if disliked.len() == 1 {
        disliked.into_iter().next().unwrap()
    } else {
        format!("({})", disliked.join(" AND "))
    };
    format!("({unlike_sql} OR {x} IS NULL)")
}

pub fn string_compile(sc: &StringFilter, x: &str, d: &dyn Dialect) -> String {
    match sc {
        StringFilter::Null { not } => {
            if *not {
                format!("{x} IS NOT NULL")
            } else {
                format!("{x} IS NULL")
            }
        }
        StringFilter::Empty { not } => {
            if *not {
                format!("COALESCE({x},'') != ''")
            } else {
                format!("COALESCE({x},'') = ''")
            }
        }
        StringFilter::Equals { values, not } => {
            if values.len() == 1 {
                let lit = d.sql_literal_string(&values[0]);
                if *not {
                    format!("({x} != {lit} OR {x} IS NULL)")
                } else {
                    format!("{x} = {lit}")
                }
            } else {
                let list = values
                    .iter()
                    .map(|v| d.sql_literal_string(v))
                    .collect::<Vec<_>>()
                    .join(", ");
                if *not {
                    format!("({x} NOT IN ({list}) OR {x} IS NULL)")
                } else {
                    format!("{x} IN ({list})")
                }
            }
        }
        StringFilter::Contains { values, not } => {
            like_patterns(values.iter().map(|v| format!("%{}%", escape_for_like(v))), x, d, *not)
        }
        StringFilter::Starts { values, not } => {
            like_patterns(values.iter().map(|v| format!("{}%", escape_for_like(v))), x, d, *not)
        }
        StringFilter::Ends { values, not } => {
            like_patterns(values.iter().map(|v| format!("%{}", escape_for_like(v))), x, d, *not)
        }
        StringFilter::Like {
            escaped_values,
            not,
        } => like_patterns(escaped_values.iter().cloned(), x, d, *not),
        StringFilter::Paren { expr, not } => {
            let wrapped = format!("({})", string_compile(expr, x, d));
            if *not {
                format!("not {wrapped}")
            } else {
                wrapped
            }
        }
        StringFilter::And { members } => members
            .iter()
            .map(|m| string_compile(m, x, d))
            .collect::<Vec<_>>()
            .join(" AND "),
        StringFilter::Or { members } => members
            .iter()
            .map(|m| string_compile(m, x, d))
            .collect::<Vec<_>>()
            .join(" OR "),
        StringFilter::Comma { members } => comma_compile(members, x, d),
    }
}

fn like_patterns(
    patterns: impl Iterator<Item = String>,
    x: &str,
    d: &dyn Dialect,
    not: bool,
) -> String {
    if not {
        unlike(
            patterns
                .map(|m| d.sql_like(LikeOp::NotLike, x, &m))
                .collect(),
            x,
        )
    } else {
        patterns
            .map(|m| d.sql_like(LikeOp::Like, x, &m))
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

/// The `,` combinator: (all included things OR'd) AND (all excluded things
/// AND'd). An item that is both included and excluded, directly or through
/// null/empty aliasing, makes the whole predicate false.
fn comma_compile(members: &[StringFilter], x: &str, d: &dyn Dialect) -> String {
    let mut includes: Vec<&StringFilter> = Vec::new();
    let mut excludes: Vec<&StringFilter> = Vec::new();
    let mut include_null = false;
    let mut exclude_null = false;
    let mut include_empty = false;
    let mut exclude_empty = false;
    for c in members {
        match c {
            StringFilter::Or { .. } | StringFilter::And { .. } | StringFilter::Comma { .. } => {
                includes.push(c);
            }
            StringFilter::Null { not } => {
                if *not {
                    exclude_null = true;
                } else {
                    include_null = true;
                }
            }
            StringFilter::Empty { not } => {
                if *not {
                    exclude_empty = true;
                    exclude_null = true;
                } else {
                    include_empty = true;
                    include_null = true;
                }
            }
            other => {
                if other.is_not() {
                    excludes.push(other);
                } else {
                    includes.push(other);
                }
            }
        }
    }
    if (include_empty && exclude_empty) || (include_null && exclude_null) {
        return "false".to_string();
    }
    let mut include_sql = String::new();
    if !includes.is_empty() || include_null || include_empty {
        exclude_empty = false;
        exclude_null = false;
        let mut include_exprs: Vec<String> =
            includes.iter().map(|inc| string_compile(inc, x, d)).collect();
        if include_empty {
            include_exprs.push(format!("{x} = ''"));
        }
        if include_null {
            include_exprs.push(format!("{x} IS NULL"));
        }
        include_sql = include_exprs.join(" OR ");
    }
    let mut exclude_sql = String::new();
    if !excludes.is_empty() || exclude_empty || exclude_null {
        let mut exclude_exprs: Vec<String> =
            excludes.iter().map(|exc| string_compile(exc, x, d)).collect();
        if exclude_empty {
            exclude_exprs.push(format!("{x} != ''"));
        }
        if exclude_null {
            exclude_exprs.push(format!("{x} IS NOT NULL"));
        }
        exclude_sql = exclude_exprs.join(" AND ");
    }
    if !include_sql.is_empty() {
        if !exclude_sql.is_empty() {
            format!("({include_sql}) AND ({exclude_sql})")
        } else {
            include_sql
        }
    } else if !exclude_sql.is_empty() {
        exclude_sql
    } else {
        "true".to_string()
    }
}

pub fn number_compile(nc: &NumberFilter, x: &str, d: &dyn Dialect) -> String {
    match nc {
        NumberFilter::Equals { values, not } => {
            let list = values.join(", ");
            if values.len() == 1 {
                if *not {
                    format!("({x} != {list} OR {x} IS NULL)")
                } else {
                    format!("{x} = {list}")
                }
            } else if *not {
                format!("({x} NOT IN ({list}) OR {x} IS NULL)")
            } else {
                format!("{x} IN ({list})")
            }
        }
        NumberFilter::Compare { op, values, not } => {
            let op = if *not { op.inverted() } else { *op };
            values
                .iter()
                .map(|v| format!("{x} {} {v}", op.sql()))
                .collect::<Vec<_>>()
                .join(if *not { " AND " } else { " OR " })
        }
        NumberFilter::Range {
            start_op,
            start_value,
            end_op,
            end_value,
            not,
        } => {
            let (start_op, end_op, plus) = if *not {
                (start_op.inverted(), end_op.inverted(), " OR ")
            } else {
                (*start_op, *end_op, " AND ")
            };
            format!(
                "{x} {} {start_value}{plus}{x} {} {end_value}",
                start_op.sql(),
                end_op.sql()
            )
        }
        NumberFilter::Null { not } => {
            if *not {
                format!("{x} IS NOT NULL")
            } else {
                format!("{x} IS NULL")
            }
        }
        NumberFilter::Paren { expr, not } => {
            let wrapped = format!("({})", number_compile(expr, x, d));
            if *not {
                format!("NOT {wrapped}")
            } else {
                wrapped
            }
        }
        NumberFilter::And { members } => members
            .iter()
            .map(|m| number_compile(m, x, d))
            .collect::<Vec<_>>()
            .join(" AND "),
        NumberFilter::Or { members } => members
            .iter()
            .map(|m| number_compile(m, x, d))
            .collect::<Vec<_>>()
            .join(" OR "),
    }
}

pub fn boolean_compile(bc: &BooleanFilter, x: &str, d: &dyn Dialect) -> String {
    let px = format!("({x})");
    match bc {
        BooleanFilter::EqTrue { not } => {
            if *not {
                format!("NOT {px}")
            } else {
                x.to_string()
            }
        }
        BooleanFilter::EqFalse { not } => {
            if *not {
                x.to_string()
            } else {
                format!("NOT {px}")
            }
        }
        BooleanFilter::Null { not } => {
            if *not {
                format!("{px} IS NOT NULL")
            } else {
                format!("{px} IS NULL")
            }
        }
        BooleanFilter::True { not } | BooleanFilter::False { not } => {
            let truthy = matches!(bc, BooleanFilter::True { .. }) != *not;
            // for a plain column reference a NULL check beats COALESCE
            let quote_char = d
                .sql_maybe_quote_identifier("select")
                .chars()
                .next()
                .unwrap_or('"');
            let is_column = !x.is_empty()
                && x.chars().all(|c| {
                    c.is_ascii_alphanumeric()
                        || c == '_'
                        || c == '.'
                        || c == '('
                        || c == ')'
                        || c == quote_char
                });
            if is_column {
                if truthy {
                    format!("{px} IS NOT NULL AND {px}")
                } else {
                    format!("{px} IS NULL OR {px} = false")
                }
            } else if truthy {
                format!("COALESCE({x}, false)")
            } else {
                format!("NOT COALESCE({x}, false)")
            }
        }
    }
}

fn to_timestamp_unit(u: TemporalUnit) -> TimestampUnit {
    match u {
        TemporalUnit::Second => TimestampUnit::Second,
        TemporalUnit::Minute => TimestampUnit::Minute,
        TemporalUnit::Hour => TimestampUnit::Hour,
        TemporalUnit::Day => TimestampUnit::Day,
        TemporalUnit::Week => TimestampUnit::Week,
        TemporalUnit::Month => TimestampUnit::Month,
        TemporalUnit::Quarter => TimestampUnit::Quarter,
        TemporalUnit::Year => TimestampUnit::Year,
    }
}

/// A moment expanded to SQL: the instant it begins and the instant the next
/// one begins. A momentary moment has `begin == end`.
struct MomentIs {
    begin: String,
    end: String,
}

pub fn temporal_compile(
    tc: &TemporalFilter,
    x: &str,
    d: &dyn Dialect,
    timetype: TemporalType,
    qi: &QueryInfo,
) -> Result<String> {
    let c = TemporalFilterCompiler {
        x: x.to_string(),
        d,
        timetype,
        qi,
    };
    c.compile(tc)
}

struct TemporalFilterCompiler<'a> {
    x: String,
    d: &'a dyn Dialect,
    timetype: TemporalType,
    qi: &'a QueryInfo,
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl<'a> TemporalFilterCompiler<'a> {
    fn compile(&self, tc: &TemporalFilter) -> Result<String> {
        let x = &self.x;
        match tc {
            TemporalFilter::After { moment, not } => {
                let m = self.moment(moment)?;
                let op = if *not { "<" } else { ">=" };
                Ok(format!("{x} {op} {}", self.time(&m.end)))
            }
            TemporalFilter::Before { moment, not } => {
                let m = self.moment(moment)?;
                let op = if *not { ">=" } else { "<" };
                Ok(format!("{x} {op} {}", self.time(&m.begin)))
            }
            TemporalFilter::In { moment, not } => {
                let m = self.moment(moment)?;
                if m.begin == m.end {
                    let end = self.time(&m.end);
                    return Ok(if *not {
                        format!("({x} != {end} OR {x} IS NULL)")
                    } else {
                        format!("{x} = {end}")
                    });
                }
                Ok(self.is_in(*not, &m.begin, &m.end))
            }
            TemporalFilter::For {
                begin,
                n,
                units,
                not,
            } => {
                let start = self.moment(begin)?;
                let end = self.delta(&start.begin, DeltaOp::Plus, n, *units);
                Ok(self.is_in(*not, &start.begin, &end))
            }
            TemporalFilter::InLast { n, units, not } => {
                // last N units means "N - 1 units ago for N units"
                let back = n.parse::<i64>().unwrap_or(1) - 1;
                let this_unit = self.now_dot(*units);
                let start = if back > 0 {
                    self.delta(&this_unit, DeltaOp::Minus, &back.to_string(), *units)
                } else {
                    this_unit.clone()
                };
                let end = self.delta(&this_unit, DeltaOp::Plus, "1", *units);
                Ok(self.is_in(*not, &start, &end))
            }
            TemporalFilter::Next { n, units, not } => {
                let this_unit = self.now_dot(*units);
                let start = self.delta(&this_unit, DeltaOp::Plus, "1", *units);
                let forward = n.parse::<i64>().unwrap_or(1) + 1;
                let end = self.delta(&this_unit, DeltaOp::Plus, &forward.to_string(), *units);
                Ok(self.is_in(*not, &start, &end))
            }
            TemporalFilter::To { from, to, not } => {
                let first = self.moment(from)?;
                let last = self.moment(to)?;
                Ok(self.is_in(*not, &first.begin, &last.begin))
            }
            TemporalFilter::Null { not } => Ok(if *not {
                format!("{x} IS NOT NULL")
            } else {
                format!("{x} IS NULL")
            }),
            TemporalFilter::Paren { expr, not } => {
                let wrapped = format!("({})", self.compile(expr)?);
                Ok(if *not {
                    format!("NOT {wrapped}")
                } else {
                    wrapped
                })
            }
            TemporalFilter::And { members } => Ok(members
                .iter()
                .map(|m| self.compile(m))
                .collect::<Result<Vec<_>>>()?
                .join(" AND ")),
            TemporalFilter::Or { members } => Ok(members
                .iter()
                .map(|m| self.compile(m))
                .collect::<Result<Vec<_>>>()?
                .join(" OR ")),
        }
    }

    /// Cast an expanded timestamp down to a date when filtering a date.
    fn time(&self, time_sql: &str) -> String {
        match self.timetype {
            TemporalType::Timestamp => time_sql.to_string(),
            TemporalType::Date => self.d.sql_cast(self.qi, time_sql, &CastType::Date, false),
        }
    }

    fn is_in(&self, not_in: bool, begin: &str, end: &str) -> String {
        let (beg_op, end_op, join_op) = if not_in {
            ("<", ">=", "OR")
        } else {
            (">=", "<", "AND")
        };
        let begin = self.time(begin);
        let end = self.time(end);
        format!(
            "{x} {beg_op} {begin} {join_op} {x} {end_op} {end}",
            x = self.x
        )
    }

    fn literal_sql(&self, dt: NaiveDateTime) -> String {
        self.d.sql_literal_time(
            self.qi,
            &dt.format(TIMESTAMP_FORMAT).to_string(),
            TemporalType::Timestamp,
            self.qi.query_timezone.as_deref(),
        )
    }

    fn now_sql(&self) -> String {
        self.d.sql_now()
    }

    fn now_dot(&self, units: TemporalUnit) -> String {
        self.d.sql_trunc(
            self.qi,
            &self.now_sql(),
            TemporalType::Timestamp,
            to_timestamp_unit(units),
        )
    }

    fn delta(&self, base: &str, op: DeltaOp, n: &str, units: TemporalUnit) -> String {
        self.d.sql_alter_time(
            op,
            base,
            TemporalType::Timestamp,
            n,
            to_timestamp_unit(units),
        )
    }

    fn this_unit(&self, units: TemporalUnit) -> MomentIs {
        let begin = self.now_dot(units);
        let end = self.delta(&begin, DeltaOp::Plus, "1", units);
        MomentIs { begin, end }
    }

    fn last_unit(&self, units: TemporalUnit) -> MomentIs {
        let this = self.now_dot(units);
        let begin = self.delta(&this, DeltaOp::Minus, "1", units);
        MomentIs { begin, end: this }
    }

    fn next_unit(&self, units: TemporalUnit) -> MomentIs {
        let this = self.now_dot(units);
        let begin = self.delta(&this, DeltaOp::Plus, "1", units);
        let end = self.delta(&this, DeltaOp::Plus, "2", units);
        MomentIs { begin, end }
    }

    fn moment(&self, m: &Moment) -> Result<MomentIs> {
        Ok(match m {
            Moment::Now => {
                let now = self.now_sql();
                MomentIs {
                    begin: now.clone(),
                    end: now,
                }
            }
            Moment::Today => self.this_unit(TemporalUnit::Day),
            Moment::Yesterday => self.last_unit(TemporalUnit::Day),
            Moment::Tomorrow => self.next_unit(TemporalUnit::Day),
            Moment::This(u) => self.this_unit(*u),
            Moment::LastUnit(u) => self.last_unit(*u),
            Moment::NextUnit(u) => self.next_unit(*u),
            Moment::Ago { n, units } => {
                let trunc = self.now_dot(*units);
                let begin = self.delta(&trunc, DeltaOp::Minus, n, *units);
                let back = n.parse::<i64>().unwrap_or(1);
                let end = if back == 1 {
                    trunc
                } else {
                    self.delta(&trunc, DeltaOp::Minus, &(back - 1).to_string(), *units)
                };
                MomentIs { begin, end }
            }
            Moment::FromNow { n, units } => {
                let trunc = self.now_dot(*units);
                let begin = self.delta(&trunc, DeltaOp::Plus, n, *units);
                let forward = n.parse::<i64>().unwrap_or(1);
                let end = self.delta(&trunc, DeltaOp::Plus, &(forward + 1).to_string(), *units);
                MomentIs { begin, end }
            }
            Moment::Literal { literal, grain } => self.expand_literal(literal, *grain)?,
        })
    }

    fn expand_literal(&self, literal: &str, grain: LiteralGrain) -> Result<MomentIs> {
        let bad = |why: &str| {
            crate::error::CompileError::FilterParse(FilterParseError::Syntax(format!(
                "bad temporal literal '{literal}': {why}"
            )))
        };
        let midnight = |date: NaiveDate| date.and_time(NaiveTime::MIN);
        let span = |begin: NaiveDateTime, end: NaiveDateTime| -> MomentIs {
            MomentIs {
                begin: self.literal_sql(begin),
                end: self.literal_sql(end),
            }
        };
        match grain {
            LiteralGrain::Year => {
                let y: i32 = literal.parse().map_err(|_| bad("not a year"))?;
                let begin = NaiveDate::from_ymd_opt(y, 1, 1).ok_or_else(|| bad("not a year"))?;
                let end = begin
                    .checked_add_months(Months::new(12))
                    .ok_or_else(|| bad("year out of range"))?;
                Ok(span(midnight(begin), midnight(end)))
            }
            LiteralGrain::Quarter => {
                let (y, q) = literal
                    .split_once("-Q")
                    .or_else(|| literal.split_once("-q"))
                    .ok_or_else(|| bad("not a quarter"))?;
                let y: i32 = y.parse().map_err(|_| bad("not a quarter"))?;
                let q: u32 = q.parse().map_err(|_| bad("not a quarter"))?;
                let begin = NaiveDate::from_ymd_opt(y, 3 * (q - 1) + 1, 1)
                    .ok_or_else(|| bad("not a quarter"))?;
                let end = begin
                    .checked_add_months(Months::new(3))
                    .ok_or_else(|| bad("quarter out of range"))?;
                Ok(span(midnight(begin), midnight(end)))
            }
            LiteralGrain::Month => {
                let begin = NaiveDate::parse_from_str(&format!("{literal}-01"), "%Y-%m-%d")
                    .map_err(|_| bad("not a month"))?;
                let end = begin
                    .checked_add_months(Months::new(1))
                    .ok_or_else(|| bad("month out of range"))?;
                Ok(span(midnight(begin), midnight(end)))
            }
            LiteralGrain::Week => {
                let date_part = literal.trim_end_matches("-WK");
                let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                    .map_err(|_| bad("not a week"))?;
                // weeks begin on Sunday
                let sunday = date
                    .checked_sub_days(Days::new(
                        date.weekday().num_days_from_sunday() as u64
                    ))
                    .ok_or_else(|| bad("week out of range"))?;
                let end = sunday
                    .checked_add_days(Days::new(7))
                    .ok_or_else(|| bad("week out of range"))?;
                Ok(span(midnight(sunday), midnight(end)))
            }
            LiteralGrain::Day => {
                let begin = NaiveDate::parse_from_str(literal, "%Y-%m-%d")
                    .map_err(|_| bad("not a day"))?;
                let end = begin
                    .checked_add_days(Days::new(1))
                    .ok_or_else(|| bad("day out of range"))?;
                Ok(span(midnight(begin), midnight(end)))
            }
            LiteralGrain::Minute => {
                let begin = NaiveDateTime::parse_from_str(literal, "%Y-%m-%d %H:%M")
                    .map_err(|_| bad("not a minute"))?;
                let end = begin + chrono::Duration::minutes(1);
                Ok(span(begin, end))
            }
            LiteralGrain::Second => {
                let begin = NaiveDateTime::parse_from_str(literal, TIMESTAMP_FORMAT)
                    .map_err(|_| bad("not a timestamp"))?;
                let sql = self.literal_sql(begin);
                Ok(MomentIs {
                    begin: sql.clone(),
                    end: sql,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialect::dialect_for_name;
    use pretty_assertions::assert_eq;

    fn duckdb() -> &'static dyn Dialect {
        dialect_for_name("duckdb").unwrap()
    }

    fn qi() -> QueryInfo {
        QueryInfo::default()
    }

    fn compile(kind: FilterKind, src: &str, x: &str) -> String {
        compile_filter_source(kind, src, x, duckdb(), &qi()).unwrap()
    }

    #[test]
    fn test_string_include_exclude_formula() {
        let sql = compile(FilterKind::String, "CA, NY, -TX", "base.state");
        assert_eq!(
            sql,
            "(base.state = 'CA' OR base.state = 'NY') AND ((base.state != 'TX' OR base.state IS NULL))"
        );
    }

    #[test]
    fn test_contradictory_null_inclusion_is_false() {
        assert_eq!(compile(FilterKind::String, "null, -null", "x"), "false");
        assert_eq!(compile(FilterKind::String, "empty, -empty", "x"), "false");
        // empty implies null, so including empty and excluding null
        // contradicts too
        assert_eq!(compile(FilterKind::String, "empty, -null", "x"), "false");
    }

    #[test]
    fn test_string_wildcards_compile_to_like() {
        assert_eq!(
            compile(FilterKind::String, "%boeing%", "base.manufacturer"),
            "base.manufacturer LIKE '%boeing%'"
        );
        assert_eq!(
            compile(FilterKind::String, "-%boeing%", "base.manufacturer"),
            "(base.manufacturer NOT LIKE '%boeing%' OR base.manufacturer IS NULL)"
        );
    }

    #[test]
    fn test_number_range() {
        assert_eq!(
            compile(FilterKind::Number, "[10 to 100)", "base.seats"),
            "base.seats >= 10 AND base.seats < 100"
        );
        assert_eq!(
            compile(FilterKind::Number, "not [10 to 100)", "base.seats"),
            "base.seats < 10 OR base.seats >= 100"
        );
    }

    #[test]
    fn test_boolean_column_null_handling() {
        assert_eq!(
            compile(FilterKind::Boolean, "true", "base.active"),
            "(base.active) IS NOT NULL AND (base.active)"
        );
        assert_eq!(
            compile(FilterKind::Boolean, "=true", "base.active"),
            "base.active"
        );
    }

    #[test]
    fn test_temporal_literal_month_interval() {
        let sql = compile(FilterKind::Timestamp, "2024-03", "base.dep_time");
        assert_eq!(
            sql,
            "base.dep_time >= TIMESTAMP '2024-03-01 00:00:00' AND base.dep_time < TIMESTAMP '2024-04-01 00:00:00'"
        );
    }

    #[test]
    fn test_temporal_date_target_casts_boundaries() {
        let sql = compile_filter_source(
            FilterKind::Date,
            "before 2024-03-07",
            "base.dep_date",
            duckdb(),
            &qi(),
        )
        .unwrap();
        assert_eq!(
            sql,
            "base.dep_date < CAST(TIMESTAMP '2024-03-07 00:00:00' AS DATE)"
        );
    }

    #[test]
    fn test_temporal_relative_uses_dialect_trunc() {
        let sql = compile(FilterKind::Timestamp, "last 3 days", "base.dep_time");
        assert!(sql.contains("DATE_TRUNC('day',CURRENT_TIMESTAMP)"));
        assert!(sql.contains("-INTERVAL (2) DAY"));
    }
}
