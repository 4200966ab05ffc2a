//! Parsers from filter source text to the ASTs in [`crate::ast`].

use crate::ast::*;
use crate::FilterParseError;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "grammar/filters.pest"]
pub struct FilterParser;

pub fn parse_string_filter(src: &str) -> Result<StringFilter, FilterParseError> {
    let mut pairs = FilterParser::parse(Rule::string_filter, src)
        .map_err(|e| FilterParseError::Syntax(e.to_string()))?;
    let filter = pairs.next().expect("string_filter root");
    let expr = first_inner(filter, Rule::s_expr)?;
    string_expr(expr)
}

pub fn parse_number_filter(src: &str) -> Result<NumberFilter, FilterParseError> {
    let mut pairs = FilterParser::parse(Rule::number_filter, src)
        .map_err(|e| FilterParseError::Syntax(e.to_string()))?;
    let filter = pairs.next().expect("number_filter root");
    let expr = first_inner(filter, Rule::n_expr)?;
    number_or(first_inner(expr, Rule::n_or)?)
}

pub fn parse_boolean_filter(src: &str) -> Result<BooleanFilter, FilterParseError> {
    let mut pairs = FilterParser::parse(Rule::boolean_filter, src)
        .map_err(|e| FilterParseError::Syntax(e.to_string()))?;
    let filter = pairs.next().expect("boolean_filter root");
    let expr = first_inner(filter, Rule::b_expr)?;
    let mut not = false;
    let mut primary = None;
    for p in expr.into_inner() {
        match p.as_rule() {
            Rule::kw_not => not = true,
            Rule::b_primary => primary = Some(p),
            _ => {}
        }
    }
    let primary = primary.ok_or_else(|| internal("boolean filter missing body"))?;
    let inner = primary
        .into_inner()
        .next()
        .ok_or_else(|| internal("empty boolean filter"))?;
    Ok(match inner.as_rule() {
        Rule::b_null => BooleanFilter::Null { not },
        Rule::b_eq_true => BooleanFilter::EqTrue { not },
        Rule::b_eq_false => BooleanFilter::EqFalse { not },
        Rule::b_true => BooleanFilter::True { not },
        Rule::b_false => BooleanFilter::False { not },
        r => return Err(internal(&format!("unexpected boolean rule {r:?}"))),
    })
}

pub fn parse_temporal_filter(src: &str) -> Result<TemporalFilter, FilterParseError> {
    let mut pairs = FilterParser::parse(Rule::temporal_filter, src)
        .map_err(|e| FilterParseError::Syntax(e.to_string()))?;
    let filter = pairs.next().expect("temporal_filter root");
    let expr = first_inner(filter, Rule::t_expr)?;
    temporal_or(first_inner(expr, Rule::t_or)?)
}

fn internal(msg: &str) -> FilterParseError {
    FilterParseError::Syntax(msg.to_string())
}

fn first_inner<'a>(pair: Pair<'a, Rule>, rule: Rule) -> Result<Pair<'a, Rule>, FilterParseError> {
    pair.into_inner()
        .find(|p| p.as_rule() == rule)
        .ok_or_else(|| internal(&format!("expected {rule:?}")))
}

// ---------------- string ----------------

fn string_expr(pair: Pair<'_, Rule>) -> Result<StringFilter, FilterParseError> {
    let members: Vec<StringFilter> = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::s_or)
        .map(string_or)
        .collect::<Result<_, _>>()?;
    Ok(one_or(members, |m| StringFilter::Comma { members: m }))
}

fn string_or(pair: Pair<'_, Rule>) -> Result<StringFilter, FilterParseError> {
    let members: Vec<StringFilter> = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::s_and)
        .map(string_and)
        .collect::<Result<_, _>>()?;
    Ok(one_or(members, |m| StringFilter::Or { members: m }))
}

fn string_and(pair: Pair<'_, Rule>) -> Result<StringFilter, FilterParseError> {
    let members: Vec<StringFilter> = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::s_unary)
        .map(string_unary)
        .collect::<Result<_, _>>()?;
    Ok(one_or(members, |m| StringFilter::And { members: m }))
}

fn one_or<T>(mut members: Vec<T>, combine: impl FnOnce(Vec<T>) -> T) -> T {
    if members.len() == 1 {
        members.pop().unwrap()
    } else {
        combine(members)
    }
}

fn string_unary(pair: Pair<'_, Rule>) -> Result<StringFilter, FilterParseError> {
    let mut not = false;
    let mut out = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::s_not => not = true,
            Rule::s_primary => out = Some(string_primary(p)?),
            _ => {}
        }
    }
    let out = out.ok_or_else(|| internal("string clause missing body"))?;
    Ok(if not { out.negated() } else { out })
}

fn string_primary(pair: Pair<'_, Rule>) -> Result<StringFilter, FilterParseError> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| internal("empty string clause"))?;
    match inner.as_rule() {
        Rule::s_paren => {
            let expr = string_expr(first_inner(inner, Rule::s_expr)?)?;
            Ok(StringFilter::Paren {
                expr: Box::new(expr),
                not: false,
            })
        }
        Rule::s_null => Ok(StringFilter::Null { not: false }),
        Rule::s_empty => Ok(StringFilter::Empty { not: false }),
        Rule::s_token => Ok(classify_token(inner.as_str())),
        r => Err(internal(&format!("unexpected string rule {r:?}"))),
    }
}

/// A token becomes an exact match, a contains/starts/ends match, or a raw
/// LIKE, depending on where its unescaped wildcards sit.
fn classify_token(token: &str) -> StringFilter {
    // (char, was_escaped)
    let mut chars: Vec<(char, bool)> = Vec::new();
    let mut iter = token.chars();
    while let Some(c) = iter.next() {
        if c == '\\' {
            if let Some(next) = iter.next() {
                chars.push((next, true));
            }
        } else {
            chars.push((c, false));
        }
    }

    let is_wild = |&(c, escaped): &(char, bool)| !escaped && (c == '%' || c == '_');
    let wild_count = chars.iter().filter(|c| is_wild(c)).count();
    let literal: String = chars.iter().map(|(c, _)| *c).collect();

    if wild_count == 0 {
        let value = literal.strip_prefix('=').unwrap_or(&literal).to_string();
        return StringFilter::Equals {
            values: vec![value],
            not: false,
        };
    }

    let leading = !chars.is_empty() && is_wild(&chars[0]) && chars[0].0 == '%';
    let trailing = chars.len() > 1 && is_wild(chars.last().unwrap()) && chars.last().unwrap().0 == '%';
    let inner = &chars[usize::from(leading)..chars.len() - usize::from(trailing)];
    let inner_has_wild = inner.iter().any(|c| is_wild(c));

    if !inner_has_wild {
        let value: String = inner.iter().map(|(c, _)| *c).collect();
        if leading && trailing {
            return StringFilter::Contains {
                values: vec![value],
                not: false,
            };
        }
        if trailing {
            return StringFilter::Starts {
                values: vec![value],
                not: false,
            };
        }
        if leading {
            return StringFilter::Ends {
                values: vec![value],
                not: false,
            };
        }
    }

    // keep literal %/_ escaped, wildcards raw
    let pattern: String = chars
        .iter()
        .map(|&(c, escaped)| {
            if escaped && (c == '%' || c == '_' || c == '\\') {
                format!("\\{c}")
            } else {
                c.to_string()
            }
        })
        .collect();
    StringFilter::Like {
        escaped_values: vec![pattern],
        not: false,
    }
}

// ---------------- number ----------------

fn number_or(pair: Pair<'_, Rule>) -> Result<NumberFilter, FilterParseError> {
    let members: Vec<NumberFilter> = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::n_and)
        .map(number_and)
        .collect::<Result<_, _>>()?;
    // `1, 2, 3` reads as one membership test
    let all_plain_equals = members.len() > 1
        && members
            .iter()
            .all(|m| matches!(m, NumberFilter::Equals { not: false, .. }));
    if all_plain_equals {
        let values = members
            .into_iter()
            .flat_map(|m| match m {
                NumberFilter::Equals { values, .. } => values,
                _ => unreachable!(),
            })
            .collect();
        return Ok(NumberFilter::Equals { values, not: false });
    }
    Ok(one_or(members, |m| NumberFilter::Or { members: m }))
}

fn number_and(pair: Pair<'_, Rule>) -> Result<NumberFilter, FilterParseError> {
    let members: Vec<NumberFilter> = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::n_unary)
        .map(number_unary)
        .collect::<Result<_, _>>()?;
    Ok(one_or(members, |m| NumberFilter::And { members: m }))
}

fn number_unary(pair: Pair<'_, Rule>) -> Result<NumberFilter, FilterParseError> {
    let mut not = false;
    let mut out = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::kw_not => not = true,
            Rule::n_primary => out = Some(number_primary(p)?),
            _ => {}
        }
    }
    let out = out.ok_or_else(|| internal("number clause missing body"))?;
    Ok(if not { out.negated() } else { out })
}

fn number_primary(pair: Pair<'_, Rule>) -> Result<NumberFilter, FilterParseError> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| internal("empty number clause"))?;
    match inner.as_rule() {
        Rule::n_paren => {
            let expr = number_or(first_inner(
                first_inner(inner, Rule::n_expr)?,
                Rule::n_or,
            )?)?;
            Ok(NumberFilter::Paren {
                expr: Box::new(expr),
                not: false,
            })
        }
        Rule::n_null => Ok(NumberFilter::Null { not: false }),
        Rule::n_range => {
            let mut start_op = NumberRangeOperator::GreaterOrEqual;
            let mut end_op = NumberRangeOperator::LessOrEqual;
            let mut numbers = Vec::new();
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::n_range_open => {
                        if p.as_str() == "(" {
                            start_op = NumberRangeOperator::Greater;
                        }
                    }
                    Rule::n_range_close => {
                        if p.as_str() == ")" {
                            end_op = NumberRangeOperator::Less;
                        }
                    }
                    Rule::number => numbers.push(p.as_str().to_string()),
                    _ => {}
                }
            }
            if numbers.len() != 2 {
                return Err(internal("range needs two endpoints"));
            }
            let end_value = numbers.pop().unwrap();
            let start_value = numbers.pop().unwrap();
            Ok(NumberFilter::Range {
                start_op,
                start_value,
                end_op,
                end_value,
                not: false,
            })
        }
        Rule::n_comparison => {
            let mut op = None;
            let mut value = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::n_op => op = Some(p.as_str().to_string()),
                    Rule::number => value = Some(p.as_str().to_string()),
                    _ => {}
                }
            }
            let value = value.ok_or_else(|| internal("comparison missing value"))?;
            Ok(match op.as_deref() {
                None | Some("=") => NumberFilter::Equals {
                    values: vec![value],
                    not: false,
                },
                Some("!=") => NumberFilter::Equals {
                    values: vec![value],
                    not: true,
                },
                Some(">") => NumberFilter::Compare {
                    op: NumberRangeOperator::Greater,
                    values: vec![value],
                    not: false,
                },
                Some("<") => NumberFilter::Compare {
                    op: NumberRangeOperator::Less,
                    values: vec![value],
                    not: false,
                },
                Some(">=") => NumberFilter::Compare {
                    op: NumberRangeOperator::GreaterOrEqual,
                    values: vec![value],
                    not: false,
                },
                Some("<=") => NumberFilter::Compare {
                    op: NumberRangeOperator::LessOrEqual,
                    values: vec![value],
                    not: false,
                },
                Some(other) => return Err(internal(&format!("unknown operator {other}"))),
            })
        }
        r => Err(internal(&format!("unexpected number rule {r:?}"))),
    }
}

// ---------------- temporal ----------------

fn temporal_or(pair: Pair<'_, Rule>) -> Result<TemporalFilter, FilterParseError> {
    let members: Vec<TemporalFilter> = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::t_and)
        .map(temporal_and)
        .collect::<Result<_, _>>()?;
    Ok(one_or(members, |m| TemporalFilter::Or { members: m }))
}

fn temporal_and(pair: Pair<'_, Rule>) -> Result<TemporalFilter, FilterParseError> {
    let members: Vec<TemporalFilter> = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::t_unary)
        .map(temporal_unary)
        .collect::<Result<_, _>>()?;
    Ok(one_or(members, |m| TemporalFilter::And { members: m }))
}

fn temporal_unary(pair: Pair<'_, Rule>) -> Result<TemporalFilter, FilterParseError> {
    let mut not = false;
    let mut out = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::kw_not => not = true,
            Rule::t_primary => out = Some(temporal_primary(p)?),
            _ => {}
        }
    }
    let out = out.ok_or_else(|| internal("temporal clause missing body"))?;
    Ok(if not { out.negated() } else { out })
}

fn temporal_primary(pair: Pair<'_, Rule>) -> Result<TemporalFilter, FilterParseError> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| internal("empty temporal clause"))?;
    match inner.as_rule() {
        Rule::t_paren => {
            let expr = temporal_or(first_inner(
                first_inner(inner, Rule::t_expr)?,
                Rule::t_or,
            )?)?;
            Ok(TemporalFilter::Paren {
                expr: Box::new(expr),
                not: false,
            })
        }
        Rule::t_null => Ok(TemporalFilter::Null { not: false }),
        Rule::t_before => Ok(TemporalFilter::Before {
            moment: moment(first_inner(inner, Rule::t_moment)?)?,
            not: false,
        }),
        Rule::t_after => Ok(TemporalFilter::After {
            moment: moment(first_inner(inner, Rule::t_moment)?)?,
            not: false,
        }),
        Rule::t_to => {
            let mut moments = inner
                .into_inner()
                .filter(|p| p.as_rule() == Rule::t_moment)
                .map(moment)
                .collect::<Result<Vec<_>, _>>()?;
            if moments.len() != 2 {
                return Err(internal("'to' needs two moments"));
            }
            let to = moments.pop().unwrap();
            let from = moments.pop().unwrap();
            Ok(TemporalFilter::To {
                from,
                to,
                not: false,
            })
        }
        Rule::t_for => {
            let mut begin = None;
            let mut n = None;
            let mut units = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::t_moment => begin = Some(moment(p)?),
                    Rule::integer => n = Some(p.as_str().to_string()),
                    Rule::t_unit => units = Some(unit(p.as_str())),
                    _ => {}
                }
            }
            Ok(TemporalFilter::For {
                begin: begin.ok_or_else(|| internal("'for' missing start"))?,
                n: n.ok_or_else(|| internal("'for' missing count"))?,
                units: units.ok_or_else(|| internal("'for' missing unit"))?,
                not: false,
            })
        }
        Rule::t_last_n | Rule::t_next_n => {
            let is_last = inner.as_rule() == Rule::t_last_n;
            let mut n = None;
            let mut units = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::integer => n = Some(p.as_str().to_string()),
                    Rule::t_unit => units = Some(unit(p.as_str())),
                    _ => {}
                }
            }
            let n = n.ok_or_else(|| internal("missing count"))?;
            let units = units.ok_or_else(|| internal("missing unit"))?;
            Ok(if is_last {
                TemporalFilter::InLast {
                    n,
                    units,
                    not: false,
                }
            } else {
                TemporalFilter::Next {
                    n,
                    units,
                    not: false,
                }
            })
        }
        Rule::t_in_moment => Ok(TemporalFilter::In {
            moment: moment(first_inner(inner, Rule::t_moment)?)?,
            not: false,
        }),
        r => Err(internal(&format!("unexpected temporal rule {r:?}"))),
    }
}

fn moment(pair: Pair<'_, Rule>) -> Result<Moment, FilterParseError> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| internal("empty moment"))?;
    match inner.as_rule() {
        Rule::t_now => Ok(Moment::Now),
        Rule::t_today => Ok(Moment::Today),
        Rule::t_yesterday => Ok(Moment::Yesterday),
        Rule::t_tomorrow => Ok(Moment::Tomorrow),
        Rule::t_this_unit => Ok(Moment::This(unit(first_inner(inner, Rule::t_unit)?.as_str()))),
        Rule::t_last_unit => Ok(Moment::LastUnit(unit(
            first_inner(inner, Rule::t_unit)?.as_str(),
        ))),
        Rule::t_next_unit => Ok(Moment::NextUnit(unit(
            first_inner(inner, Rule::t_unit)?.as_str(),
        ))),
        Rule::t_ago | Rule::t_from_now => {
            let is_ago = inner.as_rule() == Rule::t_ago;
            let mut n = None;
            let mut units = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::integer => n = Some(p.as_str().to_string()),
                    Rule::t_unit => units = Some(unit(p.as_str())),
                    _ => {}
                }
            }
            let n = n.ok_or_else(|| internal("missing count"))?;
            let units = units.ok_or_else(|| internal("missing unit"))?;
            Ok(if is_ago {
                Moment::Ago { n, units }
            } else {
                Moment::FromNow { n, units }
            })
        }
        Rule::t_literal => {
            let lit = inner
                .into_inner()
                .next()
                .ok_or_else(|| internal("empty literal"))?;
            let text = lit.as_str().to_string();
            let grain = match lit.as_rule() {
                Rule::t_year_lit => LiteralGrain::Year,
                Rule::t_quarter_lit => LiteralGrain::Quarter,
                Rule::t_month_lit => LiteralGrain::Month,
                Rule::t_week_lit => LiteralGrain::Week,
                Rule::t_datetime_lit => match text.len() {
                    10 => LiteralGrain::Day,
                    16 => LiteralGrain::Minute,
                    _ => LiteralGrain::Second,
                },
                r => return Err(internal(&format!("unexpected literal rule {r:?}"))),
            };
            Ok(Moment::Literal {
                literal: text,
                grain,
            })
        }
        r => Err(internal(&format!("unexpected moment rule {r:?}"))),
    }
}

fn unit(s: &str) -> TemporalUnit {
    match s.to_lowercase().trim_end_matches('s') {
        "second" => TemporalUnit::Second,
        "minute" => TemporalUnit::Minute,
        "hour" => TemporalUnit::Hour,
        "day" => TemporalUnit::Day,
        "week" => TemporalUnit::Week,
        "month" => TemporalUnit::Month,
        "quarter" => TemporalUnit::Quarter,
        _ => TemporalUnit::Year,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_string_comma_list() {
        let f = parse_string_filter("CA, NY, -TX").unwrap();
        match f {
            StringFilter::Comma { members } => {
                assert_eq!(members.len(), 3);
                assert_eq!(
                    members[0],
                    StringFilter::Equals {
                        values: vec!["CA".to_string()],
                        not: false
                    }
                );
                assert!(members[2].is_not());
            }
            other => panic!("expected comma combinator, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_string_wildcards() {
        assert_eq!(
            parse_string_filter("%boeing%").unwrap(),
            StringFilter::Contains {
                values: vec!["boeing".to_string()],
                not: false
            }
        );
        assert_eq!(
            parse_string_filter("B7%").unwrap(),
            StringFilter::Starts {
                values: vec!["B7".to_string()],
                not: false
            }
        );
        assert_eq!(
            parse_string_filter("%MAX").unwrap(),
            StringFilter::Ends {
                values: vec!["MAX".to_string()],
                not: false
            }
        );
        assert_eq!(
            parse_string_filter("B_7%X").unwrap(),
            StringFilter::Like {
                escaped_values: vec!["B_7%X".to_string()],
                not: false
            }
        );
    }

    #[test]
    fn test_escaped_percent_is_literal() {
        assert_eq!(
            parse_string_filter(r"100\%").unwrap(),
            StringFilter::Equals {
                values: vec!["100%".to_string()],
                not: false
            }
        );
    }

    #[test]
    fn test_parse_string_null_and_empty() {
        assert_eq!(
            parse_string_filter("null").unwrap(),
            StringFilter::Null { not: false }
        );
        assert_eq!(
            parse_string_filter("-empty").unwrap(),
            StringFilter::Empty { not: true }
        );
    }

    #[test]
    fn test_parse_number_comparisons() {
        assert_eq!(
            parse_number_filter("5, 10, 20").unwrap(),
            NumberFilter::Equals {
                values: vec!["5".to_string(), "10".to_string(), "20".to_string()],
                not: false
            }
        );
        assert_eq!(
            parse_number_filter(">= 100").unwrap(),
            NumberFilter::Compare {
                op: NumberRangeOperator::GreaterOrEqual,
                values: vec!["100".to_string()],
                not: false
            }
        );
    }

    #[test]
    fn test_parse_number_range_brackets() {
        assert_eq!(
            parse_number_filter("[5 to 10)").unwrap(),
            NumberFilter::Range {
                start_op: NumberRangeOperator::GreaterOrEqual,
                start_value: "5".to_string(),
                end_op: NumberRangeOperator::Less,
                end_value: "10".to_string(),
                not: false
            }
        );
    }

    #[test]
    fn test_parse_boolean() {
        assert_eq!(
            parse_boolean_filter("=false").unwrap(),
            BooleanFilter::EqFalse { not: false }
        );
        assert_eq!(
            parse_boolean_filter("not true").unwrap(),
            BooleanFilter::True { not: true }
        );
    }

    #[test]
    fn test_parse_temporal_literals() {
        assert_eq!(
            parse_temporal_filter("2024-03").unwrap(),
            TemporalFilter::In {
                moment: Moment::Literal {
                    literal: "2024-03".to_string(),
                    grain: LiteralGrain::Month
                },
                not: false
            }
        );
        assert_eq!(
            parse_temporal_filter("after 2024-Q2").unwrap(),
            TemporalFilter::After {
                moment: Moment::Literal {
                    literal: "2024-Q2".to_string(),
                    grain: LiteralGrain::Quarter
                },
                not: false
            }
        );
    }

    #[test]
    fn test_parse_temporal_relative() {
        assert_eq!(
            parse_temporal_filter("last 3 days").unwrap(),
            TemporalFilter::InLast {
                n: "3".to_string(),
                units: TemporalUnit::Day,
                not: false
            }
        );
        assert_eq!(
            parse_temporal_filter("2 months ago for 1 month").unwrap(),
            TemporalFilter::For {
                begin: Moment::Ago {
                    n: "2".to_string(),
                    units: TemporalUnit::Month
                },
                n: "1".to_string(),
                units: TemporalUnit::Month,
                not: false
            }
        );
    }

    #[test]
    fn test_parse_temporal_range() {
        assert_eq!(
            parse_temporal_filter("2023 to 2025").unwrap(),
            TemporalFilter::To {
                from: Moment::Literal {
                    literal: "2023".to_string(),
                    grain: LiteralGrain::Year
                },
                to: Moment::Literal {
                    literal: "2025".to_string(),
                    grain: LiteralGrain::Year
                },
                not: false
            }
        );
    }

    #[test]
    fn test_parse_error_carries_diagnostic() {
        let err = parse_number_filter(">> nonsense").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("expected"), "unhelpful diagnostic: {msg}");
    }
}
