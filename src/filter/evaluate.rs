//! Pure evaluation of a record against a [`FilterSpec`].

use serde_json::Value;
use std::cmp::Ordering;

use super::types::{
    Comparison, ConditionClause, ContainsClause, ExactMatchClause, FilterSpec, MatchLogic,
};
use crate::types::field_value;

/// Whether `item` passes every stage of `spec`.
pub fn matches(item: &Value, spec: &FilterSpec) -> bool {
    exact_stage(item, spec) && contains_stage(item, spec) && condition_stage(item, spec)
}

/// The items of `items` that pass `spec`, in their original order.
pub fn filter_items(items: &[Value], spec: &FilterSpec) -> Vec<Value> {
    if spec.is_empty() {
        return items.to_vec();
    }
    items
        .iter()
        .filter(|item| matches(item, spec))
        .cloned()
        .collect()
}

fn exact_stage(item: &Value, spec: &FilterSpec) -> bool {
    combine(
        spec.exact_match
            .iter()
            .map(|clause| (clause.strict, clause)),
        spec.exact_match_logic,
        |clause| exact_clause_matches(item, clause),
    )
}

fn contains_stage(item: &Value, spec: &FilterSpec) -> bool {
    if spec.contains.is_empty() {
        return true;
    }
    spec.contains
        .iter()
        .any(|clause| contains_clause_matches(item, clause))
}

fn condition_stage(item: &Value, spec: &FilterSpec) -> bool {
    combine(
        spec.condition_match
            .iter()
            .map(|clause| (clause.strict, clause)),
        spec.condition_logic,
        |clause| condition_clause_matches(item, clause),
    )
}

/// Combine clause results under AND or OR logic.
///
/// Under OR, strict clauses must all hold and at least one of the
/// remaining clauses must hold (if there are any).
fn combine<'a, C, I, F>(clauses: I, logic: MatchLogic, eval: F) -> bool
where
    C: 'a,
    I: Iterator<Item = (bool, &'a C)>,
    F: Fn(&C) -> bool,
{
    match logic {
        MatchLogic::And => {
            for (_, clause) in clauses {
                if !eval(clause) {
                    return false;
                }
            }
            true
        }
        MatchLogic::Or => {
            let mut saw_optional = false;
            let mut any_optional = false;
            for (strict, clause) in clauses {
                if strict {
                    if !eval(clause) {
                        return false;
                    }
                } else {
                    saw_optional = true;
                    if !any_optional && eval(clause) {
                        any_optional = true;
                    }
                }
            }
            !saw_optional || any_optional
        }
    }
}

fn exact_clause_matches(item: &Value, clause: &ExactMatchClause) -> bool {
    match field_value(item, &clause.field) {
        None => clause.values.iter().any(Value::is_null),
        Some(Value::Array(elements)) => elements
            .iter()
            .any(|element| clause.values.iter().any(|v| loosely_equal(element, v))),
        Some(found) => clause.values.iter().any(|v| loosely_equal(found, v)),
    }
}

fn contains_clause_matches(item: &Value, clause: &ContainsClause) -> bool {
    let needle = clause.value.to_lowercase();
    clause.fields.iter().any(|field| {
        field_value(item, field)
            .and_then(as_text)
            .map(|text| text.to_lowercase().contains(&needle))
            .unwrap_or(false)
    })
}

fn condition_clause_matches(item: &Value, clause: &ConditionClause) -> bool {
    let found = field_value(item, &clause.field);
    match clause.comparison {
        Comparison::IsNull => found.map(Value::is_null).unwrap_or(true),
        Comparison::IsNotNull => found.map(|v| !v.is_null()).unwrap_or(false),
        comparison => {
            let Some(found) = found else {
                return false;
            };
            if found.is_null() {
                return false;
            }
            match compare_values(found, &clause.value) {
                Some(ordering) => match comparison {
                    Comparison::LessThan => ordering == Ordering::Less,
                    Comparison::LessThanOrEqual => ordering != Ordering::Greater,
                    Comparison::GreaterThan => ordering == Ordering::Greater,
                    Comparison::GreaterThanOrEqual => ordering != Ordering::Less,
                    Comparison::Equal => ordering == Ordering::Equal,
                    Comparison::IsNull | Comparison::IsNotNull => false,
                },
                None => comparison == Comparison::Equal && found == &clause.value,
            }
        }
    }
}

/// Order two JSON values of the same kind.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// 1 and 1.0 are the same value for exact matching.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
