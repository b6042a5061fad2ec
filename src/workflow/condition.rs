//! Condition clause evaluation.
//!
//! Clauses combine as a left fold: the accumulator starts `true` and each
//! clause joins it with its own logical operator. There is no precedence, so
//! `[A(OR), B(AND)]` is `(true OR A) AND B`.

use serde_json::Value;

use crate::workflow::context::ExecutionContext;
use crate::workflow::model::{Clause, ConditionConfig, LogicalOperator, Operator};

/// Fold all clauses. An empty list is true.
pub fn evaluate(config: &ConditionConfig, ctx: &ExecutionContext) -> bool {
    config
        .clauses
        .iter()
        .fold(true, |acc, clause| match clause.logical_operator {
            LogicalOperator::And => acc && evaluate_clause(clause, ctx),
            LogicalOperator::Or => acc || evaluate_clause(clause, ctx),
        })
}

pub fn evaluate_clause(clause: &Clause, ctx: &ExecutionContext) -> bool {
    let actual = ctx.lookup(&clause.field_path).filter(|v| is_present(v));
    let expected = clause.value.as_ref();

    match clause.operator {
        Operator::Exists => actual.is_some(),
        Operator::NotExists => actual.is_none(),
        Operator::Equals => matches!((actual, expected), (Some(a), Some(e)) if loosely_equal(a, e)),
        Operator::NotEquals => !matches!((actual, expected), (Some(a), Some(e)) if loosely_equal(a, e)),
        Operator::Contains => matches!((actual, expected), (Some(a), Some(e)) if contains(a, e)),
        Operator::GreaterThan => compare(actual, expected).is_some_and(|o| o.is_gt()),
        Operator::LessThan => compare(actual, expected).is_some_and(|o| o.is_lt()),
    }
}

/// Null and blank strings count as absent.
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Exact JSON equality, or equal scalar text ("42" equals 42).
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (scalar_text(actual), scalar_text(expected)) {
        (Some(a), Some(e)) => a == e,
        _ => false,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        _ => match (scalar_text(actual), scalar_text(expected)) {
            (Some(a), Some(e)) => a.contains(&e),
            _ => false,
        },
    }
}

fn compare(actual: Option<&Value>, expected: Option<&Value>) -> Option<std::cmp::Ordering> {
    let a = number(actual?)?;
    let e = number(expected?)?;
    a.partial_cmp(&e)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::workflow::context::PARSED_DATA_KEY;

    fn ctx(parsed: Value) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.insert(PARSED_DATA_KEY, parsed).unwrap();
        ctx
    }

    fn clause(path: &str, operator: Operator, value: Option<Value>, op: LogicalOperator) -> Clause {
        Clause {
            field_path: path.into(),
            operator,
            value,
            logical_operator: op,
        }
    }

    #[test]
    fn or_fold_with_missing_first_field_succeeds() {
        let ctx = ctx(json!({ "dg": "DG1" }));
        let config = ConditionConfig {
            clauses: vec![
                clause("parsed_data.mprn", Operator::Exists, None, LogicalOperator::Or),
                clause("parsed_data.dg", Operator::Exists, None, LogicalOperator::Or),
            ],
        };
        assert!(evaluate(&config, &ctx));
    }

    #[test]
    fn fold_has_no_precedence() {
        // (true OR a) AND b
        let ctx = ctx(json!({ "mprn": "1" }));
        let config = ConditionConfig {
            clauses: vec![
                clause("parsed_data.mprn", Operator::Exists, None, LogicalOperator::Or),
                clause("parsed_data.gprn", Operator::Exists, None, LogicalOperator::And),
            ],
        };
        assert!(!evaluate(&config, &ctx));
    }

    #[test]
    fn and_clauses_require_all() {
        let ctx = ctx(json!({ "mprn": "10012345678", "document_type": "electricity" }));
        let config = ConditionConfig {
            clauses: vec![
                clause("parsed_data.mprn", Operator::Exists, None, LogicalOperator::And),
                clause(
                    "parsed_data.document_type",
                    Operator::Equals,
                    Some(json!("electricity")),
                    LogicalOperator::And,
                ),
            ],
        };
        assert!(evaluate(&config, &ctx));
    }

    #[test]
    fn empty_clause_list_is_true() {
        assert!(evaluate(&ConditionConfig::default(), &ExecutionContext::new()));
    }

    #[test]
    fn blank_and_null_values_do_not_exist() {
        let ctx = ctx(json!({ "mprn": "  ", "gprn": null }));
        let and = LogicalOperator::And;
        assert!(!evaluate_clause(&clause("parsed_data.mprn", Operator::Exists, None, and), &ctx));
        assert!(evaluate_clause(&clause("parsed_data.gprn", Operator::NotExists, None, and), &ctx));
    }

    #[test]
    fn comparison_operators() {
        let ctx = ctx(json!({ "amount_due": 84.2, "supplier": "Electric Ireland", "count": "42" }));
        let and = LogicalOperator::And;
        assert!(evaluate_clause(
            &clause("parsed_data.amount_due", Operator::GreaterThan, Some(json!(50)), and),
            &ctx
        ));
        assert!(evaluate_clause(
            &clause("parsed_data.amount_due", Operator::LessThan, Some(json!("100")), and),
            &ctx
        ));
        assert!(evaluate_clause(
            &clause("parsed_data.supplier", Operator::Contains, Some(json!("Electric")), and),
            &ctx
        ));
        assert!(evaluate_clause(
            &clause("parsed_data.count", Operator::Equals, Some(json!(42)), and),
            &ctx
        ));
        assert!(evaluate_clause(
            &clause("parsed_data.supplier", Operator::NotEquals, Some(json!("Bord Gais")), and),
            &ctx
        ));
        assert!(!evaluate_clause(
            &clause("parsed_data.missing", Operator::GreaterThan, Some(json!(0)), and),
            &ctx
        ));
    }
}
