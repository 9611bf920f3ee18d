use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use marmot_domain::Asset;

use crate::ast::{Expr, Field, Op, Value};
use crate::error::EvalError;
use crate::parser::parse;

/// Parses membership query expressions once and caches them by their
/// textual form, so re-evaluating the same rule against many assets (or
/// the same rule across scheduler ticks) doesn't re-parse each time.
#[derive(Default)]
pub struct ExprCache {
    entries: Mutex<HashMap<String, Arc<Expr>>>,
}

impl ExprCache {
    pub fn new() -> Self {
        ExprCache { entries: Mutex::new(HashMap::new()) }
    }

    /// Returns the parsed expression for `query`, parsing and caching it on
    /// first use. Parse errors are not cached — the caller may want to
    /// retry after the query text is corrected.
    pub fn get(&self, query: &str) -> Result<Arc<Expr>, EvalError> {
        if let Some(expr) = self.entries.lock().unwrap().get(query) {
            return Ok(expr.clone());
        }
        let expr = Arc::new(parse(query)?);
        self.entries.lock().unwrap().insert(query.to_string(), expr.clone());
        Ok(expr)
    }
}

/// Evaluates a parsed expression against an asset. Evaluation never fails:
/// a comparison between incompatible types (e.g. a numeric operator against
/// a string metadata value) evaluates to `false` rather than erroring —
/// `EvalError::Malformed` is strictly a parse-time error.
pub fn eval(expr: &Expr, asset: &Asset) -> bool {
    match expr {
        Expr::And(l, r) => eval(l, asset) && eval(r, asset),
        Expr::Or(l, r) => eval(l, asset) || eval(r, asset),
        Expr::Not(inner) => !eval(inner, asset),
        Expr::Compare { field, op, value } => eval_compare(field, *op, value, asset),
    }
}

fn eval_compare(field: &Field, op: Op, value: &Value, asset: &Asset) -> bool {
    match field {
        Field::Type => str_compare(op, &asset.asset_type.0, value),
        Field::Name => str_compare(op, &asset.name, value),
        Field::Provider => set_compare(op, &asset.providers, value),
        Field::Tag => set_compare(op, &asset.tags, value),
        Field::Metadata(path) => match resolve_metadata(&asset.metadata, path) {
            Some(found) => json_compare(op, found, value),
            None => false,
        },
    }
}

fn str_compare(op: Op, actual: &str, value: &Value) -> bool {
    let Value::Str(expected) = value else { return false };
    match op {
        Op::Eq => actual == expected,
        Op::Neq => actual != expected,
        Op::Contains => actual.contains(expected.as_str()),
        Op::Lt | Op::Lte | Op::Gt | Op::Gte => ord_compare(op, actual.cmp(expected.as_str())),
    }
}

fn set_compare(op: Op, actual: &[String], value: &Value) -> bool {
    let Value::Str(expected) = value else { return false };
    match op {
        Op::Eq => actual.iter().any(|a| a == expected),
        Op::Neq => actual.iter().all(|a| a != expected),
        Op::Contains => actual.iter().any(|a| a.contains(expected.as_str())),
        Op::Lt | Op::Lte | Op::Gt | Op::Gte => false,
    }
}

fn json_compare(op: Op, actual: &serde_json::Value, value: &Value) -> bool {
    match (actual, value) {
        (serde_json::Value::String(a), Value::Str(_)) => str_compare(op, a, value),
        (serde_json::Value::Number(a), Value::Num(expected)) => match a.as_f64() {
            Some(actual_n) => match op {
                Op::Eq => actual_n == *expected,
                Op::Neq => actual_n != *expected,
                _ => ord_compare(op, actual_n.partial_cmp(expected).unwrap_or(Ordering::Less)),
            },
            None => false,
        },
        (serde_json::Value::Bool(a), Value::Str(expected)) => match op {
            Op::Eq => &a.to_string() == expected,
            Op::Neq => &a.to_string() != expected,
            _ => false,
        },
        _ => false,
    }
}

fn ord_compare(op: Op, ord: Ordering) -> bool {
    match op {
        Op::Lt => ord == Ordering::Less,
        Op::Lte => ord != Ordering::Greater,
        Op::Gt => ord == Ordering::Greater,
        Op::Gte => ord != Ordering::Less,
        Op::Eq => ord == Ordering::Equal,
        Op::Neq => ord != Ordering::Equal,
        Op::Contains => false,
    }
}

fn resolve_metadata<'a>(metadata: &'a HashMap<String, serde_json::Value>, path: &str) -> Option<&'a serde_json::Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut cur = metadata.get(first)?;
    for seg in segments {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_domain::{AssetType, Mrn};
    use serde_json::json;

    fn asset() -> Asset {
        let mut a = Asset::fresh(Mrn::new("mrn://pg/db/t"), "orders", AssetType::new("table"));
        a.providers = vec!["postgres".into()];
        a.tags = vec!["pii".into(), "finance".into()];
        a.metadata.insert("rows".into(), json!(1200));
        a.metadata.insert("owner".into(), json!({"team": "payments"}));
        a
    }

    fn run(query: &str, asset: &Asset) -> bool {
        let e = parse(query).unwrap();
        eval(&e, asset)
    }

    #[test]
    fn simple_equality() {
        assert!(run("type = \"table\"", &asset()));
        assert!(!run("type = \"topic\"", &asset()));
    }

    #[test]
    fn tag_and_provider_membership() {
        assert!(run("tag = \"pii\" AND provider = \"postgres\"", &asset()));
        assert!(!run("tag = \"pii\" AND provider = \"kafka\"", &asset()));
    }

    #[test]
    fn or_and_not_precedence() {
        assert!(run("NOT type = \"topic\" OR tag = \"missing\"", &asset()));
        assert!(!run("NOT (type = \"table\" OR tag = \"missing\")", &asset()));
    }

    #[test]
    fn numeric_metadata_comparison() {
        assert!(run("metadata.rows > 1000", &asset()));
        assert!(!run("metadata.rows > 5000", &asset()));
    }

    #[test]
    fn nested_metadata_path() {
        assert!(run("metadata.owner.team = \"payments\"", &asset()));
    }

    #[test]
    fn substring_contains() {
        assert!(run("name ~ \"ord\"", &asset()));
        assert!(!run("name ~ \"zzz\"", &asset()));
    }

    #[test]
    fn type_mismatch_is_false_not_error() {
        assert!(!run("metadata.rows = \"1200\"", &asset()));
    }

    #[test]
    fn malformed_query_reports_error() {
        let err = parse("type = ").unwrap_err();
        assert!(matches!(err, EvalError::Malformed { .. }));
    }

    #[test]
    fn unknown_field_is_malformed() {
        let err = parse("bogus = \"x\"").unwrap_err();
        assert!(matches!(err, EvalError::Malformed { .. }));
    }

    #[test]
    fn cache_returns_same_parse_result() {
        let cache = ExprCache::new();
        let a = cache.get("type = \"table\"").unwrap();
        let b = cache.get("type = \"table\"").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
