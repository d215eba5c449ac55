use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::template::lookup;

/// In-process loop predicate over the accumulated value.
pub type TerminationFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// When a loop stops iterating.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Termination {
    /// Run until `max_iterations`.
    #[default]
    Never,
    /// Stop once a simple expression matches the accumulated value.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Expr { expr: String },
    #[serde(skip)]
    Predicate(TerminationFn),
}

impl Termination {
    pub fn expr(expr: impl Into<String>) -> Self {
        Termination::Expr { expr: expr.into() }
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Termination::Predicate(Arc::new(f))
    }

    /// Whether the loop should stop after `iteration` (1-based) produced `accumulated`.
    pub fn is_satisfied(&self, accumulated: &Value, iteration: usize) -> bool {
        match self {
            Termination::Never => false,
            Termination::Predicate(f) => f(accumulated),
            Termination::Expr { expr } => {
                let mut scope = match accumulated {
                    Value::Object(obj) => obj.clone(),
                    other => {
                        let mut map = Map::new();
                        map.insert("output".into(), other.clone());
                        map
                    }
                };
                scope.insert("iteration".into(), Value::from(iteration));
                evaluate_condition(expr, &scope)
            }
        }
    }
}

impl fmt::Debug for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Never => f.write_str("Never"),
            Termination::Expr { expr } => f.debug_struct("Expr").field("expr", expr).finish(),
            Termination::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Evaluate a simple conditional expression against a JSON scope.
///
/// Keys may be dotted paths. Strings, numbers and booleans compare by their
/// text form. Returns `false` for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, scope: &Map<String, Value>) -> bool {
    let expr = expr.trim();
    let text = |key: &str| lookup(scope, key).and_then(scalar_text);

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return text(key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return text(key).is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return text(key).is_some_and(|s| s == value);
    }

    false
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}
