use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::debug;

use weave_core::error::Result;
use weave_core::traits::TemplateRenderer;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").expect("valid placeholder regex"))
}

/// Renders `{{ path }}` placeholders against a JSON scope.
///
/// Paths are dotted (`draft.title`, `items.0`). Missing values render as the
/// empty string. A node result object renders as its `output` text; any other
/// non-string value renders as compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl PlaceholderRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, template: &str, scope: &Map<String, Value>) -> Result<String> {
        let rendered = placeholder().replace_all(template, |caps: &Captures| {
            let path = &caps[1];
            match lookup(scope, path) {
                Some(value) => display(value),
                None => {
                    debug!(path, "Template placeholder has no value");
                    String::new()
                }
            }
        });
        Ok(rendered.into_owned())
    }
}

/// Resolve a dotted path inside `scope`.
pub fn lookup<'a>(scope: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = scope.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Plain-text form of a scope value.
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(obj) => match obj.get("output") {
            Some(Value::String(s)) => s.clone(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}
