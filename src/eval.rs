//! Guard evaluation and parameter templating.
//!
//! The expression language is pluggable through [`Evaluator`]. The bundled
//! [`SimpleEvaluator`] covers what pipelines usually need:
//!
//! - dotted paths into the variable map (`build.exit_code`, `files.0`)
//! - literals: `true`, `false`, `null`, numbers, `'quoted'` or `"quoted"`
//! - `a == b`, `a != b` and a leading `!`
//! - `{{ expr }}` placeholders inside string parameters
//!
//! A guard lets its task run only when it evaluates to the string `"true"`.

use crate::error::{Error, Result};
use crate::model::Output;
use serde_json::Value;

pub trait Evaluator: Send + Sync {
    /// Evaluate `expr` against `vars` to its string form.
    fn evaluate(&self, expr: &str, vars: &Output) -> Result<String>;

    /// Render task parameters against `vars`. The default leaves them as is.
    fn render(&self, params: &Output, vars: &Output) -> Result<Output> {
        let _ = vars;
        Ok(params.clone())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleEvaluator;

impl Evaluator for SimpleEvaluator {
    fn evaluate(&self, expr: &str, vars: &Output) -> Result<String> {
        let expr = strip_braces(expr.trim());
        Ok(stringify(&eval_expr(expr, vars)?))
    }

    fn render(&self, params: &Output, vars: &Output) -> Result<Output> {
        params
            .iter()
            .map(|(k, v)| Ok((k.clone(), render_value(v, vars)?)))
            .collect()
    }
}

/// Render every `{{ expr }}` in `template`. A template that is exactly one
/// placeholder keeps the value's JSON type.
pub fn render_template(template: &str, vars: &Output) -> Result<Value> {
    let trimmed = template.trim();
    if let Some(inner) = sole_placeholder(trimmed) {
        return eval_expr(inner.trim(), vars);
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::Decode(format!("unterminated placeholder in '{template}'")))?;
        out.push_str(&stringify(&eval_expr(after[..end].trim(), vars)?));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Render a template to a plain string.
pub fn render_string(template: &str, vars: &Output) -> Result<String> {
    render_template(template, vars).map(|v| stringify(&v))
}

fn render_value(value: &Value, vars: &Output) -> Result<Value> {
    match value {
        Value::String(s) if s.contains("{{") => render_template(s, vars),
        Value::Array(items) => items
            .iter()
            .map(|v| render_value(v, vars))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), render_value(v, vars)?)))
            .collect::<Result<Output>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    (!inner.contains("{{") && !inner.contains("}}")).then_some(inner)
}

fn strip_braces(s: &str) -> &str {
    sole_placeholder(s).map(str::trim).unwrap_or(s)
}

fn eval_expr(expr: &str, vars: &Output) -> Result<Value> {
    if expr.is_empty() {
        return Err(Error::Decode("empty expression".into()));
    }
    if let Some((lhs, rhs)) = split_operator(expr, "==") {
        return Ok(Value::Bool(eval_expr(lhs, vars)? == eval_expr(rhs, vars)?));
    }
    if let Some((lhs, rhs)) = split_operator(expr, "!=") {
        return Ok(Value::Bool(eval_expr(lhs, vars)? != eval_expr(rhs, vars)?));
    }
    if let Some(operand) = expr.strip_prefix('!') {
        return Ok(Value::Bool(!truthy(&eval_expr(operand.trim(), vars)?)));
    }
    Ok(operand(expr, vars))
}

/// Split on the first `op` outside quotes.
fn split_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let mut quote = None;
    for (i, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if expr[i..].starts_with(op) => {
                return Some((expr[..i].trim(), expr[i + op.len()..].trim()));
            }
            None => {}
        }
    }
    None
}

fn operand(token: &str, vars: &Output) -> Value {
    for q in ['\'', '"'] {
        if let Some(inner) = token
            .strip_prefix(q)
            .and_then(|rest| rest.strip_suffix(q))
        {
            return Value::String(inner.to_string());
        }
    }
    match token {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = token.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(n) = token.parse::<f64>() {
        return Value::from(n);
    }
    lookup(token, vars).cloned().unwrap_or(Value::Null)
}

fn lookup<'a>(path: &str, vars: &'a Output) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn truthy(value: &Value) -> bool {
    stringify(value) == "true"
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
