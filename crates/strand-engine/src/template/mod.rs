//! Template resolution
//!
//! Values in node configs, branch conditions, loop sources, and output
//! mappings may embed `${expr}` expressions resolved against a
//! [`ScopeArena`]. A standalone `${expr}` substitutes the typed value;
//! interpolated occurrences substitute string coercions. Expressions are
//! path navigations only (dot paths or a bracketed JSONPath subset): no
//! side effects, no code execution. Branch conditions additionally
//! support `==` / `!=` comparison.
//!
//! Missing data is not an error: a missing path resolves to `null` when
//! standalone and the empty string when interpolated. The only failure is
//! a syntactically invalid expression (an unclosed `${`).

use serde_json::{Map, Value};

use crate::scope::{FrameId, PathSegment, ScopeArena};

/// Error for syntactically invalid template expressions
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    #[error("unclosed template expression in {0:?}")]
    Unclosed(String),
}

/// One piece of a parsed template string
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Expr(String),
}

/// Split a string into literal and `${...}` segments
fn parse_segments(input: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| TemplateError::Unclosed(input.to_string()))?;
        segments.push(Segment::Expr(after[..end].trim().to_string()));
        rest = &after[end + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }

    Ok(segments)
}

/// Parse a path expression into navigation segments
///
/// Accepts dot paths (`a.b.0.c`) and the bracketed JSONPath subset
/// (`$.nodes["x"].output[0]`). Path syntax is lenient; anything
/// unrecognized is treated as a key and simply fails to resolve.
fn parse_path(expr: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let expr = expr.strip_prefix('$').unwrap_or(expr);
    let bytes = expr.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'.' => i += 1,
            b'[' => {
                let close = match expr[i..].find(']') {
                    Some(offset) => i + offset,
                    None => break,
                };
                let inner = expr[i + 1..close].trim();
                let inner = inner
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                    .unwrap_or(inner);
                segments.push(index_or_key(inner));
                i = close + 1;
            }
            _ => {
                let end = expr[i..]
                    .find(['.', '['])
                    .map(|offset| i + offset)
                    .unwrap_or(expr.len());
                let part = expr[i..end].trim();
                if !part.is_empty() {
                    segments.push(index_or_key(part));
                }
                i = end;
            }
        }
    }

    segments
}

fn index_or_key(part: &str) -> PathSegment {
    match part.parse::<usize>() {
        Ok(i) => PathSegment::Index(i),
        Err(_) => PathSegment::Key(part.to_string()),
    }
}

/// Resolve a single path expression to its typed value
fn resolve_expr(expr: &str, scope: &ScopeArena, frame: FrameId) -> Value {
    let segments = parse_path(expr);
    scope.lookup(frame, &segments).cloned().unwrap_or(Value::Null)
}

/// String coercion used for interpolated occurrences
fn coerce_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Resolve one template string
///
/// A string that is exactly one `${expr}` substitutes the typed value;
/// anything else concatenates string coercions.
fn render(template: &str, scope: &ScopeArena, frame: FrameId) -> Result<Value, TemplateError> {
    let segments = parse_segments(template)?;

    match segments.as_slice() {
        [Segment::Expr(expr)] => Ok(resolve_expr(expr, scope, frame)),
        _ => {
            let mut out = String::new();
            for segment in &segments {
                match segment {
                    Segment::Literal(s) => out.push_str(s),
                    Segment::Expr(expr) => {
                        out.push_str(&coerce_string(&resolve_expr(expr, scope, frame)))
                    }
                }
            }
            Ok(Value::String(out))
        }
    }
}

/// Resolve a value (scalar, array, or object) against a scope
///
/// Object keys are never expanded; values are walked recursively.
pub fn resolve(
    value: &Value,
    scope: &ScopeArena,
    frame: FrameId,
) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => render(s, scope, frame),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve(item, scope, frame)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve(item, scope, frame)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Truthiness used by branch conditions
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluate a branch condition
///
/// The condition is either a bare path (truthiness of the resolved value)
/// or a binary `lhs == rhs` / `lhs != rhs` where each side is a path or a
/// literal (quoted string, number, `true`, `false`, `null`).
pub fn evaluate_condition(
    condition: &str,
    scope: &ScopeArena,
    frame: FrameId,
) -> Result<bool, TemplateError> {
    let segments = parse_segments(condition)?;

    // A single `${expr}` carries the whole condition; anything else is
    // resolved as a template and tested for truthiness.
    let expr = match segments.as_slice() {
        [Segment::Expr(expr)] => expr.clone(),
        _ => return Ok(truthy(&render(condition, scope, frame)?)),
    };

    if let Some((lhs, rhs)) = split_comparison(&expr, "==") {
        return Ok(loose_eq(
            &operand(&lhs, scope, frame),
            &operand(&rhs, scope, frame),
        ));
    }
    if let Some((lhs, rhs)) = split_comparison(&expr, "!=") {
        return Ok(!loose_eq(
            &operand(&lhs, scope, frame),
            &operand(&rhs, scope, frame),
        ));
    }

    Ok(truthy(&resolve_expr(&expr, scope, frame)))
}

/// Value equality that compares numbers numerically, so an integer path
/// value equals the float literal a condition spells it as
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Split on an operator occurring outside quotes
fn split_comparison(expr: &str, op: &str) -> Option<(String, String)> {
    let mut in_quotes: Option<char> = None;
    let chars: Vec<char> = expr.chars().collect();
    let op_chars: Vec<char> = op.chars().collect();

    let mut i = 0;
    while i + op_chars.len() <= chars.len() {
        let c = chars[i];
        match in_quotes {
            Some(q) if c == q => in_quotes = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => in_quotes = Some(c),
            None if chars[i..i + op_chars.len()] == op_chars[..] => {
                let lhs: String = chars[..i].iter().collect();
                let rhs: String = chars[i + op_chars.len()..].iter().collect();
                return Some((lhs.trim().to_string(), rhs.trim().to_string()));
            }
            None => {}
        }
        i += 1;
    }

    None
}

/// Resolve one comparison operand: literal or path
fn operand(text: &str, scope: &ScopeArena, frame: FrameId) -> Value {
    let trimmed = text.trim();

    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
    {
        return Value::String(inner.to_string());
    }
    if trimmed == "true" {
        return Value::Bool(true);
    }
    if trimmed == "false" {
        return Value::Bool(false);
    }
    if trimmed == "null" {
        return Value::Null;
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return Value::Number(num);
        }
    }

    resolve_expr(trimmed, scope, frame)
}
