//! Kubernetes-style JSONPath over JSON objects
//!
//! Supports the subset used in wait conditions: field access (`.a.b`,
//! `['a']`), wildcards, indices and slices, recursive descent (`..name`)
//! and filters such as `[?(@.type == "Available")]`. Multiple matches are
//! printed space-separated, as `kubectl -o jsonpath` does.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

// `{$.path}` with optional inner whitespace
static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\s*\$([^{}]*)\}").ok());

/// JSONPath evaluation failure
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JsonPathError {
    /// The expression could not be parsed
    #[error("invalid jsonpath {path:?}: {message}")]
    Syntax {
        /// Offending expression
        path: String,
        /// Detail
        message: String,
    },
    /// The expression matched nothing
    #[error("jsonpath {path:?} is not found")]
    NotFound {
        /// Expression
        path: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Field(String),
    Wildcard,
    Index(i64),
    Slice(Option<i64>, Option<i64>),
    Recursive(String),
    Filter(Filter),
}

#[derive(Clone, Debug, PartialEq)]
struct Filter {
    path: Vec<String>,
    comparison: Option<(CmpOp, Value)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Every `{$...}` placeholder in `template`, with the path it holds
///
/// Returned pairs are (placeholder text, path with the leading `$` removed).
pub fn find_placeholders(template: &str) -> Vec<(String, String)> {
    let mut found: Vec<(String, String)> = Vec::new();
    let Some(placeholder) = PLACEHOLDER.as_ref() else {
        return found;
    };
    for caps in placeholder.captures_iter(template) {
        let whole = caps[0].to_string();
        if found.iter().all(|(w, _)| *w != whole) {
            found.push((whole, caps[1].to_string()));
        }
    }
    found
}

/// Replace each `{$...}` placeholder with its value in `obj`
pub fn resolve_placeholders(template: &str, obj: &Value) -> Result<String, JsonPathError> {
    let mut resolved = template.to_string();
    for (placeholder, path) in find_placeholders(template) {
        let value = resolve_to_string(obj, &path)?;
        resolved = resolved.replace(&placeholder, &value);
    }
    Ok(resolved)
}

/// Evaluate `path` against `obj` and print the matches
pub fn resolve_to_string(obj: &Value, path: &str) -> Result<String, JsonPathError> {
    let matches = evaluate(obj, path)?;
    if matches.is_empty() {
        return Err(JsonPathError::NotFound {
            path: path.trim().to_string(),
        });
    }
    Ok(matches
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" "))
}

/// Evaluate `path` against `obj`, returning every match
pub fn evaluate<'a>(obj: &'a Value, path: &str) -> Result<Vec<&'a Value>, JsonPathError> {
    let segments = parse(path)?;
    let mut current = vec![obj];
    for segment in &segments {
        let mut next = Vec::new();
        for value in current {
            apply(segment, value, &mut next);
        }
        current = next;
    }
    Ok(current)
}

fn apply<'a>(segment: &Segment, value: &'a Value, out: &mut Vec<&'a Value>) {
    match segment {
        Segment::Field(name) => {
            if let Some(v) = value.get(name.as_str()) {
                out.push(v);
            }
        }
        Segment::Wildcard => match value {
            Value::Object(map) => out.extend(map.values()),
            Value::Array(items) => out.extend(items.iter()),
            _ => {}
        },
        Segment::Index(index) => {
            if let Value::Array(items) = value {
                if let Some(i) = normalize(*index, items.len()) {
                    out.push(&items[i]);
                }
            }
        }
        Segment::Slice(start, end) => {
            if let Value::Array(items) = value {
                let len = items.len() as i64;
                let clamp = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
                let from = start.map(clamp).unwrap_or(0);
                let to = end.map(clamp).unwrap_or(len);
                if from < to {
                    out.extend(items[from as usize..to as usize].iter());
                }
            }
        }
        Segment::Recursive(name) => descend(value, name, out),
        Segment::Filter(filter) => {
            if let Value::Array(items) = value {
                out.extend(items.iter().filter(|item| filter.matches(item)));
            }
        }
    }
}

fn normalize(index: i64, len: usize) -> Option<usize> {
    let i = if index < 0 { len as i64 + index } else { index };
    (0..len as i64).contains(&i).then_some(i as usize)
}

fn descend<'a>(value: &'a Value, name: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(name) {
                out.push(v);
            }
            for child in map.values() {
                descend(child, name, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                descend(child, name, out);
            }
        }
        _ => {}
    }
}

impl Filter {
    fn matches(&self, item: &Value) -> bool {
        let mut current = Some(item);
        for field in &self.path {
            current = current.and_then(|v| v.get(field.as_str()));
        }
        match (&self.comparison, current) {
            (None, Some(v)) => !matches!(v, Value::Null | Value::Bool(false)),
            (None, None) => false,
            (Some((op, literal)), Some(v)) => compare(*op, v, literal),
            (Some((op, _)), None) => *op == CmpOp::Ne,
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        // Numeric fields compared against quoted numbers
        (Value::Number(a), Value::String(b)) => b
            .parse::<f64>()
            .ok()
            .and_then(|b| a.as_f64().partial_cmp(&Some(b))),
        _ => None,
    };
    match (op, ordering) {
        (CmpOp::Ne, None) => true,
        (_, None) => false,
        (CmpOp::Eq, Some(o)) => o == Ordering::Equal,
        (CmpOp::Ne, Some(o)) => o != Ordering::Equal,
        (CmpOp::Lt, Some(o)) => o == Ordering::Less,
        (CmpOp::Le, Some(o)) => o != Ordering::Greater,
        (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
        (CmpOp::Ge, Some(o)) => o != Ordering::Less,
    }
}

fn parse(path: &str) -> Result<Vec<Segment>, JsonPathError> {
    let syntax = |message: &str| JsonPathError::Syntax {
        path: path.trim().to_string(),
        message: message.to_string(),
    };
    let expr = path.trim();
    let expr = expr.strip_prefix('{').and_then(|e| e.strip_suffix('}')).unwrap_or(expr).trim();
    let expr = expr.strip_prefix('$').unwrap_or(expr);
    let chars: Vec<char> = expr.chars().collect();

    let mut segments = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '.' if chars.get(i + 1) == Some(&'.') => {
                let (name, end) = read_name(&chars, i + 2);
                if name.is_empty() {
                    return Err(syntax("expected a field name after '..'"));
                }
                segments.push(Segment::Recursive(name));
                i = end;
            }
            '.' if chars.get(i + 1) == Some(&'*') => {
                segments.push(Segment::Wildcard);
                i += 2;
            }
            '.' => {
                let (name, end) = read_name(&chars, i + 1);
                if !name.is_empty() {
                    segments.push(Segment::Field(name));
                }
                i = end;
            }
            '[' => {
                let end = closing_bracket(&chars, i).ok_or_else(|| syntax("unclosed '['"))?;
                let inner: String = chars[i + 1..end].iter().collect();
                segments.push(parse_bracket(inner.trim()).map_err(|m| syntax(&m))?);
                i = end + 1;
            }
            c if c.is_whitespace() => i += 1,
            _ => {
                let (name, end) = read_name(&chars, i);
                if name.is_empty() {
                    return Err(syntax(&format!("unexpected character {:?}", chars[i])));
                }
                segments.push(Segment::Field(name));
                i = end;
            }
        }
    }
    Ok(segments)
}

fn read_name(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len()
        && !matches!(chars[end], '.' | '[' | ']')
        && !chars[end].is_whitespace()
    {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn closing_bracket(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (offset, &c) in chars[open..].iter().enumerate() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[' | '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ']') => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_bracket(inner: &str) -> Result<Segment, String> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    if let Some(body) = inner.strip_prefix("?(").and_then(|b| b.strip_suffix(')')) {
        return parse_filter(body.trim()).map(Segment::Filter);
    }
    if let Some(name) = unquote(inner) {
        return Ok(Segment::Field(name.to_string()));
    }
    if let Some((start, end)) = inner.split_once(':') {
        let bound = |s: &str| -> Result<Option<i64>, String> {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse().map(Some).map_err(|_| format!("invalid slice bound {s:?}"))
        };
        // A step, if present, is ignored
        let end = end.split(':').next().unwrap_or("");
        return Ok(Segment::Slice(bound(start)?, bound(end)?));
    }
    inner
        .parse()
        .map(Segment::Index)
        .map_err(|_| format!("invalid subscript {inner:?}"))
}

fn parse_filter(body: &str) -> Result<Filter, String> {
    const OPS: &[(&str, CmpOp)] = &[
        ("==", CmpOp::Eq),
        ("!=", CmpOp::Ne),
        ("<=", CmpOp::Le),
        (">=", CmpOp::Ge),
        ("<", CmpOp::Lt),
        (">", CmpOp::Gt),
    ];
    let split = OPS
        .iter()
        .filter_map(|(token, op)| find_unquoted(body, token).map(|at| (at, *token, *op)))
        .min_by_key(|(at, token, _)| (*at, std::cmp::Reverse(token.len())));

    let (left, comparison) = match split {
        Some((at, token, op)) => {
            let literal = parse_literal(body[at + token.len()..].trim());
            (body[..at].trim(), Some((op, literal)))
        }
        None => (body, None),
    };
    let path = left
        .strip_prefix('@')
        .ok_or_else(|| format!("filter must start with '@': {body:?}"))?;
    Ok(Filter {
        path: path
            .split('.')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        comparison,
    })
}

fn find_unquoted(body: &str, token: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (at, c) in body.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if body[at..].starts_with(token) => return Some(at),
            None => {}
        }
    }
    None
}

fn unquote(s: &str) -> Option<&str> {
    s.strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
}

fn parse_literal(s: &str) -> Value {
    if let Some(text) = unquote(s) {
        return Value::String(text.to_string());
    }
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(s.to_string())),
    }
}
