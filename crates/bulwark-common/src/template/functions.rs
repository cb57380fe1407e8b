//! Template functions
//!
//! The Go text/template builtins plus the subset of sprig used by blueprints.
//! Every function operates on JSON values; the engine converts minijinja
//! values at the call boundary.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{Map, Number, Value};

/// Signature shared by every template function
pub(crate) type GoFunction = fn(&[Value]) -> Result<Value, String>;

/// Functions callable from templates, keyed by their template name
pub(crate) const FUNCTIONS: &[(&str, GoFunction)] = &[
    // text/template builtins
    ("eq", eq),
    ("ne", ne),
    ("lt", lt),
    ("le", le),
    ("gt", gt),
    ("ge", ge),
    ("and", and),
    ("or", or),
    ("not", not),
    ("len", len),
    ("index", index),
    ("print", print),
    ("printf", printf),
    ("println", println),
    // sprig
    ("default", default),
    ("empty", empty),
    ("quote", quote),
    ("squote", squote),
    ("upper", upper),
    ("lower", lower),
    ("trim", trim),
    ("trimPrefix", trim_prefix),
    ("trimSuffix", trim_suffix),
    ("toString", to_string),
    ("toJson", to_json),
    ("b64enc", b64enc),
    ("b64dec", b64dec),
    ("hasKey", has_key),
    ("join", join),
    ("contains", contains),
    ("hasPrefix", has_prefix),
    ("hasSuffix", has_suffix),
    ("replace", replace),
    ("int", int),
    ("add", add),
    ("list", list),
    ("dict", dict),
];

/// True if `name` can be called from a template
pub(crate) fn is_known_function(name: &str) -> bool {
    FUNCTIONS.iter().any(|(n, _)| *n == name)
}

// =============================================================================
// Value helpers
// =============================================================================

/// Go truthiness: false, 0, nil and empty values are false
pub(crate) fn truth(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Format a value the way Go's `%v` verb does
pub(crate) fn go_format(v: &Value) -> String {
    match v {
        Value::Null => "<nil>".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(n),
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(go_format).collect();
            format!("[{}]", parts.join(" "))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, go_format(&map[k])))
                .collect();
            format!("map[{}]", parts.join(" "))
        }
    }
}

fn format_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e21 => format!("{}", f as i64),
        Some(f) => format!("{}", f),
        None => n.to_string(),
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn as_str<'a>(v: &'a Value, func: &str, pos: usize) -> Result<&'a str, String> {
    v.as_str()
        .ok_or_else(|| format!("{}: argument {} must be a string", func, pos + 1))
}

fn arity(args: &[Value], func: &str, n: usize) -> Result<(), String> {
    if args.len() != n {
        return Err(format!(
            "wrong number of args for {}: want {} got {}",
            func,
            n,
            args.len()
        ));
    }
    Ok(())
}

fn values_equal(a: &Value, b: &Value) -> Result<bool, String> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(x.as_f64() == y.as_f64()),
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            Err("non-comparable type".to_string())
        }
        _ => Ok(a == b),
    }
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, String> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            let (x, y) = (as_f64(a).unwrap_or(0.0), as_f64(b).unwrap_or(0.0));
            x.partial_cmp(&y)
                .ok_or_else(|| "incomparable numbers".to_string())
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err("incompatible types for comparison".to_string()),
    }
}

// =============================================================================
// text/template builtins
// =============================================================================

fn eq(args: &[Value]) -> Result<Value, String> {
    let Some((first, rest)) = args.split_first() else {
        return Err("missing arguments for comparison".to_string());
    };
    if rest.is_empty() {
        return Err("missing arguments for comparison".to_string());
    }
    for other in rest {
        if values_equal(first, other)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn ne(args: &[Value]) -> Result<Value, String> {
    arity(args, "ne", 2)?;
    Ok(Value::Bool(!values_equal(&args[0], &args[1])?))
}

fn lt(args: &[Value]) -> Result<Value, String> {
    arity(args, "lt", 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])?.is_lt()))
}

fn le(args: &[Value]) -> Result<Value, String> {
    arity(args, "le", 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])?.is_le()))
}

fn gt(args: &[Value]) -> Result<Value, String> {
    arity(args, "gt", 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])?.is_gt()))
}

fn ge(args: &[Value]) -> Result<Value, String> {
    arity(args, "ge", 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])?.is_ge()))
}

fn and(args: &[Value]) -> Result<Value, String> {
    let Some(last) = args.last() else {
        return Err("wrong number of args for and: want at least 1 got 0".to_string());
    };
    Ok(args.iter().find(|v| !truth(v)).unwrap_or(last).clone())
}

fn or(args: &[Value]) -> Result<Value, String> {
    let Some(last) = args.last() else {
        return Err("wrong number of args for or: want at least 1 got 0".to_string());
    };
    Ok(args.iter().find(|v| truth(v)).unwrap_or(last).clone())
}

fn not(args: &[Value]) -> Result<Value, String> {
    arity(args, "not", 1)?;
    Ok(Value::Bool(!truth(&args[0])))
}

fn len(args: &[Value]) -> Result<Value, String> {
    arity(args, "len", 1)?;
    let n = match &args[0] {
        Value::String(s) => s.len(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        other => return Err(format!("len of type {}", type_name(other))),
    };
    Ok(Value::from(n))
}

fn index(args: &[Value]) -> Result<Value, String> {
    let Some((mut current, keys)) = args.split_first().map(|(c, k)| (c.clone(), k)) else {
        return Err("wrong number of args for index: want at least 1 got 0".to_string());
    };
    for key in keys {
        current = match (&current, key) {
            (Value::Array(items), Value::Number(n)) => {
                let i = n
                    .as_i64()
                    .ok_or_else(|| format!("cannot index slice/array with {}", n))?;
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or_else(|| format!("index out of range: {}", i))?
            }
            (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
            (Value::Null, _) => return Err("index of untyped nil".to_string()),
            (other, k) => {
                return Err(format!(
                    "can't index item of type {} with {}",
                    type_name(other),
                    go_format(k)
                ))
            }
        };
    }
    Ok(current)
}

fn sprint(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 && !arg.is_string() && !args[i - 1].is_string() {
            out.push(' ');
        }
        out.push_str(&go_format(arg));
    }
    out
}

fn print(args: &[Value]) -> Result<Value, String> {
    Ok(Value::String(sprint(args)))
}

fn println(args: &[Value]) -> Result<Value, String> {
    let parts: Vec<String> = args.iter().map(go_format).collect();
    Ok(Value::String(format!("{}\n", parts.join(" "))))
}

fn printf(args: &[Value]) -> Result<Value, String> {
    let Some((format, rest)) = args.split_first() else {
        return Err("wrong number of args for printf: want at least 1 got 0".to_string());
    };
    let format = as_str(format, "printf", 0)?;
    let mut out = String::new();
    let mut operands = rest.iter();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let Some(operand) = operands.next() else {
            out.push_str(&format!("%!{}(MISSING)", verb));
            continue;
        };
        match verb {
            's' | 'v' => out.push_str(&go_format(operand)),
            'q' => out.push_str(&quote_str(&go_format(operand))),
            't' => out.push_str(&truth(operand).to_string()),
            'd' => match operand {
                Value::Number(n) => out.push_str(&format!("{}", n.as_f64().unwrap_or(0.0) as i64)),
                other => out.push_str(&format!("%!d({})", go_format(other))),
            },
            'f' => match as_f64(operand) {
                Some(f) => out.push_str(&format!("{:.6}", f)),
                None => out.push_str(&format!("%!f({})", go_format(operand))),
            },
            other => out.push_str(&format!("%!{}({})", other, go_format(operand))),
        }
    }
    let extra: Vec<String> = operands.map(go_format).collect();
    if !extra.is_empty() {
        out.push_str(&format!("%!(EXTRA {})", extra.join(", ")));
    }
    Ok(Value::String(out))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "slice",
        Value::Object(_) => "map",
    }
}

// =============================================================================
// sprig subset
// =============================================================================

/// `default DEFAULT VALUE`: VALUE unless it is empty
fn default(args: &[Value]) -> Result<Value, String> {
    match args {
        [fallback] => Ok(fallback.clone()),
        [_, given] if truth(given) => Ok(given.clone()),
        [fallback, _] => Ok(fallback.clone()),
        _ => Err(format!(
            "wrong number of args for default: want 1 or 2 got {}",
            args.len()
        )),
    }
}

fn empty(args: &[Value]) -> Result<Value, String> {
    arity(args, "empty", 1)?;
    Ok(Value::Bool(!truth(&args[0])))
}

fn quote_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

fn quote(args: &[Value]) -> Result<Value, String> {
    let parts: Vec<String> = args
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| quote_str(&go_format(v)))
        .collect();
    Ok(Value::String(parts.join(" ")))
}

fn squote(args: &[Value]) -> Result<Value, String> {
    let parts: Vec<String> = args
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| format!("'{}'", go_format(v)))
        .collect();
    Ok(Value::String(parts.join(" ")))
}

fn upper(args: &[Value]) -> Result<Value, String> {
    arity(args, "upper", 1)?;
    Ok(Value::String(go_format(&args[0]).to_uppercase()))
}

fn lower(args: &[Value]) -> Result<Value, String> {
    arity(args, "lower", 1)?;
    Ok(Value::String(go_format(&args[0]).to_lowercase()))
}

fn trim(args: &[Value]) -> Result<Value, String> {
    arity(args, "trim", 1)?;
    Ok(Value::String(go_format(&args[0]).trim().to_string()))
}

fn trim_prefix(args: &[Value]) -> Result<Value, String> {
    arity(args, "trimPrefix", 2)?;
    let prefix = as_str(&args[0], "trimPrefix", 0)?;
    let s = go_format(&args[1]);
    Ok(Value::String(s.strip_prefix(prefix).unwrap_or(&s).to_string()))
}

fn trim_suffix(args: &[Value]) -> Result<Value, String> {
    arity(args, "trimSuffix", 2)?;
    let suffix = as_str(&args[0], "trimSuffix", 0)?;
    let s = go_format(&args[1]);
    Ok(Value::String(s.strip_suffix(suffix).unwrap_or(&s).to_string()))
}

fn to_string(args: &[Value]) -> Result<Value, String> {
    arity(args, "toString", 1)?;
    Ok(Value::String(go_format(&args[0])))
}

fn to_json(args: &[Value]) -> Result<Value, String> {
    arity(args, "toJson", 1)?;
    serde_json::to_string(&args[0])
        .map(Value::String)
        .map_err(|e| e.to_string())
}

fn b64enc(args: &[Value]) -> Result<Value, String> {
    arity(args, "b64enc", 1)?;
    Ok(Value::String(STANDARD.encode(go_format(&args[0]))))
}

fn b64dec(args: &[Value]) -> Result<Value, String> {
    arity(args, "b64dec", 1)?;
    let bytes = STANDARD
        .decode(go_format(&args[0]))
        .map_err(|e| format!("base64 decode error: {}", e))?;
    String::from_utf8(bytes)
        .map(Value::String)
        .map_err(|e| format!("base64 decode produced invalid UTF-8: {}", e))
}

fn has_key(args: &[Value]) -> Result<Value, String> {
    arity(args, "hasKey", 2)?;
    let key = as_str(&args[1], "hasKey", 1)?;
    Ok(Value::Bool(
        args[0].as_object().is_some_and(|m| m.contains_key(key)),
    ))
}

fn join(args: &[Value]) -> Result<Value, String> {
    arity(args, "join", 2)?;
    let sep = as_str(&args[0], "join", 0)?;
    let joined = match &args[1] {
        Value::Array(items) => items
            .iter()
            .map(go_format)
            .collect::<Vec<_>>()
            .join(sep),
        Value::Null => String::new(),
        other => go_format(other),
    };
    Ok(Value::String(joined))
}

fn contains(args: &[Value]) -> Result<Value, String> {
    arity(args, "contains", 2)?;
    let needle = go_format(&args[0]);
    Ok(Value::Bool(go_format(&args[1]).contains(&needle)))
}

fn has_prefix(args: &[Value]) -> Result<Value, String> {
    arity(args, "hasPrefix", 2)?;
    let prefix = go_format(&args[0]);
    Ok(Value::Bool(go_format(&args[1]).starts_with(&prefix)))
}

fn has_suffix(args: &[Value]) -> Result<Value, String> {
    arity(args, "hasSuffix", 2)?;
    let suffix = go_format(&args[0]);
    Ok(Value::Bool(go_format(&args[1]).ends_with(&suffix)))
}

fn replace(args: &[Value]) -> Result<Value, String> {
    arity(args, "replace", 3)?;
    let old = go_format(&args[0]);
    let new = go_format(&args[1]);
    Ok(Value::String(go_format(&args[2]).replace(&old, &new)))
}

fn int(args: &[Value]) -> Result<Value, String> {
    arity(args, "int", 1)?;
    let n = match &args[0] {
        Value::Number(n) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
            .unwrap_or(0),
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    };
    Ok(Value::from(n))
}

fn add(args: &[Value]) -> Result<Value, String> {
    let mut sum = 0i64;
    for arg in args {
        if let Value::Number(n) = int(std::slice::from_ref(arg))? {
            sum += n.as_i64().unwrap_or(0);
        }
    }
    Ok(Value::from(sum))
}

fn list(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Array(args.to_vec()))
}

fn dict(args: &[Value]) -> Result<Value, String> {
    let mut map = Map::new();
    for pair in args.chunks(2) {
        let key = go_format(&pair[0]);
        map.insert(key, pair.get(1).cloned().unwrap_or(Value::String(String::new())));
    }
    Ok(Value::Object(map))
}
