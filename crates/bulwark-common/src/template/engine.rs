//! Template engine for Go-style blueprint templates
//!
//! Templates are translated to minijinja source and evaluated in an
//! environment whose undefined policy is fixed at construction:
//! - `Strict`: a missing field is an error (argument rendering)
//! - `Lenient`: a missing field evaluates to nil (wait conditions)
//!
//! Syntax errors are errors under both policies.

use std::collections::BTreeMap;

use minijinja::value::{Rest, Value, ValueKind};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior};

use super::error::TemplateError;
use super::functions::{go_format, GoFunction, FUNCTIONS};
use super::translate::{
    translate, EMIT_FN, FIELD_FN, FN_PREFIX, RANGE_FN, ROOT_VAR, TRUTH_FN,
};

/// What happens when a template references a field that does not exist
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UndefinedPolicy {
    /// Rendering fails with [`TemplateError::Undefined`]
    Strict,
    /// The field evaluates to nil and prints as `<no value>`
    Lenient,
}

/// A template that has been parsed and translated, ready to render
#[derive(Clone, Debug)]
pub struct CompiledTemplate {
    original: String,
    source: String,
}

impl CompiledTemplate {
    /// The template text as written
    pub fn original(&self) -> &str {
        &self.original
    }
}

/// Engine rendering Go-style templates against JSON data
pub struct TemplateEngine {
    env: Environment<'static>,
    policy: UndefinedPolicy,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(UndefinedPolicy::Strict)
    }
}

impl TemplateEngine {
    /// Create an engine with the given undefined-field policy
    pub fn new(policy: UndefinedPolicy) -> Self {
        let strict = policy == UndefinedPolicy::Strict;

        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(if strict {
            UndefinedBehavior::Strict
        } else {
            UndefinedBehavior::Chainable
        });

        for &(name, func) in FUNCTIONS {
            register_function(&mut env, name, func);
        }
        env.add_function(FIELD_FN, move |base: Value, names: Rest<String>| {
            lookup_fields(base, &names, strict)
        });
        env.add_function(RANGE_FN, range_pairs);
        env.add_function(TRUTH_FN, |value: Value| value.is_true());
        env.add_function(EMIT_FN, move |value: Value| emit(value, strict));

        Self { env, policy }
    }

    /// Engine for argument rendering: missing fields are errors
    pub fn strict() -> Self {
        Self::new(UndefinedPolicy::Strict)
    }

    /// Engine for condition evaluation: missing fields are nil
    pub fn lenient() -> Self {
        Self::new(UndefinedPolicy::Lenient)
    }

    /// The undefined-field policy of this engine
    pub fn policy(&self) -> UndefinedPolicy {
        self.policy
    }

    /// Parse and translate a template without rendering it
    pub fn compile(&self, template: &str) -> Result<CompiledTemplate, TemplateError> {
        let source = translate(template)?;
        self.env
            .template_from_str(&source)
            .map_err(|e| TemplateError::Syntax(e.to_string()))?;
        Ok(CompiledTemplate {
            original: template.to_string(),
            source,
        })
    }

    /// Render a template string against `data`
    pub fn render(
        &self,
        template: &str,
        data: &serde_json::Value,
    ) -> Result<String, TemplateError> {
        let compiled = self.compile(template)?;
        self.render_compiled(&compiled, data)
    }

    /// Render a previously compiled template against `data`
    pub fn render_compiled(
        &self,
        template: &CompiledTemplate,
        data: &serde_json::Value,
    ) -> Result<String, TemplateError> {
        let ctx: BTreeMap<&str, Value> = [(ROOT_VAR, Value::from_serialize(data))].into();
        self.env
            .render_str(&template.source, ctx)
            .map_err(TemplateError::from)
    }

    /// Check if a string contains any template syntax
    pub fn has_template_syntax(s: &str) -> bool {
        s.contains("{{")
    }
}

fn to_json(value: &Value) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

fn register_function(env: &mut Environment<'static>, name: &'static str, func: GoFunction) {
    env.add_function(
        format!("{}{}", FN_PREFIX, name),
        move |args: Rest<Value>| -> Result<Value, Error> {
            let json = args.iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
            func(&json)
                .map(|v| Value::from_serialize(&v))
                .map_err(|msg| {
                    Error::new(
                        ErrorKind::InvalidOperation,
                        format!("error calling {}: {}", name, msg),
                    )
                })
        },
    );
}

fn lookup_fields(base: Value, names: &[String], strict: bool) -> Result<Value, Error> {
    let mut current = base;
    for name in names {
        let next = match current.kind() {
            ValueKind::Map => Some(current.get_attr(name)?).filter(|v| !v.is_undefined()),
            ValueKind::None | ValueKind::Undefined => None,
            kind if strict => {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    format!("can't evaluate field {} in type {:?}", name, kind),
                ))
            }
            _ => None,
        };
        current = match next {
            Some(value) => value,
            None if strict => return Err(Error::new(ErrorKind::UndefinedError, name.clone())),
            None => Value::from(()),
        };
    }
    Ok(current)
}

fn range_pairs(value: Value) -> Result<Value, Error> {
    let pairs: Vec<Value> = match value.kind() {
        ValueKind::Seq | ValueKind::Iterable => value
            .try_iter()?
            .enumerate()
            .map(|(i, item)| Value::from(vec![Value::from(i as i64), item]))
            .collect(),
        ValueKind::Map => {
            let mut keys: Vec<Value> = value.try_iter()?.collect();
            keys.sort_by_key(|k| k.to_string());
            keys.into_iter()
                .map(|key| {
                    let item = value.get_item(&key)?;
                    Ok(Value::from(vec![key, item]))
                })
                .collect::<Result<_, Error>>()?
        }
        ValueKind::Number => {
            let n = i64::try_from(value.clone())?;
            (0..n.max(0))
                .map(|i| Value::from(vec![Value::from(i), Value::from(i)]))
                .collect()
        }
        ValueKind::None | ValueKind::Undefined => Vec::new(),
        kind => {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("range can't iterate over {:?}", kind),
            ))
        }
    };
    Ok(Value::from(pairs))
}

fn emit(value: Value, strict: bool) -> Result<String, Error> {
    if value.is_undefined() {
        if strict {
            return Err(Error::new(ErrorKind::UndefinedError, "value"));
        }
        return Ok("<no value>".to_string());
    }
    if value.is_none() {
        return Ok("<no value>".to_string());
    }
    if let Some(s) = value.as_str() {
        return Ok(s.to_string());
    }
    Ok(go_format(&to_json(&value)?))
}
