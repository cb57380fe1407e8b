//! Go-style templating for blueprint arguments
//!
//! Blueprints embed Go `text/template` actions in argument strings:
//! - `{{ .StatefulSet.Name }}`, `{{ $.Options.x }}` - field chains
//! - `{{ .Phases.dump.Output.path }}` - outputs of earlier phases
//! - `{{ if }}`, `{{ range }}`, `{{ with }}`, `{{ $x := ... }}` - control flow
//! - `{{ .Time | quote }}`, `{{ default "x" .Options.y }}` - builtins and sprig functions
//!
//! Templates are translated into minijinja source and rendered by
//! [`TemplateEngine`]. [`render_value`] applies the engine to every string
//! leaf of a JSON tree.

mod engine;
mod error;
mod functions;
mod translate;

pub use engine::{CompiledTemplate, TemplateEngine, UndefinedPolicy};
pub use error::TemplateError;

use serde_json::{Map, Value};

/// Render every templated string in a JSON tree
///
/// Strings without template syntax and non-string leaves are returned
/// unchanged. Map keys are rendered like values.
pub fn render_value(
    engine: &TemplateEngine,
    value: &Value,
    data: &Value,
) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => render_str(engine, s, data).map(Value::String),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(engine, item, data))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(
                    render_str(engine, key, data)?,
                    render_value(engine, item, data)?,
                );
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Render a single string, skipping the engine when it holds no template
pub fn render_str(engine: &TemplateEngine, s: &str, data: &Value) -> Result<String, TemplateError> {
    if TemplateEngine::has_template_syntax(s) {
        engine.render(s, data)
    } else {
        Ok(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "Deployment": {"Name": "web", "Namespace": "shop"},
            "Profile": {"Location": {"Bucket": "backups"}},
            "Time": "2026-10-18T10:00:00.000000000Z"
        })
    }

    // =========================================================================
    // Story: Argument trees render recursively
    // =========================================================================

    #[test]
    fn story_nested_arguments_render_in_place() {
        let engine = TemplateEngine::strict();
        let args = json!({
            "namespace": "{{ .Deployment.Namespace }}",
            "command": ["sh", "-c", "backup --bucket {{ .Profile.Location.Bucket }}"],
            "replicas": 2,
            "podOverride": {"labels": {"app": "{{ .Deployment.Name }}"}}
        });
        let rendered = render_value(&engine, &args, &context()).expect("arguments should render");
        assert_eq!(
            rendered,
            json!({
                "namespace": "shop",
                "command": ["sh", "-c", "backup --bucket backups"],
                "replicas": 2,
                "podOverride": {"labels": {"app": "web"}}
            })
        );
    }

    #[test]
    fn template_free_trees_are_unchanged() {
        let engine = TemplateEngine::strict();
        let args = json!({
            "a": "plain ${HOME}",
            "b": [1, true, null, {"c": "d"}],
            "e": 1.5
        });
        let rendered = render_value(&engine, &args, &json!({})).expect("identity render");
        assert_eq!(rendered, args);
    }

    #[test]
    fn undefined_reference_fails_whole_tree() {
        let engine = TemplateEngine::strict();
        let args = json!({"ok": "{{ .Time }}", "bad": ["{{ .StatefulSet.Name }}"]});
        let err = render_value(&engine, &args, &context())
            .expect_err("missing StatefulSet should fail");
        assert!(matches!(err, TemplateError::Undefined(_)));
    }

    #[test]
    fn map_keys_are_rendered() {
        let engine = TemplateEngine::strict();
        let args = json!({"{{ .Deployment.Name }}-key": "v"});
        let rendered = render_value(&engine, &args, &context()).expect("key should render");
        assert_eq!(rendered, json!({"web-key": "v"}));
    }
}
