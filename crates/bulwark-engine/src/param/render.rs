use std::collections::BTreeMap;

use bulwark_common::crd::{Artifact, ObjectReference};
use bulwark_common::template::{render_str, render_value, TemplateEngine};
use serde_json::Value;

use super::TemplateParams;
use crate::args::Args;
use crate::Result;

/// Render every templated string in a phase's arguments
pub fn render_args(engine: &TemplateEngine, args: &Args, params: &TemplateParams) -> Result<Args> {
    let data = params.to_data()?;
    match render_value(engine, &Value::Object(args.clone()), &data)? {
        Value::Object(rendered) => Ok(rendered),
        _ => Ok(Args::new()),
    }
}

/// Render the string fields of each object reference
pub fn render_object_refs(
    engine: &TemplateEngine,
    refs: &BTreeMap<String, ObjectReference>,
    params: &TemplateParams,
) -> Result<BTreeMap<String, ObjectReference>> {
    if refs.is_empty() {
        return Ok(BTreeMap::new());
    }
    let data = params.to_data()?;
    refs.iter()
        .map(|(key, obj)| Ok((key.clone(), render_object_ref(engine, obj, &data)?)))
        .collect()
}

/// Render the values of each artifact
///
/// Used for ActionSet input artifacts before the action starts and for
/// blueprint output artifacts once every phase has run.
pub fn render_artifacts(
    engine: &TemplateEngine,
    artifacts: &BTreeMap<String, Artifact>,
    params: &TemplateParams,
) -> Result<BTreeMap<String, Artifact>> {
    if artifacts.is_empty() {
        return Ok(BTreeMap::new());
    }
    let data = params.to_data()?;
    let mut rendered = BTreeMap::new();
    for (name, artifact) in artifacts {
        let mut key_value = BTreeMap::new();
        for (key, template) in &artifact.key_value {
            key_value.insert(key.clone(), render_str(engine, template, &data)?);
        }
        rendered.insert(name.clone(), Artifact { key_value });
    }
    Ok(rendered)
}

pub(crate) fn render_object_ref(
    engine: &TemplateEngine,
    obj: &ObjectReference,
    data: &Value,
) -> Result<ObjectReference> {
    Ok(ObjectReference {
        api_version: render_str(engine, &obj.api_version, data)?,
        group: render_str(engine, &obj.group, data)?,
        resource: render_str(engine, &obj.resource, data)?,
        kind: render_str(engine, &obj.kind, data)?,
        name: render_str(engine, &obj.name, data)?,
        namespace: render_str(engine, &obj.namespace, data)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{PhaseParams, WorkloadParams};
    use serde_json::json;

    fn params() -> TemplateParams {
        let mut params = TemplateParams {
            deployment: Some(WorkloadParams {
                name: "web".to_string(),
                namespace: "shop".to_string(),
                ..Default::default()
            }),
            time: "2026-10-18T10:00:00.000000000Z".to_string(),
            ..Default::default()
        };
        params.phases.insert(
            "dump".to_string(),
            PhaseParams {
                output: [("path".to_string(), json!("s3://bkt/web.tar"))].into(),
                ..Default::default()
            },
        );
        params
    }

    #[test]
    fn args_render_against_params() {
        let engine = TemplateEngine::strict();
        let args: Args = serde_json::from_value(json!({
            "namespace": "{{ .Deployment.Namespace }}",
            "command": ["restore", "{{ .Phases.dump.Output.path }}"],
            "replicas": 1
        }))
        .expect("args should parse");
        let rendered = render_args(&engine, &args, &params()).expect("args should render");
        assert_eq!(rendered["namespace"], "shop");
        assert_eq!(rendered["command"], json!(["restore", "s3://bkt/web.tar"]));
        assert_eq!(rendered["replicas"], 1);
    }

    #[test]
    fn object_refs_render_name_and_namespace() {
        let engine = TemplateEngine::strict();
        let refs = BTreeMap::from([(
            "creds".to_string(),
            ObjectReference {
                kind: "Secret".to_string(),
                name: "{{ .Deployment.Name }}-creds".to_string(),
                namespace: "{{ .Deployment.Namespace }}".to_string(),
                ..Default::default()
            },
        )]);
        let rendered = render_object_refs(&engine, &refs, &params()).expect("refs should render");
        assert_eq!(rendered["creds"].name, "web-creds");
        assert_eq!(rendered["creds"].namespace, "shop");
        assert_eq!(rendered["creds"].kind, "Secret");
    }

    /// Story: An output artifact exposes a phase's output through a template.
    #[test]
    fn story_output_artifact_reads_phase_output() {
        let engine = TemplateEngine::strict();
        let artifacts = BTreeMap::from([(
            "backup".to_string(),
            Artifact::from_pairs([("path", "{{ .Phases.dump.Output.path }}")]),
        )]);
        let rendered =
            render_artifacts(&engine, &artifacts, &params()).expect("artifacts should render");
        assert_eq!(rendered["backup"].key_value["path"], "s3://bkt/web.tar");
    }

    #[test]
    fn unresolved_output_is_a_template_error() {
        let engine = TemplateEngine::strict();
        let artifacts = BTreeMap::from([(
            "backup".to_string(),
            Artifact::from_pairs([("path", "{{ .Phases.upload.Output.path }}")]),
        )]);
        let err = render_artifacts(&engine, &artifacts, &params())
            .expect_err("unknown phase should not render");
        assert!(matches!(err, crate::Error::Template(_)));
    }
}
