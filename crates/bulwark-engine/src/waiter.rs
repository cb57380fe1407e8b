//! Polling templated conditions against live cluster objects

use std::sync::Arc;
use std::time::Duration;

use bulwark_common::crd::ObjectReference;
use bulwark_common::template::TemplateEngine;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::cluster::ClusterClient;
use crate::jsonpath::{resolve_placeholders, JsonPathError};
use crate::param::render::render_object_ref;
use crate::param::TemplateParams;
use crate::poll::{poll_until, Backoff, Poll};
use crate::{Error, Result};

/// One condition on one object
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Object the condition is evaluated against; fields may be templated
    #[serde(default)]
    pub object_reference: ObjectReference,
    /// Template that renders `true` once satisfied
    #[serde(default)]
    pub condition: String,
}

/// Conditions a wait succeeds on
///
/// Succeeds when any `any_of` condition holds, or when every `all_of`
/// condition holds. An empty `all_of` never succeeds on its own.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitConditions {
    /// Any one of these suffices
    #[serde(default)]
    pub any_of: Vec<Condition>,
    /// All of these together suffice
    #[serde(default)]
    pub all_of: Vec<Condition>,
}

/// How condition text refers to the fetched object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionSyntax {
    /// A Go template with the object as its data (`{{ .status.phase }}`)
    GoTemplate,
    /// `{$.path}` placeholders are substituted, then the template is
    /// evaluated with no data
    JsonPath,
}

// Evaluation failures: hard ones end the wait, soft ones are retried
enum EvalError {
    Hard(Error),
    Soft(String),
}

/// Polls [`WaitConditions`] until satisfied, timed out, or cancelled
pub struct ConditionWaiter {
    cluster: Arc<dyn ClusterClient>,
    backoff: Backoff,
    refs: TemplateEngine,
    conditions: TemplateEngine,
}

impl ConditionWaiter {
    /// Waiter polling through `cluster` on `backoff`
    pub fn new(cluster: Arc<dyn ClusterClient>, backoff: Backoff) -> Self {
        Self {
            cluster,
            backoff,
            refs: TemplateEngine::strict(),
            conditions: TemplateEngine::lenient(),
        }
    }

    /// Wait for `conditions` to hold
    ///
    /// Missing objects and unresolvable fields are retried; the last such
    /// failure is reported if the wait times out. Template and JSONPath
    /// syntax errors fail at once.
    #[instrument(
        skip_all,
        fields(
            any_of = conditions.any_of.len(),
            all_of = conditions.all_of.len(),
            timeout = ?timeout
        )
    )]
    pub async fn wait(
        &self,
        conditions: &WaitConditions,
        timeout: Duration,
        params: &TemplateParams,
        syntax: ConditionSyntax,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let data = params.to_data()?;
        let data = &data;
        poll_until(cancel, timeout, self.backoff, "wait conditions", || async move {
            match self.satisfied(conditions, data, syntax).await {
                Ok(true) => Ok(Poll::Ready(())),
                Ok(false) => Ok(Poll::Pending(None)),
                Err(EvalError::Soft(msg)) => {
                    debug!(error = %msg, "condition not evaluable yet");
                    Ok(Poll::Pending(Some(msg)))
                }
                Err(EvalError::Hard(e)) => Err(e),
            }
        })
        .await?;
        info!("wait conditions satisfied");
        Ok(())
    }

    async fn satisfied(
        &self,
        conditions: &WaitConditions,
        data: &Value,
        syntax: ConditionSyntax,
    ) -> std::result::Result<bool, EvalError> {
        for cond in &conditions.any_of {
            if self.evaluate(cond, data, syntax).await? {
                return Ok(true);
            }
        }
        if conditions.all_of.is_empty() {
            return Ok(false);
        }
        for cond in &conditions.all_of {
            if !self.evaluate(cond, data, syntax).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn evaluate(
        &self,
        cond: &Condition,
        data: &Value,
        syntax: ConditionSyntax,
    ) -> std::result::Result<bool, EvalError> {
        let obj_ref =
            render_object_ref(&self.refs, &cond.object_reference, data).map_err(classify)?;
        let obj = self
            .cluster
            .get_object(&obj_ref)
            .await
            .map_err(|e| EvalError::Soft(format!("fetch {}: {e}", obj_ref.display_name())))?;

        let rendered = match syntax {
            ConditionSyntax::GoTemplate => self.conditions.render(&cond.condition, &obj),
            ConditionSyntax::JsonPath => {
                let resolved = resolve_placeholders(&cond.condition, &obj).map_err(|e| match e {
                    JsonPathError::Syntax { .. } => {
                        EvalError::Hard(Error::execution("evaluate condition", e.to_string()))
                    }
                    JsonPathError::NotFound { .. } => EvalError::Soft(e.to_string()),
                })?;
                debug!(condition = %resolved, "resolved jsonpath placeholders");
                self.conditions.render(&resolved, &Value::Null)
            }
        }
        .map_err(|e| classify(e.into()))?;
        Ok(rendered.trim() == "true")
    }
}

fn classify(err: Error) -> EvalError {
    match &err {
        Error::Template(t) if t.is_syntax() => EvalError::Hard(err),
        _ => EvalError::Soft(err.to_string()),
    }
}
