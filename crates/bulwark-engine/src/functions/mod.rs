//! Built-in blueprint functions

mod kube_exec;
mod kube_exec_all;
mod kube_task;
mod prepare_data;
mod scale_workload;
mod wait;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use kube_exec::KubeExec;
pub use kube_exec_all::KubeExecAll;
pub use kube_task::KubeTask;
pub use prepare_data::PrepareData;
pub use scale_workload::ScaleWorkload;
pub use wait::{Wait, WaitV2};

use crate::args::{optional_arg, Args};
use crate::function::Function;
use crate::{Error, Result};

/// Every built-in function, freshly constructed
pub fn builtins() -> Vec<Arc<dyn Function>> {
    vec![
        Arc::new(KubeTask::default()),
        Arc::new(KubeExec::default()),
        Arc::new(KubeExecAll::default()),
        Arc::new(PrepareData::default()),
        Arc::new(ScaleWorkload::default()),
        Arc::new(Wait::default()),
        Arc::new(WaitV2::default()),
    ]
}

/// Split a whitespace-separated list argument such as `pods`
pub(crate) fn split_fields(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

/// Decode an optional string-to-string map argument such as `podLabels`
pub(crate) fn string_map_arg(args: &Args, key: &str) -> Result<BTreeMap<String, String>> {
    optional_arg(args, key, BTreeMap::new())
}

/// Parse a Go-style duration such as `30s`, `1h30m` or `1.5h`
pub(crate) fn parse_duration(text: &str) -> Result<Duration> {
    let invalid = || Error::invalid_arg("timeout", format!("invalid duration {text:?}"));
    let text = text.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() || text.starts_with('-') {
        return Err(invalid());
    }
    let text = text.strip_prefix('+').unwrap_or(text);

    let mut total = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let number: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" | "μs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += number * seconds;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_durations_parse() {
        assert_eq!(parse_duration("30s").expect("30s"), Duration::from_secs(30));
        assert_eq!(parse_duration("1h30m").expect("1h30m"), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5h").expect("1.5h"), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").expect("250ms"), Duration::from_millis(250));
        assert_eq!(parse_duration("0").expect("0"), Duration::ZERO);
    }

    #[test]
    fn bad_durations_are_argument_errors() {
        for bad in ["", "10", "5 minutes", "-1s", "1d", "h"] {
            let err = parse_duration(bad).expect_err("should be rejected");
            assert!(matches!(err, Error::Argument { ref key, .. } if key == "timeout"), "{bad}");
        }
    }

    #[test]
    fn fields_split_on_whitespace() {
        assert_eq!(split_fields(" web-0  web-1\nweb-2 "), vec!["web-0", "web-1", "web-2"]);
        assert!(split_fields("").is_empty());
    }
}
