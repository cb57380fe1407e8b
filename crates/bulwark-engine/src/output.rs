//! Phase output protocol
//!
//! Containers publish phase outputs by printing lines of the form
//!
//! ```text
//! ###Phase-output###:{"key":"path","value":"s3://bucket/dump.sql"}
//! ```
//!
//! Everything else a container prints is logged. Text before the marker on
//! the same line is logged too. A marker whose tail is wrapped onto the next
//! line is reassembled.
//!
//! A container that prints no marker at all falls back to the plain
//! protocol: each line is a `key value` pair, and a lone word is a key with
//! an empty value, so `echo hi` yields `{"hi": ""}`.

use std::collections::BTreeMap;

use futures::io::{AsyncBufRead, AsyncBufReadExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{Error, Result};

/// Marker preceding a phase output record
pub const PHASE_OUTPUT_MARKER: &str = "###Phase-output###:";

/// Plain lines kept for the `key value` fallback
const MAX_PLAIN_LINES: usize = 1024;

/// Output of a phase, keyed by output name
pub type Output = BTreeMap<String, Value>;

#[derive(Debug, Deserialize, Serialize)]
struct OutputRecord {
    key: String,
    value: Value,
}

/// Where a stream of container output came from, for log fields
#[derive(Clone, Debug, Default)]
pub struct LogSource {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name, empty for the pod's default container
    pub container: String,
}

impl LogSource {
    /// Describe a pod container
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

/// True if `key` may name a phase output
pub fn is_valid_output_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Format a phase output line as a container would print it
pub fn phase_output_line(key: &str, value: impl Into<Value>) -> Result<String> {
    if !is_valid_output_key(key) {
        return Err(Error::execution(
            "format phase output",
            format!("invalid output key {key:?}"),
        ));
    }
    let record = OutputRecord {
        key: key.to_string(),
        value: value.into(),
    };
    Ok(format!(
        "{}{}",
        PHASE_OUTPUT_MARKER,
        serde_json::to_string(&record)?
    ))
}

/// Line-at-a-time phase output scanner
#[derive(Debug)]
pub struct OutputParser {
    source: LogSource,
    output: Output,
    // Offset into the marker where the next line must continue it
    pending_suffix: Option<usize>,
    plain: Vec<String>,
}

impl OutputParser {
    /// Start scanning output from `source`
    pub fn new(source: LogSource) -> Self {
        Self {
            source,
            output: Output::new(),
            pending_suffix: None,
            plain: Vec::new(),
        }
    }

    /// Scan one line, without its trailing newline
    pub fn feed_line(&mut self, line: &str) -> Result<()> {
        if let Some(split) = self.pending_suffix.take() {
            if let Some(content) = line.strip_prefix(&PHASE_OUTPUT_MARKER[split..]) {
                return self.capture(content);
            }
        }

        match line.find(PHASE_OUTPUT_MARKER) {
            Some(idx) => {
                self.log(&line[..idx]);
                self.capture(&line[idx + PHASE_OUTPUT_MARKER.len()..])
            }
            None => {
                self.log(line);
                if !line.trim().is_empty() && self.plain.len() < MAX_PLAIN_LINES {
                    self.plain.push(line.to_string());
                }
                self.pending_suffix = split_marker(line);
                Ok(())
            }
        }
    }

    /// Outputs captured, or the plain lines read as `key value` pairs when
    /// no marker was seen
    pub fn finish(self) -> Output {
        if !self.output.is_empty() {
            return self.output;
        }
        parse_key_value_output(&self.plain.join("\n"))
    }

    fn capture(&mut self, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(());
        }
        let record: OutputRecord = serde_json::from_str(content).map_err(|e| {
            Error::execution(self.context(), format!("invalid phase output {content:?}: {e}"))
        })?;
        if !is_valid_output_key(&record.key) {
            return Err(Error::execution(
                self.context(),
                format!("invalid output key {:?}", record.key),
            ));
        }
        debug!(pod = %self.source.pod, key = %record.key, "captured phase output");
        self.output.insert(record.key, record.value);
        Ok(())
    }

    fn log(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        info!(
            namespace = %self.source.namespace,
            pod = %self.source.pod,
            container = %self.source.container,
            "{}",
            text
        );
    }

    fn context(&self) -> String {
        format!("pod {}/{}", self.source.namespace, self.source.pod)
    }
}

/// If `line` ends with a proper prefix of the marker, where the rest begins
fn split_marker(line: &str) -> Option<usize> {
    (1..PHASE_OUTPUT_MARKER.len())
        .rev()
        .find(|&i| line.ends_with(&PHASE_OUTPUT_MARKER[..i]))
}

/// Log a container's output stream and collect its phase outputs
pub async fn log_and_parse<R>(reader: R, source: LogSource) -> Result<Output>
where
    R: AsyncBufRead + Unpin,
{
    let mut reader = reader;
    let mut parser = OutputParser::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| Error::execution(parser.context(), format!("read output: {e}")))?;
        if read == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        parser.feed_line(line.trim_end_matches(['\n', '\r']))?;
    }
    Ok(parser.finish())
}

/// Scan already-captured text, such as exec stdout
pub fn parse_output_text(text: &str, source: LogSource) -> Result<Output> {
    let mut parser = OutputParser::new(source);
    for line in text.lines() {
        parser.feed_line(line)?;
    }
    Ok(parser.finish())
}

/// Parse newline-delimited `key value` pairs
///
/// The key is the first whitespace-delimited token; the rest of the line,
/// trimmed, is the value, empty for a lone token. Blank lines and lines whose
/// key is not a valid output key are skipped.
pub fn parse_key_value_output(text: &str) -> Output {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            is_valid_output_key(key)
                .then(|| (key.to_string(), Value::String(value.trim().to_string())))
        })
        .collect()
}
