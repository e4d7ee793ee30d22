use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use policy_engine::engine::DecisionEngine;
use rasp_core::stack::FrameListCapturer;
use rasp_core::types::{CheckType, RawArg};
use reporting::{ReportEvent, SessionReport};

pub mod interceptor;

pub use interceptor::{Enforcement, Interceptor};

/// One argument of a recorded call. `null`, a string, or a string list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordedArg {
    Text(String),
    List(Vec<String>),
    Null,
}

impl RecordedArg {
    pub fn as_raw(&self) -> RawArg<'_> {
        match self {
            RecordedArg::Text(text) => RawArg::Str(text),
            RecordedArg::List(items) => RawArg::List(items),
            RecordedArg::Null => RawArg::Null,
        }
    }
}

/// An intercepted call captured for later replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedCall {
    #[serde(rename = "type")]
    pub check_type: CheckType,
    #[serde(default)]
    pub args: Vec<RecordedArg>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
}

impl RecordedCall {
    pub fn raw_args(&self) -> Vec<RawArg<'_>> {
        self.args.iter().map(RecordedArg::as_raw).collect()
    }
}

pub trait EventSource {
    fn next_call(&mut self) -> Result<Option<RecordedCall>>;
}

pub struct NoopEventSource;

impl EventSource for NoopEventSource {
    fn next_call(&mut self) -> Result<Option<RecordedCall>> {
        Ok(None)
    }
}

/// Reads one [`RecordedCall`] per line; blank lines are skipped.
pub struct JsonlEventSource<R> {
    reader: R,
    line_number: usize,
}

impl JsonlEventSource<BufReader<File>> {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open call log {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> JsonlEventSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_number: 0,
        }
    }
}

impl<R: BufRead> EventSource for JsonlEventSource<R> {
    fn next_call(&mut self) -> Result<Option<RecordedCall>> {
        loop {
            let mut line = String::new();
            let bytes = self.reader.read_line(&mut line)?;
            if bytes == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let call: RecordedCall = serde_json::from_str(&line)
                .with_context(|| format!("parse recorded call on line {}", self.line_number))?;
            return Ok(Some(call));
        }
    }
}

/// Replays recorded calls through the decision engine.
pub struct Monitor {
    engine: Arc<DecisionEngine>,
}

impl Monitor {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine }
    }

    pub fn replay(&self, path: &Path) -> Result<SessionReport> {
        let mut source = JsonlEventSource::from_path(path)?;
        self.replay_source(&mut source)
    }

    pub fn replay_source(&self, source: &mut dyn EventSource) -> Result<SessionReport> {
        let started_at = OffsetDateTime::now_utc();
        let mut events = Vec::new();
        let mut sequence = 0u64;

        while let Some(call) = source.next_call()? {
            sequence += 1;
            events.push(self.replay_call(sequence, &call));
        }

        tracing::debug!(checks = events.len(), "replay finished");
        Ok(SessionReport::new(
            self.engine.agent().app_id.clone(),
            started_at,
            Some(OffsetDateTime::now_utc()),
            events,
        ))
    }

    fn replay_call(&self, sequence: u64, call: &RecordedCall) -> ReportEvent {
        let args = call.raw_args();
        let frames = FrameListCapturer::new(call.stack.clone());
        match self
            .engine
            .builder()
            .build_with_capturer(call.check_type, &args, &frames)
        {
            Ok(param) => {
                let outcome = self.engine.decide(&param);
                ReportEvent::from_outcome(sequence, call.check_type, param.to_value(), &outcome)
            }
            Err(_) => {
                // Goes through the engine again so the failure is logged
                // and emitted like any live malformed call.
                let outcome = self.engine.check(call.check_type, &args);
                let raw = json!({ "args": call.args });
                ReportEvent::from_outcome(sequence, call.check_type, raw, &outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_recorded_call_parsing() {
        let line = r#"{"type":"command","args":["/bin/sh",null,["-c","id"]],"stack":["Main.run"]}"#;
        let call: RecordedCall = serde_json::from_str(line).unwrap();
        assert_eq!(call.check_type, CheckType::Command);
        assert_eq!(
            call.args,
            vec![
                RecordedArg::Text("/bin/sh".to_string()),
                RecordedArg::Null,
                RecordedArg::List(vec!["-c".to_string(), "id".to_string()]),
            ]
        );
        assert_eq!(call.stack, vec!["Main.run"]);
        assert!(matches!(call.raw_args()[1], RawArg::Null));
    }

    #[test]
    fn test_jsonl_source_skips_blank_lines() {
        let input = "{\"type\":\"sql\",\"args\":[\"mysql\",\"select 1\"]}\n\n{\"type\":\"readFile\",\"args\":[\"/etc/passwd\"]}\n";
        let mut source = JsonlEventSource::new(Cursor::new(input));
        assert_eq!(source.next_call().unwrap().unwrap().check_type, CheckType::Sql);
        assert_eq!(source.next_call().unwrap().unwrap().check_type, CheckType::ReadFile);
        assert!(source.next_call().unwrap().is_none());
    }

    #[test]
    fn test_jsonl_source_reports_bad_line() {
        let input = "{\"type\":\"sql\",\"args\":[]}\n{\"type\":\"exec\"}\n";
        let mut source = JsonlEventSource::new(Cursor::new(input));
        assert!(source.next_call().unwrap().is_some());
        let err = source.next_call().unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_noop_source_is_empty() {
        assert!(NoopEventSource.next_call().unwrap().is_none());
    }
}
