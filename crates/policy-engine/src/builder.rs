//! Normalizes raw intercepted arguments into a [`CheckParameter`].

use std::sync::Arc;

use rasp_core::config::StackConfig;
use rasp_core::stack::StackCapturer;
use rasp_core::types::{CheckKind, CheckParameter, CheckType, RawArg};

use crate::error::CheckError;

pub struct ParameterBuilder {
    capturer: Arc<dyn StackCapturer>,
    start_offset: usize,
    max_depth: usize,
}

impl ParameterBuilder {
    pub fn new(capturer: Arc<dyn StackCapturer>, config: &StackConfig) -> Self {
        Self {
            capturer,
            start_offset: config.start_offset,
            max_depth: config.max_depth,
        }
    }

    /// Builds a parameter, attaching the stack from the configured capturer.
    pub fn build(&self, check_type: CheckType, args: &[RawArg<'_>]) -> Result<CheckParameter, CheckError> {
        self.build_with_capturer(check_type, args, self.capturer.as_ref())
    }

    /// Builds a parameter using frames from a call-specific capturer.
    pub fn build_with_capturer(
        &self,
        check_type: CheckType,
        args: &[RawArg<'_>],
        capturer: &dyn StackCapturer,
    ) -> Result<CheckParameter, CheckError> {
        let kind = extract_kind(check_type, args)?;
        let mut param = CheckParameter::new(kind);
        if check_type.supports_stack() {
            param.stack = capturer.capture(self.start_offset, self.max_depth);
        }
        Ok(param)
    }
}

fn extract_kind(check_type: CheckType, args: &[RawArg<'_>]) -> Result<CheckKind, CheckError> {
    let kind = match check_type {
        CheckType::Command => {
            let parts = command_parts(args);
            if parts.iter().all(|part| part.is_empty()) {
                return Err(malformed(check_type, "no command arguments"));
            }
            CheckKind::Command {
                command: parts.join(" "),
            }
        }
        CheckType::Directory => CheckKind::Directory {
            path: required(args, 0, check_type, "path")?,
            realpath: optional(args, 1),
        },
        CheckType::ReadFile => CheckKind::ReadFile {
            path: required(args, 0, check_type, "path")?,
            realpath: optional(args, 1),
        },
        CheckType::WriteFile => CheckKind::WriteFile {
            path: required(args, 0, check_type, "path")?,
            realpath: optional(args, 1),
        },
        CheckType::Include => CheckKind::Include {
            path: required(args, 0, check_type, "path")?,
            realpath: optional(args, 1),
        },
        CheckType::Rename => CheckKind::Rename {
            source: required(args, 0, check_type, "source")?,
            dest: required(args, 1, check_type, "dest")?,
        },
        CheckType::Sql => CheckKind::Sql {
            server: optional(args, 0).unwrap_or_default(),
            query: required(args, 1, check_type, "query")?,
        },
        CheckType::Mongo => CheckKind::Mongo {
            server: optional(args, 0).unwrap_or_default(),
            query: required(args, 1, check_type, "query")?,
            class_name: optional(args, 2).unwrap_or_default(),
            method: optional(args, 3).unwrap_or_default(),
        },
        CheckType::Ssrf => {
            let url = required(args, 0, check_type, "url")?;
            let hostname = hostname_from_url(&url);
            if hostname.is_empty() {
                return Err(malformed(check_type, "url has no host"));
            }
            CheckKind::Ssrf { url, hostname }
        }
        CheckType::Xxe => CheckKind::Xxe {
            entity: required(args, 0, check_type, "entity")?,
        },
        CheckType::Deserialization => CheckKind::Deserialization {
            class_name: required(args, 0, check_type, "class_name")?,
        },
    };
    Ok(kind)
}

/// Collects the argv of a process spawn.
///
/// Exactly one or two byte arguments are the native form: a NUL-terminated
/// program name optionally followed by a block of NUL-separated arguments.
/// Every other shape is read one argument at a time.
fn command_parts(args: &[RawArg<'_>]) -> Vec<String> {
    let mut parts = Vec::new();
    match args {
        [RawArg::Bytes(program)] => {
            push_bytes(&mut parts, program);
        }
        [RawArg::Bytes(program), RawArg::Bytes(block)] => {
            push_bytes(&mut parts, program);
            let block: &[u8] = block;
            let block = block.strip_suffix(&[0u8]).unwrap_or(block);
            if !block.is_empty() {
                parts.extend(block.split(|byte| *byte == 0).map(lossy));
            }
        }
        _ => {
            for arg in args {
                match arg {
                    RawArg::Null => {}
                    RawArg::Str(value) => parts.push(value.to_string()),
                    RawArg::Bytes(bytes) => push_bytes(&mut parts, bytes),
                    RawArg::List(values) => parts.extend(values.iter().cloned()),
                }
            }
        }
    }
    parts
}

/// Pushes one byte argument without its NUL terminator.
fn push_bytes(parts: &mut Vec<String>, bytes: &[u8]) {
    let bytes = bytes.strip_suffix(&[0u8]).unwrap_or(bytes);
    if !bytes.is_empty() {
        parts.push(lossy(bytes));
    }
}

fn text(arg: &RawArg<'_>) -> Option<String> {
    match arg {
        RawArg::Str(value) => Some(value.to_string()),
        RawArg::Bytes(bytes) => Some(lossy(bytes)),
        RawArg::List(values) => Some(values.join(" ")),
        RawArg::Null => None,
    }
}

fn required(
    args: &[RawArg<'_>],
    index: usize,
    check_type: CheckType,
    field: &str,
) -> Result<String, CheckError> {
    args.get(index)
        .and_then(text)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| malformed(check_type, &format!("missing {field}")))
}

fn optional(args: &[RawArg<'_>], index: usize) -> Option<String> {
    args.get(index).and_then(text).filter(|value| !value.is_empty())
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn malformed(check_type: CheckType, reason: &str) -> CheckError {
    CheckError::MalformedInput(format!("{check_type}: {reason}"))
}

/// Host part of a URL, lowercased, without userinfo or port.
fn hostname_from_url(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    let host_port = authority
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(authority);
    let host = if let Some(bracketed) = host_port.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or_default()
    } else {
        host_port
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(host_port)
    };
    host.to_lowercase()
}
