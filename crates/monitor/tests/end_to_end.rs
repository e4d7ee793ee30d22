use std::io::Write;
use std::sync::Arc;

use monitor::{Enforcement, Interceptor, Monitor};
use policy_engine::engine::{DecisionEngine, DecisionSource};
use policy_engine::rules::RuleSandboxFactory;
use policy_engine::runtime::PolicyScript;
use rasp_core::config::Config;
use rasp_core::stack::NoStackCapturer;
use rasp_core::types::{CheckType, RawArg};
use reporting::emitter::{ChannelEmitter, JsonlSink, TelemetryRecord};
use reporting::MemoryEmitter;

const POLICY: &str = r#"
id = "integration"

[[rules]]
name = "shell_exec"
on = "command"
action = "block"
message = "shell command execution detected"
when = [{ field = "command", matches = 'regex:(?:^|/)(?:ba|z|da|k)?sh\s+-c(?:\s|$)' }]

[[rules]]
name = "sql_audit"
on = "sql"
action = "log"
message = "query observed"

[[rules]]
name = "ssh_material"
on = "readFile"
action = "block"
message = "reading {path}"
when = [{ field = "path", contains = "/.ssh/" }]
"#;

fn engine_with(emitter: Arc<dyn policy_engine::event::EventEmitter>) -> Arc<DecisionEngine> {
    let mut config = Config::default_config();
    config.agent.app_id = "integration-app".to_string();
    config.pool.min_size = 1;
    config.pool.max_size = 2;
    Arc::new(
        DecisionEngine::from_config(
            &config,
            Arc::new(RuleSandboxFactory),
            PolicyScript::new("integration.toml", POLICY),
            Arc::new(NoStackCapturer),
            emitter,
        )
        .unwrap(),
    )
}

#[test]
fn test_shell_command_blocked_and_cached() {
    let emitter = Arc::new(MemoryEmitter::new());
    let engine = engine_with(emitter.clone());
    let interceptor = Interceptor::new(Arc::clone(&engine));

    let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "id".to_string()];
    let (first, first_outcome) = interceptor.evaluate(CheckType::Command, &[RawArg::List(&argv)]);
    assert_eq!(
        first,
        Enforcement::Block {
            message: "shell command execution detected".to_string()
        }
    );
    assert_eq!(first_outcome.source, DecisionSource::Policy);

    let (second, second_outcome) = interceptor.evaluate(CheckType::Command, &[RawArg::List(&argv)]);
    assert_eq!(second, first);
    assert_eq!(second_outcome.source, DecisionSource::Cache);
    assert_eq!(*second_outcome.decision, *first_outcome.decision);

    let stats = engine.stats();
    assert_eq!(stats.cache.hits, 1);
    assert_eq!(stats.cache.len, 1);

    let events = emitter.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].params["command"], "/bin/sh -c id");
    assert_eq!(events[0].rule_name.as_deref(), Some("shell_exec"));
    assert_eq!(events[0].app_id, "integration-app");
    assert!(events[1].cache_hit);
}

#[test]
fn test_native_command_form() {
    let engine = engine_with(Arc::new(MemoryEmitter::new()));
    let interceptor = Interceptor::new(engine);
    let enforcement = interceptor.intercept(
        CheckType::Command,
        &[RawArg::Bytes(b"/bin/bash\0"), RawArg::Bytes(b"-c\0cat /etc/passwd\0")],
    );
    assert!(enforcement.is_blocked());
}

#[test]
fn test_replay_session_report() {
    let dir = tempfile::tempdir().unwrap();
    let calls = dir.path().join("calls.jsonl");
    let mut file = std::fs::File::create(&calls).unwrap();
    writeln!(file, r#"{{"type":"command","args":["/bin/sh","-c","id"]}}"#).unwrap();
    writeln!(file, r#"{{"type":"command","args":["/bin/sh","-c","id"]}}"#).unwrap();
    writeln!(file, r#"{{"type":"sql","args":["mysql","select * from users"]}}"#).unwrap();
    writeln!(file, r#"{{"type":"readFile","args":["/home/app/.ssh/id_rsa"]}}"#).unwrap();
    writeln!(file, r#"{{"type":"writeFile","args":["/tmp/out.log"]}}"#).unwrap();
    writeln!(file, r#"{{"type":"ssrf","args":[null]}}"#).unwrap();
    drop(file);

    let engine = engine_with(Arc::new(MemoryEmitter::new()));
    let report = Monitor::new(engine).replay(&calls).unwrap();

    assert_eq!(report.app_id, "integration-app");
    assert_eq!(report.stats.total_checks, 6);
    assert_eq!(report.stats.blocked, 3);
    assert_eq!(report.stats.logged, 1);
    assert_eq!(report.stats.allowed, 2);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.cache_hits, 1);

    assert_eq!(report.events[1].source, "cache");
    assert_eq!(report.events[3].decision.messages, vec!["reading /home/app/.ssh/id_rsa"]);
    assert_eq!(report.events[5].source, "fail_open");
    assert!(report.human_summary().contains("3 operations would have been blocked."));
}

#[test]
fn test_events_reach_jsonl_sink() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("events.jsonl");
    let emitter = Arc::new(ChannelEmitter::spawn(Box::new(JsonlSink::open(&log).unwrap()), 64).unwrap());
    let engine = engine_with(emitter.clone());
    let interceptor = Interceptor::new(engine);

    interceptor.intercept(CheckType::ReadFile, &[RawArg::Str("/root/.ssh/authorized_keys")]);
    interceptor.intercept(CheckType::WriteFile, &[RawArg::Str("/tmp/ok")]);
    emitter.shutdown();

    let contents = std::fs::read_to_string(&log).unwrap();
    let records: Vec<TelemetryRecord> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 1);
    match &records[0] {
        TelemetryRecord::Event(event) => {
            assert_eq!(event.check_type, CheckType::ReadFile);
            assert_eq!(event.policy_id.as_deref(), Some("integration"));
        }
        other => panic!("unexpected record {other:?}"),
    }
}
