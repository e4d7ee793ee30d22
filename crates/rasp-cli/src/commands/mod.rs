use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use policy_engine::engine::DecisionEngine;
use policy_engine::event::{EventEmitter, NullEmitter};
use policy_engine::rules::{RuleSandboxFactory, RuleScript};
use policy_engine::runtime::PolicyScript;
use rasp_core::config::{Config, ConfigPaths};
use rasp_core::paths::expand_path_template;
use rasp_core::stack::NoStackCapturer;
use reporting::{ChannelEmitter, JsonlSink};

pub mod check;
pub mod config;
pub mod init;
pub mod policy;
pub mod replay;

pub const DEFAULT_POLICY: &str = include_str!("../../policies/default.toml");

pub struct Loaded {
    pub config: Config,
    pub paths: ConfigPaths,
}

/// Loads the config, falling back to defaults when the file does not exist.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Loaded> {
    let paths = match config_path {
        Some(path) => ConfigPaths::for_config_file(&path)?,
        None => ConfigPaths::resolve()?,
    };
    let config = if paths.config_path.exists() {
        Config::load(&paths.config_path)
            .with_context(|| format!("load config {}", paths.config_path.display()))?
    } else {
        tracing::info!(
            path = %paths.config_path.display(),
            "no config file, using defaults (run `rasp init` to create one)"
        );
        Config::default_config()
    };
    Ok(Loaded { config, paths })
}

/// Reads and validates the policy; the bundled default is used when the
/// configured file is missing and no override was given.
pub fn load_policy(loaded: &Loaded, override_path: Option<&Path>) -> Result<PolicyScript> {
    let script = match override_path {
        Some(path) => PolicyScript::load(path)?,
        None => {
            let path = expand_path_template(&loaded.config.policy.path, &loaded.paths);
            if path.exists() {
                PolicyScript::load(&path)?
            } else {
                tracing::warn!(path = %path.display(), "policy file missing, using bundled default");
                PolicyScript::new("bundled:default.toml", DEFAULT_POLICY)
            }
        }
    };
    RuleScript::compile(&script.source)
        .with_context(|| format!("invalid policy {}", script.name))?;
    Ok(script)
}

/// Telemetry goes to the configured JSONL log when reporting is enabled.
pub fn telemetry(loaded: &Loaded) -> Result<Option<Arc<ChannelEmitter>>> {
    if !loaded.config.reporting.enabled {
        return Ok(None);
    }
    let path = expand_path_template(&loaded.config.reporting.event_log, &loaded.paths);
    let sink = JsonlSink::open(&path)?;
    let emitter = ChannelEmitter::spawn(Box::new(sink), loaded.config.reporting.queue_capacity)?;
    tracing::debug!(path = %path.display(), "telemetry enabled");
    Ok(Some(Arc::new(emitter)))
}

pub fn build_engine(
    loaded: &Loaded,
    script: PolicyScript,
    emitter: Option<&Arc<ChannelEmitter>>,
) -> Result<DecisionEngine> {
    let emitter: Arc<dyn EventEmitter> = match emitter {
        Some(emitter) => Arc::clone(emitter) as Arc<dyn EventEmitter>,
        None => Arc::new(NullEmitter),
    };
    let engine = DecisionEngine::from_config(
        &loaded.config,
        Arc::new(RuleSandboxFactory),
        script,
        Arc::new(NoStackCapturer),
        emitter,
    )
    .context("start interpreter pool")?;
    Ok(engine)
}

pub fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
