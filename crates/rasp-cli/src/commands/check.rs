use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use monitor::{Enforcement, Interceptor};
use policy_engine::decision::Decision;
use rasp_core::types::{CheckType, RawArg};

use super::{build_engine, load_config, load_policy, telemetry};

pub struct CheckInputs {
    pub config_path: Option<PathBuf>,
    pub policy: Option<PathBuf>,
    pub check_type: CheckType,
    pub args: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CheckReport<'a> {
    check_type: CheckType,
    #[serde(flatten)]
    enforcement: Enforcement,
    decision: &'a Decision,
    source: &'static str,
    elapsed_us: u128,
}

pub fn execute(inputs: CheckInputs) -> Result<()> {
    let loaded = load_config(inputs.config_path)?;
    let script = load_policy(&loaded, inputs.policy.as_deref())?;
    let emitter = telemetry(&loaded)?;
    let engine = Arc::new(build_engine(&loaded, script, emitter.as_ref())?);
    let interceptor = Interceptor::new(Arc::clone(&engine));

    let args: Vec<RawArg<'_>> = inputs.args.iter().map(|arg| RawArg::Str(arg)).collect();
    let (enforcement, outcome) = interceptor.evaluate(inputs.check_type, &args);

    let report = CheckReport {
        check_type: inputs.check_type,
        enforcement,
        decision: &outcome.decision,
        source: outcome.source.as_str(),
        elapsed_us: outcome.elapsed.as_micros(),
    };
    let output = serde_json::to_string_pretty(&report).context("render decision JSON")?;
    println!("{}", output);

    engine.shutdown();
    if let Some(emitter) = emitter {
        emitter.shutdown();
    }
    Ok(())
}
