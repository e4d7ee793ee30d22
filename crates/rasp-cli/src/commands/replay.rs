use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use monitor::Monitor;
use reporting::json::render_json;
use reporting::timeline::timeline;

use super::{build_engine, load_config, load_policy, telemetry};

pub fn execute(
    config_path: Option<PathBuf>,
    policy: Option<PathBuf>,
    input: &Path,
    json: bool,
) -> Result<()> {
    let loaded = load_config(config_path)?;
    let script = load_policy(&loaded, policy.as_deref())?;
    let emitter = telemetry(&loaded)?;
    let engine = Arc::new(build_engine(&loaded, script, emitter.as_ref())?);

    let report = Monitor::new(Arc::clone(&engine)).replay(input)?;

    if json {
        println!("{}", render_json(&report)?);
    } else {
        for line in timeline(&report.events) {
            println!("{}", line);
        }
        println!();
        println!("{}", report.human_summary());
    }

    let stats = engine.stats();
    tracing::debug!(
        cache_hits = stats.cache.hits,
        cache_misses = stats.cache.misses,
        contexts = stats.pool.total,
        "replay engine stats"
    );
    engine.shutdown();
    if let Some(emitter) = emitter {
        emitter.shutdown();
        let delivery = emitter.stats();
        if delivery.dropped > 0 || delivery.failed > 0 {
            tracing::warn!(
                dropped = delivery.dropped,
                failed = delivery.failed,
                "some telemetry was not delivered"
            );
        }
    }
    Ok(())
}
