//! Orchestrates one check from raw arguments to an enforcement decision.
//!
//! Every failure along the way ends in an ALLOW decision carrying a
//! diagnostic; nothing escapes to the intercepted call site.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use rasp_core::config::Config;
use rasp_core::stack::StackCapturer;
use rasp_core::types::{AgentMetadata, CheckParameter, CheckType, RawArg};

use crate::builder::ParameterBuilder;
use crate::cache::{CacheStats, DecisionCache};
use crate::decision::{Action, Decision, Verdict};
use crate::error::{CheckError, PoolError, ScriptError};
use crate::event::{EventEmitter, TelemetryEvent};
use crate::inflight::{Flight, InflightTable};
use crate::key::derive_key;
use crate::pool::{InterpreterPool, PoolSettings, PoolStats};
use crate::runtime::{Deadline, PolicyScript, SandboxFactory};

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Wall-clock bound for pool acquisition plus policy execution.
    pub check_timeout: Duration,
    pub acquire_timeout: Duration,
    pub coalesce_misses: bool,
    /// Emit telemetry for plain ALLOW decisions too.
    pub emit_allowed: bool,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            check_timeout: config.engine.check_timeout(),
            acquire_timeout: config.pool.acquire_timeout(),
            coalesce_misses: config.engine.coalesce_misses,
            emit_allowed: config.engine.emit_allowed,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_millis(2000),
            acquire_timeout: Duration::from_millis(500),
            coalesce_misses: false,
            emit_allowed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Cache,
    Policy,
    /// Result of a concurrent execution of the same key.
    Coalesced,
    /// The check failed; the label is the failure kind.
    FailOpen(&'static str),
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub decision: Arc<Decision>,
    pub source: DecisionSource,
    pub elapsed: Duration,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Cache => "cache",
            DecisionSource::Policy => "policy",
            DecisionSource::Coalesced => "coalesced",
            DecisionSource::FailOpen(_) => "fail_open",
        }
    }
}

impl CheckOutcome {
    pub fn is_blocking(&self) -> bool {
        self.decision.is_blocking()
    }

    pub fn is_cache_hit(&self) -> bool {
        self.source == DecisionSource::Cache
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineStats {
    pub cache: CacheStats,
    pub pool: PoolStats,
}

pub struct DecisionEngine {
    builder: ParameterBuilder,
    cache: Arc<DecisionCache>,
    pool: Arc<InterpreterPool>,
    emitter: Arc<dyn EventEmitter>,
    inflight: InflightTable,
    settings: EngineSettings,
    agent: AgentMetadata,
}

impl DecisionEngine {
    pub fn new(
        builder: ParameterBuilder,
        cache: Arc<DecisionCache>,
        pool: Arc<InterpreterPool>,
        emitter: Arc<dyn EventEmitter>,
        settings: EngineSettings,
        agent: AgentMetadata,
    ) -> Self {
        Self {
            builder,
            cache,
            pool,
            emitter,
            inflight: InflightTable::new(),
            settings,
            agent,
        }
    }

    /// Wires up cache, pool and builder from configuration and warms the
    /// pool. An error here means no interpreter can be created at all.
    pub fn from_config(
        config: &Config,
        factory: Arc<dyn SandboxFactory>,
        script: PolicyScript,
        capturer: Arc<dyn StackCapturer>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<Self, PoolError> {
        let pool = Arc::new(InterpreterPool::new(
            factory,
            script,
            PoolSettings::from(&config.pool),
        ));
        pool.warm_up()?;
        Ok(Self::new(
            ParameterBuilder::new(capturer, &config.stack),
            Arc::new(DecisionCache::new(config.cache.capacity)),
            pool,
            emitter,
            EngineSettings::from_config(config),
            config.agent_metadata(),
        ))
    }

    /// Runs a check for a raw intercepted call.
    pub fn check(&self, check_type: CheckType, args: &[RawArg<'_>]) -> CheckOutcome {
        let started = Instant::now();
        match self.builder.build(check_type, args) {
            Ok(param) => self.decide_from(&param, started),
            Err(err) => self.malformed(check_type, err, started),
        }
    }

    /// Like [`check`](Self::check), with frames taken from `capturer`
    /// instead of the configured one.
    pub fn check_with_stack(
        &self,
        check_type: CheckType,
        args: &[RawArg<'_>],
        capturer: &dyn StackCapturer,
    ) -> CheckOutcome {
        let started = Instant::now();
        match self.builder.build_with_capturer(check_type, args, capturer) {
            Ok(param) => self.decide_from(&param, started),
            Err(err) => self.malformed(check_type, err, started),
        }
    }

    /// Decides an already built parameter.
    pub fn decide(&self, param: &CheckParameter) -> CheckOutcome {
        self.decide_from(param, Instant::now())
    }

    /// Swaps the policy script. Cached decisions stay until evicted.
    pub fn reload_policy(&self, script: PolicyScript) -> Result<(), PoolError> {
        self.pool.reload(script)
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub fn builder(&self) -> &ParameterBuilder {
        &self.builder
    }

    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    pub fn pool(&self) -> &InterpreterPool {
        &self.pool
    }

    pub fn agent(&self) -> &AgentMetadata {
        &self.agent
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache.stats(),
            pool: self.pool.stats(),
        }
    }

    fn decide_from(&self, param: &CheckParameter, started: Instant) -> CheckOutcome {
        let check_type = param.check_type();
        let key = derive_key(param);

        if let Some(decision) = self.cache.get(&key) {
            tracing::trace!(%check_type, key = %key, "decision cache hit");
            return self.finish(param, decision, DecisionSource::Cache, started);
        }

        let (result, source) = if self.settings.coalesce_misses {
            match self.inflight.join(&key) {
                Flight::Leader(guard) => {
                    let result = self.execute(param, &key);
                    guard.complete(result.clone());
                    (result, DecisionSource::Policy)
                }
                Flight::Follower(follower) => (
                    follower.wait(self.settings.check_timeout),
                    DecisionSource::Coalesced,
                ),
            }
        } else {
            (self.execute(param, &key), DecisionSource::Policy)
        };

        match result {
            Ok(decision) => self.finish(param, decision, source, started),
            Err(err) => {
                let decision = self.fail_open(check_type, &err);
                self.finish(param, decision, DecisionSource::FailOpen(err.kind()), started)
            }
        }
    }

    /// Acquires a context, runs the policy and caches the merged decision.
    fn execute(&self, param: &CheckParameter, key: &str) -> Result<Arc<Decision>, CheckError> {
        let deadline = Deadline::after(self.settings.check_timeout);
        let wait = self.settings.acquire_timeout.min(deadline.remaining());
        let mut lease = match self.pool.acquire(wait) {
            Ok(lease) => lease,
            Err(PoolError::Exhausted { waited_ms }) if deadline.expired() => {
                return Err(CheckError::CheckTimeout(format!(
                    "no interpreter available within the {}ms check deadline (waited {waited_ms}ms)",
                    deadline.limit().as_millis()
                )))
            }
            Err(err) => return Err(err.into()),
        };

        let entry = param.check_type().as_str();
        let output = lease.invoke(entry, &param.to_value(), &deadline);
        if deadline.expired() {
            return Err(CheckError::CheckTimeout(format!(
                "policy execution exceeded {}ms",
                deadline.limit().as_millis()
            )));
        }

        let value = match output {
            Ok(value) => value,
            Err(ScriptError::Interrupted) => {
                return Err(CheckError::CheckTimeout(format!(
                    "policy execution interrupted after {}ms",
                    deadline.elapsed().as_millis()
                )))
            }
            Err(ScriptError::Corrupted(message)) => {
                lease.invalidate();
                return Err(CheckError::ScriptRuntime(message));
            }
            Err(ScriptError::Load(message)) => return Err(CheckError::ScriptLoad(message)),
            Err(ScriptError::Runtime(message)) => return Err(CheckError::ScriptRuntime(message)),
        };
        let policy_id = lease.policy_id();
        lease.release();

        let verdicts = parse_verdicts(value)?;
        let decision = Arc::new(Decision::from_verdicts(&verdicts, &policy_id));
        self.cache.put(key, Arc::clone(&decision));
        Ok(decision)
    }

    fn fail_open(&self, check_type: CheckType, err: &CheckError) -> Arc<Decision> {
        tracing::warn!(
            %check_type,
            kind = err.kind(),
            error = %err,
            "check failed, allowing operation"
        );
        Arc::new(Decision::fail_open(format!("{}: {err}", err.kind())))
    }

    fn malformed(&self, check_type: CheckType, err: CheckError, started: Instant) -> CheckOutcome {
        let decision = self.fail_open(check_type, &err);
        self.emitter
            .emit(TelemetryEvent::malformed(check_type, &decision, &self.agent));
        CheckOutcome {
            decision,
            source: DecisionSource::FailOpen(err.kind()),
            elapsed: started.elapsed(),
        }
    }

    fn finish(
        &self,
        param: &CheckParameter,
        decision: Arc<Decision>,
        source: DecisionSource,
        started: Instant,
    ) -> CheckOutcome {
        if decision.action == Action::Block {
            tracing::info!(
                check_type = %param.check_type(),
                policy_id = decision.policy_id.as_deref().unwrap_or("-"),
                rule = decision.rule_name.as_deref().unwrap_or("-"),
                "operation blocked"
            );
        }
        if decision.action != Action::Allow || decision.is_fail_open() || self.settings.emit_allowed {
            let cache_hit = source == DecisionSource::Cache;
            self.emitter
                .emit(TelemetryEvent::from_decision(param, &decision, cache_hit, &self.agent));
        }
        CheckOutcome {
            decision,
            source,
            elapsed: started.elapsed(),
        }
    }
}

/// Accepts an array of verdicts, a single verdict object, or null.
fn parse_verdicts(value: Value) -> Result<Vec<Verdict>, CheckError> {
    let verdicts = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Object(_) => vec![value],
        Value::Array(items) => items,
        other => {
            return Err(CheckError::ScriptRuntime(format!(
                "policy returned {other}, expected verdicts"
            )))
        }
    };
    verdicts
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|e| CheckError::ScriptRuntime(format!("invalid verdict: {e}")))
        })
        .collect()
}
