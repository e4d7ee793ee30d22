//! Policy decision engine: turns intercepted calls into ALLOW/LOG/BLOCK
//! decisions by running an operator policy inside pooled sandboxes.

pub mod builder;
pub mod cache;
pub mod decision;
pub mod engine;
pub mod error;
pub mod event;
pub mod inflight;
pub mod key;
pub mod pool;
pub mod rules;
pub mod runtime;

pub use builder::ParameterBuilder;
pub use cache::{CacheStats, DecisionCache};
pub use decision::{Action, Decision, Verdict};
pub use engine::{CheckOutcome, DecisionEngine, DecisionSource, EngineSettings, EngineStats};
pub use error::{CheckError, PolicyLoadError, PoolError, ScriptError};
pub use event::{EventEmitter, NullEmitter, TelemetryEvent};
pub use key::derive_key;
pub use pool::{ContextLease, ContextState, InterpreterContext, InterpreterPool, PoolSettings, PoolStats};
pub use rules::{RuleSandbox, RuleSandboxFactory, RuleScript};
pub use runtime::{Deadline, PolicyScript, Sandbox, SandboxFactory};
