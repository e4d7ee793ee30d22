//! Built-in policy runtime: TOML rule scripts evaluated in-process.

pub mod pattern;
pub mod sandbox;
pub mod script;

pub use sandbox::{RuleSandbox, RuleSandboxFactory};
pub use script::{Rule, RuleScript, RuleTarget};
