use std::sync::Arc;

use serde::Serialize;

use policy_engine::engine::{CheckOutcome, DecisionEngine};
use rasp_core::stack::StackCapturer;
use rasp_core::types::{CheckType, RawArg};

const DEFAULT_BLOCK_MESSAGE: &str = "operation blocked by security policy";

/// What the hook should do with the intercepted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "enforcement", rename_all = "lowercase")]
pub enum Enforcement {
    Proceed,
    Block { message: String },
}

impl Enforcement {
    pub fn from_outcome(outcome: &CheckOutcome) -> Self {
        if !outcome.is_blocking() {
            return Enforcement::Proceed;
        }
        let message = if outcome.decision.messages.is_empty() {
            DEFAULT_BLOCK_MESSAGE.to_string()
        } else {
            outcome.decision.messages.join("; ")
        };
        Enforcement::Block { message }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Enforcement::Block { .. })
    }
}

/// Callback surface handed to the instrumentation layer.
///
/// Cheap to clone; every clone shares the same engine.
#[derive(Clone)]
pub struct Interceptor {
    engine: Arc<DecisionEngine>,
}

impl Interceptor {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    /// Called synchronously before the sensitive operation runs.
    pub fn intercept(&self, check_type: CheckType, args: &[RawArg<'_>]) -> Enforcement {
        self.evaluate(check_type, args).0
    }

    /// Same as [`intercept`](Self::intercept), also returning the outcome.
    pub fn evaluate(&self, check_type: CheckType, args: &[RawArg<'_>]) -> (Enforcement, CheckOutcome) {
        let outcome = self.engine.check(check_type, args);
        (Enforcement::from_outcome(&outcome), outcome)
    }

    /// For hooks that already hold the caller's frames.
    pub fn intercept_with_stack(
        &self,
        check_type: CheckType,
        args: &[RawArg<'_>],
        capturer: &dyn StackCapturer,
    ) -> Enforcement {
        let outcome = self.engine.check_with_stack(check_type, args, capturer);
        Enforcement::from_outcome(&outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_engine::event::NullEmitter;
    use policy_engine::rules::RuleSandboxFactory;
    use policy_engine::runtime::PolicyScript;
    use rasp_core::config::Config;
    use rasp_core::stack::{FrameListCapturer, NoStackCapturer};

    const POLICY: &str = r#"
id = "hooks"

[[rules]]
name = "deserialize_gadget"
on = "deserialization"
action = "block"
message = "blocked gadget {class_name}"
when = [{ field = "class_name", matches = "*InvokerTransformer" }]

[[rules]]
name = "silent_block"
on = "ssrf"
action = "block"
when = [{ field = "hostname", equals = "169.254.169.254" }]

[[rules]]
name = "reflective_command"
on = "command"
action = "block"
message = "command from reflection"
when = [{ field = "stack", contains = "reflect" }]
"#;

    fn interceptor() -> Interceptor {
        let engine = DecisionEngine::from_config(
            &Config::default_config(),
            Arc::new(RuleSandboxFactory),
            PolicyScript::new("hooks.toml", POLICY),
            Arc::new(NoStackCapturer),
            Arc::new(NullEmitter),
        )
        .unwrap();
        Interceptor::new(Arc::new(engine))
    }

    #[test]
    fn test_block_carries_policy_message() {
        let interceptor = interceptor();
        let enforcement = interceptor.intercept(
            CheckType::Deserialization,
            &[RawArg::Str("org.apache.commons.collections.functors.InvokerTransformer")],
        );
        assert_eq!(
            enforcement,
            Enforcement::Block {
                message: "blocked gadget org.apache.commons.collections.functors.InvokerTransformer"
                    .to_string()
            }
        );
    }

    #[test]
    fn test_block_without_message_uses_default() {
        let interceptor = interceptor();
        let enforcement = interceptor.intercept(
            CheckType::Ssrf,
            &[RawArg::Str("http://169.254.169.254/latest/meta-data/")],
        );
        assert_eq!(
            enforcement,
            Enforcement::Block {
                message: DEFAULT_BLOCK_MESSAGE.to_string()
            }
        );
    }

    #[test]
    fn test_failures_proceed() {
        let interceptor = interceptor();
        let (enforcement, outcome) = interceptor.evaluate(CheckType::Ssrf, &[RawArg::Null]);
        assert_eq!(enforcement, Enforcement::Proceed);
        assert!(outcome.decision.is_fail_open());
    }

    #[test]
    fn test_stack_aware_hook() {
        let interceptor = interceptor();
        let frames = FrameListCapturer::new(vec![
            "java.lang.reflect.Method.invoke".to_string(),
            "App.main".to_string(),
        ]);
        let enforcement =
            interceptor.intercept_with_stack(CheckType::Command, &[RawArg::Str("whoami")], &frames);
        assert!(enforcement.is_blocked());

        // Frames are not part of the cache key, so use a different command.
        let plain = interceptor.intercept(CheckType::Command, &[RawArg::Str("hostname")]);
        assert_eq!(plain, Enforcement::Proceed);
    }

    #[test]
    fn test_enforcement_serializes_tagged() {
        let json = serde_json::to_value(Enforcement::Block {
            message: "no".to_string(),
        })
        .unwrap();
        assert_eq!(json["enforcement"], "block");
        assert_eq!(json["message"], "no");
    }
}
