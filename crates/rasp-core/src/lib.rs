pub mod config;
pub mod error;
pub mod ids;
pub mod paths;
pub mod stack;
pub mod types;

pub use config::{Config, ConfigPaths};
pub use error::RaspError;
pub use ids::{AgentId, EventId};
pub use stack::{FrameListCapturer, NativeStackCapturer, NoStackCapturer, StackCapturer};
pub use types::{AgentMetadata, CheckKind, CheckParameter, CheckType, RawArg};
