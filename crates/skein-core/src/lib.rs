pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod execution;
pub mod state;
pub mod traits;
pub mod types;

pub use config::{AppConfig, EngineConfig};
pub use definition::*;
pub use error::{Result, SkeinError, WorkflowErrorKind};
pub use event::{EngineEvent, EventBus, WorkflowEvent};
pub use execution::*;
pub use state::{ChannelSpec, MergeRule, StateSchema, StateUpdate, WorkflowState};
pub use types::*;
