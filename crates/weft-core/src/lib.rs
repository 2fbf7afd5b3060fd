pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use context::{ExecutionContext, LoopContext};
pub use error::{Result, WeftError};
pub use event::EventBus;
pub use types::*;
pub use workflow::*;
