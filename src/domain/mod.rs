//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod app;
pub mod command;
pub mod container;
pub mod deploy;
pub mod fs;
pub mod profile;

// Re-exports for convenience
pub use app::{ApplicationConfig, Environment};
pub use command::{Command, CommandOutcome};
pub use deploy::{DeployTarget, DeploymentRun, RunState, StageStatus};
pub use profile::{ConnectionProfile, Credential};
