//! 运行时状态模块
//!
//! 应用状态、配置持久化、部署运行与输出流

pub mod app_state;
pub mod credential_store;
pub mod run_store;
pub mod stream_hub;

pub use app_state::AppState;
pub use credential_store::CredentialStore;
pub use run_store::RunStore;
pub use stream_hub::StreamHub;
