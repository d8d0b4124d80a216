//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod containers;
pub mod deploy;
pub mod dispatch;
pub mod remote_fs;
pub mod ssh;
