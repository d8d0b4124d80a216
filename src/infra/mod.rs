//! 基础设施模块
//!
//! 封装本地进程执行

pub mod command;

pub use command::{shell_quote, CommandError, CommandRunner};
