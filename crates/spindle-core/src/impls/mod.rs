//! Impls - ports の実装
//!
//! - **ShellExecutor**: `sh -c` でジョブを走らせる [`Executor`](crate::ports::Executor)

pub mod shell;

pub use self::shell::ShellExecutor;
