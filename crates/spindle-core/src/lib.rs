//! spindle-core
//!
//! Local job queue: shell commands as jobs, leased by concurrent workers,
//! retried with exponential backoff, dead-lettered when retries run out.
//!
//! # モジュール構成
//! - **domain**: Job とその状態遷移 (state, ids, backoff, job, timestamp)
//! - **ports**: 抽象化レイヤー (Clock, Executor, JobSource / JobLease)
//! - **queue**: in-memory スケジューリング index と `SharedQueue`
//! - **storage**: Storage contract + file / sqlite / memory backends
//! - **dlq**: DLQ の一覧・復活・掃除
//! - **worker**: 実行ループ群
//! - **impls**: ports の実装 (ShellExecutor)
//! - **config** / **observability** / **error**

pub mod config;
pub mod dlq;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod storage;
pub mod worker;

pub use config::SpindleConfig;
pub use dlq::DlqManager;
pub use domain::{Backoff, Job, JobId, JobOptions, JobState};
pub use error::{Result, SpindleError};
pub use observability::QueueCounts;
pub use storage::{Storage, StorageDriver, StorageSource};
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerHandle, WorkerStats, WorkerStatsSnapshot};
