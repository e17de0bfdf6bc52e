//! Ports - 抽象化レイヤー
//!
//! Worker / DlqManager はここの trait にだけ依存する。

pub mod clock;
pub mod executor;
pub mod source;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::{Executor, OutputChunk, OutputSink, OutputStream};
pub use self::source::{JobLease, JobSource};
