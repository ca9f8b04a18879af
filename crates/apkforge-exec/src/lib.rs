//! Execution primitives for apkforge
//!
//! This crate holds the concurrency and process plumbing shared by every
//! build stage:
//! - [`CreatingCache`]: blocking, deduplicating memoization (one producer per key)
//! - [`WaitableExecutor`]: fan-out/fan-in over a [`WorkerPool`] with quick-fail
//!   or collect-all joins
//! - [`ProcessRunner`]: external tool invocation with output capture,
//!   cancellation and timeouts
//!
//! Nothing here knows about Android; the build stages live in the root crate.

pub mod cache;
pub mod cancel;
pub mod latch;
pub mod pool;
pub mod process;
pub mod waitable;

pub use cache::{CacheBusy, CacheStats, CreatingCache};
pub use cancel::CancellationToken;
pub use latch::Latch;
pub use pool::{PoolClosed, WorkerPool};
pub use process::{
    OutputHandler, OutputStream, ProcessError, ProcessInfo, ProcessResult, ProcessRunner,
    ProcessRunnerConfig, REDACTED,
};
pub use waitable::{TaskError, WaitableExecutor};
