//! Bulk SMS Dispatch Engine
//!
//! This crate provides the dispatch core:
//! - Dispatcher: Run lifecycle, rate-paced batch loop, readiness-aware rotation
//! - Session Worker: One SMPP session per task with local send and retry queues
//! - Retry: At-most-two-attempts policy for rejected submissions
//! - Throughput: tps to batch pacing, license ceiling and peak usage
//! - Session seam: Connector traits over the SMPP client

pub mod dispatch_metrics;
pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod select;
pub mod session;
pub mod throughput;
pub mod worker;

pub use dispatcher::{CompletionHook, Dispatcher, DispatcherConfig};
pub use error::DispatchError;
pub use retry::{handle_ack, AckDecision, RetryRecord};
pub use select::select_ready_worker;
pub use session::{Session, SessionConnector, SmppConnector};
pub use throughput::{
    auto_tps, message_parts, plan, resolve_tps, BatchPlan, PeakUsageSource, StaticPeakUsage,
    ThroughputError,
};
pub use worker::{spawn_worker, WorkerConfig, WorkerHandle};

pub type Result<T> = std::result::Result<T, DispatchError>;
