//! # Job Execution
//!
//! - [`job_class`] - the pluggable row-mutation collaborator and its registry
//! - [`job_executor`] - sub-batch loop, throttling and job bookkeeping
//! - [`metrics`] - OpenTelemetry instruments for executed jobs
//! - [`worker_pool`] - bounded dispatch queue and its consumers

pub mod job_class;
pub mod job_executor;
pub mod metrics;
pub mod worker_pool;

pub use job_class::{JobClass, JobClassRegistry, NoopJobClass, SubBatch};
pub use job_executor::{JobExecutor, JobOutcome};
pub use metrics::JobMetrics;
pub use worker_pool::{
    ChannelDispatcher, InlineDispatcher, JobDispatch, JobDispatcher, JobHandler, WorkerPool,
};
