//! Concurrency-bounded benchmark and scanner for object stores.
//!
//! Both tools share one execution model: every object operation passes through an
//! [`AdmissionGate`](concurrency::AdmissionGate), which bounds the number of operations in flight,
//! and phases are separated by draining the gate.
//!
//! - [`benchmark`] writes objects of increasing size at increasing concurrency and reads them back,
//!   reporting throughput per phase.
//! - [`scanner`] lists a bucket and, while listing continues, downloads every object, decompresses
//!   it and counts its JSON records.
//!
//! Storage access goes through [`s3perf_service::StorageService`].
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod benchmark;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod payload;
pub mod queue;
pub mod scanner;

pub use error::{Error, Result};
