//! Batch engine for the tourism-and-weather data platform.
//!
//! A single process runs a persistent scheduler whose jobs harvest the KTO
//! and KMA open-data APIs through a quota-governed, multi-key HTTP gateway,
//! archive every raw response, transform records into typed rows, land them
//! with chunked upserts, and score the results before dependent jobs may
//! run.
//!
//! # Architecture
//!
//! ```text
//! Scheduler ──fires──► Job (validate ► execute ► cleanup)
//!     │                   │
//!     │                   ├─► HttpExecutor ─► Governor ─► KeyRegistry
//!     │                   │        └─► RawArchive
//!     │                   ├─► Transform ─► BulkUpsertEngine
//!     │                   └─► QualityGate
//!     └─► ExecutionLedger (+ AlertGate on final failures)
//! ```

pub mod common;
pub mod domains;
pub mod kernel;
pub mod pipeline;
pub mod quality;

pub use common::{BatchConfig, BatchError, Severity};
pub use kernel::BatchKernel;
