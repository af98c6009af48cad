//! Engine kernel: key management, pacing, HTTP execution, raw archival,
//! job scheduling, and alert egress.

pub mod archive;
pub mod executor;
pub mod governor;
pub mod jobs;
#[allow(clippy::module_inception)]
mod kernel;
pub mod keys;
pub mod notify;

pub use archive::{ArchiveWriter, MemoryArchiveWriter, PgArchiveWriter, RawCall};
pub use executor::{ApiResponse, HarvestPage, HttpExecutor, PagedHarvest};
pub use governor::{ConcurrencyGovernor, GovernorSnapshot};
pub use kernel::{BatchKernel, TestKernelParts};
pub use keys::{CallOutcome, KeyRegistry, LeasedKey};
pub use notify::{Alert, AlertGate, LogNotifier, Notifier};
