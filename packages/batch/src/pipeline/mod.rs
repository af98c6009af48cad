//! Raw-to-typed transformation and bulk insertion.

pub mod mapping;
pub mod transform;
pub mod upsert;

pub use mapping::{FieldKind, FieldMap, TableMapping};
pub use transform::{transform_page, ColValue, Discard, TransformOutput, TypedRow};
pub use upsert::{BulkUpsertEngine, TuningPreset, TuningProfile, UpsertPlan, UpsertReport};
