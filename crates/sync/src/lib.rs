//! Reconciliation orchestrator.
//!
//! The [`Mapper`] consumes candidates from backend pulls and webhooks,
//! merges them against stored state and stages the changed rows for one
//! batch commit. The [`Exporter`] walks stored state the other way and
//! collects the push requests that would bring each backend in line.

pub mod export;
pub mod ignore;
pub mod mapper;

pub use export::Exporter;
pub use ignore::{IgnoreError, IgnoreList, IgnoreRule};
pub use mapper::{Mapper, MapperStats};
