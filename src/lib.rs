//! ScaleTime Library
//!
//! Synthetic option-chain generation and resilient bulk loading into a
//! time-series store. The `scaletime` binary is a thin CLI over these
//! modules.

pub mod calendar;
pub mod config;
pub mod generator;
pub mod ingest;
pub mod loader;
pub mod pricing;
pub mod report;
pub mod session;
pub mod store;

pub use calendar::{DayKind, HolidaySet};
pub use config::Settings;
pub use ingest::{IngestObserver, IngestPlan, IngestSummary};
pub use loader::{BulkLoader, LoadError};
pub use store::{Connector, StoreConnection, StoreError};
