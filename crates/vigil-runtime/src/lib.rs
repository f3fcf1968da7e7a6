#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-runtime** – Runtime wiring for Vigil.
//!
//! Binds the deterministic core together: typed configuration, the
//! [`ReplayBridge`] (store + projector + comparator + backfill + alerts),
//! and the cooperative driver for the speculative scheduler.

pub mod bridge;
pub mod config;
pub mod driver;

pub use bridge::{IngestReport, ReplayBridge};
pub use config::{
    BackfillSection, ComparatorSection, ReplayConfig, StoreConfig, StoreKind, TracingConfig,
    VigilConfig,
};
pub use driver::run_scheduler;
