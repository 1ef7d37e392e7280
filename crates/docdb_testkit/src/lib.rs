//! # docdb Testkit
//!
//! Test utilities for docdb.
//!
//! This crate provides:
//! - Temp-dir fixtures and database helpers
//! - Property-based test generators using proptest
//! - Checkers comparing the engine against simple reference models
//! - Property suites and end-to-end scenarios (under `cfg(test)`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docdb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_database() {
//!     with_temp_db(|db| {
//!         let users = db.collection("users", CollectionSchema::new()).unwrap();
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod checks;
pub mod fixtures;
pub mod generators;

#[cfg(test)]
mod properties;
#[cfg(test)]
mod scenarios;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checks::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use docdb_core::{CollectionSchema, Config, Database, Filter, Query};
}

pub use checks::*;
pub use fixtures::*;
pub use generators::*;
