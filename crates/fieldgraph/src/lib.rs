//! Fieldgraph - dependency tracking for computed table fields.
//!
//! Formula and lookup fields derive their values from other fields, possibly
//! in other tables reached through link-row fields. This crate keeps the
//! resulting dependency graph:
//!
//! - an edge store of `dependant -> dependency` edges, including broken
//!   references that can heal later
//! - transitive dependency closures with a depth bound and cycle detection
//! - rebuilding a field's edges from its definition, rejecting edits that
//!   would create a circular reference
//! - scheduling formula version migrations in dependency order
//!
//! The engine is exposed through the async [`storage::FieldDependencyStore`]
//! trait; see [`storage::create_store`].

#![forbid(unsafe_code)]

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod export;
pub mod migrations;
pub mod references;
pub mod storage;

pub use error::{Error, Result};
pub use storage::{ClosureEntry, DependencyClosure};
