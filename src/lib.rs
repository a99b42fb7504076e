//! Indexing-state reconciliation engine.
//!
//! Keeps a hosted search index in step with a multi-tenant catalog:
//! [`discovery`] turns provider candidates into pending work on persisted
//! [`types::IndexingRecord`]s, [`sync`] pushes that work through external
//! pipelines, [`response`] folds the outcome back into record state and
//! [`history`] rolls up the attempts.

pub mod config;
pub mod conflict;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod history;
pub mod response;
pub mod store;
pub mod sync;
pub mod types;

pub use error::{Error, Result};
