use std::io;

use thiserror::Error;

/// Main error type for the indexsync engine.
///
/// Most failures inside the reconciliation loops are caught per record or per
/// tenant and folded into result messages; this enum covers what escapes
/// those loops: construction-time validation, storage access outside a
/// per-record scope, and collaborator failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred while reading or writing persisted state.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// Error occurred in the record or history store.
   #[error("store error: {0}")]
   Store(#[from] StoreError),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// A provider, mapper or indexer registry was built inconsistently.
   #[error("registry error: {0}")]
   Registry(#[from] RegistryError),

   /// A pipeline stage failed while building or sending a batch.
   #[error("pipeline error: {0}")]
   Pipeline(#[from] PipelineError),

   /// Tenant credentials could not be resolved.
   #[error("credential error: {0}")]
   Credential(#[from] CredentialError),

   /// An attribute mapping lookup failed.
   #[error("mapping error: {0}")]
   Mapping(#[from] MappingError),
}

/// Errors raised by [`crate::store`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
   /// A record with the same composite key already exists.
   #[error("duplicate indexing record for {api_key}/{target_type} target {target_id}")]
   Duplicate { api_key: String, target_type: String, target_id: u64 },

   /// The referenced record does not exist.
   #[error("indexing record {0} not found")]
   NotFound(u64),

   /// The referenced daily rollup does not exist.
   #[error("sync history consolidation {0} not found")]
   ConsolidationNotFound(u64),

   /// The cross-process file lock could not be taken.
   #[error("failed to lock store: {0}")]
   Lock(#[source] io::Error),

   /// Persisting the store document failed.
   #[error("failed to persist store: {0}")]
   Persist(#[source] io::Error),

   /// The persisted store document could not be decoded.
   #[error("failed to decode store: {0}")]
   Decode(#[source] serde_json::Error),

   /// The persisted store document could not be encoded.
   #[error("failed to encode store: {0}")]
   Encode(#[source] serde_json::Error),

   /// Backend-specific failure reported by an external store.
   #[error("{0}")]
   Backend(String),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Batch size is outside the accepted open interval.
   #[error("batch size {size} must be greater than 0 and less than {upper_bound}")]
   InvalidBatchSize { size: usize, upper_bound: usize },

   /// A config value is invalid.
   #[error("invalid config: {0}")]
   Invalid(String),
}

/// Errors detected while composing pluggable registries.
#[derive(Debug, Error)]
pub enum RegistryError {
   /// Two collaborators registered under the same key.
   #[error("duplicate {kind} registered for '{key}'")]
   Duplicate { kind: &'static str, key: String },

   /// A key could not be parsed or is otherwise unusable.
   #[error("invalid {kind} key '{key}': {reason}")]
   InvalidKey { kind: &'static str, key: String, reason: String },

   /// A configured indexer does not satisfy the indexer contract.
   #[error("invalid indexer service '{pipeline}': {reason}")]
   InvalidIndexerService { pipeline: String, reason: String },
}

/// Failures raised by an external indexing pipeline.
///
/// Each variant corresponds to the stage that failed; the sync layer turns
/// all of them into an error-status result without aborting other batches.
#[derive(Debug, Error)]
pub enum PipelineError {
   /// Payload validation rejected the batch.
   #[error("validation failed: {0}")]
   Validation(String),

   /// Source data could not be extracted.
   #[error("extraction failed: {0}")]
   Extraction(String),

   /// Extracted data could not be transformed into a payload.
   #[error("transformation failed: {0}")]
   Transformation(String),

   /// Any other stage failure (transport, remote API, ...).
   #[error("pipeline stage '{stage}' failed: {reason}")]
   Stage { stage: String, reason: String },
}

/// Errors resolving an API key to an account.
#[derive(Debug, Error)]
pub enum CredentialError {
   /// The API key is not known to the catalog.
   #[error("unknown api key '{0}'")]
   UnknownApiKey(String),

   /// The API key is known but has no usable account.
   #[error("no account found for api key '{0}'")]
   MissingAccount(String),
}

/// Attribute mapping lookup failures.
#[derive(Debug, Error)]
pub enum MappingError {
   /// No mapping is defined for the attribute code.
   #[error("no mapping for attribute '{code}' on entity type '{entity_type}'")]
   NotFound { entity_type: String, code: String },
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
