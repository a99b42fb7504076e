//! Per-tenant synchronization against the remote indexing API.
//!
//! [`SyncOrchestrator`] fans out over tenants and registered indexers. The
//! in-crate [`EntityIndexer`] selects pending records for one
//! `type::action` pipeline, claims them in batches, runs the external
//! [`Pipeline`] and reconciles each outcome through the
//! [`BatchResponseHandler`].

use std::{
   collections::{BTreeMap, BTreeSet},
   fmt,
   str::FromStr,
   sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
   Result, config,
   error::{CredentialError, PipelineError, RegistryError},
   response::BatchResponseHandler,
   store::{IndexingRecordStore, RecordFilter},
   types::{Action, IndexingRecord},
};

/// `"<type>::<action>"` identifier of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId {
   pub target_type: String,
   pub action:      Action,
}

impl PipelineId {
   pub fn new(target_type: impl Into<String>, action: Action) -> Self {
      Self { target_type: target_type.into(), action }
   }
}

impl fmt::Display for PipelineId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}::{}", self.target_type, self.action.as_pipeline_str())
   }
}

impl FromStr for PipelineId {
   type Err = RegistryError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = |reason: &str| RegistryError::InvalidIndexerService {
         pipeline: s.to_string(),
         reason:   reason.to_string(),
      };
      let (target_type, action) =
         s.split_once("::").ok_or_else(|| invalid("expected '<type>::<action>'"))?;
      let target_type = target_type.trim();
      if target_type.is_empty() {
         return Err(invalid("missing target type"));
      }
      let action: Action = action.parse().map_err(|e: String| invalid(&e))?;
      if action == Action::NoAction {
         return Err(invalid("NO_ACTION cannot be synchronized"));
      }
      Ok(Self::new(target_type, action))
   }
}

/// One record of the payload the remote index accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRecord {
   /// `"<parent>-<id>"` or `"<id>"`.
   pub id:          String,
   #[serde(rename = "type")]
   pub record_type: String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub relations:   Option<serde_json::Value>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub attributes:  Option<serde_json::Value>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub display:     Option<serde_json::Value>,
}

impl PayloadRecord {
   pub fn new(id: impl Into<String>, record_type: impl Into<String>) -> Self {
      Self {
         id:          id.into(),
         record_type: record_type.into(),
         relations:   None,
         attributes:  None,
         display:     None,
      }
   }
}

/// Outcome of one pipeline call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiPipelineResult {
   pub success:  bool,
   #[serde(default)]
   pub messages: Vec<String>,
   #[serde(default)]
   pub payload:  Vec<PayloadRecord>,
}

impl ApiPipelineResult {
   pub fn failure(message: impl Into<String>) -> Self {
      Self { success: false, messages: vec![message.into()], payload: Vec::new() }
   }

   /// Messages joined for history rows.
   pub fn message(&self) -> String {
      self.messages.join("; ")
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexerStatus {
   /// Nothing was pending.
   Noop,
   Success,
   /// Some batches failed.
   Partial,
   Error,
}

impl IndexerStatus {
   /// Status of two results reported for the same tenant.
   pub const fn combine(self, other: Self) -> Self {
      match (self, other) {
         (Self::Noop, other) | (other, Self::Noop) => other,
         (Self::Success, Self::Success) => Self::Success,
         (Self::Error, Self::Error) => Self::Error,
         _ => Self::Partial,
      }
   }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerResult {
   pub status:           IndexerStatus,
   pub messages:         Vec<String>,
   /// Pipeline outcomes keyed by pipeline id.
   pub pipeline_results: BTreeMap<String, Vec<ApiPipelineResult>>,
}

impl IndexerResult {
   pub const fn noop() -> Self {
      Self { status: IndexerStatus::Noop, messages: Vec::new(), pipeline_results: BTreeMap::new() }
   }

   pub fn merge(&mut self, other: Self) {
      self.status = self.status.combine(other.status);
      self.messages.extend(other.messages);
      for (pipeline, results) in other.pipeline_results {
         self.pipeline_results.entry(pipeline).or_default().extend(results);
      }
   }
}

/// External payload builder and remote caller for one `type::action`.
#[async_trait]
pub trait Pipeline: Send + Sync {
   async fn run(
      &self,
      api_key: &str,
      action: Action,
      records: &[IndexingRecord],
      via: Option<&str>,
   ) -> Result<ApiPipelineResult, PipelineError>;
}

/// Synchronizes one pipeline id for a tenant.
#[async_trait]
pub trait Indexer: Send + Sync {
   /// Declared `"<type>::<action>"`; validated when registered.
   fn pipeline_id(&self) -> &str;

   async fn execute(&self, api_key: &str, via: Option<&str>) -> IndexerResult;
}

/// Pending-record indexer backed by the record store
pub struct EntityIndexer {
   declared:    String,
   pipeline_id: PipelineId,
   pipeline:    Arc<dyn Pipeline>,
   store:       Arc<dyn IndexingRecordStore>,
   handler:     Arc<BatchResponseHandler>,
   batch_size:  usize,
   lock_ttl:    chrono::Duration,
}

impl EntityIndexer {
   /// Builds an indexer using batch size and lock TTL from the global config.
   pub fn new(
      pipeline_id: &str,
      pipeline: Arc<dyn Pipeline>,
      store: Arc<dyn IndexingRecordStore>,
      handler: Arc<BatchResponseHandler>,
   ) -> Result<Self> {
      let cfg = config::get();
      Ok(Self {
         declared: pipeline_id.to_string(),
         pipeline_id: pipeline_id.parse()?,
         pipeline,
         store,
         handler,
         batch_size: config::validate_batch_size(cfg.batch_size, cfg.batch_size_upper_bound)?,
         lock_ttl: cfg.lock_ttl(),
      })
   }

   pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self> {
      let upper_bound = config::get().batch_size_upper_bound;
      self.batch_size = config::validate_batch_size(batch_size, upper_bound)?;
      Ok(self)
   }

   pub const fn with_lock_ttl(mut self, lock_ttl: chrono::Duration) -> Self {
      self.lock_ttl = lock_ttl;
      self
   }

   fn pending(&self, api_key: &str) -> Result<Vec<u64>> {
      let action = self.pipeline_id.action;
      let mut filter = RecordFilter::tenant(api_key, &self.pipeline_id.target_type)
         .with_next_actions(&[action]);
      if action != Action::Delete {
         filter = filter.with_indexable(true);
      }
      Ok(self.store.find(&filter)?.into_iter().map(|r| r.id).collect())
   }
}

#[async_trait]
impl Indexer for EntityIndexer {
   fn pipeline_id(&self) -> &str {
      &self.declared
   }

   async fn execute(&self, api_key: &str, via: Option<&str>) -> IndexerResult {
      let pipeline = self.pipeline_id.to_string();
      let action = self.pipeline_id.action;
      let target_type = self.pipeline_id.target_type.as_str();
      let mut result = IndexerResult::noop();

      let ids = match self.pending(api_key) {
         Ok(ids) => ids,
         Err(err) => {
            tracing::warn!(api_key, pipeline = %pipeline, "failed to select pending records: {err}");
            result.status = IndexerStatus::Error;
            result.messages.push(format!("{pipeline}: failed to select pending records: {err}"));
            return result;
         },
      };
      if ids.is_empty() {
         tracing::debug!(api_key, pipeline = %pipeline, "nothing pending");
         return result;
      }

      let (mut succeeded, mut failed) = (0usize, 0usize);
      for chunk in ids.chunks(self.batch_size) {
         let claimed = match self.store.claim(chunk, Utc::now(), self.lock_ttl) {
            Ok(claimed) => claimed,
            Err(err) => {
               tracing::warn!(api_key, pipeline = %pipeline, "failed to claim batch: {err}");
               result.messages.push(format!("{pipeline}: failed to claim batch: {err}"));
               failed += 1;
               continue;
            },
         };
         let claimed_ids: Vec<u64> = claimed.iter().map(|r| r.id).collect();
         let batch: BTreeMap<u64, IndexingRecord> = claimed
            .into_iter()
            .filter(|record| record.next_action == action)
            .map(|record| (record.id, record))
            .collect();

         if !batch.is_empty() {
            let records: Vec<IndexingRecord> = batch.values().cloned().collect();
            let outcome = match self.pipeline.run(api_key, action, &records, via).await {
               Ok(outcome) => outcome,
               Err(err) => {
                  tracing::warn!(api_key, pipeline = %pipeline, "pipeline failed: {err}");
                  result.messages.push(format!("{pipeline}: {err}"));
                  ApiPipelineResult::failure(err.to_string())
               },
            };
            self.handler.execute(&outcome, action, &batch, target_type, api_key);
            if outcome.success {
               succeeded += 1;
            } else {
               failed += 1;
               result.messages.extend(outcome.messages.iter().cloned());
            }
            result.pipeline_results.entry(pipeline.clone()).or_default().push(outcome);
         } else {
            tracing::debug!(api_key, pipeline = %pipeline, "batch held by another worker");
         }

         if let Err(err) = self.store.release(&claimed_ids) {
            tracing::warn!(api_key, pipeline = %pipeline, "failed to release batch locks: {err}");
         }
      }

      result.status = match (succeeded, failed) {
         (0, 0) => IndexerStatus::Noop,
         (_, 0) => IndexerStatus::Success,
         (0, _) => IndexerStatus::Error,
         _ => IndexerStatus::Partial,
      };
      tracing::info!(
         api_key,
         pipeline = %pipeline,
         records = ids.len(),
         succeeded,
         failed,
         "indexer finished"
      );
      result
   }
}

/// Indexers keyed by validated pipeline id
#[derive(Default, Clone)]
pub struct IndexerRegistry {
   indexers: BTreeMap<PipelineId, Arc<dyn Indexer>>,
}

impl IndexerRegistry {
   /// Fails with [`RegistryError::InvalidIndexerService`] on a malformed,
   /// `NO_ACTION` or duplicated pipeline id.
   pub fn new(
      indexers: impl IntoIterator<Item = Arc<dyn Indexer>>,
   ) -> Result<Self, RegistryError> {
      let mut registry = Self::default();
      for indexer in indexers {
         let id: PipelineId = indexer.pipeline_id().parse()?;
         if registry.indexers.contains_key(&id) {
            return Err(RegistryError::InvalidIndexerService {
               pipeline: id.to_string(),
               reason:   "pipeline id registered twice".to_string(),
            });
         }
         registry.indexers.insert(id, indexer);
      }
      Ok(registry)
   }

   /// Indexers whose type is in `types`, or all of them.
   pub fn matching<'a>(
      &'a self,
      types: Option<&'a [String]>,
   ) -> impl Iterator<Item = (&'a PipelineId, &'a Arc<dyn Indexer>)> + 'a {
      self
         .indexers
         .iter()
         .filter(move |(id, _)| types.is_none_or(|types| types.contains(&id.target_type)))
   }

   pub fn len(&self) -> usize {
      self.indexers.len()
   }

   pub fn is_empty(&self) -> bool {
      self.indexers.is_empty()
   }
}

/// Source of the tenants to synchronize when none are given
pub trait ApiKeyProvider: Send + Sync {
   fn api_keys(&self) -> Result<Vec<String>>;
}

/// Account a tenant synchronizes as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
   pub api_key: String,
   pub account: String,
}

pub trait CredentialResolver: Send + Sync {
   fn resolve(&self, api_key: &str) -> Result<Credentials, CredentialError>;
}

pub struct SyncOrchestrator {
   indexers:    IndexerRegistry,
   api_keys:    Arc<dyn ApiKeyProvider>,
   credentials: Arc<dyn CredentialResolver>,
}

impl SyncOrchestrator {
   pub fn new(
      indexers: IndexerRegistry,
      api_keys: Arc<dyn ApiKeyProvider>,
      credentials: Arc<dyn CredentialResolver>,
   ) -> Self {
      Self { indexers, api_keys, credentials }
   }

   /// Runs every matching indexer for each tenant, one after another.
   ///
   /// Tenants whose credentials do not resolve are skipped. Only listing
   /// active tenants can fail the whole run.
   pub async fn execute(
      &self,
      types: Option<&[String]>,
      api_keys: Option<&[String]>,
      via: Option<&str>,
   ) -> Result<BTreeMap<String, IndexerResult>> {
      let tenants: BTreeSet<String> = match api_keys {
         Some(keys) => keys.iter().cloned().collect(),
         None => self.api_keys.api_keys()?.into_iter().collect(),
      };

      let mut results = BTreeMap::new();
      for api_key in tenants {
         let credentials = match self.credentials.resolve(&api_key) {
            Ok(credentials) => credentials,
            Err(err) => {
               tracing::warn!(api_key = %api_key, "skipping tenant: {err}");
               continue;
            },
         };
         tracing::debug!(api_key = %api_key, account = %credentials.account, "syncing tenant");

         let mut tenant = IndexerResult::noop();
         for (id, indexer) in self.indexers.matching(types) {
            tracing::debug!(api_key = %api_key, pipeline = %id, "running indexer");
            tenant.merge(indexer.execute(&api_key, via).await);
         }
         results.insert(api_key, tenant);
      }
      Ok(results)
   }
}
