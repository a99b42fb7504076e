//! Discovery: pull candidates from providers, diff them against persisted
//! indexing records, and persist the resulting transitions.

pub mod attribute;

use std::{
   collections::{BTreeMap, BTreeSet, VecDeque},
   fmt,
   sync::Arc,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use attribute::{AttributeDiscoveryOrchestrator, AttributeExclusion};

use crate::{
   Result,
   error::RegistryError,
   filter::{self, MergedCandidates, RequiresUpdateFilter},
   store::{IndexingRecordStore, RecordFilter},
   types::{CandidateRecord, IndexingRecord, Transition},
};

/// Message reported when a requested type has no provider.
pub const NO_PROVIDER_MESSAGE: &str = "Supplied type(s) did not match any providers";

/// Lazily produced candidates of one tenant
pub type CandidateStream = Box<dyn Iterator<Item = CandidateRecord> + Send>;

/// Source of candidate records for one target type.
pub trait DiscoveryProvider: Send + Sync {
   fn target_type(&self) -> &str;

   /// Candidates grouped by API key. Each store scope of a tenant may report
   /// the same target; the orchestrator merges them.
   fn candidates(
      &self,
      api_keys: Option<&[String]>,
      target_ids: Option<&[u64]>,
      subtypes: Option<&[String]>,
   ) -> Result<BTreeMap<String, CandidateStream>>;
}

/// Providers keyed by a unique name, validated at composition time
#[derive(Default, Clone)]
pub struct ProviderRegistry {
   providers: BTreeMap<String, Arc<dyn DiscoveryProvider>>,
}

impl ProviderRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn register(
      mut self,
      name: impl Into<String>,
      provider: Arc<dyn DiscoveryProvider>,
   ) -> Result<Self, RegistryError> {
      let name = name.into();
      if provider.target_type().trim().is_empty() {
         return Err(RegistryError::InvalidKey {
            kind:   "discovery provider",
            key:    name,
            reason: "provider reports an empty target type".to_string(),
         });
      }
      if self.providers.contains_key(&name) {
         return Err(RegistryError::Duplicate { kind: "discovery provider", key: name });
      }
      self.providers.insert(name, provider);
      Ok(self)
   }

   /// Distinct target types served by registered providers.
   pub fn types(&self) -> BTreeSet<String> {
      self
         .providers
         .values()
         .map(|provider| provider.target_type().to_string())
         .collect()
   }

   pub fn for_type(&self, target_type: &str) -> Vec<Arc<dyn DiscoveryProvider>> {
      self
         .providers
         .values()
         .filter(|provider| provider.target_type() == target_type)
         .cloned()
         .collect()
   }

   pub fn is_empty(&self) -> bool {
      self.providers.is_empty()
   }
}

/// Which diff set a [`DiscoveryResult`] reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryAction {
   Add,
   SetIndexable,
   SetNotIndexable,
   Delete,
   Update,
   RequiresUpdate,
}

impl DiscoveryAction {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Add => "add",
         Self::SetIndexable => "set_indexable",
         Self::SetNotIndexable => "set_not_indexable",
         Self::Delete => "delete",
         Self::Update => "update",
         Self::RequiresUpdate => "requires_update",
      }
   }
}

impl fmt::Display for DiscoveryAction {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// Outcome of persisting one diff set for one tenant and type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
   pub success:     bool,
   pub action:      Option<DiscoveryAction>,
   pub api_key:     Option<String>,
   pub target_type: Option<String>,
   /// Ids of the records written successfully.
   pub record_ids:  Vec<u64>,
   pub messages:    Vec<String>,
}

impl DiscoveryResult {
   pub fn failure(message: impl Into<String>) -> Self {
      Self {
         success:     false,
         action:      None,
         api_key:     None,
         target_type: None,
         record_ids:  Vec::new(),
         messages:    vec![message.into()],
      }
   }
}

/// What kind of target the orchestrator reconciles; drives log and message
/// wording only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
   Entity,
   Attribute,
}

impl RecordKind {
   const fn plural(self) -> &'static str {
      match self {
         Self::Entity => "entities",
         Self::Attribute => "attributes",
      }
   }
}

/// Trims the to-add set before records are created.
pub trait AddFilter: Send + Sync {
   fn retain(
      &self,
      api_key: &str,
      target_type: &str,
      to_add: Vec<CandidateRecord>,
      existing: &[IndexingRecord],
   ) -> Vec<CandidateRecord>;
}

/// Arguments of one discovery run
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRequest {
   pub types:      Option<Vec<String>>,
   pub api_keys:   Option<Vec<String>>,
   pub target_ids: Option<Vec<u64>>,
   pub subtypes:   Option<Vec<String>>,
}

/// Runs providers and filters, persisting each transition.
pub struct DiscoveryOrchestrator {
   store:      Arc<dyn IndexingRecordStore>,
   providers:  ProviderRegistry,
   kind:       RecordKind,
   add_filter: Option<Arc<dyn AddFilter>>,
}

impl DiscoveryOrchestrator {
   pub fn new(store: Arc<dyn IndexingRecordStore>, providers: ProviderRegistry) -> Self {
      Self { store, providers, kind: RecordKind::Entity, add_filter: None }
   }

   pub const fn with_kind(mut self, kind: RecordKind) -> Self {
      self.kind = kind;
      self
   }

   pub fn with_add_filter(mut self, add_filter: Arc<dyn AddFilter>) -> Self {
      self.add_filter = Some(add_filter);
      self
   }

   pub fn store(&self) -> &Arc<dyn IndexingRecordStore> {
      &self.store
   }

   /// Starts a discovery run.
   ///
   /// Nothing is read or written until the returned iterator is advanced.
   /// It yields one result per tenant, type and non-empty diff set, and must
   /// be drained for every tenant to be reconciled.
   pub fn execute(&self, request: DiscoveryRequest) -> DiscoveryRun<'_> {
      let known = self.providers.types();
      let mut ready = VecDeque::new();
      let types: VecDeque<String> = match &request.types {
         Some(requested) => {
            let unmatched: Vec<&String> =
               requested.iter().filter(|t| !known.contains(*t)).collect();
            if !unmatched.is_empty() {
               tracing::error!(types = ?unmatched, "{NO_PROVIDER_MESSAGE}");
               ready.push_back(DiscoveryResult::failure(NO_PROVIDER_MESSAGE));
            }
            requested
               .iter()
               .filter(|t| known.contains(*t))
               .cloned()
               .collect::<BTreeSet<_>>()
               .into_iter()
               .collect()
         },
         None => known.into_iter().collect(),
      };

      DiscoveryRun { orchestrator: self, request, types, tenants: VecDeque::new(), ready }
   }

   /// Applies the requires-update determiner to flagged records.
   ///
   /// Idle, live, indexable records the determiner selects get `UPDATE`.
   /// The flag is cleared on every processed record; indexability is not
   /// touched. One result is yielded per batch.
   pub fn execute_requires_update<'a>(
      &'a self,
      filter: &RequiresUpdateFilter,
      api_keys: Option<&[String]>,
   ) -> Box<dyn Iterator<Item = DiscoveryResult> + 'a> {
      let tenants: Vec<Option<String>> = match api_keys {
         Some(keys) => keys.iter().cloned().map(Some).collect(),
         None => vec![None],
      };

      let mut failures = Vec::new();
      let mut batches = Vec::new();
      for api_key in tenants {
         let record_filter = RecordFilter { api_key: api_key.clone(), ..RecordFilter::default() };
         match filter.batches(self.store.as_ref(), record_filter) {
            Ok(iter) => batches.push(iter),
            Err(err) => {
               tracing::warn!(api_key = ?api_key, "failed to load records requiring update: {err}");
               let mut result = DiscoveryResult::failure(format!(
                  "Failed to load indexing {} requiring update. See log for details.",
                  self.kind.plural()
               ));
               result.action = Some(DiscoveryAction::RequiresUpdate);
               result.api_key = api_key;
               failures.push(result);
            },
         }
      }

      let updates = batches.into_iter().flatten().map(move |batch| {
         let now = Utc::now();
         let records = batch
            .into_iter()
            .map(|decision| {
               let mut record = decision.record;
               if decision.requires_update && record.was_synced() {
                  record.apply(Transition::UpdateRequested, now);
               }
               record.requires_update = false;
               record
            })
            .collect();
         self.persist(DiscoveryAction::RequiresUpdate, None, None, records)
      });
      Box::new(failures.into_iter().chain(updates))
   }

   fn tenants_for(&self, target_type: &str, request: &DiscoveryRequest) -> Vec<TenantWork> {
      let mut tenants: BTreeMap<String, Vec<CandidateStream>> = BTreeMap::new();
      if let Some(keys) = &request.api_keys {
         for key in keys {
            tenants.entry(key.clone()).or_default();
         }
      } else {
         match self.store.find(&RecordFilter {
            target_type: Some(target_type.to_string()),
            ..RecordFilter::default()
         }) {
            Ok(records) => {
               for record in records {
                  tenants.entry(record.api_key).or_default();
               }
            },
            Err(err) => {
               tracing::warn!(target_type, "failed to list known tenants: {err}");
            },
         }
      }

      let mut failures = Vec::new();
      for provider in self.providers.for_type(target_type) {
         match provider.candidates(
            request.api_keys.as_deref(),
            request.target_ids.as_deref(),
            request.subtypes.as_deref(),
         ) {
            Ok(by_tenant) => {
               for (api_key, stream) in by_tenant {
                  if request
                     .api_keys
                     .as_ref()
                     .is_some_and(|keys| !keys.contains(&api_key))
                  {
                     continue;
                  }
                  tenants.entry(api_key).or_default().push(stream);
               }
            },
            Err(err) => {
               tracing::warn!(target_type, "discovery provider failed: {err}");
               failures.push(err.to_string());
            },
         }
      }

      if !failures.is_empty() {
         // A tenant missing from a failed provider would look like a mass
         // removal, so nothing of this type is reconciled.
         return vec![TenantWork::Failed { target_type: target_type.to_string(), failures }];
      }

      tenants
         .into_iter()
         .map(|(api_key, streams)| TenantWork::Pending {
            api_key,
            target_type: target_type.to_string(),
            streams,
         })
         .collect()
   }

   fn reconcile_tenant(
      &self,
      api_key: &str,
      target_type: &str,
      candidates: MergedCandidates,
      request: &DiscoveryRequest,
   ) -> Vec<DiscoveryResult> {
      let mut record_filter = RecordFilter::tenant(api_key, target_type);
      if let Some(ids) = &request.target_ids {
         record_filter = record_filter.with_target_ids(ids);
      }
      if let Some(subtypes) = &request.subtypes {
         record_filter = record_filter.with_subtypes(subtypes);
      }
      let existing = match self.store.find(&record_filter) {
         Ok(existing) => existing,
         Err(err) => {
            tracing::warn!(api_key, target_type, "failed to load indexing {}: {err}", self.kind.plural());
            let mut result = DiscoveryResult::failure(format!(
               "Failed to load indexing {} for {api_key}. See log for details.",
               self.kind.plural()
            ));
            result.api_key = Some(api_key.to_string());
            result.target_type = Some(target_type.to_string());
            return vec![result];
         },
      };

      let now = Utc::now();
      let mut to_add = filter::filter_to_add(&candidates, &existing);
      if let Some(add_filter) = &self.add_filter {
         to_add = add_filter.retain(api_key, target_type, to_add, &existing);
      }
      let to_add: Vec<IndexingRecord> = to_add
         .iter()
         .map(|candidate| IndexingRecord::discovered(api_key, target_type, candidate))
         .collect();

      let apply_all = |records: Vec<IndexingRecord>, transition: Transition| {
         records
            .into_iter()
            .map(|mut record| {
               record.apply(transition, now);
               record
            })
            .collect::<Vec<_>>()
      };

      let mut sets = vec![
         (DiscoveryAction::Add, to_add),
         (
            DiscoveryAction::SetIndexable,
            apply_all(
               filter::filter_to_set_indexable(&candidates, &existing),
               Transition::BecameIndexable,
            ),
         ),
         (
            DiscoveryAction::SetNotIndexable,
            apply_all(
               filter::filter_to_set_not_indexable(&candidates, &existing),
               Transition::BecameNotIndexable,
            ),
         ),
         (
            DiscoveryAction::Delete,
            apply_all(
               filter::filter_to_delete(&candidates, &existing),
               Transition::BecameNotIndexable,
            ),
         ),
      ];
      if let Some(ids) = &request.target_ids {
         // Records whose indexability flips above are already being handled.
         let flipped: BTreeSet<u64> = sets
            .iter()
            .skip(1)
            .flat_map(|(_, records)| records.iter().map(|r| r.id))
            .collect();
         let to_update = filter::filter_to_update(&existing, ids, request.subtypes.as_deref())
            .into_iter()
            .filter(|record| !flipped.contains(&record.id))
            .collect();
         sets.push((DiscoveryAction::Update, apply_all(to_update, Transition::UpdateRequested)));
      }

      sets
         .into_iter()
         .filter(|(_, records)| !records.is_empty())
         .map(|(action, records)| self.persist(action, Some(api_key), Some(target_type), records))
         .collect()
   }

   fn persist(
      &self,
      action: DiscoveryAction,
      api_key: Option<&str>,
      target_type: Option<&str>,
      mut records: Vec<IndexingRecord>,
   ) -> DiscoveryResult {
      let mut saved = Vec::with_capacity(records.len());
      let mut failed = Vec::new();
      let results = self.store.save_all(&mut records);
      for (record, result) in records.iter().zip(results) {
         match result {
            Ok(()) => saved.push(record.id),
            Err(err) => {
               tracing::error!(
                  api_key = %record.api_key,
                  target_type = %record.target_type,
                  target_id = record.target_id,
                  target_parent_id = ?record.target_parent_id,
                  action = %action,
                  "failed to save indexing record: {err}"
               );
               failed.push(record.target_id);
            },
         }
      }

      tracing::debug!(
         api_key = ?api_key,
         target_type = ?target_type,
         action = %action,
         saved = saved.len(),
         failed = failed.len(),
         "discovery batch persisted"
      );

      let mut messages = Vec::new();
      if !failed.is_empty() {
         let ids = failed
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
         messages.push(format!(
            "Indexing {} ({ids}) failed to save. See log for details.",
            self.kind.plural()
         ));
      }

      DiscoveryResult {
         success: failed.is_empty(),
         action: Some(action),
         api_key: api_key.map(str::to_string),
         target_type: target_type.map(str::to_string),
         record_ids: saved,
         messages,
      }
   }
}

enum TenantWork {
   Pending { api_key: String, target_type: String, streams: Vec<CandidateStream> },
   Failed { target_type: String, failures: Vec<String> },
}

/// Single-pass iterator over the results of one discovery run.
///
/// Each call to `next` either returns an already computed result or
/// reconciles the next tenant. Not restartable.
pub struct DiscoveryRun<'a> {
   orchestrator: &'a DiscoveryOrchestrator,
   request:      DiscoveryRequest,
   types:        VecDeque<String>,
   tenants:      VecDeque<TenantWork>,
   ready:        VecDeque<DiscoveryResult>,
}

impl Iterator for DiscoveryRun<'_> {
   type Item = DiscoveryResult;

   fn next(&mut self) -> Option<Self::Item> {
      loop {
         if let Some(result) = self.ready.pop_front() {
            return Some(result);
         }

         if let Some(work) = self.tenants.pop_front() {
            match work {
               TenantWork::Pending { api_key, target_type, streams } => {
                  let candidates = filter::merge_candidates(streams.into_iter().flatten());
                  let results = self.orchestrator.reconcile_tenant(
                     &api_key,
                     &target_type,
                     candidates,
                     &self.request,
                  );
                  self.ready.extend(results);
               },
               TenantWork::Failed { target_type, mut failures } => {
                  failures.insert(0, format!("Discovery failed for type '{target_type}'."));
                  self.ready.push_back(DiscoveryResult {
                     success:     false,
                     action:      None,
                     api_key:     None,
                     target_type: Some(target_type),
                     record_ids:  Vec::new(),
                     messages:    failures,
                  });
               },
            }
            continue;
         }

         let target_type = self.types.pop_front()?;
         let work = self.orchestrator.tenants_for(&target_type, &self.request);
         self.tenants.extend(work);
      }
   }
}
