#![allow(dead_code)]

use std::{
   collections::{BTreeMap, BTreeSet, VecDeque},
   sync::Arc,
};

use chrono::{DateTime, NaiveDate, Utc};
use indexsync::{
   conflict::{Notification, NotificationSink},
   discovery::{CandidateStream, DiscoveryProvider},
   error::{CredentialError, PipelineError, StoreError},
   store::{IndexingRecordStore, JsonStore, RecordFilter, SyncHistoryStore},
   sync::{ApiKeyProvider, ApiPipelineResult, CredentialResolver, Credentials, PayloadRecord, Pipeline},
   types::{
      Action, CandidateRecord, ConsolidationKey, ConsolidationRecord, IndexingRecord,
      SyncHistoryRecord, Transition,
   },
};
use parking_lot::Mutex;

pub fn set_temp_home(dir: &tempfile::TempDir) {
   // Safe in test harness: set before touching config paths to isolate data.
   unsafe {
      std::env::set_var("HOME", dir.path());
   }
}

/// Provider serving whatever candidates the test put in for each tenant.
pub struct StaticProvider {
   target_type: String,
   candidates:  Mutex<BTreeMap<String, Vec<CandidateRecord>>>,
}

impl StaticProvider {
   pub fn new(target_type: &str) -> Arc<Self> {
      Arc::new(Self { target_type: target_type.to_string(), candidates: Mutex::default() })
   }

   pub fn set(&self, api_key: &str, candidates: Vec<CandidateRecord>) {
      self.candidates.lock().insert(api_key.to_string(), candidates);
   }
}

impl DiscoveryProvider for StaticProvider {
   fn target_type(&self) -> &str {
      &self.target_type
   }

   fn candidates(
      &self,
      api_keys: Option<&[String]>,
      target_ids: Option<&[u64]>,
      subtypes: Option<&[String]>,
   ) -> indexsync::Result<BTreeMap<String, CandidateStream>> {
      let candidates = self.candidates.lock();
      let mut out: BTreeMap<String, CandidateStream> = BTreeMap::new();
      for (api_key, records) in candidates.iter() {
         if api_keys.is_some_and(|keys| !keys.contains(api_key)) {
            continue;
         }
         let records: Vec<CandidateRecord> = records
            .iter()
            .filter(|c| target_ids.is_none_or(|ids| ids.contains(&c.target_id)))
            .filter(|c| {
               subtypes.is_none_or(|subtypes| {
                  c.target_subtype.as_ref().is_some_and(|s| subtypes.contains(s))
               })
            })
            .cloned()
            .collect();
         out.insert(api_key.clone(), Box::new(records.into_iter()));
      }
      Ok(out)
   }
}

/// Provider that always fails.
pub struct BrokenProvider(pub &'static str);

impl DiscoveryProvider for BrokenProvider {
   fn target_type(&self) -> &str {
      self.0
   }

   fn candidates(
      &self,
      _api_keys: Option<&[String]>,
      _target_ids: Option<&[u64]>,
      _subtypes: Option<&[String]>,
   ) -> indexsync::Result<BTreeMap<String, CandidateStream>> {
      Err(StoreError::Backend("catalog unavailable".to_string()).into())
   }
}

/// Record store that refuses to save the listed target ids.
pub struct FlakyRecordStore {
   pub inner:     JsonStore,
   pub fail_save: BTreeSet<u64>,
}

impl FlakyRecordStore {
   pub fn new(fail_save: impl IntoIterator<Item = u64>) -> Arc<Self> {
      Arc::new(Self { inner: JsonStore::in_memory(), fail_save: fail_save.into_iter().collect() })
   }
}

impl IndexingRecordStore for FlakyRecordStore {
   fn save(&self, record: &mut IndexingRecord) -> Result<(), StoreError> {
      if self.fail_save.contains(&record.target_id) {
         return Err(StoreError::Backend(format!("write rejected for {}", record.target_id)));
      }
      self.inner.save(record)
   }

   fn find(&self, filter: &RecordFilter) -> Result<Vec<IndexingRecord>, StoreError> {
      self.inner.find(filter)
   }

   fn find_by_pairs(
      &self,
      api_key: &str,
      target_type: &str,
      pairs: &[(u64, Option<u64>)],
   ) -> Result<Vec<IndexingRecord>, StoreError> {
      self.inner.find_by_pairs(api_key, target_type, pairs)
   }

   fn claim(
      &self,
      ids: &[u64],
      now: DateTime<Utc>,
      ttl: chrono::Duration,
   ) -> Result<Vec<IndexingRecord>, StoreError> {
      self.inner.claim(ids, now, ttl)
   }

   fn release(&self, ids: &[u64]) -> Result<(), StoreError> {
      self.inner.release(ids)
   }
}

/// History store that refuses writes for the listed target ids, and the
/// first `failing_deletes` raw-row deletions.
pub struct FlakyHistoryStore {
   pub inner:           JsonStore,
   pub reject:          BTreeSet<u64>,
   pub failing_deletes: Mutex<usize>,
}

impl FlakyHistoryStore {
   pub fn new(reject: impl IntoIterator<Item = u64>) -> Arc<Self> {
      Arc::new(Self {
         inner:           JsonStore::in_memory(),
         reject:          reject.into_iter().collect(),
         failing_deletes: Mutex::new(0),
      })
   }

   pub fn failing_deletes(times: usize) -> Arc<Self> {
      Arc::new(Self {
         inner:           JsonStore::in_memory(),
         reject:          BTreeSet::new(),
         failing_deletes: Mutex::new(times),
      })
   }

   fn check(&self, target_id: u64) -> Result<(), StoreError> {
      if self.reject.contains(&target_id) {
         return Err(StoreError::Backend(format!("history rejected for {target_id}")));
      }
      Ok(())
   }
}

impl SyncHistoryStore for FlakyHistoryStore {
   fn insert_history(&self, record: &mut SyncHistoryRecord) -> Result<(), StoreError> {
      self.check(record.target_id)?;
      self.inner.insert_history(record)
   }

   fn history(&self) -> Result<Vec<SyncHistoryRecord>, StoreError> {
      self.inner.history()
   }

   fn delete_history(&self, ids: &[u64]) -> Result<usize, StoreError> {
      let mut remaining = self.failing_deletes.lock();
      if *remaining > 0 {
         *remaining -= 1;
         return Err(StoreError::Backend("history delete rejected".to_string()));
      }
      drop(remaining);
      self.inner.delete_history(ids)
   }

   fn consolidation(
      &self,
      key: &ConsolidationKey,
      date: NaiveDate,
   ) -> Result<Option<ConsolidationRecord>, StoreError> {
      self.inner.consolidation(key, date)
   }

   fn save_consolidation(&self, record: &mut ConsolidationRecord) -> Result<(), StoreError> {
      self.check(record.key.target_id)?;
      self.inner.save_consolidation(record)
   }

   fn delete_consolidation(&self, id: u64) -> Result<(), StoreError> {
      self.inner.delete_consolidation(id)
   }

   fn consolidations(&self) -> Result<Vec<ConsolidationRecord>, StoreError> {
      self.inner.consolidations()
   }

   fn delete_consolidations_before(&self, date: NaiveDate) -> Result<usize, StoreError> {
      self.inner.delete_consolidations_before(date)
   }
}

/// One pipeline invocation as seen by [`ScriptedPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineCall {
   pub api_key:    String,
   pub action:     Action,
   pub target_ids: Vec<u64>,
   pub via:        Option<String>,
}

/// Pipeline that replays queued outcomes, then accepts every record.
#[derive(Default)]
pub struct ScriptedPipeline {
   script: Mutex<VecDeque<Result<ApiPipelineResult, PipelineError>>>,
   calls:  Mutex<Vec<PipelineCall>>,
}

impl ScriptedPipeline {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn push(&self, outcome: Result<ApiPipelineResult, PipelineError>) {
      self.script.lock().push_back(outcome);
   }

   pub fn calls(&self) -> Vec<PipelineCall> {
      self.calls.lock().clone()
   }
}

pub fn accept_all(records: &[IndexingRecord]) -> ApiPipelineResult {
   ApiPipelineResult {
      success:  true,
      messages: vec!["ok".to_string()],
      payload:  records
         .iter()
         .map(|r| PayloadRecord::new(r.payload_id(), r.target_type.clone()))
         .collect(),
   }
}

#[async_trait::async_trait]
impl Pipeline for ScriptedPipeline {
   async fn run(
      &self,
      api_key: &str,
      action: Action,
      records: &[IndexingRecord],
      via: Option<&str>,
   ) -> Result<ApiPipelineResult, PipelineError> {
      self.calls.lock().push(PipelineCall {
         api_key: api_key.to_string(),
         action,
         target_ids: records.iter().map(|r| r.target_id).collect(),
         via: via.map(str::to_string),
      });
      let scripted = self.script.lock().pop_front();
      scripted.unwrap_or_else(|| Ok(accept_all(records)))
   }
}

#[derive(Default)]
pub struct RecordingSink {
   pub upserts:      Mutex<Vec<Notification>>,
   pub deletes:      Mutex<Vec<String>>,
   /// Record upserts, then reject them.
   pub fail_upserts: bool,
}

impl RecordingSink {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn failing_upserts() -> Arc<Self> {
      Arc::new(Self { fail_upserts: true, ..Self::default() })
   }
}

impl NotificationSink for RecordingSink {
   fn upsert(&self, notification: Notification) -> indexsync::Result<()> {
      self.upserts.lock().push(notification);
      if self.fail_upserts {
         return Err(StoreError::Backend("notification rejected".to_string()).into());
      }
      Ok(())
   }

   fn delete(&self, notification_type: &str) -> indexsync::Result<()> {
      self.deletes.lock().push(notification_type.to_string());
      Ok(())
   }
}

pub struct StaticApiKeys(pub Vec<String>);

impl ApiKeyProvider for StaticApiKeys {
   fn api_keys(&self) -> indexsync::Result<Vec<String>> {
      Ok(self.0.clone())
   }
}

/// Resolves every key except the listed ones.
pub struct StaticCredentials {
   pub unknown: Vec<String>,
}

impl CredentialResolver for StaticCredentials {
   fn resolve(&self, api_key: &str) -> Result<Credentials, CredentialError> {
      if self.unknown.iter().any(|k| k == api_key) {
         return Err(CredentialError::UnknownApiKey(api_key.to_string()));
      }
      Ok(Credentials { api_key: api_key.to_string(), account: format!("acct-{api_key}") })
   }
}

/// Marks every record that has pending work as successfully synced.
pub fn sync_all(store: &dyn IndexingRecordStore) {
   let now = Utc::now();
   for mut record in store.find(&RecordFilter::default()).unwrap() {
      let action = record.next_action;
      let deliverable = match action {
         Action::NoAction => false,
         Action::Delete => true,
         Action::Add | Action::Update => record.is_indexable,
      };
      if deliverable {
         record.apply(Transition::Synced(action), now);
         store.save(&mut record).unwrap();
      }
   }
}

pub fn records(store: &dyn IndexingRecordStore) -> Vec<IndexingRecord> {
   store.find(&RecordFilter::default()).unwrap()
}

pub fn record_for(store: &dyn IndexingRecordStore, target_id: u64) -> IndexingRecord {
   records(store)
      .into_iter()
      .find(|r| r.target_id == target_id && r.target_parent_id.is_none())
      .unwrap_or_else(|| panic!("no record for target {target_id}"))
}
