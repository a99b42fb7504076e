//! Persistence contracts for indexing records and sync history, with a
//! JSON-document implementation.

mod json;
mod lock;

use chrono::{DateTime, NaiveDate, Utc};

pub use json::JsonStore;

use crate::{
   error::StoreError,
   types::{Action, ConsolidationKey, ConsolidationRecord, IndexingRecord, SyncHistoryRecord},
};

/// Criteria for listing indexing records.
///
/// Every populated field narrows the result (AND); list fields match any of
/// their values (OR). An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
   pub api_key:         Option<String>,
   pub target_type:     Option<String>,
   pub target_ids:      Option<Vec<u64>>,
   pub target_subtypes: Option<Vec<String>>,
   pub next_actions:    Option<Vec<Action>>,
   pub is_indexable:    Option<bool>,
   pub requires_update: Option<bool>,
}

impl RecordFilter {
   pub fn tenant(api_key: &str, target_type: &str) -> Self {
      Self {
         api_key: Some(api_key.to_string()),
         target_type: Some(target_type.to_string()),
         ..Self::default()
      }
   }

   pub fn with_target_ids(mut self, ids: &[u64]) -> Self {
      self.target_ids = Some(ids.to_vec());
      self
   }

   pub fn with_subtypes(mut self, subtypes: &[String]) -> Self {
      self.target_subtypes = Some(subtypes.to_vec());
      self
   }

   pub fn with_next_actions(mut self, actions: &[Action]) -> Self {
      self.next_actions = Some(actions.to_vec());
      self
   }

   pub const fn with_indexable(mut self, is_indexable: bool) -> Self {
      self.is_indexable = Some(is_indexable);
      self
   }

   pub const fn with_requires_update(mut self, requires_update: bool) -> Self {
      self.requires_update = Some(requires_update);
      self
   }

   pub fn matches(&self, record: &IndexingRecord) -> bool {
      if self.api_key.as_ref().is_some_and(|k| *k != record.api_key) {
         return false;
      }
      if self.target_type.as_ref().is_some_and(|t| *t != record.target_type) {
         return false;
      }
      if let Some(ids) = &self.target_ids
         && !ids.contains(&record.target_id)
      {
         return false;
      }
      if let Some(subtypes) = &self.target_subtypes {
         let Some(subtype) = &record.target_subtype else {
            return false;
         };
         if !subtypes.contains(subtype) {
            return false;
         }
      }
      if let Some(actions) = &self.next_actions
         && !actions.contains(&record.next_action)
      {
         return false;
      }
      if self.is_indexable.is_some_and(|v| v != record.is_indexable) {
         return false;
      }
      if self.requires_update.is_some_and(|v| v != record.requires_update) {
         return false;
      }
      true
   }
}

/// Read/write contract for indexing records
pub trait IndexingRecordStore: Send + Sync {
   /// Inserts the record when `record.id == 0` (assigning its id) or updates
   /// the stored copy otherwise. Inserting a duplicate composite key fails.
   fn save(&self, record: &mut IndexingRecord) -> Result<(), StoreError>;

   /// Saves each record as [`save`](Self::save) would, returning one result
   /// per record in order.
   fn save_all(&self, records: &mut [IndexingRecord]) -> Vec<Result<(), StoreError>> {
      records.iter_mut().map(|record| self.save(record)).collect()
   }

   fn find(&self, filter: &RecordFilter) -> Result<Vec<IndexingRecord>, StoreError>;

   /// Records of a tenant/type whose `(target_id, target_parent_id)` equals
   /// any of `pairs`.
   fn find_by_pairs(
      &self,
      api_key: &str,
      target_type: &str,
      pairs: &[(u64, Option<u64>)],
   ) -> Result<Vec<IndexingRecord>, StoreError>;

   /// Locks the records in `ids` that are not already locked within `ttl` and
   /// returns the locked copies. Ids that are unknown or held elsewhere are
   /// skipped.
   fn claim(
      &self,
      ids: &[u64],
      now: DateTime<Utc>,
      ttl: chrono::Duration,
   ) -> Result<Vec<IndexingRecord>, StoreError>;

   /// Clears the lock on `ids`.
   fn release(&self, ids: &[u64]) -> Result<(), StoreError>;
}

/// Read/write contract for raw and consolidated sync history
pub trait SyncHistoryStore: Send + Sync {
   fn insert_history(&self, record: &mut SyncHistoryRecord) -> Result<(), StoreError>;

   /// All raw rows in insertion order.
   fn history(&self) -> Result<Vec<SyncHistoryRecord>, StoreError>;

   /// Deletes raw rows by id and returns how many existed.
   fn delete_history(&self, ids: &[u64]) -> Result<usize, StoreError>;

   fn consolidation(
      &self,
      key: &ConsolidationKey,
      date: NaiveDate,
   ) -> Result<Option<ConsolidationRecord>, StoreError>;

   /// Inserts when `record.id == 0`, otherwise replaces the stored copy.
   fn save_consolidation(&self, record: &mut ConsolidationRecord) -> Result<(), StoreError>;

   fn delete_consolidation(&self, id: u64) -> Result<(), StoreError>;

   fn consolidations(&self) -> Result<Vec<ConsolidationRecord>, StoreError>;

   /// Deletes rollups dated strictly before `date`.
   fn delete_consolidations_before(&self, date: NaiveDate) -> Result<usize, StoreError>;
}
