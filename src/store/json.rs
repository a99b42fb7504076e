//! Single-document store persisted as JSON.

use std::{
   collections::BTreeMap,
   fs, io,
   path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{IndexingRecordStore, RecordFilter, SyncHistoryStore, lock::DocumentLock};
use crate::{
   config,
   error::StoreError,
   types::{ConsolidationKey, ConsolidationRecord, IndexingRecord, RecordKey, SyncHistoryRecord},
};

/// Tenant, type and composite key of one indexing record
type IndexKey = (String, String, RecordKey);

fn index_key(record: &IndexingRecord) -> IndexKey {
   (record.api_key.clone(), record.target_type.clone(), record.key())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
   #[serde(default)]
   next_record_id:        u64,
   #[serde(default)]
   next_history_id:       u64,
   #[serde(default)]
   next_consolidation_id: u64,
   #[serde(default)]
   records:               BTreeMap<u64, IndexingRecord>,
   #[serde(default)]
   history:               BTreeMap<u64, SyncHistoryRecord>,
   #[serde(default)]
   consolidations:        BTreeMap<u64, ConsolidationRecord>,
   #[serde(skip)]
   keys:                  BTreeMap<IndexKey, u64>,
}

impl StoreDocument {
   fn decode(content: &str) -> Result<Self, StoreError> {
      let mut document: Self = serde_json::from_str(content).map_err(StoreError::Decode)?;
      document.keys = document
         .records
         .values()
         .map(|record| (index_key(record), record.id))
         .collect();
      Ok(document)
   }

   /// Inserts or replaces `record` and returns its id.
   fn upsert(&mut self, mut record: IndexingRecord) -> Result<u64, StoreError> {
      let key = index_key(&record);
      if let Some(&existing) = self.keys.get(&key)
         && existing != record.id
      {
         return Err(StoreError::Duplicate {
            api_key:     record.api_key,
            target_type: record.target_type,
            target_id:   record.target_id,
         });
      }
      if record.id == 0 {
         self.next_record_id += 1;
         record.id = self.next_record_id;
      } else {
         let Some(previous) = self.records.get(&record.id) else {
            return Err(StoreError::NotFound(record.id));
         };
         let previous = index_key(previous);
         if previous != key {
            self.keys.remove(&previous);
         }
      }
      let id = record.id;
      self.keys.insert(key, id);
      self.records.insert(id, record);
      Ok(id)
   }
}

/// Record and history store backed by one JSON document.
///
/// Without a path the document lives only in memory. With a path every
/// operation takes an advisory lock on `<path>.lock` and reloads the document
/// first, so several handles (or processes) on one file see each other's
/// writes and `claim` is exclusive across them. Mutations are applied to a
/// copy that replaces the current document only once it is on disk.
pub struct JsonStore {
   path:  Option<PathBuf>,
   state: Mutex<StoreDocument>,
}

impl JsonStore {
   pub fn in_memory() -> Self {
      Self { path: None, state: Mutex::new(StoreDocument::default()) }
   }

   /// Opens (or creates on first write) the store at `path`.
   pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
      let path = path.into();
      let document = {
         let _lock = DocumentLock::acquire_shared(&path)?;
         Self::load(&path)?
      };
      Ok(Self { path: Some(path), state: Mutex::new(document) })
   }

   /// Opens the configured store under the data directory.
   pub fn open_default() -> Result<Self, StoreError> {
      let cfg = config::get();
      Self::open(config::data_dir().join(format!("{}.json", cfg.store_name)))
   }

   pub fn path(&self) -> Option<&Path> {
      self.path.as_deref()
   }

   fn load(path: &Path) -> Result<StoreDocument, StoreError> {
      match fs::read_to_string(path) {
         Ok(content) => StoreDocument::decode(&content),
         Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(StoreDocument::default()),
         Err(err) => Err(StoreError::Persist(err)),
      }
   }

   fn persist(path: &Path, document: &StoreDocument) -> Result<(), StoreError> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent).map_err(StoreError::Persist)?;
      }
      let data = serde_json::to_string(document).map_err(StoreError::Encode)?;
      let tmp_path = path.with_extension("json.tmp");
      fs::write(&tmp_path, data).map_err(StoreError::Persist)?;
      fs::rename(&tmp_path, path).map_err(StoreError::Persist)?;
      Ok(())
   }

   fn read<T>(&self, f: impl FnOnce(&StoreDocument) -> T) -> Result<T, StoreError> {
      let mut state = self.state.lock();
      if let Some(path) = &self.path {
         let _lock = DocumentLock::acquire_shared(path)?;
         *state = Self::load(path)?;
      }
      Ok(f(&state))
   }

   /// Runs `f` on a copy of the document. `f` returns its value and whether
   /// it changed anything; a changed copy is persisted and then swapped in.
   fn mutate<T>(
      &self,
      f: impl FnOnce(&mut StoreDocument) -> Result<(T, bool), StoreError>,
   ) -> Result<T, StoreError> {
      let mut state = self.state.lock();
      let _lock = match &self.path {
         Some(path) => {
            let lock = DocumentLock::acquire_exclusive(path)?;
            *state = Self::load(path)?;
            Some(lock)
         },
         None => None,
      };
      let mut draft = state.clone();
      let (value, changed) = f(&mut draft)?;
      if changed {
         if let Some(path) = &self.path {
            Self::persist(path, &draft)?;
         }
         *state = draft;
      }
      Ok(value)
   }
}

impl IndexingRecordStore for JsonStore {
   fn save(&self, record: &mut IndexingRecord) -> Result<(), StoreError> {
      let id = self.mutate(|document| Ok((document.upsert(record.clone())?, true)))?;
      record.id = id;
      Ok(())
   }

   /// Applies every record to one copy of the document and writes it once.
   /// Records rejected by the store fail individually; a failed write fails
   /// the whole batch.
   fn save_all(&self, records: &mut [IndexingRecord]) -> Vec<Result<(), StoreError>> {
      let staged = self.mutate(|document| {
         let results: Vec<_> = records
            .iter()
            .map(|record| document.upsert(record.clone()))
            .collect();
         let changed = results.iter().any(Result::is_ok);
         Ok((results, changed))
      });
      match staged {
         Ok(results) => records
            .iter_mut()
            .zip(results)
            .map(|(record, result)| result.map(|id| record.id = id))
            .collect(),
         Err(err) => {
            let reason = err.to_string();
            records
               .iter()
               .map(|_| Err(StoreError::Backend(format!("batch not saved: {reason}"))))
               .collect()
         },
      }
   }

   fn find(&self, filter: &RecordFilter) -> Result<Vec<IndexingRecord>, StoreError> {
      self.read(|document| {
         document
            .records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
      })
   }

   fn find_by_pairs(
      &self,
      api_key: &str,
      target_type: &str,
      pairs: &[(u64, Option<u64>)],
   ) -> Result<Vec<IndexingRecord>, StoreError> {
      self.read(|document| {
         document
            .records
            .values()
            .filter(|record| record.api_key == api_key && record.target_type == target_type)
            .filter(|record| {
               pairs
                  .iter()
                  .any(|&(id, parent)| record.target_id == id && record.target_parent_id == parent)
            })
            .cloned()
            .collect()
      })
   }

   fn claim(
      &self,
      ids: &[u64],
      now: DateTime<Utc>,
      ttl: chrono::Duration,
   ) -> Result<Vec<IndexingRecord>, StoreError> {
      self.mutate(|document| {
         let mut claimed = Vec::with_capacity(ids.len());
         for id in ids {
            let Some(record) = document.records.get_mut(id) else {
               continue;
            };
            if record.is_locked(now, ttl) {
               continue;
            }
            record.lock_timestamp = Some(now);
            claimed.push(record.clone());
         }
         let changed = !claimed.is_empty();
         Ok((claimed, changed))
      })
   }

   fn release(&self, ids: &[u64]) -> Result<(), StoreError> {
      self.mutate(|document| {
         let mut changed = false;
         for id in ids {
            if let Some(record) = document.records.get_mut(id)
               && record.lock_timestamp.take().is_some()
            {
               changed = true;
            }
         }
         Ok(((), changed))
      })
   }
}

impl SyncHistoryStore for JsonStore {
   fn insert_history(&self, record: &mut SyncHistoryRecord) -> Result<(), StoreError> {
      let id = self.mutate(|document| {
         document.next_history_id += 1;
         let id = document.next_history_id;
         let mut row = record.clone();
         row.id = id;
         document.history.insert(id, row);
         Ok((id, true))
      })?;
      record.id = id;
      Ok(())
   }

   fn history(&self) -> Result<Vec<SyncHistoryRecord>, StoreError> {
      self.read(|document| document.history.values().cloned().collect())
   }

   fn delete_history(&self, ids: &[u64]) -> Result<usize, StoreError> {
      self.mutate(|document| {
         let removed = ids
            .iter()
            .filter(|&&id| document.history.remove(&id).is_some())
            .count();
         Ok((removed, removed > 0))
      })
   }

   fn consolidation(
      &self,
      key: &ConsolidationKey,
      date: NaiveDate,
   ) -> Result<Option<ConsolidationRecord>, StoreError> {
      self.read(|document| {
         document
            .consolidations
            .values()
            .find(|record| record.key == *key && record.date == date)
            .cloned()
      })
   }

   fn save_consolidation(&self, record: &mut ConsolidationRecord) -> Result<(), StoreError> {
      let id = self.mutate(|document| {
         let mut rollup = record.clone();
         if rollup.id == 0 {
            document.next_consolidation_id += 1;
            rollup.id = document.next_consolidation_id;
         } else if !document.consolidations.contains_key(&rollup.id) {
            return Err(StoreError::ConsolidationNotFound(rollup.id));
         }
         let id = rollup.id;
         document.consolidations.insert(id, rollup);
         Ok((id, true))
      })?;
      record.id = id;
      Ok(())
   }

   fn delete_consolidation(&self, id: u64) -> Result<(), StoreError> {
      self.mutate(|document| match document.consolidations.remove(&id) {
         Some(_) => Ok(((), true)),
         None => Err(StoreError::ConsolidationNotFound(id)),
      })
   }

   fn consolidations(&self) -> Result<Vec<ConsolidationRecord>, StoreError> {
      self.read(|document| document.consolidations.values().cloned().collect())
   }

   fn delete_consolidations_before(&self, date: NaiveDate) -> Result<usize, StoreError> {
      self.mutate(|document| {
         let before = document.consolidations.len();
         document.consolidations.retain(|_, record| record.date >= date);
         let removed = before - document.consolidations.len();
         Ok((removed, removed > 0))
      })
   }
}
