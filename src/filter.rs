//! Diff functions between discovered candidates and persisted records.
//!
//! Everything here is pure except [`RequiresUpdateFilter`], which reads the
//! record store lazily. The discovery orchestrators decide what to do with
//! the returned sets.

use std::{
   collections::{BTreeMap, HashMap},
   sync::Arc,
   vec,
};

use crate::{
   Result, config,
   error::StoreError,
   store::{IndexingRecordStore, RecordFilter},
   types::{Action, CandidateRecord, IndexingRecord, RecordKey},
};

/// Candidates of one tenant and type, merged across store scopes.
pub type MergedCandidates = BTreeMap<RecordKey, CandidateRecord>;

/// Folds per-store-scope candidates into one entry per composite key.
///
/// A key is indexable when any store scope reports it indexable.
pub fn merge_candidates(candidates: impl IntoIterator<Item = CandidateRecord>) -> MergedCandidates {
   let mut merged = MergedCandidates::new();
   for candidate in candidates {
      merged
         .entry(candidate.key())
         .and_modify(|existing| {
            existing.is_indexable |= candidate.is_indexable;
            if existing.target_code.is_none() {
               existing.target_code.clone_from(&candidate.target_code);
            }
         })
         .or_insert(candidate);
   }
   merged
}

fn index_by_key(existing: &[IndexingRecord]) -> HashMap<RecordKey, &IndexingRecord> {
   existing.iter().map(|record| (record.key(), record)).collect()
}

fn candidate_indexable(candidates: &MergedCandidates, record: &IndexingRecord) -> bool {
   candidates
      .get(&record.key())
      .is_some_and(|candidate| candidate.is_indexable)
}

/// Candidates with no persisted record.
pub fn filter_to_add(
   candidates: &MergedCandidates,
   existing: &[IndexingRecord],
) -> Vec<CandidateRecord> {
   let existing = index_by_key(existing);
   candidates
      .iter()
      .filter(|(key, _)| !existing.contains_key(*key))
      .map(|(_, candidate)| candidate.clone())
      .collect()
}

/// Records currently not indexable whose candidate is indexable again.
pub fn filter_to_set_indexable(
   candidates: &MergedCandidates,
   existing: &[IndexingRecord],
) -> Vec<IndexingRecord> {
   existing
      .iter()
      .filter(|record| !record.is_indexable && candidate_indexable(candidates, record))
      .cloned()
      .collect()
}

/// Indexable records whose candidate vanished or stopped being indexable,
/// limited to records that never reached the remote index.
///
/// Disjoint from [`filter_to_delete`].
pub fn filter_to_set_not_indexable(
   candidates: &MergedCandidates,
   existing: &[IndexingRecord],
) -> Vec<IndexingRecord> {
   existing
      .iter()
      .filter(|record| {
         record.is_indexable && !candidate_indexable(candidates, record) && !record.was_synced()
      })
      .cloned()
      .collect()
}

/// Indexable records whose candidate vanished or stopped being indexable and
/// that were synced before, so the remote copy has to be removed.
pub fn filter_to_delete(
   candidates: &MergedCandidates,
   existing: &[IndexingRecord],
) -> Vec<IndexingRecord> {
   existing
      .iter()
      .filter(|record| {
         record.is_indexable && !candidate_indexable(candidates, record) && record.was_synced()
      })
      .cloned()
      .collect()
}

/// Records of the given targets that should be resent.
///
/// Only indexable records qualify, and pending `ADD`/`DELETE` work is left
/// alone.
pub fn filter_to_update(
   existing: &[IndexingRecord],
   target_ids: &[u64],
   subtypes: Option<&[String]>,
) -> Vec<IndexingRecord> {
   existing
      .iter()
      .filter(|record| target_ids.contains(&record.target_id))
      .filter(|record| {
         subtypes.is_none_or(|subtypes| {
            record
               .target_subtype
               .as_ref()
               .is_some_and(|subtype| subtypes.contains(subtype))
         })
      })
      .filter(|record| record.is_indexable)
      .filter(|record| matches!(record.next_action, Action::NoAction | Action::Update))
      .cloned()
      .collect()
}

/// Decides whether a record flagged `requires_update` must be resent.
pub trait RequiresUpdateDeterminer: Send + Sync {
   fn requires_update(&self, record: &IndexingRecord) -> bool;
}

impl<F> RequiresUpdateDeterminer for F
where
   F: Fn(&IndexingRecord) -> bool + Send + Sync,
{
   fn requires_update(&self, record: &IndexingRecord) -> bool {
      self(record)
   }
}

/// Determiner outcome for one flagged record
#[derive(Debug, Clone)]
pub struct RequiresUpdateDecision {
   pub record:          IndexingRecord,
   pub requires_update: bool,
}

/// Streams records flagged `requires_update` in fixed-size batches.
pub struct RequiresUpdateFilter {
   determiner: Arc<dyn RequiresUpdateDeterminer>,
   batch_size: usize,
}

impl RequiresUpdateFilter {
   /// Fails when `batch_size` is not strictly between 0 and `upper_bound`.
   pub fn new(
      determiner: Arc<dyn RequiresUpdateDeterminer>,
      batch_size: usize,
      upper_bound: usize,
   ) -> Result<Self> {
      let batch_size = config::validate_batch_size(batch_size, upper_bound)?;
      Ok(Self { determiner, batch_size })
   }

   /// Uses `requires_update_batch_size` and the bound from the global config.
   pub fn from_config(determiner: Arc<dyn RequiresUpdateDeterminer>) -> Result<Self> {
      let cfg = config::get();
      Self::new(determiner, cfg.requires_update_batch_size, cfg.batch_size_upper_bound)
   }

   pub const fn batch_size(&self) -> usize {
      self.batch_size
   }

   /// Lists flagged records matching `filter` and returns a single-pass
   /// iterator that runs the determiner one batch at a time.
   pub fn batches(
      &self,
      store: &dyn IndexingRecordStore,
      filter: RecordFilter,
   ) -> Result<RequiresUpdateBatches, StoreError> {
      let records = store.find(&filter.with_requires_update(true))?;
      Ok(RequiresUpdateBatches {
         determiner: Arc::clone(&self.determiner),
         batch_size: self.batch_size,
         records:    records.into_iter(),
      })
   }
}

/// Lazy batches produced by [`RequiresUpdateFilter::batches`]
pub struct RequiresUpdateBatches {
   determiner: Arc<dyn RequiresUpdateDeterminer>,
   batch_size: usize,
   records:    vec::IntoIter<IndexingRecord>,
}

impl Iterator for RequiresUpdateBatches {
   type Item = Vec<RequiresUpdateDecision>;

   fn next(&mut self) -> Option<Self::Item> {
      let batch: Vec<RequiresUpdateDecision> = self
         .records
         .by_ref()
         .take(self.batch_size)
         .map(|record| {
            let requires_update = self.determiner.requires_update(&record);
            RequiresUpdateDecision { record, requires_update }
         })
         .collect();
      (!batch.is_empty()).then_some(batch)
   }
}
