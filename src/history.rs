//! Daily rollup and retention of sync history.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{Days, NaiveDate, Utc};

use crate::{
   Result, config,
   store::SyncHistoryStore,
   types::{ConsolidationKey, ConsolidationRecord, SyncHistoryRecord},
};

/// Summary of a consolidation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
   /// Day buckets written.
   pub consolidated: usize,
   /// Raw rows removed after their bucket was written.
   pub raw_deleted:  usize,
   /// Buckets whose write or raw-row delete failed; their raw rows are kept.
   pub failed:       usize,
}

/// Summary of a retention run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanReport {
   pub cutoff:  NaiveDate,
   pub removed: usize,
}

pub struct HistoryConsolidator {
   store:          Arc<dyn SyncHistoryStore>,
   retention_days: u32,
}

impl HistoryConsolidator {
   pub fn new(store: Arc<dyn SyncHistoryStore>, retention_days: u32) -> Self {
      Self { store, retention_days }
   }

   /// Uses `history_retention_days` from the global config.
   pub fn from_config(store: Arc<dyn SyncHistoryStore>) -> Self {
      Self::new(store, config::get().history_retention_days)
   }

   /// Folds every raw row into the rollup for its target and UTC day.
   ///
   /// Entries are appended to an existing rollup for that day. Within a day
   /// they are ordered by timestamp, ties keeping insertion order.
   pub fn consolidate(&self) -> Result<ConsolidationReport> {
      let rows = self.store.history()?;

      let mut buckets: BTreeMap<(ConsolidationKey, NaiveDate), Vec<SyncHistoryRecord>> =
         BTreeMap::new();
      for row in rows {
         let day = row.action_timestamp.date_naive();
         buckets.entry((row.key(), day)).or_default().push(row);
      }

      let mut report = ConsolidationReport::default();
      for ((key, date), mut rows) in buckets {
         rows.sort_by_key(|row| row.action_timestamp);
         match self.consolidate_bucket(&key, date, &rows) {
            Ok(removed) => {
               report.consolidated += 1;
               report.raw_deleted += removed;
            },
            Err(err) => {
               tracing::warn!(
                  api_key = %key.api_key,
                  target_type = %key.target_type,
                  target_id = key.target_id,
                  target_parent_id = ?key.target_parent_id,
                  %date,
                  "failed to consolidate sync history: {err}"
               );
               report.failed += 1;
            },
         }
      }

      tracing::info!(
         consolidated = report.consolidated,
         raw_deleted = report.raw_deleted,
         failed = report.failed,
         "sync history consolidated"
      );
      Ok(report)
   }

   /// Appends `rows` to the day's rollup, then deletes them. If the delete
   /// fails the rollup is put back as it was, so a later run does not append
   /// the same rows twice.
   fn consolidate_bucket(
      &self,
      key: &ConsolidationKey,
      date: NaiveDate,
      rows: &[SyncHistoryRecord],
   ) -> Result<usize> {
      let previous = self.store.consolidation(key, date)?;
      let mut record = previous.clone().unwrap_or_else(|| ConsolidationRecord {
         id: 0,
         key: key.clone(),
         date,
         history: Vec::with_capacity(rows.len()),
      });
      record.history.extend(rows.iter().map(SyncHistoryRecord::entry));
      self.store.save_consolidation(&mut record)?;

      let ids: Vec<u64> = rows.iter().map(|row| row.id).collect();
      match self.store.delete_history(&ids) {
         Ok(removed) => Ok(removed),
         Err(err) => {
            let restored = match previous {
               Some(mut previous) => self.store.save_consolidation(&mut previous),
               None => self.store.delete_consolidation(record.id),
            };
            if let Err(restore_err) = restored {
               tracing::error!(
                  api_key = %key.api_key,
                  target_type = %key.target_type,
                  target_id = key.target_id,
                  %date,
                  "failed to restore sync history rollup: {restore_err}"
               );
            }
            Err(err.into())
         },
      }
   }

   /// Drops rollups older than the retention window relative to today (UTC).
   pub fn clean(&self) -> Result<CleanReport> {
      self.clean_as_of(Utc::now().date_naive())
   }

   /// Drops rollups dated strictly before `today - retention_days`.
   pub fn clean_as_of(&self, today: NaiveDate) -> Result<CleanReport> {
      let cutoff = today
         .checked_sub_days(Days::new(u64::from(self.retention_days)))
         .unwrap_or(NaiveDate::MIN);
      let removed = self.store.delete_consolidations_before(cutoff)?;
      tracing::info!(%cutoff, removed, "sync history retention applied");
      Ok(CleanReport { cutoff, removed })
   }
}
