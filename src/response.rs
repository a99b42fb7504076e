//! Reconciles a pipeline outcome back into record state and history.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;

use crate::{
   store::{IndexingRecordStore, SyncHistoryStore},
   sync::ApiPipelineResult,
   types::{Action, IndexingRecord, SyncHistoryRecord, Transition, parse_payload_id},
};

/// Batch being reconciled, as seen by observers
#[derive(Debug, Clone, Copy)]
pub struct BatchContext<'a> {
   pub api_key:     &'a str,
   pub target_type: &'a str,
   pub action:      Action,
   pub result:      &'a ApiPipelineResult,
   /// Records as handed to the pipeline, before reconciliation.
   pub records:     &'a BTreeMap<u64, IndexingRecord>,
}

/// Hooks around batch reconciliation. Both run synchronously.
pub trait BatchObserver: Send + Sync {
   fn before(&self, _context: &BatchContext<'_>) {}

   fn after(&self, _context: &BatchContext<'_>) {}
}

/// What one reconciliation wrote
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
   /// Record ids moved to their synced state.
   pub reconciled:   Vec<u64>,
   pub history_rows: usize,
   /// Per-record persistence failures, already logged.
   pub failures:     Vec<String>,
}

pub struct BatchResponseHandler {
   records:   Arc<dyn IndexingRecordStore>,
   history:   Arc<dyn SyncHistoryStore>,
   observers: Vec<Arc<dyn BatchObserver>>,
}

impl BatchResponseHandler {
   pub fn new(records: Arc<dyn IndexingRecordStore>, history: Arc<dyn SyncHistoryStore>) -> Self {
      Self { records, history, observers: Vec::new() }
   }

   pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
      self.observers.push(observer);
      self
   }

   /// Applies `result` for `action` to the batch in `records_by_id`.
   ///
   /// A failed result changes no record and writes one failed history row
   /// per input record. A successful one marks every input record that is
   /// pending `action` and whose `(target_id, target_parent_id)` appears in
   /// the payload as synced; the rest of the batch is left alone. History rows always cover the
   /// whole batch.
   pub fn execute(
      &self,
      result: &ApiPipelineResult,
      action: Action,
      records_by_id: &BTreeMap<u64, IndexingRecord>,
      target_type: &str,
      api_key: &str,
   ) -> BatchOutcome {
      let context = BatchContext { api_key, target_type, action, result, records: records_by_id };
      for observer in &self.observers {
         observer.before(&context);
      }

      let now = Utc::now();
      let mut outcome = BatchOutcome::default();

      if result.success {
         for payload in &result.payload {
            let Some(pair) = parse_payload_id(&payload.id) else {
               tracing::warn!(api_key, target_type, id = %payload.id, "unparseable payload record id");
               continue;
            };
            for record in records_by_id.values() {
               // Siblings sharing the payload id may be waiting on a
               // different action; only the one sent for `action` is synced.
               if (record.target_id, record.target_parent_id) != pair
                  || record.next_action != action
               {
                  continue;
               }
               if outcome.reconciled.contains(&record.id) {
                  continue;
               }
               let mut record = record.clone();
               record.apply(Transition::Synced(action), now);
               match self.records.save(&mut record) {
                  Ok(()) => outcome.reconciled.push(record.id),
                  Err(err) => {
                     tracing::error!(
                        api_key,
                        target_type,
                        record_id = record.id,
                        target_id = record.target_id,
                        "failed to save synced record: {err}"
                     );
                     outcome.failures.push(format!("record {}: {err}", record.id));
                  },
               }
            }
         }
      }

      let message = result.message();
      for record in records_by_id.values() {
         let mut row = SyncHistoryRecord {
            id: 0,
            api_key: api_key.to_string(),
            target_type: target_type.to_string(),
            target_id: record.target_id,
            target_parent_id: record.target_parent_id,
            action,
            action_timestamp: now,
            is_success: result.success,
            message: message.clone(),
         };
         match self.history.insert_history(&mut row) {
            Ok(()) => outcome.history_rows += 1,
            Err(err) => {
               tracing::error!(
                  api_key,
                  target_type,
                  target_id = record.target_id,
                  target_parent_id = ?record.target_parent_id,
                  "failed to write sync history: {err}"
               );
               outcome.failures.push(format!("history for target {}: {err}", record.target_id));
            },
         }
      }

      tracing::debug!(
         api_key,
         target_type,
         action = %action,
         success = result.success,
         reconciled = outcome.reconciled.len(),
         "batch reconciled"
      );

      for observer in &self.observers {
         observer.after(&context);
      }
      outcome
   }
}
