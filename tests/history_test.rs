mod support;

use std::sync::Arc;

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use indexsync::{
   history::HistoryConsolidator,
   store::{JsonStore, SyncHistoryStore},
   types::{Action, ConsolidationKey, ConsolidationRecord, HistoryEntry, SyncHistoryRecord},
};
use support::FlakyHistoryStore;

fn row(target_id: u64, at: chrono::DateTime<Utc>, action: Action, message: &str) -> SyncHistoryRecord {
   SyncHistoryRecord {
      id: 0,
      api_key: "tenant-a".to_string(),
      target_type: "product".to_string(),
      target_id,
      target_parent_id: None,
      action,
      action_timestamp: at,
      is_success: true,
      message: message.to_string(),
   }
}

#[test]
fn rows_across_two_days_become_two_rollups() {
   let store = Arc::new(JsonStore::in_memory());
   let day_one = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
   let day_two = Utc.with_ymd_and_hms(2024, 5, 2, 23, 30, 0).unwrap();
   for (at, action, message) in [
      (day_one, Action::Add, "first"),
      (day_one + Duration::hours(3), Action::Update, "second"),
      (day_two, Action::Delete, "third"),
      (day_one + Duration::hours(5), Action::Update, "fourth"),
   ] {
      store.insert_history(&mut row(1, at, action, message)).unwrap();
   }

   let report = HistoryConsolidator::new(store.clone(), 7).consolidate().unwrap();
   assert_eq!(report.consolidated, 2);
   assert_eq!(report.raw_deleted, 4);
   assert!(store.history().unwrap().is_empty());

   let rollups = store.consolidations().unwrap();
   assert_eq!(rollups.len(), 2);
   let first = rollups.iter().find(|r| r.date == day_one.date_naive()).unwrap();
   let messages: Vec<_> = first.history.iter().map(|e| e.message.as_str()).collect();
   assert_eq!(messages, vec!["first", "second", "fourth"]);

   let second = rollups.iter().find(|r| r.date == day_two.date_naive()).unwrap();
   let json: serde_json::Value = serde_json::from_str(&second.history_json().unwrap()).unwrap();
   assert_eq!(json.as_array().unwrap().len(), 1);
   assert_eq!(json[0]["action"], "DELETE");
   assert_eq!(json[0]["message"], "third");
}

#[test]
fn failed_groups_keep_their_raw_rows() {
   let store = FlakyHistoryStore::new([2]);
   let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
   store.inner.insert_history(&mut row(1, at, Action::Add, "ok")).unwrap();
   store.inner.insert_history(&mut row(2, at, Action::Add, "stuck")).unwrap();

   let report = HistoryConsolidator::new(store.clone(), 7).consolidate().unwrap();
   assert_eq!(report.consolidated, 1);
   assert_eq!(report.failed, 1);

   let remaining = store.history().unwrap();
   assert_eq!(remaining.len(), 1);
   assert_eq!(remaining[0].target_id, 2);
   assert_eq!(store.consolidations().unwrap().len(), 1);
}

#[test]
fn failed_raw_delete_does_not_duplicate_entries() {
   let store = FlakyHistoryStore::failing_deletes(1);
   let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
   store.inner.insert_history(&mut row(1, at, Action::Add, "once")).unwrap();

   let consolidator = HistoryConsolidator::new(store.clone(), 7);
   let report = consolidator.consolidate().unwrap();
   assert_eq!(report.failed, 1);
   assert_eq!(report.consolidated, 0);
   assert_eq!(store.history().unwrap().len(), 1);
   assert!(store.consolidations().unwrap().is_empty());

   let report = consolidator.consolidate().unwrap();
   assert_eq!(report.consolidated, 1);
   assert_eq!(report.raw_deleted, 1);
   let rollups = store.consolidations().unwrap();
   assert_eq!(rollups.len(), 1);
   assert_eq!(rollups[0].history.len(), 1);
   assert!(store.history().unwrap().is_empty());
}

#[test]
fn failed_raw_delete_restores_an_existing_rollup() {
   let store = FlakyHistoryStore::failing_deletes(0);
   let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
   store.inner.insert_history(&mut row(1, at, Action::Add, "morning")).unwrap();
   let consolidator = HistoryConsolidator::new(store.clone(), 7);
   consolidator.consolidate().unwrap();

   *store.failing_deletes.lock() = 1;
   store
      .inner
      .insert_history(&mut row(1, at + Duration::hours(4), Action::Update, "afternoon"))
      .unwrap();
   assert_eq!(consolidator.consolidate().unwrap().failed, 1);
   let messages: Vec<_> = store.consolidations().unwrap()[0]
      .history
      .iter()
      .map(|e| e.message.clone())
      .collect();
   assert_eq!(messages, vec!["morning"]);

   consolidator.consolidate().unwrap();
   let messages: Vec<_> = store.consolidations().unwrap()[0]
      .history
      .iter()
      .map(|e| e.message.clone())
      .collect();
   assert_eq!(messages, vec!["morning", "afternoon"]);
}

#[test]
fn two_day_retention_keeps_recent_rollups() {
   let store = Arc::new(JsonStore::in_memory());
   let today = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
   for days_ago in [0u64, 1, 2, 3, 10] {
      let mut record = ConsolidationRecord {
         id:      0,
         key:     ConsolidationKey {
            api_key:          "tenant-a".to_string(),
            target_type:      "product".to_string(),
            target_id:        days_ago,
            target_parent_id: None,
         },
         date:    today - chrono::Days::new(days_ago),
         history: vec![HistoryEntry {
            action_timestamp: Utc::now(),
            action:           Action::Add,
            is_success:       true,
            message:          String::new(),
         }],
      };
      store.save_consolidation(&mut record).unwrap();
   }

   let report = HistoryConsolidator::new(store.clone(), 2).clean_as_of(today).unwrap();
   assert_eq!(report.removed, 2);

   let mut kept: Vec<_> = store.consolidations().unwrap().iter().map(|r| r.date).collect();
   kept.sort();
   assert_eq!(kept, vec![
      today - chrono::Days::new(2),
      today - chrono::Days::new(1),
      today,
   ]);
}
