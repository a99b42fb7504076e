use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Synchronization action pending on, or last completed for, a record
#[derive(
   Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
   #[default]
   NoAction,
   Add,
   Update,
   Delete,
}

impl Action {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::NoAction => "NO_ACTION",
         Self::Add => "ADD",
         Self::Update => "UPDATE",
         Self::Delete => "DELETE",
      }
   }

   /// Lowercase form used in pipeline identifiers (`product::add`).
   pub const fn as_pipeline_str(self) -> &'static str {
      match self {
         Self::NoAction => "no_action",
         Self::Add => "add",
         Self::Update => "update",
         Self::Delete => "delete",
      }
   }

   /// Whether the remote index holds the target once this action succeeded.
   pub const fn leaves_indexable(self) -> bool {
      match self {
         Self::Add | Self::Update => true,
         Self::Delete | Self::NoAction => false,
      }
   }
}

impl fmt::Display for Action {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

impl FromStr for Action {
   type Err = String;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      match s.trim().to_ascii_lowercase().as_str() {
         "no_action" | "noaction" | "none" => Ok(Self::NoAction),
         "add" => Ok(Self::Add),
         "update" => Ok(Self::Update),
         "delete" => Ok(Self::Delete),
         other => Err(format!("unknown action '{other}'")),
      }
   }
}

/// State change applied to an [`IndexingRecord`].
///
/// Every mutation of `next_action` goes through [`IndexingRecord::apply`];
/// there is no other setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
   /// Candidate is indexable in at least one store scope of the tenant.
   BecameIndexable,
   /// Candidate disappeared or is no longer indexable anywhere.
   BecameNotIndexable,
   /// Caller explicitly asked for the target to be resent.
   UpdateRequested,
   /// Remote index accepted the given action for this record.
   Synced(Action),
}

/// Composite identity of a target inside one tenant and type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
   pub target_id:        u64,
   pub target_parent_id: Option<u64>,
   pub target_subtype:   Option<String>,
}

impl RecordKey {
   pub const fn pair(&self) -> (u64, Option<u64>) {
      (self.target_id, self.target_parent_id)
   }
}

/// Formats the id the remote index knows a target by.
pub fn payload_id(target_id: u64, target_parent_id: Option<u64>) -> String {
   match target_parent_id {
      Some(parent) => format!("{parent}-{target_id}"),
      None => target_id.to_string(),
   }
}

/// Parses `"<parent>-<id>"` or `"<id>"` into `(id, parent)`.
pub fn parse_payload_id(id: &str) -> Option<(u64, Option<u64>)> {
   let id = id.trim();
   match id.split_once('-') {
      Some((parent, target)) => {
         let parent = parent.trim().parse().ok()?;
         let target = target.trim().parse().ok()?;
         Some((target, Some(parent)))
      },
      None => id.parse().ok().map(|target| (target, None)),
   }
}

/// Persisted reconciliation state for one entity or attribute of a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingRecord {
   /// Store-assigned id; `0` until first saved.
   #[serde(default)]
   pub id:                    u64,
   pub api_key:               String,
   pub target_type:           String,
   #[serde(default)]
   pub target_subtype:        Option<String>,
   pub target_id:             u64,
   #[serde(default)]
   pub target_parent_id:      Option<u64>,
   #[serde(default)]
   pub target_code:           Option<String>,
   pub next_action:           Action,
   pub last_action:           Action,
   #[serde(default)]
   pub last_action_timestamp: Option<DateTime<Utc>>,
   pub is_indexable:          bool,
   #[serde(default)]
   pub requires_update:       bool,
   #[serde(default)]
   pub lock_timestamp:        Option<DateTime<Utc>>,
}

impl IndexingRecord {
   /// A freshly discovered target, scheduled for its first `ADD`.
   pub fn discovered(api_key: &str, target_type: &str, candidate: &CandidateRecord) -> Self {
      Self {
         id:                    0,
         api_key:               api_key.to_string(),
         target_type:           target_type.to_string(),
         target_subtype:        candidate.target_subtype.clone(),
         target_id:             candidate.target_id,
         target_parent_id:      candidate.target_parent_id,
         target_code:           candidate.target_code.clone(),
         next_action:           Action::Add,
         last_action:           Action::NoAction,
         last_action_timestamp: None,
         is_indexable:          candidate.is_indexable,
         requires_update:       false,
         lock_timestamp:        None,
      }
   }

   pub fn key(&self) -> RecordKey {
      RecordKey {
         target_id:        self.target_id,
         target_parent_id: self.target_parent_id,
         target_subtype:   self.target_subtype.clone(),
      }
   }

   pub fn payload_id(&self) -> String {
      payload_id(self.target_id, self.target_parent_id)
   }

   /// Whether the target was accepted by the remote index at some point.
   pub fn was_synced(&self) -> bool {
      self.last_action != Action::NoAction
   }

   pub fn is_locked(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
      self
         .lock_timestamp
         .is_some_and(|locked_at| now.signed_duration_since(locked_at) < ttl)
   }

   /// Applies a state transition.
   ///
   /// `now` is only recorded for [`Transition::Synced`].
   pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) {
      match transition {
         Transition::BecameIndexable => {
            self.is_indexable = true;
            self.next_action = match self.next_action {
               Action::NoAction => Action::Add,
               pending @ (Action::Add | Action::Update | Action::Delete) => pending,
            };
         },
         Transition::BecameNotIndexable => {
            self.is_indexable = false;
            self.next_action = if self.was_synced() {
               Action::Delete
            } else {
               match self.next_action {
                  Action::Add | Action::Update | Action::NoAction => Action::NoAction,
                  Action::Delete => Action::Delete,
               }
            };
         },
         Transition::UpdateRequested => {
            self.next_action = match self.next_action {
               Action::NoAction if self.is_indexable => Action::Update,
               Action::NoAction => Action::NoAction,
               pending @ (Action::Add | Action::Update | Action::Delete) => pending,
            };
         },
         Transition::Synced(action) => {
            self.next_action = Action::NoAction;
            self.last_action = action;
            self.last_action_timestamp = Some(now);
            self.is_indexable = action.leaves_indexable();
            self.lock_timestamp = None;
         },
      }
   }
}

/// Candidate record reported by a discovery provider for one store scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
   pub store_id:         u32,
   pub target_id:        u64,
   #[serde(default)]
   pub target_parent_id: Option<u64>,
   #[serde(default)]
   pub target_code:      Option<String>,
   #[serde(default)]
   pub target_subtype:   Option<String>,
   pub is_indexable:     bool,
}

impl CandidateRecord {
   pub const fn new(store_id: u32, target_id: u64, is_indexable: bool) -> Self {
      Self {
         store_id,
         target_id,
         target_parent_id: None,
         target_code: None,
         target_subtype: None,
         is_indexable,
      }
   }

   pub const fn with_parent(mut self, parent_id: u64) -> Self {
      self.target_parent_id = Some(parent_id);
      self
   }

   pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
      self.target_subtype = Some(subtype.into());
      self
   }

   pub fn with_code(mut self, code: impl Into<String>) -> Self {
      self.target_code = Some(code.into());
      self
   }

   pub fn key(&self) -> RecordKey {
      RecordKey {
         target_id:        self.target_id,
         target_parent_id: self.target_parent_id,
         target_subtype:   self.target_subtype.clone(),
      }
   }
}

/// One synchronization attempt for one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHistoryRecord {
   #[serde(default)]
   pub id:               u64,
   pub api_key:          String,
   pub target_type:      String,
   pub target_id:        u64,
   #[serde(default)]
   pub target_parent_id: Option<u64>,
   pub action:           Action,
   pub action_timestamp: DateTime<Utc>,
   pub is_success:       bool,
   pub message:          String,
}

impl SyncHistoryRecord {
   pub fn key(&self) -> ConsolidationKey {
      ConsolidationKey {
         api_key:          self.api_key.clone(),
         target_type:      self.target_type.clone(),
         target_id:        self.target_id,
         target_parent_id: self.target_parent_id,
      }
   }

   pub fn entry(&self) -> HistoryEntry {
      HistoryEntry {
         action_timestamp: self.action_timestamp,
         action:           self.action,
         is_success:       self.is_success,
         message:          self.message.clone(),
      }
   }
}

/// Identity shared by raw history rows and their daily rollups
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsolidationKey {
   pub api_key:          String,
   pub target_type:      String,
   pub target_id:        u64,
   pub target_parent_id: Option<u64>,
}

/// Single attempt inside a consolidated day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
   pub action_timestamp: DateTime<Utc>,
   pub action:           Action,
   pub is_success:       bool,
   pub message:          String,
}

/// All attempts for one target on one calendar day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationRecord {
   #[serde(default)]
   pub id:      u64,
   #[serde(flatten)]
   pub key:     ConsolidationKey,
   pub date:    NaiveDate,
   pub history: Vec<HistoryEntry>,
}

impl ConsolidationRecord {
   /// The day's attempts as a JSON array.
   pub fn history_json(&self) -> serde_json::Result<String> {
      serde_json::to_string(&self.history)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn record(next: Action, last: Action, indexable: bool) -> IndexingRecord {
      let mut record = IndexingRecord::discovered("key", "product", &CandidateRecord::new(
         1, 10, indexable,
      ));
      record.next_action = next;
      record.last_action = last;
      record
   }

   #[test]
   fn payload_ids_round_trip_parent_prefix() {
      assert_eq!(payload_id(5, None), "5");
      assert_eq!(payload_id(5, Some(9)), "9-5");
      assert_eq!(parse_payload_id("9-5"), Some((5, Some(9))));
      assert_eq!(parse_payload_id("5"), Some((5, None)));
      assert_eq!(parse_payload_id("abc"), None);
      assert_eq!(parse_payload_id("1-x"), None);
   }

   #[test]
   fn action_parses_case_insensitive() {
      assert_eq!("Delete".parse::<Action>().unwrap(), Action::Delete);
      assert_eq!("NO_ACTION".parse::<Action>().unwrap(), Action::NoAction);
      assert!("purge".parse::<Action>().is_err());
   }

   #[test]
   fn becoming_indexable_promotes_only_idle_records() {
      let now = Utc::now();
      let mut idle = record(Action::NoAction, Action::Delete, false);
      idle.apply(Transition::BecameIndexable, now);
      assert_eq!(idle.next_action, Action::Add);
      assert!(idle.is_indexable);

      let mut pending = record(Action::Update, Action::Add, false);
      pending.apply(Transition::BecameIndexable, now);
      assert_eq!(pending.next_action, Action::Update);
   }

   #[test]
   fn becoming_not_indexable_deletes_only_live_records() {
      let now = Utc::now();
      let mut live = record(Action::NoAction, Action::Add, true);
      live.apply(Transition::BecameNotIndexable, now);
      assert_eq!(live.next_action, Action::Delete);
      assert!(!live.is_indexable);

      let mut never_sent = record(Action::Add, Action::NoAction, true);
      never_sent.apply(Transition::BecameNotIndexable, now);
      assert_eq!(never_sent.next_action, Action::NoAction);
      assert!(!never_sent.is_indexable);
   }

   #[test]
   fn update_request_respects_pending_actions() {
      let now = Utc::now();
      let mut idle = record(Action::NoAction, Action::Add, true);
      idle.apply(Transition::UpdateRequested, now);
      assert_eq!(idle.next_action, Action::Update);

      let mut adding = record(Action::Add, Action::NoAction, true);
      adding.apply(Transition::UpdateRequested, now);
      assert_eq!(adding.next_action, Action::Add);

      let mut hidden = record(Action::NoAction, Action::Delete, false);
      hidden.apply(Transition::UpdateRequested, now);
      assert_eq!(hidden.next_action, Action::NoAction);
   }

   #[test]
   fn synced_clears_pending_work() {
      let now = Utc::now();
      let mut deleting = record(Action::Delete, Action::Add, false);
      deleting.lock_timestamp = Some(now);
      deleting.apply(Transition::Synced(Action::Delete), now);
      assert_eq!(deleting.next_action, Action::NoAction);
      assert_eq!(deleting.last_action, Action::Delete);
      assert_eq!(deleting.last_action_timestamp, Some(now));
      assert!(!deleting.is_indexable);
      assert!(deleting.lock_timestamp.is_none());
   }

   #[test]
   fn lock_expires_after_ttl() {
      let now = Utc::now();
      let mut locked = record(Action::Add, Action::NoAction, true);
      locked.lock_timestamp = Some(now - chrono::Duration::minutes(10));
      assert!(locked.is_locked(now, chrono::Duration::minutes(30)));
      assert!(!locked.is_locked(now, chrono::Duration::minutes(5)));
   }
}
