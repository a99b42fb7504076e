//! Attribute-mapping conflict detection.
//!
//! Attribute codes are mapped to the name they are published under in the
//! remote index. Two kinds of collision are reported through the
//! notification sink: one name published by several entity types, and
//! several attributes of one entity type sharing a name.

use std::{
   collections::{BTreeMap, BTreeSet},
   sync::Arc,
};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
   Result,
   error::{MappingError, RegistryError},
   store::{IndexingRecordStore, RecordFilter},
   types::Action,
};

pub const CROSS_TYPE_NOTIFICATION: &str = "indexsync_attribute_cross_type_conflict";
pub const DUPLICATE_NOTIFICATION: &str = "indexsync_attribute_duplicate_mapping";

/// Maps an attribute code of one entity type to its published name.
pub trait AttributeMapper: Send + Sync {
   fn map(&self, code: &str) -> Result<String, MappingError>;
}

impl<F> AttributeMapper for F
where
   F: Fn(&str) -> Result<String, MappingError> + Send + Sync,
{
   fn map(&self, code: &str) -> Result<String, MappingError> {
      self(code)
   }
}

/// Mappers and standard attribute names keyed by entity type
#[derive(Default, Clone)]
pub struct MapperRegistry {
   mappers:  BTreeMap<String, Arc<dyn AttributeMapper>>,
   standard: BTreeMap<String, BTreeSet<String>>,
}

impl MapperRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn register(
      mut self,
      entity_type: impl Into<String>,
      mapper: Arc<dyn AttributeMapper>,
   ) -> Result<Self, RegistryError> {
      let entity_type = entity_type.into();
      if entity_type.trim().is_empty() {
         return Err(RegistryError::InvalidKey {
            kind:   "attribute mapper",
            key:    entity_type,
            reason: "entity type is empty".to_string(),
         });
      }
      if self.mappers.contains_key(&entity_type) {
         return Err(RegistryError::Duplicate { kind: "attribute mapper", key: entity_type });
      }
      self.mappers.insert(entity_type, mapper);
      Ok(self)
   }

   /// Names the entity type always publishes, independent of attribute
   /// records. They are never discovered and count as taken.
   pub fn with_standard_attributes<I, S>(mut self, entity_type: impl Into<String>, names: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self
         .standard
         .entry(entity_type.into())
         .or_default()
         .extend(names.into_iter().map(Into::into));
      self
   }

   pub fn standard_attributes(&self, entity_type: &str) -> impl Iterator<Item = &str> {
      self
         .standard
         .get(entity_type)
         .into_iter()
         .flatten()
         .map(String::as_str)
   }

   pub fn is_standard(&self, entity_type: &str, code: &str) -> bool {
      self
         .standard
         .get(entity_type)
         .is_some_and(|names| names.contains(code))
   }

   /// Published name of `code`; the raw code when no mapping exists.
   pub fn resolve(&self, entity_type: &str, code: &str) -> String {
      let Some(mapper) = self.mappers.get(entity_type) else {
         return code.to_string();
      };
      match mapper.map(code) {
         Ok(name) => name,
         Err(err) => {
            tracing::debug!(entity_type, code, "using raw attribute code: {err}");
            code.to_string()
         },
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
   Minor,
   Major,
   Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
   Info,
   Warning,
   Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
   pub notification_type: String,
   pub severity:          Severity,
   pub status:            NotificationStatus,
   pub message:           String,
   pub details:           Vec<String>,
   pub date:              NaiveDate,
   pub delete_after_view: bool,
}

/// Destination for operator-facing notifications
pub trait NotificationSink: Send + Sync {
   /// Creates the notification or replaces the one of the same type.
   fn upsert(&self, notification: Notification) -> Result<()>;

   fn delete(&self, notification_type: &str) -> Result<()>;
}

/// A published name reached from more than one entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossTypeConflict {
   pub name:         String,
   pub entity_types: Vec<String>,
}

/// A published name held by several attributes of one entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateConflict {
   pub entity_type: String,
   pub name:        String,
   pub occupants:   usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
   pub cross_type: Vec<CrossTypeConflict>,
   pub duplicates: Vec<DuplicateConflict>,
}

impl ConflictReport {
   pub fn is_clean(&self) -> bool {
      self.cross_type.is_empty() && self.duplicates.is_empty()
   }
}

pub struct ConflictDetector {
   store:   Arc<dyn IndexingRecordStore>,
   mappers: MapperRegistry,
   sink:    Arc<dyn NotificationSink>,
}

impl ConflictDetector {
   /// `store` holds attribute records, keyed by entity type.
   pub fn new(
      store: Arc<dyn IndexingRecordStore>,
      mappers: MapperRegistry,
      sink: Arc<dyn NotificationSink>,
   ) -> Self {
      Self { store, mappers, sink }
   }

   /// Runs both checks for `api_key`. Each check makes exactly one sink
   /// call: an upsert when it found conflicts, a delete otherwise. A failed
   /// call does not skip the other check; the first error is returned once
   /// both have run.
   pub fn detect(&self, api_key: &str) -> Result<ConflictReport> {
      let filter = RecordFilter {
         api_key: Some(api_key.to_string()),
         ..RecordFilter::default()
      }
      .with_indexable(true)
      .with_next_actions(&[Action::Add, Action::Update, Action::NoAction]);
      let records = self.store.find(&filter)?;

      // name -> entity type -> attribute ids
      let mut names: BTreeMap<String, BTreeMap<String, BTreeSet<u64>>> = BTreeMap::new();
      for record in &records {
         let Some(code) = record.target_code.as_deref() else {
            continue;
         };
         let name = self.mappers.resolve(&record.target_type, code);
         names
            .entry(name)
            .or_default()
            .entry(record.target_type.clone())
            .or_default()
            .insert(record.target_id);
      }

      let report = ConflictReport {
         cross_type: Self::cross_type(&names),
         duplicates: self.duplicates(&names),
      };

      let cross_type = self.notify(
         api_key,
         CROSS_TYPE_NOTIFICATION,
         report
            .cross_type
            .iter()
            .map(|c| format!("{}: {}", c.name, c.entity_types.join(", ")))
            .collect(),
         format!("Attribute names are mapped from more than one entity type for {api_key}."),
      );
      let duplicates = self.notify(
         api_key,
         DUPLICATE_NOTIFICATION,
         report
            .duplicates
            .iter()
            .map(|d| format!("{}: {} ({})", d.entity_type, d.name, d.occupants))
            .collect(),
         format!("Several attributes are mapped to the same name for {api_key}."),
      );
      cross_type.and(duplicates)?;

      Ok(report)
   }

   /// Upserts `notification_type` when `details` is non-empty, deletes it
   /// otherwise. Failures are logged and returned.
   fn notify(
      &self,
      api_key: &str,
      notification_type: &str,
      details: Vec<String>,
      message: String,
   ) -> Result<()> {
      let outcome = if details.is_empty() {
         self.sink.delete(notification_type)
      } else {
         tracing::warn!(api_key, notification_type, conflicts = details.len(), "{message}");
         self.sink.upsert(Notification {
            notification_type: notification_type.to_string(),
            severity:          Severity::Major,
            status:            NotificationStatus::Error,
            message,
            details,
            date:              Utc::now().date_naive(),
            delete_after_view: false,
         })
      };
      if let Err(err) = &outcome {
         tracing::error!(api_key, notification_type, "failed to dispatch notification: {err}");
      }
      outcome
   }

   fn cross_type(
      names: &BTreeMap<String, BTreeMap<String, BTreeSet<u64>>>,
   ) -> Vec<CrossTypeConflict> {
      names
         .iter()
         .filter(|(_, by_type)| by_type.len() > 1)
         .map(|(name, by_type)| CrossTypeConflict {
            name:         name.clone(),
            entity_types: by_type.keys().cloned().collect(),
         })
         .collect()
   }

   fn duplicates(
      &self,
      names: &BTreeMap<String, BTreeMap<String, BTreeSet<u64>>>,
   ) -> Vec<DuplicateConflict> {
      let mut duplicates: Vec<DuplicateConflict> = names
         .iter()
         .flat_map(|(name, by_type)| {
            by_type.iter().filter_map(move |(entity_type, ids)| {
               let occupants = ids.len() + usize::from(self.mappers.is_standard(entity_type, name));
               (occupants > 1).then(|| DuplicateConflict {
                  entity_type: entity_type.clone(),
                  name: name.clone(),
                  occupants,
               })
            })
         })
         .collect();
      duplicates.sort_by(|a, b| (&a.entity_type, &a.name).cmp(&(&b.entity_type, &b.name)));
      duplicates
   }
}
