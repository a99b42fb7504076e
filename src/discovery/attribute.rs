//! Attribute flavour of discovery.

use std::{collections::BTreeSet, sync::Arc};

use super::{
   AddFilter, DiscoveryOrchestrator, DiscoveryRequest, DiscoveryResult, DiscoveryRun,
   ProviderRegistry, RecordKind,
};
use crate::{
   conflict::MapperRegistry,
   filter::RequiresUpdateFilter,
   store::IndexingRecordStore,
   types::{CandidateRecord, IndexingRecord},
};

/// Keeps standard attributes and attributes whose published name is already
/// taken out of the to-add set.
pub struct AttributeExclusion {
   mappers: MapperRegistry,
}

impl AttributeExclusion {
   pub const fn new(mappers: MapperRegistry) -> Self {
      Self { mappers }
   }
}

impl AddFilter for AttributeExclusion {
   fn retain(
      &self,
      api_key: &str,
      target_type: &str,
      to_add: Vec<CandidateRecord>,
      existing: &[IndexingRecord],
   ) -> Vec<CandidateRecord> {
      let mut taken: BTreeSet<String> = self
         .mappers
         .standard_attributes(target_type)
         .map(str::to_string)
         .collect();
      taken.extend(
         existing
            .iter()
            .filter_map(|record| record.target_code.as_deref())
            .map(|code| self.mappers.resolve(target_type, code)),
      );

      to_add
         .into_iter()
         .filter(|candidate| {
            let Some(code) = candidate.target_code.as_deref() else {
               return true;
            };
            if self.mappers.is_standard(target_type, code) {
               return false;
            }
            let name = self.mappers.resolve(target_type, code);
            if taken.insert(name.clone()) {
               true
            } else {
               tracing::debug!(
                  api_key,
                  target_type,
                  code,
                  name = %name,
                  "skipping attribute mapped to a name already in use"
               );
               false
            }
         })
         .collect()
   }
}

/// Discovery over attribute records.
///
/// Same reconciliation as [`DiscoveryOrchestrator`]; records carry the
/// attribute code in `target_code` and `target_type` names the entity type
/// the attribute belongs to.
pub struct AttributeDiscoveryOrchestrator {
   inner: DiscoveryOrchestrator,
}

impl AttributeDiscoveryOrchestrator {
   pub fn new(
      store: Arc<dyn IndexingRecordStore>,
      providers: ProviderRegistry,
      mappers: MapperRegistry,
   ) -> Self {
      let inner = DiscoveryOrchestrator::new(store, providers)
         .with_kind(RecordKind::Attribute)
         .with_add_filter(Arc::new(AttributeExclusion::new(mappers)));
      Self { inner }
   }

   pub fn execute(&self, request: DiscoveryRequest) -> DiscoveryRun<'_> {
      self.inner.execute(request)
   }

   pub fn execute_requires_update<'a>(
      &'a self,
      filter: &RequiresUpdateFilter,
      api_keys: Option<&[String]>,
   ) -> Box<dyn Iterator<Item = DiscoveryResult> + 'a> {
      self.inner.execute_requires_update(filter, api_keys)
   }

   pub fn store(&self) -> &Arc<dyn IndexingRecordStore> {
      self.inner.store()
   }
}
