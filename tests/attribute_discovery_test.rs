mod support;

use std::sync::Arc;

use indexsync::{
   conflict::{AttributeMapper, MapperRegistry},
   discovery::{AttributeDiscoveryOrchestrator, DiscoveryAction, DiscoveryRequest, ProviderRegistry},
   error::MappingError,
   store::{IndexingRecordStore, JsonStore},
   types::{Action, CandidateRecord},
};
use support::{FlakyRecordStore, StaticProvider, record_for, records, sync_all};

const KEY: &str = "tenant-a";

fn mappers() -> MapperRegistry {
   let product: Arc<dyn AttributeMapper> = Arc::new(|code: &str| match code {
      "color" | "colour" => Ok("color".to_string()),
      "brand" => Ok("manufacturer".to_string()),
      other => Err(MappingError::NotFound {
         entity_type: "product".to_string(),
         code:        other.to_string(),
      }),
   });
   MapperRegistry::new()
      .register("product", product)
      .unwrap()
      .with_standard_attributes("product", ["name", "sku", "price"])
}

fn attribute(id: u64, code: &str, indexable: bool) -> CandidateRecord {
   CandidateRecord::new(1, id, indexable).with_code(code)
}

fn orchestrator(
   store: Arc<dyn IndexingRecordStore>,
   provider: Arc<StaticProvider>,
) -> AttributeDiscoveryOrchestrator {
   let providers = ProviderRegistry::new()
      .register("product_attributes", provider)
      .unwrap();
   AttributeDiscoveryOrchestrator::new(store, providers, mappers())
}

#[test]
fn standard_and_duplicate_mapped_codes_are_not_added() {
   let store = Arc::new(JsonStore::in_memory());
   let provider = StaticProvider::new("product");
   provider.set(KEY, vec![
      attribute(1, "sku", true),
      attribute(2, "color", true),
      attribute(3, "colour", true),
      attribute(4, "brand", true),
      attribute(5, "material", false),
   ]);
   let orchestrator = orchestrator(store.clone(), provider);

   let results: Vec<_> = orchestrator.execute(DiscoveryRequest::default()).collect();
   assert_eq!(results.len(), 1);
   assert_eq!(results[0].action, Some(DiscoveryAction::Add));

   let mut codes: Vec<_> = records(store.as_ref())
      .into_iter()
      .filter_map(|r| r.target_code)
      .collect();
   codes.sort();
   assert_eq!(codes, vec!["brand", "color", "material"]);
}

#[test]
fn attribute_records_follow_the_entity_state_machine() {
   let store = Arc::new(JsonStore::in_memory());
   let provider = StaticProvider::new("product");
   provider.set(KEY, vec![attribute(2, "color", true), attribute(4, "brand", true)]);
   let orchestrator = orchestrator(store.clone(), provider.clone());
   orchestrator.execute(DiscoveryRequest::default()).for_each(drop);
   sync_all(store.as_ref());

   provider.set(KEY, vec![attribute(2, "color", true)]);
   let results: Vec<_> = orchestrator.execute(DiscoveryRequest::default()).collect();
   assert_eq!(results.len(), 1);
   assert_eq!(results[0].action, Some(DiscoveryAction::Delete));

   let brand = record_for(store.as_ref(), 4);
   assert_eq!(brand.next_action, Action::Delete);
   assert_eq!(brand.target_code.as_deref(), Some("brand"));
   assert_eq!(record_for(store.as_ref(), 2).next_action, Action::NoAction);
}

#[test]
fn attribute_save_failures_name_attributes() {
   let store = FlakyRecordStore::new([4]);
   let provider = StaticProvider::new("product");
   provider.set(KEY, vec![attribute(2, "color", true), attribute(4, "brand", true)]);
   let orchestrator = orchestrator(store.clone(), provider);

   let results: Vec<_> = orchestrator.execute(DiscoveryRequest::default()).collect();
   assert!(!results[0].success);
   assert_eq!(results[0].messages, vec![
      "Indexing attributes (4) failed to save. See log for details.".to_string()
   ]);
}
