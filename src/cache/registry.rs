//! Registry of model types and a declarative model implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{CacheError, Result};

use super::lock;
use super::traits::{AttrSpec, JoinSpec, Model};

/// Name-to-model lookup.
///
/// Type names are resolved at runtime from payloads and stubs, so an unknown name
/// is reported as [`CacheError::UnknownType`] rather than silently ignored.
#[derive(Default)]
pub struct TypeRegistry {
  models: Mutex<HashMap<String, Arc<dyn Model>>>,
}

impl TypeRegistry {
  pub fn register(&self, model: Arc<dyn Model>) {
    lock(&self.models).insert(model.name().to_string(), model);
  }

  pub fn resolve(&self, type_name: &str) -> Result<Arc<dyn Model>> {
    lock(&self.models)
      .get(type_name)
      .cloned()
      .ok_or_else(|| CacheError::UnknownType(type_name.to_string()))
  }

  pub fn contains(&self, type_name: &str) -> bool {
    lock(&self.models).contains_key(type_name)
  }

  /// Registered type names, sorted.
  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = lock(&self.models).keys().cloned().collect();
    names.sort();
    names
  }
}

/// A model described entirely by data, with no lifecycle hooks.
#[derive(Debug, Clone)]
pub struct ResourceModel {
  name: String,
  singular: String,
  plural: String,
  collection_path: Option<String>,
  item_path: Option<String>,
  attributes: Vec<AttrSpec>,
  joins: BTreeMap<String, JoinSpec>,
}

impl ResourceModel {
  pub fn new(
    name: impl Into<String>,
    singular: impl Into<String>,
    plural: impl Into<String>,
  ) -> Self {
    Self {
      name: name.into(),
      singular: singular.into(),
      plural: plural.into(),
      collection_path: None,
      item_path: None,
      attributes: Vec::new(),
      joins: BTreeMap::new(),
    }
  }

  pub fn with_paths(mut self, collection: impl Into<String>, item: impl Into<String>) -> Self {
    self.collection_path = Some(collection.into());
    self.item_path = Some(item.into());
    self
  }

  pub fn with_attr(mut self, spec: AttrSpec) -> Self {
    self.attributes.push(spec);
    self
  }

  pub fn with_join(mut self, relation: impl Into<String>, spec: JoinSpec) -> Self {
    self.joins.insert(relation.into(), spec);
    self
  }
}

impl Model for ResourceModel {
  fn name(&self) -> &str {
    &self.name
  }

  fn singular(&self) -> &str {
    &self.singular
  }

  fn plural(&self) -> &str {
    &self.plural
  }

  fn collection_path(&self) -> String {
    self
      .collection_path
      .clone()
      .unwrap_or_else(|| format!("/api/{}", self.plural))
  }

  fn item_path(&self) -> String {
    self
      .item_path
      .clone()
      .unwrap_or_else(|| format!("/api/{}/{{id}}", self.plural))
  }

  fn attributes(&self) -> &[AttrSpec] {
    &self.attributes
  }

  fn join(&self, relation: &str) -> Option<&JoinSpec> {
    self.joins.get(relation)
  }
}
