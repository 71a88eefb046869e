//! Core traits and descriptors for cached model types.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

use super::{Cache, Entity};

/// How a payload attribute is decoded into an [`AttrValue`](super::AttrValue).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttrKind {
  /// Plain JSON, kept as-is (embedded sub-objects included).
  #[default]
  Value,
  /// A single `{type, id, href}` reference. The optional target names the type
  /// to assume when the payload omits `type`.
  Stub(Option<String>),
  /// A list of references.
  Stubs(Option<String>),
  Date,
  DateTime,
}

/// Attribute declaration for a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrSpec {
  pub name: String,
  pub kind: AttrKind,
}

impl AttrSpec {
  pub fn new(name: impl Into<String>, kind: AttrKind) -> Self {
    Self {
      name: name.into(),
      kind,
    }
  }
}

/// Describes the join model backing a many-to-many relation.
///
/// A join object of type `join_type` carries a stub of the owning entity under
/// `owner_attr` and a stub of the related entity under `target_attr`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinSpec {
  pub join_type: String,
  pub owner_attr: String,
  pub target_attr: String,
}

/// A concrete model type known to the cache.
///
/// Implementors supply naming and endpoint metadata plus optional lifecycle hooks.
/// Hooks run inside the entity's save queue, so a hook never overlaps another save
/// of the same entity.
#[async_trait]
pub trait Model: Send + Sync + 'static {
  /// Type name used in payloads and stubs (e.g. "Control").
  fn name(&self) -> &str;

  /// Root key of a single-resource envelope (e.g. "control").
  fn singular(&self) -> &str;

  /// Resource collection name (e.g. "controls").
  fn plural(&self) -> &str;

  /// Collection endpoint, used for listing and creation.
  fn collection_path(&self) -> String {
    format!("/api/{}", self.plural())
  }

  /// Item endpoint template; `{id}` is substituted from the entity.
  fn item_path(&self) -> String {
    format!("/api/{}/{{id}}", self.plural())
  }

  fn attributes(&self) -> &[AttrSpec] {
    &[]
  }

  fn attr_kind(&self, name: &str) -> AttrKind {
    self
      .attributes()
      .iter()
      .find(|spec| spec.name == name)
      .map(|spec| spec.kind.clone())
      .unwrap_or_default()
  }

  /// Join model for a named relation, if this model has one.
  fn join(&self, _relation: &str) -> Option<&JoinSpec> {
    None
  }

  async fn before_create(&self, _cache: &Cache, _entity: &Entity) -> Result<()> {
    Ok(())
  }

  async fn before_update(&self, _cache: &Cache, _entity: &Entity) -> Result<()> {
    Ok(())
  }

  async fn before_save(&self, _cache: &Cache, _entity: &Entity) -> Result<()> {
    Ok(())
  }

  async fn after_create(&self, _cache: &Cache, _entity: &Entity) -> Result<()> {
    Ok(())
  }

  async fn after_update(&self, _cache: &Cache, _entity: &Entity) -> Result<()> {
    Ok(())
  }

  async fn after_save(&self, _cache: &Cache, _entity: &Entity) -> Result<()> {
    Ok(())
  }
}
