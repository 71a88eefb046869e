//! Deduplicated lightweight references to entities.
//!
//! A [`Stub`] names an entity by `(type, id)` without holding it. Stubs are
//! interned per [`Cache`], so two stubs for the same pair are the same allocation.
//! When an entity is destroyed its stub is forgotten and every resident entity is
//! walked to drop the reference from whatever attribute held it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::debug;

use crate::api::api_types::expand_path;
use crate::error::{CacheError, Result};

use super::entity::{parse_id, IdField, Origin};
use super::{lock, Cache, CacheEvent, Entity, Key};

struct StubInner {
  type_name: String,
  id: u64,
  href: Option<String>,
}

/// Immutable `{type, id, href}` placeholder for an entity.
#[derive(Clone)]
pub struct Stub(Arc<StubInner>);

impl Stub {
  pub fn type_name(&self) -> &str {
    &self.0.type_name
  }

  pub fn id(&self) -> u64 {
    self.0.id
  }

  pub fn href(&self) -> Option<&str> {
    self.0.href.as_deref()
  }

  /// Whether both handles are the same interned stub.
  pub fn ptr_eq(&self, other: &Stub) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }

  pub fn refers_to(&self, type_name: &str, id: u64) -> bool {
    self.0.id == id && self.0.type_name == type_name
  }

  /// Wire form of the reference.
  pub fn to_json(&self) -> Value {
    match &self.0.href {
      Some(href) => json!({ "type": self.0.type_name, "id": self.0.id, "href": href }),
      None => json!({ "type": self.0.type_name, "id": self.0.id }),
    }
  }
}

impl PartialEq for Stub {
  fn eq(&self, other: &Self) -> bool {
    self.ptr_eq(other) || other.refers_to(&self.0.type_name, self.0.id)
  }
}

impl fmt::Debug for Stub {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Stub({}#{})", self.0.type_name, self.0.id)
  }
}

/// Interning table for stubs, keyed by `(type, id)`.
#[derive(Default)]
pub struct StubRegistry {
  stubs: Mutex<HashMap<(String, u64), Stub>>,
}

impl StubRegistry {
  /// Return the stub for `(type_name, id)`, creating it on first use. The href
  /// of the first creation sticks.
  pub fn get_or_create(&self, type_name: &str, id: u64, href: Option<&str>) -> Stub {
    let mut stubs = lock(&self.stubs);
    stubs
      .entry((type_name.to_string(), id))
      .or_insert_with(|| {
        Stub(Arc::new(StubInner {
          type_name: type_name.to_string(),
          id,
          href: href.map(String::from),
        }))
      })
      .clone()
  }

  pub fn get(&self, type_name: &str, id: u64) -> Option<Stub> {
    lock(&self.stubs).get(&(type_name.to_string(), id)).cloned()
  }

  pub(crate) fn forget(&self, type_name: &str, id: u64) -> Option<Stub> {
    lock(&self.stubs).remove(&(type_name.to_string(), id))
  }

  pub fn len(&self) -> usize {
    lock(&self.stubs).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Pull `(type, id, href)` out of a wire reference.
pub(crate) fn parse_stub(
  raw: &Value,
  fallback_type: Option<&str>,
) -> Option<(String, u64, Option<String>)> {
  let obj = raw.as_object()?;
  let IdField::Valid(id) = parse_id(obj.get("id")) else {
    return None;
  };
  let type_name = obj
    .get("type")
    .and_then(Value::as_str)
    .or(fallback_type)?
    .to_string();
  let href = obj
    .get("href")
    .or_else(|| obj.get("selfLink"))
    .and_then(Value::as_str)
    .map(String::from);
  Some((type_name, id, href))
}

impl Cache {
  /// The interned stub for a persisted entity.
  pub fn stub(&self, entity: &Entity) -> Result<Stub> {
    let id = entity.id().ok_or_else(|| CacheError::MissingId {
      type_name: entity.type_name().to_string(),
    })?;
    let href = entity
      .href()
      .unwrap_or_else(|| expand_path(&entity.model().item_path(), id));
    Ok(self.stubs().get_or_create(entity.type_name(), id, Some(&href)))
  }

  /// Resolve a stub to its entity.
  ///
  /// Returns the resident entity when there is one. Otherwise an unloaded
  /// placeholder keyed by the stub's id is inserted and returned; callers that
  /// need its data must refresh it. Unregistered types fail immediately.
  pub fn reify(&self, stub: &Stub) -> Result<Entity> {
    let model = self.types().resolve(stub.type_name())?;
    let (entity, created) = self.identity().get_or_insert_with(model.name(), stub.id(), || {
      Entity::new(
        model.clone(),
        Key::Persisted(stub.id()),
        stub.href().map(String::from),
        Default::default(),
        Origin::Placeholder,
      )
    });
    if created {
      debug!(stub = ?stub, "reified stub into placeholder");
      self.emit(CacheEvent::Created {
        type_name: stub.type_name().to_string(),
        key: Key::Persisted(stub.id()),
      });
    }
    Ok(entity)
  }

  /// Forget the stub for a destroyed entity and strip it from every resident
  /// entity that holds it. Returns the number of attributes touched.
  pub(crate) fn invalidate_stub(&self, destroyed: &Entity, id: u64) -> usize {
    let type_name = destroyed.type_name();
    let forgotten = self.stubs().forget(type_name, id);
    let mut touched = 0;

    for holder in self.identity().resident() {
      holder.drop_joins_to(destroyed);
      let cleared = holder.strip_stub(type_name, id);
      if cleared.is_empty() {
        continue;
      }
      touched += cleared.len();

      let stub = match &forgotten {
        Some(stub) => stub.clone(),
        None => Stub(Arc::new(StubInner {
          type_name: type_name.to_string(),
          id,
          href: None,
        })),
      };
      for attr in cleared {
        self.emit(CacheEvent::StubDestroyed {
          holder_type: holder.type_name().to_string(),
          holder_key: holder.key(),
          attr,
          stub: stub.clone(),
        });
      }
    }

    debug!(%type_name, id, touched, "invalidated stub");
    touched
  }
}
