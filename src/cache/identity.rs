//! Identity map: one canonical entity per `(type, id)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CacheError, Result};

use super::entity::{decode_attrs, is_snapshot, parse_id, payload_href, IdField, Origin};
use super::{lock, Attrs, Cache, CacheEvent, Entity, Key, Model};

#[derive(Default)]
struct TypeMap {
  persisted: HashMap<u64, Entity>,
  provisional: HashMap<Uuid, Entity>,
}

/// Per-type maps from key to canonical entity.
///
/// Type maps are created lazily on first insert and never torn down; entries are
/// evicted one by one when their entity is destroyed.
#[derive(Default)]
pub struct IdentityMap {
  types: Mutex<HashMap<String, TypeMap>>,
}

impl IdentityMap {
  pub fn get(&self, type_name: &str, id: u64) -> Option<Entity> {
    lock(&self.types)
      .get(type_name)
      .and_then(|map| map.persisted.get(&id))
      .cloned()
  }

  /// Return the entity for `(type_name, id)`, inserting `make()` if absent.
  /// The flag is true when the entity was inserted by this call.
  pub(crate) fn get_or_insert_with(
    &self,
    type_name: &str,
    id: u64,
    make: impl FnOnce() -> Entity,
  ) -> (Entity, bool) {
    let mut types = lock(&self.types);
    let map = types.entry(type_name.to_string()).or_default();
    if let Some(existing) = map.persisted.get(&id) {
      return (existing.clone(), false);
    }
    let entity = make();
    map.persisted.insert(id, entity.clone());
    (entity, true)
  }

  pub(crate) fn insert(&self, entity: &Entity) {
    let key = entity.key();
    let mut types = lock(&self.types);
    let map = types.entry(entity.type_name().to_string()).or_default();
    match key {
      Key::Persisted(id) => map.persisted.insert(id, entity.clone()),
      Key::Provisional(uuid) => map.provisional.insert(uuid, entity.clone()),
    };
  }

  /// Move a provisional entity to canonical keying under `id`.
  ///
  /// The entity handle is unchanged. If a different entity already held `id`
  /// it is displaced and returned.
  pub(crate) fn rekey(&self, entity: &Entity, id: u64) -> Option<Entity> {
    let mut types = lock(&self.types);
    let map = types.entry(entity.type_name().to_string()).or_default();

    if let Key::Provisional(uuid) = entity.key() {
      if map
        .provisional
        .get(&uuid)
        .is_some_and(|held| held.ptr_eq(entity))
      {
        map.provisional.remove(&uuid);
      }
    }
    entity.set_key(Key::Persisted(id));

    map
      .persisted
      .insert(id, entity.clone())
      .filter(|previous| !previous.ptr_eq(entity))
  }

  /// Whether this exact entity is the resident one for its key.
  pub fn contains(&self, entity: &Entity) -> bool {
    let key = entity.key();
    let types = lock(&self.types);
    let Some(map) = types.get(entity.type_name()) else {
      return false;
    };
    let held = match key {
      Key::Persisted(id) => map.persisted.get(&id),
      Key::Provisional(uuid) => map.provisional.get(&uuid),
    };
    held.is_some_and(|held| held.ptr_eq(entity))
  }

  /// Remove `entity` if it is the resident one for its key.
  pub(crate) fn evict(&self, entity: &Entity) -> bool {
    if !self.contains(entity) {
      return false;
    }
    let key = entity.key();
    let mut types = lock(&self.types);
    let Some(map) = types.get_mut(entity.type_name()) else {
      return false;
    };
    match key {
      Key::Persisted(id) => map.persisted.remove(&id).is_some(),
      Key::Provisional(uuid) => map.provisional.remove(&uuid).is_some(),
    }
  }

  /// Every resident entity, persisted and provisional.
  pub fn resident(&self) -> Vec<Entity> {
    lock(&self.types)
      .values()
      .flat_map(|map| map.persisted.values().chain(map.provisional.values()))
      .cloned()
      .collect()
  }

  pub fn len(&self) -> usize {
    lock(&self.types)
      .values()
      .map(|map| map.persisted.len() + map.provisional.len())
      .sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Cache {
  /// Build or merge an entity from a raw payload.
  ///
  /// A payload whose id matches a resident entity is merged into it in place and
  /// that entity is returned. Snapshot payloads never touch live entities: they
  /// produce a detached read-only entity. Payloads without a usable id produce a
  /// new entity under a provisional key.
  pub fn construct(&self, type_name: &str, payload: &Value) -> Result<Entity> {
    let model = self.types().resolve(type_name)?;
    let obj = payload
      .as_object()
      .ok_or_else(|| CacheError::Decode(format!("{type_name} payload is not an object")))?;
    let attrs = decode_attrs(model.as_ref(), obj, self.stubs(), self.codec());
    let href = payload_href(obj);
    let id = parse_id(obj.get("id"));

    if is_snapshot(obj) {
      let key = match id {
        IdField::Valid(id) => Key::Persisted(id),
        _ => Key::provisional(),
      };
      return Ok(Entity::new(model, key, href, attrs, Origin::Snapshot));
    }

    let id = match id {
      IdField::Valid(id) => id,
      IdField::Missing => return Ok(self.insert_provisional(model, href, attrs)),
      IdField::Malformed => {
        warn!(%type_name, raw = ?obj.get("id"), "payload id is malformed, keeping entity provisional");
        return Ok(self.insert_provisional(model, href, attrs));
      }
    };

    let mut fresh = Some((attrs, href));
    let (entity, created) = self.identity().get_or_insert_with(model.name(), id, || {
      let (attrs, href) = fresh.take().unwrap_or_default();
      Entity::new(model.clone(), Key::Persisted(id), href, attrs, Origin::Server)
    });

    if created {
      self.emit(CacheEvent::Created {
        type_name: model.name().to_string(),
        key: Key::Persisted(id),
      });
    } else if let Some((attrs, href)) = fresh {
      let changed = entity.merge(attrs, href, true);
      if !changed.is_empty() {
        debug!(entity = %entity.label(), ?changed, "merged payload into resident entity");
        self.emit(CacheEvent::Updated {
          type_name: model.name().to_string(),
          key: Key::Persisted(id),
          changed,
        });
      }
    }

    Ok(entity)
  }

  /// Decode raw attributes and merge them into `entity` as local edits.
  pub fn assign(&self, entity: &Entity, payload: &Map<String, Value>) -> Result<Vec<String>> {
    if entity.is_snapshot() {
      return Err(CacheError::ReadOnly(entity.label()));
    }
    let attrs = decode_attrs(entity.model().as_ref(), payload, self.stubs(), self.codec());
    let changed = entity.merge(attrs, None, false);
    if !changed.is_empty() {
      self.emit(CacheEvent::Updated {
        type_name: entity.type_name().to_string(),
        key: entity.key(),
        changed: changed.clone(),
      });
    }
    Ok(changed)
  }

  /// Merge a server payload into a specific entity (save and refresh responses).
  pub(crate) fn absorb(&self, entity: &Entity, payload: &Map<String, Value>) {
    let attrs = decode_attrs(entity.model().as_ref(), payload, self.stubs(), self.codec());
    let changed = entity.merge(attrs, payload_href(payload), true);
    if !changed.is_empty() {
      self.emit(CacheEvent::Updated {
        type_name: entity.type_name().to_string(),
        key: entity.key(),
        changed,
      });
    }
  }

  fn insert_provisional(
    &self,
    model: Arc<dyn Model>,
    href: Option<String>,
    attrs: Attrs,
  ) -> Entity {
    let key = Key::provisional();
    let entity = Entity::new(model, key, href, attrs, Origin::Local);
    self.identity().insert(&entity);
    self.emit(CacheEvent::Created {
      type_name: entity.type_name().to_string(),
      key,
    });
    entity
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::AttrValue;
  use crate::test_harness::harness;
  use serde_json::json;

  #[tokio::test]
  async fn test_same_id_constructs_same_instance() {
    let (cache, _api) = harness();
    let first = cache
      .construct("Control", &json!({ "id": 5, "title": "Access" }))
      .unwrap();
    let second = cache
      .construct("Control", &json!({ "id": "5", "status": "Draft" }))
      .unwrap();

    assert!(first.ptr_eq(&second));
    assert_eq!(first.get("title").unwrap().as_str(), Some("Access"));
    assert_eq!(first.get("status").unwrap().as_str(), Some("Draft"));
    assert_eq!(cache.identity().len(), 1);
  }

  #[tokio::test]
  async fn test_merge_preserves_local_edits_as_dirty() {
    let (cache, _api) = harness();
    let control = cache
      .construct("Control", &json!({ "id": 5, "title": "Access", "status": "Draft" }))
      .unwrap();
    assert!(!control.is_dirty());

    control.set("title", AttrValue::Value(json!("Edited"))).unwrap();
    cache
      .construct("Control", &json!({ "id": 5, "status": "Final" }))
      .unwrap();

    assert_eq!(control.get("status").unwrap().as_str(), Some("Final"));
    let dirty = control.dirty_attrs();
    assert_eq!(dirty.keys().collect::<Vec<_>>(), vec!["title"]);
  }

  #[tokio::test]
  async fn test_merge_emits_changed_attributes() {
    let (cache, _api) = harness();
    cache
      .construct("Control", &json!({ "id": 5, "title": "Access" }))
      .unwrap();
    let mut events = cache.subscribe();

    cache
      .construct("Control", &json!({ "id": 5, "title": "Access", "status": "Draft" }))
      .unwrap();

    match events.try_recv().unwrap() {
      CacheEvent::Updated { changed, .. } => assert_eq!(changed, vec!["status".to_string()]),
      other => panic!("unexpected event {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_snapshot_never_touches_live_entity() {
    let (cache, _api) = harness();
    let live = cache
      .construct("Control", &json!({ "id": 5, "title": "Current" }))
      .unwrap();
    let snapshot = cache
      .construct(
        "Control",
        &json!({ "id": 5, "title": "Historical", "isSnapshot": true }),
      )
      .unwrap();

    assert!(!snapshot.ptr_eq(&live));
    assert!(snapshot.is_snapshot());
    assert_eq!(live.get("title").unwrap().as_str(), Some("Current"));
    assert_eq!(snapshot.get("title").unwrap().as_str(), Some("Historical"));
    assert!(cache.get("Control", 5).unwrap().ptr_eq(&live));
  }

  #[tokio::test]
  async fn test_missing_and_malformed_ids_are_provisional() {
    let (cache, _api) = harness();
    let fresh = cache.construct("Control", &json!({ "title": "New" })).unwrap();
    let odd = cache
      .construct("Control", &json!({ "id": "abc", "title": "Odd" }))
      .unwrap();

    assert!(fresh.is_new());
    assert!(odd.is_new());
    assert!(fresh.is_dirty());
    assert!(cache.identity().contains(&fresh));
    assert!(cache.identity().contains(&odd));
    assert!(!fresh.ptr_eq(&odd));
  }

  #[tokio::test]
  async fn test_rekey_keeps_handle() {
    let (cache, _api) = harness();
    let fresh = cache.construct("Control", &json!({ "title": "New" })).unwrap();

    assert!(cache.identity().rekey(&fresh, 77).is_none());

    assert_eq!(fresh.id(), Some(77));
    assert!(cache.get("Control", 77).unwrap().ptr_eq(&fresh));
    assert_eq!(cache.identity().len(), 1);
    let again = cache.construct("Control", &json!({ "id": 77 })).unwrap();
    assert!(again.ptr_eq(&fresh));
  }

  #[tokio::test]
  async fn test_unknown_type_is_rejected() {
    let (cache, _api) = harness();
    assert!(matches!(
      cache.construct("Nope", &json!({ "id": 1 })),
      Err(CacheError::UnknownType(_))
    ));
  }

  #[tokio::test]
  async fn test_assign_decodes_dates_and_stubs() {
    let (cache, _api) = harness();
    let control = cache.construct("Control", &json!({ "id": 5 })).unwrap();
    let payload = json!({
      "start_date": "03/08/2020",
      "owner": { "type": "Person", "id": 9 },
    });

    let mut changed = cache
      .assign(&control, payload.as_object().unwrap())
      .unwrap();
    changed.sort();

    assert_eq!(changed, vec!["owner".to_string(), "start_date".to_string()]);
    assert!(control.get("start_date").unwrap().as_date().is_some());
    assert!(control.get("owner").unwrap().as_stub().unwrap().refers_to("Person", 9));
    assert!(control.is_dirty());
  }
}
