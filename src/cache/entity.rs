//! Entities and their attribute bags.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::dates::{DateCodec, DateKind, DateValue};
use crate::error::{CacheError, Result};

use super::joins::PendingJoin;
use super::notifier::Notifier;
use super::refresh::{RefreshSlot, WriteClock};
use super::stub::{parse_stub, Stub, StubRegistry};
use super::traits::{AttrKind, Model};
use super::lock;

pub type Attrs = BTreeMap<String, AttrValue>;

/// Payload keys that describe identity rather than attributes.
const RESERVED: &[&str] = &["id", "type", "href", "selfLink", "isSnapshot"];

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
  Empty,
  Value(Value),
  Date(DateValue),
  Stub(Stub),
  Stubs(Vec<Stub>),
}

impl AttrValue {
  pub fn as_value(&self) -> Option<&Value> {
    match self {
      AttrValue::Value(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    self.as_value().and_then(Value::as_str)
  }

  pub fn as_date(&self) -> Option<&DateValue> {
    match self {
      AttrValue::Date(d) => Some(d),
      _ => None,
    }
  }

  pub fn as_stub(&self) -> Option<&Stub> {
    match self {
      AttrValue::Stub(s) => Some(s),
      _ => None,
    }
  }

  /// The stubs held by a list attribute; empty for anything else.
  pub fn as_stubs(&self) -> &[Stub] {
    match self {
      AttrValue::Stubs(list) => list,
      _ => &[],
    }
  }

  /// Copy of this value with references to `(type_name, id)` removed, or `None`
  /// when it holds no such reference.
  fn without_stub(&self, type_name: &str, id: u64) -> Option<AttrValue> {
    match self {
      AttrValue::Stub(s) if s.refers_to(type_name, id) => Some(AttrValue::Empty),
      AttrValue::Stubs(list) if list.iter().any(|s| s.refers_to(type_name, id)) => {
        Some(AttrValue::Stubs(
          list
            .iter()
            .filter(|s| !s.refers_to(type_name, id))
            .cloned()
            .collect(),
        ))
      }
      _ => None,
    }
  }

  fn to_wire(&self, codec: &DateCodec) -> Value {
    match self {
      AttrValue::Empty => Value::Null,
      AttrValue::Value(v) => v.clone(),
      AttrValue::Date(d) => Value::String(codec.encode(d)),
      AttrValue::Stub(s) => s.to_json(),
      AttrValue::Stubs(list) => Value::Array(list.iter().map(Stub::to_json).collect()),
    }
  }
}

/// Identity of an entity inside its type's map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
  Persisted(u64),
  /// Not yet persisted, or the payload's id was unusable.
  Provisional(Uuid),
}

impl Key {
  pub(crate) fn provisional() -> Self {
    Key::Provisional(Uuid::new_v4())
  }

  pub fn id(&self) -> Option<u64> {
    match self {
      Key::Persisted(id) => Some(*id),
      Key::Provisional(_) => None,
    }
  }
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Key::Persisted(id) => write!(f, "{id}"),
      Key::Provisional(uuid) => write!(f, "new:{uuid}"),
    }
  }
}

/// Where a freshly built entity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
  /// Server payload: its attributes are the clean state.
  Server,
  /// Built by application code, nothing persisted yet.
  Local,
  /// Built from a stub alone; attributes not loaded.
  Placeholder,
  /// Read-only historical projection, never inserted in the identity map.
  Snapshot,
}

pub(crate) struct EntityState {
  pub key: Key,
  pub href: Option<String>,
  pub attrs: Attrs,
  /// Server state as of the last save or refresh.
  pub clean: Option<Attrs>,
  pub pending_joins: Vec<PendingJoin>,
  pub etag: Option<String>,
  pub last_modified: Option<String>,
  pub loaded: bool,
  pub destroyed: bool,
}

pub(crate) struct EntityInner {
  model: Arc<dyn Model>,
  snapshot: bool,
  state: Mutex<EntityState>,
  deferred: Mutex<Vec<BoxFuture<'static, Result<()>>>>,
  pub(crate) notifier: Notifier,
  pub(crate) refresh: RefreshSlot,
  pub(crate) writes: WriteClock,
}

/// Shared handle to a cached entity.
///
/// Cloning the handle does not copy the entity; [`Entity::ptr_eq`] tells whether
/// two handles are the same canonical instance.
#[derive(Clone)]
pub struct Entity(Arc<EntityInner>);

impl Entity {
  pub(crate) fn new(
    model: Arc<dyn Model>,
    key: Key,
    href: Option<String>,
    attrs: Attrs,
    origin: Origin,
  ) -> Self {
    let clean = matches!(origin, Origin::Server | Origin::Snapshot).then(|| attrs.clone());
    Entity(Arc::new(EntityInner {
      model,
      snapshot: origin == Origin::Snapshot,
      state: Mutex::new(EntityState {
        key,
        href,
        attrs,
        clean,
        pending_joins: Vec::new(),
        etag: None,
        last_modified: None,
        loaded: origin != Origin::Placeholder,
        destroyed: false,
      }),
      deferred: Mutex::new(Vec::new()),
      notifier: Notifier::new(),
      refresh: RefreshSlot::default(),
      writes: WriteClock::default(),
    }))
  }

  pub(crate) fn inner(&self) -> &EntityInner {
    &self.0
  }

  pub(crate) fn state(&self) -> MutexGuard<'_, EntityState> {
    lock(&self.0.state)
  }

  pub fn model(&self) -> &Arc<dyn Model> {
    &self.0.model
  }

  pub fn type_name(&self) -> &str {
    self.0.model.name()
  }

  pub fn key(&self) -> Key {
    self.state().key
  }

  pub fn id(&self) -> Option<u64> {
    self.key().id()
  }

  /// True until the server has assigned an id.
  pub fn is_new(&self) -> bool {
    matches!(self.key(), Key::Provisional(_))
  }

  /// False for placeholders built from a stub that were never fetched.
  pub fn is_loaded(&self) -> bool {
    self.state().loaded
  }

  pub fn is_destroyed(&self) -> bool {
    self.state().destroyed
  }

  pub fn is_snapshot(&self) -> bool {
    self.0.snapshot
  }

  pub fn href(&self) -> Option<String> {
    self.state().href.clone()
  }

  pub fn etag(&self) -> Option<String> {
    self.state().etag.clone()
  }

  pub fn ptr_eq(&self, other: &Entity) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }

  /// Human-readable `Type#id` label for logs and errors.
  pub fn label(&self) -> String {
    format!("{}#{}", self.type_name(), self.key())
  }

  pub fn get(&self, name: &str) -> Option<AttrValue> {
    self.state().attrs.get(name).cloned()
  }

  pub fn attrs(&self) -> Attrs {
    self.state().attrs.clone()
  }

  /// Local edit. Persisted by the next save. Snapshots are read-only.
  pub fn set(&self, name: impl Into<String>, value: AttrValue) -> Result<()> {
    if self.0.snapshot {
      return Err(CacheError::ReadOnly(self.label()));
    }
    self.state().attrs.insert(name.into(), value);
    Ok(())
  }

  /// Whether local attributes differ from the last known server state.
  pub fn is_dirty(&self) -> bool {
    let state = self.state();
    match &state.clean {
      Some(clean) => *clean != state.attrs,
      None => matches!(state.key, Key::Provisional(_)) && !self.0.snapshot,
    }
  }

  /// Attributes that differ from the last known server state.
  pub fn dirty_attrs(&self) -> Attrs {
    let state = self.state();
    match &state.clean {
      Some(clean) => state
        .attrs
        .iter()
        .filter(|(name, value)| clean.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect(),
      None => state.attrs.clone(),
    }
  }

  /// Register async work that the next save must wait for before writing.
  pub fn defer_save(&self, work: BoxFuture<'static, Result<()>>) {
    lock(&self.0.deferred).push(work);
  }

  pub(crate) fn take_deferred(&self) -> Vec<BoxFuture<'static, Result<()>>> {
    std::mem::take(&mut *lock(&self.0.deferred))
  }

  pub(crate) fn validators(&self) -> (Option<String>, Option<String>) {
    let state = self.state();
    (state.etag.clone(), state.last_modified.clone())
  }

  pub(crate) fn set_validators(&self, etag: Option<String>, last_modified: Option<String>) {
    let mut state = self.state();
    if etag.is_some() {
      state.etag = etag;
    }
    if last_modified.is_some() {
      state.last_modified = last_modified;
    }
  }

  /// Merge decoded attributes in place, replacing only values that changed.
  ///
  /// Server merges also update the clean state so that pending local edits to
  /// other attributes stay dirty. Returns the names of changed attributes.
  pub(crate) fn merge(&self, incoming: Attrs, href: Option<String>, from_server: bool) -> Vec<String> {
    let mut state = self.state();
    let mut changed = Vec::new();

    if href.is_some() {
      state.href = href;
    }
    if from_server {
      state.loaded = true;
    }

    for (name, value) in incoming {
      if from_server {
        state
          .clean
          .get_or_insert_with(Attrs::new)
          .insert(name.clone(), value.clone());
      }
      if state.attrs.get(&name) != Some(&value) {
        state.attrs.insert(name.clone(), value);
        changed.push(name);
      }
    }
    changed
  }

  /// Record the current attributes as the clean server state.
  pub(crate) fn backup(&self) {
    let mut state = self.state();
    state.clean = Some(state.attrs.clone());
  }

  pub(crate) fn set_key(&self, key: Key) {
    self.state().key = key;
  }

  pub(crate) fn mark_destroyed(&self) {
    let mut state = self.state();
    state.destroyed = true;
    state.pending_joins.clear();
  }

  /// Remove references to `(type_name, id)` from live and clean attributes.
  /// Returns the live attributes touched.
  pub(crate) fn strip_stub(&self, type_name: &str, id: u64) -> Vec<String> {
    let mut state = self.state();
    let mut cleared = Vec::new();

    for (name, value) in state.attrs.iter_mut() {
      if let Some(replacement) = value.without_stub(type_name, id) {
        *value = replacement;
        cleared.push(name.clone());
      }
    }
    if let Some(clean) = state.clean.as_mut() {
      for value in clean.values_mut() {
        if let Some(replacement) = value.without_stub(type_name, id) {
          *value = replacement;
        }
      }
    }

    cleared
  }

  /// Drop pending joins that target `target`.
  pub(crate) fn drop_joins_to(&self, target: &Entity) {
    self
      .state()
      .pending_joins
      .retain(|pj| !pj.what.ptr_eq(target));
  }

  /// Wire payload of the current attributes.
  pub fn to_payload(&self, codec: &DateCodec) -> Map<String, Value> {
    let state = self.state();
    let mut payload: Map<String, Value> = state
      .attrs
      .iter()
      .map(|(name, value)| (name.clone(), value.to_wire(codec)))
      .collect();
    if let Key::Persisted(id) = state.key {
      payload.insert("id".into(), Value::from(id));
    }
    payload.insert("type".into(), Value::from(self.type_name()));
    payload
  }
}

impl fmt::Debug for Entity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Entity")
      .field("type", &self.type_name())
      .field("key", &self.key())
      .finish_non_exhaustive()
  }
}

/// Parsed state of a payload's `id` field.
pub(crate) enum IdField {
  Missing,
  Valid(u64),
  Malformed,
}

pub(crate) fn parse_id(raw: Option<&Value>) -> IdField {
  match raw {
    None | Some(Value::Null) => IdField::Missing,
    Some(Value::Number(n)) => n.as_u64().map_or(IdField::Malformed, IdField::Valid),
    Some(Value::String(s)) => s.trim().parse().map_or(IdField::Malformed, IdField::Valid),
    Some(_) => IdField::Malformed,
  }
}

pub(crate) fn payload_href(payload: &Map<String, Value>) -> Option<String> {
  payload
    .get("selfLink")
    .or_else(|| payload.get("href"))
    .and_then(Value::as_str)
    .map(String::from)
}

pub(crate) fn is_snapshot(payload: &Map<String, Value>) -> bool {
  payload.get("isSnapshot").and_then(Value::as_bool) == Some(true)
}

/// Decode payload attributes according to the model's declarations.
pub(crate) fn decode_attrs(
  model: &dyn Model,
  payload: &Map<String, Value>,
  stubs: &StubRegistry,
  codec: &DateCodec,
) -> Attrs {
  payload
    .iter()
    .filter(|(name, _)| !RESERVED.contains(&name.as_str()))
    .map(|(name, raw)| {
      let kind = model.attr_kind(name);
      (name.clone(), decode_attr(model.name(), name, &kind, raw, stubs, codec))
    })
    .collect()
}

fn decode_attr(
  type_name: &str,
  name: &str,
  kind: &AttrKind,
  raw: &Value,
  stubs: &StubRegistry,
  codec: &DateCodec,
) -> AttrValue {
  if raw.is_null() {
    return match kind {
      AttrKind::Stubs(_) => AttrValue::Stubs(Vec::new()),
      _ => AttrValue::Empty,
    };
  }

  let intern = |raw: &Value, target: &Option<String>| {
    parse_stub(raw, target.as_deref())
      .map(|(t, id, href)| stubs.get_or_create(&t, id, href.as_deref()))
  };

  match kind {
    AttrKind::Value => AttrValue::Value(raw.clone()),
    AttrKind::Stub(target) => match intern(raw, target) {
      Some(stub) => AttrValue::Stub(stub),
      None => {
        warn!(%type_name, attr = %name, "attribute is not a resolvable reference");
        AttrValue::Value(raw.clone())
      }
    },
    AttrKind::Stubs(target) => match raw.as_array() {
      Some(items) => AttrValue::Stubs(items.iter().filter_map(|item| intern(item, target)).collect()),
      None => {
        warn!(%type_name, attr = %name, "attribute is not a reference list");
        AttrValue::Value(raw.clone())
      }
    },
    AttrKind::Date => codec
      .decode(raw, DateKind::Date)
      .map_or(AttrValue::Empty, AttrValue::Date),
    AttrKind::DateTime => codec
      .decode(raw, DateKind::DateTime)
      .map_or(AttrValue::Empty, AttrValue::Date),
  }
}
