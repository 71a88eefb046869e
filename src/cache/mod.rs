//! Client-side entity cache.
//!
//! This module owns the in-memory object graph:
//! - One canonical [`Entity`] per `(type, id)` via the [`IdentityMap`]
//! - Interned [`Stub`] references with cascade invalidation on destroy
//! - Serialized saves per entity and deferred relationship resolution
//! - Coalesced, throttled refreshes
//!
//! Everything hangs off a [`Cache`] context, which is cheap to clone and is
//! passed explicitly wherever it is needed.

mod entity;
mod identity;
mod joins;
mod layer;
mod notifier;
mod refresh;
mod registry;
mod stub;
mod traits;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::broadcast;

use crate::api::client::Transport;
use crate::dates::DateCodec;
use crate::error::Result;

pub use entity::{AttrValue, Attrs, Entity, Key};
pub use identity::IdentityMap;
pub use joins::{JoinAction, PendingJoin};
pub use registry::{ResourceModel, TypeRegistry};
pub use stub::{Stub, StubRegistry};
pub use traits::{AttrKind, AttrSpec, JoinSpec, Model};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tunables for cache behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
  /// Minimum spacing between refresh windows of one entity.
  pub refresh_throttle_ms: u64,
  /// Delay between background task polls.
  pub background_poll_ms: u64,
  /// Polls before a background task is reported as timed out.
  pub background_max_polls: u32,
  /// Buffer size of the change event channel.
  pub event_capacity: usize,
  /// Fixed UTC offset for date decoding. The host zone is used when unset.
  pub utc_offset_minutes: Option<i32>,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      refresh_throttle_ms: 1000,
      background_poll_ms: 500,
      background_max_polls: 120,
      event_capacity: 256,
      utc_offset_minutes: None,
    }
  }
}

impl CacheOptions {
  pub fn refresh_throttle(&self) -> Duration {
    Duration::from_millis(self.refresh_throttle_ms)
  }

  pub fn background_poll(&self) -> Duration {
    Duration::from_millis(self.background_poll_ms)
  }
}

/// Change notifications published by the cache.
#[derive(Debug, Clone)]
pub enum CacheEvent {
  Created {
    type_name: String,
    key: Key,
  },
  Updated {
    type_name: String,
    key: Key,
    changed: Vec<String>,
  },
  Destroyed {
    type_name: String,
    id: u64,
  },
  /// A destroyed entity's stub was removed from `attr` of a holder.
  StubDestroyed {
    holder_type: String,
    holder_key: Key,
    attr: String,
    stub: Stub,
  },
}

struct CacheInner {
  types: TypeRegistry,
  identity: IdentityMap,
  stubs: StubRegistry,
  transport: Arc<dyn Transport>,
  codec: DateCodec,
  options: CacheOptions,
  events: broadcast::Sender<CacheEvent>,
}

/// Shared cache context.
#[derive(Clone)]
pub struct Cache {
  inner: Arc<CacheInner>,
}

impl Cache {
  pub fn new(transport: Arc<dyn Transport>, options: CacheOptions) -> Self {
    let (events, _) = broadcast::channel(options.event_capacity.max(1));
    let codec = DateCodec::from_offset_minutes(options.utc_offset_minutes);
    Self {
      inner: Arc::new(CacheInner {
        types: TypeRegistry::default(),
        identity: IdentityMap::default(),
        stubs: StubRegistry::default(),
        transport,
        codec,
        options,
        events,
      }),
    }
  }

  /// Register a model type. A later registration under the same name wins.
  pub fn register_type(&self, model: Arc<dyn Model>) {
    self.inner.types.register(model);
  }

  pub fn types(&self) -> &TypeRegistry {
    &self.inner.types
  }

  pub fn identity(&self) -> &IdentityMap {
    &self.inner.identity
  }

  pub fn stubs(&self) -> &StubRegistry {
    &self.inner.stubs
  }

  pub fn codec(&self) -> &DateCodec {
    &self.inner.codec
  }

  pub fn options(&self) -> &CacheOptions {
    &self.inner.options
  }

  /// Subscribe to change events from this point on.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.events.subscribe()
  }

  /// The resident entity for `(type_name, id)`, if any.
  pub fn get(&self, type_name: &str, id: u64) -> Option<Entity> {
    self.inner.identity.get(type_name, id)
  }

  /// Look up a registered model.
  pub fn model(&self, type_name: &str) -> Result<Arc<dyn Model>> {
    self.inner.types.resolve(type_name)
  }

  pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
    &self.inner.transport
  }

  pub(crate) fn emit(&self, event: CacheEvent) {
    // No subscribers is fine.
    let _ = self.inner.events.send(event);
  }
}
