//! Coalesced, throttled refreshes.
//!
//! Concurrent refreshes of one entity share a single request. A new request
//! window never opens sooner than the configured interval after the previous one
//! opened; callers arriving while a delayed window waits simply join it.
//!
//! A window only serves callers while no write against the entity has started
//! since it opened. Later callers get a fresh window that runs once the old one
//! has finished, and the old window's response is discarded.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::error::Result;

use super::{lock, Cache, Entity};

type SharedRefresh = Shared<BoxFuture<'static, Result<Entity>>>;

/// Counts network writes against one entity.
///
/// The generation moves when a write starts and again when it ends, so a
/// refresh can tell whether its response may predate one.
#[derive(Default)]
pub(crate) struct WriteClock {
  generation: AtomicU64,
  active: AtomicUsize,
}

impl WriteClock {
  /// Current generation, or `None` while a write is in flight.
  pub fn settled(&self) -> Option<u64> {
    if self.active.load(Ordering::SeqCst) > 0 {
      return None;
    }
    Some(self.generation.load(Ordering::SeqCst))
  }

  /// Mark a write as started until the guard is dropped.
  pub fn begin(&self) -> WriteGuard<'_> {
    self.active.fetch_add(1, Ordering::SeqCst);
    self.generation.fetch_add(1, Ordering::SeqCst);
    WriteGuard(self)
  }
}

pub(crate) struct WriteGuard<'a>(&'a WriteClock);

impl Drop for WriteGuard<'_> {
  fn drop(&mut self) {
    self.0.generation.fetch_add(1, Ordering::SeqCst);
    self.0.active.fetch_sub(1, Ordering::SeqCst);
  }
}

struct Window {
  id: u64,
  /// Write generation when the window opened; `None` if a write was running.
  generation: Option<u64>,
  future: SharedRefresh,
}

#[derive(Default)]
struct SlotState {
  inflight: Option<Window>,
  last_window: Option<Instant>,
  next_id: u64,
}

/// Per-entity refresh bookkeeping.
#[derive(Default)]
pub(crate) struct RefreshSlot {
  state: Mutex<SlotState>,
}

impl RefreshSlot {
  pub fn is_inflight(&self) -> bool {
    lock(&self.state).inflight.is_some()
  }

  fn finish(&self, id: u64) {
    let mut slot = lock(&self.state);
    if slot.inflight.as_ref().is_some_and(|window| window.id == id) {
      slot.inflight = None;
    }
  }
}

impl Cache {
  /// Re-read `entity` from the server.
  ///
  /// Every caller inside one window receives the same result. On success the
  /// entity's attributes are merged and recorded as the clean state.
  pub fn refresh(&self, entity: &Entity) -> BoxFuture<'static, Result<Entity>> {
    let interval = self.options().refresh_throttle();
    let generation = entity.inner().writes.settled();
    let shared = {
      let mut slot = lock(&entity.inner().refresh.state);
      let joinable = slot
        .inflight
        .as_ref()
        .filter(|window| generation.is_some() && window.generation == generation)
        .map(|window| window.future.clone());
      match joinable {
        Some(future) => {
          debug!(entity = %entity.label(), "joining in-flight refresh");
          future
        }
        None => {
          let previous = slot.inflight.as_ref().map(|window| window.future.clone());
          let now = Instant::now();
          let opens_at = match slot.last_window {
            Some(last) if last + interval > now => last + interval,
            _ => now,
          };
          slot.last_window = Some(opens_at);
          let id = slot.next_id;
          slot.next_id += 1;

          let cache = self.clone();
          let target = entity.clone();
          let future = async move {
            if let Some(previous) = previous {
              debug!(entity = %target.label(), "waiting for outdated refresh");
              let _ = previous.await;
            }
            if opens_at > Instant::now() {
              debug!(entity = %target.label(), "refresh throttled");
              sleep_until(opens_at).await;
            }
            let result = cache.fetch_latest(&target).await;
            target.inner().refresh.finish(id);
            result
          }
          .boxed()
          .shared();

          slot.inflight = Some(Window {
            id,
            generation,
            future: future.clone(),
          });
          future
        }
      }
    };
    shared.boxed()
  }
}
