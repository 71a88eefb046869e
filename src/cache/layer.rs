//! Network-facing operations: save, destroy, refresh fetches and lookups.
//!
//! Writes for one entity run through its notifier queue, so they happen strictly
//! in submission order and never overlap. Responses that arrive after their
//! entity left the identity map are dropped rather than applied.

use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::api::api_types::{
  background_task_id, expand_path, unwrap_collection, unwrap_single, wrap_single,
  BackgroundTask,
};
use crate::api::client::{ApiRequest, ApiResponse};
use crate::error::{CacheError, Result};

use super::entity::{parse_id, IdField};
use super::{Cache, CacheEvent, Entity};

impl Cache {
  /// Send a request and turn non-2xx statuses into errors.
  pub(crate) async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
    let method = request.method;
    let path = request.path.clone();
    let response = self.transport().send(request).await?;
    debug!(?method, %path, status = response.status, "api response");

    if (200..300).contains(&response.status) {
      Ok(response)
    } else {
      Err(CacheError::Http {
        status: response.status,
        message: error_message(&response.body),
      })
    }
  }

  /// Persist `entity`.
  ///
  /// The write is queued immediately; the returned future resolves once this
  /// write, its hooks and any pending relationship changes have completed.
  pub fn save(&self, entity: &Entity) -> BoxFuture<'static, Result<Entity>> {
    let ticket = entity.inner().notifier.enqueue();
    let cache = self.clone();
    let entity = entity.clone();
    async move {
      let _turn = ticket.turn().await;
      cache.perform_save(&entity).await
    }
    .boxed()
  }

  /// Destroy `entity` on the server and evict it locally.
  pub fn destroy(&self, entity: &Entity) -> BoxFuture<'static, Result<()>> {
    let ticket = entity.inner().notifier.enqueue();
    let cache = self.clone();
    let entity = entity.clone();
    async move {
      let _turn = ticket.turn().await;
      cache.perform_destroy(&entity).await
    }
    .boxed()
  }

  /// Number of saves or destroys queued or running for `entity`.
  pub fn pending_writes(&self, entity: &Entity) -> usize {
    entity.inner().notifier.pending()
  }

  /// Fetch one entity by id.
  pub async fn find_one(&self, type_name: &str, id: u64) -> Result<Entity> {
    let model = self.types().resolve(type_name)?;
    let response = self
      .send(ApiRequest::get(expand_path(&model.item_path(), id)))
      .await?;
    let payload = unwrap_single(model.singular(), response.body)?;
    let entity = self.construct(type_name, &Value::Object(payload))?;
    entity.set_validators(response.etag, response.last_modified);
    Ok(entity)
  }

  /// Fetch a collection, optionally filtered by query parameters.
  pub async fn find_all(&self, type_name: &str, params: &[(&str, &str)]) -> Result<Vec<Entity>> {
    let model = self.types().resolve(type_name)?;
    let mut request = ApiRequest::get(model.collection_path());
    for (name, value) in params {
      request = request.with_query(*name, *value);
    }
    let response = self.send(request).await?;
    unwrap_collection(model.plural(), response.body)?
      .iter()
      .map(|record| self.construct(type_name, record))
      .collect()
  }

  async fn perform_save(&self, entity: &Entity) -> Result<Entity> {
    if entity.is_snapshot() {
      return Err(CacheError::ReadOnly(entity.label()));
    }
    if entity.is_destroyed() {
      return Err(CacheError::Evicted(entity.label()));
    }

    let model = entity.model().clone();
    let creating = entity.is_new();

    if creating {
      model.before_create(self, entity).await?;
    } else {
      model.before_update(self, entity).await?;
    }
    model.before_save(self, entity).await?;

    // All deferred work settles before the first failure is reported.
    let deferred = join_all(entity.take_deferred()).await;
    deferred.into_iter().collect::<Result<Vec<()>>>()?;

    let body = wrap_single(model.singular(), entity.to_payload(self.codec()));
    let request = if creating {
      ApiRequest::post(model.collection_path(), body)
    } else {
      let id = entity.id().ok_or_else(|| CacheError::MissingId {
        type_name: entity.type_name().to_string(),
      })?;
      let (etag, last_modified) = entity.validators();
      ApiRequest::put(expand_path(&model.item_path(), id), body).with_validators(etag, last_modified)
    };

    let sent = {
      let _write = entity.inner().writes.begin();
      self.send(request).await
    };
    let response = match sent {
      Ok(response) => response,
      Err(CacheError::Http { status: 409, .. }) => return Err(self.recover_conflict(entity).await),
      Err(err) => {
        warn!(entity = %entity.label(), error = %err, "save failed");
        return Err(err);
      }
    };

    if !self.identity().contains(entity) {
      warn!(entity = %entity.label(), "dropping save response for evicted entity");
      return Err(CacheError::Evicted(entity.label()));
    }

    let payload = unwrap_single(model.singular(), response.body)?;
    if creating {
      let IdField::Valid(id) = parse_id(payload.get("id")) else {
        return Err(CacheError::MissingId {
          type_name: entity.type_name().to_string(),
        });
      };
      if let Some(displaced) = self.identity().rekey(entity, id) {
        warn!(entity = %entity.label(), "created entity displaced a cached duplicate");
        displaced.mark_destroyed();
      }
      self.emit(CacheEvent::Created {
        type_name: entity.type_name().to_string(),
        key: entity.key(),
      });
    }

    self.absorb(entity, &payload);
    entity.set_validators(response.etag, response.last_modified);
    entity.backup();
    info!(entity = %entity.label(), created = creating, "saved");

    if creating {
      model.after_create(self, entity).await?;
    } else {
      model.after_update(self, entity).await?;
    }
    model.after_save(self, entity).await?;

    self.resolve_joins(entity).await?;
    Ok(entity.clone())
  }

  /// Refresh after a 409 and hand the unsent edits back to the caller.
  async fn recover_conflict(&self, entity: &Entity) -> CacheError {
    let unsent = entity.dirty_attrs();
    warn!(entity = %entity.label(), unsent = unsent.len(), "write conflict, refreshing");
    if let Err(err) = self.refresh(entity).await {
      warn!(entity = %entity.label(), error = %err, "refresh after conflict failed");
    }
    CacheError::StaleWrite {
      label: entity.label(),
      unsent,
    }
  }

  async fn perform_destroy(&self, entity: &Entity) -> Result<()> {
    if entity.is_snapshot() {
      return Err(CacheError::ReadOnly(entity.label()));
    }
    if entity.is_destroyed() {
      return Ok(());
    }

    if let Some(id) = entity.id() {
      let (etag, last_modified) = entity.validators();
      let request = ApiRequest::delete(expand_path(&entity.model().item_path(), id))
        .with_validators(etag, last_modified);
      let sent = {
        let _write = entity.inner().writes.begin();
        self.send(request).await
      };
      match sent {
        Ok(response) => {
          if let Some(task) = background_task_id(&response.body) {
            self.await_background_task(task).await?;
          }
        }
        Err(CacheError::Http { status: 404, .. }) => {
          debug!(entity = %entity.label(), "already gone on server");
        }
        Err(err) => return Err(err),
      }
    }

    self.evict(entity);
    info!(entity = %entity.label(), "destroyed");
    Ok(())
  }

  /// Drop `entity` from the cache and cascade the invalidation to its holders.
  pub(crate) fn evict(&self, entity: &Entity) {
    self.identity().evict(entity);
    entity.mark_destroyed();
    if let Some(id) = entity.id() {
      self.invalidate_stub(entity, id);
      self.emit(CacheEvent::Destroyed {
        type_name: entity.type_name().to_string(),
        id,
      });
    }
  }

  async fn await_background_task(&self, id: u64) -> Result<()> {
    let path = format!("/api/background_tasks/{id}");
    let poll = self.options().background_poll();

    for _ in 0..self.options().background_max_polls {
      let response = self.send(ApiRequest::get(path.clone())).await?;
      let task: BackgroundTask =
        serde_json::from_value(Value::Object(unwrap_single("background_task", response.body)?))?;
      match task.status.as_str() {
        "Success" => return Ok(()),
        "Failure" => {
          return Err(CacheError::BackgroundTask {
            id,
            status: task.status,
          })
        }
        status => debug!(task = id, %status, "waiting on background task"),
      }
      tokio::time::sleep(poll).await;
    }

    Err(CacheError::BackgroundTask {
      id,
      status: "timed out".to_string(),
    })
  }

  /// GET the entity and merge the result. Used by the refresh coalescer.
  ///
  /// A response that may predate a write started since the request went out is
  /// discarded, and the entity is returned as it stands.
  pub(crate) async fn fetch_latest(&self, entity: &Entity) -> Result<Entity> {
    if entity.is_snapshot() {
      return Err(CacheError::ReadOnly(entity.label()));
    }
    let id = entity.id().ok_or_else(|| CacheError::MissingId {
      type_name: entity.type_name().to_string(),
    })?;
    let model = entity.model().clone();
    let generation = entity.inner().writes.settled();

    let response = self
      .send(ApiRequest::get(expand_path(&model.item_path(), id)))
      .await?;

    if !self.identity().contains(entity) {
      warn!(entity = %entity.label(), "dropping refresh response for evicted entity");
      return Err(CacheError::Evicted(entity.label()));
    }
    if generation.is_none() || entity.inner().writes.settled() != generation {
      debug!(entity = %entity.label(), "discarding refresh response that overlapped a write");
      return Ok(entity.clone());
    }

    let payload = unwrap_single(model.singular(), response.body)?;
    self.absorb(entity, &payload);
    entity.set_validators(response.etag, response.last_modified);
    entity.backup();
    Ok(entity.clone())
  }
}

fn error_message(body: &Value) -> String {
  match body {
    Value::String(s) => s.clone(),
    Value::Object(map) => message_field(map).unwrap_or_else(|| body.to_string()),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

fn message_field(map: &Map<String, Value>) -> Option<String> {
  ["message", "error", "detail"]
    .iter()
    .find_map(|key| map.get(*key).and_then(Value::as_str))
    .map(String::from)
}
