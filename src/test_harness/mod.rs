//! In-memory API server and model fixtures for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::api::client::{ApiRequest, ApiResponse, Method, Transport};
use crate::cache::{
  AttrKind, AttrSpec, Cache, CacheOptions, JoinSpec, Model, ResourceModel,
};
use crate::error::Result;

/// `(plural, type name, singular)` for every resource the fake serves.
const RESOURCES: &[(&str, &str, &str)] = &[
  ("controls", "Control", "control"),
  ("people", "Person", "person"),
  ("object_people", "ObjectPerson", "object_person"),
];

fn resource_by_plural(plural: &str) -> Option<(&'static str, &'static str, &'static str)> {
  RESOURCES.iter().copied().find(|(p, _, _)| *p == plural)
}

fn resource_by_type(type_name: &str) -> Option<(&'static str, &'static str, &'static str)> {
  RESOURCES.iter().copied().find(|(_, t, _)| *t == type_name)
}

#[derive(Default)]
struct Store {
  records: BTreeMap<String, BTreeMap<u64, Map<String, Value>>>,
  versions: HashMap<(String, u64), u64>,
  /// Remaining "Pending" polls per background task.
  tasks: HashMap<u64, u32>,
}

impl Store {
  fn table(&self, plural: &str) -> Option<&BTreeMap<u64, Map<String, Value>>> {
    self.records.get(plural)
  }

  fn bump(&mut self, plural: &str, id: u64) -> String {
    let version = self.versions.entry((plural.to_string(), id)).or_insert(0);
    *version += 1;
    format!("\"{plural}-{id}-{version}\"")
  }

  /// Record as the server renders it, with identity fields and derived
  /// relationship lists.
  fn view(&self, plural: &str, id: u64) -> Option<Value> {
    let (_, type_name, _) = resource_by_plural(plural)?;
    let mut record = self.table(plural)?.get(&id)?.clone();
    record.insert("id".into(), json!(id));
    record.insert("type".into(), json!(type_name));
    record.insert("selfLink".into(), json!(format!("/api/{plural}/{id}")));

    if plural == "controls" {
      let people: Vec<Value> = self
        .table("object_people")
        .into_iter()
        .flat_map(|joins| joins.values())
        .filter(|join| holds_stub(join.get("personable"), "Control", id))
        .filter_map(|join| join.get("person").cloned())
        .collect();
      record.insert("people".into(), Value::Array(people));
    }
    Some(Value::Object(record))
  }

  fn views(&self, plural: &str) -> Vec<Value> {
    self
      .table(plural)
      .map(|table| table.keys().filter_map(|id| self.view(plural, *id)).collect())
      .unwrap_or_default()
  }
}

/// [`Transport`] backed by in-memory tables.
pub struct FakeApi {
  store: Mutex<Store>,
  log: Mutex<Vec<ApiRequest>>,
  failures: Mutex<Vec<(Method, String, u16)>>,
  latency: Mutex<Duration>,
  delays: Mutex<Vec<(Method, String, Duration)>>,
  deferred_deletes: Mutex<Option<u32>>,
  task_outcome: Mutex<String>,
  next_id: AtomicU64,
  next_task: AtomicU64,
}

impl FakeApi {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      store: Mutex::new(Store::default()),
      log: Mutex::new(Vec::new()),
      failures: Mutex::new(Vec::new()),
      latency: Mutex::new(Duration::ZERO),
      delays: Mutex::new(Vec::new()),
      deferred_deletes: Mutex::new(None),
      task_outcome: Mutex::new("Success".to_string()),
      next_id: AtomicU64::new(1000),
      next_task: AtomicU64::new(1),
    })
  }

  pub fn insert(&self, plural: &str, id: u64, record: Value) {
    let mut store = self.store.lock().unwrap();
    let fields = record.as_object().cloned().unwrap_or_default();
    store
      .records
      .entry(plural.to_string())
      .or_default()
      .insert(id, fields);
    store.bump(plural, id);
  }

  /// Change a record behind the cache's back.
  pub fn update_record(&self, plural: &str, id: u64, patch: Value) {
    let mut store = self.store.lock().unwrap();
    if let Some(record) = store.records.get_mut(plural).and_then(|t| t.get_mut(&id)) {
      if let Some(fields) = patch.as_object() {
        record.extend(fields.clone());
      }
    }
    store.bump(plural, id);
  }

  pub fn record(&self, plural: &str, id: u64) -> Option<Value> {
    self.store.lock().unwrap().view(plural, id)
  }

  pub fn records(&self, plural: &str) -> Vec<Value> {
    self.store.lock().unwrap().views(plural)
  }

  /// Make the next matching request answer with `status`.
  pub fn fail_next(&self, method: &str, path: &str, status: u16) {
    let method = parse_method(method);
    self
      .failures
      .lock()
      .unwrap()
      .push((method, path.to_string(), status));
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  /// Render the next matching response when the request arrives, but deliver
  /// it only after `delay`.
  pub fn delay_next(&self, method: &str, path: &str, delay: Duration) {
    let method = parse_method(method);
    self
      .delays
      .lock()
      .unwrap()
      .push((method, path.to_string(), delay));
  }

  /// Answer deletes with a background task that stays pending for `polls` polls.
  pub fn defer_deletes(&self, polls: u32) {
    *self.deferred_deletes.lock().unwrap() = Some(polls);
  }

  /// Status background tasks report once they stop pending.
  pub fn finish_tasks_with(&self, status: &str) {
    *self.task_outcome.lock().unwrap() = status.to_string();
  }

  pub fn requests(&self, method: &str) -> Vec<ApiRequest> {
    let method = parse_method(method);
    self
      .log
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.method == method)
      .cloned()
      .collect()
  }

  pub fn last(&self, method: &str) -> Option<ApiRequest> {
    self.requests(method).pop()
  }

  pub fn count(&self, method: &str, path: &str) -> usize {
    self
      .requests(method)
      .iter()
      .filter(|r| r.path == path)
      .count()
  }

  fn take_failure(&self, request: &ApiRequest) -> Option<u16> {
    let mut failures = self.failures.lock().unwrap();
    let index = failures
      .iter()
      .position(|(m, p, _)| *m == request.method && *p == request.path)?;
    Some(failures.remove(index).2)
  }

  fn take_delay(&self, request: &ApiRequest) -> Option<Duration> {
    let mut delays = self.delays.lock().unwrap();
    let index = delays
      .iter()
      .position(|(m, p, _)| *m == request.method && *p == request.path)?;
    Some(delays.remove(index).2)
  }

  fn handle(&self, request: &ApiRequest) -> ApiResponse {
    if request.method == Method::Post && request.path == "/query" {
      return self.handle_query(request.body.as_ref());
    }

    let segments: Vec<&str> = request
      .path
      .trim_start_matches("/api/")
      .split('/')
      .collect();
    match segments.as_slice() {
      ["background_tasks", id] => self.handle_task(id.parse().unwrap_or(0)),
      [plural] => self.handle_collection(request, plural),
      [plural, id] => match id.parse() {
        Ok(id) => self.handle_item(request, plural, id),
        Err(_) => status(404),
      },
      _ => status(404),
    }
  }

  fn handle_collection(&self, request: &ApiRequest, plural: &str) -> ApiResponse {
    let Some((_, _, singular)) = resource_by_plural(plural) else {
      return status(404);
    };
    match request.method {
      Method::Get => {
        let records = self.records(plural);
        let mut collection = Map::new();
        collection.insert(plural.to_string(), Value::Array(records));
        let mut body = Map::new();
        body.insert(format!("{plural}_collection"), Value::Object(collection));
        ApiResponse::ok(Value::Object(body))
      }
      Method::Post => {
        let Some(fields) = request
          .body
          .as_ref()
          .and_then(|b| b.get(singular))
          .and_then(Value::as_object)
        else {
          return status(400);
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut store = self.store.lock().unwrap();
        store
          .records
          .entry(plural.to_string())
          .or_default()
          .insert(id, stored_fields(fields));
        let etag = store.bump(plural, id);
        item_response(&store, plural, singular, id, 201, etag)
      }
      _ => status(405),
    }
  }

  fn handle_item(&self, request: &ApiRequest, plural: &str, id: u64) -> ApiResponse {
    let Some((_, _, singular)) = resource_by_plural(plural) else {
      return status(404);
    };
    let mut store = self.store.lock().unwrap();
    if store.table(plural).and_then(|t| t.get(&id)).is_none() {
      return status(404);
    }

    match request.method {
      Method::Get => {
        let etag = format!(
          "\"{plural}-{id}-{}\"",
          store.versions.get(&(plural.to_string(), id)).copied().unwrap_or(0)
        );
        item_response(&store, plural, singular, id, 200, etag)
      }
      Method::Put => {
        let fields = request
          .body
          .as_ref()
          .and_then(|b| b.get(singular))
          .and_then(Value::as_object)
          .map(stored_fields)
          .unwrap_or_default();
        if let Some(record) = store.records.get_mut(plural).and_then(|t| t.get_mut(&id)) {
          record.extend(fields);
        }
        let etag = store.bump(plural, id);
        item_response(&store, plural, singular, id, 200, etag)
      }
      Method::Delete => {
        if let Some(table) = store.records.get_mut(plural) {
          table.remove(&id);
        }
        if let Some((_, type_name, _)) = resource_by_plural(plural) {
          // Join objects pointing at a deleted record go with it.
          if let Some(joins) = store.records.get_mut("object_people") {
            joins.retain(|_, join| {
              !holds_stub(join.get("person"), type_name, id)
                && !holds_stub(join.get("personable"), type_name, id)
            });
          }
        }
        drop(store);

        match *self.deferred_deletes.lock().unwrap() {
          Some(polls) => {
            let task = self.next_task.fetch_add(1, Ordering::SeqCst);
            self.store.lock().unwrap().tasks.insert(task, polls);
            ApiResponse::ok(json!({ "background_task": { "id": task, "status": "Pending" } }))
          }
          None => ApiResponse::ok(Value::Null),
        }
      }
      Method::Post => status(405),
    }
  }

  fn handle_task(&self, id: u64) -> ApiResponse {
    let mut store = self.store.lock().unwrap();
    let Some(remaining) = store.tasks.get_mut(&id) else {
      return status(404);
    };
    let state = if *remaining == 0 {
      self.task_outcome.lock().unwrap().clone()
    } else {
      *remaining -= 1;
      "Pending".to_string()
    };
    ApiResponse::ok(json!({ "background_task": { "id": id, "status": state } }))
  }

  fn handle_query(&self, body: Option<&Value>) -> ApiResponse {
    let Some(descriptors) = body.and_then(Value::as_array) else {
      return status(400);
    };
    let store = self.store.lock().unwrap();
    let pages = descriptors
      .iter()
      .map(|descriptor| {
        let object_name = descriptor["object_name"].as_str().unwrap_or_default();
        let plural = resource_by_type(object_name).map_or("", |(p, _, _)| p);
        let expression = &descriptor["filters"]["expression"];

        let mut matched: Vec<Value> = store
          .views(plural)
          .into_iter()
          .filter(|record| evaluate(&store, record, expression))
          .collect();
        if let Some(order) = descriptor["order_by"].as_array().and_then(|o| o.first()) {
          let field = order["name"].as_str().unwrap_or_default();
          matched.sort_by_key(|record| text(&record[field]));
          if order["desc"].as_bool() == Some(true) {
            matched.reverse();
          }
        }
        let total = matched.len();
        if let Some([first, last]) = descriptor["limit"].as_array().map(|l| {
          let bound = |i: usize| l.get(i).and_then(Value::as_u64).unwrap_or(0);
          [bound(0), bound(1)]
        }) {
          matched = matched
            .into_iter()
            .skip(first as usize)
            .take(last.saturating_sub(first) as usize)
            .collect();
        }

        let mut entry = Map::new();
        entry.insert(
          object_name.to_string(),
          json!({ "values": matched, "total": total }),
        );
        Value::Object(entry)
      })
      .collect();
    ApiResponse::ok(Value::Array(pages))
  }
}

#[async_trait]
impl Transport for FakeApi {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
    self.log.lock().unwrap().push(request.clone());
    let latency = *self.latency.lock().unwrap();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
    if let Some(code) = self.take_failure(&request) {
      return Ok(ApiResponse {
        status: code,
        body: json!({ "message": "injected failure" }),
        etag: None,
        last_modified: None,
      });
    }
    let response = self.handle(&request);
    if let Some(delay) = self.take_delay(&request) {
      tokio::time::sleep(delay).await;
    }
    Ok(response)
  }
}

fn parse_method(method: &str) -> Method {
  match method {
    "POST" => Method::Post,
    "PUT" => Method::Put,
    "DELETE" => Method::Delete,
    _ => Method::Get,
  }
}

fn status(code: u16) -> ApiResponse {
  ApiResponse {
    status: code,
    body: json!({ "message": format!("status {code}") }),
    etag: None,
    last_modified: None,
  }
}

fn item_response(
  store: &Store,
  plural: &str,
  singular: &str,
  id: u64,
  code: u16,
  etag: String,
) -> ApiResponse {
  let mut body = Map::new();
  body.insert(
    singular.to_string(),
    store.view(plural, id).unwrap_or(Value::Null),
  );
  ApiResponse {
    status: code,
    body: Value::Object(body),
    etag: Some(etag),
    last_modified: None,
  }
}

/// Fields a write may set; identity and derived fields are the server's.
fn stored_fields(fields: &Map<String, Value>) -> Map<String, Value> {
  fields
    .iter()
    .filter(|(name, _)| !matches!(name.as_str(), "id" | "type" | "selfLink" | "href" | "people"))
    .map(|(name, value)| (name.clone(), value.clone()))
    .collect()
}

fn refers(value: &Value, type_name: &str, id: u64) -> bool {
  value["type"].as_str() == Some(type_name) && value["id"].as_u64() == Some(id)
}

fn holds_stub(value: Option<&Value>, type_name: &str, id: u64) -> bool {
  match value {
    Some(Value::Array(items)) => items.iter().any(|item| refers(item, type_name, id)),
    Some(value) => refers(value, type_name, id),
    None => false,
  }
}

fn text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

fn evaluate(store: &Store, record: &Value, expression: &Value) -> bool {
  let Some(op) = expression["op"]["name"].as_str() else {
    return true;
  };
  let left = &expression["left"];
  let right = &expression["right"];

  match op {
    "AND" => evaluate(store, record, left) && evaluate(store, record, right),
    "OR" => evaluate(store, record, left) || evaluate(store, record, right),
    "NOT" => !evaluate(store, record, right),
    "relevant" => {
      let object_name = expression["object_name"].as_str().unwrap_or_default();
      let ids: Vec<u64> = expression["ids"]
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default();
      let own_type = record["type"].as_str().unwrap_or_default();
      let own_id = record["id"].as_u64().unwrap_or(0);
      let other_plural = resource_by_type(object_name).map_or("", |(p, _, _)| p);

      ids.iter().any(|id| {
        let forward = record
          .as_object()
          .is_some_and(|fields| fields.values().any(|v| holds_stub(Some(v), object_name, *id)));
        let backward = store.view(other_plural, *id).is_some_and(|other| {
          other
            .as_object()
            .is_some_and(|fields| fields.values().any(|v| holds_stub(Some(v), own_type, own_id)))
        });
        forward || backward
      })
    }
    _ => {
      let field = left.as_str().unwrap_or_default();
      let value = text(&record[field]);
      let wanted = text(right);
      match op {
        "=" => value == wanted,
        "!=" => value != wanted,
        "~" => value.to_lowercase().contains(&wanted.to_lowercase()),
        "!~" => !value.to_lowercase().contains(&wanted.to_lowercase()),
        "<" => compare(&record[field], right).is_lt(),
        ">" => compare(&record[field], right).is_gt(),
        _ => false,
      }
    }
  }
}

fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
  match (a.as_f64(), b.as_f64()) {
    (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
    _ => text(a).cmp(&text(b)),
  }
}

pub fn control_model() -> ResourceModel {
  ResourceModel::new("Control", "control", "controls")
    .with_attr(AttrSpec::new("title", AttrKind::Value))
    .with_attr(AttrSpec::new("status", AttrKind::Value))
    .with_attr(AttrSpec::new("start_date", AttrKind::Date))
    .with_attr(AttrSpec::new("owner", AttrKind::Stub(Some("Person".into()))))
    .with_attr(AttrSpec::new("people", AttrKind::Stubs(Some("Person".into()))))
    .with_join(
      "people",
      JoinSpec {
        join_type: "ObjectPerson".into(),
        owner_attr: "personable".into(),
        target_attr: "person".into(),
      },
    )
}

pub fn person_model() -> ResourceModel {
  ResourceModel::new("Person", "person", "people")
    .with_attr(AttrSpec::new("name", AttrKind::Value))
}

pub fn object_person_model() -> ResourceModel {
  ResourceModel::new("ObjectPerson", "object_person", "object_people")
    .with_attr(AttrSpec::new("personable", AttrKind::Stub(None)))
    .with_attr(AttrSpec::new("person", AttrKind::Stub(Some("Person".into()))))
}

/// Cache over a fresh [`FakeApi`] with the fixture models registered.
pub fn harness() -> (Cache, Arc<FakeApi>) {
  harness_with(Vec::new())
}

/// Like [`harness`], registering `models` after the fixtures so they can
/// replace them.
pub fn harness_with(models: Vec<Arc<dyn Model>>) -> (Cache, Arc<FakeApi>) {
  harness_with_options(CacheOptions::default(), models)
}

pub fn harness_with_options(
  options: CacheOptions,
  models: Vec<Arc<dyn Model>>,
) -> (Cache, Arc<FakeApi>) {
  let api = FakeApi::new();
  let transport: Arc<dyn Transport> = api.clone();
  let cache = Cache::new(transport, options);
  cache.register_type(Arc::new(control_model()));
  cache.register_type(Arc::new(person_model()));
  cache.register_type(Arc::new(object_person_model()));
  for model in models {
    cache.register_type(model);
  }
  (cache, api)
}

pub fn seed_person(api: &FakeApi, id: u64, name: &str) {
  api.insert("people", id, json!({ "name": name }));
}

/// Seed a control linked to `people` through join objects.
pub fn seed_control(api: &FakeApi, id: u64, title: &str, people: &[u64]) {
  api.insert("controls", id, json!({ "title": title, "status": "Draft" }));
  for person in people {
    let join = api.next_id.fetch_add(1, Ordering::SeqCst);
    api.insert(
      "object_people",
      join,
      json!({
        "personable": { "type": "Control", "id": id },
        "person": { "type": "Person", "id": person },
      }),
    );
  }
}
