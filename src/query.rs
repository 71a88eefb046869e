//! Structured queries executed in batches.
//!
//! A [`Filter`] is compiled into the server's expression tree and sent as part of
//! a single `POST /query`. Every returned record goes through the identity map, so
//! query results share entities with the rest of the cache.
//!
//! # Example
//!
//! ```ignore
//! let mut batch = cache.batch();
//! let owned = batch.push("Control", Filter::new().relevant_to("Person", 9))?;
//! let drafts = batch.push("Control", Filter::new().include(Expression::eq("status", "Draft")))?;
//! let results = batch.execute().await?;
//! ```

use std::collections::HashMap;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::api::api_types::{reserialize, OrderBy, QueryDescriptor, QueryFilters, QueryPage};
use crate::api::client::ApiRequest;
use crate::cache::{Cache, Entity};
use crate::error::{CacheError, Result};

/// Comparison operators understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
  Eq,
  NotEq,
  Contains,
  NotContains,
  Lt,
  Gt,
}

impl Op {
  pub fn as_str(&self) -> &'static str {
    match self {
      Op::Eq => "=",
      Op::NotEq => "!=",
      Op::Contains => "~",
      Op::NotContains => "!~",
      Op::Lt => "<",
      Op::Gt => ">",
    }
  }

  pub fn parse(raw: &str) -> Option<Op> {
    Some(match raw {
      "=" => Op::Eq,
      "!=" => Op::NotEq,
      "~" => Op::Contains,
      "!~" => Op::NotContains,
      "<" => Op::Lt,
      ">" => Op::Gt,
      _ => return None,
    })
  }
}

/// Server-side filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
  Field { name: String, op: Op, value: Value },
  Relevant { object_name: String, ids: Vec<u64> },
  And(Box<Expression>, Box<Expression>),
  Or(Box<Expression>, Box<Expression>),
  Not(Box<Expression>),
}

impl Expression {
  pub fn field(name: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
    Expression::Field {
      name: name.into(),
      op,
      value: value.into(),
    }
  }

  pub fn eq(name: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::field(name, Op::Eq, value)
  }

  pub fn relevant(object_name: impl Into<String>, ids: Vec<u64>) -> Self {
    Expression::Relevant {
      object_name: object_name.into(),
      ids,
    }
  }

  pub fn and(self, other: Expression) -> Self {
    Expression::And(Box::new(self), Box::new(other))
  }

  pub fn or(self, other: Expression) -> Self {
    Expression::Or(Box::new(self), Box::new(other))
  }

  pub fn negate(self) -> Self {
    Expression::Not(Box::new(self))
  }

  /// Wire form of the expression.
  pub fn to_json(&self) -> Value {
    match self {
      Expression::Field { name, op, value } => json!({
        "left": name,
        "op": { "name": op.as_str() },
        "right": value,
      }),
      Expression::Relevant { object_name, ids } => json!({
        "object_name": object_name,
        "op": { "name": "relevant" },
        "ids": ids,
      }),
      Expression::And(left, right) => json!({
        "left": left.to_json(),
        "op": { "name": "AND" },
        "right": right.to_json(),
      }),
      Expression::Or(left, right) => json!({
        "left": left.to_json(),
        "op": { "name": "OR" },
        "right": right.to_json(),
      }),
      Expression::Not(inner) => json!({
        "op": { "name": "NOT" },
        "right": inner.to_json(),
      }),
    }
  }
}

/// What to fetch for one object type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
  relevant: Vec<(String, Vec<u64>)>,
  include: Option<Expression>,
  exclude: Option<Expression>,
  order_by: Vec<OrderBy>,
  limit: Option<[u64; 2]>,
}

impl Filter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Restrict to objects related to `type_name#id`.
  pub fn relevant_to(self, type_name: impl Into<String>, id: u64) -> Self {
    self.relevant_to_any(type_name, vec![id])
  }

  pub fn relevant_to_any(mut self, type_name: impl Into<String>, ids: Vec<u64>) -> Self {
    self.relevant.push((type_name.into(), ids));
    self
  }

  /// Require `expr`; repeated calls are combined with AND.
  pub fn include(mut self, expr: Expression) -> Self {
    self.include = Some(match self.include.take() {
      Some(existing) => existing.and(expr),
      None => expr,
    });
    self
  }

  /// Reject objects matching `expr`; repeated calls are combined with OR.
  pub fn exclude(mut self, expr: Expression) -> Self {
    self.exclude = Some(match self.exclude.take() {
      Some(existing) => existing.or(expr),
      None => expr,
    });
    self
  }

  pub fn order_by(mut self, name: impl Into<String>, desc: bool) -> Self {
    self.order_by.push(OrderBy {
      name: name.into(),
      desc,
    });
    self
  }

  /// Row range `[first, last)`.
  pub fn limit(mut self, first: u64, last: u64) -> Self {
    self.limit = Some([first, last]);
    self
  }

  /// AND of every relevance clause, the include expression and the negated
  /// exclude expression. `None` when the filter is empty.
  pub fn expression(&self) -> Option<Expression> {
    self
      .relevant
      .iter()
      .map(|(type_name, ids)| Expression::relevant(type_name.clone(), ids.clone()))
      .chain(self.include.clone())
      .chain(self.exclude.clone().map(Expression::negate))
      .reduce(Expression::and)
  }

  fn descriptor(&self, object_name: &str) -> QueryDescriptor {
    QueryDescriptor {
      object_name: object_name.to_string(),
      filters: QueryFilters {
        expression: self
          .expression()
          .map_or_else(|| json!({}), |expr| expr.to_json()),
      },
      order_by: self.order_by.clone(),
      limit: self.limit,
      kind: "values".to_string(),
    }
  }
}

/// Entities matched by one query, with the server's total count.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
  pub values: Vec<Entity>,
  pub total: u64,
}

/// Queries collected for a single round trip.
pub struct QueryBatch {
  cache: Cache,
  descriptors: Vec<QueryDescriptor>,
}

impl QueryBatch {
  /// Add a query and return its index in the result list.
  ///
  /// Unknown types are rejected here, before anything is sent.
  pub fn push(&mut self, type_name: &str, filter: Filter) -> Result<usize> {
    let model = self.cache.model(type_name)?;
    self.descriptors.push(filter.descriptor(model.name()));
    Ok(self.descriptors.len() - 1)
  }

  pub fn len(&self) -> usize {
    self.descriptors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.descriptors.is_empty()
  }

  /// Send every query in one request. Results are in push order.
  pub async fn execute(self) -> Result<Vec<QueryResult>> {
    if self.descriptors.is_empty() {
      return Ok(Vec::new());
    }

    // Identical descriptors are sent once and fanned out.
    let mut unique: Vec<&QueryDescriptor> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut slots = Vec::with_capacity(self.descriptors.len());
    for descriptor in &self.descriptors {
      let key = descriptor_key(descriptor)?;
      let slot = *seen.entry(key).or_insert_with(|| {
        unique.push(descriptor);
        unique.len() - 1
      });
      slots.push(slot);
    }
    debug!(
      queries = self.descriptors.len(),
      sent = unique.len(),
      "executing query batch"
    );

    let body = serde_json::to_value(&unique)?;
    let response = self.cache.send(ApiRequest::post("/query", body)).await?;
    let Value::Array(pages) = response.body else {
      return Err(CacheError::Decode("query response is not an array".into()));
    };
    if pages.len() != unique.len() {
      return Err(CacheError::Decode(format!(
        "query response has {} entries for {} queries",
        pages.len(),
        unique.len()
      )));
    }

    let mut results = Vec::with_capacity(unique.len());
    for (descriptor, entry) in unique.iter().zip(&pages) {
      let object_name = &descriptor.object_name;
      let page: QueryPage = match entry.get(object_name) {
        Some(page) => reserialize(page)?,
        None => {
          return Err(CacheError::Decode(format!(
            "query response entry is missing `{object_name}`"
          )))
        }
      };
      let values = page
        .values
        .iter()
        .map(|record| self.cache.construct(object_name, record))
        .collect::<Result<Vec<_>>>()?;
      results.push(QueryResult {
        values,
        total: page.total,
      });
    }

    Ok(slots.into_iter().map(|slot| results[slot].clone()).collect())
  }
}

fn descriptor_key(descriptor: &QueryDescriptor) -> Result<String> {
  let bytes = serde_json::to_vec(descriptor)?;
  Ok(hex::encode(Sha256::digest(&bytes)))
}

impl Cache {
  /// Start collecting queries for one round trip.
  pub fn batch(&self) -> QueryBatch {
    QueryBatch {
      cache: self.clone(),
      descriptors: Vec::new(),
    }
  }

  /// Run a single query.
  pub async fn query(&self, type_name: &str, filter: Filter) -> Result<QueryResult> {
    let mut batch = self.batch();
    batch.push(type_name, filter)?;
    Ok(batch.execute().await?.pop().unwrap_or_default())
  }
}
