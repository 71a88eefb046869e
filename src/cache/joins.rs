//! Deferred many-to-many relationship changes.
//!
//! Relationship edits are recorded on the owning entity and applied after its
//! next successful save, by creating, updating or destroying join objects on the
//! server. Resolution is best-effort: one failing operation does not stop the
//! others, and failed operations are queued again so the next save retries them.

use std::collections::BTreeMap;
use std::fmt;

use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::query::Filter;

use super::traits::JoinSpec;
use super::{Cache, Entity, Stub};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAction {
  Add,
  Update,
  Remove,
}

impl fmt::Display for JoinAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      JoinAction::Add => "add",
      JoinAction::Update => "update",
      JoinAction::Remove => "remove",
    })
  }
}

/// One queued relationship change.
#[derive(Debug, Clone)]
pub struct PendingJoin {
  pub how: JoinAction,
  pub what: Entity,
  /// Relation name on the owner's model.
  pub through: String,
  /// Extra attributes for the join object.
  pub extra: Map<String, Value>,
}

impl PendingJoin {
  fn same_pair(&self, other: &PendingJoin) -> bool {
    self.through == other.through && self.what.ptr_eq(&other.what)
  }
}

impl Entity {
  pub fn mark_for_addition(
    &self,
    relation: &str,
    target: &Entity,
    extra: Map<String, Value>,
  ) -> Result<()> {
    self.mark(JoinAction::Add, relation, target, extra)
  }

  pub fn mark_for_update(
    &self,
    relation: &str,
    target: &Entity,
    extra: Map<String, Value>,
  ) -> Result<()> {
    self.mark(JoinAction::Update, relation, target, extra)
  }

  pub fn mark_for_removal(&self, relation: &str, target: &Entity) -> Result<()> {
    self.mark(JoinAction::Remove, relation, target, Map::new())
  }

  fn mark(
    &self,
    how: JoinAction,
    relation: &str,
    target: &Entity,
    extra: Map<String, Value>,
  ) -> Result<()> {
    if self.model().join(relation).is_none() {
      return Err(CacheError::UnknownRelation {
        type_name: self.type_name().to_string(),
        relation: relation.to_string(),
      });
    }
    if self.is_snapshot() {
      return Err(CacheError::ReadOnly(self.label()));
    }

    let entry = PendingJoin {
      how,
      what: target.clone(),
      through: relation.to_string(),
      extra,
    };
    let mut state = self.state();
    // The latest mark for a pair wins.
    state.pending_joins.retain(|pj| !pj.same_pair(&entry));
    state.pending_joins.push(entry);
    Ok(())
  }

  /// Queued relationship changes, oldest first.
  pub fn pending_joins(&self) -> Vec<PendingJoin> {
    self.state().pending_joins.clone()
  }

  /// The queued action for `(relation, target)`, if any.
  pub fn pending_join(&self, relation: &str, target: &Entity) -> Option<JoinAction> {
    self
      .state()
      .pending_joins
      .iter()
      .find(|pj| pj.through == relation && pj.what.ptr_eq(target))
      .map(|pj| pj.how)
  }

  pub(crate) fn take_pending_joins(&self) -> Vec<PendingJoin> {
    std::mem::take(&mut self.state().pending_joins)
  }

  /// Put failed changes back ahead of anything marked since, skipping pairs that
  /// were marked again in the meantime.
  pub(crate) fn requeue_joins(&self, failed: Vec<PendingJoin>) {
    let mut state = self.state();
    if state.destroyed {
      return;
    }
    let mut queue: Vec<PendingJoin> = failed
      .into_iter()
      .filter(|old| !state.pending_joins.iter().any(|newer| newer.same_pair(old)))
      .collect();
    queue.append(&mut state.pending_joins);
    state.pending_joins = queue;
  }
}

impl Cache {
  /// Apply every queued relationship change of `owner`, then refresh it once.
  ///
  /// Runs automatically at the end of a successful save.
  pub async fn resolve_joins(&self, owner: &Entity) -> Result<()> {
    let batch = owner.take_pending_joins();
    if batch.is_empty() {
      return Ok(());
    }

    let owner_stub = match self.stub(owner) {
      Ok(stub) => stub,
      Err(err) => {
        owner.requeue_joins(batch);
        return Err(err);
      }
    };

    let mut groups: BTreeMap<String, Vec<PendingJoin>> = BTreeMap::new();
    for pj in batch {
      groups.entry(pj.through.clone()).or_default().push(pj);
    }
    debug!(owner = %owner.label(), relations = groups.len(), "resolving pending joins");

    // Join writes change the owner's server state too.
    let outcomes = {
      let _write = owner.inner().writes.begin();
      join_all(
        groups
          .into_iter()
          .map(|(relation, joins)| self.resolve_relation(owner, &owner_stub, relation, joins)),
      )
      .await
    };

    let mut failed = Vec::new();
    let mut failures = Vec::new();
    for (pj, err) in outcomes.into_iter().flatten() {
      warn!(owner = %owner.label(), action = %pj.how, relation = %pj.through, target = %pj.what.label(), error = %err, "join operation failed");
      failures.push(format!("{} {} {}: {err}", pj.how, pj.through, pj.what.label()));
      failed.push(pj);
    }

    if let Err(err) = self.refresh(owner).await {
      warn!(owner = %owner.label(), error = %err, "refresh after join resolution failed");
    }

    if failed.is_empty() {
      info!(owner = %owner.label(), "pending joins resolved");
      return Ok(());
    }
    owner.requeue_joins(failed);
    Err(CacheError::JoinResolution {
      label: owner.label(),
      failures,
    })
  }

  /// Apply the changes for one relation. Returns the operations that failed.
  async fn resolve_relation(
    &self,
    owner: &Entity,
    owner_stub: &Stub,
    relation: String,
    joins: Vec<PendingJoin>,
  ) -> Vec<(PendingJoin, CacheError)> {
    let Some(spec) = owner.model().join(&relation).cloned() else {
      let err = CacheError::UnknownRelation {
        type_name: owner.type_name().to_string(),
        relation,
      };
      return joins.into_iter().map(|pj| (pj, err.clone())).collect();
    };

    let mappings = match self.load_binding(&spec, owner_stub).await {
      Ok(mappings) => mappings,
      Err(err) => return joins.into_iter().map(|pj| (pj, err.clone())).collect(),
    };

    let results = join_all(
      joins
        .iter()
        .map(|pj| self.apply_join(&spec, owner_stub, &mappings, pj)),
    )
    .await;

    joins
      .into_iter()
      .zip(results)
      .filter_map(|(pj, result)| result.err().map(|err| (pj, err)))
      .collect()
  }

  /// Join objects of `spec` currently pointing at the owner.
  async fn load_binding(&self, spec: &JoinSpec, owner_stub: &Stub) -> Result<Vec<Entity>> {
    let result = self
      .query(
        &spec.join_type,
        Filter::new().relevant_to(owner_stub.type_name(), owner_stub.id()),
      )
      .await?;
    Ok(
      result
        .values
        .into_iter()
        .filter(|join| {
          join
            .get(&spec.owner_attr)
            .and_then(|v| v.as_stub().map(|s| s == owner_stub))
            .unwrap_or(false)
        })
        .collect(),
    )
  }

  async fn apply_join(
    &self,
    spec: &JoinSpec,
    owner_stub: &Stub,
    mappings: &[Entity],
    pj: &PendingJoin,
  ) -> Result<()> {
    let matching = matching_joins(spec, mappings, &pj.what);

    match pj.how {
      JoinAction::Add => {
        if !matching.is_empty() {
          debug!(target = %pj.what.label(), relation = %pj.through, "already mapped");
          return Ok(());
        }
        if pj.what.is_new() {
          self.save(&pj.what).await?;
        }
        let target_stub = self.stub(&pj.what)?;

        let mut payload = pj.extra.clone();
        payload.insert(spec.owner_attr.clone(), owner_stub.to_json());
        payload.insert(spec.target_attr.clone(), target_stub.to_json());
        let join = self.construct(&spec.join_type, &Value::Object(payload))?;
        if let Err(err) = self.save(&join).await {
          self.evict(&join);
          return Err(err);
        }
      }
      JoinAction::Update => {
        for join in matching {
          self.assign(&join, &pj.extra)?;
          self.save(&join).await?;
        }
      }
      JoinAction::Remove => {
        // Every mapping is attempted; the first failure is reported.
        let results = join_all(matching.iter().map(|join| self.destroy(join))).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
      }
    }
    Ok(())
  }
}

fn matching_joins(spec: &JoinSpec, mappings: &[Entity], target: &Entity) -> Vec<Entity> {
  let Some(id) = target.id() else {
    return Vec::new();
  };
  mappings
    .iter()
    .filter(|join| {
      join
        .get(&spec.target_attr)
        .and_then(|v| v.as_stub().map(|s| s.refers_to(target.type_name(), id)))
        .unwrap_or(false)
    })
    .cloned()
    .collect()
}
