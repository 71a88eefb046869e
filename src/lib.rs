//! Client-side entity cache for REST resource APIs.
//!
//! Keeps one canonical in-memory [`Entity`] per `(type, id)`, serializes writes
//! per entity, defers many-to-many relationship changes until the owner is saved
//! and coalesces refreshes. See [`Cache`] for the entry point.

pub mod api;
pub mod cache;
pub mod dates;
pub mod error;
pub mod query;

#[cfg(test)]
mod test_harness;

pub use cache::{
  AttrKind, AttrSpec, AttrValue, Cache, CacheEvent, CacheOptions, Entity, JoinSpec, Key, Model,
  ResourceModel, Stub,
};
pub use dates::{DateCodec, DateKind, DateValue};
pub use error::{CacheError, Result};
pub use query::{Expression, Filter, QueryBatch, QueryResult};
