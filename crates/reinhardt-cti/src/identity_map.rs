//! Identity map
//!
//! Guarantees at most one live in-memory instance per persistent identity
//! within a session. Keys use the hierarchy root, so an entity loaded as a
//! `person` and later requested as a `manager` resolves to the same instance.

use crate::entity::EntityRef;
use crate::error::{CtiError, Result};
use crate::value::IdentityKey;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct IdentityMap {
	entries: Mutex<HashMap<IdentityKey, EntityRef>>,
}

impl IdentityMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, key: &IdentityKey) -> Option<EntityRef> {
		self.entries.lock().get(key).cloned()
	}

	pub fn contains(&self, key: &IdentityKey) -> bool {
		self.entries.lock().contains_key(key)
	}

	/// Return the registered instance, registering `make()` first if the key
	/// is unknown
	pub fn get_or_insert_with(
		&self,
		key: &IdentityKey,
		make: impl FnOnce() -> EntityRef,
	) -> (EntityRef, bool) {
		let mut entries = self.entries.lock();
		if let Some(existing) = entries.get(key) {
			return (existing.clone(), false);
		}
		let entity = make();
		entries.insert(key.clone(), entity.clone());
		(entity, true)
	}

	/// Register a freshly persisted instance under its new key
	pub fn insert_new(&self, key: IdentityKey, entity: &EntityRef) -> Result<()> {
		let mut entries = self.entries.lock();
		match entries.get(&key) {
			Some(existing) if !existing.same(entity) => Err(CtiError::ConstraintViolation(format!(
				"identity {key} is already held by another instance"
			))),
			_ => {
				entries.insert(key, entity.clone());
				Ok(())
			}
		}
	}

	pub fn remove(&self, key: &IdentityKey) -> Option<EntityRef> {
		self.entries.lock().remove(key)
	}

	pub fn clear(&self) {
		let mut entries = self.entries.lock();
		tracing::debug!(evicted = entries.len(), "Clearing identity map");
		entries.clear();
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	/// Snapshot of every registered instance
	pub fn entities(&self) -> Vec<EntityRef> {
		self.entries.lock().values().cloned().collect()
	}
}

impl std::fmt::Debug for IdentityMap {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("IdentityMap").field("len", &self.len()).finish()
	}
}
