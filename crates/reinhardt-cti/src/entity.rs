//! Entity handles
//!
//! An [`EntityRef`] is a cheap, clonable handle to one in-memory entity.
//! Handles compare by pointer: two handles are equal only when they refer to
//! the same instance, which is what the identity map guarantees for equal
//! identities.
//!
//! A handle may be an uninitialized proxy. Reading or writing any mapped
//! field or association triggers a single load through the owning session;
//! [`EntityRef::id`] never does.

use crate::collection::LazyCollection;
use crate::error::{CtiError, Result};
use crate::proxy::EntityLoader;
use crate::value::{IdentityKey, PrimaryKey, Value};
use indexmap::IndexMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;

/// Persistence state of an entity within its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
	/// Created in memory, not yet inserted
	New,
	/// Backed by a row and tracked by the identity map
	Managed,
	/// Deleted by a flush
	Removed,
}

/// Value of a single-valued association
#[derive(Clone)]
pub(crate) enum ToOneSlot {
	Null,
	/// Resolved through the identity map on access
	Key(IdentityKey),
	/// Assigned in memory and not yet settled by a flush
	Entity(EntityRef),
}

impl ToOneSlot {
	pub(crate) fn key(&self) -> Option<IdentityKey> {
		match self {
			Self::Null => None,
			Self::Key(key) => Some(key.clone()),
			Self::Entity(entity) => entity.identity(),
		}
	}
}

#[derive(Default)]
pub(crate) struct EntityState {
	pub(crate) fields: IndexMap<String, Value>,
	pub(crate) links: IndexMap<String, ToOneSlot>,
	pub(crate) collections: IndexMap<String, Arc<LazyCollection>>,
	original_fields: IndexMap<String, Value>,
	original_links: IndexMap<String, Option<IdentityKey>>,
}

impl EntityState {
	pub(crate) fn new(
		fields: IndexMap<String, Value>,
		links: IndexMap<String, ToOneSlot>,
		collections: IndexMap<String, Arc<LazyCollection>>,
	) -> Self {
		Self {
			fields,
			links,
			collections,
			original_fields: IndexMap::new(),
			original_links: IndexMap::new(),
		}
	}
}

struct EntityCell {
	entity_type: String,
	root: String,
	key: RwLock<Option<IdentityKey>>,
	lifecycle: RwLock<Lifecycle>,
	state: RwLock<EntityState>,
	loaded: OnceCell<()>,
	loader: RwLock<Option<Weak<dyn EntityLoader>>>,
}

#[derive(Clone)]
pub struct EntityRef(Arc<EntityCell>);

impl EntityRef {
	/// A new, fully initialized entity that has never been persisted
	pub(crate) fn transient(entity_type: &str, root: &str, state: EntityState) -> Self {
		Self(Arc::new(EntityCell {
			entity_type: entity_type.to_string(),
			root: root.to_string(),
			key: RwLock::new(None),
			lifecycle: RwLock::new(Lifecycle::New),
			state: RwLock::new(state),
			loaded: OnceCell::new_with(Some(())),
			loader: RwLock::new(None),
		}))
	}

	/// A managed entity whose state has not been read yet
	pub(crate) fn unloaded(entity_type: &str, key: IdentityKey, loader: Weak<dyn EntityLoader>) -> Self {
		Self(Arc::new(EntityCell {
			entity_type: entity_type.to_string(),
			root: key.root.clone(),
			key: RwLock::new(Some(key)),
			lifecycle: RwLock::new(Lifecycle::Managed),
			state: RwLock::new(EntityState::default()),
			loaded: OnceCell::new(),
			loader: RwLock::new(Some(loader)),
		}))
	}

	/// Concrete entity type name
	pub fn entity_type(&self) -> &str {
		&self.0.entity_type
	}

	/// Root type of the entity's hierarchy
	pub fn root_type(&self) -> &str {
		&self.0.root
	}

	pub fn identity(&self) -> Option<IdentityKey> {
		self.0.key.read().clone()
	}

	/// Identifier value; never triggers a load
	pub fn id(&self) -> Option<PrimaryKey> {
		self.0.key.read().as_ref().map(|key| key.id.clone())
	}

	pub fn lifecycle(&self) -> Lifecycle {
		*self.0.lifecycle.read()
	}

	pub fn is_initialized(&self) -> bool {
		self.0.loaded.initialized()
	}

	/// Whether both handles refer to the same in-memory instance
	pub fn same(&self, other: &EntityRef) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}

	/// Assign the identifier of a new entity whose root uses assigned ids
	pub fn assign_id(&self, id: impl Into<PrimaryKey>) -> Result<()> {
		let mut key = self.0.key.write();
		if key.is_some() {
			return Err(CtiError::ConstraintViolation(format!(
				"'{}' already has an identifier",
				self.0.entity_type
			)));
		}
		*key = Some(IdentityKey::new(self.0.root.clone(), id));
		Ok(())
	}

	/// Load the entity's state if it is still an uninitialized proxy.
	///
	/// Concurrent callers share one load; a failed load leaves the proxy
	/// uninitialized so it can be retried.
	pub async fn ensure_loaded(&self) -> Result<()> {
		if self.is_initialized() {
			return Ok(());
		}
		let loader = self.loader()?;
		self.0
			.loaded
			.get_or_try_init(|| async { loader.initialize(self).await })
			.await?;
		Ok(())
	}

	pub async fn get(&self, field: &str) -> Result<Value> {
		self.ensure_loaded().await?;
		self.state()
			.fields
			.get(field)
			.cloned()
			.ok_or_else(|| CtiError::unknown_field(&self.0.entity_type, field))
	}

	pub async fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
		self.ensure_loaded().await?;
		let mut state = self.state_mut();
		match state.fields.get_mut(field) {
			Some(slot) => {
				*slot = value.into();
				Ok(())
			}
			None => Err(CtiError::unknown_field(&self.0.entity_type, field)),
		}
	}

	/// Follow a single-valued association.
	///
	/// Targets are resolved through the session's identity map, so the same
	/// instance is returned no matter which path reached it.
	pub async fn get_one(&self, association: &str) -> Result<Option<EntityRef>> {
		self.ensure_loaded().await?;
		let slot = self
			.state()
			.links
			.get(association)
			.cloned()
			.ok_or_else(|| CtiError::unknown_field(&self.0.entity_type, association))?;
		match slot {
			ToOneSlot::Null => Ok(None),
			ToOneSlot::Entity(entity) => Ok(Some(entity)),
			ToOneSlot::Key(key) => {
				let loader = self.loader()?;
				loader.resolve(&key).await.map(Some)
			}
		}
	}

	pub async fn set_one(&self, association: &str, target: Option<&EntityRef>) -> Result<()> {
		self.ensure_loaded().await?;
		let mut state = self.state_mut();
		match state.links.get_mut(association) {
			Some(slot) => {
				*slot = target.map_or(ToOneSlot::Null, |t| ToOneSlot::Entity(t.clone()));
				Ok(())
			}
			None => Err(CtiError::unknown_field(&self.0.entity_type, association)),
		}
	}

	/// Collection-valued association; the collection itself loads lazily
	pub async fn collection(&self, association: &str) -> Result<Arc<LazyCollection>> {
		self.ensure_loaded().await?;
		self.state()
			.collections
			.get(association)
			.cloned()
			.ok_or_else(|| CtiError::unknown_field(&self.0.entity_type, association))
	}

	pub(crate) fn loader(&self) -> Result<Arc<dyn EntityLoader>> {
		self.0
			.loader
			.read()
			.as_ref()
			.and_then(Weak::upgrade)
			.ok_or_else(|| CtiError::Detached(self.0.entity_type.clone()))
	}

	pub(crate) fn state(&self) -> RwLockReadGuard<'_, EntityState> {
		self.0.state.read()
	}

	pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, EntityState> {
		self.0.state.write()
	}

	pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
		*self.0.lifecycle.write() = lifecycle;
	}

	/// Bind a freshly inserted entity to its key and session
	pub(crate) fn attach(&self, key: IdentityKey, loader: Weak<dyn EntityLoader>) {
		*self.0.key.write() = Some(key.clone());
		*self.0.loader.write() = Some(loader.clone());
		*self.0.lifecycle.write() = Lifecycle::Managed;
		let collections: Vec<Arc<LazyCollection>> =
			self.state().collections.values().cloned().collect();
		for collection in collections {
			collection.attach(key.clone(), loader.clone());
		}
	}

	/// Install state read from the database and mark the entity loaded.
	/// Returns `false` without touching anything if it was already loaded.
	pub(crate) fn populate(&self, state: EntityState) -> bool {
		if self.is_initialized() {
			return false;
		}
		{
			let mut current = self.state_mut();
			*current = state;
			current.original_fields = current.fields.clone();
			current.original_links = current
				.links
				.iter()
				.map(|(name, slot)| (name.clone(), slot.key()))
				.collect();
		}
		// Fails only while a concurrent `ensure_loaded` holds the cell, which
		// then completes the initialization itself.
		let _ = self.0.loaded.set(());
		true
	}

	pub(crate) fn set_link(&self, association: &str, slot: ToOneSlot) {
		let mut state = self.state_mut();
		let key = slot.key();
		state.links.insert(association.to_string(), slot);
		state.original_links.insert(association.to_string(), key);
	}

	/// Overwrite a value that is already persisted, leaving the field clean
	pub(crate) fn refresh_field(&self, field: &str, value: Value) {
		let mut state = self.state_mut();
		if let Some(slot) = state.fields.get_mut(field) {
			*slot = value.clone();
			state.original_fields.insert(field.to_string(), value);
		}
	}

	/// Fields whose value differs from the last loaded or flushed snapshot
	pub(crate) fn changed_fields(&self) -> Vec<(String, Value)> {
		let state = self.state();
		state
			.fields
			.iter()
			.filter(|(name, value)| state.original_fields.get(*name) != Some(*value))
			.map(|(name, value)| (name.clone(), value.clone()))
			.collect()
	}

	/// Owning links whose target identity changed since the last snapshot
	pub(crate) fn changed_links(&self) -> Vec<(String, ToOneSlot)> {
		let state = self.state();
		state
			.links
			.iter()
			.filter(|(name, slot)| {
				let original = state.original_links.get(*name).cloned().flatten();
				match slot {
					ToOneSlot::Entity(target) if target.identity().is_none() => true,
					other => other.key() != original,
				}
			})
			.map(|(name, slot)| (name.clone(), slot.clone()))
			.collect()
	}

	/// Entities assigned in memory to to-one links
	pub(crate) fn linked_entities(&self) -> Vec<(String, EntityRef)> {
		self.state()
			.links
			.iter()
			.filter_map(|(name, slot)| match slot {
				ToOneSlot::Entity(entity) => Some((name.clone(), entity.clone())),
				_ => None,
			})
			.collect()
	}

	/// Forget the persisted value of a link whose column was written as NULL,
	/// so the next update writes it
	pub(crate) fn mark_unwritten(&self, association: &str) {
		self.state_mut()
			.original_links
			.insert(association.to_string(), None);
	}

	/// Record the current state as clean and replace in-memory links with
	/// keys, dropping strong references to other entities
	pub(crate) fn commit_snapshot(&self) {
		let mut state = self.state_mut();
		for slot in state.links.values_mut() {
			if let ToOneSlot::Entity(target) = slot {
				if let Some(key) = target.identity() {
					*slot = ToOneSlot::Key(key);
				}
			}
		}
		state.original_fields = state.fields.clone();
		state.original_links = state
			.links
			.iter()
			.map(|(name, slot)| (name.clone(), slot.key()))
			.collect();
	}
}

impl PartialEq for EntityRef {
	fn eq(&self, other: &Self) -> bool {
		self.same(other)
	}
}

impl Eq for EntityRef {}

impl fmt::Debug for EntityRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EntityRef")
			.field("type", &self.0.entity_type)
			.field("key", &self.identity())
			.field("initialized", &self.is_initialized())
			.field("lifecycle", &self.lifecycle())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn employee() -> EntityRef {
		let fields: IndexMap<String, Value> = [
			("name".to_string(), Value::Null),
			("salary".to_string(), Value::Null),
		]
		.into_iter()
		.collect();
		let links: IndexMap<String, ToOneSlot> =
			[("spouse".to_string(), ToOneSlot::Null)].into_iter().collect();
		EntityRef::transient("employee", "person", EntityState::new(fields, links, IndexMap::new()))
	}

	#[tokio::test]
	async fn test_transient_entity_reads_and_writes() {
		let e = employee();
		assert!(e.is_initialized());
		assert_eq!(e.lifecycle(), Lifecycle::New);
		assert_eq!(e.id(), None);

		e.set("name", "Guilherme Blanco").await.unwrap();
		e.set("salary", 100_000).await.unwrap();
		assert_eq!(e.get("name").await.unwrap(), Value::from("Guilherme Blanco"));

		let err = e.set("title", "CTO").await.unwrap_err();
		assert!(matches!(err, CtiError::UnknownField { .. }));
	}

	#[tokio::test]
	async fn test_links_hold_new_targets_until_snapshot() {
		let wife = employee();
		let husband = employee();
		husband.set_one("spouse", Some(&wife)).await.unwrap();
		assert!(husband.get_one("spouse").await.unwrap().unwrap().same(&wife));
		assert_eq!(husband.changed_links().len(), 1);

		wife.assign_id(9).unwrap();
		husband.commit_snapshot();
		assert!(husband.changed_links().is_empty());
		assert!(husband.linked_entities().is_empty());
	}

	#[tokio::test]
	async fn test_unloaded_entity_without_session_is_detached() {
		let key = IdentityKey::new("person", 3);
		let loader: Weak<dyn EntityLoader> = Weak::<crate::session::SessionInner>::new();
		let proxy = EntityRef::unloaded("manager", key.clone(), loader);
		assert!(!proxy.is_initialized());
		assert_eq!(proxy.identity(), Some(key));

		let err = proxy.get("name").await.unwrap_err();
		assert!(matches!(err, CtiError::Detached(_)));
	}

	#[test]
	fn test_unwritten_link_to_itself_stays_dirty() {
		let e = employee();
		e.state_mut().links.insert("spouse".into(), ToOneSlot::Entity(e.clone()));
		e.assign_id(4).unwrap();
		e.commit_snapshot();
		assert!(e.changed_links().is_empty());

		e.mark_unwritten("spouse");
		let changed = e.changed_links();
		assert_eq!(changed.len(), 1);
		assert_eq!(changed[0].1.key(), Some(IdentityKey::new("person", 4)));
	}

	#[test]
	fn test_change_tracking() {
		let e = employee();
		e.commit_snapshot();
		assert!(e.changed_fields().is_empty());
		e.state_mut().fields.insert("salary".into(), Value::Int(1));
		assert_eq!(e.changed_fields(), vec![("salary".to_string(), Value::Int(1))]);
	}

	#[test]
	fn test_assign_id_only_once() {
		let e = employee();
		e.assign_id(1).unwrap();
		assert_eq!(e.identity(), Some(IdentityKey::new("person", 1)));
		assert!(e.assign_id(2).is_err());
	}

	#[test]
	fn test_handles_compare_by_instance() {
		let a = employee();
		let b = employee();
		assert_eq!(a, a.clone());
		assert_ne!(a, b);
	}
}
