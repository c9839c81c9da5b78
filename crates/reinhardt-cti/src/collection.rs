//! Lazily loaded collection-valued associations

use crate::entity::EntityRef;
use crate::error::{CtiError, Result};
use crate::proxy::EntityLoader;
use crate::value::IdentityKey;
use futures::future::try_join_all;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;

#[derive(Clone)]
enum Member {
	Key(IdentityKey),
	Entity(EntityRef),
}

impl Member {
	fn key(&self) -> Option<IdentityKey> {
		match self {
			Self::Key(key) => Some(key.clone()),
			Self::Entity(entity) => entity.identity(),
		}
	}

	fn refers_to(&self, entity: &EntityRef) -> bool {
		match self {
			Self::Key(key) => entity.identity().as_ref() == Some(key),
			Self::Entity(member) => member.same(entity),
		}
	}
}

/// A to-many association of one owner.
///
/// Persistent collections start uninitialized and load their members on the
/// first access. Collections of new owners, and collections filled by a fetch
/// join, are initialized from the start.
pub struct LazyCollection {
	owner_type: String,
	association: String,
	owner: RwLock<Option<IdentityKey>>,
	loader: RwLock<Option<Weak<dyn EntityLoader>>>,
	loaded: OnceCell<()>,
	members: RwLock<Vec<Member>>,
	snapshot: RwLock<Vec<IdentityKey>>,
}

impl LazyCollection {
	pub(crate) fn transient(owner_type: &str, association: &str) -> Self {
		Self {
			owner_type: owner_type.to_string(),
			association: association.to_string(),
			owner: RwLock::new(None),
			loader: RwLock::new(None),
			loaded: OnceCell::new_with(Some(())),
			members: RwLock::new(Vec::new()),
			snapshot: RwLock::new(Vec::new()),
		}
	}

	pub(crate) fn persistent(
		owner_type: &str,
		association: &str,
		owner: IdentityKey,
		loader: Weak<dyn EntityLoader>,
	) -> Self {
		Self {
			owner: RwLock::new(Some(owner)),
			loader: RwLock::new(Some(loader)),
			loaded: OnceCell::new(),
			..Self::transient(owner_type, association)
		}
	}

	pub fn association(&self) -> &str {
		&self.association
	}

	pub fn owner(&self) -> Option<IdentityKey> {
		self.owner.read().clone()
	}

	pub fn is_initialized(&self) -> bool {
		self.loaded.initialized()
	}

	/// Load the members if the collection has not been initialized yet
	pub async fn load(&self) -> Result<()> {
		if self.is_initialized() {
			return Ok(());
		}
		let owner = self
			.owner()
			.ok_or_else(|| CtiError::MissingIdentifier(self.owner_type.clone()))?;
		let loader = self
			.loader
			.read()
			.as_ref()
			.and_then(Weak::upgrade)
			.ok_or_else(|| CtiError::Detached(self.owner_type.clone()))?;

		self.loaded
			.get_or_try_init(|| async {
				let keys = loader
					.load_collection(&owner, &self.owner_type, &self.association)
					.await?;
				tracing::trace!(
					owner = %owner,
					association = %self.association,
					members = keys.len(),
					"Initialized lazy collection"
				);
				*self.snapshot.write() = keys.clone();
				*self.members.write() = keys.into_iter().map(Member::Key).collect();
				Ok::<(), CtiError>(())
			})
			.await?;
		Ok(())
	}

	pub async fn len(&self) -> Result<usize> {
		self.load().await?;
		Ok(self.members.read().len())
	}

	pub async fn is_empty(&self) -> Result<bool> {
		Ok(self.len().await? == 0)
	}

	/// Resolve every member through the identity map
	pub async fn to_vec(&self) -> Result<Vec<EntityRef>> {
		self.load().await?;
		let members = self.members.read().clone();
		if members.iter().all(|m| matches!(m, Member::Entity(_))) {
			return Ok(members
				.into_iter()
				.filter_map(|m| match m {
					Member::Entity(entity) => Some(entity),
					Member::Key(_) => None,
				})
				.collect());
		}

		let loader = self
			.loader
			.read()
			.as_ref()
			.and_then(Weak::upgrade)
			.ok_or_else(|| CtiError::Detached(self.owner_type.clone()))?;
		try_join_all(members.into_iter().map(|member| {
			let loader = Arc::clone(&loader);
			async move {
				match member {
					Member::Entity(entity) => Ok(entity),
					Member::Key(key) => loader.resolve(&key).await,
				}
			}
		}))
		.await
	}

	/// Member at `index`, or `None` past the end
	pub async fn get(&self, index: usize) -> Result<Option<EntityRef>> {
		self.load().await?;
		let member = self.members.read().get(index).cloned();
		match member {
			None => Ok(None),
			Some(Member::Entity(entity)) => Ok(Some(entity)),
			Some(Member::Key(key)) => {
				let loader = self
					.loader
					.read()
					.as_ref()
					.and_then(Weak::upgrade)
					.ok_or_else(|| CtiError::Detached(self.owner_type.clone()))?;
				loader.resolve(&key).await.map(Some)
			}
		}
	}

	pub async fn contains(&self, entity: &EntityRef) -> Result<bool> {
		self.load().await?;
		Ok(self.members.read().iter().any(|m| m.refers_to(entity)))
	}

	/// Add an entity; returns `false` if it is already a member
	pub async fn add(&self, entity: &EntityRef) -> Result<bool> {
		self.load().await?;
		let mut members = self.members.write();
		if members.iter().any(|m| m.refers_to(entity)) {
			return Ok(false);
		}
		members.push(Member::Entity(entity.clone()));
		Ok(true)
	}

	pub async fn remove(&self, entity: &EntityRef) -> Result<bool> {
		self.load().await?;
		let mut members = self.members.write();
		let before = members.len();
		members.retain(|m| !m.refers_to(entity));
		Ok(members.len() != before)
	}

	/// Initialize from keys gathered by a fetch join. A collection that is
	/// already initialized keeps its members.
	pub(crate) fn fill(&self, keys: Vec<IdentityKey>) -> bool {
		if self.is_initialized() {
			return false;
		}
		*self.snapshot.write() = keys.clone();
		*self.members.write() = keys.into_iter().map(Member::Key).collect();
		let _ = self.loaded.set(());
		true
	}

	pub(crate) fn attach(&self, owner: IdentityKey, loader: Weak<dyn EntityLoader>) {
		*self.owner.write() = Some(owner);
		*self.loader.write() = Some(loader);
	}

	/// Members held as in-memory entities (candidates for cascade persist)
	pub(crate) fn pending_entities(&self) -> Vec<EntityRef> {
		self.members
			.read()
			.iter()
			.filter_map(|m| match m {
				Member::Entity(entity) => Some(entity.clone()),
				Member::Key(_) => None,
			})
			.collect()
	}

	/// Keys added and removed since the last snapshot
	pub(crate) fn diff(&self) -> Result<(Vec<IdentityKey>, Vec<IdentityKey>)> {
		if !self.is_initialized() {
			return Ok((Vec::new(), Vec::new()));
		}
		let current = self
			.members
			.read()
			.iter()
			.map(|m| {
				m.key()
					.ok_or_else(|| CtiError::MissingIdentifier(format!("{}.{}", self.owner_type, self.association)))
			})
			.collect::<Result<Vec<_>>>()?;
		let snapshot = self.snapshot.read();
		let added = current.iter().filter(|k| !snapshot.contains(k)).cloned().collect();
		let removed = snapshot.iter().filter(|k| !current.contains(k)).cloned().collect();
		Ok((added, removed))
	}

	/// Record the current members as clean, replacing entities by keys
	pub(crate) fn commit(&self) {
		if !self.is_initialized() {
			return;
		}
		let mut members = self.members.write();
		for member in members.iter_mut() {
			if let Some(key) = member.key() {
				*member = Member::Key(key);
			}
		}
		*self.snapshot.write() = members.iter().filter_map(Member::key).collect();
	}
}

impl fmt::Debug for LazyCollection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LazyCollection")
			.field("owner", &self.owner())
			.field("association", &self.association)
			.field("initialized", &self.is_initialized())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::entity::EntityState;

	fn person(id: Option<i64>) -> EntityRef {
		let entity = EntityRef::transient("person", "person", EntityState::default());
		if let Some(id) = id {
			entity.assign_id(id).unwrap();
		}
		entity
	}

	#[tokio::test]
	async fn test_transient_collection_add_and_remove() {
		let friends = LazyCollection::transient("person", "friends");
		assert!(friends.is_initialized());

		let jon = person(None);
		assert!(friends.add(&jon).await.unwrap());
		assert!(!friends.add(&jon).await.unwrap());
		assert_eq!(friends.len().await.unwrap(), 1);
		assert!(friends.to_vec().await.unwrap()[0].same(&jon));
		assert!(friends.get(0).await.unwrap().unwrap().same(&jon));
		assert!(friends.get(1).await.unwrap().is_none());

		assert!(friends.remove(&jon).await.unwrap());
		assert!(friends.is_empty().await.unwrap());
	}

	#[tokio::test]
	async fn test_diff_and_commit() {
		let friends = LazyCollection::transient("person", "friends");
		let a = person(Some(1));
		let b = person(Some(2));
		friends.add(&a).await.unwrap();
		friends.add(&b).await.unwrap();

		let (added, removed) = friends.diff().unwrap();
		assert_eq!(added.len(), 2);
		assert!(removed.is_empty());

		friends.commit();
		assert!(friends.pending_entities().is_empty());
		friends.remove(&a).await.unwrap();
		let (added, removed) = friends.diff().unwrap();
		assert!(added.is_empty());
		assert_eq!(removed, vec![IdentityKey::new("person", 1)]);
	}

	#[tokio::test]
	async fn test_diff_requires_member_identifiers() {
		let friends = LazyCollection::transient("person", "friends");
		friends.add(&person(None)).await.unwrap();
		assert!(matches!(friends.diff(), Err(CtiError::MissingIdentifier(_))));
	}

	#[test]
	fn test_fill_keeps_first_initialization() {
		let loader: Weak<dyn EntityLoader> = Weak::<crate::session::SessionInner>::new();
		let events = LazyCollection::persistent(
			"organization",
			"events",
			IdentityKey::new("organization", 1),
			loader,
		);
		assert!(!events.is_initialized());
		assert!(events.fill(vec![IdentityKey::new("event", 1)]));
		assert!(events.is_initialized());
		assert!(!events.fill(vec![]));
		assert_eq!(events.snapshot.read().len(), 1);
	}
}
