//! Session / unit of work
//!
//! A [`Session`] owns one identity map and tracks scheduled inserts and
//! deletes until [`Session::flush`]. Entities loaded through a session keep
//! a weak reference back to it and use it to initialize proxies and
//! collections on first access.

use crate::bulk::{BulkDelete, BulkUpdate};
use crate::collection::LazyCollection;
use crate::config::PersisterConfig;
use crate::connection::Connection;
use crate::criteria::{Criteria, Predicate};
use crate::entity::{EntityRef, EntityState, Lifecycle, ToOneSlot};
use crate::error::{CtiError, Result};
use crate::identity_map::IdentityMap;
use crate::metadata::MappingRegistry;
use crate::persister::JoinedTablePersister;
use crate::proxy::{EntityLoader, ProxyFactory};
use crate::query::EntityQuery;
use crate::value::{IdentityKey, PrimaryKey, Value};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct UnitOfWork {
	inserts: Vec<EntityRef>,
	deletes: Vec<EntityRef>,
}

fn position(list: &[EntityRef], entity: &EntityRef) -> Option<usize> {
	list.iter().position(|queued| queued.same(entity))
}

pub(crate) struct SessionInner {
	registry: Arc<MappingRegistry>,
	connection: Arc<dyn Connection>,
	identity_map: IdentityMap,
	config: PersisterConfig,
	work: Mutex<UnitOfWork>,
	self_ref: Weak<SessionInner>,
}

impl SessionInner {
	fn loader(&self) -> Weak<dyn EntityLoader> {
		self.self_ref.clone()
	}

	fn persister(&self) -> JoinedTablePersister<'_> {
		JoinedTablePersister::new(
			&self.registry,
			self.connection.as_ref(),
			&self.identity_map,
			&self.config,
			self.loader(),
		)
	}
}

#[async_trait]
impl EntityLoader for SessionInner {
	async fn initialize(&self, entity: &EntityRef) -> Result<()> {
		self.persister().initialize(entity).await
	}

	async fn resolve(&self, key: &IdentityKey) -> Result<EntityRef> {
		self.persister().resolve(key).await
	}

	async fn load_collection(
		&self,
		owner: &IdentityKey,
		owner_type: &str,
		association: &str,
	) -> Result<Vec<IdentityKey>> {
		self.persister()
			.load_collection(owner, owner_type, association)
			.await
	}
}

/// Unit of work over one connection and one mapping registry
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use reinhardt_cti::{
/// 	EntityDescriptor, FieldDef, FieldType, IdStrategy, MappingRegistry, PersisterConfig,
/// 	Session, SqliteConnection,
/// };
///
/// # async fn example() -> reinhardt_cti::Result<()> {
/// let registry = MappingRegistry::build([
/// 	EntityDescriptor::root("person", "company_persons")
/// 		.identifier("id", FieldType::Integer, IdStrategy::Identity)
/// 		.discriminator_column("discr")
/// 		.discriminator("person")
/// 		.field(FieldDef::new("name", FieldType::Text)),
/// 	EntityDescriptor::child("employee", "person", "company_employees")
/// 		.discriminator("employee")
/// 		.field(FieldDef::new("salary", FieldType::Integer)),
/// ])?;
/// let connection = SqliteConnection::connect("sqlite://company.db").await?;
/// let session = Session::new(Arc::new(registry), Arc::new(connection), PersisterConfig::default())?;
///
/// let employee = session.new_entity("employee")?;
/// employee.set("name", "Guilherme Blanco").await?;
/// employee.set("salary", 100_000).await?;
/// session.persist(&employee)?;
/// session.flush().await?;
///
/// session.clear();
/// let loaded = session.find("person", employee.id().unwrap()).await?.unwrap();
/// assert_eq!(loaded.entity_type(), "employee");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
	inner: Arc<SessionInner>,
}

impl Session {
	pub fn new(
		registry: Arc<MappingRegistry>,
		connection: Arc<dyn Connection>,
		config: PersisterConfig,
	) -> Result<Self> {
		config.validate()?;
		if config.backend != connection.backend() {
			return Err(CtiError::Config(format!(
				"configured backend {:?} does not match the connection's {:?}",
				config.backend,
				connection.backend()
			)));
		}
		let inner = Arc::new_cyclic(|self_ref| SessionInner {
			registry,
			connection,
			identity_map: IdentityMap::new(),
			config,
			work: Mutex::new(UnitOfWork::default()),
			self_ref: self_ref.clone(),
		});
		Ok(Self { inner })
	}

	pub fn registry(&self) -> &MappingRegistry {
		&self.inner.registry
	}

	pub fn config(&self) -> &PersisterConfig {
		&self.inner.config
	}

	pub fn identity_map(&self) -> &IdentityMap {
		&self.inner.identity_map
	}

	pub fn persister(&self) -> JoinedTablePersister<'_> {
		self.inner.persister()
	}

	/// A new in-memory entity with every field and link unset
	pub fn new_entity(&self, entity_type: &str) -> Result<EntityRef> {
		let registry = &self.inner.registry;
		let descriptor = registry.get(entity_type)?;
		if descriptor.is_abstract {
			return Err(CtiError::planning(format!(
				"abstract entity '{entity_type}' cannot be instantiated"
			)));
		}

		let mut fields = IndexMap::new();
		let mut links = IndexMap::new();
		let mut collections = IndexMap::new();
		for level in registry.chain(entity_type)? {
			for field in &level.fields {
				fields.insert(field.name.clone(), Value::Null);
			}
			for assoc in &level.associations {
				if assoc.is_collection() {
					collections.insert(
						assoc.name.clone(),
						Arc::new(LazyCollection::transient(entity_type, &assoc.name)),
					);
				} else {
					links.insert(assoc.name.clone(), ToOneSlot::Null);
				}
			}
		}
		let root = registry.root_name(entity_type)?;
		Ok(EntityRef::transient(
			entity_type,
			root,
			EntityState::new(fields, links, collections),
		))
	}

	/// Schedule a new entity for insertion, cascading to associated new
	/// entities through associations flagged `cascade_persist`
	pub fn persist(&self, entity: &EntityRef) -> Result<()> {
		let registry = &self.inner.registry;
		let mut visited: Vec<EntityRef> = Vec::new();
		let mut stack = vec![entity.clone()];
		let mut work = self.inner.work.lock();

		while let Some(current) = stack.pop() {
			if position(&visited, &current).is_some() {
				continue;
			}
			visited.push(current.clone());
			match current.lifecycle() {
				Lifecycle::Removed => {
					return Err(CtiError::Detached(format!(
						"{} was removed and cannot be persisted again",
						current.entity_type()
					)));
				}
				Lifecycle::New => {
					if let Some(index) = position(&work.deletes, &current) {
						work.deletes.remove(index);
					}
					if position(&work.inserts, &current).is_none() {
						work.inserts.push(current.clone());
					}
				}
				Lifecycle::Managed => {
					if !current.is_initialized() {
						continue;
					}
				}
			}

			let entity_type = current.entity_type().to_string();
			let mut cascaded = Vec::new();
			for (name, target) in current.linked_entities() {
				if registry
					.association(&entity_type, &name)
					.is_some_and(|(_, assoc)| assoc.cascade_persist)
				{
					cascaded.push(target);
				}
			}
			let collections: Vec<(String, Arc<LazyCollection>)> = current
				.state()
				.collections
				.iter()
				.map(|(name, collection)| (name.clone(), collection.clone()))
				.collect();
			for (name, collection) in collections {
				if registry
					.association(&entity_type, &name)
					.is_some_and(|(_, assoc)| assoc.cascade_persist)
				{
					cascaded.extend(collection.pending_entities());
				}
			}
			// Reversed so that targets are inserted in declaration order
			stack.extend(cascaded.into_iter().rev());
		}
		Ok(())
	}

	/// Schedule a managed entity for deletion; a pending insert is simply
	/// cancelled
	pub fn remove(&self, entity: &EntityRef) -> Result<()> {
		let mut work = self.inner.work.lock();
		match entity.lifecycle() {
			Lifecycle::New => {
				if let Some(index) = position(&work.inserts, entity) {
					work.inserts.remove(index);
				}
			}
			Lifecycle::Managed => {
				if !self.contains(entity) {
					return Err(CtiError::Detached(entity.entity_type().to_string()));
				}
				if position(&work.deletes, entity).is_none() {
					work.deletes.push(entity.clone());
				}
			}
			Lifecycle::Removed => {}
		}
		Ok(())
	}

	/// Whether this session manages exactly this instance
	pub fn contains(&self, entity: &EntityRef) -> bool {
		entity
			.identity()
			.and_then(|key| self.inner.identity_map.get(&key))
			.is_some_and(|managed| managed.same(entity))
	}

	/// Write every scheduled and detected change:
	/// inserts, updates (including links to entities inserted in this
	/// flush), link table changes, then deletes
	pub async fn flush(&self) -> Result<()> {
		let (inserts, deletes) = {
			let work = self.inner.work.lock();
			(work.inserts.clone(), work.deletes.clone())
		};
		let managed: Vec<EntityRef> = self
			.inner
			.identity_map
			.entities()
			.into_iter()
			.filter(|entity| entity.is_initialized() && position(&deletes, entity).is_none())
			.collect();
		self.check_unsaved_references(&inserts, &managed)?;

		let persister = self.persister();
		for entity in &inserts {
			persister.insert(entity).await?;
		}
		let candidates: Vec<&EntityRef> = managed.iter().chain(inserts.iter()).collect();
		let mut updated = 0;
		for entity in &candidates {
			if persister.update(entity).await? {
				updated += 1;
			}
		}
		for entity in &candidates {
			persister.sync_collections(entity).await?;
		}
		for entity in &deletes {
			persister.delete(entity).await?;
		}

		{
			let mut work = self.inner.work.lock();
			work.inserts.retain(|queued| position(&inserts, queued).is_none());
			work.deletes.retain(|queued| position(&deletes, queued).is_none());
		}
		tracing::debug!(
			inserted = inserts.len(),
			updated,
			deleted = deletes.len(),
			"Flushed unit of work"
		);
		Ok(())
	}

	fn check_unsaved_references(&self, inserts: &[EntityRef], managed: &[EntityRef]) -> Result<()> {
		let unsaved = |target: &EntityRef| {
			target.lifecycle() == Lifecycle::New && position(inserts, target).is_none()
		};
		for entity in inserts.iter().chain(managed) {
			let linked = entity.linked_entities();
			let members = entity
				.state()
				.collections
				.values()
				.flat_map(|collection| collection.pending_entities())
				.collect::<Vec<_>>();
			let offending = linked
				.into_iter()
				.map(|(_, target)| target)
				.chain(members)
				.find(|target| unsaved(target));
			if let Some(target) = offending {
				return Err(CtiError::ConstraintViolation(format!(
					"'{}' references a new '{}' that was not persisted",
					entity.entity_type(),
					target.entity_type()
				)));
			}
		}
		Ok(())
	}

	/// Reset the unit of work: forget every managed instance and pending
	/// change
	pub fn clear(&self) {
		self.inner.identity_map.clear();
		let mut work = self.inner.work.lock();
		work.inserts.clear();
		work.deletes.clear();
	}

	pub async fn find(&self, entity_type: &str, id: impl Into<PrimaryKey>) -> Result<Option<EntityRef>> {
		self.persister().find(entity_type, id.into()).await
	}

	/// A reference to an entity without loading it when possible.
	///
	/// Leaf types yield an uninitialized proxy. Types with subtypes must
	/// read the discriminator first, so they are loaded, and `None` is
	/// returned when no such row exists.
	pub async fn get_reference(
		&self,
		entity_type: &str,
		id: impl Into<PrimaryKey>,
	) -> Result<Option<EntityRef>> {
		let id = id.into();
		if self.inner.registry.can_proxy(entity_type) {
			let factory =
				ProxyFactory::new(&self.inner.registry, &self.inner.identity_map, self.inner.loader());
			return factory.reference(entity_type, id).map(Some);
		}
		self.find(entity_type, id).await
	}

	pub async fn find_by(&self, entity_type: &str, criteria: Criteria) -> Result<Vec<EntityRef>> {
		self.query(entity_type).filter(criteria).all().await
	}

	pub async fn find_one_by(&self, entity_type: &str, criteria: Criteria) -> Result<Option<EntityRef>> {
		self.query(entity_type).filter(criteria).one_or_none().await
	}

	pub async fn matching(&self, entity_type: &str, predicate: &dyn Predicate) -> Result<Vec<EntityRef>> {
		self.persister().matching(entity_type, predicate).await
	}

	pub fn query(&self, entity_type: &str) -> EntityQuery<'_> {
		EntityQuery::new(self, entity_type)
	}

	pub async fn bulk_update(&self, update: BulkUpdate) -> Result<u64> {
		self.persister().bulk_update(&update).await
	}

	pub async fn bulk_delete(&self, delete: BulkDelete) -> Result<u64> {
		self.persister().bulk_delete(&delete).await
	}

	pub async fn exists(&self, entity: &EntityRef) -> Result<bool> {
		self.persister().exists(entity).await
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("managed", &self.inner.identity_map.len())
			.field("config", &self.inner.config)
			.finish()
	}
}
