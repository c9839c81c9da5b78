//! Lazy proxies
//!
//! A proxy is an [`EntityRef`] that knows its identity but not its state.
//! Proxies are only ever created for concrete leaf types: when a type has
//! subtypes, the class of a referenced row is unknown until its
//! discriminator has been read, so such references are loaded instead.

use crate::collection::LazyCollection;
use crate::entity::EntityRef;
use crate::error::{CtiError, Result};
use crate::identity_map::IdentityMap;
use crate::metadata::MappingRegistry;
use crate::value::{IdentityKey, PrimaryKey};
use async_trait::async_trait;
use std::sync::{Arc, Weak};

/// Loads state on behalf of proxies and lazy collections.
///
/// Entities hold a weak reference to their loader (the session), so a
/// dropped session leaves its entities detached instead of kept alive.
#[async_trait]
pub trait EntityLoader: Send + Sync {
	/// Populate an uninitialized proxy from its row; fails with
	/// [`CtiError::ProxyResolution`] when the row does not exist
	async fn initialize(&self, entity: &EntityRef) -> Result<()>;

	/// Return the instance for `key`, loading it if the session has none
	async fn resolve(&self, key: &IdentityKey) -> Result<EntityRef>;

	/// Load the members of a collection-valued association
	async fn load_collection(
		&self,
		owner: &IdentityKey,
		owner_type: &str,
		association: &str,
	) -> Result<Vec<IdentityKey>>;
}

pub struct ProxyFactory<'a> {
	registry: &'a MappingRegistry,
	identity_map: &'a IdentityMap,
	loader: Weak<dyn EntityLoader>,
}

impl<'a> ProxyFactory<'a> {
	pub fn new(
		registry: &'a MappingRegistry,
		identity_map: &'a IdentityMap,
		loader: Weak<dyn EntityLoader>,
	) -> Self {
		Self {
			registry,
			identity_map,
			loader,
		}
	}

	pub fn can_proxy(&self, entity_type: &str) -> bool {
		self.registry.can_proxy(entity_type)
	}

	/// Return the registered instance for the identity, or register a new
	/// uninitialized proxy for it
	pub fn reference(&self, entity_type: &str, id: PrimaryKey) -> Result<EntityRef> {
		if !self.can_proxy(entity_type) {
			return Err(CtiError::planning(format!(
				"'{entity_type}' has subtypes or is abstract and cannot be proxied"
			)));
		}
		let key = IdentityKey::new(self.registry.root_name(entity_type)?, id);
		let (entity, created) = self.identity_map.get_or_insert_with(&key, || {
			EntityRef::unloaded(entity_type, key.clone(), self.loader.clone())
		});
		if created {
			tracing::trace!(entity_type, key = %key, "Created lazy proxy");
		} else if !self.registry.is_subtype_of(entity.entity_type(), entity_type) {
			return Err(CtiError::TypeMismatch {
				expected: entity_type.to_string(),
				value: format!("{} {key}", entity.entity_type()),
			});
		}
		Ok(entity)
	}

	/// An uninitialized collection for an association of a loaded owner
	pub fn collection(
		&self,
		owner_type: &str,
		association: &str,
		owner: IdentityKey,
	) -> Arc<LazyCollection> {
		Arc::new(LazyCollection::persistent(
			owner_type,
			association,
			owner,
			self.loader.clone(),
		))
	}
}
