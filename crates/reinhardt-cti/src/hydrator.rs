//! Row hydration
//!
//! Turns flat result rows produced by a [`JoinPlan`] into entities. The
//! discriminator of each row decides the concrete type; identities already
//! present in the identity map are returned untouched so the first loaded
//! state wins.
//!
//! Hydration is synchronous. Fetch-joined targets are hydrated from the same
//! row, recursively. Work that needs another query, such as eager targets
//! beyond the joined depth or inverse single-valued associations, is
//! returned as [`Deferred`] items for the persister to resolve.

use crate::entity::{EntityRef, EntityState, ToOneSlot};
use crate::error::{CtiError, Result};
use crate::identity_map::IdentityMap;
use crate::metadata::{FetchMode, MappingRegistry};
use crate::planner::JoinPlan;
use crate::proxy::{EntityLoader, ProxyFactory};
use crate::value::{IdentityKey, PrimaryKey, Row, Value};
use indexmap::IndexMap;
use std::sync::Weak;

/// Follow-up work produced while hydrating
#[derive(Debug, Clone)]
pub(crate) enum Deferred {
	/// Target of a single-valued association that must be loaded now
	Entity { entity_type: String, key: IdentityKey },
	/// Inverse single-valued association, found through the owning side
	InverseToOne { owner: EntityRef, association: String },
}

#[derive(Debug, Default)]
pub(crate) struct Hydration {
	/// Distinct root entities of the rows, in row order
	pub(crate) entities: Vec<EntityRef>,
	pub(crate) deferred: Vec<Deferred>,
}

pub(crate) struct Hydrator<'a> {
	registry: &'a MappingRegistry,
	identity_map: &'a IdentityMap,
	proxies: ProxyFactory<'a>,
	loader: Weak<dyn EntityLoader>,
}

impl<'a> Hydrator<'a> {
	pub(crate) fn new(
		registry: &'a MappingRegistry,
		identity_map: &'a IdentityMap,
		loader: Weak<dyn EntityLoader>,
	) -> Self {
		Self {
			registry,
			identity_map,
			proxies: ProxyFactory::new(registry, identity_map, loader.clone()),
			loader,
		}
	}

	pub(crate) fn hydrate_all(&self, plan: &JoinPlan, rows: &[Row]) -> Result<Hydration> {
		let fetched = fetched_names(plan);
		let mut hydration = Hydration::default();
		let mut owners: IndexMap<IdentityKey, (EntityRef, bool)> = IndexMap::new();
		let mut members: IndexMap<(IdentityKey, String), Vec<IdentityKey>> = IndexMap::new();
		let mut inverse: Vec<(IdentityKey, String, Option<IdentityKey>)> = Vec::new();

		for row in rows {
			let Some((owner, populated)) =
				self.hydrate_entity(plan, row, &fetched, &mut hydration.deferred)?
			else {
				continue;
			};
			let Some(owner_key) = owner.identity() else {
				continue;
			};
			owners.entry(owner_key.clone()).or_insert((owner, populated));

			for fetch in &plan.fetch_joins {
				let target = self.hydrate_fetched(&fetch.target, row, &mut hydration.deferred)?;
				let target_key = target.and_then(|(entity, _)| entity.identity());
				if fetch.collection {
					let keys = members
						.entry((owner_key.clone(), fetch.association.clone()))
						.or_default();
					if let Some(key) = target_key {
						if !keys.contains(&key) {
							keys.push(key);
						}
					}
				} else if fetch.inverse {
					inverse.push((owner_key.clone(), fetch.association.clone(), target_key));
				}
			}
		}

		for ((owner_key, association), keys) in members {
			let Some((owner, _)) = owners.get(&owner_key) else {
				continue;
			};
			let collection = owner.state().collections.get(&association).cloned();
			if let Some(collection) = collection {
				collection.fill(keys);
			}
		}
		for (owner_key, association, target_key) in inverse {
			if let Some((owner, true)) = owners.get(&owner_key) {
				owner.set_link(&association, target_key.map_or(ToOneSlot::Null, ToOneSlot::Key));
			}
		}

		hydration.entities = owners.into_values().map(|(entity, _)| entity).collect();
		Ok(hydration)
	}

	/// Hydrate a fetch-joined target and the eager targets joined under it
	fn hydrate_fetched(
		&self,
		plan: &JoinPlan,
		row: &Row,
		deferred: &mut Vec<Deferred>,
	) -> Result<Option<(EntityRef, bool)>> {
		let hydrated = self.hydrate_entity(plan, row, &fetched_names(plan), deferred)?;
		if hydrated.is_some() {
			for fetch in plan.fetch_joins.iter().filter(|f| !f.collection && !f.inverse) {
				self.hydrate_fetched(&fetch.target, row, deferred)?;
			}
		}
		Ok(hydrated)
	}

	/// Hydrate the entity the plan's labels describe in `row`.
	///
	/// Returns `None` when the identifier column is NULL (an outer-joined
	/// target that does not exist), otherwise the entity and whether this
	/// call populated its state.
	pub(crate) fn hydrate_entity(
		&self,
		plan: &JoinPlan,
		row: &Row,
		fetched: &[&str],
		deferred: &mut Vec<Deferred>,
	) -> Result<Option<(EntityRef, bool)>> {
		let raw_id = row.get(&plan.id_label).cloned().unwrap_or(Value::Null);
		let Some(id) = PrimaryKey::from_value(raw_id, plan.id_type)? else {
			return Ok(None);
		};
		let key = IdentityKey::new(plan.root.clone(), id);

		let raw_type = plan
			.discriminator_label
			.as_ref()
			.and_then(|label| row.get(label))
			.unwrap_or(&Value::Null);
		let concrete = self
			.registry
			.discriminator_map(&plan.root)?
			.resolve(raw_type)?
			.to_string();
		if !self.registry.is_subtype_of(&concrete, &plan.entity_type) {
			return Err(CtiError::TypeMismatch {
				expected: plan.entity_type.clone(),
				value: format!("{concrete} {key}"),
			});
		}

		let (entity, _) = self.identity_map.get_or_insert_with(&key, || {
			EntityRef::unloaded(&concrete, key.clone(), self.loader.clone())
		});
		if entity.is_initialized() {
			return Ok(Some((entity, false)));
		}
		if entity.entity_type() != concrete {
			return Err(CtiError::TypeMismatch {
				expected: entity.entity_type().to_string(),
				value: format!("{concrete} {key}"),
			});
		}

		let mut fields = IndexMap::new();
		let mut links = IndexMap::new();
		let mut collections = IndexMap::new();
		let mut pending = Vec::new();
		for level in self.registry.chain(&concrete)? {
			for field in &level.fields {
				let value = plan
					.label_of(&level.name, &field.name)
					.and_then(|label| row.get(label))
					.cloned()
					.unwrap_or(Value::Null)
					.coerce(field.field_type)?;
				fields.insert(field.name.clone(), value);
			}

			for assoc in &level.associations {
				if assoc.is_collection() {
					collections.insert(
						assoc.name.clone(),
						self.proxies.collection(&concrete, &assoc.name, key.clone()),
					);
					continue;
				}
				if assoc.join_column().is_none() {
					if !fetched.contains(&assoc.name.as_str()) {
						pending.push(Deferred::InverseToOne {
							owner: entity.clone(),
							association: assoc.name.clone(),
						});
					}
					links.insert(assoc.name.clone(), ToOneSlot::Null);
					continue;
				}

				let target_id_type = self.registry.identifier(&assoc.target)?.field_type;
				let raw_fk = plan
					.label_of(&level.name, &assoc.name)
					.and_then(|label| row.get(label))
					.cloned()
					.unwrap_or(Value::Null);
				let Some(target_id) = PrimaryKey::from_value(raw_fk, target_id_type)? else {
					links.insert(assoc.name.clone(), ToOneSlot::Null);
					continue;
				};
				let target_key =
					IdentityKey::new(self.registry.root_name(&assoc.target)?, target_id.clone());
				if !self.identity_map.contains(&target_key) && !fetched.contains(&assoc.name.as_str()) {
					if assoc.fetch == FetchMode::Lazy && self.proxies.can_proxy(&assoc.target) {
						self.proxies.reference(&assoc.target, target_id)?;
					} else {
						pending.push(Deferred::Entity {
							entity_type: assoc.target.clone(),
							key: target_key.clone(),
						});
					}
				}
				links.insert(assoc.name.clone(), ToOneSlot::Key(target_key));
			}
		}

		let populated = entity.populate(EntityState::new(fields, links, collections));
		if populated {
			tracing::trace!(entity_type = %concrete, key = %key, "Hydrated entity");
			deferred.extend(pending);
		}
		Ok(Some((entity, populated)))
	}
}

fn fetched_names(plan: &JoinPlan) -> Vec<&str> {
	plan.fetch_joins.iter().map(|f| f.association.as_str()).collect()
}
