//! Validated mapping registry
//!
//! [`MappingRegistry::build`] checks a set of [`EntityDescriptor`]s once and
//! precomputes the hierarchy relations every other component relies on.

use super::descriptor::{
	AssociationDef, AssociationKind, AssociationMapping, EntityDescriptor, FieldDef,
	IdentifierDef, JoinTableDef,
};
use crate::discriminator::DiscriminatorMap;
use crate::error::{CtiError, Result};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
struct TypeNode {
	descriptor: EntityDescriptor,
	/// Type names from the root down to this type
	chain: Vec<String>,
	children: Vec<String>,
}

/// Immutable, validated set of entity mappings
#[derive(Debug)]
pub struct MappingRegistry {
	types: IndexMap<String, TypeNode>,
	discriminators: HashMap<String, DiscriminatorMap>,
}

impl MappingRegistry {
	/// Validate descriptors and build the registry.
	///
	/// Fails with [`CtiError::Planning`] on unknown parents, inheritance
	/// cycles, name collisions along a chain, duplicate discriminator values,
	/// concrete types without a discriminator and broken associations.
	pub fn build(descriptors: impl IntoIterator<Item = EntityDescriptor>) -> Result<Self> {
		let mut types: IndexMap<String, TypeNode> = IndexMap::new();
		for descriptor in descriptors {
			if descriptor.table.is_empty() {
				return Err(CtiError::planning(format!(
					"entity '{}' does not declare a table",
					descriptor.name
				)));
			}
			let name = descriptor.name.clone();
			let node = TypeNode {
				descriptor,
				chain: Vec::new(),
				children: Vec::new(),
			};
			if types.insert(name.clone(), node).is_some() {
				return Err(CtiError::planning(format!("entity '{name}' is declared twice")));
			}
		}

		let names: Vec<String> = types.keys().cloned().collect();
		for name in &names {
			let chain = resolve_chain(&types, name)?;
			if let Some(parent) = chain.iter().rev().nth(1).cloned() {
				if let Some(parent_node) = types.get_mut(&parent) {
					parent_node.children.push(name.clone());
				}
			}
			if let Some(node) = types.get_mut(name) {
				node.chain = chain;
			}
		}

		let mut registry = Self {
			types,
			discriminators: HashMap::new(),
		};
		registry.validate_roots()?;
		registry.build_discriminators()?;
		registry.validate_names()?;
		registry.validate_associations()?;

		tracing::debug!(
			types = registry.types.len(),
			hierarchies = registry.discriminators.len(),
			"Built mapping registry"
		);
		Ok(registry)
	}

	fn node(&self, entity_type: &str) -> Result<&TypeNode> {
		self.types
			.get(entity_type)
			.ok_or_else(|| CtiError::UnknownType(entity_type.to_string()))
	}

	pub fn contains(&self, entity_type: &str) -> bool {
		self.types.contains_key(entity_type)
	}

	pub fn entity_types(&self) -> impl Iterator<Item = &str> {
		self.types.keys().map(String::as_str)
	}

	pub fn get(&self, entity_type: &str) -> Result<&EntityDescriptor> {
		self.node(entity_type).map(|node| &node.descriptor)
	}

	pub fn root_name(&self, entity_type: &str) -> Result<&str> {
		let node = self.node(entity_type)?;
		Ok(node.chain.first().map_or(node.descriptor.name.as_str(), String::as_str))
	}

	pub fn root_of(&self, entity_type: &str) -> Result<&EntityDescriptor> {
		let root = self.root_name(entity_type)?;
		self.get(root)
	}

	/// Descriptors from the root down to `entity_type`
	pub fn chain(&self, entity_type: &str) -> Result<Vec<&EntityDescriptor>> {
		let node = self.node(entity_type)?;
		node.chain.iter().map(|name| self.get(name)).collect()
	}

	/// Every subtype of `entity_type` in depth-first declaration order,
	/// excluding the type itself
	pub fn descendants(&self, entity_type: &str) -> Result<Vec<&EntityDescriptor>> {
		let node = self.node(entity_type)?;
		let mut out = Vec::new();
		let mut stack: Vec<&str> = node.children.iter().rev().map(String::as_str).collect();
		while let Some(name) = stack.pop() {
			let child = self.node(name)?;
			out.push(&child.descriptor);
			stack.extend(child.children.iter().rev().map(String::as_str));
		}
		Ok(out)
	}

	pub fn has_subclasses(&self, entity_type: &str) -> bool {
		self.types
			.get(entity_type)
			.is_some_and(|node| !node.children.is_empty())
	}

	/// Whether `entity_type` is `ancestor` or one of its subtypes
	pub fn is_subtype_of(&self, entity_type: &str, ancestor: &str) -> bool {
		self.types
			.get(entity_type)
			.is_some_and(|node| node.chain.iter().any(|name| name == ancestor))
	}

	/// Only concrete leaf types can be proxied: for any other type the
	/// concrete class of a reference is unknown until its row is read.
	pub fn can_proxy(&self, entity_type: &str) -> bool {
		self.types
			.get(entity_type)
			.is_some_and(|node| node.children.is_empty() && !node.descriptor.is_abstract)
	}

	pub fn identifier(&self, entity_type: &str) -> Result<&IdentifierDef> {
		let root = self.root_of(entity_type)?;
		root.identifier.as_ref().ok_or_else(|| {
			CtiError::planning(format!("root '{}' does not declare an identifier", root.name))
		})
	}

	pub fn discriminator_map(&self, entity_type: &str) -> Result<&DiscriminatorMap> {
		let root = self.root_name(entity_type)?;
		self.discriminators
			.get(root)
			.ok_or_else(|| CtiError::UnknownType(root.to_string()))
	}

	/// Find a field on the type's chain, returning the declaring level too
	pub fn field(&self, entity_type: &str, name: &str) -> Option<(&EntityDescriptor, &FieldDef)> {
		let chain = self.chain(entity_type).ok()?;
		chain
			.into_iter()
			.find_map(|level| level.own_field(name).map(|field| (level, field)))
	}

	/// Find an association on the type's chain, returning the declaring level too
	pub fn association(
		&self,
		entity_type: &str,
		name: &str,
	) -> Option<(&EntityDescriptor, &AssociationDef)> {
		let chain = self.chain(entity_type).ok()?;
		chain
			.into_iter()
			.find_map(|level| level.own_association(name).map(|assoc| (level, assoc)))
	}

	/// Resolve the side of an association that stores the link
	pub fn owning_side<'a>(
		&'a self,
		association: &'a AssociationDef,
	) -> Result<(&'a EntityDescriptor, &'a AssociationDef)> {
		match &association.mapping {
			AssociationMapping::MappedBy(owner) => {
				self.association(&association.target, owner).ok_or_else(|| {
					CtiError::planning(format!(
						"association '{}' is mapped by unknown '{}.{owner}'",
						association.name, association.target
					))
				})
			}
			_ => Err(CtiError::planning(format!(
				"association '{}' is not an inverse side",
				association.name
			))),
		}
	}

	/// Link tables whose rows reference an entity of any of `types`, paired
	/// with the column that holds that entity's identifier
	pub fn join_tables_for(&self, types: &[&str]) -> Vec<(JoinTableDef, String)> {
		let lineage: HashSet<&str> = types
			.iter()
			.filter_map(|t| self.types.get(*t))
			.flat_map(|node| node.chain.iter().map(String::as_str))
			.collect();

		let mut out: Vec<(JoinTableDef, String)> = Vec::new();
		for node in self.types.values() {
			let declaring = node.descriptor.name.as_str();
			for assoc in &node.descriptor.associations {
				let Some(table) = assoc.join_table() else {
					continue;
				};
				let mut columns = Vec::new();
				if lineage.contains(declaring) {
					columns.push(table.owner_column.clone());
				}
				if lineage.contains(assoc.target.as_str()) {
					columns.push(table.target_column.clone());
				}
				for column in columns {
					let entry = (table.clone(), column);
					if !out.contains(&entry) {
						out.push(entry);
					}
				}
			}
		}
		out
	}

	fn validate_roots(&self) -> Result<()> {
		for node in self.types.values() {
			let d = &node.descriptor;
			if d.is_root() {
				if d.identifier.is_none() {
					return Err(CtiError::planning(format!(
						"root entity '{}' must declare an identifier",
						d.name
					)));
				}
				if !node.children.is_empty() && d.discriminator_column.is_none() {
					return Err(CtiError::planning(format!(
						"root entity '{}' has subtypes but no discriminator column",
						d.name
					)));
				}
			} else if d.identifier.is_some() || d.discriminator_column.is_some() {
				return Err(CtiError::planning(format!(
					"only a hierarchy root may declare the identifier or discriminator column ('{}')",
					d.name
				)));
			}
		}
		Ok(())
	}

	fn build_discriminators(&mut self) -> Result<()> {
		let mut maps: HashMap<String, DiscriminatorMap> = HashMap::new();
		for node in self.types.values() {
			let d = &node.descriptor;
			let root_name = node.chain.first().cloned().unwrap_or_else(|| d.name.clone());
			let root = &self.types[&root_name].descriptor;
			let map = maps
				.entry(root_name.clone())
				.or_insert_with(|| DiscriminatorMap::new(root_name.clone(), root.discriminator_column.clone()));

			match &d.discriminator_value {
				Some(value) => map.insert(value, &d.name)?,
				None => {
					let single_type = d.is_root() && node.children.is_empty();
					if !d.is_abstract && !single_type {
						return Err(CtiError::planning(format!(
							"concrete entity '{}' has no discriminator value",
							d.name
						)));
					}
				}
			}
		}
		self.discriminators = maps;
		Ok(())
	}

	fn validate_names(&self) -> Result<()> {
		for (name, node) in &self.types {
			let mut seen: HashSet<&str> = HashSet::new();
			for level_name in &node.chain {
				let level = &self.types[level_name].descriptor;
				let own_names = level
					.identifier
					.iter()
					.map(|id| id.field.as_str())
					.chain(level.fields.iter().map(|f| f.name.as_str()))
					.chain(level.associations.iter().map(|a| a.name.as_str()));
				for field in own_names {
					if !seen.insert(field) {
						return Err(CtiError::planning(format!(
							"field '{field}' of '{level_name}' collides with an inherited name on '{name}'"
						)));
					}
				}
			}

			let d = &node.descriptor;
			let id_column = self.identifier(name)?.column.as_str();
			let mut columns: HashSet<&str> = HashSet::from([id_column]);
			if let Some(discr) = d.discriminator_column.as_deref() {
				columns.insert(discr);
			}
			let own_columns = d
				.fields
				.iter()
				.map(|f| f.column.as_str())
				.chain(d.associations.iter().filter_map(AssociationDef::join_column));
			for column in own_columns {
				if !columns.insert(column) {
					return Err(CtiError::planning(format!(
						"column '{column}' is mapped twice in table '{}'",
						d.table
					)));
				}
			}
		}
		Ok(())
	}

	fn validate_associations(&self) -> Result<()> {
		for node in self.types.values() {
			let d = &node.descriptor;
			for assoc in &d.associations {
				if !self.types.contains_key(&assoc.target) {
					return Err(CtiError::planning(format!(
						"association '{}.{}' targets unknown entity '{}'",
						d.name, assoc.name, assoc.target
					)));
				}
				match (&assoc.mapping, assoc.kind) {
					(AssociationMapping::JoinColumn(_), AssociationKind::ManyToOne)
					| (AssociationMapping::JoinColumn(_), AssociationKind::OneToOne)
					| (AssociationMapping::JoinTable(_), AssociationKind::ManyToMany) => {}
					(AssociationMapping::MappedBy(_), AssociationKind::ManyToOne) => {
						return Err(CtiError::planning(format!(
							"many-to-one '{}.{}' must own its join column",
							d.name, assoc.name
						)));
					}
					(AssociationMapping::MappedBy(_), kind) => {
						let (_, owner) = self.owning_side(assoc)?;
						let expected = match kind {
							AssociationKind::OneToMany => AssociationKind::ManyToOne,
							other => other,
						};
						if owner.kind != expected || owner.mapped_by().is_some() {
							return Err(CtiError::planning(format!(
								"'{}.{}' is mapped by '{}', which is not an owning {:?}",
								d.name, assoc.name, owner.name, expected
							)));
						}
						if !self.is_subtype_of(&d.name, &owner.target) {
							return Err(CtiError::planning(format!(
								"'{}.{}' is mapped by '{}', which targets '{}'",
								d.name, assoc.name, owner.name, owner.target
							)));
						}
					}
					(mapping, kind) => {
						return Err(CtiError::planning(format!(
							"association '{}.{}' cannot use {mapping:?} for {kind:?}",
							d.name, assoc.name
						)));
					}
				}
				if let Some((field, _)) = &assoc.order_by {
					if self.field(&assoc.target, field).is_none()
						&& self.identifier(&assoc.target)?.field != *field
					{
						return Err(CtiError::planning(format!(
							"association '{}.{}' orders by unknown field '{field}'",
							d.name, assoc.name
						)));
					}
				}
			}
		}
		Ok(())
	}
}

fn resolve_chain(types: &IndexMap<String, TypeNode>, name: &str) -> Result<Vec<String>> {
	let mut chain = vec![name.to_string()];
	let mut visited: HashSet<&str> = HashSet::from([name]);
	let mut current = &types[name].descriptor;
	while let Some(parent) = current.parent.as_deref() {
		let Some(parent_node) = types.get(parent) else {
			return Err(CtiError::planning(format!(
				"entity '{}' extends unknown entity '{parent}'",
				current.name
			)));
		};
		if !visited.insert(parent) {
			return Err(CtiError::planning(format!(
				"inheritance cycle detected at entity '{parent}'"
			)));
		}
		chain.push(parent.to_string());
		current = &parent_node.descriptor;
	}
	chain.reverse();
	Ok(chain)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::metadata::{FieldDef, IdStrategy};
	use crate::value::FieldType;
	use rstest::rstest;

	fn person() -> EntityDescriptor {
		EntityDescriptor::root("person", "company_persons")
			.identifier("id", FieldType::Integer, IdStrategy::Identity)
			.discriminator_column("discr")
			.discriminator("person")
			.field(FieldDef::new("name", FieldType::Text))
			.association(AssociationDef::one_to_one("spouse", "person", "spouse_id"))
			.association(AssociationDef::many_to_many(
				"friends",
				"person",
				JoinTableDef::new("company_persons_friends", "person_id", "friend_id"),
			))
	}

	fn employee() -> EntityDescriptor {
		EntityDescriptor::child("employee", "person", "company_employees")
			.discriminator("employee")
			.field(FieldDef::new("salary", FieldType::Integer))
	}

	fn manager() -> EntityDescriptor {
		EntityDescriptor::child("manager", "employee", "company_managers")
			.discriminator("manager")
			.field(FieldDef::new("title", FieldType::Text))
	}

	fn company() -> MappingRegistry {
		MappingRegistry::build([person(), employee(), manager()]).unwrap()
	}

	#[test]
	fn test_hierarchy_relations() {
		let registry = company();
		let chain: Vec<&str> = registry
			.chain("manager")
			.unwrap()
			.iter()
			.map(|d| d.name.as_str())
			.collect();
		assert_eq!(chain, ["person", "employee", "manager"]);

		let descendants: Vec<&str> = registry
			.descendants("person")
			.unwrap()
			.iter()
			.map(|d| d.name.as_str())
			.collect();
		assert_eq!(descendants, ["employee", "manager"]);

		assert_eq!(registry.root_name("manager").unwrap(), "person");
		assert!(registry.is_subtype_of("manager", "employee"));
		assert!(!registry.is_subtype_of("employee", "manager"));
		assert!(registry.has_subclasses("person"));
		assert!(registry.can_proxy("manager"));
		assert!(!registry.can_proxy("employee"));
	}

	#[test]
	fn test_inherited_lookup_reports_declaring_level() {
		let registry = company();
		let (level, field) = registry.field("manager", "salary").unwrap();
		assert_eq!(level.name, "employee");
		assert_eq!(field.column, "salary");

		let (level, assoc) = registry.association("manager", "spouse").unwrap();
		assert_eq!(level.name, "person");
		assert_eq!(assoc.join_column(), Some("spouse_id"));
		assert!(registry.field("employee", "title").is_none());
	}

	#[test]
	fn test_join_tables_for_self_reference_uses_both_columns() {
		let registry = company();
		let tables = registry.join_tables_for(&["manager"]);
		let columns: Vec<&str> = tables.iter().map(|(_, c)| c.as_str()).collect();
		assert_eq!(columns, ["person_id", "friend_id"]);
	}

	#[rstest]
	#[case::unknown_parent(vec![person(), EntityDescriptor::child("x", "nobody", "t").discriminator("x")])]
	#[case::duplicate_discriminator(vec![person(), EntityDescriptor::child("intern", "person", "t").discriminator("person")])]
	#[case::missing_discriminator(vec![person(), EntityDescriptor::child("intern", "person", "t")])]
	#[case::inherited_name_collision(vec![person(), employee(), manager().field(FieldDef::new("name", FieldType::Text))])]
	#[case::missing_table(vec![person(), EntityDescriptor::child("intern", "person", "").discriminator("intern")])]
	#[case::unknown_target(vec![person().association(AssociationDef::many_to_one("car", "car", "car_id"))])]
	#[case::bad_mapped_by(vec![person().association(AssociationDef::one_to_many("children", "person", "parent"))])]
	fn test_invalid_mappings(#[case] descriptors: Vec<EntityDescriptor>) {
		let err = MappingRegistry::build(descriptors).unwrap_err();
		assert!(matches!(err, CtiError::Planning(_)), "got {err:?}");
	}

	#[test]
	fn test_inheritance_cycle_detected() {
		let a = EntityDescriptor::child("a", "b", "ta").discriminator("a");
		let b = EntityDescriptor::child("b", "a", "tb").discriminator("b");
		let err = MappingRegistry::build([a, b]).unwrap_err();
		assert!(err.to_string().contains("cycle"), "{err}");
	}

	#[test]
	fn test_single_type_hierarchy_needs_no_discriminator() {
		let registry = MappingRegistry::build([EntityDescriptor::root(
			"organization",
			"company_organizations",
		)
		.identifier("id", FieldType::Integer, IdStrategy::Identity)])
		.unwrap();
		let map = registry.discriminator_map("organization").unwrap();
		assert_eq!(map.column(), None);
	}

	#[test]
	fn test_mapped_by_must_point_back() {
		let organization = EntityDescriptor::root("organization", "company_organizations")
			.identifier("id", FieldType::Integer, IdStrategy::Identity)
			.association(AssociationDef::one_to_many("events", "event", "organization"));
		let event = EntityDescriptor::root("event", "company_events")
			.identifier("id", FieldType::Integer, IdStrategy::Identity)
			.association(AssociationDef::many_to_one("organization", "organization", "org_id"));
		let registry = MappingRegistry::build([organization.clone(), event]).unwrap();
		let (_, events) = registry.association("organization", "events").unwrap();
		let (owner, back) = registry.owning_side(events).unwrap();
		assert_eq!(owner.name, "event");
		assert_eq!(back.join_column(), Some("org_id"));

		let unrelated = EntityDescriptor::root("event", "company_events")
			.identifier("id", FieldType::Integer, IdStrategy::Identity)
			.association(AssociationDef::many_to_one("organization", "person", "org_id"));
		let err = MappingRegistry::build([organization, unrelated, person()]).unwrap_err();
		assert!(err.to_string().contains("targets 'person'"), "{err}");
	}
}
