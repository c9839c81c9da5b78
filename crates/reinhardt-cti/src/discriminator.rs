//! Discriminator resolution
//!
//! Maps the raw discriminator column value read from the root table to the
//! concrete entity type it names. Matching is exact: an unknown value is an
//! integrity error and never falls back to the root type.

use crate::error::{CtiError, Result};
use crate::value::Value;
use std::collections::HashMap;

/// Discriminator values of one inheritance hierarchy
#[derive(Debug, Clone)]
pub struct DiscriminatorMap {
	root: String,
	column: Option<String>,
	by_value: HashMap<String, String>,
	by_type: HashMap<String, String>,
}

impl DiscriminatorMap {
	pub(crate) fn new(root: impl Into<String>, column: Option<String>) -> Self {
		Self {
			root: root.into(),
			column,
			by_value: HashMap::new(),
			by_type: HashMap::new(),
		}
	}

	pub(crate) fn insert(&mut self, value: &str, entity_type: &str) -> Result<()> {
		if let Some(existing) = self.by_value.get(value) {
			return Err(CtiError::planning(format!(
				"discriminator value '{value}' is used by both '{existing}' and '{entity_type}'"
			)));
		}
		self.by_value.insert(value.to_string(), entity_type.to_string());
		self.by_type.insert(entity_type.to_string(), value.to_string());
		Ok(())
	}

	pub fn root(&self) -> &str {
		&self.root
	}

	/// Discriminator column in the root table, `None` for single-type hierarchies
	pub fn column(&self) -> Option<&str> {
		self.column.as_deref()
	}

	/// Resolve a raw column value to the concrete type name
	///
	/// # Examples
	///
	/// ```rust
	/// use reinhardt_cti::metadata::{EntityDescriptor, IdStrategy, MappingRegistry};
	/// use reinhardt_cti::{FieldType, Value};
	///
	/// let registry = MappingRegistry::build([
	/// 	EntityDescriptor::root("event", "company_events")
	/// 		.identifier("id", FieldType::Integer, IdStrategy::Identity)
	/// 		.discriminator_column("event_type")
	/// 		.abstract_type(),
	/// 	EntityDescriptor::child("auction", "event", "company_auctions").discriminator("auction"),
	/// ])
	/// .unwrap();
	///
	/// let map = registry.discriminator_map("event").unwrap();
	/// assert_eq!(map.resolve(&Value::from("auction")).unwrap(), "auction");
	/// assert!(map.resolve(&Value::from("raffle")).is_err());
	/// ```
	pub fn resolve(&self, raw: &Value) -> Result<&str> {
		if self.column.is_none() {
			return Ok(&self.root);
		}
		let key = match raw {
			Value::Text(s) => s.clone(),
			Value::Int(i) => i.to_string(),
			Value::Null => return Err(self.unmapped("NULL")),
			other => other.to_string(),
		};
		self.by_value
			.get(&key)
			.map(String::as_str)
			.ok_or_else(|| self.unmapped(&key))
	}

	pub fn value_for(&self, entity_type: &str) -> Option<&str> {
		self.by_type.get(entity_type).map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.by_value.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_value.is_empty()
	}

	fn unmapped(&self, value: &str) -> CtiError {
		CtiError::UnmappedDiscriminator {
			root: self.root.clone(),
			value: value.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn person_map() -> DiscriminatorMap {
		let mut map = DiscriminatorMap::new("person", Some("discr".to_string()));
		map.insert("person", "person").unwrap();
		map.insert("employee", "employee").unwrap();
		map.insert("manager", "manager").unwrap();
		map
	}

	#[test]
	fn test_resolve_exact_match() {
		let map = person_map();
		assert_eq!(map.resolve(&Value::from("manager")).unwrap(), "manager");
		assert_eq!(map.value_for("employee"), Some("employee"));
		assert_eq!(map.len(), 3);
	}

	#[test]
	fn test_unknown_value_does_not_fall_back_to_root() {
		let map = person_map();
		let err = map.resolve(&Value::from("Manager")).unwrap_err();
		assert!(matches!(
			err,
			CtiError::UnmappedDiscriminator { ref value, .. } if value == "Manager"
		));
		assert!(map.resolve(&Value::Null).is_err());
	}

	#[test]
	fn test_integer_discriminators() {
		let mut map = DiscriminatorMap::new("vehicle", Some("kind".to_string()));
		map.insert("1", "car").unwrap();
		assert_eq!(map.resolve(&Value::Int(1)).unwrap(), "car");
	}

	#[test]
	fn test_duplicate_value_rejected() {
		let mut map = person_map();
		assert!(matches!(map.insert("person", "intern"), Err(CtiError::Planning(_))));
	}

	#[test]
	fn test_single_type_hierarchy_always_resolves_root() {
		let map = DiscriminatorMap::new("organization", None);
		assert_eq!(map.resolve(&Value::Null).unwrap(), "organization");
	}
}
