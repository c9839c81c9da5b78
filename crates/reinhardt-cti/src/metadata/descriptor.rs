//! Declarative descriptors for one entity type level

use crate::error::{CtiError, Result};
use crate::value::{FieldType, Value};
use serde::{Deserialize, Serialize};

/// How the root of a hierarchy obtains identifiers for new rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IdStrategy {
	/// The database generates the identifier (reported back via `RETURNING`)
	#[default]
	Identity,
	/// The caller assigns the identifier before flush
	Assigned,
}

/// Identifier column declared by a hierarchy root and shared by every table
/// of the hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierDef {
	pub field: String,
	pub column: String,
	pub field_type: FieldType,
	pub strategy: IdStrategy,
}

/// A scalar field stored in the declaring type's own table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
	pub name: String,
	pub column: String,
	pub field_type: FieldType,
	pub nullable: bool,
}

impl FieldDef {
	/// A nullable field whose column has the same name as the field
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		let name = name.into();
		Self {
			column: name.clone(),
			name,
			field_type,
			nullable: true,
		}
	}

	pub fn column(mut self, column: impl Into<String>) -> Self {
		self.column = column.into();
		self
	}

	pub fn not_null(mut self) -> Self {
		self.nullable = false;
		self
	}

	/// Coerce a value to be written to this field's column; NULL is a
	/// constraint violation for a `not_null` field
	pub fn bind(&self, entity_type: &str, value: Value) -> Result<Value> {
		let value = value.coerce(self.field_type)?;
		if value.is_null() && !self.nullable {
			return Err(CtiError::ConstraintViolation(format!(
				"'{entity_type}.{}' cannot be NULL",
				self.name
			)));
		}
		Ok(value)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociationKind {
	ManyToOne,
	OneToOne,
	OneToMany,
	ManyToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FetchMode {
	#[default]
	Lazy,
	Eager,
}

/// Link table of an owning many-to-many association
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinTableDef {
	pub table: String,
	/// Column referencing the owning side's identifier
	pub owner_column: String,
	/// Column referencing the target side's identifier
	pub target_column: String,
}

impl JoinTableDef {
	pub fn new(
		table: impl Into<String>,
		owner_column: impl Into<String>,
		target_column: impl Into<String>,
	) -> Self {
		Self {
			table: table.into(),
			owner_column: owner_column.into(),
			target_column: target_column.into(),
		}
	}
}

/// Where the association's link is physically stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssociationMapping {
	/// Foreign key column in the declaring type's table
	JoinColumn(String),
	/// Link table owned by this side
	JoinTable(JoinTableDef),
	/// Inverse side; the named association on the target owns the link
	MappedBy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
	#[default]
	Asc,
	Desc,
}

impl From<SortDirection> for sea_query::Order {
	fn from(direction: SortDirection) -> Self {
		match direction {
			SortDirection::Asc => sea_query::Order::Asc,
			SortDirection::Desc => sea_query::Order::Desc,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationDef {
	pub name: String,
	pub kind: AssociationKind,
	pub target: String,
	pub mapping: AssociationMapping,
	pub fetch: FetchMode,
	pub cascade_persist: bool,
	pub order_by: Option<(String, SortDirection)>,
}

impl AssociationDef {
	fn build(
		name: impl Into<String>,
		kind: AssociationKind,
		target: impl Into<String>,
		mapping: AssociationMapping,
	) -> Self {
		Self {
			name: name.into(),
			kind,
			target: target.into(),
			mapping,
			fetch: FetchMode::Lazy,
			cascade_persist: false,
			order_by: None,
		}
	}

	pub fn many_to_one(
		name: impl Into<String>,
		target: impl Into<String>,
		join_column: impl Into<String>,
	) -> Self {
		Self::build(
			name,
			AssociationKind::ManyToOne,
			target,
			AssociationMapping::JoinColumn(join_column.into()),
		)
	}

	/// Owning one-to-one side holding the foreign key
	pub fn one_to_one(
		name: impl Into<String>,
		target: impl Into<String>,
		join_column: impl Into<String>,
	) -> Self {
		Self::build(
			name,
			AssociationKind::OneToOne,
			target,
			AssociationMapping::JoinColumn(join_column.into()),
		)
	}

	pub fn one_to_one_inverse(
		name: impl Into<String>,
		target: impl Into<String>,
		mapped_by: impl Into<String>,
	) -> Self {
		Self::build(
			name,
			AssociationKind::OneToOne,
			target,
			AssociationMapping::MappedBy(mapped_by.into()),
		)
	}

	pub fn one_to_many(
		name: impl Into<String>,
		target: impl Into<String>,
		mapped_by: impl Into<String>,
	) -> Self {
		Self::build(
			name,
			AssociationKind::OneToMany,
			target,
			AssociationMapping::MappedBy(mapped_by.into()),
		)
	}

	pub fn many_to_many(
		name: impl Into<String>,
		target: impl Into<String>,
		join_table: JoinTableDef,
	) -> Self {
		Self::build(
			name,
			AssociationKind::ManyToMany,
			target,
			AssociationMapping::JoinTable(join_table),
		)
	}

	pub fn many_to_many_inverse(
		name: impl Into<String>,
		target: impl Into<String>,
		mapped_by: impl Into<String>,
	) -> Self {
		Self::build(
			name,
			AssociationKind::ManyToMany,
			target,
			AssociationMapping::MappedBy(mapped_by.into()),
		)
	}

	pub fn fetch(mut self, fetch: FetchMode) -> Self {
		self.fetch = fetch;
		self
	}

	pub fn cascade_persist(mut self) -> Self {
		self.cascade_persist = true;
		self
	}

	pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
		self.order_by = Some((field.into(), direction));
		self
	}

	pub fn is_to_one(&self) -> bool {
		matches!(self.kind, AssociationKind::ManyToOne | AssociationKind::OneToOne)
	}

	pub fn is_collection(&self) -> bool {
		!self.is_to_one()
	}

	pub fn join_column(&self) -> Option<&str> {
		match &self.mapping {
			AssociationMapping::JoinColumn(column) => Some(column),
			_ => None,
		}
	}

	pub fn join_table(&self) -> Option<&JoinTableDef> {
		match &self.mapping {
			AssociationMapping::JoinTable(table) => Some(table),
			_ => None,
		}
	}

	pub fn mapped_by(&self) -> Option<&str> {
		match &self.mapping {
			AssociationMapping::MappedBy(name) => Some(name),
			_ => None,
		}
	}
}

/// Mapping metadata for one type level of an inheritance hierarchy.
///
/// A root declares the identifier and (for hierarchies with subtypes) the
/// discriminator column; every other level names its parent. Each level owns
/// exactly one table holding the fields it declares itself.
///
/// # Examples
///
/// ```rust
/// use reinhardt_cti::metadata::{EntityDescriptor, FieldDef, IdStrategy};
/// use reinhardt_cti::FieldType;
///
/// let person = EntityDescriptor::root("person", "company_persons")
/// 	.identifier("id", FieldType::Integer, IdStrategy::Identity)
/// 	.discriminator_column("discr")
/// 	.discriminator("person")
/// 	.field(FieldDef::new("name", FieldType::Text));
/// let employee = EntityDescriptor::child("employee", "person", "company_employees")
/// 	.discriminator("employee")
/// 	.field(FieldDef::new("salary", FieldType::Integer));
///
/// assert!(person.is_root());
/// assert_eq!(employee.parent.as_deref(), Some("person"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
	pub name: String,
	pub parent: Option<String>,
	pub table: String,
	pub fields: Vec<FieldDef>,
	pub associations: Vec<AssociationDef>,
	pub discriminator_value: Option<String>,
	pub is_abstract: bool,
	pub identifier: Option<IdentifierDef>,
	pub discriminator_column: Option<String>,
}

impl EntityDescriptor {
	pub fn root(name: impl Into<String>, table: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			parent: None,
			table: table.into(),
			fields: Vec::new(),
			associations: Vec::new(),
			discriminator_value: None,
			is_abstract: false,
			identifier: None,
			discriminator_column: None,
		}
	}

	pub fn child(
		name: impl Into<String>,
		parent: impl Into<String>,
		table: impl Into<String>,
	) -> Self {
		Self {
			parent: Some(parent.into()),
			..Self::root(name, table)
		}
	}

	/// Declare the identifier; the column name defaults to the field name
	pub fn identifier(
		mut self,
		field: impl Into<String>,
		field_type: FieldType,
		strategy: IdStrategy,
	) -> Self {
		let field = field.into();
		self.identifier = Some(IdentifierDef {
			column: field.clone(),
			field,
			field_type,
			strategy,
		});
		self
	}

	pub fn identifier_column(mut self, column: impl Into<String>) -> Self {
		if let Some(identifier) = self.identifier.as_mut() {
			identifier.column = column.into();
		}
		self
	}

	pub fn discriminator_column(mut self, column: impl Into<String>) -> Self {
		self.discriminator_column = Some(column.into());
		self
	}

	pub fn discriminator(mut self, value: impl Into<String>) -> Self {
		self.discriminator_value = Some(value.into());
		self
	}

	pub fn abstract_type(mut self) -> Self {
		self.is_abstract = true;
		self
	}

	pub fn field(mut self, field: FieldDef) -> Self {
		self.fields.push(field);
		self
	}

	pub fn association(mut self, association: AssociationDef) -> Self {
		self.associations.push(association);
		self
	}

	pub fn is_root(&self) -> bool {
		self.parent.is_none()
	}

	pub fn own_field(&self, name: &str) -> Option<&FieldDef> {
		self.fields.iter().find(|f| f.name == name)
	}

	pub fn own_association(&self, name: &str) -> Option<&AssociationDef> {
		self.associations.iter().find(|a| a.name == name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_association_shapes() {
		let spouse = AssociationDef::one_to_one("spouse", "person", "spouse_id");
		assert!(spouse.is_to_one());
		assert_eq!(spouse.join_column(), Some("spouse_id"));

		let friends = AssociationDef::many_to_many(
			"friends",
			"person",
			JoinTableDef::new("company_persons_friends", "person_id", "friend_id"),
		);
		assert!(friends.is_collection());
		assert_eq!(friends.join_table().map(|t| t.table.as_str()), Some("company_persons_friends"));

		let events = AssociationDef::one_to_many("events", "event", "organization")
			.cascade_persist()
			.order_by("id", SortDirection::Desc);
		assert_eq!(events.mapped_by(), Some("organization"));
		assert!(events.cascade_persist);
		assert_eq!(events.fetch, FetchMode::Lazy);
	}

	#[test]
	fn test_not_null_field_rejects_null() {
		let title = FieldDef::new("title", FieldType::Text).not_null();
		assert_eq!(title.bind("manager", Value::from("CTO")).unwrap(), Value::from("CTO"));
		let err = title.bind("manager", Value::Null).unwrap_err();
		assert!(matches!(err, CtiError::ConstraintViolation(_)));

		let name = FieldDef::new("name", FieldType::Text);
		assert_eq!(name.bind("person", Value::Null).unwrap(), Value::Null);
	}

	#[test]
	fn test_identifier_column_override() {
		let root = EntityDescriptor::root("event", "company_events")
			.identifier("id", FieldType::Integer, IdStrategy::Identity)
			.identifier_column("event_id");
		let id = root.identifier.unwrap();
		assert_eq!(id.field, "id");
		assert_eq!(id.column, "event_id");
	}
}
