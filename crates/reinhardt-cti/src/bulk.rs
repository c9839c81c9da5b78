//! Bulk UPDATE and DELETE across inheritance tables
//!
//! A bulk operation on a joined hierarchy cannot be a single statement: the
//! condition may reference fields of any level while the written columns
//! live in one table. Both operations therefore first select the matching
//! identifiers through the full join and then write each table restricted
//! to those identifiers.

use crate::criteria::Predicate;
use crate::error::{CtiError, Result};
use crate::metadata::MappingRegistry;
use crate::planner::{JoinPlan, JoinPlanner};
use crate::value::{PrimaryKey, Value};
use indexmap::IndexMap;
use sea_query::{Alias, DeleteStatement, Expr, Query, SelectStatement, UpdateStatement};

/// Strategy for synchronizing managed instances after a bulk update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynchronizeStrategy {
	/// Apply the assignments to matched instances held by the identity map
	Evaluate,
	/// Leave managed instances as they are (fastest but potentially stale)
	#[default]
	False,
}

/// Bulk update builder for one entity type and its subtypes
///
/// # Examples
///
/// ```
/// use reinhardt_cti::{BulkUpdate, Criteria};
///
/// let update = BulkUpdate::new("employee")
/// 	.set("salary", 1)
/// 	.filter(Criteria::eq("name", "Guilherme Blanco"));
/// assert_eq!(update.entity_type(), "employee");
/// ```
#[derive(Debug)]
pub struct BulkUpdate {
	entity_type: String,
	assignments: IndexMap<String, Value>,
	predicate: Option<Box<dyn Predicate>>,
	synchronize: SynchronizeStrategy,
}

impl BulkUpdate {
	pub fn new(entity_type: impl Into<String>) -> Self {
		Self {
			entity_type: entity_type.into(),
			assignments: IndexMap::new(),
			predicate: None,
			synchronize: SynchronizeStrategy::default(),
		}
	}

	/// Assign a field, or the identifier of a single-valued association
	pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
		self.assignments.insert(field.to_string(), value.into());
		self
	}

	pub fn filter(mut self, predicate: impl Predicate + 'static) -> Self {
		self.predicate = Some(Box::new(predicate));
		self
	}

	pub fn synchronize(mut self, strategy: SynchronizeStrategy) -> Self {
		self.synchronize = strategy;
		self
	}

	pub fn entity_type(&self) -> &str {
		&self.entity_type
	}

	pub fn synchronize_strategy(&self) -> SynchronizeStrategy {
		self.synchronize
	}

	pub(crate) fn assignments(&self) -> &IndexMap<String, Value> {
		&self.assignments
	}

	pub(crate) fn plan(
		&self,
		registry: &MappingRegistry,
		planner: &JoinPlanner<'_>,
	) -> Result<BulkUpdatePlan> {
		if self.assignments.is_empty() {
			return Err(CtiError::planning(format!(
				"bulk update of '{}' assigns nothing",
				self.entity_type
			)));
		}
		let identifier = registry.identifier(&self.entity_type)?;
		let mut tables: IndexMap<String, Vec<(String, Value)>> = IndexMap::new();
		for (name, value) in &self.assignments {
			if *name == identifier.field {
				return Err(CtiError::planning(format!(
					"bulk update cannot assign the identifier of '{}'",
					self.entity_type
				)));
			}
			let (table, column, value) = if let Some((level, field)) = registry.field(&self.entity_type, name) {
				(level.table.clone(), field.column.clone(), field.bind(&self.entity_type, value.clone())?)
			} else if let Some((level, assoc)) = registry.association(&self.entity_type, name) {
				let column = assoc.join_column().ok_or_else(|| {
					CtiError::planning(format!(
						"association '{name}' of '{}' has no join column to assign",
						self.entity_type
					))
				})?;
				let target_type = registry.identifier(&assoc.target)?.field_type;
				(level.table.clone(), column.to_string(), value.clone().coerce(target_type)?)
			} else {
				return Err(CtiError::unknown_field(&self.entity_type, name));
			};
			tables.entry(table).or_default().push((column, value));
		}

		// Root to leaf, whatever order the assignments were made in
		let tables = registry
			.chain(&self.entity_type)?
			.iter()
			.filter_map(|level| tables.shift_remove_entry(&level.table))
			.collect();
		let select = select_ids(planner, &self.entity_type, self.predicate.as_deref())?;
		Ok(BulkUpdatePlan {
			select,
			pk_column: identifier.column.clone(),
			tables,
		})
	}
}

/// Bulk delete builder for one entity type and its subtypes
#[derive(Debug)]
pub struct BulkDelete {
	entity_type: String,
	predicate: Option<Box<dyn Predicate>>,
}

impl BulkDelete {
	pub fn new(entity_type: impl Into<String>) -> Self {
		Self {
			entity_type: entity_type.into(),
			predicate: None,
		}
	}

	pub fn filter(mut self, predicate: impl Predicate + 'static) -> Self {
		self.predicate = Some(Box::new(predicate));
		self
	}

	pub fn entity_type(&self) -> &str {
		&self.entity_type
	}

	pub(crate) fn plan(
		&self,
		registry: &MappingRegistry,
		planner: &JoinPlanner<'_>,
	) -> Result<BulkDeletePlan> {
		let identifier = registry.identifier(&self.entity_type)?;
		let chain = registry.chain(&self.entity_type)?;
		let descendants = registry.descendants(&self.entity_type)?;

		let mut types: Vec<&str> = vec![self.entity_type.as_str()];
		types.extend(descendants.iter().map(|d| d.name.as_str()));
		let join_tables = registry
			.join_tables_for(&types)
			.into_iter()
			.map(|(table, column)| (table.table, column))
			.collect();

		// Children before parents: descendants deepest first, then the chain
		// from the requested type up to the root
		let tables = descendants
			.iter()
			.rev()
			.chain(chain.iter().rev())
			.map(|level| level.table.clone())
			.collect();

		Ok(BulkDeletePlan {
			select: select_ids(planner, &self.entity_type, self.predicate.as_deref())?,
			pk_column: identifier.column.clone(),
			join_tables,
			tables,
		})
	}
}

fn select_ids(
	planner: &JoinPlanner<'_>,
	entity_type: &str,
	predicate: Option<&dyn Predicate>,
) -> Result<IdSelect> {
	let plan = planner.plan(entity_type, None)?;
	let mut statement = plan.id_statement();
	if let Some(predicate) = predicate {
		statement.and_where(predicate.to_condition(&plan)?);
	}
	Ok(IdSelect { plan, statement })
}

pub(crate) struct IdSelect {
	pub(crate) plan: JoinPlan,
	pub(crate) statement: SelectStatement,
}

pub(crate) struct BulkUpdatePlan {
	pub(crate) select: IdSelect,
	pk_column: String,
	/// Assignments grouped by the table that stores them
	tables: Vec<(String, Vec<(String, Value)>)>,
}

impl BulkUpdatePlan {
	/// One UPDATE per written table, restricted to `ids`
	pub(crate) fn statements(&self, ids: &[PrimaryKey]) -> Vec<UpdateStatement> {
		self.tables
			.iter()
			.map(|(table, values)| {
				let mut stmt = Query::update();
				stmt.table(Alias::new(table));
				for (column, value) in values {
					stmt.value(Alias::new(column), sea_query::Value::from(value.clone()));
				}
				stmt.and_where(in_ids(&self.pk_column, ids));
				stmt
			})
			.collect()
	}
}

pub(crate) struct BulkDeletePlan {
	pub(crate) select: IdSelect,
	pk_column: String,
	join_tables: Vec<(String, String)>,
	tables: Vec<String>,
}

impl BulkDeletePlan {
	/// Join table rows first, then entity rows from the most specific table
	/// up to the root
	pub(crate) fn statements(&self, ids: &[PrimaryKey]) -> Vec<DeleteStatement> {
		let link_rows = self.join_tables.iter().map(|(table, column)| (table, column));
		let entity_rows = self.tables.iter().map(|table| (table, &self.pk_column));
		link_rows
			.chain(entity_rows)
			.map(|(table, column)| {
				let mut stmt = Query::delete();
				stmt.from_table(Alias::new(table)).and_where(in_ids(column, ids));
				stmt
			})
			.collect()
	}
}

fn in_ids(column: &str, ids: &[PrimaryKey]) -> sea_query::SimpleExpr {
	Expr::col(Alias::new(column)).is_in(
		ids.iter()
			.map(|id| sea_query::Value::from(Value::from(id)))
			.collect::<Vec<_>>(),
	)
}
