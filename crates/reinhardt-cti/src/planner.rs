//! Table-join planning
//!
//! For a requested entity type the planner decides which tables to read and
//! how to join them:
//!
//! - the hierarchy root is the base table and always carries the
//!   discriminator column;
//! - every ancestor of the requested type, and the type itself, is joined
//!   with an INNER JOIN because each of those rows must exist;
//! - every descendant of the requested type is joined with a LEFT JOIN so
//!   rows of more specific types can be recognized and fully hydrated.
//!
//! A leaf type therefore reads exactly its chain, and a root with subtypes
//! reads every table of the hierarchy. Each selected column gets a unique
//! label of the form `{alias}{separator}{column}`.
//!
//! Fetch joins add an association's target hierarchy to the same statement
//! with LEFT JOINs only, under a separate alias prefix. Reads planned with
//! [`JoinPlanner::plan_read`] fetch join every owning eager single-valued
//! association, and the eager associations of those targets in turn, up to
//! the configured eager depth.

use crate::config::PersisterConfig;
use crate::criteria::{ColumnResolver, ResolvedColumn};
use crate::error::{CtiError, Result};
use crate::metadata::{AssociationDef, AssociationMapping, EntityDescriptor, FetchMode, MappingRegistry};
use crate::value::FieldType;
use sea_query::{Alias, Expr, JoinType, Query, SelectStatement, SimpleExpr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableJoinKind {
	/// The FROM table
	Base,
	Inner,
	Left,
}

/// One physical table in a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTable {
	pub entity_type: String,
	pub table: String,
	pub alias: String,
	pub join: TableJoinKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
	/// A scalar field
	Field,
	/// The foreign key of an owning single-valued association
	Link,
}

/// A column projected into the result set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedColumn {
	pub label: String,
	pub alias: String,
	pub column: String,
	/// Entity type whose table declares the column
	pub owner: String,
	/// Field or association name
	pub name: String,
	pub field_type: FieldType,
	pub role: ColumnRole,
}

/// Link table joined in front of a many-to-many fetch join
#[derive(Debug, Clone)]
pub struct LinkTable {
	pub table: String,
	pub alias: String,
	pub condition: SimpleExpr,
}

/// An association whose target hierarchy is read in the owner's statement
#[derive(Debug, Clone)]
pub struct FetchJoin {
	pub association: String,
	pub collection: bool,
	/// The association stores no key on the owner side
	pub inverse: bool,
	pub link: Option<LinkTable>,
	/// Join condition of the target's anchor table
	pub anchor_condition: SimpleExpr,
	pub target: JoinPlan,
}

/// Tables, columns and labels needed to read one entity type
#[derive(Debug, Clone)]
pub struct JoinPlan {
	pub entity_type: String,
	pub root: String,
	pub tables: Vec<PlannedTable>,
	pub pk_column: String,
	pub id_field: String,
	pub id_type: FieldType,
	pub id_label: String,
	pub discriminator_label: Option<String>,
	discriminator_column: Option<String>,
	pub columns: Vec<SelectedColumn>,
	pub fetch_joins: Vec<FetchJoin>,
	/// Table the other tables are joined against
	anchor: usize,
	/// Alias prefix of this plan's own fetch joins
	fetch_prefix: String,
	/// Every field and link of the planned tables, selected or not
	resolvable: Vec<(String, ResolvedColumn)>,
}

impl JoinPlan {
	pub fn alias_of(&self, entity_type: &str) -> Option<&str> {
		self.tables
			.iter()
			.find(|t| t.entity_type == entity_type)
			.map(|t| t.alias.as_str())
	}

	pub fn base_alias(&self) -> &str {
		&self.tables[self.anchor].alias
	}

	/// Label of a selected field or link column
	pub fn label_of(&self, owner: &str, name: &str) -> Option<&str> {
		self.columns
			.iter()
			.find(|c| c.owner == owner && c.name == name)
			.map(|c| c.label.as_str())
	}

	pub fn fetch_join(&self, association: &str) -> Option<&FetchJoin> {
		self.fetch_joins.iter().find(|f| f.association == association)
	}

	pub fn table_names(&self) -> Vec<&str> {
		self.tables.iter().map(|t| t.table.as_str()).collect()
	}

	fn id_expr(&self, alias: &str) -> Expr {
		Expr::col((Alias::new(alias), Alias::new(&self.pk_column)))
	}

	/// Identifier column of the base table
	pub fn base_id_expr(&self) -> Expr {
		self.id_expr(self.base_alias())
	}

	/// SELECT over every planned table, projecting all plan columns
	pub fn select_statement(&self) -> SelectStatement {
		let mut stmt = Query::select();
		let base = &self.tables[self.anchor];
		stmt.from_as(Alias::new(&base.table), Alias::new(&base.alias));
		self.join_tables(&mut stmt, false);
		self.project(&mut stmt);
		self.join_fetches(&mut stmt);
		stmt
	}

	fn join_fetches(&self, stmt: &mut SelectStatement) {
		for fetch in &self.fetch_joins {
			if let Some(link) = &fetch.link {
				stmt.join_as(
					JoinType::LeftJoin,
					Alias::new(&link.table),
					Alias::new(&link.alias),
					link.condition.clone(),
				);
			}
			let anchor = &fetch.target.tables[fetch.target.anchor];
			stmt.join_as(
				JoinType::LeftJoin,
				Alias::new(&anchor.table),
				Alias::new(&anchor.alias),
				fetch.anchor_condition.clone(),
			);
			fetch.target.join_tables(stmt, true);
			fetch.target.project(stmt);
			fetch.target.join_fetches(stmt);
		}
	}

	/// SELECT of the distinct base identifiers matching the plan's joins
	pub fn id_statement(&self) -> SelectStatement {
		let mut stmt = Query::select();
		let base = &self.tables[self.anchor];
		stmt.distinct()
			.expr_as(self.base_id_expr(), Alias::new(&self.id_label))
			.from_as(Alias::new(&base.table), Alias::new(&base.alias));
		self.join_tables(&mut stmt, false);
		stmt
	}

	fn join_tables(&self, stmt: &mut SelectStatement, outer: bool) {
		let anchor = &self.tables[self.anchor].alias;
		for (index, table) in self.tables.iter().enumerate() {
			if index == self.anchor {
				continue;
			}
			let join = match (outer, table.join) {
				(false, TableJoinKind::Inner) => JoinType::InnerJoin,
				_ => JoinType::LeftJoin,
			};
			stmt.join_as(
				join,
				Alias::new(&table.table),
				Alias::new(&table.alias),
				self.id_expr(&table.alias)
					.equals((Alias::new(anchor), Alias::new(&self.pk_column))),
			);
		}
	}

	fn project(&self, stmt: &mut SelectStatement) {
		stmt.expr_as(self.base_id_expr(), Alias::new(&self.id_label));
		if let (Some(label), Some(column)) = (&self.discriminator_label, &self.discriminator_column) {
			stmt.expr_as(
				Expr::col((Alias::new(self.base_alias()), Alias::new(column))),
				Alias::new(label),
			);
		}
		for column in &self.columns {
			stmt.expr_as(
				Expr::col((Alias::new(&column.alias), Alias::new(&column.column))),
				Alias::new(&column.label),
			);
		}
	}
}

impl ColumnResolver for JoinPlan {
	fn resolve_column(&self, path: &str) -> Result<ResolvedColumn> {
		if let Some((association, rest)) = path.split_once('.') {
			let fetch = self.fetch_join(association).ok_or_else(|| {
				CtiError::planning(format!(
					"'{path}' requires a fetch join on '{}.{association}'",
					self.entity_type
				))
			})?;
			return fetch.target.resolve_column(rest);
		}
		if path == self.id_field {
			return Ok(ResolvedColumn {
				alias: self.base_alias().to_string(),
				column: self.pk_column.clone(),
				field_type: Some(self.id_type),
			});
		}
		self.resolvable
			.iter()
			.find(|(name, _)| name == path)
			.map(|(_, column)| column.clone())
			.ok_or_else(|| {
				CtiError::planning(format!(
					"field '{path}' does not exist on any table joined for '{}'",
					self.entity_type
				))
			})
	}
}

pub struct JoinPlanner<'a> {
	registry: &'a MappingRegistry,
	separator: &'a str,
	max_eager_depth: usize,
}

impl<'a> JoinPlanner<'a> {
	pub fn new(registry: &'a MappingRegistry, config: &'a PersisterConfig) -> Self {
		Self {
			registry,
			separator: &config.column_alias_separator,
			max_eager_depth: config.max_eager_depth,
		}
	}

	/// Plan a read of `entity_type`, optionally restricted to a projection of
	/// field names. The identifier and discriminator are always selected.
	pub fn plan(&self, entity_type: &str, projection: Option<&[String]>) -> Result<JoinPlan> {
		self.plan_with_prefix(entity_type, projection, "t", "f")
	}

	/// Plan a read of `entity_type` that also fetches its eager single-valued
	/// targets in the same statement
	pub fn plan_read(&self, entity_type: &str, projection: Option<&[String]>) -> Result<JoinPlan> {
		let mut plan = self.plan(entity_type, projection)?;
		self.add_eager_joins(&mut plan, self.max_eager_depth)?;
		Ok(plan)
	}

	fn add_eager_joins(&self, plan: &mut JoinPlan, depth: usize) -> Result<()> {
		if depth == 0 {
			return Ok(());
		}
		let mut eager = Vec::new();
		for table in &plan.tables {
			let level = self.registry.get(&table.entity_type)?;
			for assoc in &level.associations {
				if assoc.fetch == FetchMode::Eager && assoc.join_column().is_some() {
					eager.push((level, assoc));
				}
			}
		}
		for (level, assoc) in eager {
			if plan.fetch_join(&assoc.name).is_some() {
				continue;
			}
			self.join_association(plan, level, assoc)?;
			if let Some(fetch) = plan.fetch_joins.last_mut() {
				self.add_eager_joins(&mut fetch.target, depth - 1)?;
			}
		}
		Ok(())
	}

	fn plan_with_prefix(
		&self,
		entity_type: &str,
		projection: Option<&[String]>,
		prefix: &str,
		fetch_prefix: &str,
	) -> Result<JoinPlan> {
		let chain = self.registry.chain(entity_type)?;
		let descendants = self.registry.descendants(entity_type)?;
		let root = chain[0];
		let identifier = self.registry.identifier(entity_type)?;

		let mut tables = Vec::with_capacity(chain.len() + descendants.len());
		for (index, level) in chain.iter().chain(descendants.iter()).enumerate() {
			let join = if index == 0 {
				TableJoinKind::Base
			} else if index < chain.len() {
				TableJoinKind::Inner
			} else {
				TableJoinKind::Left
			};
			tables.push(PlannedTable {
				entity_type: level.name.clone(),
				table: level.table.clone(),
				alias: format!("{prefix}{index}"),
				join,
			});
		}

		if let Some(fields) = projection {
			for field in fields {
				let known = *field == identifier.field
					|| tables.iter().any(|t| {
						self.registry
							.get(&t.entity_type)
							.is_ok_and(|d| d.own_field(field).is_some())
					});
				if !known {
					return Err(CtiError::planning(format!(
						"field '{field}' does not exist on any table joined for '{entity_type}'"
					)));
				}
			}
		}

		let label = |alias: &str, column: &str| format!("{alias}{}{column}", self.separator);
		let base_alias = tables[0].alias.clone();
		let mut columns = Vec::new();
		let mut resolvable = Vec::new();
		for table in &tables {
			let level = self.registry.get(&table.entity_type)?;
			for field in &level.fields {
				resolvable.push((
					field.name.clone(),
					ResolvedColumn {
						alias: table.alias.clone(),
						column: field.column.clone(),
						field_type: Some(field.field_type),
					},
				));
				if projection.is_some_and(|p| !p.contains(&field.name)) {
					continue;
				}
				columns.push(SelectedColumn {
					label: label(&table.alias, &field.column),
					alias: table.alias.clone(),
					column: field.column.clone(),
					owner: level.name.clone(),
					name: field.name.clone(),
					field_type: field.field_type,
					role: ColumnRole::Field,
				});
			}
			for assoc in &level.associations {
				let Some(join_column) = assoc.join_column() else {
					continue;
				};
				resolvable.push((
					assoc.name.clone(),
					ResolvedColumn {
						alias: table.alias.clone(),
						column: join_column.to_string(),
						field_type: Some(identifier.field_type),
					},
				));
				columns.push(SelectedColumn {
					label: label(&table.alias, join_column),
					alias: table.alias.clone(),
					column: join_column.to_string(),
					owner: level.name.clone(),
					name: assoc.name.clone(),
					field_type: self.registry.identifier(&assoc.target)?.field_type,
					role: ColumnRole::Link,
				});
			}
		}

		Ok(JoinPlan {
			entity_type: entity_type.to_string(),
			root: root.name.clone(),
			pk_column: identifier.column.clone(),
			id_field: identifier.field.clone(),
			id_type: identifier.field_type,
			id_label: label(&base_alias, &identifier.column),
			discriminator_label: root
				.discriminator_column
				.as_deref()
				.map(|column| label(&base_alias, column)),
			discriminator_column: root.discriminator_column.clone(),
			tables,
			columns,
			fetch_joins: Vec::new(),
			anchor: 0,
			fetch_prefix: fetch_prefix.to_string(),
			resolvable,
		})
	}

	/// Read the target of `association` in the same statement.
	///
	/// Requesting the same association twice is a no-op.
	pub fn add_fetch_join(&self, plan: &mut JoinPlan, association: &str) -> Result<()> {
		if plan.fetch_join(association).is_some() {
			return Ok(());
		}
		let (declaring, assoc) = self
			.registry
			.association(&plan.entity_type, association)
			.ok_or_else(|| {
				CtiError::planning(format!(
					"'{}' has no association '{association}' to fetch join",
					plan.entity_type
				))
			})?;
		self.join_association(plan, declaring, assoc)
	}

	fn join_association(
		&self,
		plan: &mut JoinPlan,
		declaring: &EntityDescriptor,
		assoc: &AssociationDef,
	) -> Result<()> {
		let owner_alias = plan.alias_of(&declaring.name).ok_or_else(|| {
			CtiError::planning(format!("table of '{}' is not part of the plan", declaring.name))
		})?;
		let owner_id = (Alias::new(plan.base_alias()), Alias::new(&plan.pk_column));

		let index = plan.fetch_joins.len();
		let prefix = &plan.fetch_prefix;
		let mut target = self.plan_with_prefix(
			&assoc.target,
			None,
			&format!("{prefix}{index}t"),
			&format!("{prefix}{index}f"),
		)?;
		for table in &mut target.tables {
			table.join = TableJoinKind::Left;
		}
		let link_alias = format!("{prefix}{index}j");
		let target_root_id = target.id_expr(&target.tables[0].alias);

		let (link, anchor_condition) = match &assoc.mapping {
			AssociationMapping::JoinColumn(column) => (
				None,
				target_root_id.equals((Alias::new(owner_alias), Alias::new(column))),
			),
			AssociationMapping::JoinTable(join_table) => (
				Some(LinkTable {
					table: join_table.table.clone(),
					alias: link_alias.clone(),
					condition: Expr::col((Alias::new(&link_alias), Alias::new(&join_table.owner_column)))
						.equals(owner_id),
				}),
				target_root_id.equals((Alias::new(&link_alias), Alias::new(&join_table.target_column))),
			),
			AssociationMapping::MappedBy(_) => {
				let (owner_level, owning) = self.registry.owning_side(assoc)?;
				match &owning.mapping {
					AssociationMapping::JoinColumn(column) => {
						let anchor = target
							.tables
							.iter()
							.position(|t| t.entity_type == owner_level.name)
							.ok_or_else(|| {
								CtiError::planning(format!(
									"'{}' does not store '{}'",
									assoc.target, owning.name
								))
							})?;
						let anchor_alias = target.tables[anchor].alias.clone();
						target.anchor = anchor;
						(
							None,
							Expr::col((Alias::new(&anchor_alias), Alias::new(column))).equals(owner_id),
						)
					}
					AssociationMapping::JoinTable(join_table) => (
						Some(LinkTable {
							table: join_table.table.clone(),
							alias: link_alias.clone(),
							condition: Expr::col((
								Alias::new(&link_alias),
								Alias::new(&join_table.target_column),
							))
							.equals(owner_id),
						}),
						target_root_id
							.equals((Alias::new(&link_alias), Alias::new(&join_table.owner_column))),
					),
					AssociationMapping::MappedBy(_) => {
						return Err(CtiError::planning(format!(
							"'{}' is mapped by another inverse side",
							assoc.name
						)));
					}
				}
			}
		};

		plan.fetch_joins.push(FetchJoin {
			association: assoc.name.clone(),
			collection: assoc.is_collection(),
			inverse: assoc.mapped_by().is_some(),
			link,
			anchor_condition,
			target,
		});
		Ok(())
	}
}
