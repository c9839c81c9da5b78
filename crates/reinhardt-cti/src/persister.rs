//! Joined-table persister
//!
//! Orchestrates planning, hydration and identity bookkeeping for reads, and
//! emits the per-table statement sequences for writes:
//!
//! - inserts go root first, every level reusing the root's identifier;
//! - updates touch only the levels holding a changed column;
//! - deletes remove link table rows, then entity rows from the most specific
//!   table up to the root.

use crate::bulk::{BulkDelete, BulkUpdate, IdSelect, SynchronizeStrategy};
use crate::config::PersisterConfig;
use crate::connection::{Connection, params_for_log};
use crate::criteria::{ColumnResolver, Predicate};
use crate::entity::{EntityRef, Lifecycle, ToOneSlot};
use crate::error::{CtiError, Result};
use crate::hydrator::{Deferred, Hydration, Hydrator};
use crate::identity_map::IdentityMap;
use crate::metadata::{AssociationMapping, IdStrategy, MappingRegistry, SortDirection};
use crate::planner::{JoinPlan, JoinPlanner};
use crate::proxy::EntityLoader;
use crate::query_types::QueryStatement;
use crate::value::{IdentityKey, PrimaryKey, Row, Value};
use indexmap::IndexMap;
use sea_query::{Alias, Asterisk, Expr, JoinType, Order, Query, SelectStatement, SimpleExpr};
use std::sync::Weak;

const LINK_ALIAS: &str = "lnk";

/// What to read: type, filter, ordering, fetch joins and paging
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectRequest<'r> {
	pub entity_type: &'r str,
	pub predicate: Option<&'r dyn Predicate>,
	pub order_by: &'r [(String, SortDirection)],
	pub fetch_joins: &'r [String],
	pub projection: Option<&'r [String]>,
	pub limit: Option<u64>,
	pub offset: Option<u64>,
}

impl<'r> SelectRequest<'r> {
	pub fn new(entity_type: &'r str) -> Self {
		Self {
			entity_type,
			..Self::default()
		}
	}
}

pub struct JoinedTablePersister<'a> {
	registry: &'a MappingRegistry,
	connection: &'a dyn Connection,
	identity_map: &'a IdentityMap,
	config: &'a PersisterConfig,
	loader: Weak<dyn EntityLoader>,
}

impl<'a> JoinedTablePersister<'a> {
	pub(crate) fn new(
		registry: &'a MappingRegistry,
		connection: &'a dyn Connection,
		identity_map: &'a IdentityMap,
		config: &'a PersisterConfig,
		loader: Weak<dyn EntityLoader>,
	) -> Self {
		Self {
			registry,
			connection,
			identity_map,
			config,
			loader,
		}
	}

	pub fn planner(&self) -> JoinPlanner<'a> {
		JoinPlanner::new(self.registry, self.config)
	}

	fn hydrator(&self) -> Hydrator<'a> {
		Hydrator::new(self.registry, self.identity_map, self.loader.clone())
	}

	fn render(&self, statement: &QueryStatement) -> (String, Vec<Value>) {
		let (sql, params) = statement.build(self.connection.backend());
		if self.config.log_statements {
			tracing::debug!(
				target: "reinhardt_cti::sql",
				sql = %sql,
				params = %params_for_log(&params),
				"Executing statement"
			);
		}
		(sql, params)
	}

	async fn fetch(&self, statement: QueryStatement) -> Result<Vec<Row>> {
		let (sql, params) = self.render(&statement);
		self.connection.fetch_all(&sql, &params).await
	}

	async fn execute(&self, statement: QueryStatement) -> Result<u64> {
		let (sql, params) = self.render(&statement);
		self.connection.execute(&sql, &params).await
	}

	// Reads

	/// Load an entity by identifier.
	///
	/// An instance already initialized in the identity map is returned
	/// without a query, or `None` when it is not of the requested type.
	pub async fn find(&self, entity_type: &str, id: PrimaryKey) -> Result<Option<EntityRef>> {
		let key = IdentityKey::new(self.registry.root_name(entity_type)?, id.clone());
		if let Some(existing) = self.identity_map.get(&key) {
			if existing.is_initialized() {
				let matches = self.registry.is_subtype_of(existing.entity_type(), entity_type);
				return Ok(matches.then_some(existing));
			}
		}
		let hydration = self.load_by_ids(entity_type, &[id]).await?;
		self.resolve_deferred(hydration.deferred).await?;
		Ok(hydration.entities.into_iter().next())
	}

	/// Populate an uninitialized proxy from its row
	pub async fn initialize(&self, entity: &EntityRef) -> Result<()> {
		let key = entity
			.identity()
			.ok_or_else(|| CtiError::MissingIdentifier(entity.entity_type().to_string()))?;
		let hydration = self.load_by_ids(entity.entity_type(), &[key.id.clone()]).await?;
		if !hydration.entities.iter().any(|loaded| loaded.same(entity)) {
			return Err(CtiError::ProxyResolution {
				entity_type: entity.entity_type().to_string(),
				key: key.to_string(),
			});
		}
		tracing::trace!(entity_type = entity.entity_type(), key = %key, "Initialized proxy");
		self.resolve_deferred(hydration.deferred).await
	}

	/// The instance registered for `key`, loading it through the root type
	/// when the session has none
	pub async fn resolve(&self, key: &IdentityKey) -> Result<EntityRef> {
		if let Some(existing) = self.identity_map.get(key) {
			return Ok(existing);
		}
		self.find(&key.root, key.id.clone())
			.await?
			.ok_or_else(|| CtiError::ProxyResolution {
				entity_type: key.root.clone(),
				key: key.to_string(),
			})
	}

	/// Entities of `entity_type` (and its subtypes) described by `request`
	pub async fn select(&self, request: SelectRequest<'_>) -> Result<Vec<EntityRef>> {
		let planner = self.planner();
		let mut plan = planner.plan_read(request.entity_type, request.projection)?;
		for association in request.fetch_joins {
			planner.add_fetch_join(&mut plan, association)?;
		}
		let mut stmt = plan.select_statement();
		if let Some(predicate) = request.predicate {
			stmt.and_where(predicate.to_condition(&plan)?);
		}
		for (field, direction) in request.order_by {
			stmt.order_by_expr(plan.resolve_column(field)?.expr().into(), (*direction).into());
		}
		stmt.order_by_expr(plan.base_id_expr().into(), Order::Asc);
		if let Some(limit) = request.limit {
			stmt.limit(limit);
		}
		if let Some(offset) = request.offset {
			stmt.offset(offset);
		}

		let hydration = self.run_select(&plan, stmt).await?;
		self.resolve_deferred(hydration.deferred).await?;
		Ok(hydration.entities)
	}

	pub async fn matching(
		&self,
		entity_type: &str,
		predicate: &dyn Predicate,
	) -> Result<Vec<EntityRef>> {
		self.select(SelectRequest {
			predicate: Some(predicate),
			..SelectRequest::new(entity_type)
		})
		.await
	}

	/// Number of distinct entities matching the predicate
	pub async fn count(&self, entity_type: &str, predicate: Option<&dyn Predicate>) -> Result<u64> {
		let plan = self.planner().plan(entity_type, None)?;
		let mut ids = plan.id_statement();
		if let Some(predicate) = predicate {
			ids.and_where(predicate.to_condition(&plan)?);
		}
		let mut stmt = Query::select();
		stmt.expr_as(Expr::col(Asterisk).count(), Alias::new("count"))
			.from_subquery(ids, Alias::new("matched"));

		let rows = self.fetch(QueryStatement::Select(stmt)).await?;
		let count = rows
			.first()
			.and_then(|row| row.get("count"))
			.and_then(Value::as_i64)
			.unwrap_or(0);
		Ok(u64::try_from(count).unwrap_or(0))
	}

	/// Whether the entity's row exists, probing the root table only
	pub async fn exists(&self, entity: &EntityRef) -> Result<bool> {
		let Some(id) = entity.id() else {
			return Ok(false);
		};
		let root = self.registry.root_of(entity.entity_type())?;
		let identifier = self.registry.identifier(entity.entity_type())?;
		let mut stmt = Query::select();
		stmt.expr_as(Expr::val(1), Alias::new("present"))
			.from(Alias::new(&root.table))
			.and_where(Expr::col(Alias::new(&identifier.column)).eq(sea_query::Value::from(Value::from(id))))
			.limit(1);
		Ok(!self.fetch(QueryStatement::Select(stmt)).await?.is_empty())
	}

	/// Member identities of a collection-valued association, in the
	/// association's configured order
	pub async fn load_collection(
		&self,
		owner: &IdentityKey,
		owner_type: &str,
		association: &str,
	) -> Result<Vec<IdentityKey>> {
		let (_, assoc) = self
			.registry
			.association(owner_type, association)
			.ok_or_else(|| CtiError::unknown_field(owner_type, association))?;
		let plan = self.planner().plan_read(&assoc.target, None)?;
		let mut stmt = plan.select_statement();
		let owner_id = sea_query::Value::from(Value::from(&owner.id));

		match &assoc.mapping {
			AssociationMapping::JoinTable(link) => {
				self.join_link(&mut stmt, &plan, &link.table, &link.target_column);
				stmt.and_where(Expr::col((Alias::new(LINK_ALIAS), Alias::new(&link.owner_column))).eq(owner_id));
			}
			AssociationMapping::MappedBy(_) => {
				let (_, owning) = self.registry.owning_side(assoc)?;
				match &owning.mapping {
					AssociationMapping::JoinColumn(_) => {
						stmt.and_where(plan.resolve_column(&owning.name)?.expr().eq(owner_id));
					}
					AssociationMapping::JoinTable(link) => {
						self.join_link(&mut stmt, &plan, &link.table, &link.owner_column);
						stmt.and_where(
							Expr::col((Alias::new(LINK_ALIAS), Alias::new(&link.target_column))).eq(owner_id),
						);
					}
					AssociationMapping::MappedBy(_) => {
						return Err(CtiError::planning(format!(
							"'{owner_type}.{association}' is mapped by another inverse side"
						)));
					}
				}
			}
			AssociationMapping::JoinColumn(_) => {
				return Err(CtiError::planning(format!(
					"'{owner_type}.{association}' is not a collection"
				)));
			}
		}
		if let Some((field, direction)) = &assoc.order_by {
			stmt.order_by_expr(plan.resolve_column(field)?.expr().into(), (*direction).into());
		}

		let hydration = self.run_select(&plan, stmt).await?;
		let keys = hydration.entities.iter().filter_map(EntityRef::identity).collect();
		self.resolve_deferred(hydration.deferred).await?;
		Ok(keys)
	}

	fn join_link(&self, stmt: &mut SelectStatement, plan: &JoinPlan, table: &str, member_column: &str) {
		stmt.join_as(
			JoinType::InnerJoin,
			Alias::new(table),
			Alias::new(LINK_ALIAS),
			Expr::col((Alias::new(LINK_ALIAS), Alias::new(member_column)))
				.equals((Alias::new(plan.base_alias()), Alias::new(&plan.pk_column))),
		);
	}

	async fn load_by_ids(&self, entity_type: &str, ids: &[PrimaryKey]) -> Result<Hydration> {
		let plan = self.planner().plan_read(entity_type, None)?;
		let mut stmt = plan.select_statement();
		stmt.and_where(plan.base_id_expr().is_in(ids.iter().map(|id| sea_query::Value::from(Value::from(id)))));
		self.run_select(&plan, stmt).await
	}

	async fn run_select(&self, plan: &JoinPlan, stmt: SelectStatement) -> Result<Hydration> {
		let rows = self.fetch(QueryStatement::Select(stmt)).await?;
		self.hydrator().hydrate_all(plan, &rows)
	}

	/// Load eager targets and inverse single-valued associations, round by
	/// round, until no new work appears
	async fn resolve_deferred(&self, deferred: Vec<Deferred>) -> Result<()> {
		let mut pending = deferred;
		let mut rounds = 0;
		while !pending.is_empty() {
			rounds += 1;
			if rounds > self.config.max_eager_depth {
				return Err(CtiError::planning(format!(
					"eager loading did not settle within {} rounds",
					self.config.max_eager_depth
				)));
			}

			let mut next = Vec::new();
			let mut by_type: IndexMap<String, Vec<PrimaryKey>> = IndexMap::new();
			for item in pending {
				match item {
					Deferred::Entity { entity_type, key } => {
						let loaded = self
							.identity_map
							.get(&key)
							.is_some_and(|entity| entity.is_initialized());
						let ids = by_type.entry(entity_type).or_default();
						if !loaded && !ids.contains(&key.id) {
							ids.push(key.id);
						}
					}
					Deferred::InverseToOne { owner, association } => {
						next.extend(self.load_inverse_to_one(&owner, &association).await?);
					}
				}
			}
			for (entity_type, ids) in by_type {
				for chunk in ids.chunks(self.config.in_list_chunk_size) {
					let hydration = self.load_by_ids(&entity_type, chunk).await?;
					next.extend(hydration.deferred);
				}
			}
			pending = next;
		}
		Ok(())
	}

	async fn load_inverse_to_one(&self, owner: &EntityRef, association: &str) -> Result<Vec<Deferred>> {
		let (_, assoc) = self
			.registry
			.association(owner.entity_type(), association)
			.ok_or_else(|| CtiError::unknown_field(owner.entity_type(), association))?;
		let (_, owning) = self.registry.owning_side(assoc)?;
		let Some(id) = owner.id() else {
			return Ok(Vec::new());
		};

		let plan = self.planner().plan_read(&assoc.target, None)?;
		let mut stmt = plan.select_statement();
		stmt.and_where(
			plan.resolve_column(&owning.name)?
				.expr()
				.eq(sea_query::Value::from(Value::from(id))),
		);
		let hydration = self.run_select(&plan, stmt).await?;
		if hydration.entities.len() > 1 {
			tracing::warn!(
				entity_type = owner.entity_type(),
				association,
				matches = hydration.entities.len(),
				"Inverse one-to-one matched several rows, keeping the first"
			);
		}
		let slot = hydration
			.entities
			.first()
			.and_then(EntityRef::identity)
			.map_or(ToOneSlot::Null, ToOneSlot::Key);
		owner.set_link(association, slot);
		Ok(hydration.deferred)
	}

	// Writes

	/// Insert a new entity: one row per hierarchy level, root first.
	///
	/// Links to entities that have no identifier yet, the entity itself
	/// included, are written as NULL and stay dirty, so the update pass of
	/// the same flush back-fills them.
	pub async fn insert(&self, entity: &EntityRef) -> Result<IdentityKey> {
		if entity.lifecycle() != Lifecycle::New {
			return Err(CtiError::ConstraintViolation(format!(
				"'{}' is already persistent",
				entity.entity_type()
			)));
		}
		let entity_type = entity.entity_type().to_string();
		let chain = self.registry.chain(&entity_type)?;
		let identifier = self.registry.identifier(&entity_type)?;
		let discriminators = self.registry.discriminator_map(&entity_type)?;
		let (fields, links) = {
			let state = entity.state();
			(state.fields.clone(), state.links.clone())
		};

		let mut id = entity.id();
		let mut unsettled = Vec::new();
		if id.is_none() && identifier.strategy == IdStrategy::Assigned {
			return Err(CtiError::MissingIdentifier(entity_type));
		}
		if id.is_none() && !self.connection.backend().supports_returning() {
			return Err(CtiError::Config(format!(
				"{:?} cannot report generated identifiers; '{entity_type}' needs assigned identifiers",
				self.connection.backend()
			)));
		}
		if let Some(id) = &id {
			let key = IdentityKey::new(chain[0].name.clone(), id.clone());
			if self.identity_map.get(&key).is_some_and(|other| !other.same(entity)) {
				return Err(CtiError::ConstraintViolation(format!(
					"another instance is already registered as {key}"
				)));
			}
		}

		// Every level's values are checked before the first row is written
		let mut level_columns: Vec<Vec<(String, Value)>> = Vec::with_capacity(chain.len());
		for (depth, level) in chain.iter().enumerate() {
			let mut columns: Vec<(String, Value)> = Vec::new();
			if depth == 0 {
				if let Some(column) = discriminators.column() {
					let value = discriminators.value_for(&entity_type).ok_or_else(|| {
						CtiError::planning(format!("'{entity_type}' has no discriminator value"))
					})?;
					columns.push((column.to_string(), Value::from(value)));
				}
			}
			for field in &level.fields {
				let value = fields.get(&field.name).cloned().unwrap_or(Value::Null);
				columns.push((field.column.clone(), field.bind(&entity_type, value)?));
			}
			for assoc in &level.associations {
				let Some(column) = assoc.join_column() else {
					continue;
				};
				let slot = links.get(&assoc.name);
				if matches!(slot, Some(ToOneSlot::Entity(target)) if target.identity().is_none()) {
					unsettled.push(assoc.name.clone());
				}
				let value = slot
					.and_then(ToOneSlot::key)
					.map_or(Value::Null, |key| Value::from(key.id));
				columns.push((column.to_string(), value));
			}
			level_columns.push(columns);
		}

		for (level, mut columns) in chain.iter().zip(level_columns) {
			if let Some(id) = &id {
				columns.insert(0, (identifier.column.clone(), Value::from(id)));
			}

			let mut stmt = Query::insert();
			stmt.into_table(Alias::new(&level.table));
			if columns.is_empty() {
				stmt.or_default_values();
			} else {
				stmt.columns(columns.iter().map(|(column, _)| Alias::new(column)));
				stmt.values(
					columns
						.into_iter()
						.map(|(_, value)| SimpleExpr::from(sea_query::Value::from(value))),
				)
				.map_err(|e| CtiError::planning(e.to_string()))?;
			}

			if id.is_none() {
				stmt.returning_col(Alias::new(&identifier.column));
				let rows = self.fetch(QueryStatement::Insert(stmt)).await?;
				let generated = rows
					.first()
					.and_then(|row| row.get(&identifier.column))
					.cloned()
					.unwrap_or(Value::Null);
				id = Some(
					PrimaryKey::from_value(generated, identifier.field_type)?
						.ok_or_else(|| CtiError::MissingIdentifier(entity_type.clone()))?,
				);
			} else {
				self.execute(QueryStatement::Insert(stmt)).await?;
			}
		}

		let id = id.ok_or_else(|| CtiError::MissingIdentifier(entity_type.clone()))?;
		let key = IdentityKey::new(chain[0].name.clone(), id);
		entity.attach(key.clone(), self.loader.clone());
		self.identity_map.insert_new(key.clone(), entity)?;
		entity.commit_snapshot();
		for association in &unsettled {
			entity.mark_unwritten(association);
		}
		tracing::trace!(entity_type = %entity_type, key = %key, "Inserted entity");
		Ok(key)
	}

	/// Write changed columns of a managed entity, one UPDATE per level
	/// holding a change. Returns whether anything was written.
	pub async fn update(&self, entity: &EntityRef) -> Result<bool> {
		if entity.lifecycle() != Lifecycle::Managed || !entity.is_initialized() {
			return Ok(false);
		}
		let Some(id) = entity.id() else {
			return Ok(false);
		};
		let entity_type = entity.entity_type();
		let changed_fields = entity.changed_fields();
		let changed_links = entity.changed_links();
		if changed_fields.is_empty() && changed_links.is_empty() {
			return Ok(false);
		}

		let mut per_table: IndexMap<String, Vec<(String, Value)>> = IndexMap::new();
		for (name, value) in changed_fields {
			let (level, field) = self
				.registry
				.field(entity_type, &name)
				.ok_or_else(|| CtiError::unknown_field(entity_type, &name))?;
			per_table
				.entry(level.table.clone())
				.or_default()
				.push((field.column.clone(), field.bind(entity_type, value)?));
		}
		for (name, slot) in changed_links {
			let Some((level, assoc)) = self.registry.association(entity_type, &name) else {
				continue;
			};
			let Some(column) = assoc.join_column() else {
				continue;
			};
			let value = match &slot {
				ToOneSlot::Entity(target) if target.identity().is_none() => continue,
				other => other.key().map_or(Value::Null, |key| Value::from(key.id)),
			};
			per_table
				.entry(level.table.clone())
				.or_default()
				.push((column.to_string(), value));
		}

		let identifier = self.registry.identifier(entity_type)?;
		let mut written = false;
		for level in self.registry.chain(entity_type)? {
			let Some(values) = per_table.shift_remove(&level.table) else {
				continue;
			};
			let mut stmt = Query::update();
			stmt.table(Alias::new(&level.table));
			for (column, value) in values {
				stmt.value(Alias::new(column), sea_query::Value::from(value));
			}
			stmt.and_where(
				Expr::col(Alias::new(&identifier.column)).eq(sea_query::Value::from(Value::from(&id))),
			);
			self.execute(QueryStatement::Update(stmt)).await?;
			written = true;
		}
		entity.commit_snapshot();
		Ok(written)
	}

	/// Write link table rows added to or removed from owning many-to-many
	/// collections. Inverse sides are not persisted.
	pub async fn sync_collections(&self, entity: &EntityRef) -> Result<()> {
		let Some(owner) = entity.id() else {
			return Ok(());
		};
		let collections: Vec<_> = entity
			.state()
			.collections
			.iter()
			.map(|(name, collection)| (name.clone(), collection.clone()))
			.collect();

		for (name, collection) in collections {
			let link = self
				.registry
				.association(entity.entity_type(), &name)
				.and_then(|(_, assoc)| assoc.join_table().cloned());
			let Some(link) = link else {
				collection.commit();
				continue;
			};
			let (added, removed) = collection.diff()?;
			let owner_id = sea_query::Value::from(Value::from(&owner));

			if !removed.is_empty() {
				let mut stmt = Query::delete();
				stmt.from_table(Alias::new(&link.table))
					.and_where(Expr::col(Alias::new(&link.owner_column)).eq(owner_id.clone()))
					.and_where(
						Expr::col(Alias::new(&link.target_column))
							.is_in(removed.iter().map(|key| sea_query::Value::from(Value::from(&key.id)))),
					);
				self.execute(QueryStatement::Delete(stmt)).await?;
			}
			if !added.is_empty() {
				let mut stmt = Query::insert();
				stmt.into_table(Alias::new(&link.table))
					.columns([Alias::new(&link.owner_column), Alias::new(&link.target_column)]);
				for key in &added {
					stmt.values([
						SimpleExpr::from(owner_id.clone()),
						SimpleExpr::from(sea_query::Value::from(Value::from(&key.id))),
					])
					.map_err(|e| CtiError::planning(e.to_string()))?;
				}
				self.execute(QueryStatement::Insert(stmt)).await?;
			}
			collection.commit();
		}
		Ok(())
	}

	/// Delete a managed entity: link table rows first, then one row per
	/// level from the concrete type up to the root
	pub async fn delete(&self, entity: &EntityRef) -> Result<()> {
		let key = entity
			.identity()
			.ok_or_else(|| CtiError::MissingIdentifier(entity.entity_type().to_string()))?;
		let entity_type = entity.entity_type();
		let id = sea_query::Value::from(Value::from(&key.id));

		for (link, column) in self.registry.join_tables_for(&[entity_type]) {
			let mut stmt = Query::delete();
			stmt.from_table(Alias::new(&link.table))
				.and_where(Expr::col(Alias::new(&column)).eq(id.clone()));
			self.execute(QueryStatement::Delete(stmt)).await?;
		}

		let identifier = self.registry.identifier(entity_type)?;
		for level in self.registry.chain(entity_type)?.into_iter().rev() {
			let mut stmt = Query::delete();
			stmt.from_table(Alias::new(&level.table))
				.and_where(Expr::col(Alias::new(&identifier.column)).eq(id.clone()));
			self.execute(QueryStatement::Delete(stmt)).await?;
		}

		self.identity_map.remove(&key);
		entity.set_lifecycle(Lifecycle::Removed);
		tracing::trace!(entity_type, key = %key, "Deleted entity");
		Ok(())
	}

	async fn matched_ids(&self, select: &IdSelect) -> Result<Vec<PrimaryKey>> {
		let plan = &select.plan;
		let rows = self.fetch(QueryStatement::Select(select.statement.clone())).await?;
		let mut ids = Vec::with_capacity(rows.len());
		for row in rows {
			let raw = row.get(&plan.id_label).cloned().unwrap_or(Value::Null);
			if let Some(id) = PrimaryKey::from_value(raw, plan.id_type)? {
				ids.push(id);
			}
		}
		Ok(ids)
	}

	/// Update every entity the builder matches; returns the number of
	/// matched entities
	pub async fn bulk_update(&self, update: &BulkUpdate) -> Result<u64> {
		let plan = update.plan(self.registry, &self.planner())?;
		let root = self.registry.root_name(update.entity_type())?.to_string();
		let ids = self.matched_ids(&plan.select).await?;
		for chunk in ids.chunks(self.config.in_list_chunk_size) {
			for stmt in plan.statements(chunk) {
				self.execute(QueryStatement::Update(stmt)).await?;
			}
		}

		if update.synchronize_strategy() == SynchronizeStrategy::Evaluate {
			for id in &ids {
				let Some(entity) = self.identity_map.get(&IdentityKey::new(root.clone(), id.clone())) else {
					continue;
				};
				if !entity.is_initialized() {
					continue;
				}
				for (name, value) in update.assignments() {
					match self.registry.field(entity.entity_type(), name) {
						Some((_, field)) => entity.refresh_field(name, value.clone().coerce(field.field_type)?),
						None => {
							let target = self
								.registry
								.association(entity.entity_type(), name)
								.map(|(_, assoc)| assoc.target.clone())
								.ok_or_else(|| CtiError::unknown_field(entity.entity_type(), name))?;
							let id_type = self.registry.identifier(&target)?.field_type;
							let slot = match PrimaryKey::from_value(value.clone(), id_type)? {
								Some(target_id) => ToOneSlot::Key(IdentityKey::new(
									self.registry.root_name(&target)?,
									target_id,
								)),
								None => ToOneSlot::Null,
							};
							entity.set_link(name, slot);
						}
					}
				}
			}
		}
		tracing::debug!(entity_type = update.entity_type(), matched = ids.len(), "Bulk update");
		Ok(ids.len() as u64)
	}

	/// Delete every entity the builder matches, including link table rows
	/// and rows of every hierarchy level; returns the number of matched
	/// entities. Matched instances are evicted from the identity map.
	pub async fn bulk_delete(&self, delete: &BulkDelete) -> Result<u64> {
		let plan = delete.plan(self.registry, &self.planner())?;
		let root = self.registry.root_name(delete.entity_type())?.to_string();
		let ids = self.matched_ids(&plan.select).await?;
		for chunk in ids.chunks(self.config.in_list_chunk_size) {
			for stmt in plan.statements(chunk) {
				self.execute(QueryStatement::Delete(stmt)).await?;
			}
		}
		for id in &ids {
			if let Some(entity) = self.identity_map.remove(&IdentityKey::new(root.clone(), id.clone())) {
				entity.set_lifecycle(Lifecycle::Removed);
			}
		}
		tracing::debug!(entity_type = delete.entity_type(), matched = ids.len(), "Bulk delete");
		Ok(ids.len() as u64)
	}
}
