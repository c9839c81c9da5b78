//! Chainable entity queries

use crate::criteria::{Criteria, Predicate};
use crate::entity::EntityRef;
use crate::error::{CtiError, Result};
use crate::metadata::SortDirection;
use crate::persister::SelectRequest;
use crate::session::Session;

/// Query over one entity type and its subtypes
///
/// # Examples
///
/// ```rust,no_run
/// use reinhardt_cti::{Criteria, Session, SortDirection};
///
/// # async fn example(session: &Session) -> reinhardt_cti::Result<()> {
/// let employees = session
/// 	.query("employee")
/// 	.filter(Criteria::gte("salary", 100_000))
/// 	.order_by("name", SortDirection::Desc)
/// 	.fetch_join("spouse")
/// 	.limit(10)
/// 	.all()
/// 	.await?;
/// # Ok(())
/// # }
/// ```
pub struct EntityQuery<'s> {
	session: &'s Session,
	entity_type: String,
	criteria: Option<Criteria>,
	order_by: Vec<(String, SortDirection)>,
	fetch_joins: Vec<String>,
	projection: Option<Vec<String>>,
	limit: Option<u64>,
	offset: Option<u64>,
}

impl<'s> EntityQuery<'s> {
	pub(crate) fn new(session: &'s Session, entity_type: &str) -> Self {
		Self {
			session,
			entity_type: entity_type.to_string(),
			criteria: None,
			order_by: Vec::new(),
			fetch_joins: Vec::new(),
			projection: None,
			limit: None,
			offset: None,
		}
	}

	/// Add a condition; repeated calls are combined with AND
	pub fn filter(mut self, criteria: Criteria) -> Self {
		self.criteria = Some(match self.criteria.take() {
			Some(existing) => existing.and(criteria),
			None => criteria,
		});
		self
	}

	/// Order by a field of any joined level, or by `association.field` of a
	/// fetch-joined association
	pub fn order_by(mut self, field: &str, direction: SortDirection) -> Self {
		self.order_by.push((field.to_string(), direction));
		self
	}

	/// Read an association's targets in the same statement
	pub fn fetch_join(mut self, association: &str) -> Self {
		self.fetch_joins.push(association.to_string());
		self
	}

	/// Read only these fields; the others stay NULL on entities hydrated by
	/// this query
	pub fn only<I, S>(mut self, fields: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.projection = Some(fields.into_iter().map(Into::into).collect());
		self
	}

	pub fn limit(mut self, limit: u64) -> Self {
		self.limit = Some(limit);
		self
	}

	pub fn offset(mut self, offset: u64) -> Self {
		self.offset = Some(offset);
		self
	}

	fn request(&self) -> SelectRequest<'_> {
		SelectRequest {
			entity_type: &self.entity_type,
			predicate: self.criteria.as_ref().map(|c| c as &dyn Predicate),
			order_by: &self.order_by,
			fetch_joins: &self.fetch_joins,
			projection: self.projection.as_deref(),
			limit: self.limit,
			offset: self.offset,
		}
	}

	pub async fn all(&self) -> Result<Vec<EntityRef>> {
		self.session.persister().select(self.request()).await
	}

	/// The single matching entity; zero rows are `None`, several are a
	/// [`CtiError::NonUniqueResult`]
	pub async fn one_or_none(&self) -> Result<Option<EntityRef>> {
		let mut entities = self.all().await?;
		match entities.len() {
			0 => Ok(None),
			1 => Ok(entities.pop()),
			n => Err(CtiError::NonUniqueResult(n)),
		}
	}

	/// Number of distinct matching entities; ordering and paging are ignored
	pub async fn count(&self) -> Result<u64> {
		let predicate = self.criteria.as_ref().map(|c| c as &dyn Predicate);
		self.session.persister().count(&self.entity_type, predicate).await
	}
}
