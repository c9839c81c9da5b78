//! Query predicates
//!
//! Predicates are written against field and association names and rendered
//! into SQL conditions against a concrete join plan, so the same predicate
//! works no matter which table of the hierarchy stores the field.

use crate::error::Result;
use crate::value::{FieldType, Value};
use sea_query::{Alias, Expr, SimpleExpr};
use std::fmt;

/// A table-qualified column a field name resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedColumn {
	pub alias: String,
	pub column: String,
	pub field_type: Option<FieldType>,
}

impl ResolvedColumn {
	pub fn expr(&self) -> Expr {
		Expr::col((Alias::new(&self.alias), Alias::new(&self.column)))
	}
}

/// Maps field paths such as `name`, `spouse` or `spouse.name` to columns
pub trait ColumnResolver {
	fn resolve_column(&self, path: &str) -> Result<ResolvedColumn>;
}

/// Anything that can render itself as a WHERE condition
pub trait Predicate: fmt::Debug + Send + Sync {
	fn to_condition(&self, resolver: &dyn ColumnResolver) -> Result<SimpleExpr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
	Eq,
	Ne,
	Gt,
	Gte,
	Lt,
	Lte,
}

/// Composable field criteria
///
/// # Examples
///
/// ```rust
/// use reinhardt_cti::Criteria;
///
/// let criteria = Criteria::eq("department", "IT")
/// 	.and(Criteria::gte("salary", 100_000))
/// 	.and(Criteria::is_not_null("spouse"));
/// assert!(matches!(criteria, Criteria::And(ref parts) if parts.len() == 3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Criteria {
	Compare {
		field: String,
		op: CompareOp,
		value: Value,
	},
	Like {
		field: String,
		pattern: String,
	},
	In {
		field: String,
		values: Vec<Value>,
	},
	IsNull(String),
	IsNotNull(String),
	And(Vec<Criteria>),
	Or(Vec<Criteria>),
	Not(Box<Criteria>),
}

impl Criteria {
	/// Matches every row
	pub fn all() -> Self {
		Self::And(Vec::new())
	}

	fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
		Self::Compare {
			field: field.into(),
			op,
			value: value.into(),
		}
	}

	pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::compare(field, CompareOp::Eq, value)
	}

	pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::compare(field, CompareOp::Ne, value)
	}

	pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::compare(field, CompareOp::Gt, value)
	}

	pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::compare(field, CompareOp::Gte, value)
	}

	pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::compare(field, CompareOp::Lt, value)
	}

	pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::compare(field, CompareOp::Lte, value)
	}

	pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
		Self::Like {
			field: field.into(),
			pattern: pattern.into(),
		}
	}

	pub fn in_list<V: Into<Value>>(
		field: impl Into<String>,
		values: impl IntoIterator<Item = V>,
	) -> Self {
		Self::In {
			field: field.into(),
			values: values.into_iter().map(Into::into).collect(),
		}
	}

	pub fn is_null(field: impl Into<String>) -> Self {
		Self::IsNull(field.into())
	}

	pub fn is_not_null(field: impl Into<String>) -> Self {
		Self::IsNotNull(field.into())
	}

	pub fn and(self, other: Criteria) -> Self {
		match self {
			Self::And(mut parts) => {
				parts.push(other);
				Self::And(parts)
			}
			first => Self::And(vec![first, other]),
		}
	}

	pub fn or(self, other: Criteria) -> Self {
		match self {
			Self::Or(mut parts) => {
				parts.push(other);
				Self::Or(parts)
			}
			first => Self::Or(vec![first, other]),
		}
	}

	#[allow(clippy::should_implement_trait)]
	pub fn not(self) -> Self {
		Self::Not(Box::new(self))
	}
}

fn bind(column: &ResolvedColumn, value: &Value) -> Result<sea_query::Value> {
	let value = match column.field_type {
		Some(field_type) => value.clone().coerce(field_type)?,
		None => value.clone(),
	};
	Ok(value.into())
}

impl Predicate for Criteria {
	fn to_condition(&self, resolver: &dyn ColumnResolver) -> Result<SimpleExpr> {
		let condition = match self {
			Self::Compare { field, op, value } => {
				let column = resolver.resolve_column(field)?;
				let col = column.expr();
				if value.is_null() {
					return Ok(match op {
						CompareOp::Ne => col.is_not_null(),
						_ => col.is_null(),
					});
				}
				let value = bind(&column, value)?;
				match op {
					CompareOp::Eq => col.eq(value),
					CompareOp::Ne => col.ne(value),
					CompareOp::Gt => col.gt(value),
					CompareOp::Gte => col.gte(value),
					CompareOp::Lt => col.lt(value),
					CompareOp::Lte => col.lte(value),
				}
			}
			Self::Like { field, pattern } => {
				resolver.resolve_column(field)?.expr().like(pattern.as_str())
			}
			Self::In { field, values } => {
				let column = resolver.resolve_column(field)?;
				let values = values
					.iter()
					.map(|v| bind(&column, v))
					.collect::<Result<Vec<_>>>()?;
				column.expr().is_in(values)
			}
			Self::IsNull(field) => resolver.resolve_column(field)?.expr().is_null(),
			Self::IsNotNull(field) => resolver.resolve_column(field)?.expr().is_not_null(),
			Self::And(parts) => {
				let mut parts = parts.iter();
				let Some(first) = parts.next() else {
					return Ok(Expr::val(true).into());
				};
				let mut acc = first.to_condition(resolver)?;
				for part in parts {
					acc = acc.and(part.to_condition(resolver)?);
				}
				acc
			}
			Self::Or(parts) => {
				let mut parts = parts.iter();
				let Some(first) = parts.next() else {
					return Ok(Expr::val(false).into());
				};
				let mut acc = first.to_condition(resolver)?;
				for part in parts {
					acc = acc.or(part.to_condition(resolver)?);
				}
				acc
			}
			Self::Not(inner) => inner.to_condition(resolver)?.not(),
		};
		Ok(condition)
	}
}
