//! Column values, identifiers and result rows
//!
//! [`Value`] is the single currency passed between the planner, the hydrator
//! and a [`Connection`](crate::connection::Connection). It converts to and from
//! `sea_query::Value` so statements can be built with sea-query and bound by
//! whichever driver backs the connection.

use crate::error::{CtiError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declared type of a mapped field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
	Integer,
	Float,
	Boolean,
	Text,
	Timestamp,
	Uuid,
	Bytes,
}

impl fmt::Display for FieldType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Integer => "integer",
			Self::Float => "float",
			Self::Boolean => "boolean",
			Self::Text => "text",
			Self::Timestamp => "timestamp",
			Self::Uuid => "uuid",
			Self::Bytes => "bytes",
		};
		f.write_str(name)
	}
}

/// A single column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Text(String),
	Bytes(Vec<u8>),
	Timestamp(DateTime<Utc>),
	Uuid(Uuid),
}

impl Value {
	pub fn is_null(&self) -> bool {
		matches!(self, Self::Null)
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Self::Int(i) => Some(*i),
			Self::Bool(b) => Some(i64::from(*b)),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::Text(s) => Some(s),
			_ => None,
		}
	}

	/// Coerce a raw driver value into the declared field type.
	///
	/// Drivers such as SQLite only report storage classes, so booleans arrive
	/// as integers and timestamps as text. `Null` is accepted for every type.
	pub fn coerce(self, target: FieldType) -> Result<Value> {
		let mismatch = |value: &Value| CtiError::TypeMismatch {
			expected: target.to_string(),
			value: format!("{value:?}"),
		};

		match (target, self) {
			(_, Self::Null) => Ok(Self::Null),
			(FieldType::Integer, Self::Int(i)) => Ok(Self::Int(i)),
			(FieldType::Integer, Self::Bool(b)) => Ok(Self::Int(i64::from(b))),
			(FieldType::Integer, Self::Text(s)) => {
				s.trim().parse::<i64>().map(Self::Int).map_err(|_| mismatch(&Self::Text(s)))
			}
			(FieldType::Float, Self::Float(f)) => Ok(Self::Float(f)),
			(FieldType::Float, Self::Int(i)) => Ok(Self::Float(i as f64)),
			(FieldType::Boolean, Self::Bool(b)) => Ok(Self::Bool(b)),
			(FieldType::Boolean, Self::Int(i)) => Ok(Self::Bool(i != 0)),
			(FieldType::Text, Self::Text(s)) => Ok(Self::Text(s)),
			(FieldType::Text, Self::Int(i)) => Ok(Self::Text(i.to_string())),
			(FieldType::Timestamp, Self::Timestamp(ts)) => Ok(Self::Timestamp(ts)),
			(FieldType::Timestamp, Self::Text(s)) => parse_timestamp(&s)
				.map(Self::Timestamp)
				.ok_or_else(|| mismatch(&Self::Text(s))),
			(FieldType::Timestamp, Self::Int(secs)) => DateTime::from_timestamp(secs, 0)
				.map(Self::Timestamp)
				.ok_or_else(|| mismatch(&Self::Int(secs))),
			(FieldType::Uuid, Self::Uuid(u)) => Ok(Self::Uuid(u)),
			(FieldType::Uuid, Self::Text(s)) => {
				Uuid::parse_str(&s).map(Self::Uuid).map_err(|_| mismatch(&Self::Text(s)))
			}
			(FieldType::Uuid, Self::Bytes(b)) => {
				Uuid::from_slice(&b).map(Self::Uuid).map_err(|_| mismatch(&Self::Bytes(b)))
			}
			(FieldType::Bytes, Self::Bytes(b)) => Ok(Self::Bytes(b)),
			(FieldType::Bytes, Self::Text(s)) => Ok(Self::Bytes(s.into_bytes())),
			(_, other) => Err(mismatch(&other)),
		}
	}
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
	if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
		return Some(ts.with_timezone(&Utc));
	}
	if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
		return Some(ts.with_timezone(&Utc));
	}
	// SQLite CURRENT_TIMESTAMP
	NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
		.ok()
		.map(|naive| naive.and_utc())
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Null => f.write_str("NULL"),
			Self::Bool(b) => write!(f, "{b}"),
			Self::Int(i) => write!(f, "{i}"),
			Self::Float(v) => write!(f, "{v}"),
			Self::Text(s) => write!(f, "'{s}'"),
			Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
			Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
			Self::Uuid(u) => write!(f, "{u}"),
		}
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Self::Bool(v)
	}
}

impl From<i32> for Value {
	fn from(v: i32) -> Self {
		Self::Int(i64::from(v))
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Self::Int(v)
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Self::Float(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Self::Text(v.to_string())
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Self::Text(v)
	}
}

impl From<Vec<u8>> for Value {
	fn from(v: Vec<u8>) -> Self {
		Self::Bytes(v)
	}
}

impl From<DateTime<Utc>> for Value {
	fn from(v: DateTime<Utc>) -> Self {
		Self::Timestamp(v)
	}
}

impl From<Uuid> for Value {
	fn from(v: Uuid) -> Self {
		Self::Uuid(v)
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(v: Option<T>) -> Self {
		v.map_or(Self::Null, Into::into)
	}
}

impl From<PrimaryKey> for Value {
	fn from(pk: PrimaryKey) -> Self {
		match pk {
			PrimaryKey::Int(i) => Self::Int(i),
			PrimaryKey::Text(s) => Self::Text(s),
			PrimaryKey::Uuid(u) => Self::Uuid(u),
		}
	}
}

impl From<&PrimaryKey> for Value {
	fn from(pk: &PrimaryKey) -> Self {
		pk.clone().into()
	}
}

impl From<Value> for sea_query::Value {
	fn from(value: Value) -> Self {
		match value {
			Value::Null => sea_query::Value::Int(None),
			Value::Bool(b) => b.into(),
			Value::Int(i) => i.into(),
			Value::Float(f) => f.into(),
			Value::Text(s) => s.into(),
			Value::Bytes(b) => b.into(),
			Value::Timestamp(ts) => ts.into(),
			Value::Uuid(u) => u.into(),
		}
	}
}

impl From<sea_query::Value> for Value {
	fn from(value: sea_query::Value) -> Self {
		use sea_query::Value as SV;

		match value {
			SV::Bool(v) => v.map_or(Self::Null, Self::Bool),
			SV::TinyInt(v) => v.map_or(Self::Null, |i| Self::Int(i64::from(i))),
			SV::SmallInt(v) => v.map_or(Self::Null, |i| Self::Int(i64::from(i))),
			SV::Int(v) => v.map_or(Self::Null, |i| Self::Int(i64::from(i))),
			SV::BigInt(v) => v.map_or(Self::Null, Self::Int),
			SV::TinyUnsigned(v) => v.map_or(Self::Null, |i| Self::Int(i64::from(i))),
			SV::SmallUnsigned(v) => v.map_or(Self::Null, |i| Self::Int(i64::from(i))),
			SV::Unsigned(v) => v.map_or(Self::Null, |i| Self::Int(i64::from(i))),
			SV::BigUnsigned(v) => v.map_or(Self::Null, |u| match i64::try_from(u) {
				Ok(i) => Self::Int(i),
				Err(_) => {
					tracing::warn!(value = u, "Unsigned value exceeds i64::MAX; clamping");
					Self::Int(i64::MAX)
				}
			}),
			SV::Float(v) => v.map_or(Self::Null, |f| Self::Float(f64::from(f))),
			SV::Double(v) => v.map_or(Self::Null, Self::Float),
			SV::String(v) => v.map_or(Self::Null, |s| Self::Text(*s)),
			SV::Char(v) => v.map_or(Self::Null, |c| Self::Text(c.to_string())),
			SV::Bytes(v) => v.map_or(Self::Null, |b| Self::Bytes(*b)),
			SV::ChronoDateTimeUtc(v) => v.map_or(Self::Null, |ts| Self::Timestamp(*ts)),
			SV::Uuid(v) => v.map_or(Self::Null, |u| Self::Uuid(*u)),
			other => {
				tracing::warn!(value = ?other, "Unsupported sea-query value; binding as text");
				Self::Text(format!("{other:?}"))
			}
		}
	}
}

/// Identifier value of a persisted entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
	Int(i64),
	Text(String),
	Uuid(Uuid),
}

impl PrimaryKey {
	/// Build an identifier from a driver value coerced to the identifier's type
	pub fn from_value(value: Value, id_type: FieldType) -> Result<Option<Self>> {
		match value.coerce(id_type)? {
			Value::Null => Ok(None),
			Value::Int(i) => Ok(Some(Self::Int(i))),
			Value::Text(s) => Ok(Some(Self::Text(s))),
			Value::Uuid(u) => Ok(Some(Self::Uuid(u))),
			other => Err(CtiError::TypeMismatch {
				expected: "identifier".to_string(),
				value: format!("{other:?}"),
			}),
		}
	}
}

impl fmt::Display for PrimaryKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Int(i) => write!(f, "{i}"),
			Self::Text(s) => write!(f, "{s}"),
			Self::Uuid(u) => write!(f, "{u}"),
		}
	}
}

impl From<i64> for PrimaryKey {
	fn from(v: i64) -> Self {
		Self::Int(v)
	}
}

impl From<i32> for PrimaryKey {
	fn from(v: i32) -> Self {
		Self::Int(i64::from(v))
	}
}

impl From<&str> for PrimaryKey {
	fn from(v: &str) -> Self {
		Self::Text(v.to_string())
	}
}

impl From<String> for PrimaryKey {
	fn from(v: String) -> Self {
		Self::Text(v)
	}
}

impl From<Uuid> for PrimaryKey {
	fn from(v: Uuid) -> Self {
		Self::Uuid(v)
	}
}

/// Identity of an entity: the root type of its hierarchy plus its identifier.
///
/// Every subtype shares its root's key space, so a manager and the person row
/// it extends resolve to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
	pub root: String,
	pub id: PrimaryKey,
}

impl IdentityKey {
	pub fn new(root: impl Into<String>, id: impl Into<PrimaryKey>) -> Self {
		Self {
			root: root.into(),
			id: id.into(),
		}
	}
}

impl fmt::Display for IdentityKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.root, self.id)
	}
}

/// One result row keyed by column label
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
	values: IndexMap<String, Value>,
}

impl Row {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, label: &str) -> Option<&Value> {
		self.values.get(label)
	}

	pub fn insert(&mut self, label: impl Into<String>, value: Value) {
		self.values.insert(label.into(), value);
	}

	pub fn len(&self) -> usize {
		self.values.len()
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
		self.values.iter()
	}
}

impl<K: Into<String>> FromIterator<(K, Value)> for Row {
	fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
		Self {
			values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn test_coerce_sqlite_storage_classes() {
		assert_eq!(Value::Int(1).coerce(FieldType::Boolean).unwrap(), Value::Bool(true));
		assert_eq!(Value::Int(0).coerce(FieldType::Boolean).unwrap(), Value::Bool(false));
		assert_eq!(Value::Int(3).coerce(FieldType::Float).unwrap(), Value::Float(3.0));
		assert_eq!(Value::Null.coerce(FieldType::Timestamp).unwrap(), Value::Null);
	}

	#[test]
	fn test_coerce_timestamp_formats() {
		let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
		for raw in [
			"2024-03-01T12:30:00+00:00",
			"2024-03-01 12:30:00",
			"2024-03-01 12:30:00+00:00",
		] {
			assert_eq!(
				Value::Text(raw.to_string()).coerce(FieldType::Timestamp).unwrap(),
				Value::Timestamp(expected),
				"format {raw}"
			);
		}
	}

	#[test]
	fn test_coerce_mismatch() {
		let err = Value::Text("abc".into()).coerce(FieldType::Integer).unwrap_err();
		assert!(matches!(err, CtiError::TypeMismatch { .. }));

		let err = Value::Float(1.5).coerce(FieldType::Uuid).unwrap_err();
		assert!(err.to_string().contains("uuid"));
	}

	#[test]
	fn test_sea_query_value_conversion() {
		let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
		let back: Value = sea_query::Value::from(Value::Timestamp(ts)).into();
		assert_eq!(back, Value::Timestamp(ts));

		let back: Value = sea_query::Value::from(Value::Text("x".into())).into();
		assert_eq!(back, Value::Text("x".into()));

		let back: Value = sea_query::Value::from(Value::Null).into();
		assert_eq!(back, Value::Null);

		let back: Value = sea_query::Value::BigUnsigned(Some(u64::MAX)).into();
		assert_eq!(back, Value::Int(i64::MAX));
	}

	#[test]
	fn test_primary_key_from_value() {
		assert_eq!(
			PrimaryKey::from_value(Value::Text("42".into()), FieldType::Integer).unwrap(),
			Some(PrimaryKey::Int(42))
		);
		assert_eq!(PrimaryKey::from_value(Value::Null, FieldType::Integer).unwrap(), None);
	}

	#[test]
	fn test_identity_key_display() {
		assert_eq!(IdentityKey::new("person", 7).to_string(), "person#7");
	}
}
