//! Database connections
//!
//! The persister talks to the database through the [`Connection`] trait so it
//! can run against a pool, a transaction or a recording double in tests.

use crate::error::Result;
use crate::query_types::DbBackend;
use crate::value::{Row, Value};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as SqlxRow, Sqlite, SqlitePool, TypeInfo};

/// Executes rendered SQL with positional parameters
#[async_trait]
pub trait Connection: Send + Sync {
	fn backend(&self) -> DbBackend;

	/// Run a statement and return the number of affected rows
	async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

	async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;
}

/// SQLite connection backed by a sqlx pool
#[derive(Debug, Clone)]
pub struct SqliteConnection {
	pool: SqlitePool,
}

impl SqliteConnection {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub async fn connect(url: &str) -> Result<Self> {
		let pool = SqlitePool::connect(url).await?;
		Ok(Self::new(pool))
	}

	/// A private in-memory database.
	///
	/// The pool holds a single connection: every new SQLite connection to
	/// `:memory:` would open a separate, empty database.
	pub async fn in_memory() -> Result<Self> {
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect("sqlite::memory:")
			.await?;
		Ok(Self::new(pool))
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	fn bind_value<'q>(
		query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
		value: &'q Value,
	) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
		match value {
			Value::Null => query.bind(None::<i64>),
			Value::Bool(b) => query.bind(b),
			Value::Int(i) => query.bind(i),
			Value::Float(f) => query.bind(f),
			Value::Text(s) => query.bind(s.as_str()),
			Value::Bytes(b) => query.bind(b.as_slice()),
			Value::Timestamp(dt) => query.bind(dt),
			Value::Uuid(u) => query.bind(u.to_string()),
		}
	}

	/// Decode by storage class; the hydrator coerces to the mapped type
	fn convert_row(sqlite_row: &SqliteRow) -> Row {
		let mut row = Row::new();
		for column in sqlite_row.columns() {
			let index = column.ordinal();
			let label = column.name().to_string();
			let is_bool = column.type_info().name().to_uppercase().contains("BOOL");

			let value = match sqlite_row.try_get_raw(index) {
				Ok(raw) if sqlx::ValueRef::is_null(&raw) => Value::Null,
				_ if is_bool => sqlite_row
					.try_get::<i64, _>(index)
					.map(|v| Value::Bool(v != 0))
					.unwrap_or(Value::Null),
				_ => {
					if let Ok(v) = sqlite_row.try_get::<i64, _>(index) {
						Value::Int(v)
					} else if let Ok(v) = sqlite_row.try_get::<f64, _>(index) {
						Value::Float(v)
					} else if let Ok(v) = sqlite_row.try_get::<String, _>(index) {
						Value::Text(v)
					} else if let Ok(v) = sqlite_row.try_get::<Vec<u8>, _>(index) {
						Value::Bytes(v)
					} else {
						tracing::warn!(column = %label, "Could not decode column, reading it as NULL");
						Value::Null
					}
				}
			};
			row.insert(label, value);
		}
		row
	}
}

#[async_trait]
impl Connection for SqliteConnection {
	fn backend(&self) -> DbBackend {
		DbBackend::Sqlite
	}

	async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
		let mut query = sqlx::query(sql);
		for param in params {
			query = Self::bind_value(query, param);
		}
		let result = query.execute(&self.pool).await?;
		Ok(result.rows_affected())
	}

	async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
		let mut query = sqlx::query(sql);
		for param in params {
			query = Self::bind_value(query, param);
		}
		let rows = query.fetch_all(&self.pool).await?;
		Ok(rows.iter().map(Self::convert_row).collect())
	}
}

/// Render parameters for statement logging
pub(crate) fn params_for_log(params: &[Value]) -> String {
	let rendered: Vec<serde_json::Value> = params
		.iter()
		.map(|value| match value {
			Value::Null => serde_json::Value::Null,
			Value::Bool(b) => serde_json::Value::from(*b),
			Value::Int(i) => serde_json::Value::from(*i),
			Value::Float(f) => serde_json::Value::from(*f),
			Value::Text(s) => serde_json::Value::from(s.as_str()),
			Value::Bytes(b) => serde_json::Value::from(format!("<{} bytes>", b.len())),
			other => serde_json::Value::from(other.to_string()),
		})
		.collect();
	serde_json::Value::Array(rendered).to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_round_trip_storage_classes() {
		let conn = SqliteConnection::in_memory().await.unwrap();
		conn.execute(
			"CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, active BOOLEAN, data BLOB)",
			&[],
		)
		.await
		.unwrap();
		let affected = conn
			.execute(
				"INSERT INTO t (name, score, active, data) VALUES (?, ?, ?, ?)",
				&[
					Value::from("Roman"),
					Value::Float(1.5),
					Value::Bool(true),
					Value::Null,
				],
			)
			.await
			.unwrap();
		assert_eq!(affected, 1);

		let rows = conn
			.fetch_all("SELECT id, name, score, active, data FROM t", &[])
			.await
			.unwrap();
		assert_eq!(rows.len(), 1);
		let row = &rows[0];
		assert_eq!(row.get("id"), Some(&Value::Int(1)));
		assert_eq!(row.get("name"), Some(&Value::from("Roman")));
		assert_eq!(row.get("score"), Some(&Value::Float(1.5)));
		assert_eq!(row.get("active"), Some(&Value::Bool(true)));
		assert_eq!(row.get("data"), Some(&Value::Null));
	}

	#[test]
	fn test_params_for_log() {
		let rendered = params_for_log(&[Value::Int(1), Value::Null, Value::from("x")]);
		assert_eq!(rendered, r#"[1,null,"x"]"#);
	}
}
