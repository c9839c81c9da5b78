//! Backend-neutral statement handling
//!
//! The persister builds sea-query statements and hands them around as
//! [`QueryStatement`]; only the connection's backend decides the SQL dialect.

use crate::value::Value;
use sea_query::{
	DeleteStatement, InsertStatement, MysqlQueryBuilder, PostgresQueryBuilder, QueryStatementWriter,
	SelectStatement, SqliteQueryBuilder, UpdateStatement,
};
use serde::{Deserialize, Serialize};

/// Database backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbBackend {
	Postgres,
	Mysql,
	#[default]
	Sqlite,
}

impl DbBackend {
	/// Whether `INSERT ... RETURNING` can report a generated identifier
	pub fn supports_returning(&self) -> bool {
		!matches!(self, DbBackend::Mysql)
	}
}

/// Unified statement enum passed from the persister to a connection
#[derive(Debug, Clone)]
pub enum QueryStatement {
	Select(SelectStatement),
	Insert(InsertStatement),
	Update(UpdateStatement),
	Delete(DeleteStatement),
}

impl QueryStatement {
	/// Build SQL string and bind values according to database backend
	pub fn build(&self, backend: DbBackend) -> (String, Vec<Value>) {
		let (sql, values) = match (self, backend) {
			(QueryStatement::Select(stmt), DbBackend::Postgres) => stmt.build(PostgresQueryBuilder),
			(QueryStatement::Select(stmt), DbBackend::Mysql) => stmt.build(MysqlQueryBuilder),
			(QueryStatement::Select(stmt), DbBackend::Sqlite) => stmt.build(SqliteQueryBuilder),
			(QueryStatement::Insert(stmt), DbBackend::Postgres) => stmt.build(PostgresQueryBuilder),
			(QueryStatement::Insert(stmt), DbBackend::Mysql) => stmt.build(MysqlQueryBuilder),
			(QueryStatement::Insert(stmt), DbBackend::Sqlite) => stmt.build(SqliteQueryBuilder),
			(QueryStatement::Update(stmt), DbBackend::Postgres) => stmt.build(PostgresQueryBuilder),
			(QueryStatement::Update(stmt), DbBackend::Mysql) => stmt.build(MysqlQueryBuilder),
			(QueryStatement::Update(stmt), DbBackend::Sqlite) => stmt.build(SqliteQueryBuilder),
			(QueryStatement::Delete(stmt), DbBackend::Postgres) => stmt.build(PostgresQueryBuilder),
			(QueryStatement::Delete(stmt), DbBackend::Mysql) => stmt.build(MysqlQueryBuilder),
			(QueryStatement::Delete(stmt), DbBackend::Sqlite) => stmt.build(SqliteQueryBuilder),
		};
		(sql, values.0.into_iter().map(Value::from).collect())
	}

	/// Build SQL string only (without bind values)
	pub fn to_string(&self, backend: DbBackend) -> String {
		let (sql, _) = self.build(backend);
		sql
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use sea_query::{Alias, Expr, Query};

	#[test]
	fn test_build_per_backend() {
		let mut select = Query::select();
		select
			.column(Alias::new("id"))
			.from(Alias::new("company_persons"))
			.and_where(Expr::col(Alias::new("id")).eq(5));
		let stmt = QueryStatement::Select(select);

		let (sql, values) = stmt.build(DbBackend::Sqlite);
		assert_eq!(sql, r#"SELECT "id" FROM "company_persons" WHERE "id" = ?"#);
		assert_eq!(values, vec![Value::Int(5)]);

		let (sql, _) = stmt.build(DbBackend::Postgres);
		assert_eq!(sql, r#"SELECT "id" FROM "company_persons" WHERE "id" = $1"#);

		assert_eq!(
			stmt.to_string(DbBackend::Mysql),
			"SELECT `id` FROM `company_persons` WHERE `id` = ?"
		);
	}

	#[test]
	fn test_returning_support() {
		assert!(DbBackend::Sqlite.supports_returning());
		assert!(!DbBackend::Mysql.supports_returning());
	}
}
