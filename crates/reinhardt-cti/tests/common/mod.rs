//! Shared fixtures for the class table inheritance integration tests
//!
//! The schema models a small company: persons, employees and managers form
//! a three-level hierarchy, events form an abstract hierarchy with two
//! concrete leaves, and organizations and cars are standalone roots.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use reinhardt_cti::{
	AssociationDef, Connection, DbBackend, EntityDescriptor, FetchMode, FieldDef, FieldType,
	IdStrategy, JoinTableDef, MappingRegistry, PersisterConfig, Result, Row, Session,
	SortDirection, SqliteConnection, Value,
};
use rstest::fixture;
use std::sync::Arc;

const SCHEMA: &[&str] = &[
	"CREATE TABLE company_persons (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		discr TEXT NOT NULL,
		name TEXT,
		spouse_id INTEGER
	)",
	"CREATE TABLE company_employees (
		id INTEGER PRIMARY KEY,
		salary INTEGER,
		department TEXT,
		startDate TEXT
	)",
	"CREATE TABLE company_managers (
		id INTEGER PRIMARY KEY,
		title TEXT,
		car_id INTEGER
	)",
	"CREATE TABLE company_persons_friends (
		person_id INTEGER NOT NULL,
		friend_id INTEGER NOT NULL,
		PRIMARY KEY (person_id, friend_id)
	)",
	"CREATE TABLE company_cars (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		brand TEXT
	)",
	"CREATE TABLE company_organizations (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		main_event_id INTEGER
	)",
	"CREATE TABLE company_events (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		event_type TEXT NOT NULL,
		org_id INTEGER
	)",
	"CREATE TABLE company_auctions (
		id INTEGER PRIMARY KEY,
		data TEXT
	)",
	"CREATE TABLE company_raffles (
		id INTEGER PRIMARY KEY,
		data TEXT
	)",
];

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

pub fn company_registry() -> MappingRegistry {
	MappingRegistry::build([
		EntityDescriptor::root("person", "company_persons")
			.identifier("id", FieldType::Integer, IdStrategy::Identity)
			.discriminator_column("discr")
			.discriminator("person")
			.field(FieldDef::new("name", FieldType::Text))
			.association(AssociationDef::one_to_one("spouse", "person", "spouse_id"))
			.association(AssociationDef::many_to_many(
				"friends",
				"person",
				JoinTableDef::new("company_persons_friends", "person_id", "friend_id"),
			)),
		EntityDescriptor::child("employee", "person", "company_employees")
			.discriminator("employee")
			.field(FieldDef::new("salary", FieldType::Integer))
			.field(FieldDef::new("department", FieldType::Text))
			.field(FieldDef::new("startDate", FieldType::Timestamp)),
		EntityDescriptor::child("manager", "employee", "company_managers")
			.discriminator("manager")
			.field(FieldDef::new("title", FieldType::Text))
			.association(AssociationDef::one_to_one("car", "car", "car_id").cascade_persist()),
		EntityDescriptor::root("car", "company_cars")
			.identifier("id", FieldType::Integer, IdStrategy::Identity)
			.field(FieldDef::new("brand", FieldType::Text)),
		EntityDescriptor::root("organization", "company_organizations")
			.identifier("id", FieldType::Integer, IdStrategy::Identity)
			.association(
				AssociationDef::one_to_many("events", "event", "organization")
					.cascade_persist()
					.order_by("id", SortDirection::Asc),
			)
			.association(
				AssociationDef::many_to_one("main_event", "event", "main_event_id")
					.fetch(FetchMode::Eager)
					.cascade_persist(),
			),
		EntityDescriptor::root("event", "company_events")
			.identifier("id", FieldType::Integer, IdStrategy::Identity)
			.discriminator_column("event_type")
			.abstract_type()
			.association(AssociationDef::many_to_one("organization", "organization", "org_id")),
		EntityDescriptor::child("auction", "event", "company_auctions")
			.discriminator("auction")
			.field(FieldDef::new("data", FieldType::Text)),
		EntityDescriptor::child("raffle", "event", "company_raffles")
			.discriminator("raffle")
			.field(FieldDef::new("data", FieldType::Text)),
	])
	.expect("company mapping should be valid")
}

/// Connection wrapper that remembers every statement it executes
pub struct RecordingConnection {
	inner: SqliteConnection,
	log: Mutex<Vec<String>>,
}

impl RecordingConnection {
	pub fn new(inner: SqliteConnection) -> Self {
		Self {
			inner,
			log: Mutex::new(Vec::new()),
		}
	}

	pub fn sqlite(&self) -> &SqliteConnection {
		&self.inner
	}

	pub fn statements(&self) -> Vec<String> {
		self.log.lock().clone()
	}

	pub fn reset(&self) {
		self.log.lock().clear();
	}

	pub fn count(&self) -> usize {
		self.log.lock().len()
	}

	/// Statements starting with `prefix`, e.g. `UPDATE "company_persons"`
	pub fn matching(&self, prefix: &str) -> Vec<String> {
		self.log
			.lock()
			.iter()
			.filter(|sql| sql.starts_with(prefix))
			.cloned()
			.collect()
	}
}

#[async_trait]
impl Connection for RecordingConnection {
	fn backend(&self) -> DbBackend {
		self.inner.backend()
	}

	async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
		self.log.lock().push(sql.to_string());
		self.inner.execute(sql, params).await
	}

	async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
		self.log.lock().push(sql.to_string());
		self.inner.fetch_all(sql, params).await
	}
}

pub struct Company {
	pub session: Session,
	pub connection: Arc<RecordingConnection>,
}

impl Company {
	/// Run a scalar query directly against the database
	pub async fn scalar(&self, sql: &str) -> i64 {
		let rows = self
			.connection
			.sqlite()
			.fetch_all(sql, &[])
			.await
			.expect("scalar query should succeed");
		rows.first()
			.and_then(|row| row.iter().next().map(|(_, value)| value.clone()))
			.and_then(|value| value.as_i64())
			.unwrap_or_default()
	}
}

/// Fresh in-memory company database with an empty session
#[fixture]
pub async fn company() -> Company {
	init_tracing();
	let sqlite = SqliteConnection::in_memory()
		.await
		.expect("in-memory database should open");
	for ddl in SCHEMA {
		sqlite.execute(ddl, &[]).await.expect("schema should apply");
	}
	let connection = Arc::new(RecordingConnection::new(sqlite));
	let session = Session::new(
		Arc::new(company_registry()),
		connection.clone(),
		PersisterConfig::default(),
	)
	.expect("session should open");
	Company { session, connection }
}
