//! # Reinhardt CTI
//!
//! Class table inheritance persistence for Reinhardt.
//!
//! Every level of an entity hierarchy is stored in its own table, all levels
//! sharing the root's primary key. This crate provides:
//! - **Mapping metadata**: entity descriptors and a validated registry
//! - **Join planning**: which tables to join for a requested type
//! - **Discriminator resolution**: the concrete type of every row
//! - **Hydration**: entities built from joined rows through an identity map
//! - **Lazy loading**: proxies for single-valued and placeholder collections
//!   for collection-valued associations
//! - **Persistence**: per-table INSERT/UPDATE/DELETE sequences and bulk
//!   operations scoped through the full join
//!
//! ## Join planning
//!
//! Reading a type joins its ancestors with INNER JOINs and its descendants
//! with LEFT JOINs. Reading the root of a hierarchy therefore reads every
//! table, while reading a leaf reads only its chain.
//!
//! ## Identity
//!
//! Within one [`Session`] each `(root type, identifier)` pair maps to a single
//! [`EntityRef`]. Loading an identity again returns the same instance and
//! keeps its in-memory state.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reinhardt_cti::{
//! 	Criteria, EntityDescriptor, FieldDef, FieldType, IdStrategy, MappingRegistry,
//! 	PersisterConfig, Session, SortDirection, SqliteConnection,
//! };
//!
//! # async fn example() -> reinhardt_cti::Result<()> {
//! let registry = MappingRegistry::build([
//! 	EntityDescriptor::root("person", "company_persons")
//! 		.identifier("id", FieldType::Integer, IdStrategy::Identity)
//! 		.discriminator_column("discr")
//! 		.discriminator("person")
//! 		.field(FieldDef::new("name", FieldType::Text)),
//! 	EntityDescriptor::child("employee", "person", "company_employees")
//! 		.discriminator("employee")
//! 		.field(FieldDef::new("salary", FieldType::Integer)),
//! ])?;
//! let connection = SqliteConnection::connect("sqlite://company.db").await?;
//! let session = Session::new(Arc::new(registry), Arc::new(connection), PersisterConfig::default())?;
//!
//! let people = session
//! 	.query("person")
//! 	.filter(Criteria::like("name", "G%"))
//! 	.order_by("name", SortDirection::Desc)
//! 	.all()
//! 	.await?;
//! for person in people {
//! 	println!("{} {:?}", person.entity_type(), person.get("name").await?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod collection;
pub mod config;
pub mod connection;
pub mod criteria;
pub mod discriminator;
pub mod entity;
pub mod error;
mod hydrator;
pub mod identity_map;
pub mod metadata;
pub mod persister;
pub mod planner;
pub mod proxy;
pub mod query;
pub mod query_types;
pub mod session;
pub mod value;

pub use bulk::{BulkDelete, BulkUpdate, SynchronizeStrategy};
pub use collection::LazyCollection;
pub use config::PersisterConfig;
pub use connection::{Connection, SqliteConnection};
pub use criteria::{ColumnResolver, CompareOp, Criteria, Predicate, ResolvedColumn};
pub use discriminator::DiscriminatorMap;
pub use entity::{EntityRef, Lifecycle};
pub use error::{CtiError, ErrorKind, Result};
pub use identity_map::IdentityMap;
pub use metadata::{
	AssociationDef, AssociationKind, AssociationMapping, EntityDescriptor, FetchMode, FieldDef,
	IdStrategy, IdentifierDef, JoinTableDef, MappingRegistry, SortDirection,
};
pub use persister::{JoinedTablePersister, SelectRequest};
pub use planner::{JoinPlan, JoinPlanner, TableJoinKind};
pub use proxy::{EntityLoader, ProxyFactory};
pub use query::EntityQuery;
pub use query_types::{DbBackend, QueryStatement};
pub use session::Session;
pub use value::{FieldType, IdentityKey, PrimaryKey, Row, Value};
