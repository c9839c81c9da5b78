//! Session and Identity Integration Tests
//!
//! **Test Coverage:**
//! - Identity map guarantees across finds and queries
//! - Lazy proxies for single-valued associations
//! - Projections, paging and counting
//! - Bulk update synchronization and bulk delete eviction
//! - Unit of work scheduling rules and their errors
//! - Circular foreign keys written by a single flush
//!
//! **Fixtures Used:**
//! - company: in-memory SQLite database with the company schema and a session

mod common;

use common::*;
use reinhardt_cti::{
	BulkDelete, BulkUpdate, Criteria, CtiError, DbBackend, EntityRef, ErrorKind, IdentityKey,
	Lifecycle, PersisterConfig, PrimaryKey, Session, SortDirection, SynchronizeStrategy, Value,
};
use rstest::*;
use std::sync::Arc;

async fn persisted_employee(session: &Session, name: &str, salary: i64) -> EntityRef {
	let employee = session.new_entity("employee").unwrap();
	employee.set("name", name).await.unwrap();
	employee.set("salary", salary).await.unwrap();
	employee.set("department", "IT").await.unwrap();
	session.persist(&employee).unwrap();
	employee
}

#[rstest]
#[tokio::test]
async fn test_find_returns_managed_instance_without_query(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;
	let employee = persisted_employee(session, "gblanco", 10).await;
	session.flush().await.unwrap();
	let id = employee.id().unwrap();

	company.connection.reset();
	let found = session.find("person", id.clone()).await.unwrap().unwrap();
	assert!(found.same(&employee));
	assert_eq!(company.connection.count(), 0);

	// A narrower type the instance does not belong to
	assert!(session.find("manager", id).await.unwrap().is_none());
	assert_eq!(company.connection.count(), 0);
}

#[rstest]
#[tokio::test]
async fn test_first_loaded_state_wins(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;
	persisted_employee(session, "gblanco", 10).await;
	session.flush().await.unwrap();
	session.clear();

	let first = session.query("employee").all().await.unwrap();
	first[0].set("name", "changed in memory").await.unwrap();

	let again = session.query("person").all().await.unwrap();
	assert_eq!(again.len(), 1);
	assert!(again[0].same(&first[0]));
	assert_eq!(again[0].get("name").await.unwrap(), Value::from("changed in memory"));
}

#[rstest]
#[tokio::test]
async fn test_find_of_wrong_subtype_is_none(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;
	let person = session.new_entity("person").unwrap();
	person.set("name", "plain").await.unwrap();
	session.persist(&person).unwrap();
	session.flush().await.unwrap();
	let id = person.id().unwrap();
	session.clear();

	assert!(session.find("manager", id.clone()).await.unwrap().is_none());
	assert!(session.find("person", id).await.unwrap().is_some());
}

/// Test that a lazy association to a leaf type is a proxy loaded on access
#[rstest]
#[tokio::test]
async fn test_lazy_to_one_proxy(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;

	let manager = session.new_entity("manager").unwrap();
	manager.set("name", "gblanco").await.unwrap();
	let car = session.new_entity("car").unwrap();
	car.set("brand", "Porsche").await.unwrap();
	manager.set_one("car", Some(&car)).await.unwrap();
	// The car is persisted through the cascade
	session.persist(&manager).unwrap();
	session.flush().await.unwrap();
	assert_eq!(car.lifecycle(), Lifecycle::Managed);
	let id = manager.id().unwrap();
	session.clear();

	company.connection.reset();
	let manager = session.find("manager", id).await.unwrap().unwrap();
	assert_eq!(company.connection.count(), 1);

	let car = manager.get_one("car").await.unwrap().unwrap();
	assert!(!car.is_initialized());
	assert_eq!(company.connection.count(), 1);

	assert_eq!(car.get("brand").await.unwrap(), Value::from("Porsche"));
	assert!(car.is_initialized());
	assert_eq!(company.connection.count(), 2);
}

#[rstest]
#[tokio::test]
async fn test_proxy_to_missing_row_fails_on_access(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;

	let proxy = session.get_reference("manager", 999).await.unwrap().unwrap();
	assert!(!proxy.is_initialized());
	let err = proxy.get("name").await.unwrap_err();
	assert!(matches!(err, CtiError::ProxyResolution { .. }));
	assert_eq!(err.kind(), ErrorKind::NotFound);
	assert!(!proxy.is_initialized());
}

#[rstest]
#[tokio::test]
async fn test_reference_to_missing_root_row_is_none(#[future] company: Company) {
	let company = company.await;
	assert!(company.session.get_reference("person", 999).await.unwrap().is_none());
}

#[rstest]
#[tokio::test]
async fn test_proxy_of_dropped_session_is_detached(#[future] company: Company) {
	let company = company.await;
	let other = Session::new(
		Arc::new(company_registry()),
		company.connection.clone(),
		PersisterConfig::default(),
	)
	.unwrap();
	let proxy = other.get_reference("car", 1).await.unwrap().unwrap();
	drop(other);

	let err = proxy.get("brand").await.unwrap_err();
	assert!(matches!(err, CtiError::Detached(_)));
}

#[rstest]
#[tokio::test]
async fn test_projection_leaves_other_fields_null(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;
	persisted_employee(session, "gblanco", 10).await;
	session.flush().await.unwrap();
	session.clear();

	let employees = session.query("employee").only(["name"]).all().await.unwrap();
	assert_eq!(employees.len(), 1);
	assert_eq!(employees[0].get("name").await.unwrap(), Value::from("gblanco"));
	assert_eq!(employees[0].get("salary").await.unwrap(), Value::Null);

	let err = session.query("employee").only(["shoe_size"]).all().await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Mapping);
}

#[rstest]
#[tokio::test]
async fn test_paging_and_counting(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;
	for (name, salary) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
		persisted_employee(session, name, salary).await;
	}
	let outsider = session.new_entity("person").unwrap();
	outsider.set("name", "e").await.unwrap();
	session.persist(&outsider).unwrap();
	session.flush().await.unwrap();

	let page = session
		.query("employee")
		.order_by("name", SortDirection::Asc)
		.offset(1)
		.limit(2)
		.all()
		.await
		.unwrap();
	let names: Vec<Value> = futures::future::try_join_all(page.iter().map(|e| e.get("name")))
		.await
		.unwrap();
	assert_eq!(names, vec![Value::from("b"), Value::from("c")]);

	assert_eq!(session.query("person").count().await.unwrap(), 5);
	assert_eq!(session.query("employee").count().await.unwrap(), 4);
	let query = session
		.query("employee")
		.filter(Criteria::gte("salary", 3));
	assert_eq!(query.count().await.unwrap(), 2);

	let err = session.query("employee").one_or_none().await.unwrap_err();
	assert!(matches!(err, CtiError::NonUniqueResult(4)));
}

#[rstest]
#[case::default_strategy(SynchronizeStrategy::False, Value::Int(10))]
#[case::evaluate(SynchronizeStrategy::Evaluate, Value::Int(99))]
#[tokio::test]
async fn test_bulk_update_synchronization(
	#[future] company: Company,
	#[case] strategy: SynchronizeStrategy,
	#[case] expected: Value,
) {
	let company = company.await;
	let session = &company.session;
	let employee = persisted_employee(session, "gblanco", 10).await;
	session.flush().await.unwrap();

	let updated = session
		.bulk_update(BulkUpdate::new("employee").set("salary", 99).synchronize(strategy))
		.await
		.unwrap();
	assert_eq!(updated, 1);
	assert_eq!(employee.get("salary").await.unwrap(), expected);

	// Neither strategy leaves the entity dirty
	company.connection.reset();
	session.flush().await.unwrap();
	assert!(company.connection.matching("UPDATE").is_empty());
}

#[rstest]
#[tokio::test]
async fn test_bulk_delete_evicts_managed_instances(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;
	let employee = persisted_employee(session, "gblanco", 10).await;
	let keeper = persisted_employee(session, "jwage", 20).await;
	session.flush().await.unwrap();

	let deleted = session
		.bulk_delete(BulkDelete::new("person").filter(Criteria::eq("name", "gblanco")))
		.await
		.unwrap();
	assert_eq!(deleted, 1);
	assert_eq!(employee.lifecycle(), Lifecycle::Removed);
	assert!(!session.contains(&employee));
	assert!(session.contains(&keeper));
	assert_eq!(company.scalar("SELECT COUNT(*) FROM company_employees").await, 1);
}

#[rstest]
#[tokio::test]
async fn test_removing_new_entity_cancels_insert(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;
	let employee = persisted_employee(session, "gblanco", 10).await;
	session.remove(&employee).unwrap();

	company.connection.reset();
	session.flush().await.unwrap();
	assert_eq!(company.connection.count(), 0);
	assert_eq!(employee.lifecycle(), Lifecycle::New);
}

#[rstest]
#[tokio::test]
async fn test_removed_entity_cannot_be_persisted(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;
	let employee = persisted_employee(session, "gblanco", 10).await;
	session.flush().await.unwrap();
	session.remove(&employee).unwrap();
	session.flush().await.unwrap();

	let err = session.persist(&employee).unwrap_err();
	assert!(matches!(err, CtiError::Detached(_)));
}

#[rstest]
#[tokio::test]
async fn test_flush_rejects_unpersisted_reference(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;
	let employee = persisted_employee(session, "gblanco", 10).await;
	let stranger = session.new_entity("person").unwrap();
	// `spouse` does not cascade
	employee.set_one("spouse", Some(&stranger)).await.unwrap();

	let err = session.flush().await.unwrap_err();
	assert!(matches!(err, CtiError::ConstraintViolation(_)));
	assert_eq!(company.connection.count(), 0);
}

#[rstest]
#[tokio::test]
async fn test_abstract_type_cannot_be_instantiated(#[future] company: Company) {
	let company = company.await;
	let err = company.session.new_entity("event").unwrap_err();
	assert!(matches!(err, CtiError::Planning(_)));
	assert!(matches!(
		company.session.new_entity("spaceship").unwrap_err(),
		CtiError::UnknownType(_)
	));
}

#[rstest]
#[tokio::test]
async fn test_session_rejects_mismatched_backend(#[future] company: Company) {
	let company = company.await;
	let err = Session::new(
		Arc::new(company_registry()),
		company.connection.clone(),
		PersisterConfig::default().with_backend(DbBackend::Postgres),
	)
	.unwrap_err();
	assert!(matches!(err, CtiError::Config(_)));
}

#[rstest]
#[tokio::test]
async fn test_removing_collection_member_deletes_link_row(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;
	let a = persisted_employee(session, "a", 1).await;
	let b = persisted_employee(session, "b", 2).await;
	let c = persisted_employee(session, "c", 3).await;
	let friends = a.collection("friends").await.unwrap();
	friends.add(&b).await.unwrap();
	friends.add(&c).await.unwrap();
	session.flush().await.unwrap();
	assert_eq!(company.scalar("SELECT COUNT(*) FROM company_persons_friends").await, 2);

	assert!(friends.remove(&b).await.unwrap());
	company.connection.reset();
	session.flush().await.unwrap();
	assert_eq!(company.connection.matching("DELETE").len(), 1);
	assert_eq!(company.scalar("SELECT COUNT(*) FROM company_persons_friends").await, 1);

	session.clear();
	let reloaded = session.find("employee", a.id().unwrap()).await.unwrap().unwrap();
	let members = reloaded.collection("friends").await.unwrap().to_vec().await.unwrap();
	assert_eq!(members.len(), 1);
	assert_eq!(members[0].id(), c.id());
}

#[rstest]
#[tokio::test]
async fn test_unknown_filter_field_is_planning_error(#[future] company: Company) {
	let company = company.await;
	let err = company
		.session
		.find_by("employee", Criteria::eq("shoe_size", 44))
		.await
		.unwrap_err();
	assert!(matches!(err, CtiError::Planning(_)));
}

/// Test circular foreign keys between two new entities in one flush
///
/// **Test Intent**: The first insert writes NULL for the link to the entity
/// without an identifier, and the same flush back-fills it
#[rstest]
#[tokio::test]
async fn test_circular_references_in_one_flush(#[future] company: Company) {
	let company = company.await;
	let session = &company.session;

	let org = session.new_entity("organization").unwrap();
	let raffle = session.new_entity("raffle").unwrap();
	raffle.set("data", "tombola").await.unwrap();
	raffle.set_one("organization", Some(&org)).await.unwrap();
	org.set_one("main_event", Some(&raffle)).await.unwrap();
	org.collection("events").await.unwrap().add(&raffle).await.unwrap();
	session.persist(&org).unwrap();
	session.flush().await.unwrap();

	let (org_id, raffle_id) = match (org.id(), raffle.id()) {
		(Some(PrimaryKey::Int(o)), Some(PrimaryKey::Int(r))) => (o, r),
		other => panic!("expected generated integer ids, got {other:?}"),
	};
	assert_eq!(
		company.scalar("SELECT main_event_id FROM company_organizations").await,
		raffle_id
	);
	assert_eq!(company.scalar("SELECT org_id FROM company_events").await, org_id);
	assert_eq!(
		raffle.identity(),
		Some(IdentityKey::new("event", raffle_id))
	);

	// Both links are clean after the flush
	company.connection.reset();
	session.flush().await.unwrap();
	assert_eq!(company.connection.count(), 0);
}
