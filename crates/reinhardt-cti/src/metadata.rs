//! Mapping metadata
//!
//! Entity descriptors declare, per type level, the table, the fields stored
//! there and the associations declared there. [`MappingRegistry`] validates a
//! full set of descriptors and answers hierarchy questions for the planner,
//! hydrator and persister.

pub mod descriptor;
pub mod registry;

pub use descriptor::{
	AssociationDef, AssociationKind, AssociationMapping, EntityDescriptor, FetchMode, FieldDef,
	IdStrategy, IdentifierDef, JoinTableDef, SortDirection,
};
pub use registry::MappingRegistry;
