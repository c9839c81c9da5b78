//! Error types for the inheritance persister

/// Coarse classification of a [`CtiError`], used by callers that only need
/// to tell "nothing found" apart from integrity and configuration problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// The mapping metadata or a query against it is invalid
	Mapping,
	/// Stored data disagrees with the mapping or the database rejected a write
	Integrity,
	/// A referenced row does not exist
	NotFound,
	/// The API was used in a way the current state does not allow
	Usage,
	/// The database driver or connection failed
	Backend,
}

/// Errors raised by planning, hydration and persistence
#[derive(Debug, thiserror::Error)]
pub enum CtiError {
	/// Invalid mapping metadata, or a projection/predicate that references
	/// something the mapping does not know about
	#[error("Mapping error: {0}")]
	Planning(String),

	/// A row carried a discriminator value with no registered type
	#[error("Unmapped discriminator value '{value}' in hierarchy '{root}'")]
	UnmappedDiscriminator { root: String, value: String },

	/// A proxy or to-one reference pointed at a row that does not exist
	#[error("Entity '{entity_type}' with identifier {key} could not be found")]
	ProxyResolution { entity_type: String, key: String },

	/// The database or the write ordering rejected a statement
	#[error("Constraint violation: {0}")]
	ConstraintViolation(String),

	/// A single-result query matched more than one row
	#[error("Multiple results found (expected at most 1, got {0})")]
	NonUniqueResult(usize),

	#[error("Unknown entity type '{0}'")]
	UnknownType(String),

	#[error("Unknown field '{field}' on entity type '{entity_type}'")]
	UnknownField { entity_type: String, field: String },

	/// A stored value could not be coerced into the declared field type
	#[error("Cannot convert {value} to {expected}")]
	TypeMismatch { expected: String, value: String },

	/// The entity has no live session to load through
	#[error("Entity '{0}' is not attached to an open session")]
	Detached(String),

	/// An entity without an identifier was used where one is required
	#[error("Entity '{0}' has no identifier assigned")]
	MissingIdentifier(String),

	#[error("Configuration error: {0}")]
	Config(String),

	#[error("Database error: {0}")]
	Database(#[from] sqlx::Error),

	/// Generic error from anyhow
	#[error("Connection error: {0}")]
	Connection(#[from] anyhow::Error),
}

impl CtiError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Planning(_) | Self::UnknownType(_) | Self::UnknownField { .. } | Self::Config(_) => {
				ErrorKind::Mapping
			}
			Self::UnmappedDiscriminator { .. }
			| Self::ConstraintViolation(_)
			| Self::TypeMismatch { .. }
			| Self::NonUniqueResult(_) => ErrorKind::Integrity,
			Self::ProxyResolution { .. } => ErrorKind::NotFound,
			Self::Detached(_) | Self::MissingIdentifier(_) => ErrorKind::Usage,
			Self::Database(sqlx::Error::Database(db)) if db.is_unique_violation() => {
				ErrorKind::Integrity
			}
			Self::Database(_) | Self::Connection(_) => ErrorKind::Backend,
		}
	}

	pub(crate) fn planning(message: impl Into<String>) -> Self {
		Self::Planning(message.into())
	}

	pub(crate) fn unknown_field(entity_type: &str, field: &str) -> Self {
		Self::UnknownField {
			entity_type: entity_type.to_string(),
			field: field.to_string(),
		}
	}
}

pub type Result<T, E = CtiError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_error_kinds() {
		assert_eq!(CtiError::planning("bad").kind(), ErrorKind::Mapping);
		assert_eq!(CtiError::NonUniqueResult(3).kind(), ErrorKind::Integrity);
		assert_eq!(
			CtiError::ProxyResolution {
				entity_type: "manager".into(),
				key: "7".into()
			}
			.kind(),
			ErrorKind::NotFound
		);
		assert_eq!(CtiError::Detached("person".into()).kind(), ErrorKind::Usage);
	}

	#[test]
	fn test_error_messages() {
		let err = CtiError::UnmappedDiscriminator {
			root: "person".into(),
			value: "intern".into(),
		};
		assert_eq!(
			err.to_string(),
			"Unmapped discriminator value 'intern' in hierarchy 'person'"
		);
		assert_eq!(
			CtiError::NonUniqueResult(2).to_string(),
			"Multiple results found (expected at most 1, got 2)"
		);
	}
}
