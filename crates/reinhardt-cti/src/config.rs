//! Persister configuration

use crate::error::{CtiError, Result};
use crate::query_types::DbBackend;
use serde::{Deserialize, Serialize};

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersisterConfig {
	pub backend: DbBackend,
	/// Separator between a table alias and a column name in result labels
	pub column_alias_separator: String,
	/// Emit every statement at DEBUG level under the `reinhardt_cti::sql` target
	pub log_statements: bool,
	/// Levels of eager targets joined into one read, and the maximum number
	/// of eager resolution rounds that read may trigger
	pub max_eager_depth: usize,
	/// Maximum identifiers bound into a single `IN (...)` list by bulk operations
	pub in_list_chunk_size: usize,
}

impl Default for PersisterConfig {
	fn default() -> Self {
		Self {
			backend: DbBackend::Sqlite,
			column_alias_separator: "__".to_string(),
			log_statements: true,
			max_eager_depth: 16,
			in_list_chunk_size: 500,
		}
	}
}

impl PersisterConfig {
	/// Create a new persister configuration with default values
	///
	/// # Examples
	///
	/// ```rust
	/// use reinhardt_cti::PersisterConfig;
	///
	/// let config = PersisterConfig::new();
	/// assert_eq!(config.column_alias_separator, "__");
	/// assert_eq!(config.max_eager_depth, 16);
	/// ```
	pub fn new() -> Self {
		Self::default()
	}

	/// Parse a configuration from TOML, filling omitted keys with defaults
	///
	/// # Examples
	///
	/// ```rust
	/// use reinhardt_cti::{DbBackend, PersisterConfig};
	///
	/// let config = PersisterConfig::from_toml_str(r#"
	/// backend = "postgres"
	/// max_eager_depth = 4
	/// "#).unwrap();
	/// assert_eq!(config.backend, DbBackend::Postgres);
	/// assert_eq!(config.max_eager_depth, 4);
	/// assert!(config.log_statements);
	/// ```
	pub fn from_toml_str(source: &str) -> Result<Self> {
		let config: Self = toml::from_str(source).map_err(|e| CtiError::Config(e.to_string()))?;
		config.validate()?;
		Ok(config)
	}

	pub fn with_backend(mut self, backend: DbBackend) -> Self {
		self.backend = backend;
		self
	}

	pub fn with_column_alias_separator(mut self, separator: impl Into<String>) -> Self {
		self.column_alias_separator = separator.into();
		self
	}

	pub fn with_log_statements(mut self, enabled: bool) -> Self {
		self.log_statements = enabled;
		self
	}

	pub fn with_max_eager_depth(mut self, depth: usize) -> Self {
		self.max_eager_depth = depth;
		self
	}

	pub fn with_in_list_chunk_size(mut self, size: usize) -> Self {
		self.in_list_chunk_size = size;
		self
	}

	pub fn validate(&self) -> Result<()> {
		if self.column_alias_separator.is_empty() {
			return Err(CtiError::Config(
				"column_alias_separator must not be empty".to_string(),
			));
		}
		if !self
			.column_alias_separator
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '_')
		{
			return Err(CtiError::Config(
				"column_alias_separator may only contain ASCII letters, digits and '_'".to_string(),
			));
		}
		if self.max_eager_depth == 0 {
			return Err(CtiError::Config("max_eager_depth must be >= 1".to_string()));
		}
		if self.in_list_chunk_size == 0 {
			return Err(CtiError::Config("in_list_chunk_size must be >= 1".to_string()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[test]
	fn test_defaults_are_valid() {
		let config = PersisterConfig::default();
		assert!(config.validate().is_ok());
		assert_eq!(config.backend, DbBackend::Sqlite);
		assert_eq!(config.in_list_chunk_size, 500);
	}

	#[test]
	fn test_builder() {
		let config = PersisterConfig::new()
			.with_backend(DbBackend::Mysql)
			.with_column_alias_separator("_x_")
			.with_log_statements(false)
			.with_max_eager_depth(2)
			.with_in_list_chunk_size(50);
		assert_eq!(config.backend, DbBackend::Mysql);
		assert_eq!(config.column_alias_separator, "_x_");
		assert!(!config.log_statements);
		assert_eq!(config.max_eager_depth, 2);
		assert_eq!(config.in_list_chunk_size, 50);
	}

	#[rstest]
	#[case(PersisterConfig::new().with_column_alias_separator(""))]
	#[case(PersisterConfig::new().with_column_alias_separator("."))]
	#[case(PersisterConfig::new().with_max_eager_depth(0))]
	#[case(PersisterConfig::new().with_in_list_chunk_size(0))]
	fn test_invalid_configs(#[case] config: PersisterConfig) {
		assert!(matches!(config.validate(), Err(CtiError::Config(_))));
	}

	#[test]
	fn test_from_toml_rejects_unknown_backend() {
		let err = PersisterConfig::from_toml_str(r#"backend = "oracle""#).unwrap_err();
		assert!(matches!(err, CtiError::Config(_)));
	}
}
