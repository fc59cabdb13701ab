//! Mapper configuration
//!
//! Options are plain data so they can be embedded in an application's own
//! configuration file and loaded with serde.
//!
//! ```yaml
//! lazy_references: true
//! store_empties: false
//! discriminator_key: className
//! ```

use serde::{Deserialize, Serialize};

use crate::Result;

/// Default key under which type discriminators are stored
pub const DEFAULT_DISCRIMINATOR_KEY: &str = "className";

/// Behavior switches for a [`Mapper`](crate::Mapper)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperOptions {
    /// Resolve references on first access instead of while decoding.
    /// Individual fields may override this with `lazy()` / `eager()`.
    pub lazy_references: bool,

    /// Write `null` for empty `Option` fields instead of omitting the key
    pub store_nulls: bool,

    /// Write empty lists, sets and maps instead of omitting the key
    pub store_empties: bool,

    /// Document key holding the type discriminator of polymorphic values
    pub discriminator_key: String,

    /// Log a warning when a query argument fails every validator for its operator
    pub warn_on_rejected_query: bool,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            lazy_references: false,
            store_nulls: false,
            store_empties: false,
            discriminator_key: DEFAULT_DISCRIMINATOR_KEY.to_string(),
            warn_on_rejected_query: true,
        }
    }
}

impl MapperOptions {
    /// Parse options from a YAML document; missing keys keep their defaults
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let options: MapperOptions = serde_yaml::from_str(source)?;
        options.check()
    }

    /// Parse options from a JSON document; missing keys keep their defaults
    pub fn from_json_str(source: &str) -> Result<Self> {
        let options: MapperOptions = serde_json::from_str(source)?;
        options.check()
    }

    pub fn with_lazy_references(mut self, lazy: bool) -> Self {
        self.lazy_references = lazy;
        self
    }

    pub fn with_store_nulls(mut self, store: bool) -> Self {
        self.store_nulls = store;
        self
    }

    pub fn with_store_empties(mut self, store: bool) -> Self {
        self.store_empties = store;
        self
    }

    pub fn with_discriminator_key(mut self, key: impl Into<String>) -> Self {
        self.discriminator_key = key.into();
        self
    }

    fn check(self) -> Result<Self> {
        if self.discriminator_key.is_empty() {
            return Err(crate::OdmError::Config(
                "discriminator_key cannot be empty".to_string(),
            ));
        }
        if self.discriminator_key.starts_with('$') || self.discriminator_key.contains('.') {
            return Err(crate::OdmError::Config(format!(
                "discriminator_key '{}' cannot start with '$' or contain '.'",
                self.discriminator_key
            )));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = MapperOptions::default();
        assert!(!options.lazy_references);
        assert!(!options.store_nulls);
        assert!(!options.store_empties);
        assert_eq!(options.discriminator_key, "className");
        assert!(options.warn_on_rejected_query);
    }

    #[test]
    fn test_from_yaml_partial() {
        let options = MapperOptions::from_yaml_str("lazy_references: true\nstore_empties: true\n").unwrap();
        assert!(options.lazy_references);
        assert!(options.store_empties);
        assert_eq!(options.discriminator_key, DEFAULT_DISCRIMINATOR_KEY);
    }

    #[test]
    fn test_from_json() {
        let options = MapperOptions::from_json_str(r#"{"discriminator_key": "_t"}"#).unwrap();
        assert_eq!(options.discriminator_key, "_t");
        assert!(!options.lazy_references);
    }

    #[test]
    fn test_rejects_operator_discriminator_key() {
        let result = MapperOptions::from_json_str(r#"{"discriminator_key": "$type"}"#);
        assert!(matches!(result, Err(crate::OdmError::Config(_))));
    }

    #[test]
    fn test_builder_methods() {
        let options = MapperOptions::default()
            .with_lazy_references(true)
            .with_store_nulls(true)
            .with_discriminator_key("kind");
        assert!(options.lazy_references);
        assert!(options.store_nulls);
        assert_eq!(options.discriminator_key, "kind");
    }
}
