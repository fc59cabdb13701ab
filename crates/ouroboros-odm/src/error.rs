//! Error types for the mapping engine

use std::fmt;

use thiserror::Error;

use crate::mapping::validation::ConstraintViolation;

/// Result type alias for mapping operations
pub type Result<T> = std::result::Result<T, OdmError>;

/// A single field-level conversion problem
///
/// Conversion errors are collected per call, so one failed `encode` or
/// `decode` reports every broken field instead of only the first one.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionIssue {
    /// Dotted path to the offending field (e.g. "address.post_code")
    pub path: String,
    /// Human-readable description
    pub message: String,
}

impl ConversionIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConversionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Unified error type for all mapping operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OdmError {
    /// One or more FATAL constraint violations; the type was not registered
    #[error("Mapping validation failed for {type_name}: {}", join(.violations))]
    MappingValidation {
        type_name: String,
        violations: Vec<ConstraintViolation>,
    },

    /// A value could not be converted for its field's declared kind
    #[error("Conversion error for {type_name}: {}", join(.issues))]
    Conversion {
        type_name: String,
        issues: Vec<ConversionIssue>,
    },

    /// A reference marked as required points at a missing document
    #[error("Missing required reference {key} for field '{field}'")]
    MissingReference { field: String, key: String },

    /// A lifecycle hook raised; the surrounding operation was aborted
    #[error("Lifecycle hook '{hook}' failed during {stage}: {message}")]
    LifecycleHook {
        stage: String,
        hook: String,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl OdmError {
    /// Build a conversion error carrying a single issue
    pub fn conversion(
        type_name: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        OdmError::Conversion {
            type_name: type_name.into(),
            issues: vec![ConversionIssue::new(path, message)],
        }
    }

    /// Returns true for errors raised while converting values
    ///
    /// A missing required reference escalates to a conversion error.
    pub fn is_conversion(&self) -> bool {
        matches!(
            self,
            OdmError::Conversion { .. } | OdmError::MissingReference { .. }
        )
    }

    /// Returns true if the error aborts a conversion immediately instead of
    /// being collected alongside sibling field errors
    pub fn is_fail_fast(&self) -> bool {
        !matches!(self, OdmError::Conversion { .. })
    }

    /// Constraint violations carried by a mapping validation error
    pub fn violations(&self) -> &[ConstraintViolation] {
        match self {
            OdmError::MappingValidation { violations, .. } => violations,
            _ => &[],
        }
    }

    /// Conversion issues carried by a conversion error
    pub fn issues(&self) -> &[ConversionIssue] {
        match self {
            OdmError::Conversion { issues, .. } => issues,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for OdmError {
    fn from(err: serde_json::Error) -> Self {
        OdmError::Config(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for OdmError {
    fn from(err: serde_yaml::Error) -> Self {
        OdmError::Config(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::validation::Level;

    #[test]
    fn test_error_display_conversion() {
        let err = OdmError::conversion("Hotel", "stars", "expected int32, got string");
        assert_eq!(
            err.to_string(),
            "Conversion error for Hotel: stars: expected int32, got string"
        );
    }

    #[test]
    fn test_error_display_lists_every_violation() {
        let err = OdmError::MappingValidation {
            type_name: "User".to_string(),
            violations: vec![
                ConstraintViolation::new(Level::Fatal, "User", Some("b"), "DuplicatedLoadNames", "first"),
                ConstraintViolation::new(Level::Fatal, "User", Some("c"), "DuplicatedLoadNames", "second"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn test_error_display_hook() {
        let err = OdmError::LifecycleHook {
            stage: "PrePersist".to_string(),
            hook: "touch".to_string(),
            message: "already called".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Lifecycle hook 'touch' failed during PrePersist: already called"
        );
    }

    #[test]
    fn test_is_conversion() {
        assert!(OdmError::conversion("T", "f", "bad").is_conversion());
        assert!(OdmError::MissingReference {
            field: "friend".to_string(),
            key: "users:1".to_string()
        }
        .is_conversion());
        assert!(!OdmError::Storage("down".to_string()).is_conversion());
    }

    #[test]
    fn test_fail_fast_classification() {
        assert!(!OdmError::conversion("T", "f", "bad").is_fail_fast());
        assert!(OdmError::Internal("x".to_string()).is_fail_fast());
        assert!(OdmError::MissingReference {
            field: "f".to_string(),
            key: "k".to_string()
        }
        .is_fail_fast());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: OdmError = json_err.into();
        assert!(matches!(err, OdmError::Config(_)));
    }
}
