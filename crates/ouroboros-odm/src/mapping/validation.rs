//! Structural validation of type descriptors
//!
//! Every descriptor is checked once, when it is registered. Each rule is a
//! [`ClassConstraint`] appending [`ConstraintViolation`]s; any
//! [`Level::Fatal`] violation aborts registration.
//!
//! # Default rules
//! | rule | level |
//! |------|-------|
//! | DuplicatedLoadNames | fatal |
//! | MultipleIdentifiers | fatal |
//! | MissingIdentifier | fatal |
//! | IdentifierKeyMapping | fatal |
//! | InvalidLoadName | fatal |
//! | InvalidCollectionName | fatal |
//! | EmbeddingCycle | fatal |
//! | ReferenceOptionsOnNonReference | warning |
//! | DuplicateVariantDiscriminator | fatal |
//! | VariantDiscriminatorKey | fatal |

use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::mapping::field::{ContainerShape, FieldDescriptor, StorageKind, ID_KEY};
use crate::mapping::{Mapper, TypeDescriptor};

/// Maximum allowed length for collection names
const MAX_COLLECTION_NAME_LENGTH: usize = 120;

/// Maximum allowed length for document field names
const MAX_FIELD_NAME_LENGTH: usize = 1024;

/// Severity of a constraint violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Reported and kept on the descriptor; registration proceeds
    Warning,
    /// Registration of the type fails
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Warning => f.write_str("WARNING"),
            Level::Fatal => f.write_str("FATAL"),
        }
    }
}

/// A structural defect found while validating a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintViolation {
    pub level: Level,
    pub type_name: String,
    pub field: Option<String>,
    pub rule: String,
    pub message: String,
}

impl ConstraintViolation {
    pub fn new(
        level: Level,
        type_name: impl Into<String>,
        field: Option<&str>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            type_name: type_name.into(),
            field: field.map(str::to_string),
            rule: rule.into(),
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.level == Level::Fatal
    }
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(
                f,
                "[{}] {}.{} ({}): {}",
                self.level, self.type_name, field, self.rule, self.message
            ),
            None => write!(
                f,
                "[{}] {} ({}): {}",
                self.level, self.type_name, self.rule, self.message
            ),
        }
    }
}

/// A structural check run once per descriptor at registration
///
/// Checks must be pure. They run while the descriptor's registry slot is
/// locked, so they must not ask `mapper` for the descriptor under check.
pub trait ClassConstraint: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>);
}

/// The built-in rule set, in evaluation order
pub fn default_constraints() -> Vec<Arc<dyn ClassConstraint>> {
    vec![
        Arc::new(DuplicatedLoadNames),
        Arc::new(MultipleIdentifiers),
        Arc::new(MissingIdentifier),
        Arc::new(IdentifierKeyMapping),
        Arc::new(InvalidLoadName),
        Arc::new(InvalidCollectionName),
        Arc::new(EmbeddingCycle),
        Arc::new(ReferenceOptionsOnNonReference),
        Arc::new(DuplicateVariantDiscriminator),
        Arc::new(VariantDiscriminatorKey),
    ]
}

fn violation(
    rule: &dyn ClassConstraint,
    level: Level,
    descriptor: &TypeDescriptor,
    field: Option<&FieldDescriptor>,
    message: String,
) -> ConstraintViolation {
    ConstraintViolation::new(
        level,
        descriptor.type_name(),
        field.map(|f| f.name()),
        rule.name(),
        message,
    )
}

// =====================
// Name checks
// =====================

/// Check a collection name
///
/// Rejects empty names, names over 120 characters, null bytes, the
/// reserved `system.` prefix and `$`.
pub fn check_collection_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("Collection name cannot be empty".to_string());
    }

    if name.len() > MAX_COLLECTION_NAME_LENGTH {
        return Err(format!(
            "Collection name exceeds maximum length of {} characters: '{}'",
            MAX_COLLECTION_NAME_LENGTH, name
        ));
    }

    if name.contains('\0') {
        return Err("Collection name cannot contain null bytes".to_string());
    }

    if name.starts_with("system.") {
        return Err(format!(
            "Collection name cannot start with 'system.' (reserved): '{}'",
            name
        ));
    }

    if name.contains('$') {
        return Err(format!("Collection name cannot contain '$' character: '{}'", name));
    }

    Ok(())
}

/// Check a document field name used as a load-name
pub fn check_load_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("Field name cannot be empty".to_string());
    }

    if name.len() > MAX_FIELD_NAME_LENGTH {
        return Err(format!(
            "Field name exceeds maximum length of {} characters",
            MAX_FIELD_NAME_LENGTH
        ));
    }

    if name.contains('\0') {
        return Err("Field name cannot contain null bytes".to_string());
    }

    if name.starts_with('$') {
        return Err(format!(
            "Field name cannot start with '$' (reserved for operators): '{}'",
            name
        ));
    }

    // dots address nested fields in queries
    if name.contains('.') {
        return Err(format!("Field name cannot contain '.': '{}'", name));
    }

    Ok(())
}

// =====================
// Rules
// =====================

/// No two load-names of one type may be equal
///
/// Names are claimed in declaration order, then alias order; the first
/// claim is never flagged and every later claim is, including a field
/// repeating one of its own names.
pub struct DuplicatedLoadNames;

impl ClassConstraint for DuplicatedLoadNames {
    fn name(&self) -> &'static str {
        "DuplicatedLoadNames"
    }

    fn check(&self, _mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        let mut seen = HashSet::new();
        for field in descriptor.persisted_fields() {
            for name in field.load_names() {
                if !seen.insert(name.as_str()) {
                    violations.push(violation(
                        self,
                        Level::Fatal,
                        descriptor,
                        Some(field),
                        format!(
                            "Mapping to document field name '{}' is duplicated; you cannot map different fields to the same document field.",
                            name
                        ),
                    ));
                }
            }
        }
    }
}

pub struct MultipleIdentifiers;

impl ClassConstraint for MultipleIdentifiers {
    fn name(&self) -> &'static str {
        "MultipleIdentifiers"
    }

    fn check(&self, _mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        let ids: Vec<_> = descriptor
            .fields()
            .iter()
            .filter(|field| field.is_identifier())
            .collect();
        if ids.len() > 1 {
            let names: Vec<_> = ids.iter().map(|field| field.name()).collect();
            violations.push(violation(
                self,
                Level::Fatal,
                descriptor,
                None,
                format!("More than one identifier field declared: {}", names.join(", ")),
            ));
        }
    }
}

/// Collection-backed types need an identifier; polymorphic wrappers are exempt
pub struct MissingIdentifier;

impl ClassConstraint for MissingIdentifier {
    fn name(&self) -> &'static str {
        "MissingIdentifier"
    }

    fn check(&self, _mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        if !descriptor.is_entity() || descriptor.is_polymorphic() {
            return;
        }
        if !descriptor.fields().iter().any(|field| field.is_identifier()) {
            violations.push(violation(
                self,
                Level::Fatal,
                descriptor,
                None,
                format!(
                    "Type is stored in collection '{}' but declares no identifier field",
                    descriptor.collection_name()
                ),
            ));
        }
    }
}

/// `_id` belongs to the identifier, and the identifier is stored under `_id`
pub struct IdentifierKeyMapping;

impl ClassConstraint for IdentifierKeyMapping {
    fn name(&self) -> &'static str {
        "IdentifierKeyMapping"
    }

    fn check(&self, _mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        for field in descriptor.persisted_fields() {
            if field.is_identifier() {
                if field.primary_name() != ID_KEY {
                    violations.push(violation(
                        self,
                        Level::Fatal,
                        descriptor,
                        Some(field),
                        format!(
                            "Identifier must be stored under '{}', not '{}'",
                            ID_KEY,
                            field.primary_name()
                        ),
                    ));
                }
            } else if field.load_names().iter().any(|name| name == ID_KEY) {
                violations.push(violation(
                    self,
                    Level::Fatal,
                    descriptor,
                    Some(field),
                    format!("'{}' is reserved for the identifier field", ID_KEY),
                ));
            }
        }
    }
}

pub struct InvalidLoadName;

impl ClassConstraint for InvalidLoadName {
    fn name(&self) -> &'static str {
        "InvalidLoadName"
    }

    fn check(&self, _mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        for field in descriptor.persisted_fields() {
            for name in field.load_names() {
                if let Err(message) = check_load_name(name) {
                    violations.push(violation(self, Level::Fatal, descriptor, Some(field), message));
                }
            }
        }
    }
}

pub struct InvalidCollectionName;

impl ClassConstraint for InvalidCollectionName {
    fn name(&self) -> &'static str {
        "InvalidCollectionName"
    }

    fn check(&self, _mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        if let Some(name) = descriptor.declared_collection() {
            if let Err(message) = check_collection_name(name) {
                violations.push(violation(self, Level::Fatal, descriptor, None, message));
            }
        }
    }
}

/// A loop of mandatory embedded fields can never be constructed or stored
///
/// Only edges that are neither containers nor nullable count: an optional
/// or collection-valued embedding terminates.
pub struct EmbeddingCycle;

impl EmbeddingCycle {
    fn mandatory_edges(descriptor: &TypeDescriptor) -> impl Iterator<Item = &FieldDescriptor> {
        descriptor.persisted_fields().filter(|field| {
            field.kind() == StorageKind::Embedded
                && field.container() == ContainerShape::None
                && !field.is_nullable()
        })
    }

    fn reaches(start: TypeId, descriptor: &TypeDescriptor, visited: &mut HashSet<TypeId>) -> bool {
        for field in Self::mandatory_edges(descriptor) {
            let Some(target) = field.target() else {
                continue;
            };
            let target_id = target.value_type().type_id();
            if target_id == start {
                return true;
            }
            if visited.insert(target_id) && Self::reaches(start, &target.describe(), visited) {
                return true;
            }
        }
        false
    }
}

impl ClassConstraint for EmbeddingCycle {
    fn name(&self) -> &'static str {
        "EmbeddingCycle"
    }

    fn check(&self, _mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        let start = descriptor.value_type().type_id();
        for field in Self::mandatory_edges(descriptor) {
            let Some(target) = field.target() else {
                continue;
            };
            let target_id = target.value_type().type_id();
            let mut visited = HashSet::from([target_id]);
            if target_id == start || Self::reaches(start, &target.describe(), &mut visited) {
                violations.push(violation(
                    self,
                    Level::Fatal,
                    descriptor,
                    Some(field),
                    format!(
                        "Embedding {} leads back to {} through mandatory embedded fields; make one of them optional or a reference",
                        target.value_type().short_name(),
                        descriptor.type_name()
                    ),
                ));
            }
        }
    }
}

pub struct ReferenceOptionsOnNonReference;

impl ClassConstraint for ReferenceOptionsOnNonReference {
    fn name(&self) -> &'static str {
        "ReferenceOptionsOnNonReference"
    }

    fn check(&self, _mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        for field in descriptor.persisted_fields() {
            if field.reference_options().is_set() && field.kind() != StorageKind::Reference {
                violations.push(violation(
                    self,
                    Level::Warning,
                    descriptor,
                    Some(field),
                    format!(
                        "Reference options have no effect on a {} field",
                        field.kind()
                    ),
                ));
            }
        }
    }
}

pub struct DuplicateVariantDiscriminator;

impl ClassConstraint for DuplicateVariantDiscriminator {
    fn name(&self) -> &'static str {
        "DuplicateVariantDiscriminator"
    }

    fn check(&self, _mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        let mut seen = HashSet::new();
        for variant in descriptor.variants() {
            if !seen.insert(variant.discriminator()) {
                violations.push(violation(
                    self,
                    Level::Fatal,
                    descriptor,
                    None,
                    format!(
                        "Discriminator '{}' is used by more than one variant",
                        variant.discriminator()
                    ),
                ));
            }
        }
    }
}

/// Variant fields may not be stored under the discriminator key
///
/// On read the discriminator is removed from the document before the
/// variant is decoded, so such a field would never be populated.
pub struct VariantDiscriminatorKey;

impl ClassConstraint for VariantDiscriminatorKey {
    fn name(&self) -> &'static str {
        "VariantDiscriminatorKey"
    }

    fn check(&self, mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        let key = mapper.options().discriminator_key.as_str();
        for variant in descriptor.variants() {
            let inner = variant.target().describe();
            for field in inner.persisted_fields() {
                if field.load_names().iter().any(|name| name == key) {
                    violations.push(violation(
                        self,
                        Level::Fatal,
                        descriptor,
                        None,
                        format!(
                            "Field {}.{} of variant '{}' is stored under the discriminator key '{}'",
                            inner.type_name(),
                            field.name(),
                            variant.discriminator(),
                            key
                        ),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Describer, Entity};

    fn run(rule: &dyn ClassConstraint, descriptor: &TypeDescriptor) -> Vec<ConstraintViolation> {
        let mapper = Mapper::new();
        let mut violations = Vec::new();
        rule.check(&mapper, descriptor, &mut violations);
        violations
    }

    #[derive(Default)]
    struct Clash {
        a: String,
        b: String,
        c: String,
    }

    impl Entity for Clash {
        fn describe(d: &mut Describer<Self>) {
            d.field("a", |t| &t.a, |t| &mut t.a).name("x");
            d.field("b", |t| &t.b, |t| &mut t.b).name("x");
            d.field("c", |t| &t.c, |t| &mut t.c).name("y");
        }
    }

    #[derive(Default)]
    struct AliasClash {
        a: String,
        b: String,
    }

    impl Entity for AliasClash {
        fn describe(d: &mut Describer<Self>) {
            d.field("a", |t| &t.a, |t| &mut t.a).alias("old").alias("a");
            d.field("b", |t| &t.b, |t| &mut t.b).alias("old");
        }
    }

    #[test]
    fn test_duplicate_flags_later_occurrence_only() {
        let violations = run(&DuplicatedLoadNames, &TypeDescriptor::build::<Clash>());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field.as_deref(), Some("b"));
        assert_eq!(violations[0].level, Level::Fatal);
        assert!(violations[0].message.contains("'x' is duplicated"));
    }

    #[test]
    fn test_duplicate_counts_aliases() {
        let violations = run(&DuplicatedLoadNames, &TypeDescriptor::build::<AliasClash>());
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].field.as_deref(), Some("a"));
        assert!(violations[0].message.contains("'a'"));
        assert_eq!(violations[1].field.as_deref(), Some("b"));
        assert!(violations[1].message.contains("'old'"));
        assert!(violations.iter().all(|v| v.level == Level::Fatal));
    }

    #[derive(Default)]
    struct SelfAlias {
        a: String,
    }

    impl Entity for SelfAlias {
        fn describe(d: &mut Describer<Self>) {
            d.field("a", |t| &t.a, |t| &mut t.a).alias("a");
        }
    }

    #[test]
    fn test_self_alias_is_fatal() {
        let violations = run(&DuplicatedLoadNames, &TypeDescriptor::build::<SelfAlias>());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].level, Level::Fatal);

        let mapper = Mapper::new();
        assert!(mapper.descriptor::<SelfAlias>().is_err());
    }

    #[derive(Default)]
    struct Tagged {
        kind: String,
    }

    impl Entity for Tagged {
        fn describe(d: &mut Describer<Self>) {
            d.field("kind", |t| &t.kind, |t| &mut t.kind).name("className");
        }
    }

    #[derive(Default)]
    struct Plain {
        label: String,
    }

    impl Entity for Plain {
        fn describe(d: &mut Describer<Self>) {
            d.field("label", |t| &t.label, |t| &mut t.label);
        }
    }

    enum Shape {
        Tagged(Tagged),
        Plain(Plain),
    }

    impl Default for Shape {
        fn default() -> Self {
            Shape::Plain(Plain::default())
        }
    }

    impl Entity for Shape {
        fn describe(d: &mut Describer<Self>) {
            d.variant("tagged", Shape::Tagged, |s| match s {
                Shape::Tagged(t) => Some(t),
                _ => None,
            });
            d.variant("plain", Shape::Plain, |s| match s {
                Shape::Plain(p) => Some(p),
                _ => None,
            });
        }
    }

    #[test]
    fn test_variant_field_on_discriminator_key() {
        let violations = run(&VariantDiscriminatorKey, &TypeDescriptor::build::<Shape>());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].level, Level::Fatal);
        assert!(violations[0].message.contains("'tagged'"));

        let mapper = Mapper::with_options(crate::MapperOptions::default().with_discriminator_key("_t"));
        let mut violations = Vec::new();
        VariantDiscriminatorKey.check(&mapper, &TypeDescriptor::build::<Shape>(), &mut violations);
        assert!(violations.is_empty());
    }

    #[test]
    fn test_valid_collection_names() {
        for name in ["users", "posts", "my_collection", "facebook_users"] {
            assert!(check_collection_name(name).is_ok(), "Should accept valid name: {}", name);
        }
    }

    #[test]
    fn test_invalid_collection_names() {
        assert!(check_collection_name("").is_err());
        assert!(check_collection_name("system.users").is_err());
        assert!(check_collection_name("bad$name").is_err());
        assert!(check_collection_name("nul\0l").is_err());
        assert!(check_collection_name(&"a".repeat(121)).is_err());
        assert!(check_collection_name(&"a".repeat(120)).is_ok());
    }

    #[test]
    fn test_invalid_load_names() {
        assert!(check_load_name("name").is_ok());
        assert!(check_load_name("_id").is_ok());
        assert!(check_load_name("").is_err());
        assert!(check_load_name("$where").is_err());
        assert!(check_load_name("a.b").is_err());
    }

    #[test]
    fn test_violation_display() {
        let v = ConstraintViolation::new(Level::Fatal, "Hotel", Some("name"), "InvalidLoadName", "bad");
        assert_eq!(v.to_string(), "[FATAL] Hotel.name (InvalidLoadName): bad");
        let v = ConstraintViolation::new(Level::Warning, "Hotel", None, "Rule", "meh");
        assert_eq!(v.to_string(), "[WARNING] Hotel (Rule): meh");
    }
}
