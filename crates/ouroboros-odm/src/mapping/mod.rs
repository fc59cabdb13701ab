//! Mapping metadata: descriptors, validation rules and the registry

pub mod descriptor;
pub mod field;
pub mod registry;
pub mod validation;

pub use descriptor::{Describer, Entity, TypeDescriptor, Variant};
pub use field::{
    ContainerShape, FieldDescriptor, FieldOptions, ReferenceOptions, StorageKind, TargetType,
    ValueShape, ValueType, ID_KEY,
};
pub use registry::Mapper;
pub use validation::{ClassConstraint, ConstraintViolation, Level};
