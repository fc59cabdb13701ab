//! Field descriptors
//!
//! A [`FieldDescriptor`] records how one field of a domain type maps onto
//! document keys: its load-names, storage kind, container shape and the
//! type-erased accessor the converter uses to read and write it.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use bson::Bson;

use crate::codec::{Decoder, Encoder, MappedValue};
use crate::mapping::descriptor::{Entity, TypeDescriptor};
use crate::{OdmError, Result};

/// Reserved document key of the entity identifier
pub const ID_KEY: &str = "_id";

/// How a field is stored in the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Primitive or container of primitives, converted in place
    Value,
    /// Nested object inlined as a sub-document
    Embedded,
    /// Pointer to a document in another collection (a `Key` or bare id)
    Reference,
    /// Excluded from conversion in both directions
    Transient,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageKind::Value => "value",
            StorageKind::Embedded => "embedded",
            StorageKind::Reference => "reference",
            StorageKind::Transient => "transient",
        };
        f.write_str(name)
    }
}

/// Outermost collection shape of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerShape {
    None,
    List,
    Set,
    Map,
}

impl ContainerShape {
    pub fn is_container(&self) -> bool {
        !matches!(self, ContainerShape::None)
    }
}

/// Reference resolution switches of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReferenceOptions {
    /// `Some(true)` = lazy, `Some(false)` = eager, `None` = mapper default
    pub lazy: Option<bool>,
    /// A missing target is a conversion error instead of a null result
    pub required: bool,
    /// Store the bare identifier instead of a `{$ref, $id}` document
    pub id_only: bool,
}

impl ReferenceOptions {
    /// True if any option was set explicitly
    pub fn is_set(&self) -> bool {
        self.lazy.is_some() || self.required || self.id_only
    }
}

/// Declared Rust type of a value
#[derive(Clone, Copy)]
pub struct ValueType {
    name: &'static str,
    id: TypeId,
}

impl ValueType {
    pub fn of<T: 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            id: TypeId::of::<T>(),
        }
    }

    /// Fully qualified type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without module path or generic arguments
    pub fn short_name(&self) -> &'static str {
        short_type_name(self.name)
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for ValueType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ValueType {}

impl fmt::Debug for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Mapped type on the other end of an embedded or reference field
///
/// Carries a raw builder so structural checks can walk the embedding graph
/// without going through the registry.
#[derive(Clone, Copy)]
pub struct TargetType {
    value_type: ValueType,
    describe: fn() -> TypeDescriptor,
}

impl TargetType {
    pub fn of<T: Entity>() -> Self {
        Self {
            value_type: ValueType::of::<T>(),
            describe: TypeDescriptor::build::<T>,
        }
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Build an unvalidated, uncached descriptor of the target type
    pub fn describe(&self) -> TypeDescriptor {
        (self.describe)()
    }
}

impl fmt::Debug for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TargetType").field(&self.value_type).finish()
    }
}

/// Static shape of a [`MappedValue`] type
#[derive(Debug, Clone, Copy)]
pub struct ValueShape {
    pub kind: StorageKind,
    pub container: ContainerShape,
    /// Innermost element type (the value type itself when not a container)
    pub element: ValueType,
    pub target: Option<TargetType>,
    /// `None` is a valid value (e.g. `Option<T>`)
    pub nullable: bool,
}

impl ValueShape {
    pub fn value<T: 'static>() -> Self {
        Self {
            kind: StorageKind::Value,
            container: ContainerShape::None,
            element: ValueType::of::<T>(),
            target: None,
            nullable: false,
        }
    }

    pub fn embedded<T: Entity>() -> Self {
        Self {
            kind: StorageKind::Embedded,
            target: Some(TargetType::of::<T>()),
            ..Self::value::<T>()
        }
    }

    pub fn reference<T: Entity>() -> Self {
        Self {
            kind: StorageKind::Reference,
            target: Some(TargetType::of::<T>()),
            ..Self::value::<T>()
        }
    }

    /// Wrap in a container; the outermost container wins
    pub fn contained(mut self, container: ContainerShape) -> Self {
        self.container = container;
        self.nullable = false;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

pub(crate) type EncodeFn = dyn Fn(&dyn Any, &mut Encoder<'_>) -> Result<Option<Bson>> + Send + Sync;
pub(crate) type DecodeFn = dyn Fn(&mut dyn Any, Bson, &mut Decoder<'_>) -> Result<()> + Send + Sync;

/// Type-erased getter/setter pair for one field
#[derive(Clone)]
pub(crate) struct FieldAccessor {
    pub(crate) encode: Arc<EncodeFn>,
    pub(crate) decode: Arc<DecodeFn>,
}

impl FieldAccessor {
    pub(crate) fn new<E, F, G, S>(get: G, get_mut: S) -> Self
    where
        E: Entity,
        F: MappedValue,
        G: Fn(&E) -> &F + Send + Sync + 'static,
        S: Fn(&mut E) -> &mut F + Send + Sync + 'static,
    {
        let encode = move |entity: &dyn Any, enc: &mut Encoder<'_>| -> Result<Option<Bson>> {
            let entity = entity
                .downcast_ref::<E>()
                .ok_or_else(|| wrong_target::<E>())?;
            get(entity).encode(enc)
        };
        let decode = move |entity: &mut dyn Any, value: Bson, dec: &mut Decoder<'_>| -> Result<()> {
            let entity = entity
                .downcast_mut::<E>()
                .ok_or_else(|| wrong_target::<E>())?;
            // null on a non-nullable field keeps the default
            if matches!(value, Bson::Null) && !F::shape().nullable {
                return Ok(());
            }
            *get_mut(entity) = F::decode(value, dec)?;
            Ok(())
        };
        Self {
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }
}

fn wrong_target<E: 'static>() -> OdmError {
    OdmError::Internal(format!(
        "field accessor applied to a value that is not {}",
        std::any::type_name::<E>()
    ))
}

/// Mapping metadata for one field of a [`TypeDescriptor`]
#[derive(Clone)]
pub struct FieldDescriptor {
    pub(crate) name: String,
    pub(crate) load_names: Vec<String>,
    pub(crate) kind: StorageKind,
    pub(crate) shape: ValueShape,
    pub(crate) identifier: bool,
    pub(crate) reference: ReferenceOptions,
    pub(crate) accessor: Option<FieldAccessor>,
}

impl FieldDescriptor {
    pub(crate) fn mapped<E, F, G, S>(name: &str, identifier: bool, get: G, get_mut: S) -> Self
    where
        E: Entity,
        F: MappedValue,
        G: Fn(&E) -> &F + Send + Sync + 'static,
        S: Fn(&mut E) -> &mut F + Send + Sync + 'static,
    {
        let shape = F::shape();
        let primary = if identifier { ID_KEY } else { name };
        Self {
            name: name.to_string(),
            load_names: vec![primary.to_string()],
            kind: shape.kind,
            shape,
            identifier,
            reference: ReferenceOptions::default(),
            accessor: Some(FieldAccessor::new(get, get_mut)),
        }
    }

    pub(crate) fn transient(name: &str) -> Self {
        Self {
            name: name.to_string(),
            load_names: vec![name.to_string()],
            kind: StorageKind::Transient,
            shape: ValueShape::value::<()>(),
            identifier: false,
            reference: ReferenceOptions::default(),
            accessor: None,
        }
    }

    /// Declared field name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Document key written on save
    pub fn primary_name(&self) -> &str {
        &self.load_names[0]
    }

    /// Every document key accepted on load: primary name first, then aliases
    pub fn load_names(&self) -> &[String] {
        &self.load_names
    }

    /// Legacy names accepted on load only
    pub fn aliases(&self) -> &[String] {
        &self.load_names[1..]
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn container(&self) -> ContainerShape {
        self.shape.container
    }

    pub fn shape(&self) -> &ValueShape {
        &self.shape
    }

    /// Element type for containers, the value type otherwise
    pub fn element_type(&self) -> ValueType {
        self.shape.element
    }

    pub fn target(&self) -> Option<&TargetType> {
        self.shape.target.as_ref()
    }

    pub fn is_identifier(&self) -> bool {
        self.identifier
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StorageKind::Transient
    }

    pub fn is_nullable(&self) -> bool {
        self.shape.nullable
    }

    pub fn reference_options(&self) -> ReferenceOptions {
        self.reference
    }

    pub(crate) fn accessor(&self) -> Result<&FieldAccessor> {
        self.accessor.as_ref().ok_or_else(|| {
            OdmError::Internal(format!("field '{}' has no accessor", self.name))
        })
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("load_names", &self.load_names)
            .field("kind", &self.kind)
            .field("container", &self.shape.container)
            .field("element", &self.shape.element)
            .field("identifier", &self.identifier)
            .field("reference", &self.reference)
            .finish()
    }
}

/// Chained options for a field just added to a [`Describer`](crate::Describer)
pub struct FieldOptions<'d> {
    field: &'d mut FieldDescriptor,
}

impl<'d> FieldOptions<'d> {
    pub(crate) fn new(field: &'d mut FieldDescriptor) -> Self {
        Self { field }
    }

    /// Override the document key written on save
    pub fn name(self, name: &str) -> Self {
        self.field.load_names[0] = name.to_string();
        self
    }

    /// Also accept `name` when loading (legacy key)
    pub fn alias(self, name: &str) -> Self {
        self.field.load_names.push(name.to_string());
        self
    }

    /// Defer reference resolution until [`Ref::resolve`](crate::Ref::resolve)
    pub fn lazy(self) -> Self {
        self.field.reference.lazy = Some(true);
        self
    }

    /// Resolve the reference while decoding
    pub fn eager(self) -> Self {
        self.field.reference.lazy = Some(false);
        self
    }

    /// Treat a missing referenced document as a conversion error
    pub fn required(self) -> Self {
        self.field.reference.required = true;
        self
    }

    /// Store the bare identifier instead of a key document
    pub fn id_only(self) -> Self {
        self.field.reference.id_only = true;
        self
    }
}
