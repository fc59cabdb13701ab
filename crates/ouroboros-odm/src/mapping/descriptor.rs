//! Type descriptors
//!
//! Domain types describe themselves once through [`Entity::describe`]; the
//! resulting [`TypeDescriptor`] is validated and cached by the
//! [`Mapper`](crate::Mapper).
//!
//! ```ignore
//! #[derive(Default)]
//! struct Hotel {
//!     id: Option<ObjectId>,
//!     name: String,
//!     address: Option<Address>,
//! }
//!
//! impl Entity for Hotel {
//!     fn describe(d: &mut Describer<Self>) {
//!         d.collection("hotels");
//!         d.id("id", |h| &h.id, |h| &mut h.id);
//!         d.field("name", |h| &h.name, |h| &mut h.name).alias("hotel_name");
//!         d.field("address", |h| &h.address, |h| &mut h.address);
//!     }
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bson::Document;

use crate::codec::{Decoder, Encoder, MappedValue};
use crate::convert;
use crate::lifecycle::{listener_hooks, EntityListener, Hook, HookOrigin, HookTable, LifecycleMethod, Stage};
use crate::mapping::field::{FieldDescriptor, FieldOptions, TargetType, ValueType};
use crate::mapping::validation::ConstraintViolation;
use crate::{OdmError, Result};

/// A domain type with a mapping description
///
/// Types declaring a [`collection`](Describer::collection) are stored as
/// top-level documents; the others can only be embedded.
pub trait Entity: Default + Send + Sync + 'static {
    fn describe(d: &mut Describer<Self>);
}

type VariantEncodeFn = dyn Fn(&dyn Any, &mut Encoder<'_>) -> Result<Option<Document>> + Send + Sync;
type VariantDecodeFn = dyn Fn(&mut dyn Any, Document, &mut Decoder<'_>) -> Result<()> + Send + Sync;

/// One concrete alternative of a polymorphic type
#[derive(Clone)]
pub struct Variant {
    pub(crate) discriminator: String,
    pub(crate) target: TargetType,
    pub(crate) encode: Arc<VariantEncodeFn>,
    pub(crate) decode: Arc<VariantDecodeFn>,
}

impl Variant {
    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    pub fn target(&self) -> &TargetType {
        &self.target
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variant")
            .field("discriminator", &self.discriminator)
            .field("target", &self.target)
            .finish()
    }
}

/// Mapping metadata for one domain type
#[derive(Clone)]
pub struct TypeDescriptor {
    pub(crate) source: ValueType,
    pub(crate) collection: Option<String>,
    pub(crate) fields: Vec<FieldDescriptor>,
    pub(crate) hooks: HookTable,
    pub(crate) variants: Vec<Variant>,
    pub(crate) warnings: Vec<ConstraintViolation>,
}

impl TypeDescriptor {
    /// Run `E::describe` and collect the result without validating it
    pub fn build<E: Entity>() -> TypeDescriptor {
        let mut describer = Describer::<E>::new();
        E::describe(&mut describer);
        describer.finish()
    }

    pub fn value_type(&self) -> ValueType {
        self.source
    }

    /// Short type name, used in messages
    pub fn type_name(&self) -> &'static str {
        self.source.short_name()
    }

    /// Collection name: the declared one, or the short type name
    pub fn collection_name(&self) -> String {
        self.collection
            .clone()
            .unwrap_or_else(|| self.type_name().to_string())
    }

    /// True for collection-backed types
    pub fn is_entity(&self) -> bool {
        self.collection.is_some()
    }

    pub fn declared_collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// All fields in declaration order, transient ones included
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Fields taking part in conversion
    pub fn persisted_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|field| !field.is_transient())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name() == name)
    }

    /// Field accepting `key` when loading
    pub fn field_by_load_name(&self, key: &str) -> Option<&FieldDescriptor> {
        self.persisted_fields()
            .find(|field| field.load_names().iter().any(|name| name == key))
    }

    /// The identifier field, if exactly one was declared
    pub fn id_field(&self) -> Option<&FieldDescriptor> {
        let mut ids = self.fields.iter().filter(|field| field.is_identifier());
        match (ids.next(), ids.next()) {
            (Some(field), None) => Some(field),
            _ => None,
        }
    }

    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    pub fn has_hooks(&self, stage: Stage) -> bool {
        self.hooks.for_stage(stage).next().is_some()
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn variant(&self, discriminator: &str) -> Option<&Variant> {
        self.variants
            .iter()
            .find(|variant| variant.discriminator == discriminator)
    }

    pub fn is_polymorphic(&self) -> bool {
        !self.variants.is_empty()
    }

    /// WARNING-level violations found when the type was registered
    pub fn warnings(&self) -> &[ConstraintViolation] {
        &self.warnings
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("type", &self.source)
            .field("collection", &self.collection)
            .field("fields", &self.fields)
            .field("hooks", &self.hooks.len())
            .field("variants", &self.variants)
            .finish()
    }
}

// =====================
// Describer
// =====================

/// Collects the mapping description of `E`
pub struct Describer<E> {
    collection: Option<String>,
    fields: Vec<FieldDescriptor>,
    hooks: HookTable,
    variants: Vec<Variant>,
    _entity: std::marker::PhantomData<fn() -> E>,
}

impl<E: Entity> Describer<E> {
    fn new() -> Self {
        Self {
            collection: None,
            fields: Vec::new(),
            hooks: HookTable::default(),
            variants: Vec::new(),
            _entity: std::marker::PhantomData,
        }
    }

    /// Store the type as top-level documents in `name`
    pub fn collection(&mut self, name: &str) -> &mut Self {
        self.collection = Some(name.to_string());
        self
    }

    /// Identifier field, stored under `_id`
    pub fn id<F, G, S>(&mut self, name: &str, get: G, get_mut: S) -> FieldOptions<'_>
    where
        F: MappedValue,
        G: Fn(&E) -> &F + Send + Sync + 'static,
        S: Fn(&mut E) -> &mut F + Send + Sync + 'static,
    {
        self.push(FieldDescriptor::mapped(name, true, get, get_mut))
    }

    /// Mapped field; storage kind and container shape follow from `F`
    pub fn field<F, G, S>(&mut self, name: &str, get: G, get_mut: S) -> FieldOptions<'_>
    where
        F: MappedValue,
        G: Fn(&E) -> &F + Send + Sync + 'static,
        S: Fn(&mut E) -> &mut F + Send + Sync + 'static,
    {
        self.push(FieldDescriptor::mapped(name, false, get, get_mut))
    }

    /// Field excluded from conversion in both directions
    pub fn transient(&mut self, name: &str) -> &mut Self {
        self.fields.push(FieldDescriptor::transient(name));
        self
    }

    /// Polymorphic alternative holding a `V`
    ///
    /// `wrap` builds `E` from a decoded `V`; `unwrap` returns the `V` when `E`
    /// holds this variant.
    pub fn variant<V: Entity>(
        &mut self,
        discriminator: &str,
        wrap: fn(V) -> E,
        unwrap: fn(&E) -> Option<&V>,
    ) -> &mut Self {
        let encode = move |value: &dyn Any, enc: &mut Encoder<'_>| -> Result<Option<Document>> {
            let value = value.downcast_ref::<E>().ok_or_else(not_a::<E>)?;
            match unwrap(value) {
                Some(inner) => {
                    let descriptor = enc.mapper().descriptor::<V>()?;
                    convert::encode_entity(&descriptor, inner, enc).map(Some)
                }
                None => Ok(None),
            }
        };
        let decode = move |target: &mut dyn Any, document: Document, dec: &mut Decoder<'_>| -> Result<()> {
            let target = target.downcast_mut::<E>().ok_or_else(not_a::<E>)?;
            let descriptor = dec.mapper().descriptor::<V>()?;
            let mut inner = V::default();
            convert::decode_into(&descriptor, &mut inner, document, dec)?;
            *target = wrap(inner);
            Ok(())
        };
        self.variants.push(Variant {
            discriminator: discriminator.to_string(),
            target: TargetType::of::<V>(),
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        });
        self
    }

    /// Entity hook run at `stage`
    pub fn hook(&mut self, stage: Stage, name: &str, method: LifecycleMethod<E>) -> &mut Self {
        let (func, replacing) = method.into_parts();
        self.hooks.push(Hook {
            name: name.to_string(),
            stage,
            origin: HookOrigin::Entity,
            replacing,
            func,
        });
        self
    }

    /// External listener; listener hooks run before entity hooks
    pub fn listener<L: EntityListener<E>>(&mut self, listener: L) -> &mut Self {
        for hook in listener_hooks::<E, L>(listener) {
            self.hooks.push(hook);
        }
        self
    }

    fn push(&mut self, field: FieldDescriptor) -> FieldOptions<'_> {
        self.fields.push(field);
        let index = self.fields.len() - 1;
        FieldOptions::new(&mut self.fields[index])
    }

    fn finish(self) -> TypeDescriptor {
        let source = ValueType::of::<E>();
        TypeDescriptor {
            source,
            collection: self.collection,
            fields: self.fields,
            hooks: self.hooks,
            variants: self.variants,
            warnings: Vec::new(),
        }
    }
}

fn not_a<E>() -> OdmError {
    OdmError::Internal(format!(
        "variant codec applied to a value that is not {}",
        std::any::type_name::<E>()
    ))
}
