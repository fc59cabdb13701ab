//! Object-document mapping engine for ouroboros
//!
//! Maps Rust types to BSON documents through explicit type descriptors.
//!
//! # Features
//! - Descriptor registry with constraint validation and per-type caching
//! - Value, embedded and reference fields, containers, polymorphic variants
//! - Lifecycle hooks and entity listeners with per-operation tracing
//! - Advisory validation of query filter arguments
//! - GeoJSON geometries
//!
//! ```ignore
//! use ouroboros_odm::{Datastore, Describer, Entity, Mapper, MemoryStore};
//!
//! #[derive(Default)]
//! struct User {
//!     id: Option<ObjectId>,
//!     email: String,
//! }
//!
//! impl Entity for User {
//!     fn describe(d: &mut Describer<Self>) {
//!         d.collection("users");
//!         d.id("id", |u| &u.id, |u| &mut u.id);
//!         d.field("email", |u| &u.email, |u| &mut u.email);
//!     }
//! }
//!
//! let datastore = Datastore::new(Arc::new(Mapper::new()), MemoryStore::new());
//! let key = datastore.save(&mut User { email: "a@b.c".into(), ..Default::default() })?;
//! ```

pub mod codec;
pub mod config;
mod convert;
pub mod datastore;
pub mod error;
pub mod geo;
pub mod key;
pub mod lifecycle;
pub mod mapping;
pub mod query;
pub mod reference;

pub use codec::{Bytes, Decoder, Encoder, MappedValue, Resolution};
pub use config::MapperOptions;
pub use datastore::{Datastore, MemoryStore, ReferenceFetcher, Store};
pub use error::{ConversionIssue, OdmError, Result};
pub use key::Key;
pub use lifecycle::{EntityListener, FiredHook, LifecycleMethod, OperationContext, Stage};
pub use mapping::{ConstraintViolation, Describer, Entity, Level, Mapper, TypeDescriptor, ValueShape};
pub use reference::Ref;

pub use bson;

/// Implement [`MappedValue`] for embedded [`Entity`] types
///
/// The value is stored inline as a sub-document built from the type's own
/// descriptor.
///
/// ```ignore
/// embeddable!(Address, Phone);
/// ```
#[macro_export]
macro_rules! embeddable {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::codec::MappedValue for $ty {
            fn shape() -> $crate::mapping::ValueShape {
                $crate::mapping::ValueShape::embedded::<$ty>()
            }

            fn encode(
                &self,
                enc: &mut $crate::codec::Encoder<'_>,
            ) -> $crate::Result<::std::option::Option<$crate::bson::Bson>> {
                enc.embed(self).map(::std::option::Option::Some)
            }

            fn decode(
                value: $crate::bson::Bson,
                dec: &mut $crate::codec::Decoder<'_>,
            ) -> $crate::Result<Self> {
                dec.unembed(value)
            }
        }
    )+};
}

/// Implement [`MappedValue`] for a fieldless enum stored by name
///
/// ```ignore
/// mapped_enum!(HotelType { HotelType::Business => "BUSINESS", HotelType::Leisure => "LEISURE" });
/// ```
#[macro_export]
macro_rules! mapped_enum {
    ($ty:ty { $($variant:path => $name:literal),+ $(,)? }) => {
        impl $crate::codec::MappedValue for $ty {
            fn shape() -> $crate::mapping::ValueShape {
                $crate::mapping::ValueShape::value::<$ty>()
            }

            fn encode(
                &self,
                _enc: &mut $crate::codec::Encoder<'_>,
            ) -> $crate::Result<::std::option::Option<$crate::bson::Bson>> {
                let name = match self {
                    $($variant => $name,)+
                };
                Ok(::std::option::Option::Some($crate::bson::Bson::String(name.to_string())))
            }

            fn decode(
                value: $crate::bson::Bson,
                dec: &mut $crate::codec::Decoder<'_>,
            ) -> $crate::Result<Self> {
                match value {
                    $crate::bson::Bson::String(name) => match name.as_str() {
                        $($name => Ok($variant),)+
                        other => Err(dec.error(format!(
                            "unknown {} value '{}'",
                            stringify!($ty),
                            other
                        ))),
                    },
                    other => Err(dec.unexpected("string", &other)),
                }
            }
        }
    };
}
