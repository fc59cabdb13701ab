//! Value codecs
//!
//! [`MappedValue`] is implemented by every type that can sit in a mapped
//! field. Primitives and containers are covered here; embedded types opt in
//! with [`embeddable!`](crate::embeddable), enumerations with
//! [`mapped_enum!`](crate::mapped_enum), references through
//! [`Ref`](crate::Ref).
//!
//! # Numeric rules
//! | field | accepts |
//! |-------|---------|
//! | `i32` | int32; int64 and integral double when in range |
//! | `i64` | int32, int64, integral double |
//! | `f64` | double, int32, int64 |
//! | `f32` | same as `f64`, written as double |

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use bson::oid::ObjectId;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};
use chrono::{DateTime, Utc};

use crate::config::MapperOptions;
use crate::convert;
use crate::datastore::ReferenceFetcher;
use crate::key::Key;
use crate::mapping::{ContainerShape, Entity, Mapper, ReferenceOptions, ValueShape};
use crate::{OdmError, Result};

/// Conversion between a Rust value and its stored [`Bson`] form
pub trait MappedValue: Sized + Send + Sync + 'static {
    /// Static storage shape, read once when the owning type is described
    fn shape() -> ValueShape;

    /// Convert to the stored form; `None` omits the key from the document
    fn encode(&self, enc: &mut Encoder<'_>) -> Result<Option<Bson>>;

    /// Convert from the stored form
    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self>;

    /// Decode a container element or optional value
    ///
    /// Returns `Ok(None)` when the value stands for nothing, e.g. a reference
    /// whose target document no longer exists.
    fn decode_optional(value: Bson, dec: &mut Decoder<'_>) -> Result<Option<Self>> {
        Self::decode(value, dec).map(Some)
    }
}

/// Human-readable BSON type name for error messages
pub fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::Boolean(_) => "bool",
        Bson::Null => "null",
        Bson::Int32(_) => "int32",
        Bson::Int64(_) => "int64",
        Bson::Timestamp(_) => "timestamp",
        Bson::Binary(_) => "binary",
        Bson::ObjectId(_) => "objectid",
        Bson::DateTime(_) => "datetime",
        Bson::Symbol(_) => "symbol",
        Bson::Decimal128(_) => "decimal128",
        Bson::RegularExpression(_) => "regex",
        _ => "unknown",
    }
}

fn render_path(path: &[String]) -> String {
    let mut rendered = String::new();
    for segment in path {
        if !rendered.is_empty() && !segment.starts_with('[') {
            rendered.push('.');
        }
        rendered.push_str(segment);
    }
    rendered
}

// =====================
// Encoder
// =====================

/// Per-call state threaded through [`MappedValue::encode`]
pub struct Encoder<'a> {
    mapper: &'a Mapper,
    root: &'static str,
    path: Vec<String>,
    reference: ReferenceOptions,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(mapper: &'a Mapper, root: &'static str) -> Self {
        Self {
            mapper,
            root,
            path: Vec::new(),
            reference: ReferenceOptions::default(),
        }
    }

    pub fn mapper(&self) -> &'a Mapper {
        self.mapper
    }

    pub fn options(&self) -> &'a MapperOptions {
        self.mapper.options()
    }

    /// Reference options of the field being encoded
    pub fn reference_options(&self) -> ReferenceOptions {
        self.reference
    }

    /// Dotted path of the value being encoded
    pub fn path(&self) -> String {
        render_path(&self.path)
    }

    /// Conversion error at the current path
    pub fn error(&self, message: impl Into<String>) -> OdmError {
        OdmError::conversion(self.root, self.path(), message)
    }

    pub(crate) fn enter(&mut self, segment: impl Into<String>, reference: ReferenceOptions) -> ReferenceOptions {
        self.path.push(segment.into());
        std::mem::replace(&mut self.reference, reference)
    }

    pub(crate) fn leave(&mut self, previous: ReferenceOptions) {
        self.path.pop();
        self.reference = previous;
    }

    fn push_index(&mut self, index: usize) {
        self.path.push(format!("[{}]", index));
    }

    fn pop(&mut self) {
        self.path.pop();
    }

    /// Inline `value` as a sub-document using its own descriptor
    pub fn embed<T: Entity>(&mut self, value: &T) -> Result<Bson> {
        let descriptor = self.mapper.descriptor::<T>()?;
        convert::encode_entity(&descriptor, value, self).map(Bson::Document)
    }

    /// Stored pointer to `value`: a key document, or the bare id for
    /// `id_only` fields
    pub fn reference_key<T: Entity>(&mut self, value: &T) -> Result<Bson> {
        let descriptor = self.mapper.descriptor::<T>()?;
        let id = convert::identifier(&descriptor, value, self)?.ok_or_else(|| {
            self.error(format!(
                "referenced {} has no identifier; save it before referencing it",
                descriptor.type_name()
            ))
        })?;
        let key = Key::new(descriptor.collection_name(), id);
        Ok(self.stored_key(&key))
    }

    /// Stored form of an existing key honoring `id_only`
    pub fn stored_key(&self, key: &Key) -> Bson {
        if self.reference.id_only {
            key.id().clone()
        } else {
            key.to_bson()
        }
    }
}

// =====================
// Decoder
// =====================

/// Outcome of a reference lookup
pub enum Resolution<T> {
    /// Resolution skipped (lazy field or no fetcher available)
    Deferred(Key),
    /// The referenced document does not exist
    Missing(Key),
    Found(T),
}

/// Per-call state threaded through [`MappedValue::decode`]
pub struct Decoder<'a> {
    mapper: &'a Mapper,
    fetcher: Option<&'a dyn ReferenceFetcher>,
    root: &'static str,
    path: Vec<String>,
    reference: ReferenceOptions,
    // keys currently being loaded by this call; stops eager cycles
    resolving: Vec<Key>,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(
        mapper: &'a Mapper,
        fetcher: Option<&'a dyn ReferenceFetcher>,
        root: &'static str,
    ) -> Self {
        Self {
            mapper,
            fetcher,
            root,
            path: Vec::new(),
            reference: ReferenceOptions::default(),
            resolving: Vec::new(),
        }
    }

    pub fn mapper(&self) -> &'a Mapper {
        self.mapper
    }

    pub fn options(&self) -> &'a MapperOptions {
        self.mapper.options()
    }

    pub fn reference_options(&self) -> ReferenceOptions {
        self.reference
    }

    pub fn path(&self) -> String {
        render_path(&self.path)
    }

    /// Conversion error at the current path
    pub fn error(&self, message: impl Into<String>) -> OdmError {
        OdmError::conversion(self.root, self.path(), message)
    }

    /// Conversion error for a value of the wrong BSON type
    pub fn unexpected(&self, expected: &str, value: &Bson) -> OdmError {
        self.error(format!("expected {}, got {}", expected, bson_type_name(value)))
    }

    pub(crate) fn enter(&mut self, segment: impl Into<String>, reference: ReferenceOptions) -> ReferenceOptions {
        self.path.push(segment.into());
        std::mem::replace(&mut self.reference, reference)
    }

    pub(crate) fn leave(&mut self, previous: ReferenceOptions) {
        self.path.pop();
        self.reference = previous;
    }

    fn push_index(&mut self, index: usize) {
        self.path.push(format!("[{}]", index));
    }

    fn push_key(&mut self, key: &str) {
        self.path.push(key.to_string());
    }

    fn pop(&mut self) {
        self.path.pop();
    }

    /// Decode a sub-document into a fresh `T`
    pub fn unembed<T: Entity>(&mut self, value: Bson) -> Result<T> {
        let document = match value {
            Bson::Document(document) => document,
            other => return Err(self.unexpected("object", &other)),
        };
        let descriptor = self.mapper.descriptor::<T>()?;
        let mut entity = T::default();
        convert::decode_into(&descriptor, &mut entity, document, self)?;
        Ok(entity)
    }

    /// Key stored in a reference field
    ///
    /// Accepts a `{$ref, $id}` document or a bare identifier, which is
    /// paired with the collection of `T`.
    pub fn reference_key<T: Entity>(&self, value: Bson) -> Result<Key> {
        if let Some(key) = Key::from_bson(&value) {
            return Ok(key);
        }
        if matches!(value, Bson::Null | Bson::Array(_)) {
            return Err(self.unexpected("reference", &value));
        }
        let collection = self.mapper.collection_name::<T>()?;
        Ok(Key::new(collection, value))
    }

    /// Load the entity a reference field points at
    ///
    /// Lazy fields and decoders without a fetcher defer. A missing target of
    /// a `required` field fails the whole call.
    pub fn load_reference<T: Entity>(&mut self, key: Key) -> Result<Resolution<T>> {
        let lazy = self
            .reference
            .lazy
            .unwrap_or(self.mapper.options().lazy_references);
        let fetcher = match self.fetcher {
            Some(fetcher) if !lazy => fetcher,
            _ => return Ok(Resolution::Deferred(key)),
        };
        if self.resolving.contains(&key) {
            tracing::debug!(key = %key, "Reference cycle, leaving unresolved");
            return Ok(Resolution::Deferred(key));
        }

        match fetcher.fetch(&key)? {
            Some(document) => {
                let descriptor = self.mapper.descriptor::<T>()?;
                self.resolving.push(key);
                let loaded = convert::load_nested::<T>(&descriptor, document, self);
                self.resolving.pop();
                loaded.map(Resolution::Found)
            }
            None if self.reference.required => Err(OdmError::MissingReference {
                field: self.path(),
                key: key.to_string(),
            }),
            None => {
                tracing::warn!(field = %self.path(), key = %key, "Referenced document not found");
                Ok(Resolution::Missing(key))
            }
        }
    }
}

// =====================
// Primitive impls
// =====================

impl MappedValue for bool {
    fn shape() -> ValueShape {
        ValueShape::value::<bool>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::Boolean(*self)))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        match value {
            Bson::Boolean(b) => Ok(b),
            other => Err(dec.unexpected("bool", &other)),
        }
    }
}

impl MappedValue for i32 {
    fn shape() -> ValueShape {
        ValueShape::value::<i32>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::Int32(*self)))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        match value {
            Bson::Int32(n) => Ok(n),
            Bson::Int64(n) => i32::try_from(n)
                .map_err(|_| dec.error(format!("int64 value {} is out of range for int32", n))),
            Bson::Double(f) if is_integral(f) && f >= i32::MIN as f64 && f <= i32::MAX as f64 => {
                Ok(f as i32)
            }
            Bson::Double(f) => Err(dec.error(format!("double value {} cannot be stored in int32", f))),
            other => Err(dec.unexpected("int32", &other)),
        }
    }
}

impl MappedValue for i64 {
    fn shape() -> ValueShape {
        ValueShape::value::<i64>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::Int64(*self)))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        match value {
            Bson::Int64(n) => Ok(n),
            Bson::Int32(n) => Ok(n as i64),
            // 2^63 is exactly representable; anything at or above it overflows
            Bson::Double(f) if is_integral(f) && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Ok(f as i64)
            }
            Bson::Double(f) => Err(dec.error(format!("double value {} cannot be stored in int64", f))),
            other => Err(dec.unexpected("int64", &other)),
        }
    }
}

impl MappedValue for f64 {
    fn shape() -> ValueShape {
        ValueShape::value::<f64>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::Double(*self)))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        match value {
            Bson::Double(f) => Ok(f),
            Bson::Int32(n) => Ok(n as f64),
            Bson::Int64(n) => Ok(n as f64),
            other => Err(dec.unexpected("double", &other)),
        }
    }
}

impl MappedValue for f32 {
    fn shape() -> ValueShape {
        ValueShape::value::<f32>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::Double(*self as f64)))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        f64::decode(value, dec).map(|f| f as f32)
    }
}

fn is_integral(f: f64) -> bool {
    f.is_finite() && f.fract() == 0.0
}

impl MappedValue for String {
    fn shape() -> ValueShape {
        ValueShape::value::<String>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::String(self.clone())))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        match value {
            Bson::String(s) => Ok(s),
            Bson::Symbol(s) => Ok(s),
            other => Err(dec.unexpected("string", &other)),
        }
    }
}

impl MappedValue for ObjectId {
    fn shape() -> ValueShape {
        ValueShape::value::<ObjectId>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::ObjectId(*self)))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        match value {
            Bson::ObjectId(oid) => Ok(oid),
            other => Err(dec.unexpected("objectid", &other)),
        }
    }
}

impl MappedValue for bson::DateTime {
    fn shape() -> ValueShape {
        ValueShape::value::<bson::DateTime>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::DateTime(*self)))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        match value {
            Bson::DateTime(dt) => Ok(dt),
            Bson::Int64(millis) => Ok(bson::DateTime::from_millis(millis)),
            other => Err(dec.unexpected("datetime", &other)),
        }
    }
}

impl MappedValue for DateTime<Utc> {
    fn shape() -> ValueShape {
        ValueShape::value::<DateTime<Utc>>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::DateTime(bson::DateTime::from_chrono(*self))))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        bson::DateTime::decode(value, dec).map(|dt| dt.to_chrono())
    }
}

impl MappedValue for Binary {
    fn shape() -> ValueShape {
        ValueShape::value::<Binary>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::Binary(self.clone())))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        match value {
            Bson::Binary(binary) => Ok(binary),
            other => Err(dec.unexpected("binary", &other)),
        }
    }
}

/// Raw byte sequence stored as generic BSON binary
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bytes(pub Vec<u8>);

impl MappedValue for Bytes {
    fn shape() -> ValueShape {
        ValueShape::value::<Bytes>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: self.0.clone(),
        })))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        Binary::decode(value, dec).map(|binary| Bytes(binary.bytes))
    }
}

impl MappedValue for Bson {
    fn shape() -> ValueShape {
        ValueShape::value::<Bson>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(self.clone()))
    }

    fn decode(value: Bson, _dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(value)
    }
}

impl MappedValue for Document {
    fn shape() -> ValueShape {
        ValueShape::value::<Document>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(Bson::Document(self.clone())))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        match value {
            Bson::Document(document) => Ok(document),
            other => Err(dec.unexpected("object", &other)),
        }
    }
}

// =====================
// Container impls
// =====================

impl<T: MappedValue> MappedValue for Option<T> {
    fn shape() -> ValueShape {
        T::shape().nullable()
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        match self {
            Some(value) => value.encode(enc),
            None if enc.options().store_nulls => Ok(Some(Bson::Null)),
            None => Ok(None),
        }
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        match value {
            Bson::Null => Ok(None),
            value => T::decode_optional(value, dec),
        }
    }
}

impl<T: MappedValue> MappedValue for Box<T> {
    fn shape() -> ValueShape {
        T::shape()
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        self.as_ref().encode(enc)
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        T::decode(value, dec).map(Box::new)
    }

    fn decode_optional(value: Bson, dec: &mut Decoder<'_>) -> Result<Option<Self>> {
        T::decode_optional(value, dec).map(|value| value.map(Box::new))
    }
}

fn encode_sequence<'v, T, I>(items: I, enc: &mut Encoder<'_>) -> Result<Option<Bson>>
where
    T: MappedValue + 'v,
    I: IntoIterator<Item = &'v T>,
{
    let mut array = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        enc.push_index(index);
        let encoded = item.encode(enc);
        enc.pop();
        // keep positions stable for omitted elements
        array.push(encoded?.unwrap_or(Bson::Null));
    }
    Ok(Some(Bson::Array(array)))
}

fn decode_sequence<T: MappedValue>(value: Bson, dec: &mut Decoder<'_>) -> Result<Vec<T>> {
    let items = match value {
        Bson::Array(items) => items,
        other => return Err(dec.unexpected("array", &other)),
    };
    let mut decoded = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        dec.push_index(index);
        let result = T::decode_optional(item, dec);
        dec.pop();
        if let Some(item) = result? {
            decoded.push(item);
        }
    }
    Ok(decoded)
}

fn check_map_key(key: &str, enc: &Encoder<'_>) -> Result<()> {
    if key.is_empty() || key.starts_with('$') || key.contains('.') || key.contains('\0') {
        return Err(enc.error(format!(
            "map key '{}' cannot be stored as a document field name",
            key
        )));
    }
    Ok(())
}

fn encode_map<'v, T, I>(entries: I, enc: &mut Encoder<'_>) -> Result<Option<Bson>>
where
    T: MappedValue + 'v,
    I: IntoIterator<Item = (&'v String, &'v T)>,
{
    let mut document = Document::new();
    for (key, value) in entries {
        check_map_key(key, enc)?;
        enc.path.push(key.clone());
        let encoded = value.encode(enc);
        enc.pop();
        if let Some(encoded) = encoded? {
            document.insert(key.clone(), encoded);
        }
    }
    Ok(Some(Bson::Document(document)))
}

fn decode_map<T: MappedValue>(value: Bson, dec: &mut Decoder<'_>) -> Result<Vec<(String, T)>> {
    let document = match value {
        Bson::Document(document) => document,
        other => return Err(dec.unexpected("object", &other)),
    };
    let mut entries = Vec::with_capacity(document.len());
    for (key, value) in document {
        dec.push_key(&key);
        let result = T::decode_optional(value, dec);
        dec.pop();
        if let Some(value) = result? {
            entries.push((key, value));
        }
    }
    Ok(entries)
}

impl<T: MappedValue> MappedValue for Vec<T> {
    fn shape() -> ValueShape {
        T::shape().contained(ContainerShape::List)
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        encode_sequence(self.iter(), enc)
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        decode_sequence(value, dec)
    }
}

impl<T: MappedValue + Eq + Hash> MappedValue for HashSet<T> {
    fn shape() -> ValueShape {
        T::shape().contained(ContainerShape::Set)
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        encode_sequence(self.iter(), enc)
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        decode_sequence(value, dec).map(|items| items.into_iter().collect())
    }
}

impl<T: MappedValue + Ord> MappedValue for BTreeSet<T> {
    fn shape() -> ValueShape {
        T::shape().contained(ContainerShape::Set)
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        encode_sequence(self.iter(), enc)
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        decode_sequence(value, dec).map(|items| items.into_iter().collect())
    }
}

impl<T: MappedValue> MappedValue for HashMap<String, T> {
    fn shape() -> ValueShape {
        T::shape().contained(ContainerShape::Map)
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        encode_map(self.iter(), enc)
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        decode_map(value, dec).map(|entries| entries.into_iter().collect())
    }
}

impl<T: MappedValue> MappedValue for BTreeMap<String, T> {
    fn shape() -> ValueShape {
        T::shape().contained(ContainerShape::Map)
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        encode_map(self.iter(), enc)
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        decode_map(value, dec).map(|entries| entries.into_iter().collect())
    }
}
