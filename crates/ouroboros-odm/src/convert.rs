//! Descriptor-driven conversion
//!
//! Field errors are collected so one failed call reports every broken
//! field. Errors that are not conversion errors (missing required
//! references, hook failures, registration failures of nested types) abort
//! immediately.

use std::any::Any;

use bson::{Bson, Document};

use crate::codec::{Decoder, Encoder};
use crate::error::ConversionIssue;
use crate::lifecycle::{self, OperationContext, Stage};
use crate::mapping::{ContainerShape, Entity, FieldDescriptor, TypeDescriptor};
use crate::{OdmError, Result};

fn collect(issues: &mut Vec<ConversionIssue>, error: OdmError) -> Result<()> {
    if error.is_fail_fast() {
        return Err(error);
    }
    issues.extend(error.issues().iter().cloned());
    Ok(())
}

fn finish<T>(type_name: &str, value: T, issues: Vec<ConversionIssue>) -> Result<T> {
    if issues.is_empty() {
        Ok(value)
    } else {
        Err(OdmError::Conversion {
            type_name: type_name.to_string(),
            issues,
        })
    }
}

/// Identifier first, then the remaining fields in declaration order
fn encode_order(descriptor: &TypeDescriptor) -> impl Iterator<Item = &FieldDescriptor> {
    let id = descriptor.persisted_fields().filter(|field| field.is_identifier());
    let rest = descriptor.persisted_fields().filter(|field| !field.is_identifier());
    id.chain(rest)
}

/// Convert `entity` (a value of the descriptor's type) to a document
pub(crate) fn encode_entity(descriptor: &TypeDescriptor, entity: &dyn Any, enc: &mut Encoder<'_>) -> Result<Document> {
    if descriptor.is_polymorphic() {
        return encode_variant(descriptor, entity, enc);
    }

    let mut document = Document::new();
    let mut issues = Vec::new();

    for field in encode_order(descriptor) {
        let accessor = field.accessor()?;
        let previous = enc.enter(field.name(), field.reference_options());
        let encoded = (accessor.encode)(entity, enc);
        enc.leave(previous);

        match encoded {
            Ok(Some(value)) if omit_empty(field, &value, enc) => {}
            Ok(Some(value)) => {
                document.insert(field.primary_name(), value);
            }
            Ok(None) => {}
            Err(error) => collect(&mut issues, error)?,
        }
    }

    finish(descriptor.type_name(), document, issues)
}

/// Empty container fields are left out unless `store_empties` is set
///
/// Only the field's own value is considered; containers nested inside it
/// and `Option`-wrapped containers are always written.
fn omit_empty(field: &FieldDescriptor, value: &Bson, enc: &Encoder<'_>) -> bool {
    if enc.options().store_empties || field.container() == ContainerShape::None || field.is_nullable() {
        return false;
    }
    match value {
        Bson::Array(items) => items.is_empty(),
        Bson::Document(entries) => entries.is_empty(),
        _ => false,
    }
}

fn encode_variant(descriptor: &TypeDescriptor, entity: &dyn Any, enc: &mut Encoder<'_>) -> Result<Document> {
    let key = enc.options().discriminator_key.clone();
    for variant in descriptor.variants() {
        if let Some(inner) = (variant.encode)(entity, enc)? {
            let mut document = Document::new();
            document.insert(key, variant.discriminator());
            for (name, value) in inner {
                document.insert(name, value);
            }
            return Ok(document);
        }
    }
    Err(enc.error(format!(
        "value of {} matches none of its declared variants",
        descriptor.type_name()
    )))
}

/// Fill `entity` from `document`
///
/// Each field reads the first of its load-names present in the document.
/// Absent keys leave the field at its current value.
pub(crate) fn decode_into(
    descriptor: &TypeDescriptor,
    entity: &mut dyn Any,
    mut document: Document,
    dec: &mut Decoder<'_>,
) -> Result<()> {
    if descriptor.is_polymorphic() {
        return decode_variant(descriptor, entity, document, dec);
    }

    let mut issues = Vec::new();

    for field in descriptor.persisted_fields() {
        let Some(value) = take_first(&mut document, field) else {
            continue;
        };
        let accessor = field.accessor()?;
        let previous = dec.enter(field.name(), field.reference_options());
        let decoded = (accessor.decode)(entity, value, dec);
        dec.leave(previous);

        if let Err(error) = decoded {
            collect(&mut issues, error)?;
        }
    }

    finish(descriptor.type_name(), (), issues)
}

fn take_first(document: &mut Document, field: &FieldDescriptor) -> Option<Bson> {
    field
        .load_names()
        .iter()
        .find(|name| document.contains_key(name.as_str()))
        .and_then(|name| document.remove(name))
}

fn decode_variant(
    descriptor: &TypeDescriptor,
    entity: &mut dyn Any,
    mut document: Document,
    dec: &mut Decoder<'_>,
) -> Result<()> {
    let key = &dec.options().discriminator_key;
    let discriminator = match document.remove(key) {
        Some(Bson::String(discriminator)) => discriminator,
        Some(other) => {
            return Err(dec.error(format!(
                "discriminator '{}' must be a string, got {}",
                key,
                crate::codec::bson_type_name(&other)
            )))
        }
        None => {
            return Err(dec.error(format!(
                "missing discriminator '{}' for {}",
                key,
                descriptor.type_name()
            )))
        }
    };

    let variant = descriptor.variant(&discriminator).ok_or_else(|| {
        dec.error(format!(
            "unknown discriminator '{}' for {}",
            discriminator,
            descriptor.type_name()
        ))
    })?;
    (variant.decode)(entity, document, dec)
}

/// Encoded identifier of `entity`; `None` when unset or the type has none
pub(crate) fn identifier(descriptor: &TypeDescriptor, entity: &dyn Any, enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
    let Some(field) = descriptor.id_field() else {
        return Ok(None);
    };
    let accessor = field.accessor()?;
    let previous = enc.enter(field.name(), field.reference_options());
    let encoded = (accessor.encode)(entity, enc);
    enc.leave(previous);
    Ok(encoded?.filter(|id| !matches!(id, Bson::Null)))
}

/// Write an identifier into `entity`
pub(crate) fn assign_identifier(
    descriptor: &TypeDescriptor,
    entity: &mut dyn Any,
    id: Bson,
    dec: &mut Decoder<'_>,
) -> Result<()> {
    let field = descriptor.id_field().ok_or_else(|| {
        OdmError::Internal(format!("{} has no identifier field", descriptor.type_name()))
    })?;
    let accessor = field.accessor()?;
    let previous = dec.enter(field.name(), field.reference_options());
    let assigned = (accessor.decode)(entity, id, dec);
    dec.leave(previous);
    assigned
}

/// PreLoad, decode, PostLoad within `ctx`
pub(crate) fn load_with_context<T: Entity>(
    descriptor: &TypeDescriptor,
    document: Document,
    dec: &mut Decoder<'_>,
    ctx: &mut OperationContext,
) -> Result<T> {
    let mut entity = T::default();
    let document = lifecycle::dispatch(descriptor, Stage::PreLoad, &mut entity, document, ctx)?;
    // PostLoad hooks see the document the entity was decoded from
    let loaded = if descriptor.has_hooks(Stage::PostLoad) {
        Some(document.clone())
    } else {
        None
    };
    decode_into(descriptor, &mut entity, document, dec)?;
    if let Some(loaded) = loaded {
        lifecycle::dispatch(descriptor, Stage::PostLoad, &mut entity, loaded, ctx)?;
    }
    Ok(entity)
}

/// Load a referenced entity in its own operation context
pub(crate) fn load_nested<T: Entity>(descriptor: &TypeDescriptor, document: Document, dec: &mut Decoder<'_>) -> Result<T> {
    let mut ctx = OperationContext::new();
    load_with_context(descriptor, document, dec, &mut ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Describer, Mapper};
    use bson::doc;
    use std::collections::HashMap;

    #[derive(Default, Debug, PartialEq)]
    struct Sample {
        id: i64,
        name: String,
        count: i32,
        ratio: f64,
        legacy: String,
    }

    impl Entity for Sample {
        fn describe(d: &mut Describer<Self>) {
            d.collection("samples");
            d.field("name", |s| &s.name, |s| &mut s.name);
            d.id("id", |s| &s.id, |s| &mut s.id);
            d.field("count", |s| &s.count, |s| &mut s.count);
            d.field("ratio", |s| &s.ratio, |s| &mut s.ratio);
            d.field("legacy", |s| &s.legacy, |s| &mut s.legacy)
                .name("current")
                .alias("previous");
        }
    }

    #[test]
    fn test_identifier_is_written_first() {
        let mapper = Mapper::new();
        let sample = Sample {
            id: 4,
            name: "n".into(),
            ..Default::default()
        };
        let document = mapper.encode(&sample).unwrap();
        let keys: Vec<_> = document.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["_id", "name", "count", "ratio", "current"]);
    }

    #[test]
    fn test_decode_reads_alias() {
        let mapper = Mapper::new();
        let sample: Sample = mapper
            .decode(doc! { "_id": 1i64, "previous": "old value" })
            .unwrap();
        assert_eq!(sample.legacy, "old value");
    }

    #[test]
    fn test_primary_name_wins_over_alias() {
        let mapper = Mapper::new();
        let sample: Sample = mapper
            .decode(doc! { "_id": 1i64, "previous": "old", "current": "new" })
            .unwrap();
        assert_eq!(sample.legacy, "new");
    }

    #[test]
    fn test_errors_are_collected() {
        let mapper = Mapper::new();
        let err = mapper
            .decode::<Sample>(doc! { "_id": 1i64, "name": 3, "count": 2.5, "ratio": "x" })
            .unwrap_err();
        let paths: Vec<_> = err.issues().iter().map(|issue| issue.path.as_str()).collect();
        assert_eq!(paths, vec!["name", "count", "ratio"]);
    }

    #[derive(Default, Debug, PartialEq)]
    struct Nested {
        id: i64,
        grid: Vec<Vec<i32>>,
        groups: HashMap<String, Vec<String>>,
        picked: Option<Vec<i32>>,
        empty: Vec<i32>,
    }

    impl Entity for Nested {
        fn describe(d: &mut Describer<Self>) {
            d.collection("nested");
            d.id("id", |n| &n.id, |n| &mut n.id);
            d.field("grid", |n| &n.grid, |n| &mut n.grid);
            d.field("groups", |n| &n.groups, |n| &mut n.groups);
            d.field("picked", |n| &n.picked, |n| &mut n.picked);
            d.field("empty", |n| &n.empty, |n| &mut n.empty);
        }
    }

    #[test]
    fn test_nested_containers_round_trip() {
        let mapper = Mapper::new();
        let nested = Nested {
            id: 1,
            grid: vec![vec![], vec![1]],
            groups: HashMap::from([("k".to_string(), Vec::new())]),
            picked: Some(Vec::new()),
            empty: Vec::new(),
        };
        let document = mapper.encode(&nested).unwrap();
        assert_eq!(
            document,
            doc! {
                "_id": 1i64,
                "grid": [[], [1]],
                "groups": { "k": [] },
                "picked": [],
            }
        );
        assert_eq!(mapper.decode::<Nested>(document).unwrap(), nested);
    }

    #[test]
    fn test_store_empties_writes_top_level_containers() {
        let mapper = Mapper::with_options(crate::MapperOptions::default().with_store_empties(true));
        let document = mapper.encode(&Nested { id: 2, ..Default::default() }).unwrap();
        assert_eq!(
            document,
            doc! { "_id": 2i64, "grid": [], "groups": {}, "empty": [] }
        );
    }

    #[test]
    fn test_null_keeps_default() {
        let mapper = Mapper::new();
        let sample: Sample = mapper.decode(doc! { "_id": 1i64, "count": null }).unwrap();
        assert_eq!(sample.count, 0);
    }
}
