//! References to entities stored in another collection

use bson::Bson;

use crate::codec::{Decoder, Encoder, MappedValue, Resolution};
use crate::datastore::ReferenceFetcher;
use crate::key::Key;
use crate::lifecycle::OperationContext;
use crate::mapping::{Entity, Mapper, ValueShape};
use crate::{OdmError, Result};

/// A reference field value
///
/// Stored as a [`Key`] (or the bare identifier for `id_only` fields), never
/// as a copy of the target. Decoding yields `Resolved` when the target was
/// loaded eagerly, `Unresolved` when resolution was deferred or the target
/// is gone, and `Required` when resolution of a `required` field was
/// deferred. Resolving a `Required` reference whose target is gone fails.
#[derive(Debug, Clone, PartialEq)]
pub enum Ref<T> {
    Unresolved(Key),
    Required { key: Key, field: String },
    Resolved(Box<T>),
}

impl<T: Entity> Ref<T> {
    pub fn new(value: T) -> Self {
        Ref::Resolved(Box::new(value))
    }

    pub fn from_key(key: Key) -> Self {
        Ref::Unresolved(key)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Ref::Resolved(_))
    }

    /// The target, if loaded
    pub fn get(&self) -> Option<&T> {
        match self {
            Ref::Resolved(value) => Some(value.as_ref()),
            _ => None,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Ref::Resolved(value) => Some(value.as_mut()),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            Ref::Resolved(value) => Some(*value),
            _ => None,
        }
    }

    /// Key of the target
    pub fn key(&self, mapper: &Mapper) -> Result<Key> {
        match self {
            Ref::Unresolved(key) | Ref::Required { key, .. } => Ok(key.clone()),
            Ref::Resolved(value) => mapper.key_of(value.as_ref()),
        }
    }

    /// Key still to be loaded, with the field path when the load is required
    fn pending(&self) -> Option<(Key, Option<String>)> {
        match self {
            Ref::Unresolved(key) => Some((key.clone(), None)),
            Ref::Required { key, field } => Some((key.clone(), Some(field.clone()))),
            Ref::Resolved(_) => None,
        }
    }

    /// Load the target through `fetcher` if not loaded yet
    ///
    /// Returns `Ok(None)` and stays unresolved when the target does not
    /// exist, unless the reference came from a `required` field, which
    /// fails with [`OdmError::MissingReference`]. The load runs the target's
    /// PreLoad and PostLoad hooks.
    pub fn resolve(&mut self, mapper: &Mapper, fetcher: &dyn ReferenceFetcher) -> Result<Option<&T>> {
        if let Some((key, required)) = self.pending() {
            match fetcher.fetch(&key)? {
                Some(document) => {
                    let value =
                        mapper.from_document_traced::<T>(document, Some(fetcher), &mut OperationContext::new())?;
                    *self = Ref::Resolved(Box::new(value));
                }
                None => match required {
                    Some(field) => {
                        return Err(OdmError::MissingReference {
                            field,
                            key: key.to_string(),
                        })
                    }
                    None => {
                        tracing::warn!(key = %key, "Referenced document not found");
                        return Ok(None);
                    }
                },
            }
        }
        Ok(self.get())
    }

    fn deferred(key: Key, dec: &Decoder<'_>) -> Self {
        if dec.reference_options().required {
            Ref::Required { key, field: dec.path() }
        } else {
            Ref::Unresolved(key)
        }
    }
}

impl<T: Entity> From<T> for Ref<T> {
    fn from(value: T) -> Self {
        Ref::new(value)
    }
}

impl<T: Entity> MappedValue for Ref<T> {
    fn shape() -> ValueShape {
        ValueShape::reference::<T>()
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        match self {
            Ref::Resolved(value) => enc.reference_key(value.as_ref()).map(Some),
            Ref::Unresolved(key) | Ref::Required { key, .. } => Ok(Some(enc.stored_key(key))),
        }
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        let key = dec.reference_key::<T>(value)?;
        Ok(match dec.load_reference::<T>(key)? {
            Resolution::Found(value) => Ref::Resolved(Box::new(value)),
            Resolution::Deferred(key) => Ref::deferred(key, dec),
            Resolution::Missing(key) => Ref::Unresolved(key),
        })
    }

    fn decode_optional(value: Bson, dec: &mut Decoder<'_>) -> Result<Option<Self>> {
        let key = dec.reference_key::<T>(value)?;
        Ok(match dec.load_reference::<T>(key)? {
            Resolution::Found(value) => Some(Ref::Resolved(Box::new(value))),
            Resolution::Deferred(key) => Some(Ref::deferred(key, dec)),
            Resolution::Missing(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Describer;
    use bson::doc;

    #[derive(Default, Debug, Clone, PartialEq)]
    struct Author {
        id: i64,
        name: String,
    }

    impl Entity for Author {
        fn describe(d: &mut Describer<Self>) {
            d.collection("authors");
            d.id("id", |a| &a.id, |a| &mut a.id);
            d.field("name", |a| &a.name, |a| &mut a.name);
        }
    }

    #[derive(Default)]
    struct Book {
        id: i64,
        author: Option<Ref<Author>>,
        editor: Option<Ref<Author>>,
    }

    impl Entity for Book {
        fn describe(d: &mut Describer<Self>) {
            d.collection("books");
            d.id("id", |b| &b.id, |b| &mut b.id);
            d.field("author", |b| &b.author, |b| &mut b.author);
            d.field("editor", |b| &b.editor, |b| &mut b.editor).id_only();
        }
    }

    #[test]
    fn test_reference_stores_key_only() {
        let mapper = Mapper::new();
        let author = Author {
            id: 7,
            name: "Le Guin".into(),
        };
        let book = Book {
            id: 1,
            author: Some(Ref::new(author.clone())),
            editor: Some(Ref::new(author)),
        };
        let document = mapper.encode(&book).unwrap();
        assert_eq!(
            document,
            doc! {
                "_id": 1i64,
                "author": { "$ref": "authors", "$id": 7i64 },
                "editor": 7i64,
            }
        );
    }

    #[test]
    fn test_decode_without_fetcher_stays_unresolved() {
        let mapper = Mapper::new();
        let book: Book = mapper
            .decode(doc! { "_id": 1i64, "author": { "$ref": "authors", "$id": 7i64 }, "editor": 7i64 })
            .unwrap();
        assert_eq!(book.author, Some(Ref::Unresolved(Key::new("authors", 7i64))));
        assert_eq!(book.editor, Some(Ref::Unresolved(Key::new("authors", 7i64))));
    }

    #[test]
    fn test_deferred_required_reference_keeps_field() {
        #[derive(Default)]
        struct Signed {
            id: i64,
            signer: Option<Ref<Author>>,
        }
        impl Entity for Signed {
            fn describe(d: &mut Describer<Self>) {
                d.collection("signed");
                d.id("id", |x| &x.id, |x| &mut x.id);
                d.field("signer", |x| &x.signer, |x| &mut x.signer).required();
            }
        }

        let mapper = Mapper::new();
        let signed: Signed = mapper
            .decode(doc! { "_id": 1i64, "signer": { "$ref": "authors", "$id": 3i64 } })
            .unwrap();
        let signer = signed.signer.unwrap();
        assert_eq!(
            signer,
            Ref::Required {
                key: Key::new("authors", 3i64),
                field: "signer".to_string(),
            }
        );
        assert_eq!(signer.key(&mapper).unwrap(), Key::new("authors", 3i64));
        let document = mapper.encode(&Signed { id: 1, signer: Some(signer) }).unwrap();
        assert_eq!(document, doc! { "_id": 1i64, "signer": { "$ref": "authors", "$id": 3i64 } });
    }

    #[test]
    fn test_unsaved_reference_is_an_error() {
        let mapper = Mapper::new();

        #[derive(Default)]
        struct Draft {
            id: Option<String>,
        }
        impl Entity for Draft {
            fn describe(d: &mut Describer<Self>) {
                d.collection("drafts");
                d.id("id", |x| &x.id, |x| &mut x.id);
            }
        }
        #[derive(Default)]
        struct Holder {
            id: i64,
            draft: Option<Ref<Draft>>,
        }
        impl Entity for Holder {
            fn describe(d: &mut Describer<Self>) {
                d.collection("holders");
                d.id("id", |x| &x.id, |x| &mut x.id);
                d.field("draft", |x| &x.draft, |x| &mut x.draft);
            }
        }

        let holder = Holder {
            id: 1,
            draft: Some(Ref::new(Draft::default())),
        };
        let err = mapper.encode(&holder).unwrap_err();
        assert!(err.is_conversion());
        assert_eq!(err.issues()[0].path, "draft");
    }
}
