//! Keys: (collection, identifier) pairs pointing at one stored document

use std::fmt;

use bson::{Bson, Document};

use crate::codec::{Decoder, Encoder, MappedValue};
use crate::mapping::ValueShape;
use crate::Result;

/// Document key holding the referenced collection in a stored key
pub const REF_KEY: &str = "$ref";

/// Document key holding the referenced identifier in a stored key
pub const REF_ID_KEY: &str = "$id";

/// Reference to a stored document
///
/// Two keys are equal iff both the collection name and the identifier are
/// equal. Keys are returned by `save` and stored in place of referenced
/// entities.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    collection: String,
    id: Bson,
}

impl Key {
    pub fn new(collection: impl Into<String>, id: impl Into<Bson>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Collection (document name) the key points into
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Identifier of the referenced document
    pub fn id(&self) -> &Bson {
        &self.id
    }

    /// Stored form: `{"$ref": <collection>, "$id": <id>}`
    pub fn to_bson(&self) -> Bson {
        let mut stored = Document::new();
        stored.insert(REF_KEY, self.collection.clone());
        stored.insert(REF_ID_KEY, self.id.clone());
        Bson::Document(stored)
    }

    /// Parse the stored form written by [`Key::to_bson`]
    ///
    /// Returns `None` if the value is not a `$ref`/`$id` document.
    pub fn from_bson(value: &Bson) -> Option<Key> {
        let doc = value.as_document()?;
        let collection = doc.get_str(REF_KEY).ok()?;
        let id = doc.get(REF_ID_KEY)?;
        Some(Key::new(collection, id.clone()))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.id)
    }
}

impl MappedValue for Key {
    fn shape() -> ValueShape {
        ValueShape::value::<Key>()
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<Option<Bson>> {
        Ok(Some(self.to_bson()))
    }

    fn decode(value: Bson, dec: &mut Decoder<'_>) -> Result<Self> {
        Key::from_bson(&value).ok_or_else(|| {
            dec.error(format!(
                "expected a {{\"{}\", \"{}\"}} document, got {}",
                REF_KEY,
                REF_ID_KEY,
                crate::codec::bson_type_name(&value)
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use bson::oid::ObjectId;

    #[test]
    fn test_key_equality() {
        let id = ObjectId::new();
        assert_eq!(Key::new("users", id), Key::new("users", id));
        assert_ne!(Key::new("users", id), Key::new("admins", id));
        assert_ne!(Key::new("users", 1i64), Key::new("users", 2i64));
    }

    #[test]
    fn test_key_stored_form() {
        let key = Key::new("facebook_users", 3i64);
        assert_eq!(
            key.to_bson(),
            Bson::Document(doc! { "$ref": "facebook_users", "$id": 3i64 })
        );
        assert_eq!(Key::from_bson(&key.to_bson()), Some(key));
    }

    #[test]
    fn test_key_from_non_reference() {
        assert_eq!(Key::from_bson(&Bson::Int32(1)), None);
        assert_eq!(Key::from_bson(&Bson::Document(doc! { "$ref": "x" })), None);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(Key::new("users", "bob").to_string(), "users:\"bob\"");
    }
}
