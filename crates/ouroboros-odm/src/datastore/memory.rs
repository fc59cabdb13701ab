//! In-process [`Store`]

use std::collections::HashMap;

use bson::{Bson, Document};
use parking_lot::RwLock;

use super::{ReferenceFetcher, Store};
use crate::key::Key;
use crate::mapping::ID_KEY;
use crate::{OdmError, Result};

/// Identifier equality that treats numerically equal int32, int64 and
/// double ids as the same document
fn same_id(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Int32(x), Bson::Int64(y)) | (Bson::Int64(y), Bson::Int32(x)) => i64::from(*x) == *y,
        (Bson::Int32(x), Bson::Double(y)) | (Bson::Double(y), Bson::Int32(x)) => f64::from(*x) == *y,
        (Bson::Int64(x), Bson::Double(y)) | (Bson::Double(y), Bson::Int64(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn has_id(document: &Document, id: &Bson) -> bool {
    document.get(ID_KEY).is_some_and(|stored| same_id(stored, id))
}

/// Collections of documents held in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of collections holding at least one document, sorted
    pub fn collection_names(&self) -> Vec<String> {
        let collections = self.collections.read();
        let mut names: Vec<_> = collections
            .iter()
            .filter(|(_, documents)| !documents.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.collections.write().clear();
    }
}

impl ReferenceFetcher for MemoryStore {
    fn fetch(&self, key: &Key) -> Result<Option<Document>> {
        let collections = self.collections.read();
        Ok(collections
            .get(key.collection())
            .and_then(|documents| documents.iter().find(|doc| has_id(doc, key.id())))
            .cloned())
    }
}

impl Store for MemoryStore {
    fn save(&self, collection: &str, document: Document) -> Result<Key> {
        let id = match document.get(ID_KEY) {
            Some(Bson::Null) | None => {
                return Err(OdmError::Storage(format!(
                    "document for '{}' has no {}",
                    collection, ID_KEY
                )))
            }
            Some(id) => id.clone(),
        };

        let mut collections = self.collections.write();
        let documents = collections.entry(collection.to_string()).or_default();
        match documents.iter_mut().find(|doc| has_id(doc, &id)) {
            Some(existing) => *existing = document,
            None => documents.push(document),
        }
        Ok(Key::new(collection, id))
    }

    fn delete(&self, key: &Key) -> Result<bool> {
        let mut collections = self.collections.write();
        let Some(documents) = collections.get_mut(key.collection()) else {
            return Ok(false);
        };
        let before = documents.len();
        documents.retain(|doc| !has_id(doc, key.id()));
        Ok(documents.len() != before)
    }

    fn count(&self, collection: &str) -> Result<u64> {
        let collections = self.collections.read();
        Ok(collections.get(collection).map_or(0, |documents| documents.len() as u64))
    }

    fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        let collections = self.collections.read();
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }
}
