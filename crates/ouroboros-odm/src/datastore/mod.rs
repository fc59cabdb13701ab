//! Storage seam and the entity-level datastore
//!
//! The mapping engine never talks to a database directly. It reads
//! referenced documents through [`ReferenceFetcher`] and writes through
//! [`Store`]; [`Datastore`] ties a [`Mapper`] to a store and runs the full
//! save and load lifecycles.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{Bson, Document};

use crate::codec::Decoder;
use crate::convert;
use crate::key::Key;
use crate::lifecycle::{self, OperationContext, Stage};
use crate::mapping::{Entity, Mapper, TypeDescriptor, ID_KEY};
use crate::reference::Ref;
use crate::{OdmError, Result};

/// Read access to stored documents by key
pub trait ReferenceFetcher: Send + Sync {
    /// The document `key` points at, or `None` if it does not exist
    fn fetch(&self, key: &Key) -> Result<Option<Document>>;
}

/// Document storage keyed by collection and `_id`
pub trait Store: ReferenceFetcher {
    /// Insert `document`, replacing any document with the same `_id`
    ///
    /// # Errors
    /// Fails if the document has no `_id`.
    fn save(&self, collection: &str, document: Document) -> Result<Key>;

    /// Remove the document `key` points at; returns whether one existed
    fn delete(&self, key: &Key) -> Result<bool>;

    fn count(&self, collection: &str) -> Result<u64>;

    /// Every document of `collection` in insertion order
    fn find_all(&self, collection: &str) -> Result<Vec<Document>>;
}

/// Entity persistence on top of a [`Store`]
///
/// # Example
///
/// ```ignore
/// let datastore = Datastore::new(Arc::new(Mapper::new()), MemoryStore::new());
/// let mut hotel = Hotel { name: "Hilton".into(), ..Default::default() };
/// let key = datastore.save(&mut hotel)?;
/// let loaded: Option<Hotel> = datastore.get_by_key(&key)?;
/// ```
pub struct Datastore<S: Store> {
    mapper: Arc<Mapper>,
    store: S,
}

impl<S: Store> Datastore<S> {
    pub fn new(mapper: Arc<Mapper>, store: S) -> Self {
        Self { mapper, store }
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // =====================
    // Saving
    // =====================

    /// Persist `entity` and return its key
    ///
    /// Runs PrePersist hooks, encodes, stores, then runs PostPersist hooks
    /// with the stored document. An unset `ObjectId` identifier is generated
    /// and written back to the entity before PostPersist.
    pub fn save<T: Entity>(&self, entity: &mut T) -> Result<Key> {
        self.save_traced(entity).map(|(key, _)| key)
    }

    /// [`save`](Self::save), also returning the hooks that fired
    pub fn save_traced<T: Entity>(&self, entity: &mut T) -> Result<(Key, OperationContext)> {
        let descriptor = self.mapper.descriptor::<T>()?;
        let collection = descriptor.collection_name();
        let mut ctx = OperationContext::new();

        let encoded = self.mapper.to_document_traced(entity, &mut ctx)?;
        let id = match encoded.get(ID_KEY) {
            Some(id) if !matches!(id, Bson::Null) => id.clone(),
            _ => self.generate_id(&descriptor, entity)?,
        };

        // _id leads the stored document
        let mut document = Document::new();
        document.insert(ID_KEY, id);
        for (name, value) in encoded {
            if name != ID_KEY {
                document.insert(name, value);
            }
        }

        let key = self.store.save(&collection, document.clone())?;
        tracing::debug!(type_name = descriptor.type_name(), key = %key, "Saved entity");

        lifecycle::dispatch(&descriptor, Stage::PostPersist, entity, document, &mut ctx)?;
        Ok((key, ctx))
    }

    /// Save each entity in order; stops at the first failure
    pub fn save_all<T: Entity>(&self, entities: &mut [T]) -> Result<Vec<Key>> {
        entities.iter_mut().map(|entity| self.save(entity)).collect()
    }

    fn generate_id<T: Entity>(&self, descriptor: &TypeDescriptor, entity: &mut T) -> Result<Bson> {
        let field = descriptor.id_field().ok_or_else(|| {
            OdmError::Storage(format!("{} has no identifier field", descriptor.type_name()))
        })?;
        if !field.element_type().is::<ObjectId>() {
            return Err(OdmError::Storage(format!(
                "{} has no identifier value and {} identifiers are not generated",
                descriptor.type_name(),
                field.element_type().short_name()
            )));
        }

        let id = Bson::ObjectId(ObjectId::new());
        let mut dec = Decoder::new(&self.mapper, None, descriptor.type_name());
        convert::assign_identifier(descriptor, entity, id.clone(), &mut dec)?;
        tracing::debug!(type_name = descriptor.type_name(), id = %id, "Generated identifier");
        Ok(id)
    }

    // =====================
    // Loading
    // =====================

    /// Load the `T` stored under `id`
    pub fn get<T: Entity>(&self, id: impl Into<Bson>) -> Result<Option<T>> {
        let key = Key::new(self.mapper.collection_name::<T>()?, id);
        self.get_by_key(&key)
    }

    pub fn get_by_key<T: Entity>(&self, key: &Key) -> Result<Option<T>> {
        Ok(self.get_traced(key)?.map(|(entity, _)| entity))
    }

    /// [`get_by_key`](Self::get_by_key), also returning the hooks that fired
    pub fn get_traced<T: Entity>(&self, key: &Key) -> Result<Option<(T, OperationContext)>> {
        let Some(document) = self.store.fetch(key)? else {
            return Ok(None);
        };
        let mut ctx = OperationContext::new();
        let entity = self
            .mapper
            .from_document_traced(document, Some(&self.store), &mut ctx)?;
        Ok(Some((entity, ctx)))
    }

    /// `key` if the document it points at exists
    pub fn exists(&self, key: &Key) -> Result<Option<Key>> {
        Ok(self.store.fetch(key)?.map(|_| key.clone()))
    }

    /// Every stored `T`, each loaded in its own operation
    pub fn find_all<T: Entity>(&self) -> Result<Vec<T>> {
        let collection = self.mapper.collection_name::<T>()?;
        self.store
            .find_all(&collection)?
            .into_iter()
            .map(|document| self.mapper.from_document_with(document, &self.store))
            .collect()
    }

    pub fn count<T: Entity>(&self) -> Result<u64> {
        self.store.count(&self.mapper.collection_name::<T>()?)
    }

    /// Load the target of a lazy reference
    pub fn resolve<'r, T: Entity>(&self, reference: &'r mut Ref<T>) -> Result<Option<&'r T>> {
        reference.resolve(&self.mapper, &self.store)
    }

    // =====================
    // Deleting
    // =====================

    pub fn delete<T: Entity>(&self, entity: &T) -> Result<bool> {
        let key = self.mapper.key_of(entity)?;
        self.store.delete(&key)
    }

    pub fn delete_by_id<T: Entity>(&self, id: impl Into<Bson>) -> Result<bool> {
        let key = Key::new(self.mapper.collection_name::<T>()?, id);
        self.store.delete(&key)
    }
}
