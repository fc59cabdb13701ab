//! Mapping registry
//!
//! The [`Mapper`] owns validated descriptors keyed by type. A descriptor is
//! built on first use, checked against every [`ClassConstraint`] and cached
//! only when no FATAL violation was found.
//!
//! Each type has its own slot guarded by a mutex, so exactly one build runs
//! per type at a time. Callers that were already waiting when a build failed
//! receive that same failure; callers arriving later try again.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bson::{Bson, Document};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::codec::{Decoder, Encoder};
use crate::config::MapperOptions;
use crate::convert;
use crate::datastore::ReferenceFetcher;
use crate::key::Key;
use crate::lifecycle::{self, OperationContext, Stage};
use crate::mapping::descriptor::{Entity, TypeDescriptor};
use crate::mapping::validation::{default_constraints, ClassConstraint, ConstraintViolation};
use crate::query::{DeclaredType, FilterOperator, QueryValidators, Validation};
use crate::{OdmError, Result};

#[derive(Default)]
struct SlotState {
    descriptor: Option<Arc<TypeDescriptor>>,
    // failure generation and the error it produced
    last_failure: Option<(u64, OdmError)>,
}

#[derive(Default)]
struct Slot {
    failures: AtomicU64,
    state: Mutex<SlotState>,
}

/// Registry of validated type descriptors
pub struct Mapper {
    options: MapperOptions,
    slots: Mutex<HashMap<TypeId, Arc<Slot>>>,
    constraints: Vec<Arc<dyn ClassConstraint>>,
    query_validators: QueryValidators,
    builds: AtomicUsize,
}

static GLOBAL_MAPPER: Lazy<Mapper> = Lazy::new(Mapper::new);

impl Default for Mapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapper {
    pub fn new() -> Self {
        Self::with_options(MapperOptions::default())
    }

    pub fn with_options(options: MapperOptions) -> Self {
        let mut query_validators = QueryValidators::default();
        query_validators.set_warn_on_reject(options.warn_on_rejected_query);
        Self {
            options,
            slots: Mutex::new(HashMap::new()),
            constraints: default_constraints(),
            query_validators,
            builds: AtomicUsize::new(0),
        }
    }

    /// Process-wide registry with default options
    pub fn global() -> &'static Mapper {
        &GLOBAL_MAPPER
    }

    pub fn options(&self) -> &MapperOptions {
        &self.options
    }

    /// Install an additional rule; applies to types registered afterwards
    pub fn add_constraint<C: ClassConstraint + 'static>(&mut self, constraint: C) {
        self.constraints.push(Arc::new(constraint));
    }

    pub fn query_validators(&self) -> &QueryValidators {
        &self.query_validators
    }

    pub fn query_validators_mut(&mut self) -> &mut QueryValidators {
        &mut self.query_validators
    }

    // =====================
    // Descriptor cache
    // =====================

    fn slot(&self, type_id: TypeId) -> Arc<Slot> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(type_id).or_default())
    }

    /// Validated descriptor of `T`, building it on first use
    ///
    /// # Errors
    /// Returns [`OdmError::MappingValidation`] listing every FATAL violation.
    /// Nothing is cached on failure.
    pub fn descriptor<T: Entity>(&self) -> Result<Arc<TypeDescriptor>> {
        let slot = self.slot(TypeId::of::<T>());
        let observed = slot.failures.load(Ordering::Acquire);
        let mut state = slot.state.lock();

        if let Some(descriptor) = &state.descriptor {
            return Ok(Arc::clone(descriptor));
        }

        if let Some((generation, error)) = &state.last_failure {
            // the build we waited on failed
            if *generation > observed {
                return Err(error.clone());
            }
        }

        match self.build_validated::<T>() {
            Ok(descriptor) => {
                let descriptor = Arc::new(descriptor);
                state.descriptor = Some(Arc::clone(&descriptor));
                state.last_failure = None;
                tracing::debug!(type_name = descriptor.type_name(), "Cached type descriptor");
                Ok(descriptor)
            }
            Err(error) => {
                let generation = slot.failures.fetch_add(1, Ordering::AcqRel) + 1;
                state.last_failure = Some((generation, error.clone()));
                Err(error)
            }
        }
    }

    fn build_validated<T: Entity>(&self) -> Result<TypeDescriptor> {
        self.builds.fetch_add(1, Ordering::Relaxed);
        let mut descriptor = TypeDescriptor::build::<T>();
        tracing::debug!(
            type_name = descriptor.type_name(),
            fields = descriptor.fields().len(),
            "Built type descriptor"
        );

        let violations = self.run_constraints(&descriptor);
        let (fatal, warnings): (Vec<_>, Vec<_>) =
            violations.into_iter().partition(ConstraintViolation::is_fatal);

        for warning in &warnings {
            tracing::warn!(
                type_name = %warning.type_name,
                field = warning.field.as_deref().unwrap_or(""),
                rule = %warning.rule,
                "{}",
                warning.message
            );
        }

        if !fatal.is_empty() {
            return Err(OdmError::MappingValidation {
                type_name: descriptor.type_name().to_string(),
                violations: fatal,
            });
        }

        descriptor.warnings = warnings;
        Ok(descriptor)
    }

    fn run_constraints(&self, descriptor: &TypeDescriptor) -> Vec<ConstraintViolation> {
        let mut violations = Vec::new();
        for constraint in &self.constraints {
            constraint.check(self, descriptor, &mut violations);
        }
        violations
    }

    /// Register `T` eagerly
    pub fn add_mapped<T: Entity>(&self) -> Result<Arc<TypeDescriptor>> {
        self.descriptor::<T>()
    }

    /// Run every constraint against a fresh build of `T` without caching
    ///
    /// Returns warnings and fatal violations alike.
    pub fn validate<T: Entity>(&self) -> Vec<ConstraintViolation> {
        self.run_constraints(&TypeDescriptor::build::<T>())
    }

    pub fn collection_name<T: Entity>(&self) -> Result<String> {
        Ok(self.descriptor::<T>()?.collection_name())
    }

    pub fn is_mapped<T: Entity>(&self) -> bool {
        let slot = self.slots.lock().get(&TypeId::of::<T>()).cloned();
        slot.map_or(false, |slot| slot.state.lock().descriptor.is_some())
    }

    /// Drop the cached descriptor of `T`; the next use rebuilds it
    pub fn evict<T: Entity>(&self) -> bool {
        let removed = self.slots.lock().remove(&TypeId::of::<T>());
        let evicted = removed.map_or(false, |slot| slot.state.lock().descriptor.is_some());
        if evicted {
            tracing::debug!(type_name = std::any::type_name::<T>(), "Evicted type descriptor");
        }
        evicted
    }

    /// Drop every cached descriptor
    pub fn reset(&self) {
        let mut slots = self.slots.lock();
        tracing::debug!(count = slots.len(), "Resetting mapper");
        slots.clear();
    }

    /// Short names of the types with a cached descriptor
    pub fn mapped_types(&self) -> Vec<&'static str> {
        let slots: Vec<_> = self.slots.lock().values().cloned().collect();
        let mut names: Vec<_> = slots
            .iter()
            .filter_map(|slot| slot.state.lock().descriptor.as_ref().map(|d| d.type_name()))
            .collect();
        names.sort_unstable();
        names
    }

    /// Number of descriptor builds run so far (cache misses)
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    // =====================
    // Conversion
    // =====================

    /// Convert `entity` to a document without running hooks
    pub fn encode<T: Entity>(&self, entity: &T) -> Result<Document> {
        let descriptor = self.descriptor::<T>()?;
        let mut enc = Encoder::new(self, descriptor.type_name());
        convert::encode_entity(&descriptor, entity, &mut enc)
    }

    /// Convert a document to a `T` without running hooks or resolving
    /// references
    pub fn decode<T: Entity>(&self, document: Document) -> Result<T> {
        let descriptor = self.descriptor::<T>()?;
        let mut dec = Decoder::new(self, None, descriptor.type_name());
        let mut entity = T::default();
        convert::decode_into(&descriptor, &mut entity, document, &mut dec)?;
        Ok(entity)
    }

    /// Run PrePersist hooks, then convert `entity`
    pub fn to_document<T: Entity>(&self, entity: &mut T) -> Result<Document> {
        self.to_document_traced(entity, &mut OperationContext::new())
    }

    /// [`to_document`](Self::to_document) within an existing operation
    pub fn to_document_traced<T: Entity>(&self, entity: &mut T, ctx: &mut OperationContext) -> Result<Document> {
        let descriptor = self.descriptor::<T>()?;
        let mut document = lifecycle::dispatch(&descriptor, Stage::PrePersist, entity, Document::new(), ctx)?;

        let mut enc = Encoder::new(self, descriptor.type_name());
        let encoded = convert::encode_entity(&descriptor, &*entity, &mut enc)?;
        // encoded fields win over keys a hook wrote
        for (key, value) in encoded {
            document.insert(key, value);
        }
        Ok(document)
    }

    /// Run PreLoad hooks, convert, then run PostLoad hooks
    ///
    /// References are left unresolved.
    pub fn from_document<T: Entity>(&self, document: Document) -> Result<T> {
        self.from_document_traced(document, None, &mut OperationContext::new())
    }

    /// [`from_document`](Self::from_document) resolving eager references
    /// through `fetcher`
    pub fn from_document_with<T: Entity>(&self, document: Document, fetcher: &dyn ReferenceFetcher) -> Result<T> {
        self.from_document_traced(document, Some(fetcher), &mut OperationContext::new())
    }

    pub fn from_document_traced<T: Entity>(
        &self,
        document: Document,
        fetcher: Option<&dyn ReferenceFetcher>,
        ctx: &mut OperationContext,
    ) -> Result<T> {
        let descriptor = self.descriptor::<T>()?;
        let mut dec = Decoder::new(self, fetcher, descriptor.type_name());
        convert::load_with_context(&descriptor, document, &mut dec, ctx)
    }

    /// Key of a stored entity
    ///
    /// # Errors
    /// Fails if `T` has no identifier field or the identifier is unset.
    pub fn key_of<T: Entity>(&self, entity: &T) -> Result<Key> {
        let descriptor = self.descriptor::<T>()?;
        let mut enc = Encoder::new(self, descriptor.type_name());
        match convert::identifier(&descriptor, entity, &mut enc)? {
            Some(id) => Ok(Key::new(descriptor.collection_name(), id)),
            None => Err(OdmError::conversion(
                descriptor.type_name(),
                "",
                "entity has no identifier value",
            )),
        }
    }

    /// Check a filter argument against the declared type of `field`
    ///
    /// `field` may be the declared field name or any load-name. Unknown
    /// fields are not checked.
    pub fn check_query_argument<T: Entity>(
        &self,
        field: &str,
        operator: FilterOperator,
        value: &Bson,
    ) -> Result<Validation> {
        let descriptor = self.descriptor::<T>()?;
        let declared = descriptor
            .field(field)
            .filter(|f| !f.is_transient())
            .or_else(|| descriptor.field_by_load_name(field));
        let Some(declared) = declared else {
            tracing::debug!(type_name = descriptor.type_name(), field, "Query on unmapped field");
            return Ok(Validation::Unchecked);
        };

        let validation = self
            .query_validators
            .validate(&DeclaredType::from(declared), operator, value);
        Ok(validation)
    }
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("options", &self.options)
            .field("constraints", &self.constraints.len())
            .field("builds", &self.build_count())
            .finish()
    }
}
