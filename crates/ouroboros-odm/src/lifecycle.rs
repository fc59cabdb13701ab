//! Lifecycle hooks
//!
//! Hooks run around conversions on two independent tracks:
//!
//! ```text
//! save: PrePersist* -> encode -> (store) -> PostPersist*
//! load: PreLoad*    -> decode ->            PostLoad*
//! ```
//!
//! For each stage, listener hooks run first in registration order, then the
//! entity's own hooks in declaration order. Within one [`OperationContext`]
//! a hook fires at most once. A failing hook aborts the operation; work done
//! by earlier hooks is not rolled back.

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bson::Document;

use crate::mapping::TypeDescriptor;
use crate::{OdmError, Result};

/// Point in an operation at which hooks fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PrePersist,
    PostPersist,
    PreLoad,
    PostLoad,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::PrePersist,
        Stage::PostPersist,
        Stage::PreLoad,
        Stage::PostLoad,
    ];

    /// Pre-stages may replace the in-flight document
    pub fn is_pre(&self) -> bool {
        matches!(self, Stage::PrePersist | Stage::PreLoad)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::PrePersist => "PrePersist",
            Stage::PostPersist => "PostPersist",
            Stage::PreLoad => "PreLoad",
            Stage::PostLoad => "PostLoad",
        };
        f.write_str(name)
    }
}

/// Where a hook was declared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOrigin {
    Listener,
    Entity,
}

pub(crate) type HookFn =
    dyn Fn(&mut dyn Any, &mut Document) -> anyhow::Result<Option<Document>> + Send + Sync;

/// A hook method of an entity type
///
/// Three signatures are supported: entity only, entity plus the in-flight
/// document, and entity plus document returning a replacement document.
pub struct LifecycleMethod<E> {
    func: Arc<HookFn>,
    replacing: bool,
    _entity: PhantomData<fn(&mut E)>,
}

impl<E: 'static> LifecycleMethod<E> {
    /// Hook that only sees the entity
    pub fn bare<F>(hook: F) -> Self
    where
        F: Fn(&mut E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::erase(false, move |entity, _document| {
            hook(entity)?;
            Ok(None)
        })
    }

    /// Hook that may read and edit the in-flight document
    pub fn with_document<F>(hook: F) -> Self
    where
        F: Fn(&mut E, &mut Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::erase(false, move |entity, document| {
            hook(entity, document)?;
            Ok(None)
        })
    }

    /// Hook that may return a document replacing the in-flight one
    ///
    /// Replacements are honored on pre-stages only.
    pub fn replacing<F>(hook: F) -> Self
    where
        F: Fn(&mut E, &Document) -> anyhow::Result<Option<Document>> + Send + Sync + 'static,
    {
        Self::erase(true, move |entity, document| hook(entity, &*document))
    }

    fn erase<F>(replacing: bool, hook: F) -> Self
    where
        F: Fn(&mut E, &mut Document) -> anyhow::Result<Option<Document>> + Send + Sync + 'static,
    {
        let func = move |entity: &mut dyn Any, document: &mut Document| {
            let entity = entity.downcast_mut::<E>().ok_or_else(|| {
                anyhow::anyhow!("hook called with a value that is not {}", std::any::type_name::<E>())
            })?;
            hook(entity, document)
        };
        Self {
            func: Arc::new(func),
            replacing,
            _entity: PhantomData,
        }
    }

    pub(crate) fn into_parts(self) -> (Arc<HookFn>, bool) {
        (self.func, self.replacing)
    }
}

/// External observer of an entity type's lifecycle
///
/// Every method defaults to a no-op. [`stages`](EntityListener::stages)
/// limits which stages the listener is registered for.
pub trait EntityListener<E>: Send + Sync + 'static {
    fn stages(&self) -> Vec<Stage> {
        Stage::ALL.to_vec()
    }

    fn pre_persist(&self, _entity: &mut E, _document: &mut Document) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_persist(&self, _entity: &mut E, _document: &mut Document) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_load(&self, _entity: &mut E, _document: &mut Document) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_load(&self, _entity: &mut E, _document: &mut Document) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One registered hook
#[derive(Clone)]
pub struct Hook {
    pub(crate) name: String,
    pub(crate) stage: Stage,
    pub(crate) origin: HookOrigin,
    pub(crate) replacing: bool,
    pub(crate) func: Arc<HookFn>,
}

impl Hook {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn origin(&self) -> HookOrigin {
        self.origin
    }

    /// True if the hook returns a replacement document
    pub fn is_replacing(&self) -> bool {
        self.replacing
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Hooks of one type in firing order
#[derive(Clone, Default, Debug)]
pub struct HookTable {
    listeners: Vec<Hook>,
    methods: Vec<Hook>,
}

impl HookTable {
    pub(crate) fn push(&mut self, hook: Hook) {
        match hook.origin {
            HookOrigin::Listener => self.listeners.push(hook),
            HookOrigin::Entity => self.methods.push(hook),
        }
    }

    /// Every hook, listeners first
    pub fn iter(&self) -> impl Iterator<Item = &Hook> {
        self.listeners.iter().chain(self.methods.iter())
    }

    pub fn for_stage(&self, stage: Stage) -> impl Iterator<Item = &Hook> {
        self.iter().filter(move |hook| hook.stage == stage)
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.methods.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len() + self.methods.len()
    }
}

pub(crate) fn listener_hooks<E, L>(listener: L) -> Vec<Hook>
where
    E: 'static,
    L: EntityListener<E>,
{
    let listener = Arc::new(listener);
    let base = std::any::type_name::<L>();
    let base = base.rsplit("::").next().unwrap_or(base);

    listener
        .stages()
        .into_iter()
        .map(|stage| {
            let listener = Arc::clone(&listener);
            let method = LifecycleMethod::<E>::with_document(move |entity, document| match stage {
                Stage::PrePersist => listener.pre_persist(entity, document),
                Stage::PostPersist => listener.post_persist(entity, document),
                Stage::PreLoad => listener.pre_load(entity, document),
                Stage::PostLoad => listener.post_load(entity, document),
            });
            let (func, replacing) = method.into_parts();
            Hook {
                name: format!("{}::{}", base, stage),
                stage,
                origin: HookOrigin::Listener,
                replacing,
                func,
            }
        })
        .collect()
}

// =====================
// Dispatch
// =====================

/// Record of one hook invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredHook {
    pub stage: Stage,
    pub hook: String,
    pub origin: HookOrigin,
}

/// Per-operation hook state
///
/// Guards against firing the same hook twice within one save or load and
/// records every hook that ran. Nested reference loads use their own context.
#[derive(Debug, Default)]
pub struct OperationContext {
    fired: HashSet<(TypeId, Stage, usize)>,
    trace: Vec<FiredHook>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks fired so far, in firing order
    pub fn trace(&self) -> &[FiredHook] {
        &self.trace
    }

    /// Number of times the named hook fired in this operation
    pub fn count(&self, hook: &str) -> usize {
        self.trace.iter().filter(|fired| fired.hook == hook).count()
    }

    pub fn has_fired(&self, stage: Stage, hook: &str) -> bool {
        self.trace
            .iter()
            .any(|fired| fired.stage == stage && fired.hook == hook)
    }
}

/// Run every hook of `stage` for `entity`
///
/// Returns the document to carry forward: the last replacement returned by a
/// pre-stage hook, or the (possibly edited) input document.
pub fn dispatch(
    descriptor: &TypeDescriptor,
    stage: Stage,
    entity: &mut dyn Any,
    document: Document,
    ctx: &mut OperationContext,
) -> Result<Document> {
    let mut document = document;
    let type_id = descriptor.value_type().type_id();

    for (index, hook) in descriptor.hooks().iter().enumerate() {
        if hook.stage != stage {
            continue;
        }
        if !ctx.fired.insert((type_id, stage, index)) {
            tracing::debug!(hook = %hook.name, stage = %stage, "Hook already fired in this operation");
            continue;
        }

        tracing::debug!(
            type_name = descriptor.type_name(),
            hook = %hook.name,
            stage = %stage,
            "Dispatching lifecycle hook"
        );
        ctx.trace.push(FiredHook {
            stage,
            hook: hook.name.clone(),
            origin: hook.origin,
        });

        let replacement = (hook.func)(entity, &mut document).map_err(|e| OdmError::LifecycleHook {
            stage: stage.to_string(),
            hook: hook.name.clone(),
            message: format!("{:#}", e),
        })?;

        match replacement {
            Some(replacement) if stage.is_pre() => document = replacement,
            Some(_) => {
                tracing::debug!(hook = %hook.name, stage = %stage, "Ignoring replacement document on post stage");
            }
            None => {}
        }
    }

    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Describer, Entity};
    use bson::doc;

    #[derive(Default)]
    struct Counter {
        id: i64,
        touched: u32,
    }

    struct Audit;

    impl EntityListener<Counter> for Audit {
        fn stages(&self) -> Vec<Stage> {
            vec![Stage::PrePersist]
        }

        fn pre_persist(&self, entity: &mut Counter, document: &mut Document) -> anyhow::Result<()> {
            entity.touched += 10;
            document.insert("audited", true);
            Ok(())
        }
    }

    impl Entity for Counter {
        fn describe(d: &mut Describer<Self>) {
            d.collection("counters");
            d.id("id", |c| &c.id, |c| &mut c.id);
            d.transient("touched");
            d.hook(
                Stage::PrePersist,
                "touch",
                LifecycleMethod::bare(|c: &mut Counter| {
                    c.touched += 1;
                    Ok(())
                }),
            );
            d.hook(
                Stage::PreLoad,
                "swap",
                LifecycleMethod::replacing(|_c: &mut Counter, _doc: &Document| Ok(Some(doc! { "_id": 99i64 }))),
            );
            d.hook(
                Stage::PostLoad,
                "fail",
                LifecycleMethod::bare(|_c: &mut Counter| anyhow::bail!("not today")),
            );
            d.listener(Audit);
        }
    }

    #[test]
    fn test_listener_runs_before_entity_hook() {
        let descriptor = TypeDescriptor::build::<Counter>();
        let mut entity = Counter::default();
        let mut ctx = OperationContext::new();

        let document = dispatch(&descriptor, Stage::PrePersist, &mut entity, Document::new(), &mut ctx).unwrap();

        assert_eq!(entity.touched, 11);
        assert_eq!(document.get_bool("audited").unwrap(), true);
        let names: Vec<_> = ctx.trace().iter().map(|f| f.hook.as_str()).collect();
        assert_eq!(names, vec!["Audit::PrePersist", "touch"]);
        assert_eq!(ctx.trace()[0].origin, HookOrigin::Listener);
    }

    #[test]
    fn test_hook_fires_once_per_operation() {
        let descriptor = TypeDescriptor::build::<Counter>();
        let mut entity = Counter::default();
        let mut ctx = OperationContext::new();

        dispatch(&descriptor, Stage::PrePersist, &mut entity, Document::new(), &mut ctx).unwrap();
        dispatch(&descriptor, Stage::PrePersist, &mut entity, Document::new(), &mut ctx).unwrap();
        assert_eq!(entity.touched, 11);
        assert_eq!(ctx.count("touch"), 1);

        let mut fresh = OperationContext::new();
        dispatch(&descriptor, Stage::PrePersist, &mut entity, Document::new(), &mut fresh).unwrap();
        assert_eq!(entity.touched, 22);
    }

    #[test]
    fn test_replacement_flows_forward_on_pre_stage() {
        let descriptor = TypeDescriptor::build::<Counter>();
        let mut entity = Counter::default();
        let mut ctx = OperationContext::new();

        let document = dispatch(&descriptor, Stage::PreLoad, &mut entity, doc! { "_id": 1i64 }, &mut ctx).unwrap();
        assert_eq!(document, doc! { "_id": 99i64 });
    }

    #[test]
    fn test_failing_hook_aborts() {
        let descriptor = TypeDescriptor::build::<Counter>();
        let mut entity = Counter::default();
        let mut ctx = OperationContext::new();

        let err = dispatch(&descriptor, Stage::PostLoad, &mut entity, Document::new(), &mut ctx).unwrap_err();
        match err {
            OdmError::LifecycleHook { stage, hook, message } => {
                assert_eq!(stage, "PostLoad");
                assert_eq!(hook, "fail");
                assert_eq!(message, "not today");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
