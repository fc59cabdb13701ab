//! Descriptor registry: caching under contention and structural validation

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use ouroboros_odm::mapping::{ClassConstraint, TypeDescriptor};
use ouroboros_odm::{
    embeddable, ConstraintViolation, Describer, Entity, Level, Mapper, OdmError, Ref,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn rules(violations: &[ConstraintViolation]) -> Vec<&str> {
    violations.iter().map(|v| v.rule.as_str()).collect()
}

// ============================================================================
// Concurrency
// ============================================================================

#[derive(Default)]
struct Slow {
    id: i64,
    name: String,
}

impl Entity for Slow {
    fn describe(d: &mut Describer<Self>) {
        // widen the window in which racing callers overlap
        thread::sleep(Duration::from_millis(20));
        d.collection("slow");
        d.id("id", |s| &s.id, |s| &mut s.id);
        d.field("name", |s| &s.name, |s| &mut s.name);
    }
}

#[derive(Default)]
struct Broken {
    name: String,
}

impl Entity for Broken {
    fn describe(d: &mut Describer<Self>) {
        thread::sleep(Duration::from_millis(50));
        d.collection("broken");
        d.field("name", |b| &b.name, |b| &mut b.name);
    }
}

#[test]
fn test_concurrent_first_use_builds_once() {
    init_tracing();
    const THREADS: usize = 16;
    let mapper = Arc::new(Mapper::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mapper = Arc::clone(&mapper);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                mapper.descriptor::<Slow>().unwrap()
            })
        })
        .collect();
    let descriptors: Vec<Arc<TypeDescriptor>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(mapper.build_count(), 1);
    for descriptor in &descriptors[1..] {
        assert!(Arc::ptr_eq(&descriptors[0], descriptor));
    }
}

#[test]
fn test_concurrent_failure_is_shared_then_retried() {
    init_tracing();
    const THREADS: usize = 8;
    let mapper = Arc::new(Mapper::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mapper = Arc::clone(&mapper);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                mapper.descriptor::<Broken>().unwrap_err()
            })
        })
        .collect();
    let errors: Vec<OdmError> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // one build ran; every waiting caller received its failure
    assert_eq!(mapper.build_count(), 1);
    assert_eq!(rules(errors[0].violations()), vec!["MissingIdentifier"]);
    for err in &errors[1..] {
        assert_eq!(err, &errors[0]);
    }
    assert!(!mapper.is_mapped::<Broken>());

    // a caller arriving after the failure builds again
    assert!(mapper.descriptor::<Broken>().is_err());
    assert_eq!(mapper.build_count(), 2);
}

#[test]
fn test_registries_are_independent() {
    let first = Mapper::new();
    let second = Mapper::new();
    first.add_mapped::<Slow>().unwrap();

    assert!(first.is_mapped::<Slow>());
    assert!(!second.is_mapped::<Slow>());

    first.reset();
    assert!(!first.is_mapped::<Slow>());
    assert!(first.mapped_types().is_empty());
}

#[test]
fn test_global_mapper_is_shared() {
    assert!(std::ptr::eq(Mapper::global(), Mapper::global()));
    assert_eq!(Mapper::global().collection_name::<Slow>().unwrap(), "slow");
}

// ============================================================================
// Load-name rules
// ============================================================================

#[derive(Default)]
struct OneDuplicate {
    id: i64,
    a: String,
    b: String,
    c: String,
}

impl Entity for OneDuplicate {
    fn describe(d: &mut Describer<Self>) {
        d.collection("one_duplicate");
        d.id("id", |s| &s.id, |s| &mut s.id);
        d.field("a", |s| &s.a, |s| &mut s.a).name("x");
        d.field("b", |s| &s.b, |s| &mut s.b).name("x");
        d.field("c", |s| &s.c, |s| &mut s.c).name("y");
    }
}

#[derive(Default)]
struct ThreeWay {
    id: i64,
    a: String,
    b: String,
    c: String,
}

impl Entity for ThreeWay {
    fn describe(d: &mut Describer<Self>) {
        d.collection("three_way");
        d.id("id", |s| &s.id, |s| &mut s.id);
        d.field("a", |s| &s.a, |s| &mut s.a).name("x");
        d.field("b", |s| &s.b, |s| &mut s.b).name("x");
        d.field("c", |s| &s.c, |s| &mut s.c).alias("x");
    }
}

#[test]
fn test_duplicate_name_reported_once_on_later_field() {
    let mapper = Mapper::new();
    let violations = mapper.validate::<OneDuplicate>();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].rule, "DuplicatedLoadNames");
    assert_eq!(violations[0].field.as_deref(), Some("b"));
    assert_eq!(violations[0].level, Level::Fatal);

    let err = mapper.descriptor::<OneDuplicate>().unwrap_err();
    assert!(matches!(err, OdmError::MappingValidation { .. }));
    assert_eq!(err.violations().len(), 1);
    assert!(!mapper.is_mapped::<OneDuplicate>());
}

#[test]
fn test_every_later_duplicate_is_reported() {
    let violations = Mapper::new().validate::<ThreeWay>();
    let fields: Vec<_> = violations.iter().filter_map(|v| v.field.as_deref()).collect();
    assert_eq!(fields, vec!["b", "c"]);
}

#[derive(Default)]
struct Squatter {
    id: i64,
    legacy: String,
}

impl Entity for Squatter {
    fn describe(d: &mut Describer<Self>) {
        d.collection("squatters");
        d.id("id", |s| &s.id, |s| &mut s.id);
        d.field("legacy", |s| &s.legacy, |s| &mut s.legacy).alias("_id");
    }
}

#[derive(Default)]
struct BadNames {
    id: i64,
    total: i32,
}

impl Entity for BadNames {
    fn describe(d: &mut Describer<Self>) {
        d.collection("system.bad");
        d.id("id", |s| &s.id, |s| &mut s.id);
        d.field("total", |s| &s.total, |s| &mut s.total).name("$total");
    }
}

#[test]
fn test_identifier_key_is_reserved() {
    let violations = Mapper::new().validate::<Squatter>();
    assert!(rules(&violations).contains(&"IdentifierKeyMapping"));
}

#[test]
fn test_invalid_names_are_fatal() {
    let err = Mapper::new().descriptor::<BadNames>().unwrap_err();
    let found = rules(err.violations());
    assert!(found.contains(&"InvalidLoadName"));
    assert!(found.contains(&"InvalidCollectionName"));
}

// ============================================================================
// Identifier rules
// ============================================================================

#[derive(Default)]
struct TwoIds {
    id: i64,
    other: i64,
}

impl Entity for TwoIds {
    fn describe(d: &mut Describer<Self>) {
        d.collection("two_ids");
        d.id("id", |s| &s.id, |s| &mut s.id);
        d.id("other", |s| &s.other, |s| &mut s.other);
    }
}

#[derive(Default)]
struct EmbeddedOnly {
    note: String,
}

impl Entity for EmbeddedOnly {
    fn describe(d: &mut Describer<Self>) {
        d.field("note", |s| &s.note, |s| &mut s.note);
    }
}

#[test]
fn test_multiple_identifiers_are_fatal() {
    let violations = Mapper::new().validate::<TwoIds>();
    assert!(rules(&violations).contains(&"MultipleIdentifiers"));
}

#[test]
fn test_embedded_types_need_no_identifier() {
    let mapper = Mapper::new();
    assert!(mapper.validate::<EmbeddedOnly>().is_empty());
    assert_eq!(mapper.collection_name::<EmbeddedOnly>().unwrap(), "EmbeddedOnly");
}

// ============================================================================
// Embedding cycles
// ============================================================================

#[derive(Default)]
struct Node {
    label: String,
    child: Box<Node>,
}

impl Entity for Node {
    fn describe(d: &mut Describer<Self>) {
        d.field("label", |n| &n.label, |n| &mut n.label);
        d.field("child", |n| &n.child, |n| &mut n.child);
    }
}

embeddable!(Node);

#[derive(Default)]
struct Left {
    right: Box<Right>,
}

#[derive(Default)]
struct Right {
    left: Box<Left>,
}

impl Entity for Left {
    fn describe(d: &mut Describer<Self>) {
        d.field("right", |l| &l.right, |l| &mut l.right);
    }
}

impl Entity for Right {
    fn describe(d: &mut Describer<Self>) {
        d.field("left", |r| &r.left, |r| &mut r.left);
    }
}

embeddable!(Left, Right);

#[derive(Default)]
struct Tree {
    id: i64,
    root: TreeNode,
}

#[derive(Default)]
struct TreeNode {
    children: Vec<TreeNode>,
    parent: Option<Box<TreeNode>>,
}

impl Entity for Tree {
    fn describe(d: &mut Describer<Self>) {
        d.collection("trees");
        d.id("id", |t| &t.id, |t| &mut t.id);
        d.field("root", |t| &t.root, |t| &mut t.root);
    }
}

impl Entity for TreeNode {
    fn describe(d: &mut Describer<Self>) {
        d.field("children", |n| &n.children, |n| &mut n.children);
        d.field("parent", |n| &n.parent, |n| &mut n.parent);
    }
}

embeddable!(TreeNode);

#[derive(Default)]
struct Person {
    id: i64,
    manager: Option<Ref<Person>>,
}

impl Entity for Person {
    fn describe(d: &mut Describer<Self>) {
        d.collection("people");
        d.id("id", |p| &p.id, |p| &mut p.id);
        d.field("manager", |p| &p.manager, |p| &mut p.manager);
    }
}

#[test]
fn test_direct_embedding_cycle_is_fatal() {
    let violations = Mapper::new().validate::<Node>();
    assert_eq!(rules(&violations), vec!["EmbeddingCycle"]);
    assert_eq!(violations[0].field.as_deref(), Some("child"));
}

#[test]
fn test_indirect_embedding_cycle_is_fatal() {
    let violations = Mapper::new().validate::<Left>();
    assert_eq!(rules(&violations), vec!["EmbeddingCycle"]);
}

#[test]
fn test_optional_and_container_embedding_terminates() {
    let mapper = Mapper::new();
    assert!(mapper.validate::<Tree>().is_empty());
    assert!(mapper.validate::<TreeNode>().is_empty());
}

#[test]
fn test_self_reference_is_not_a_cycle() {
    assert!(Mapper::new().validate::<Person>().is_empty());
}

// ============================================================================
// Warnings and custom rules
// ============================================================================

#[derive(Default)]
struct Noisy {
    id: i64,
    name: String,
    count: i32,
}

impl Entity for Noisy {
    fn describe(d: &mut Describer<Self>) {
        d.collection("noisy");
        d.id("id", |n| &n.id, |n| &mut n.id);
        d.field("name", |n| &n.name, |n| &mut n.name).alias("label");
        d.field("count", |n| &n.count, |n| &mut n.count).lazy();
    }
}

#[test]
fn test_warnings_do_not_block_registration() {
    init_tracing();
    let mapper = Mapper::new();
    let descriptor = mapper.descriptor::<Noisy>().unwrap();
    assert_eq!(rules(descriptor.warnings()), vec!["ReferenceOptionsOnNonReference"]);
    assert!(descriptor.warnings().iter().all(|w| w.level == Level::Warning));
}

struct NoShortCollections;

impl ClassConstraint for NoShortCollections {
    fn name(&self) -> &'static str {
        "NoShortCollections"
    }

    fn check(&self, _mapper: &Mapper, descriptor: &TypeDescriptor, violations: &mut Vec<ConstraintViolation>) {
        if descriptor.declared_collection().is_some_and(|name| name.len() < 5) {
            violations.push(ConstraintViolation::new(
                Level::Fatal,
                descriptor.type_name(),
                None,
                self.name(),
                "collection name is too short",
            ));
        }
    }
}

#[test]
fn test_custom_constraint_runs_at_registration() {
    let mut mapper = Mapper::new();
    mapper.add_constraint(NoShortCollections);

    let err = mapper.descriptor::<Slow>().unwrap_err();
    assert_eq!(rules(err.violations()), vec!["NoShortCollections"]);
    assert!(err.to_string().contains("collection name is too short"));
    assert!(mapper.descriptor::<Noisy>().is_ok());
}
