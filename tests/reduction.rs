// Reduction-level expectations: deduplication, function inlining, import
// idempotence, and id stability across independent reductions.

use std::collections::BTreeMap;
use std::sync::Arc;
use voxlogica::core::{EngineError, GoalKind, Value};
use voxlogica::primitives::{NamespaceProvider, Primitive};
use voxlogica::scheduler::EvalContext;
use voxlogica::workplan::Node;
use voxlogica::{Session, SessionConfig};

fn session() -> (tempfile::TempDir, Session) {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(SessionConfig {
        store_dir: dir.path().to_path_buf(),
        workers: 2,
        ..SessionConfig::default()
    })
    .unwrap();
    (dir, session)
}

struct Marker;

#[async_trait::async_trait]
impl Primitive for Marker {
    fn describe(&self) -> &str {
        "returns a marker string"
    }
    async fn apply(
        &self,
        _ctx: &EvalContext,
        _args: BTreeMap<String, Value>,
    ) -> anyhow::Result<Value> {
        Ok(Value::String("marker".into()))
    }
}

struct TestNamespace;

impl NamespaceProvider for TestNamespace {
    fn name(&self) -> &str {
        "ns"
    }
    fn register_primitives(&self) -> anyhow::Result<BTreeMap<String, Arc<dyn Primitive>>> {
        let mut m: BTreeMap<String, Arc<dyn Primitive>> = BTreeMap::new();
        m.insert("op".into(), Arc::new(Marker));
        Ok(m)
    }
}

#[test]
fn commuted_operands_share_one_node() {
    let (_dir, session) = session();
    let plan = session
        .reduce_source("let a = 1 + 2\nlet b = 2 + 1\nprint \"a\" a\nprint \"b\" b")
        .unwrap();

    let ops = plan.operations().unwrap();
    assert_eq!(ops.len(), 1, "1+2 and 2+1 must deduplicate to one addition");

    let goals = plan.goals();
    assert_eq!(goals.len(), 2);
    assert_eq!(goals[0].target, goals[1].target);
}

#[test]
fn function_application_inlines_without_extra_nodes() {
    let (_dir, session) = session();
    let plan = session
        .reduce_source("let f(x) = x + x\nprint \"y\" f(5)")
        .unwrap();

    // Exactly two nodes: the constant 5 (used twice, one node) and the
    // addition. Nothing for f itself.
    assert_eq!(plan.node_count(), 2);
    let ops = plan.operations().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].1, "addition");
    let args: Vec<_> = ops[0].2.values().collect();
    assert_eq!(args[0], args[1], "both operands are the same constant node");
}

#[test]
fn equal_expressions_reduce_to_equal_ids() {
    let (_dir, session) = session();
    let plan = session
        .reduce_source("print \"p\" 3 * 7\nprint \"q\" 3 * 7")
        .unwrap();
    let goals = plan.goals();
    assert_eq!(goals[0].target, goals[1].target);
}

#[test]
fn independent_reductions_agree() {
    let (_dir1, s1) = session();
    let (_dir2, s2) = session();
    let source = "let f(x) = x + 1\nlet xs = for i in range(0,3) do f(i)\nprint \"xs\" xs";
    let one = s1.reduce_source(source).unwrap();
    let two = s2.reduce_source(source).unwrap();
    assert_eq!(one.to_json(), two.to_json());
}

#[test]
fn for_loop_emits_a_map_over_a_closure() {
    let (_dir, session) = session();
    let plan = session
        .reduce_source("let xs = for i in range(0,3) do i + 1\nprint \"xs\" xs")
        .unwrap();

    let ops = plan.operations().unwrap();
    let map_op = ops
        .iter()
        .find(|(_, op, _)| op == "dask_map")
        .expect("for-loop reduces to a dask_map operation");

    let function_id = &map_op.2["function"];
    match plan.get(function_id) {
        Some(Node::Closure { closure }) => assert_eq!(closure.parameter, "i"),
        other => panic!("function argument should be a closure node, got {other:?}"),
    }

    let iterable_id = &map_op.2["iterable"];
    let range_op = ops.iter().find(|(id, _, _)| id == iterable_id).unwrap();
    assert_eq!(range_op.1, "range");

    // The loop body is not compiled at reduction time.
    assert!(!ops.iter().any(|(_, op, _)| op == "addition"));
}

#[test]
fn identical_loops_share_the_closure_and_map() {
    let (_dir, session) = session();
    let plan = session
        .reduce_source(
            "let xs = for i in range(0,3) do i + 1\n\
             let ys = for i in range(0,3) do i + 1\n\
             print \"xs\" xs\nprint \"ys\" ys",
        )
        .unwrap();
    let goals = plan.goals();
    assert_eq!(goals[0].target, goals[1].target);
}

#[test]
fn imports_are_recorded_once() {
    let (_dir, session) = session();
    session.registry().add_provider(Arc::new(TestNamespace));
    let plan = session
        .reduce_source("import \"ns\"\nimport \"ns\"\nimport \"ns\"\nprint \"r\" ns.op(1,2)")
        .unwrap();
    let ns_imports: Vec<_> = plan.imports().into_iter().filter(|n| n == "ns").collect();
    assert_eq!(ns_imports.len(), 1);
    assert_eq!(plan.operations().unwrap().len(), 1);
}

#[test]
fn unknown_namespace_fails_at_reduction() {
    let (_dir, session) = session();
    let err = session.reduce_source("import \"nope\"").unwrap_err();
    assert!(matches!(err, EngineError::Import(_)));
}

#[test]
fn unbound_identifier_reports_position() {
    let (_dir, session) = session();
    let err = session.reduce_source("let a = 1\nprint \"b\" missing").unwrap_err();
    match err {
        EngineError::UnboundIdentifier { name, pos } => {
            assert_eq!(name, "missing");
            assert_eq!(pos.line, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn duplicate_declaration_is_rejected() {
    let (_dir, session) = session();
    let err = session.reduce_source("let a = 1\nlet a = 2").unwrap_err();
    assert!(matches!(err, EngineError::DuplicateDeclaration { .. }));
}

#[test]
fn prelude_names_may_be_shadowed() {
    let (_dir, session) = session();
    // Re-declaring `+` shadows the prelude alias; same scope would fail.
    let plan = session
        .reduce_source("let +(a,b) = subtraction(a,b)\nprint \"d\" 5 + 2")
        .unwrap();
    let ops = plan.operations().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].1, "subtraction");
}

#[test]
fn let_in_shadows_lexically() {
    let (_dir, session) = session();
    let plan = session
        .reduce_source("let x = 10\nprint \"v\" let x = 2 in x * x\nprint \"w\" x")
        .unwrap();
    let goals = plan.goals();
    assert_eq!(goals.len(), 2);
    // The inner binding never leaks: w prints the outer constant directly.
    assert_ne!(goals[0].target, goals[1].target);
    assert!(matches!(
        plan.get(&goals[1].target),
        Some(Node::Constant {
            value: Value::Number(n)
        }) if n == 10.0
    ));
}

#[test]
fn goal_kinds_and_order_are_preserved() {
    let (_dir, session) = session();
    let plan = session
        .reduce_source("let a = 1\nsave \"out.json\" a\nprint \"a\" a")
        .unwrap();
    let goals = plan.goals();
    assert_eq!(goals[0].kind, GoalKind::Save);
    assert_eq!(goals[0].name, "out.json");
    assert_eq!(goals[1].kind, GoalKind::Print);
}
