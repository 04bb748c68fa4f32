// End-to-end execution: goal outputs, memoization across runs, dataset
// streaming, failure cascades, namespace resolution.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use voxlogica::core::Value;
use voxlogica::primitives::{NamespaceProvider, Primitive};
use voxlogica::scheduler::EvalContext;
use voxlogica::{RunReport, Session, SessionConfig};

fn open(dir: &Path) -> Session {
    Session::open(SessionConfig {
        store_dir: dir.to_path_buf(),
        workers: 2,
        ..SessionConfig::default()
    })
    .unwrap()
}

async fn run(session: &Session, source: &str) -> RunReport {
    session
        .run_source(source, Arc::new(AtomicBool::new(false)))
        .await
        .unwrap()
}

fn printed(report: &RunReport, label: &str) -> String {
    report
        .goals
        .iter()
        .find(|g| g.goal.name == label)
        .unwrap_or_else(|| panic!("no goal named '{label}'"))
        .result
        .clone()
        .unwrap_or_else(|e| panic!("goal '{label}' failed: {e}"))
}

// ----------------------------------------------------------------------------
// Test namespaces
// ----------------------------------------------------------------------------

struct StringOp(&'static str);

#[async_trait::async_trait]
impl Primitive for StringOp {
    fn describe(&self) -> &str {
        "returns a fixed marker string"
    }
    async fn apply(
        &self,
        _ctx: &EvalContext,
        _args: BTreeMap<String, Value>,
    ) -> anyhow::Result<Value> {
        Ok(Value::String(self.0.to_string()))
    }
}

struct FailingOp;

#[async_trait::async_trait]
impl Primitive for FailingOp {
    fn describe(&self) -> &str {
        "always fails"
    }
    async fn apply(
        &self,
        _ctx: &EvalContext,
        _args: BTreeMap<String, Value>,
    ) -> anyhow::Result<Value> {
        anyhow::bail!("intentional failure")
    }
}

struct TestingNamespace;

impl NamespaceProvider for TestingNamespace {
    fn name(&self) -> &str {
        "testing"
    }
    fn register_primitives(&self) -> anyhow::Result<BTreeMap<String, Arc<dyn Primitive>>> {
        let mut m: BTreeMap<String, Arc<dyn Primitive>> = BTreeMap::new();
        m.insert("failing_op".into(), Arc::new(FailingOp));
        m.insert("addition".into(), Arc::new(StringOp("shadowed-addition")));
        Ok(m)
    }
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn arithmetic_dedup_invokes_once() {
    let dir = tempfile::tempdir().unwrap();
    let session = open(dir.path());
    let report = run(
        &session,
        "let a = 1 + 2\nlet b = 2 + 1\nprint \"a\" a\nprint \"b\" b",
    )
    .await;

    assert!(report.ok());
    assert_eq!(printed(&report, "a"), "3");
    assert_eq!(printed(&report, "b"), "3");
    assert_eq!(report.exec.computed, 1, "one addition for both lets");
}

#[tokio::test(flavor = "multi_thread")]
async fn function_inlining_executes() {
    let dir = tempfile::tempdir().unwrap();
    let session = open(dir.path());
    let report = run(&session, "let f(x) = x + x\nprint \"y\" f(5)").await;

    assert!(report.ok());
    assert_eq!(printed(&report, "y"), "10");
    assert_eq!(report.exec.computed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn for_loop_materializes_mapped_range() {
    let dir = tempfile::tempdir().unwrap();
    let session = open(dir.path());
    let report = run(
        &session,
        "import \"default\"\nlet xs = for i in range(0,3) do i + 1\nprint \"xs\" xs",
    )
    .await;

    assert!(report.ok());
    assert_eq!(printed(&report, "xs"), "[1,2,3]");
    // range + dask_map + one addition per element.
    assert_eq!(report.exec.computed, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_run_hits_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let source = "let f(x) = x + x\nprint \"y\" f(5)";

    let first = run(&open(dir.path()), source).await;
    assert_eq!(first.exec.computed, 1);

    // Fresh session, same store: zero invocations, identical output.
    let second = run(&open(dir.path()), source).await;
    assert_eq!(second.exec.computed, 0);
    assert_eq!(printed(&first, "y"), printed(&second, "y"));
}

#[tokio::test(flavor = "multi_thread")]
async fn element_computations_memoize_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let source = "let xs = for i in range(0,3) do i * 2\nprint \"xs\" xs";

    let first = run(&open(dir.path()), source).await;
    assert_eq!(printed(&first, "xs"), "[0,2,4]");

    let second = run(&open(dir.path()), source).await;
    assert_eq!(printed(&second, "xs"), "[0,2,4]");
    // range and dask_map results are session-local (lazy handles), so they
    // recompute; the per-element multiplications come from the store.
    assert_eq!(second.exec.computed, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_cascades_to_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let session = open(dir.path());
    session.registry().add_provider(Arc::new(TestingNamespace));

    let source = "import \"testing\"\nlet x = failing_op()\nlet y = x + 1\nprint \"y\" y";
    let report = run(&session, source).await;

    assert!(!report.ok());
    assert_eq!(report.exec.failures.len(), 2, "root failure plus dependent");
    assert!(report
        .exec
        .failures
        .values()
        .any(|m| m.contains("intentional failure")));
    assert!(report.exec.failures.values().any(|m| m.contains("dependency")));

    let goal_err = report.goals[0].result.clone().unwrap_err();
    assert!(goal_err.contains("upstream node"));
}

#[tokio::test(flavor = "multi_thread")]
async fn recorded_failures_replay_without_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let source = "import \"testing\"\nlet x = failing_op()\nprint \"x\" x";

    let first = open(dir.path());
    first.registry().add_provider(Arc::new(TestingNamespace));
    let r1 = run(&first, source).await;
    assert!(!r1.ok());

    let second = open(dir.path());
    second.registry().add_provider(Arc::new(TestingNamespace));
    let r2 = run(&second, source).await;
    assert!(!r2.ok());
    assert_eq!(r2.exec.computed, 0, "failure replays from the store");
    assert!(r2
        .exec
        .failures
        .values()
        .any(|m| m.contains("intentional failure")));
}

#[tokio::test(flavor = "multi_thread")]
async fn qualified_call_beats_default_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let session = open(dir.path());
    session.registry().add_provider(Arc::new(TestingNamespace));

    let source = "import \"testing\"\n\
                  print \"qualified\" testing.addition(1,2)\n\
                  print \"unqualified\" addition(1,2)";
    let report = run(&session, source).await;

    assert!(report.ok());
    // Qualified: the testing implementation, even though default has one.
    assert_eq!(printed(&report, "qualified"), "shadowed-addition");
    // Unqualified: default wins the search order.
    assert_eq!(printed(&report, "unqualified"), "3");
}

#[tokio::test(flavor = "multi_thread")]
async fn readdir_streams_sorted_entries() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    for name in ["b.txt", "a.txt"] {
        std::fs::write(data.join(name), b"x").unwrap();
    }

    let session = open(dir.path());
    let source = format!(
        "let files = for f in readdir(\"{}\") do f\nprint \"files\" files",
        data.display()
    );
    let report = run(&session, &source).await;

    assert!(report.ok());
    let rendered = printed(&report, "files");
    let a = rendered.find("a.txt").expect("a.txt listed");
    let b = rendered.find("b.txt").expect("b.txt listed");
    assert!(a < b, "entries are sorted: {rendered}");
}

#[tokio::test(flavor = "multi_thread")]
async fn save_goal_writes_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let session = open(dir.path());
    let json_path = dir.path().join("out").join("xs.json");
    let txt_path = dir.path().join("out").join("y.txt");

    let source = format!(
        "let xs = for i in range(0,3) do i + 1\nlet y = 2 * 21\n\
         save \"{}\" xs\nsave \"{}\" y",
        json_path.display(),
        txt_path.display()
    );
    let report = run(&session, &source).await;
    assert!(report.ok());

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(json, serde_json::json!([1, 2, 3]));
    assert_eq!(std::fs::read_to_string(&txt_path).unwrap(), "42\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_loops_compose() {
    let dir = tempfile::tempdir().unwrap();
    let session = open(dir.path());
    let report = run(
        &session,
        "let grid = for i in range(1,3) do for j in range(0,2) do i * 10 + j\n\
         print \"grid\" grid",
    )
    .await;

    assert!(report.ok());
    assert_eq!(printed(&report, "grid"), "[[10,11],[20,21]]");
}
