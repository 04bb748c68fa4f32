// src/scheduler.rs
//
// =============================================================================
// VOXLOGICA: SCHEDULER (v 2.0)
// =============================================================================
//
// The Executor.
//
// Responsibilities:
// 1. Transfer the plan's imports to the registry and pre-store constants.
// 2. Build the dependency graph over operation nodes and dispatch ready
//    nodes onto a semaphore-bounded worker pool.
// 3. Enforce at-most-one concurrent computation per id through the store's
//    single-flight table.
// 4. Cascade failures to transitive dependents and report them as
//    failed-by-dependency without executing them.
// 5. Stream dataset elements through the same discipline, one derived id
//    per element, releasing each element after its consumer is done.

use crate::core::{ArgumentMap, Bag, EngineError, NodeId, Value};
use crate::ident;
use crate::primitives::Registry;
use crate::store::{FlightStatus, RecordStatus, ResultStore, StoreOutcome};
use crate::workplan::{Node, WorkPlan};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

// ============================================================================
// 1. EVALUATION CONTEXT
// ============================================================================

/// Everything a running computation may need: the plan (for lazy expansion),
/// the store, the registry, the worker limiter and the cancellation flag.
/// Handed to primitives explicitly; there is no hidden per-thread state.
#[derive(Clone)]
pub struct EvalContext {
    pub plan: WorkPlan,
    pub store: Arc<ResultStore>,
    pub registry: Arc<Registry>,
    limiter: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
    computed: Arc<AtomicUsize>,
    cache_hits: Arc<AtomicUsize>,
}

impl EvalContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Primitive invocations so far, including per-element work performed
    /// after the main dispatch settled (goal materialization).
    pub fn computed_count(&self) -> usize {
        self.computed.load(Ordering::Relaxed)
    }

    pub fn cache_hit_count(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Resolves a dependency id to a value: persistent store first, then the
    /// session cache, then plan constants/closures that have not been seeded
    /// yet (lazy expansion creates those mid-run).
    pub fn resolve_value(&self, id: &NodeId) -> Result<Value, EngineError> {
        if let Some(value) = self.store.retrieve(id)? {
            return Ok(value);
        }
        match self.plan.get(id) {
            Some(Node::Constant { value }) => {
                self.store.store(id, value.clone())?;
                Ok(value)
            }
            Some(Node::Closure { closure }) => {
                self.store.put_closure(closure);
                Ok(Value::Closure(id.clone()))
            }
            Some(Node::Operation { .. }) => Err(EngineError::Store(format!(
                "dependency {} is not materialized",
                id.short()
            ))),
            None => Err(EngineError::Store(format!(
                "unknown dependency {}",
                id.short()
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Single-node execution (single-flight)
    // ------------------------------------------------------------------------

    /// Executes one operation node, observing the single-flight protocol.
    /// Returns Ok whether the value came from the store or a fresh
    /// computation; Err carries the primitive failure (fresh or replayed).
    pub async fn execute_operation(
        &self,
        id: &NodeId,
        operator: &str,
        arguments: &ArgumentMap,
    ) -> Result<(), EngineError> {
        loop {
            if self.cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.store.status(id)? {
                RecordStatus::Materialized => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                RecordStatus::Failed(message) => {
                    // Replay the recorded failure without re-running.
                    return Err(EngineError::Primitive {
                        operator: operator.to_string(),
                        node: id.clone(),
                        message,
                    });
                }
                RecordStatus::Absent => {}
            }
            match self.store.mark_running(id) {
                FlightStatus::AlreadyRunning => {
                    self.store.wait_running(id).await;
                    // Re-check the store; the winner may have succeeded,
                    // failed, or died without publishing.
                    continue;
                }
                FlightStatus::Acquired => {
                    // Double-check after acquisition: the previous holder
                    // may have published between our status check and now.
                    if self.store.exists(id) {
                        self.store.release_running(id);
                        self.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    let result = self.invoke(id, operator, arguments).await;
                    let outcome = match result {
                        Ok(value) => {
                            // MemoryOnly demotion is handled (and logged)
                            // inside the store.
                            match self.store.store(id, value) {
                                Ok(_) => Ok(()),
                                Err(e) => Err(EngineError::Store(e.to_string())),
                            }
                        }
                        Err(message) => {
                            if let Err(e) = self.store.mark_failed(id, &message) {
                                log::error!("cannot record failure for {}: {}", id.short(), e);
                            }
                            Err(EngineError::Primitive {
                                operator: operator.to_string(),
                                node: id.clone(),
                                message,
                            })
                        }
                    };
                    self.store.release_running(id);
                    if outcome.is_ok() {
                        self.computed.fetch_add(1, Ordering::Relaxed);
                        log::debug!("computed {} ({})", id.short(), operator);
                    }
                    return outcome;
                }
            }
        }
    }

    /// Resolve the operator, gather dependency values, map argument names,
    /// invoke. Errors come back as plain strings: they become the recorded
    /// failure message.
    async fn invoke(
        &self,
        id: &NodeId,
        operator: &str,
        arguments: &ArgumentMap,
    ) -> Result<Value, String> {
        let primitive = self
            .registry
            .resolve(operator)
            .map_err(|e| e.to_string())?;
        let mut values = BTreeMap::new();
        for (key, dep) in arguments {
            let value = self.resolve_value(dep).map_err(|e| e.to_string())?;
            values.insert(key.clone(), value);
        }
        let values = self.registry.map_argument_keys(operator, values);
        primitive
            .apply(self, values)
            .await
            .map_err(|e| e.to_string())
            .map_err(|message| {
                log::debug!("primitive '{}' failed on {}: {}", operator, id.short(), message);
                message
            })
    }

    // ------------------------------------------------------------------------
    // Dataset streaming
    // ------------------------------------------------------------------------

    /// Computes one element of a mapped dataset: hash the element into a
    /// constant id, compile the closure body against it (lazy expansion,
    /// memoized per (closure, element)), execute the compiled subgraph, and
    /// read the result back. Equal elements always derive equal sub-ids.
    pub async fn eval_element(
        &self,
        closure_id: &NodeId,
        element: Value,
    ) -> Result<Value, EngineError> {
        let element_id = ident::constant_id(&element)
            .map_err(|m| EngineError::Store(format!("dataset element is not hashable: {m}")))?;
        match self.store.store(&element_id, element)? {
            StoreOutcome::Stored | StoreOutcome::Duplicate | StoreOutcome::MemoryOnly => {}
        }

        let closure = self
            .store
            .get_closure(closure_id)
            .ok_or_else(|| EngineError::Store(format!("closure {} not in session", closure_id.short())))?;
        let plan = closure.plan()?;
        let root = plan.apply_closure(&closure, element_id)?;

        self.execute_subgraph(&plan, &root).await?;
        self.resolve_value(&root)
    }

    /// Executes the operations a root id depends on, dependencies first.
    /// Used for per-element subgraphs, which are typically small; elements
    /// gain their parallelism from the surrounding pool, not from here.
    async fn execute_subgraph(&self, plan: &WorkPlan, root: &NodeId) -> Result<(), EngineError> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        collect_operations(plan, root, &mut seen, &mut order);
        for (id, operator, arguments) in order {
            self.execute_operation(&id, &operator, &arguments).await?;
        }
        Ok(())
    }

    /// Streams a bag into element values. Mapped elements compute one at a
    /// time through the store, so at most one element's intermediate state
    /// is held in memory; finished results land on disk, not in the heap.
    pub fn materialize_bag<'a>(
        &'a self,
        bag: &'a Bag,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            match bag {
                Bag::Range { start, stop } => {
                    Ok((*start..*stop).map(|i| Value::Number(i as f64)).collect())
                }
                Bag::Dir { path } => {
                    let mut entries = Vec::new();
                    let mut reader = tokio::fs::read_dir(path).await.map_err(|e| {
                        EngineError::Store(format!("readdir {}: {e}", path.display()))
                    })?;
                    while let Some(entry) = reader
                        .next_entry()
                        .await
                        .map_err(|e| EngineError::Store(format!("readdir: {e}")))?
                    {
                        entries.push(entry.path().to_string_lossy().into_owned());
                    }
                    entries.sort();
                    Ok(entries.into_iter().map(Value::String).collect())
                }
                Bag::Literal { items } => Ok(items.clone()),
                Bag::Mapped { source, closure } => {
                    let elements = self.materialize_bag(source).await?;
                    let mut out = Vec::with_capacity(elements.len());
                    for element in elements {
                        if self.cancelled() {
                            return Err(EngineError::Cancelled);
                        }
                        out.push(self.eval_element(closure, element).await?);
                    }
                    Ok(out)
                }
            }
        })
    }
}

/// Post-order walk over the operation subgraph rooted at `root`.
/// Dependencies that are constants, closures or store-resident values are
/// leaves and are skipped.
fn collect_operations(
    plan: &WorkPlan,
    root: &NodeId,
    seen: &mut BTreeSet<NodeId>,
    order: &mut Vec<(NodeId, String, ArgumentMap)>,
) {
    if !seen.insert(root.clone()) {
        return;
    }
    if let Some(Node::Operation {
        operator,
        arguments,
    }) = plan.get(root)
    {
        for dep in arguments.values() {
            collect_operations(plan, dep, seen, order);
        }
        order.push((root.clone(), operator, arguments));
    }
}

// ============================================================================
// 2. THE EXECUTION REPORT
// ============================================================================

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub completed: BTreeSet<NodeId>,
    /// Primitive invocations performed this run.
    pub computed: usize,
    /// Nodes satisfied from the store without invocation.
    pub cache_hits: usize,
    /// id → diagnostic, for root failures and their cascaded dependents.
    pub failures: BTreeMap<NodeId, String>,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

// ============================================================================
// 3. TOP-LEVEL EXECUTION
// ============================================================================

pub async fn execute(
    plan: &WorkPlan,
    store: Arc<ResultStore>,
    registry: Arc<Registry>,
    workers: usize,
    cancel: Arc<AtomicBool>,
) -> Result<(ExecutionReport, EvalContext), EngineError> {
    let workers = workers.max(1);
    let ctx = EvalContext {
        plan: plan.clone(),
        store,
        registry,
        limiter: Arc::new(Semaphore::new(workers)),
        cancel,
        computed: Arc::new(AtomicUsize::new(0)),
        cache_hits: Arc::new(AtomicUsize::new(0)),
    };

    // 1. Imports travel with the plan, not with the registry the reducer saw.
    for namespace in plan.imports() {
        ctx.registry.import_namespace(&namespace)?;
    }

    // 2. Pre-store constants, seed closures into the session cache.
    for (id, node) in plan.nodes_snapshot() {
        match node {
            Node::Constant { value } => {
                ctx.store.store(&id, value)?;
            }
            Node::Closure { closure } => {
                ctx.store.put_closure(closure);
            }
            Node::Operation { .. } => {}
        }
    }

    // 3. Dependency graph over operations. Accessing `operations` forces any
    // pending lazy expansion first.
    let operations = plan.operations()?;
    let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
    let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
    for (id, _, _) in &operations {
        index.insert(id.clone(), graph.add_node(id.clone()));
    }
    let op_data: HashMap<NodeId, (String, ArgumentMap)> = operations
        .iter()
        .map(|(id, op, args)| (id.clone(), (op.clone(), args.clone())))
        .collect();
    for (id, _, args) in &operations {
        let target = index[id];
        for dep in args.values() {
            if let Some(&source) = index.get(dep) {
                // update_edge: a node that uses the same dependency twice
                // still has exactly one ordering edge.
                graph.update_edge(source, target, ());
            }
        }
    }

    // 4. Topological dispatch over a bounded worker pool.
    let mut report = ExecutionReport::default();
    let mut remaining: HashMap<NodeIndex, usize> = HashMap::new();
    let mut ready: VecDeque<NodeIndex> = VecDeque::new();

    // Seeding in toposort order keeps dispatch deterministic for graphs that
    // fit in the pool.
    let topo = petgraph::algo::toposort(&graph, None)
        .map_err(|_| EngineError::Store("cycle in workplan".into()))?;
    for idx in topo {
        let deps = graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .count();
        remaining.insert(idx, deps);
        if deps == 0 {
            ready.push_back(idx);
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<(NodeIndex, Result<(), EngineError>)>();
    let mut inflight = 0usize;
    let mut dead: BTreeSet<NodeIndex> = BTreeSet::new();

    loop {
        while let Some(idx) = ready.pop_front() {
            if dead.contains(&idx) {
                continue;
            }
            if ctx.cancelled() {
                report.cancelled = true;
                continue;
            }
            let id = graph[idx].clone();
            let (operator, arguments) = op_data[&id].clone();
            let worker_ctx = ctx.clone();
            let tx = tx.clone();
            inflight += 1;
            tokio::spawn(async move {
                let _permit = worker_ctx.limiter.clone().acquire_owned().await.ok();
                let result = worker_ctx
                    .execute_operation(&id, &operator, &arguments)
                    .await;
                // Receiver only drops after all inflight work settled.
                let _ = tx.send((idx, result));
            });
        }

        if inflight == 0 {
            break;
        }
        let Some((idx, result)) = rx.recv().await else {
            break;
        };
        inflight -= 1;

        match result {
            Ok(()) => {
                report.completed.insert(graph[idx].clone());
                for dependent in graph.neighbors_directed(idx, petgraph::Direction::Outgoing) {
                    if let Some(count) = remaining.get_mut(&dependent) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            ready.push_back(dependent);
                        }
                    }
                }
            }
            Err(error) => {
                let failed_id = graph[idx].clone();
                if matches!(error, EngineError::Cancelled) {
                    report.cancelled = true;
                    continue;
                }
                log::error!("node {} failed: {}", failed_id.short(), error);
                report.failures.insert(failed_id.clone(), error.to_string());

                // Cancel every transitive dependent: they are skipped and
                // reported as failed-by-dependency, referencing the root.
                let mut bfs = Bfs::new(&graph, idx);
                while let Some(dep_idx) = bfs.next(&graph) {
                    if dep_idx == idx || dead.contains(&dep_idx) {
                        continue;
                    }
                    dead.insert(dep_idx);
                    let dep_id = graph[dep_idx].clone();
                    report.failures.entry(dep_id.clone()).or_insert_with(|| {
                        EngineError::DependencyFailed {
                            node: dep_id.clone(),
                            dependency: failed_id.clone(),
                        }
                        .to_string()
                    });
                }
            }
        }
    }

    if ctx.cancelled() {
        report.cancelled = true;
    }
    report.computed = ctx.computed.load(Ordering::Relaxed);
    report.cache_hits = ctx.cache_hits.load(Ordering::Relaxed);

    log::info!(
        "execution settled: {} completed, {} computed, {} cache hits, {} failed",
        report.completed.len(),
        report.computed,
        report.cache_hits,
        report.failures.len()
    );

    Ok((report, ctx))
}
