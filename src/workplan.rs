// src/workplan.rs
//
// =============================================================================
// VOXLOGICA: WORKPLAN (v 2.0)
// =============================================================================
//
// The content-addressed DAG.
//
// Responsibilities:
// 1. Own the node map (operation / constant / closure), the ordered goal
//    list and the imported-namespace set.
// 2. Deduplicate: each node id is inserted at most once; repeated adds
//    return the existing id untouched.
// 3. Lazy expansion: closure applications queue pending reductions that are
//    forced when the operation set is demanded. A deferred reduction yields
//    exactly the ids an eager reduction would have.
// 4. Stable serialization: JSON with sorted node ids and argument keys,
//    Graphviz DOT for eyeballs.

use crate::core::{ArgumentMap, EngineError, Goal, NodeId, Value};
use crate::dsl::Expr;
use crate::ident;
use crate::primitives::Registry;
use crate::reducer::{self, Binding, Environment};
use serde_json::{json, Value as Json};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

// ============================================================================
// 1. NODES
// ============================================================================

/// A first-class function value: parameter, body AST and the environment it
/// captured at creation. The `captures` map is the hashed image of the
/// body's free variables under that environment; it determines the id.
pub struct ClosureValue {
    pub id: NodeId,
    pub parameter: String,
    pub body: Expr,
    pub env: Environment,
    pub captures: BTreeMap<String, String>,
    /// Back-reference to the owning plan, weak so a plan that owns closure
    /// nodes does not keep itself alive.
    plan: Weak<PlanShared>,
}

impl ClosureValue {
    pub fn plan(&self) -> Result<WorkPlan, EngineError> {
        self.plan
            .upgrade()
            .map(|shared| WorkPlan { shared })
            .ok_or_else(|| EngineError::Store("workplan dropped while closure in use".into()))
    }
}

impl fmt::Debug for ClosureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureValue")
            .field("id", &self.id.short())
            .field("parameter", &self.parameter)
            .field("captures", &self.captures)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Operation {
        operator: String,
        arguments: ArgumentMap,
    },
    Constant {
        value: Value,
    },
    Closure {
        closure: Arc<ClosureValue>,
    },
}

// ============================================================================
// 2. THE PLAN
// ============================================================================

/// A closure application waiting to be compiled: the saved expression, the
/// environment it closed over, and the parameter bindings of this
/// application.
struct PendingExpansion {
    key: (NodeId, NodeId),
    body: Expr,
    env: Environment,
    bindings: Vec<(String, NodeId)>,
}

pub(crate) struct PlanShared {
    registry: Arc<Registry>,
    nodes: Mutex<BTreeMap<NodeId, Node>>,
    goals: Mutex<Vec<Goal>>,
    /// Import order matters for unqualified resolution; duplicates are
    /// dropped on insert.
    imports: Mutex<Vec<String>>,
    pending: Mutex<Vec<PendingExpansion>>,
    /// (closure id, element id) → compiled root id. Memoizes applications so
    /// equal elements never compile twice.
    expansions: Mutex<HashMap<(NodeId, NodeId), NodeId>>,
    expanded: AtomicBool,
}

#[derive(Clone)]
pub struct WorkPlan {
    shared: Arc<PlanShared>,
}

impl fmt::Debug for WorkPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkPlan")
            .field("nodes", &self.shared.nodes.lock().unwrap().len())
            .field("goals", &self.shared.goals.lock().unwrap().len())
            .finish()
    }
}

impl WorkPlan {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            shared: Arc::new(PlanShared {
                registry,
                nodes: Mutex::new(BTreeMap::new()),
                goals: Mutex::new(Vec::new()),
                imports: Mutex::new(Vec::new()),
                pending: Mutex::new(Vec::new()),
                expansions: Mutex::new(HashMap::new()),
                expanded: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    // ------------------------------------------------------------------------
    // Node insertion (single writer per id)
    // ------------------------------------------------------------------------

    pub fn add_constant(&self, value: Value) -> Result<NodeId, EngineError> {
        let id = ident::constant_id(&value)
            .map_err(|m| EngineError::Store(format!("cannot address constant: {m}")))?;
        let mut nodes = self.shared.nodes.lock().unwrap();
        nodes.entry(id.clone()).or_insert(Node::Constant { value });
        Ok(id)
    }

    pub fn add_operation(&self, operator: &str, arguments: ArgumentMap) -> NodeId {
        let id = ident::operation_id(operator, &arguments);
        let mut nodes = self.shared.nodes.lock().unwrap();
        if !nodes.contains_key(&id) {
            // Children are compiled before parents. Argument ids not present
            // in this plan (captured from a closure environment, or dataset
            // element constants) must already be resolvable from the store.
            nodes.insert(
                id.clone(),
                Node::Operation {
                    operator: operator.to_string(),
                    arguments,
                },
            );
        }
        id
    }

    pub fn add_closure(&self, parameter: &str, body: &Expr, env: &Environment) -> NodeId {
        let captures = reducer::capture_image(body, &[parameter.to_string()], env);
        let id = ident::closure_id(parameter, &body.shape(), &captures);
        let mut nodes = self.shared.nodes.lock().unwrap();
        nodes.entry(id.clone()).or_insert_with(|| Node::Closure {
            closure: Arc::new(ClosureValue {
                id: id.clone(),
                parameter: parameter.to_string(),
                body: body.clone(),
                env: env.clone(),
                captures,
                plan: Arc::downgrade(&self.shared),
            }),
        });
        id
    }

    pub fn add_goal(&self, goal: Goal) {
        self.shared.goals.lock().unwrap().push(goal);
    }

    /// Idempotent. Rejects namespaces no provider is registered for, so a
    /// typo fails at reduction instead of mid-execution.
    pub fn add_import(&self, namespace: &str) -> Result<(), EngineError> {
        if namespace.trim().is_empty() {
            return Err(EngineError::Import("namespace name is empty".into()));
        }
        if !self.shared.registry.has_provider(namespace) {
            return Err(EngineError::Import(format!(
                "no such namespace: '{namespace}'"
            )));
        }
        let mut imports = self.shared.imports.lock().unwrap();
        if !imports.iter().any(|n| n == namespace) {
            imports.push(namespace.to_string());
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.shared.nodes.lock().unwrap().get(id).cloned()
    }

    pub fn nodes_snapshot(&self) -> Vec<(NodeId, Node)> {
        self.shared
            .nodes
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.shared.nodes.lock().unwrap().len()
    }

    pub fn goals(&self) -> Vec<Goal> {
        self.shared.goals.lock().unwrap().clone()
    }

    pub fn imports(&self) -> Vec<String> {
        self.shared.imports.lock().unwrap().clone()
    }

    /// The operation subset of the node map, in sorted id order. Forces any
    /// pending expansions first so the returned set is closed under
    /// dependencies.
    pub fn operations(&self) -> Result<Vec<(NodeId, String, ArgumentMap)>, EngineError> {
        self.force_expansion()?;
        let nodes = self.shared.nodes.lock().unwrap();
        Ok(nodes
            .iter()
            .filter_map(|(id, node)| match node {
                Node::Operation {
                    operator,
                    arguments,
                } => Some((id.clone(), operator.clone(), arguments.clone())),
                _ => None,
            })
            .collect())
    }

    // ------------------------------------------------------------------------
    // Lazy expansion
    // ------------------------------------------------------------------------

    /// Drains the pending queue, re-entering the reducer for each saved
    /// (expression, environment, bindings) triple. Idempotent: reduction is
    /// pure and node insertion deduplicates, so forcing twice is a no-op.
    /// Entries are popped one at a time, so concurrent forcers cooperate
    /// instead of compiling the same entry.
    pub fn force_expansion(&self) -> Result<(), EngineError> {
        loop {
            let entry = self.shared.pending.lock().unwrap().pop();
            let Some(e) = entry else { break };
            let mut env = e.env.clone();
            for (name, id) in &e.bindings {
                env = env.extend(name, Binding::Value(id.clone()));
            }
            let root = reducer::reduce_expression(&e.body, &env, self)?;
            self.shared.expansions.lock().unwrap().insert(e.key, root);
        }
        self.shared.expanded.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_expanded(&self) -> bool {
        self.shared.expanded.load(Ordering::SeqCst)
    }

    /// Compiles one application of a closure to an element id, returning the
    /// root id of the compiled body. Applying the same closure to the same
    /// element always yields the same id, whether the work happened here, in
    /// a concurrent expansion, or eagerly in a previous reduction.
    pub fn apply_closure(
        &self,
        closure: &ClosureValue,
        element: NodeId,
    ) -> Result<NodeId, EngineError> {
        let key = (closure.id.clone(), element.clone());
        if let Some(id) = self.shared.expansions.lock().unwrap().get(&key) {
            return Ok(id.clone());
        }

        self.shared.pending.lock().unwrap().push(PendingExpansion {
            key: key.clone(),
            body: closure.body.clone(),
            env: closure.env.clone(),
            bindings: vec![(closure.parameter.clone(), element.clone())],
        });
        self.force_expansion()?;

        if let Some(id) = self.shared.expansions.lock().unwrap().get(&key) {
            return Ok(id.clone());
        }
        // A concurrent forcer picked our entry up but has not published the
        // result yet. Reduction is pure, so doing it again is harmless.
        let env = closure
            .env
            .extend(&closure.parameter, Binding::Value(element));
        let root = reducer::reduce_expression(&closure.body, &env, self)?;
        self.shared.expansions.lock().unwrap().insert(key, root.clone());
        Ok(root)
    }

    // ------------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------------

    /// Stable JSON: node ids sorted (BTreeMap order), arguments by sorted
    /// keys, goals in insertion order, imports sorted.
    pub fn to_json(&self) -> Json {
        let nodes = self.shared.nodes.lock().unwrap();
        let mut node_map = serde_json::Map::new();
        for (id, node) in nodes.iter() {
            let entry = match node {
                Node::Operation {
                    operator,
                    arguments,
                } => {
                    let args: serde_json::Map<String, Json> = arguments
                        .iter()
                        .map(|(k, v)| (k.clone(), Json::String(v.to_string())))
                        .collect();
                    json!({ "kind": "operation", "operator": operator, "arguments": args })
                }
                Node::Constant { value } => {
                    json!({ "kind": "constant", "value": value.to_json() })
                }
                Node::Closure { closure } => {
                    json!({
                        "kind": "closure",
                        "parameter": closure.parameter,
                        "captures": closure.captures,
                    })
                }
            };
            node_map.insert(id.to_string(), entry);
        }

        let goals: Vec<Json> = self
            .shared
            .goals
            .lock()
            .unwrap()
            .iter()
            .map(|g| json!({ "kind": g.kind, "id": g.target, "name": g.name }))
            .collect();

        let mut imports = self.imports();
        imports.sort();

        json!({ "nodes": node_map, "goals": goals, "imports": imports })
    }

    /// Graphviz DOT rendering: nodes labelled by operator (or value
    /// summary), edges labelled by argument key.
    pub fn to_dot(&self) -> String {
        let nodes = self.shared.nodes.lock().unwrap();
        let mut out = String::from("digraph workplan {\n");
        out.push_str("  rankdir=BT;\n");
        for (id, node) in nodes.iter() {
            let label = match node {
                Node::Operation { operator, .. } => operator.clone(),
                Node::Constant { value } => value.kind_name().to_string(),
                Node::Closure { closure } => format!("closure {}", closure.parameter),
            };
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\"];\n",
                id.short(),
                label.replace('"', "\\\"")
            ));
        }
        for (id, node) in nodes.iter() {
            if let Node::Operation { arguments, .. } = node {
                for (key, dep) in arguments {
                    out.push_str(&format!(
                        "  \"{}\" -> \"{}\" [label=\"{}\"];\n",
                        dep.short(),
                        id.short(),
                        key
                    ));
                }
            }
        }
        out.push_str("}\n");
        out
    }
}
