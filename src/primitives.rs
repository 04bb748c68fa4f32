// src/primitives.rs
//
// =============================================================================
// VOXLOGICA: PRIMITIVE REGISTRY (v 2.0)
// =============================================================================
//
// The Dispatch Layer.
//
// Responsibilities:
// 1. Define the `Primitive` trait (The Contract): a uniform
//    (argument map) -> value signature with an explicit evaluation context,
//    so primitives that apply closures reach the reducer without hidden
//    thread-local state.
// 2. Load namespaces through provider hooks; imports are idempotent.
// 3. Resolve qualified and unqualified operator names: `ns.op` looks up in
//    `ns`, bare names search `default` first, then imports in order.
// 4. Map positional argument keys to semantic names for well-known symbols.

use crate::core::{EngineError, Value};
use crate::scheduler::EvalContext;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub mod default;

/// Operator emitted by for-loop reduction; maps a dataset through a closure.
pub const MAP_OPERATOR: &str = "dask_map";

/// Goal keywords. Side effects are goals, never cached computations, so no
/// namespace may register a primitive under these names.
const RESERVED_NAMES: [&str; 2] = ["print", "save"];

// ============================================================================
// 1. THE CONTRACTS
// ============================================================================

#[async_trait]
pub trait Primitive: Send + Sync {
    /// One-line human description, for `list`.
    fn describe(&self) -> &str;

    /// Applies the primitive to resolved argument values. Keys are semantic
    /// names where a mapping exists, positional strings otherwise.
    async fn apply(&self, ctx: &EvalContext, args: BTreeMap<String, Value>) -> Result<Value>;
}

/// Writes a value to disk in some format; keyed by file extension in the
/// registry's writer table.
pub trait ValueWriter: Send + Sync {
    fn write(&self, path: &Path, value: &Value) -> Result<()>;
}

/// A namespace: a named collection of primitives registered through a hook.
pub trait NamespaceProvider: Send + Sync {
    fn name(&self) -> &str;

    /// The registration hook. Called once, on first import.
    fn register_primitives(&self) -> Result<BTreeMap<String, Arc<dyn Primitive>>>;

    /// Extension → writer contributions for save goals. Most namespaces have
    /// none.
    fn writers(&self) -> Vec<(String, Arc<dyn ValueWriter>)> {
        Vec::new()
    }
}

// ============================================================================
// 2. STATIC OPERATOR TABLES
// ============================================================================

/// Semantic argument names for well-known operator symbols. Applied at
/// invocation time to argument maps with purely positional keys; content
/// hashes always see the keys the reducer emitted.
pub fn argument_names(operator: &str) -> Option<&'static [&'static str]> {
    match operator {
        "+" | "-" | "*" | "/" | "addition" | "subtraction" | "multiplication" | "division" => {
            Some(&["left", "right"])
        }
        "range" => Some(&["start", "stop"]),
        "readdir" => Some(&["path"]),
        MAP_OPERATOR => Some(&["iterable", "function"]),
        _ => None,
    }
}

/// Operators whose binary operand order is semantically irrelevant. The
/// reducer sorts their operand ids so `1 + 2` and `2 + 1` share one node.
pub fn is_commutative(operator: &str) -> bool {
    matches!(operator, "+" | "*" | "addition" | "multiplication")
}

// ============================================================================
// 3. THE REGISTRY
// ============================================================================

struct Namespace {
    entries: BTreeMap<String, Arc<dyn Primitive>>,
    writers: Vec<(String, Arc<dyn ValueWriter>)>,
}

pub struct Registry {
    providers: Mutex<BTreeMap<String, Arc<dyn NamespaceProvider>>>,
    loaded: Mutex<HashMap<String, Arc<Namespace>>>,
    imported: Mutex<Vec<String>>,
    loading: Mutex<HashSet<String>>,
}

impl Registry {
    /// An empty registry with the built-in `default` namespace available
    /// (not yet imported; the prelude does that).
    pub fn new() -> Self {
        let registry = Self {
            providers: Mutex::new(BTreeMap::new()),
            loaded: Mutex::new(HashMap::new()),
            imported: Mutex::new(Vec::new()),
            loading: Mutex::new(HashSet::new()),
        };
        registry.add_provider(Arc::new(default::DefaultNamespace));
        registry
    }

    pub fn add_provider(&self, provider: Arc<dyn NamespaceProvider>) {
        let name = provider.name().to_string();
        self.providers.lock().unwrap().insert(name, provider);
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.lock().unwrap().contains_key(name)
    }

    pub fn imported(&self) -> Vec<String> {
        self.imported.lock().unwrap().clone()
    }

    /// Loads a namespace through its provider hook and records the import.
    /// Importing the same namespace k times has the effect of importing it
    /// once.
    pub fn import_namespace(&self, name: &str) -> Result<(), EngineError> {
        if self.imported.lock().unwrap().iter().any(|n| n == name) {
            return Ok(());
        }
        let provider = self
            .providers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Import(format!("no such namespace: '{name}'")))?;

        // A provider hook that re-imports its own namespace would loop.
        if !self.loading.lock().unwrap().insert(name.to_string()) {
            return Err(EngineError::CyclicImport(name.to_string()));
        }
        let result = self.load_namespace(name, provider.as_ref());
        self.loading.lock().unwrap().remove(name);
        let namespace = result?;

        // Cross-namespace collisions resolve by import order; just log them.
        for entry in namespace.entries.keys() {
            if let Some(owner) = self.owner_of(entry) {
                log::warn!(
                    "operator '{}' from namespace '{}' is shadowed by '{}'",
                    entry,
                    name,
                    owner
                );
            }
        }

        self.loaded
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(namespace));
        self.imported.lock().unwrap().push(name.to_string());
        log::debug!("imported namespace '{}'", name);
        Ok(())
    }

    fn load_namespace(
        &self,
        name: &str,
        provider: &dyn NamespaceProvider,
    ) -> Result<Namespace, EngineError> {
        let entries = provider
            .register_primitives()
            .map_err(|e| EngineError::Import(format!("namespace '{name}' failed to load: {e}")))?;
        for entry in entries.keys() {
            if RESERVED_NAMES.contains(&entry.as_str()) {
                return Err(EngineError::Import(format!(
                    "namespace '{name}' registers reserved name '{entry}'"
                )));
            }
            if entry.contains('.') {
                return Err(EngineError::Import(format!(
                    "namespace '{name}' registers qualified name '{entry}'"
                )));
            }
        }
        Ok(Namespace {
            entries,
            writers: provider.writers(),
        })
    }

    /// Which already-imported namespace an unqualified name currently
    /// resolves in, if any.
    fn owner_of(&self, operator: &str) -> Option<String> {
        let loaded = self.loaded.lock().unwrap();
        if let Some(ns) = loaded.get("default") {
            if ns.entries.contains_key(operator) {
                return Some("default".to_string());
            }
        }
        for name in self.imported.lock().unwrap().iter() {
            if name == "default" {
                continue;
            }
            if let Some(ns) = loaded.get(name) {
                if ns.entries.contains_key(operator) {
                    return Some(name.clone());
                }
            }
        }
        None
    }

    /// Resolves an operator string to a callable.
    ///
    /// `ns.op` looks up `op` in `ns` only (which must be imported). A bare
    /// name searches `default` first, then imported namespaces in import
    /// order; first match wins.
    pub fn resolve(&self, operator: &str) -> Result<Arc<dyn Primitive>, EngineError> {
        let loaded = self.loaded.lock().unwrap();
        if let Some((ns, name)) = operator.split_once('.') {
            let namespace = loaded.get(ns).ok_or_else(|| {
                EngineError::Import(format!("namespace '{ns}' is not imported"))
            })?;
            return namespace.entries.get(name).cloned().ok_or_else(|| {
                EngineError::UnknownOperator {
                    operator: operator.to_string(),
                }
            });
        }
        if let Some(ns) = loaded.get("default") {
            if let Some(p) = ns.entries.get(operator) {
                return Ok(p.clone());
            }
        }
        for name in self.imported.lock().unwrap().iter() {
            if name == "default" {
                continue;
            }
            if let Some(p) = loaded.get(name).and_then(|ns| ns.entries.get(operator)) {
                return Ok(p.clone());
            }
        }
        Err(EngineError::UnknownOperator {
            operator: operator.to_string(),
        })
    }

    /// Writer for a file extension, searched in import order.
    pub fn writer_for(&self, extension: &str) -> Option<Arc<dyn ValueWriter>> {
        let loaded = self.loaded.lock().unwrap();
        for name in self.imported.lock().unwrap().iter() {
            if let Some(ns) = loaded.get(name) {
                for (ext, writer) in &ns.writers {
                    if ext.eq_ignore_ascii_case(extension) {
                        return Some(writer.clone());
                    }
                }
            }
        }
        None
    }

    /// Descriptions of registered primitives, optionally restricted to one
    /// namespace.
    pub fn list(&self, namespace: Option<&str>) -> Vec<(String, String)> {
        let loaded = self.loaded.lock().unwrap();
        let mut out = Vec::new();
        for (ns_name, ns) in loaded.iter() {
            if namespace.is_some_and(|want| want != ns_name) {
                continue;
            }
            for (op, primitive) in &ns.entries {
                out.push((format!("{ns_name}.{op}"), primitive.describe().to_string()));
            }
        }
        out.sort();
        out
    }

    /// Renames purely positional argument keys ("0", "1", ...) to the
    /// semantic names of well-known operators. Maps with semantic keys pass
    /// through untouched.
    pub fn map_argument_keys(
        &self,
        operator: &str,
        args: BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let Some(names) = argument_names(operator) else {
            return args;
        };
        if args.len() != names.len() || !args.keys().all(|k| k.parse::<usize>().is_ok()) {
            return args;
        }
        args.into_iter()
            .map(|(key, value)| {
                let index: usize = key.parse().expect("checked numeric");
                match names.get(index) {
                    Some(name) => (name.to_string(), value),
                    None => (key, value),
                }
            })
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    #[async_trait]
    impl Primitive for Echo {
        fn describe(&self) -> &str {
            "echoes a marker string"
        }
        async fn apply(&self, _ctx: &EvalContext, _args: BTreeMap<String, Value>) -> Result<Value> {
            Ok(Value::String(self.0.to_string()))
        }
    }

    struct TestNs {
        name: &'static str,
        entries: Vec<(&'static str, &'static str)>,
    }

    impl NamespaceProvider for TestNs {
        fn name(&self) -> &str {
            self.name
        }
        fn register_primitives(&self) -> Result<BTreeMap<String, Arc<dyn Primitive>>> {
            Ok(self
                .entries
                .iter()
                .map(|(op, marker)| (op.to_string(), Arc::new(Echo(marker)) as Arc<dyn Primitive>))
                .collect())
        }
    }

    #[test]
    fn imports_are_idempotent() {
        let registry = Registry::new();
        registry.add_provider(Arc::new(TestNs {
            name: "ns",
            entries: vec![("op", "ns-op")],
        }));
        for _ in 0..3 {
            registry.import_namespace("ns").unwrap();
        }
        assert_eq!(registry.imported(), vec!["ns".to_string()]);
    }

    #[test]
    fn qualified_lookup_bypasses_default() {
        let registry = Registry::new();
        registry.add_provider(Arc::new(TestNs {
            name: "ns",
            entries: vec![("addition", "ns-addition")],
        }));
        registry.import_namespace("default").unwrap();
        registry.import_namespace("ns").unwrap();

        // Unqualified: default wins.
        assert!(registry.resolve("addition").is_ok());
        // Qualified: the ns implementation, even though default has one too.
        assert!(registry.resolve("ns.addition").is_ok());
        assert!(matches!(
            registry.resolve("ns.missing"),
            Err(EngineError::UnknownOperator { .. })
        ));
    }

    #[test]
    fn reserved_names_are_rejected() {
        let registry = Registry::new();
        registry.add_provider(Arc::new(TestNs {
            name: "bad",
            entries: vec![("print", "nope")],
        }));
        assert!(matches!(
            registry.import_namespace("bad"),
            Err(EngineError::Import(_))
        ));
    }

    #[test]
    fn positional_keys_map_to_semantic_names() {
        let registry = Registry::new();
        let mut args = BTreeMap::new();
        args.insert("0".to_string(), Value::Number(1.0));
        args.insert("1".to_string(), Value::Number(2.0));
        let mapped = registry.map_argument_keys("addition", args);
        assert!(mapped.contains_key("left") && mapped.contains_key("right"));

        let mut semantic = BTreeMap::new();
        semantic.insert("iterable".to_string(), Value::Number(0.0));
        semantic.insert("function".to_string(), Value::Number(0.0));
        let untouched = registry.map_argument_keys(MAP_OPERATOR, semantic.clone());
        assert_eq!(untouched, semantic);
    }
}
