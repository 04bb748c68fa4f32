// src/primitives/default.rs
//
// =============================================================================
// VOXLOGICA: DEFAULT NAMESPACE (v 2.0)
// =============================================================================
//
// The built-in primitives: arithmetic, dataset producers (range, readdir)
// and the dataset mapper. Image codecs and external library wrappers live in
// their own namespaces and are registered the same way.

use super::{NamespaceProvider, Primitive, MAP_OPERATOR};
use crate::core::{Bag, NodeId, Value};
use crate::scheduler::EvalContext;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub struct DefaultNamespace;

impl NamespaceProvider for DefaultNamespace {
    fn name(&self) -> &str {
        "default"
    }

    fn register_primitives(&self) -> Result<BTreeMap<String, Arc<dyn Primitive>>> {
        let mut entries: BTreeMap<String, Arc<dyn Primitive>> = BTreeMap::new();
        entries.insert("addition".into(), Arc::new(Arith::Add));
        entries.insert("subtraction".into(), Arc::new(Arith::Sub));
        entries.insert("multiplication".into(), Arc::new(Arith::Mul));
        entries.insert("division".into(), Arc::new(Arith::Div));
        entries.insert("range".into(), Arc::new(Range));
        entries.insert("readdir".into(), Arc::new(ReadDir));
        entries.insert(MAP_OPERATOR.into(), Arc::new(DatasetMap));
        Ok(entries)
    }
}

// ============================================================================
// 1. ARGUMENT HELPERS
// ============================================================================

fn take(args: &mut BTreeMap<String, Value>, key: &str) -> Result<Value> {
    args.remove(key)
        .ok_or_else(|| anyhow!("missing argument '{key}'"))
}

fn number(args: &mut BTreeMap<String, Value>, key: &str) -> Result<f64> {
    match take(args, key)? {
        Value::Number(n) => Ok(n),
        other => bail!("argument '{key}' must be a number, got {}", other.kind_name()),
    }
}

fn integer(args: &mut BTreeMap<String, Value>, key: &str) -> Result<i64> {
    let n = number(args, key)?;
    if !n.is_finite() || n.fract() != 0.0 {
        bail!("argument '{key}' must be an integer, got {n}");
    }
    Ok(n as i64)
}

// ============================================================================
// 2. ARITHMETIC
// ============================================================================

enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

#[async_trait]
impl Primitive for Arith {
    fn describe(&self) -> &str {
        match self {
            Arith::Add => "left + right",
            Arith::Sub => "left - right",
            Arith::Mul => "left * right",
            Arith::Div => "left / right",
        }
    }

    async fn apply(&self, _ctx: &EvalContext, mut args: BTreeMap<String, Value>) -> Result<Value> {
        let left = number(&mut args, "left")?;
        let right = number(&mut args, "right")?;
        let out = match self {
            Arith::Add => left + right,
            Arith::Sub => left - right,
            Arith::Mul => left * right,
            Arith::Div => left / right,
        };
        Ok(Value::Number(out))
    }
}

// ============================================================================
// 3. DATASET PRODUCERS
// ============================================================================

/// `range(start, stop)` -> the integers in [start, stop), as a lazy bag.
struct Range;

#[async_trait]
impl Primitive for Range {
    fn describe(&self) -> &str {
        "integers in [start, stop) as a dataset"
    }

    async fn apply(&self, _ctx: &EvalContext, mut args: BTreeMap<String, Value>) -> Result<Value> {
        let start = integer(&mut args, "start")?;
        let stop = integer(&mut args, "stop")?;
        // stop <= start is a legal empty dataset.
        Ok(Value::Bag(Bag::Range { start, stop }))
    }
}

/// `readdir(path)` -> directory entries as a lazy bag of path strings.
/// Listing happens at materialization time, in sorted order.
struct ReadDir;

#[async_trait]
impl Primitive for ReadDir {
    fn describe(&self) -> &str {
        "directory entries as a dataset of path strings"
    }

    async fn apply(&self, _ctx: &EvalContext, mut args: BTreeMap<String, Value>) -> Result<Value> {
        match take(&mut args, "path")? {
            Value::String(path) => {
                let path = PathBuf::from(path);
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    bail!("directory not found: {}", path.display());
                }
                Ok(Value::Bag(Bag::Dir { path }))
            }
            other => bail!("argument 'path' must be a string, got {}", other.kind_name()),
        }
    }
}

// ============================================================================
// 4. DATASET MAPPER
// ============================================================================

/// Maps a dataset through a closure. The result is itself a lazy bag:
/// element computations run when a consumer streams it, each one under the
/// store's single-flight discipline with its own derived id.
struct DatasetMap;

#[async_trait]
impl Primitive for DatasetMap {
    fn describe(&self) -> &str {
        "element-wise closure application over a dataset"
    }

    async fn apply(&self, _ctx: &EvalContext, mut args: BTreeMap<String, Value>) -> Result<Value> {
        let closure: NodeId = match take(&mut args, "function")? {
            Value::Closure(id) => id,
            other => bail!(
                "argument 'function' must be a closure, got {}",
                other.kind_name()
            ),
        };
        let source = match take(&mut args, "iterable")? {
            Value::Bag(bag) => bag,
            Value::List(items) => Bag::Literal { items },
            other => bail!(
                "argument 'iterable' must be a dataset or list, got {}",
                other.kind_name()
            ),
        };
        Ok(Value::Bag(Bag::Mapped {
            source: Box::new(source),
            closure,
        }))
    }
}
