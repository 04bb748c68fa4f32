// src/core.rs
//
// =============================================================================
// VOXLOGICA: CORE SCHEMA AUTHORITY (v 2.0)
// =============================================================================
//
// The shared vocabulary of the engine.
// This file defines the strict data contracts between the reducer (graph
// builder), the store (persistence) and the scheduler (execution).
//
// Design Principles:
// 1. Newtype Pattern: A NodeId is not "any string", it is a 256-bit content
//    hash rendered as 64 lowercase hex chars.
// 2. Content Addressing: Equal ids imply semantically equal computations.
// 3. Opaque Datasets: Bags are lazy descriptions, never materialized here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// 1. SOURCE POSITIONS
// ============================================================================

/// A line/column pair inside an ImgQL source file. 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self { line: 1, column: 1 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

// ============================================================================
// 2. NODE IDENTITY (The Content Address)
// ============================================================================

/// SHA-256 content hash of a node, rendered as 64 lowercase hex chars.
///
/// Ids are computed by the `ident` module; everything else treats them as
/// opaque tokens. Equal ids imply semantically equal computations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps a pre-rendered 64-hex digest. Only `ident` should call this.
    pub(crate) fn from_hex(hex: String) -> Self {
        debug_assert!(hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()));
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// 3. RUNTIME VALUES
// ============================================================================

/// A lazy dataset description. Bags are opaque: producing primitives return
/// them, consuming primitives (or the goal handler) stream their elements.
/// They are never written to the persistent store.
#[derive(Debug, Clone, PartialEq)]
pub enum Bag {
    /// Integers in `[start, stop)`, yielded as numbers.
    Range { start: i64, stop: i64 },
    /// Directory entries, yielded as path strings in sorted order.
    Dir { path: PathBuf },
    /// An already-known element sequence (small iterables).
    Literal { items: Vec<Value> },
    /// `source` mapped element-wise through the closure with the given id.
    /// Element computations run on demand, one derived id per element.
    Mapped { source: Box<Bag>, closure: NodeId },
}

/// The value vocabulary of the engine.
///
/// Closures are referenced by id only: the actual closure object (body AST +
/// captured environment) lives in the session cache, since it can never
/// cross the serialization boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    String(String),
    /// Raw binary payload (file contents, pre-computed blobs).
    Blob(Vec<u8>),
    /// A materialized sequence of values.
    List(Vec<Value>),
    Bag(Bag),
    Closure(NodeId),
}

impl Value {
    /// True when the value can be written to the persistent store.
    pub fn is_serializable(&self) -> bool {
        match self {
            Value::Number(_) | Value::Bool(_) | Value::String(_) | Value::Blob(_) => true,
            Value::List(items) => items.iter().all(Value::is_serializable),
            Value::Bag(_) | Value::Closure(_) => false,
        }
    }

    /// JSON projection for task-graph export and `.json` save goals.
    /// Integral numbers render as integers; opaque values render as tagged
    /// summaries rather than failing.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Blob(bytes) => serde_json::json!({ "blob_hex": hex::encode(bytes) }),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Bag(_) => serde_json::json!({ "dataset": "unmaterialized" }),
            Value::Closure(id) => serde_json::json!({ "closure": id.to_string() }),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::String(_) => "string",
            Value::Blob(_) => "blob",
            Value::List(_) => "list",
            Value::Bag(_) => "dataset",
            Value::Closure(_) => "closure",
        }
    }
}

// ============================================================================
// 4. GOALS (Side Effects, Pinned to Node Ids)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalKind {
    Print,
    Save,
}

/// A post-execution action. `print` writes `name=value` to stdout, `save`
/// writes the value to `name` interpreted as a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub kind: GoalKind,
    pub target: NodeId,
    /// Label for print goals, output path for save goals.
    pub name: String,
}

// ============================================================================
// 5. ERRORS
// ============================================================================

/// Every failure mode of the engine, with source positions for reducer-side
/// errors and node ids for execution-side errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse error at {pos}: {message}")]
    Parse { pos: Position, message: String },

    #[error("unbound identifier '{name}' at {pos}")]
    UnboundIdentifier { name: String, pos: Position },

    #[error("arity mismatch for '{name}' at {pos}: expected {expected} argument(s), got {got}")]
    ArityMismatch {
        name: String,
        pos: Position,
        expected: usize,
        got: usize,
    },

    #[error("duplicate declaration of '{name}' at {pos}")]
    DuplicateDeclaration { name: String, pos: Position },

    #[error("unknown operator '{operator}'")]
    UnknownOperator { operator: String },

    #[error("import error: {0}")]
    Import(String),

    #[error("cyclic import of namespace '{0}'")]
    CyclicImport(String),

    #[error("primitive '{operator}' failed for node {node}: {message}")]
    Primitive {
        operator: String,
        node: NodeId,
        message: String,
    },

    #[error("cannot serialize value for node {node}: {message}")]
    Serialization { node: NodeId, message: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("cancelled")]
    Cancelled,

    #[error("dependency {dependency} of node {node} failed")]
    DependencyFailed { node: NodeId, dependency: NodeId },
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Store(e.to_string())
    }
}

/// Argument maps keyed either positionally ("0", "1", ...) or semantically
/// ("left", "right", "iterable", ...). BTreeMap keeps keys sorted, which the
/// content hash relies on.
pub type ArgumentMap = BTreeMap<String, NodeId>;
