// src/goals.rs
//
// =============================================================================
// VOXLOGICA: GOAL HANDLER (v 2.0)
// =============================================================================
//
// Materializes goals after execution settles, in declaration order.
//
// - print: `name=value` to stdout. Numbers, booleans and strings render
//   as-is; datasets materialize into a bracketed list; other values render
//   as a short human-readable summary.
// - save: writer selected by file extension (.json, .txt, .bin, plus any
//   writers contributed by imported namespaces). Unknown or missing
//   extensions fall back to raw bytes.
//
// A goal whose upstream node failed reports an error that names the node id
// and skips writing; the remaining goals still run.

use crate::core::{EngineError, Goal, GoalKind, NodeId, Value};
use crate::ident;
use crate::scheduler::EvalContext;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

#[derive(Debug, Clone)]
pub struct GoalOutcome {
    pub goal: Goal,
    /// Ok(summary of what happened) or Err(diagnostic).
    pub result: Result<String, String>,
}

pub async fn run_goals(
    ctx: &EvalContext,
    goals: &[Goal],
    failures: &BTreeMap<NodeId, String>,
) -> Vec<GoalOutcome> {
    let mut outcomes = Vec::with_capacity(goals.len());
    for goal in goals {
        let result = if let Some(cause) = failures.get(&goal.target) {
            Err(format!(
                "upstream node {} failed: {}",
                goal.target.short(),
                cause
            ))
        } else {
            run_goal(ctx, goal).await.map_err(|e| e.to_string())
        };
        if let Err(e) = &result {
            log::error!("goal '{}' failed: {}", goal.name, e);
        }
        outcomes.push(GoalOutcome {
            goal: goal.clone(),
            result,
        });
    }
    outcomes
}

async fn run_goal(ctx: &EvalContext, goal: &Goal) -> Result<String, EngineError> {
    let value = ctx.resolve_value(&goal.target)?;
    match goal.kind {
        GoalKind::Print => {
            let rendered = render_value(ctx, &value).await?;
            println!("{}={}", goal.name, rendered);
            Ok(rendered)
        }
        GoalKind::Save => {
            save_value(ctx, Path::new(&goal.name), value).await?;
            Ok(format!("saved to {}", goal.name))
        }
    }
}

// ============================================================================
// 1. RENDERING (print)
// ============================================================================

/// Human-readable rendering. Boxed future: datasets materialize through the
/// context and may nest.
pub fn render_value<'a>(
    ctx: &'a EvalContext,
    value: &'a Value,
) -> Pin<Box<dyn Future<Output = Result<String, EngineError>> + Send + 'a>> {
    Box::pin(async move {
        match value {
            Value::Number(n) => Ok(ident::canonical_number(*n)),
            Value::Bool(b) => Ok(b.to_string()),
            Value::String(s) => Ok(s.clone()),
            Value::Blob(bytes) => Ok(format!("<blob {} bytes>", bytes.len())),
            Value::List(items) => render_list(ctx, items).await,
            Value::Bag(bag) => {
                let items = ctx.materialize_bag(bag).await?;
                render_list(ctx, &items).await
            }
            Value::Closure(id) => Ok(format!("<closure {}>", id.short())),
        }
    })
}

async fn render_list(ctx: &EvalContext, items: &[Value]) -> Result<String, EngineError> {
    let mut out = String::from("[");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&render_value(ctx, item).await?);
    }
    out.push(']');
    Ok(out)
}

// ============================================================================
// 2. WRITERS (save)
// ============================================================================

async fn save_value(ctx: &EvalContext, path: &Path, value: Value) -> Result<(), EngineError> {
    // Datasets materialize before writing; everything downstream handles
    // plain values only.
    let value = match value {
        Value::Bag(bag) => Value::List(ctx.materialize_bag(&bag).await?),
        other => other,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::Store(format!("cannot create {}: {e}", parent.display())))?;
        }
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    // Namespace-contributed writers (image codecs and friends) win over the
    // built-in formats.
    if let Some(writer) = ctx.registry.writer_for(&extension) {
        return writer
            .write(path, &value)
            .map_err(|e| EngineError::Store(format!("writer for .{extension}: {e}")));
    }

    let bytes: Vec<u8> = match extension.as_str() {
        "json" => {
            let mut text = serde_json::to_string_pretty(&value.to_json())
                .map_err(|e| EngineError::Store(format!("json render: {e}")))?;
            text.push('\n');
            text.into_bytes()
        }
        "txt" => {
            let mut text = render_value(ctx, &value).await?;
            text.push('\n');
            text.into_bytes()
        }
        // .bin and anything unknown: raw bytes.
        _ => raw_bytes(&value),
    };

    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| EngineError::Store(format!("cannot write {}: {e}", path.display())))?;
    log::info!("saved {} ({})", path.display(), value.kind_name());
    Ok(())
}

fn raw_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Blob(bytes) => bytes.clone(),
        Value::String(s) => s.as_bytes().to_vec(),
        other => serde_json::to_vec(&other.to_json()).unwrap_or_default(),
    }
}
