// src/reducer.rs
//
// =============================================================================
// VOXLOGICA: REDUCER (v 2.0)
// =============================================================================
//
// The Graph Builder.
//
// Responsibilities:
// 1. Walk the AST with an immutable environment, emitting constants,
//    operations and closures into a WorkPlan.
// 2. Inline function templates at application sites (capture-correct:
//    parameters shadow outer bindings, bodies reduce in their defining
//    environment).
// 3. Compute the captured-environment image that closure hashing needs.
//
// The reducer never mutates a shared environment: `extend` returns a fresh
// one that shares structure with its parent. Closures escaping their
// defining scope therefore keep exactly the bindings they saw.

use crate::core::{ArgumentMap, EngineError, Goal, GoalKind, NodeId, Value};
use crate::dsl::{Command, Expr, ExprKind};
use crate::ident;
use crate::primitives;
use crate::workplan::WorkPlan;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

// ============================================================================
// 1. ENVIRONMENTS (Persistent Maps)
// ============================================================================

/// What a name can stand for during reduction.
#[derive(Clone)]
pub enum Binding {
    /// An already-reduced node.
    Value(NodeId),
    /// A function template, inlined at application sites.
    Function(Arc<FunctionTemplate>),
}

/// `let f(p1, ..., pk) = body`, together with its defining environment.
pub struct FunctionTemplate {
    pub name: String,
    pub parameters: Vec<String>,
    pub body: Expr,
    pub env: Environment,
}

/// An immutable identifier → binding map. Extension is non-destructive:
/// frames are Arc-shared, so environments captured by closures stay valid
/// no matter what the caller binds afterwards.
#[derive(Clone, Default)]
pub struct Environment {
    head: Option<Arc<Frame>>,
}

struct Frame {
    name: String,
    binding: Binding,
    parent: Option<Arc<Frame>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Innermost binding wins, which is what makes parameters shadow
    /// captured names.
    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        let mut frame = self.head.as_deref();
        while let Some(f) = frame {
            if f.name == name {
                return Some(&f.binding);
            }
            frame = f.parent.as_deref();
        }
        None
    }

    #[must_use]
    pub fn extend(&self, name: &str, binding: Binding) -> Environment {
        Environment {
            head: Some(Arc::new(Frame {
                name: name.to_string(),
                binding,
                parent: self.head.clone(),
            })),
        }
    }
}

// ============================================================================
// 2. CAPTURE IMAGES
// ============================================================================

/// The image of an expression's free identifiers under the current
/// environment: name → rendered binding identity. Value bindings render as
/// their node id, template bindings as a structural hash (parameters + body
/// shape + their own capture image, recursively).
///
/// Free names with no binding are skipped: they are operator references,
/// resolved by the registry at execution time.
pub(crate) fn capture_image(
    body: &Expr,
    exclude: &[String],
    env: &Environment,
) -> BTreeMap<String, String> {
    let mut image = BTreeMap::new();
    for name in body.free_identifiers() {
        if exclude.iter().any(|p| p == &name) {
            continue;
        }
        if let Some(binding) = env.lookup(&name) {
            image.insert(name, binding_image(binding));
        }
    }
    image
}

fn binding_image(binding: &Binding) -> String {
    match binding {
        Binding::Value(id) => format!("v:{}", id),
        Binding::Function(tpl) => {
            let captures = capture_image(&tpl.body, &tpl.parameters, &tpl.env);
            format!(
                "f:{}",
                ident::template_hash(&tpl.parameters, &tpl.body.shape(), &captures)
            )
        }
    }
}

// ============================================================================
// 3. EXPRESSION REDUCTION
// ============================================================================

/// Reduces one expression to a node id, creating nodes as needed.
/// Deduplication is free: node ids are content hashes and the plan inserts
/// each id at most once.
pub fn reduce_expression(
    expr: &Expr,
    env: &Environment,
    plan: &WorkPlan,
) -> Result<NodeId, EngineError> {
    match &expr.kind {
        ExprKind::Number(n) => plan.add_constant(Value::Number(*n)),
        ExprKind::Bool(b) => plan.add_constant(Value::Bool(*b)),
        ExprKind::String(s) => plan.add_constant(Value::String(s.clone())),

        ExprKind::Ident(name) => match env.lookup(name) {
            Some(Binding::Value(id)) => Ok(id.clone()),
            Some(Binding::Function(tpl)) => {
                let tpl = tpl.clone();
                if tpl.parameters.is_empty() {
                    // Zero-parameter template: a thunk, reduced on demand in
                    // its defining environment.
                    reduce_expression(&tpl.body, &tpl.env, plan)
                } else if tpl.parameters.len() == 1 {
                    // Template in value position becomes a first-class
                    // closure capturing its defining environment.
                    Ok(plan.add_closure(&tpl.parameters[0], &tpl.body, &tpl.env))
                } else {
                    Err(EngineError::ArityMismatch {
                        name: name.clone(),
                        pos: expr.pos,
                        expected: 1,
                        got: tpl.parameters.len(),
                    })
                }
            }
            None => Err(EngineError::UnboundIdentifier {
                name: name.clone(),
                pos: expr.pos,
            }),
        },

        ExprKind::Call { callee, args } => {
            let mut arg_ids = Vec::with_capacity(args.len());
            for arg in args {
                arg_ids.push(reduce_expression(arg, env, plan)?);
            }
            match env.lookup(callee) {
                Some(Binding::Function(tpl)) => {
                    let tpl = tpl.clone();
                    if tpl.parameters.len() != arg_ids.len() {
                        return Err(EngineError::ArityMismatch {
                            name: callee.clone(),
                            pos: expr.pos,
                            expected: tpl.parameters.len(),
                            got: arg_ids.len(),
                        });
                    }
                    // Inline the template body under its own environment,
                    // extended with parameter bindings. No node for the
                    // function itself.
                    let mut call_env = tpl.env.clone();
                    for (param, id) in tpl.parameters.iter().zip(arg_ids) {
                        call_env = call_env.extend(param, Binding::Value(id));
                    }
                    reduce_expression(&tpl.body, &call_env, plan)
                }
                _ => {
                    // Anything that is not a template is an operator name.
                    let mut arguments = ArgumentMap::new();
                    if arg_ids.len() == 2 && primitives::is_commutative(callee) {
                        // Operand order is semantically irrelevant, so it
                        // must not influence the content hash.
                        arg_ids.sort();
                    }
                    for (i, id) in arg_ids.into_iter().enumerate() {
                        arguments.insert(i.to_string(), id);
                    }
                    Ok(plan.add_operation(callee, arguments))
                }
            }
        }

        ExprKind::LetIn { name, value, body } => {
            let value_id = reduce_expression(value, env, plan)?;
            let inner = env.extend(name, Binding::Value(value_id));
            reduce_expression(body, &inner, plan)
        }

        ExprKind::For {
            var,
            iterable,
            body,
        } => {
            let iterable_id = reduce_expression(iterable, env, plan)?;
            // The body is not reduced here: it travels inside the closure
            // and is compiled per element during execution.
            let closure_id = plan.add_closure(var, body, env);
            let mut arguments = ArgumentMap::new();
            arguments.insert("iterable".to_string(), iterable_id);
            arguments.insert("function".to_string(), closure_id);
            Ok(plan.add_operation(primitives::MAP_OPERATOR, arguments))
        }
    }
}

// ============================================================================
// 4. PROGRAM REDUCTION
// ============================================================================

/// Reduces a whole program into a fresh WorkPlan against an empty
/// environment. Callers that want the standard prelude chained in front go
/// through `Session::reduce_source` instead.
pub fn reduce_program(
    program: &crate::dsl::Program,
    registry: Arc<crate::primitives::Registry>,
) -> Result<WorkPlan, EngineError> {
    let plan = WorkPlan::new(registry);
    reduce_commands(&program.commands, Environment::new(), &plan)?;
    Ok(plan)
}

/// Reduces a command sequence, threading the program environment through
/// top-level lets. Returns the final environment so callers can chain a
/// prelude into a user program.
pub fn reduce_commands(
    commands: &[Command],
    mut env: Environment,
    plan: &WorkPlan,
) -> Result<Environment, EngineError> {
    // Re-binding a name inside one command sequence is a user error;
    // shadowing a name from an earlier sequence (the prelude) is fine.
    let mut declared: HashSet<String> = HashSet::new();

    for command in commands {
        match command {
            Command::Let { name, body, pos } => {
                if !declared.insert(name.clone()) {
                    return Err(EngineError::DuplicateDeclaration {
                        name: name.clone(),
                        pos: *pos,
                    });
                }
                let id = reduce_expression(body, &env, plan)?;
                env = env.extend(name, Binding::Value(id));
            }

            Command::Function {
                name,
                parameters,
                body,
                pos,
            } => {
                if !declared.insert(name.clone()) {
                    return Err(EngineError::DuplicateDeclaration {
                        name: name.clone(),
                        pos: *pos,
                    });
                }
                let mut seen = HashSet::new();
                for p in parameters {
                    if !seen.insert(p) {
                        return Err(EngineError::DuplicateDeclaration {
                            name: p.clone(),
                            pos: *pos,
                        });
                    }
                }
                let template = FunctionTemplate {
                    name: name.clone(),
                    parameters: parameters.clone(),
                    body: body.clone(),
                    env: env.clone(),
                };
                env = env.extend(name, Binding::Function(Arc::new(template)));
            }

            Command::Import { namespace, pos: _ } => {
                plan.add_import(namespace)?;
            }

            Command::Print {
                label,
                target,
                pos: _,
            } => {
                let id = reduce_expression(target, &env, plan)?;
                plan.add_goal(Goal {
                    kind: GoalKind::Print,
                    target: id,
                    name: label.clone(),
                });
            }

            Command::Save {
                path,
                target,
                pos: _,
            } => {
                let id = reduce_expression(target, &env, plan)?;
                plan.add_goal(Goal {
                    kind: GoalKind::Save,
                    target: id,
                    name: path.clone(),
                });
            }
        }
    }

    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Position;

    fn num(n: f64) -> Expr {
        Expr::new(ExprKind::Number(n), Position::default())
    }

    #[test]
    fn extend_is_non_destructive() {
        let id_a = ident::constant_id(&Value::Number(1.0)).unwrap();
        let id_b = ident::constant_id(&Value::Number(2.0)).unwrap();

        let base = Environment::new().extend("x", Binding::Value(id_a.clone()));
        let shadowed = base.extend("x", Binding::Value(id_b.clone()));

        match base.lookup("x") {
            Some(Binding::Value(id)) => assert_eq!(id, &id_a),
            _ => panic!("base binding lost"),
        }
        match shadowed.lookup("x") {
            Some(Binding::Value(id)) => assert_eq!(id, &id_b),
            _ => panic!("shadowed binding missing"),
        }
    }

    #[test]
    fn capture_image_skips_operator_names() {
        // body: addition(x, 1) with only x bound -> image contains x only.
        let body = Expr::new(
            ExprKind::Call {
                callee: "addition".into(),
                args: vec![Expr::new(ExprKind::Ident("x".into()), Position::default()), num(1.0)],
            },
            Position::default(),
        );
        let x_id = ident::constant_id(&Value::Number(7.0)).unwrap();
        let env = Environment::new().extend("x", Binding::Value(x_id.clone()));

        let image = capture_image(&body, &[], &env);
        assert_eq!(image.len(), 1);
        assert_eq!(image.get("x"), Some(&format!("v:{}", x_id)));
    }

    #[test]
    fn template_image_is_stable_per_captured_ids() {
        let body = Expr::new(ExprKind::Ident("y".into()), Position::default());
        let y_id = ident::constant_id(&Value::Number(5.0)).unwrap();

        let env1 = Environment::new().extend("y", Binding::Value(y_id.clone()));
        let env2 = Environment::new()
            .extend("unrelated", Binding::Value(y_id.clone()))
            .extend("y", Binding::Value(y_id));

        let t1 = FunctionTemplate {
            name: "f".into(),
            parameters: vec!["x".into()],
            body: body.clone(),
            env: env1,
        };
        let t2 = FunctionTemplate {
            name: "g".into(),
            parameters: vec!["x".into()],
            body,
            env: env2,
        };
        assert_eq!(
            binding_image(&Binding::Function(Arc::new(t1))),
            binding_image(&Binding::Function(Arc::new(t2)))
        );
    }
}
