// Random-AST properties: id determinism across independent reductions,
// deduplication within a plan, hash consistency of operation nodes, and
// id-preserving lazy expansion.

use proptest::prelude::*;
use std::sync::Arc;
use voxlogica::core::{Position, Value};
use voxlogica::dsl::{Expr, ExprKind};
use voxlogica::ident;
use voxlogica::reducer::{self, Binding, Environment};
use voxlogica::workplan::{Node, WorkPlan};
use voxlogica::Registry;

fn num(n: f64) -> Expr {
    Expr::new(ExprKind::Number(n), Position::default())
}

fn var(name: &str) -> Expr {
    Expr::new(ExprKind::Ident(name.into()), Position::default())
}

fn call(op: &str, args: Vec<Expr>) -> Expr {
    Expr::new(
        ExprKind::Call {
            callee: op.into(),
            args,
        },
        Position::default(),
    )
}

/// Arithmetic expressions over integer literals and one free variable `x`,
/// with bounded depth.
fn arb_expr() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        (-9i64..100).prop_map(|n| num(n as f64)),
        Just(var("x")),
    ];
    leaf.prop_recursive(4, 48, 2, |inner| {
        (
            prop_oneof![
                Just("addition"),
                Just("subtraction"),
                Just("multiplication")
            ],
            inner.clone(),
            inner,
        )
            .prop_map(|(op, a, b)| call(op, vec![a, b]))
    })
}

/// A plan plus an environment binding `x` to a stored constant.
fn fresh_plan() -> (WorkPlan, Environment) {
    let plan = WorkPlan::new(Arc::new(Registry::new()));
    let x = plan.add_constant(Value::Number(7.0)).unwrap();
    let env = Environment::new().extend("x", Binding::Value(x));
    (plan, env)
}

proptest! {
    /// Two independent reductions of the same expression produce the same
    /// root id and the same node id set.
    #[test]
    fn reduction_is_deterministic(expr in arb_expr()) {
        let (plan_a, env_a) = fresh_plan();
        let (plan_b, env_b) = fresh_plan();

        let root_a = reducer::reduce_expression(&expr, &env_a, &plan_a).unwrap();
        let root_b = reducer::reduce_expression(&expr, &env_b, &plan_b).unwrap();

        prop_assert_eq!(&root_a, &root_b);
        let ids_a: Vec<_> = plan_a.nodes_snapshot().into_iter().map(|(id, _)| id).collect();
        let ids_b: Vec<_> = plan_b.nodes_snapshot().into_iter().map(|(id, _)| id).collect();
        prop_assert_eq!(ids_a, ids_b);
    }

    /// Reducing the same expression twice into one plan adds nothing the
    /// second time and returns the same id.
    #[test]
    fn reduction_deduplicates(expr in arb_expr()) {
        let (plan, env) = fresh_plan();
        let first = reducer::reduce_expression(&expr, &env, &plan).unwrap();
        let count = plan.node_count();
        let second = reducer::reduce_expression(&expr, &env, &plan).unwrap();
        prop_assert_eq!(first, second);
        prop_assert_eq!(plan.node_count(), count);
    }

    /// Every operation node's id is the hash of its canonical form.
    #[test]
    fn operation_ids_match_their_canonical_hash(expr in arb_expr()) {
        let (plan, env) = fresh_plan();
        reducer::reduce_expression(&expr, &env, &plan).unwrap();
        for (id, node) in plan.nodes_snapshot() {
            if let Node::Operation { operator, arguments } = node {
                prop_assert_eq!(&ident::operation_id(&operator, &arguments), &id);
            }
        }
    }

    /// Constants hash by value: equal literals collapse to one node however
    /// often they appear.
    #[test]
    fn equal_literals_collapse(n in -9i64..100) {
        let (plan, env) = fresh_plan();
        let expr = call("addition", vec![num(n as f64), num(n as f64)]);
        reducer::reduce_expression(&expr, &env, &plan).unwrap();
        let constants = plan
            .nodes_snapshot()
            .into_iter()
            .filter(|(_, node)| matches!(node, Node::Constant { .. }))
            .count();
        // x's constant plus exactly one node for the literal; when the
        // literal equals x's constant even those two collapse.
        let expected = if n == 7 { 1 } else { 2 };
        prop_assert_eq!(constants, expected);
    }

    /// Lazy expansion preserves ids: applying a for-loop closure to an
    /// element yields exactly the id an eager reduction of the substituted
    /// body yields.
    #[test]
    fn lazy_expansion_preserves_ids(body in arb_expr(), elem in -9i64..100) {
        // Loop body with `x` as the loop variable.
        let loop_expr = Expr::new(
            ExprKind::For {
                var: "x".into(),
                iterable: Box::new(call("range", vec![num(0.0), num(3.0)])),
                body: Box::new(body.clone()),
            },
            Position::default(),
        );

        let plan = WorkPlan::new(Arc::new(Registry::new()));
        let env = Environment::new();
        let map_id = reducer::reduce_expression(&loop_expr, &env, &plan).unwrap();

        // Dig the closure out of the map node.
        let Some(Node::Operation { arguments, .. }) = plan.get(&map_id) else {
            panic!("for-loop should reduce to an operation");
        };
        let Some(Node::Closure { closure }) = plan.get(&arguments["function"]) else {
            panic!("function argument should be a closure");
        };

        // Lazy path: apply the closure to the element id.
        let element = Value::Number(elem as f64);
        let element_id = ident::constant_id(&element).unwrap();
        let lazy_root = plan.apply_closure(&closure, element_id.clone()).unwrap();

        // Eager path: reduce the body with the binding in a fresh plan.
        let eager_plan = WorkPlan::new(Arc::new(Registry::new()));
        eager_plan.add_constant(element).unwrap();
        let eager_env = Environment::new().extend("x", Binding::Value(element_id));
        let eager_root =
            reducer::reduce_expression(&body, &eager_env, &eager_plan).unwrap();

        prop_assert_eq!(lazy_root, eager_root);
    }
}
