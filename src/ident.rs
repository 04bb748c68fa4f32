// src/ident.rs
//
// =============================================================================
// VOXLOGICA: CONTENT IDENTIFIERS (v 2.0)
// =============================================================================
//
// Canonical hashing of graph nodes.
//
// Responsibilities:
// 1. Serialize operations, constants and closure shapes into a canonical
//    byte sequence (sorted keys, normalized numbers, length-prefixed text).
// 2. Hash the sequence with SHA-256 into a stable NodeId.
//
// The canonical form is the single source of truth for equality across
// memoization, storage and worker hand-off. Two runs of the same program
// must produce byte-identical canonical forms.

use crate::core::{ArgumentMap, NodeId, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// Field and record separators. Control chars cannot appear unescaped in
// operator names or argument keys, and string payloads are length-prefixed,
// so the framing is unambiguous.
const FIELD: char = '\u{1f}';
const PAIR: char = '\u{1e}';

/// Hashes an arbitrary canonical byte sequence into a NodeId.
pub fn digest(bytes: &[u8]) -> NodeId {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    NodeId::from_hex(hex::encode(hasher.finalize()))
}

// ============================================================================
// 1. NUMBER NORMALIZATION
// ============================================================================

/// Fixed decimal rendering of a number:
/// - integral finite values print without a fractional part;
/// - other finite values print in shortest round-trip form;
/// - NaN collapses to a single reserved token, -0 collapses to 0.
pub fn canonical_number(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    let x = if x == 0.0 { 0.0 } else { x }; // -0 == 0, so this rewrites -0
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 9_007_199_254_740_992.0 {
        return format!("{}", x as i64);
    }
    format!("{}", x)
}

// ============================================================================
// 2. VALUE CANONICALIZATION
// ============================================================================

/// Writes the canonical form of a serializable value. Bags and closures have
/// no canonical value form: bags are session handles, closures are hashed by
/// shape through [`closure_id`].
fn write_value(out: &mut String, value: &Value) -> Result<(), String> {
    match value {
        Value::Number(n) => {
            out.push_str("num");
            out.push(FIELD);
            out.push_str(&canonical_number(*n));
        }
        Value::Bool(b) => {
            out.push_str("bool");
            out.push(FIELD);
            out.push_str(if *b { "true" } else { "false" });
        }
        Value::String(s) => {
            out.push_str("str");
            out.push(FIELD);
            out.push_str(&s.len().to_string());
            out.push(PAIR);
            out.push_str(s);
        }
        Value::Blob(bytes) => {
            // Large payloads hash by content instead of inlining.
            out.push_str("blob");
            out.push(FIELD);
            out.push_str(digest(bytes).as_str());
        }
        Value::List(items) => {
            out.push_str("list");
            out.push(FIELD);
            out.push_str(&items.len().to_string());
            for item in items {
                out.push(PAIR);
                write_value(out, item)?;
            }
        }
        Value::Bag(_) | Value::Closure(_) => {
            return Err(format!("{} values have no canonical form", value.kind_name()));
        }
    }
    Ok(())
}

// ============================================================================
// 3. NODE IDS
// ============================================================================

/// Id of an operation node: H(operator, sorted argument pairs).
pub fn operation_id(operator: &str, arguments: &ArgumentMap) -> NodeId {
    let mut buf = String::with_capacity(64 + arguments.len() * 72);
    buf.push_str("op");
    buf.push(FIELD);
    buf.push_str(operator);
    // ArgumentMap is a BTreeMap: iteration is already in sorted key order.
    for (key, child) in arguments {
        buf.push(FIELD);
        buf.push_str(key);
        buf.push(PAIR);
        buf.push_str(child.as_str());
    }
    digest(buf.as_bytes())
}

/// Id of a constant node. Fails for values with no canonical form.
pub fn constant_id(value: &Value) -> Result<NodeId, String> {
    if let Value::Closure(id) = value {
        // A closure used as a value is already content-addressed.
        return Ok(id.clone());
    }
    let mut buf = String::from("const");
    buf.push(FIELD);
    write_value(&mut buf, value)?;
    Ok(digest(buf.as_bytes()))
}

/// Id of a closure node: H(parameter, structural body shape, captured
/// environment image). The image maps each captured name to the rendered id
/// of its binding; keys arrive sorted via BTreeMap.
///
/// Source text never participates: two closures with the same body shape
/// that capture the same ids are the same closure.
pub fn closure_id(parameter: &str, body_shape: &str, captures: &BTreeMap<String, String>) -> NodeId {
    let mut buf = String::with_capacity(64 + body_shape.len());
    buf.push_str("closure");
    buf.push(FIELD);
    buf.push_str(parameter);
    buf.push(FIELD);
    buf.push_str(&body_shape.len().to_string());
    buf.push(PAIR);
    buf.push_str(body_shape);
    for (name, image) in captures {
        buf.push(FIELD);
        buf.push_str(name);
        buf.push(PAIR);
        buf.push_str(image);
    }
    digest(buf.as_bytes())
}

/// Structural hash of a function template: parameters + body shape + the
/// image of its own captures. Used when a template appears in a closure's
/// captured environment.
pub fn template_hash(
    parameters: &[String],
    body_shape: &str,
    captures: &BTreeMap<String, String>,
) -> String {
    let mut buf = String::from("fun");
    buf.push(FIELD);
    buf.push_str(&parameters.len().to_string());
    for p in parameters {
        buf.push(PAIR);
        buf.push_str(p);
    }
    buf.push(FIELD);
    buf.push_str(body_shape);
    for (name, image) in captures {
        buf.push(FIELD);
        buf.push_str(name);
        buf.push(PAIR);
        buf.push_str(image);
    }
    digest(buf.as_bytes()).as_str().to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_key_order_is_irrelevant() {
        let a = NodeId::from_hex("a".repeat(64));
        let b = NodeId::from_hex("b".repeat(64));

        let mut one = ArgumentMap::new();
        one.insert("1".into(), b.clone());
        one.insert("0".into(), a.clone());

        let mut two = ArgumentMap::new();
        two.insert("0".into(), a);
        two.insert("1".into(), b);

        assert_eq!(operation_id("addition", &one), operation_id("addition", &two));
    }

    #[test]
    fn number_normalization() {
        assert_eq!(canonical_number(3.0), "3");
        assert_eq!(canonical_number(-0.0), "0");
        assert_eq!(canonical_number(2.5), "2.5");
        assert_eq!(canonical_number(f64::NAN), "nan");
        assert_eq!(canonical_number(f64::NAN * -1.0), "nan");
    }

    #[test]
    fn booleans_are_not_numbers() {
        let t = constant_id(&Value::Bool(true)).unwrap();
        let one = constant_id(&Value::Number(1.0)).unwrap();
        assert_ne!(t, one);
    }

    #[test]
    fn integral_float_and_integer_share_an_id() {
        let a = constant_id(&Value::Number(3.0)).unwrap();
        let b = constant_id(&Value::Number(2.0 + 1.0)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_operators_hash_apart() {
        let args = ArgumentMap::new();
        assert_ne!(operation_id("addition", &args), operation_id("subtraction", &args));
    }

    #[test]
    fn closure_hash_ignores_source_text_but_not_captures() {
        let mut caps = BTreeMap::new();
        caps.insert("y".to_string(), "v:".to_string() + &"c".repeat(64));
        let one = closure_id("x", "call addition(var x,var y)", &caps);
        let two = closure_id("x", "call addition(var x,var y)", &caps);
        assert_eq!(one, two);

        caps.insert("y".to_string(), "v:".to_string() + &"d".repeat(64));
        let three = closure_id("x", "call addition(var x,var y)", &caps);
        assert_ne!(one, three);
    }
}
