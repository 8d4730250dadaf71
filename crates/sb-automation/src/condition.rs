//! Condition parsing and evaluation
//!
//! A condition is `key: "operator value"`. The key selects an attribute on
//! the triggering event, on its predecessor (`previous.attr`), or on another
//! device via alias (`alias.attr`). The right-hand side is compared against
//! the resolved value with type coercion driven by the value's dynamic tag.

use std::collections::HashMap;

use dashmap::DashSet;
use tracing::{debug, warn};

use sb_core::{AttrValue, StateObject};

use crate::format;
use crate::rule::Scalar;

/// Comparison operator parsed from a condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

/// Split a condition value into operator and literal text.
///
/// Two-character operators are matched before their one-character prefixes;
/// text without a leading operator means equality.
pub fn split_operator(text: &str) -> (CompareOp, &str) {
    const OPERATORS: [(&str, CompareOp); 6] = [
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];

    let text = text.trim_start();
    for (symbol, op) in OPERATORS {
        if let Some(rest) = text.strip_prefix(symbol) {
            return (op, rest.trim());
        }
    }
    (CompareOp::Eq, text.trim())
}

/// Compare a resolved attribute against right-hand-side text.
///
/// Coercion follows the left value's type; anything that cannot be coerced
/// makes the comparison false rather than an error.
pub fn compare(left: &AttrValue, op: CompareOp, rhs: &str) -> bool {
    match left {
        AttrValue::Bool(b) => {
            let expected = match rhs.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => return false,
            };
            match op {
                CompareOp::Eq => *b == expected,
                CompareOp::Ne => *b != expected,
                _ => false,
            }
        }
        AttrValue::Int(_) | AttrValue::Float(_) => {
            let left = match left.as_f64() {
                Some(v) => v,
                None => return false,
            };
            match rhs.parse::<f64>() {
                Ok(right) => apply(op, left, right),
                Err(_) => false,
            }
        }
        AttrValue::Str(s) => apply(op, s.as_str(), rhs),
    }
}

fn apply<T: PartialOrd>(op: CompareOp, left: T, right: T) -> bool {
    match op {
        CompareOp::Eq => left == right,
        CompareOp::Ne => left != right,
        CompareOp::Gt => left > right,
        CompareOp::Lt => left < right,
        CompareOp::Ge => left >= right,
        CompareOp::Le => left <= right,
    }
}

/// One rule's conditions, parsed once at load time.
///
/// An empty set evaluates to true, which combined with an edge trigger
/// yields a fire-once-per-new-entity rule.
pub struct ConditionSet {
    conditions: Vec<ParsedCondition>,
    warned: DashSet<String>,
}

struct ParsedCondition {
    key: String,
    op: CompareOp,
    value: String,
}

impl ConditionSet {
    pub fn new(conditions: &HashMap<String, Scalar>) -> Self {
        let conditions = conditions
            .iter()
            .map(|(key, scalar)| {
                let (op, value) = split_operator(scalar.as_str());
                ParsedCondition {
                    key: key.clone(),
                    op,
                    value: value.to_string(),
                }
            })
            .collect();
        Self {
            conditions,
            warned: DashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// True only when every condition holds for this state object.
    pub fn evaluate(&self, state: &StateObject) -> bool {
        self.conditions.iter().all(|c| self.evaluate_one(c, state))
    }

    fn evaluate_one(&self, condition: &ParsedCondition, state: &StateObject) -> bool {
        let Some(left) = self.resolve_key(&condition.key, state) else {
            return false;
        };

        // Placeholders in the right-hand side resolve against the same
        // state object; an unresolvable reference makes the condition false.
        let rhs = if condition.value.contains('{') {
            match format::try_format(&condition.value, state) {
                Ok(text) => text,
                Err(e) => {
                    self.warn_once(&condition.value, &format!("{}", e));
                    return false;
                }
            }
        } else {
            condition.value.clone()
        };

        let result = compare(&left, condition.op, &rhs);
        debug!(
            key = %condition.key,
            left = %left,
            op = ?condition.op,
            rhs = %rhs,
            result,
            "Condition evaluated"
        );
        result
    }

    fn resolve_key(&self, key: &str, state: &StateObject) -> Option<AttrValue> {
        if let Some(rest) = key.strip_prefix("previous.") {
            return state.previous_attribute(rest).cloned();
        }

        if let Some((head, rest)) = key.split_once('.') {
            if state.has_alias(head) {
                return state.alias_attribute(head, rest);
            }
            if let Some(value) = state.attribute(key) {
                return Some(value.clone());
            }
            self.warn_once(head, &format!("unknown device alias '{}'", head));
            return None;
        }

        state.attribute(key).cloned()
    }

    fn warn_once(&self, cause: &str, message: &str) {
        if self.warned.insert(cause.to_string()) {
            warn!("{}; condition evaluates to false", message);
        }
    }
}
