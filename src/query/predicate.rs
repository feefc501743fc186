//! Typed predicate tree in negation-normal form.
//!
//! `Not` can only wrap a [`Condition`], so a [`Predicate`] is in
//! negation-normal form by construction. `And(vec![])` is TRUE and
//! `Or(vec![])` is FALSE; the normalizer only emits the latter, and only at
//! the root.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::query::ast::Operator;
use crate::query::schema::FieldRef;
use crate::query::value::Value;

/// Leaf comparison with resolved field and coerced operands.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Condition {
    /// Resolved field.
    pub field: Arc<FieldRef>,
    /// Legal operator for the field type.
    pub operator: Operator,
    /// Coerced operands; sorted and deduplicated for set operators.
    pub operands: Vec<Value>,
    /// Case sensitivity; always true where it has no meaning.
    pub case_sensitive: bool,
}

impl Condition {
    /// Canonical textual key used to order siblings.
    pub fn canonical_key(&self) -> String {
        let mut key = format!(
            "c:{}:{}:{}:",
            self.field.sort_key(),
            self.operator.as_str(),
            u8::from(self.case_sensitive)
        );
        for (idx, operand) in self.operands.iter().enumerate() {
            if idx > 0 {
                key.push(',');
            }
            key.push_str(&value_key(operand));
        }
        key
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.operator)?;
        match self.operands.as_slice() {
            [] => Ok(()),
            [single] if !matches!(self.operator.arity(), crate::query::operators::Arity::Many) => {
                write!(f, " {single}")
            }
            many => {
                write!(f, " (")?;
                for (idx, operand) in many.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{operand}")?;
                }
                write!(f, ")")
            }
        }?;
        if !self.case_sensitive {
            write!(f, " [ci]")?;
        }
        Ok(())
    }
}

/// Boolean tree over typed conditions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Predicate {
    /// Leaf comparison.
    Condition(Condition),
    /// Negated leaf comparison.
    Not(Condition),
    /// Conjunction of at least two children, none of which is an `And`.
    And(Vec<Predicate>),
    /// Disjunction of at least two children, none of which is an `Or`.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Constant FALSE.
    pub fn never() -> Self {
        Predicate::Or(Vec::new())
    }

    /// Whether this is the constant FALSE.
    pub fn is_never(&self) -> bool {
        matches!(self, Predicate::Or(children) if children.is_empty())
    }

    /// Top-level conjuncts; a non-`And` predicate is its own single conjunct.
    pub fn conjuncts(&self) -> Vec<&Predicate> {
        match self {
            Predicate::And(children) => children.iter().collect(),
            other => vec![other],
        }
    }

    /// Consumes the predicate into its top-level conjuncts.
    pub fn into_conjuncts(self) -> Vec<Predicate> {
        match self {
            Predicate::And(children) => children,
            other => vec![other],
        }
    }

    /// Rebuilds a predicate from conjuncts; `None` when empty.
    pub fn from_conjuncts(mut parts: Vec<Predicate>) -> Option<Predicate> {
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Predicate::And(parts)),
        }
    }

    /// Every leaf condition, pre-order, with its negation flag.
    pub fn conditions(&self) -> Vec<(&Condition, bool)> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Predicate::Condition(cond) => out.push((cond, false)),
                Predicate::Not(cond) => out.push((cond, true)),
                Predicate::And(children) | Predicate::Or(children) => {
                    stack.extend(children.iter().rev());
                }
            }
        }
        out
    }

    /// Total node count.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            if let Predicate::And(children) | Predicate::Or(children) = node {
                stack.extend(children.iter());
            }
        }
        count
    }

    /// Canonical textual key, computed bottom-up without recursion.
    pub fn canonical_key(&self) -> String {
        enum Step<'p> {
            Enter(&'p Predicate),
            Exit(&'static str, usize),
        }
        let mut keys: Vec<String> = Vec::new();
        let mut steps = vec![Step::Enter(self)];
        while let Some(step) = steps.pop() {
            match step {
                Step::Enter(Predicate::Condition(cond)) => keys.push(cond.canonical_key()),
                Step::Enter(Predicate::Not(cond)) => {
                    keys.push(format!("n:{}", cond.canonical_key()))
                }
                Step::Enter(Predicate::And(children)) => {
                    steps.push(Step::Exit("a", children.len()));
                    steps.extend(children.iter().rev().map(Step::Enter));
                }
                Step::Enter(Predicate::Or(children)) => {
                    steps.push(Step::Exit("o", children.len()));
                    steps.extend(children.iter().rev().map(Step::Enter));
                }
                Step::Exit(tag, arity) => {
                    let parts = keys.split_off(keys.len() - arity);
                    keys.push(compose_key(tag, &parts));
                }
            }
        }
        keys.pop().unwrap_or_default()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Condition(cond) => write!(f, "{cond}"),
            Predicate::Not(cond) => write!(f, "NOT ({cond})"),
            Predicate::And(children) if children.is_empty() => write!(f, "TRUE"),
            Predicate::Or(children) if children.is_empty() => write!(f, "FALSE"),
            Predicate::And(children) | Predicate::Or(children) => {
                let joiner = if matches!(self, Predicate::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                write!(f, "(")?;
                for (idx, child) in children.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(joiner)?;
                    }
                    write!(f, "{child}")?;
                }
                write!(f, ")")
            }
        }
    }
}

pub(crate) fn compose_key(tag: &str, parts: &[String]) -> String {
    let mut key = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum::<usize>() + 3);
    key.push_str(tag);
    key.push('(');
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            key.push(';');
        }
        key.push_str(part);
    }
    key.push(')');
    key
}

fn value_key(value: &Value) -> String {
    match value {
        Value::Null => "z".to_owned(),
        Value::Bool(v) => format!("b{}", u8::from(*v)),
        Value::Int(v) => format!("i{v}"),
        Value::Float(v) => format!("f{:016x}", v.to_bits()),
        Value::String(v) => format!("s{v:?}"),
        Value::Timestamp(v) => format!("t{v}"),
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(value_key).collect();
            compose_key("l", &parts)
        }
    }
}
