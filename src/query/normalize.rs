//! Predicate normalization.
//!
//! Lowers a client [`Filter`] into a typed [`Predicate`] in negation-normal
//! form. Negations are pushed to the leaves with De Morgan's laws, nested
//! junctions of the same kind are flattened, and siblings are sorted by their
//! canonical key and deduplicated, so logically identical filters written in a
//! different operand order normalize to the same tree.
//!
//! Both the traversal and the rebuild use explicit work stacks; filter depth is
//! bounded by [`Limits`], not by the thread stack.
#![forbid(unsafe_code)]

use regex::RegexBuilder;
use tracing::debug;

use crate::config::Limits;
use crate::error::{QueryError, Stage};
use crate::query::ast::{self, Filter, Literal, Operator};
use crate::query::coerce::coerce;
use crate::query::errors::{
    OperatorIncompatibleError, TypeCoercionError, ValidationCode, ValidationError,
};
use crate::query::operators::Arity;
use crate::query::pipeline::StageGate;
use crate::query::predicate::{compose_key, Condition, Predicate};
use crate::query::resolve::FieldScope;
use crate::query::value::Value;

/// Partially rebuilt subtree.
enum Built {
    True,
    False,
    Expr(Predicate, String),
}

enum Task<'f> {
    Visit {
        node: &'f Filter,
        negated: bool,
        depth: usize,
    },
    Combine {
        conjunction: bool,
        arity: usize,
    },
}

/// Normalizes `filter`, resolving fields through `scope`.
///
/// Returns `None` when the filter is a tautology. A contradiction is returned
/// as [`Predicate::never`]. `context` names the clause in errors (`"filter"`,
/// `"having"`). `gate` is entered before the tree is walked and again before
/// each condition's literals are coerced.
pub fn normalize(
    filter: &Filter,
    scope: &mut dyn FieldScope,
    limits: &Limits,
    gate: &dyn StageGate,
    context: &'static str,
) -> Result<Option<Predicate>, QueryError> {
    gate.enter(Stage::Normalize)?;
    let mut tasks = vec![Task::Visit {
        node: filter,
        negated: false,
        depth: 1,
    }];
    let mut built: Vec<Built> = Vec::new();
    let mut nodes = 0usize;

    while let Some(task) = tasks.pop() {
        match task {
            Task::Visit {
                node,
                negated,
                depth,
            } => {
                nodes += 1;
                if nodes > limits.max_predicate_nodes {
                    return Err(limit_error(
                        ValidationCode::PredicateTooLarge,
                        context,
                        format!("predicate tree exceeds {} nodes", limits.max_predicate_nodes),
                    ));
                }
                if depth > limits.max_predicate_depth {
                    return Err(limit_error(
                        ValidationCode::PredicateTooDeep,
                        context,
                        format!("predicate tree exceeds depth {}", limits.max_predicate_depth),
                    ));
                }
                match node {
                    Filter::Condition(cond) => {
                        let cond = lower_condition(cond, scope, limits, gate, context)?;
                        let key = cond.canonical_key();
                        built.push(if negated {
                            Built::Expr(Predicate::Not(cond), format!("n:{key}"))
                        } else {
                            Built::Expr(Predicate::Condition(cond), key)
                        });
                    }
                    Filter::Not(child) => tasks.push(Task::Visit {
                        node: child,
                        negated: !negated,
                        depth: depth + 1,
                    }),
                    Filter::And(children) | Filter::Or(children) => {
                        let is_and = matches!(node, Filter::And(_));
                        tasks.push(Task::Combine {
                            conjunction: is_and != negated,
                            arity: children.len(),
                        });
                        for child in children.iter().rev() {
                            tasks.push(Task::Visit {
                                node: child,
                                negated,
                                depth: depth + 1,
                            });
                        }
                    }
                }
            }
            Task::Combine { conjunction, arity } => {
                let children = built.split_off(built.len() - arity);
                built.push(combine(conjunction, children));
            }
        }
    }

    let result = match built.pop() {
        Some(Built::Expr(pred, _)) => Some(pred),
        Some(Built::False) => Some(Predicate::never()),
        Some(Built::True) | None => None,
    };
    debug!(
        context,
        nodes,
        conditions = result.as_ref().map(|p| p.conditions().len()).unwrap_or(0),
        "query.normalize.done"
    );
    Ok(result)
}

fn combine(conjunction: bool, children: Vec<Built>) -> Built {
    let mut parts: Vec<(Predicate, String)> = Vec::with_capacity(children.len());
    for child in children {
        match child {
            Built::True if conjunction => {}
            Built::False if !conjunction => {}
            Built::True => return Built::True,
            Built::False => return Built::False,
            Built::Expr(Predicate::And(grand), _) if conjunction => {
                parts.extend(grand.into_iter().map(keyed));
            }
            Built::Expr(Predicate::Or(grand), _) if !conjunction => {
                parts.extend(grand.into_iter().map(keyed));
            }
            Built::Expr(pred, key) => parts.push((pred, key)),
        }
    }
    parts.sort_by(|a, b| a.1.cmp(&b.1));
    parts.dedup_by(|a, b| a.1 == b.1);
    match parts.len() {
        0 if conjunction => Built::True,
        0 => Built::False,
        1 => match parts.pop() {
            Some((pred, key)) => Built::Expr(pred, key),
            None => Built::True,
        },
        _ => {
            let (preds, keys): (Vec<Predicate>, Vec<String>) = parts.into_iter().unzip();
            if conjunction {
                Built::Expr(Predicate::And(preds), compose_key("a", &keys))
            } else {
                Built::Expr(Predicate::Or(preds), compose_key("o", &keys))
            }
        }
    }
}

fn keyed(pred: Predicate) -> (Predicate, String) {
    let key = pred.canonical_key();
    (pred, key)
}

fn limit_error(code: ValidationCode, context: &str, message: String) -> QueryError {
    QueryError::from(ValidationError::new(code, context, message))
}

/// Resolves, legality-checks, and coerces one client condition.
pub(crate) fn lower_condition(
    cond: &ast::Condition,
    scope: &mut dyn FieldScope,
    limits: &Limits,
    gate: &dyn StageGate,
    context: &'static str,
) -> Result<Condition, QueryError> {
    let field = scope.resolve_field(&cond.field, context)?;
    let mut operator = cond.operator;
    let mut raw: Vec<&Literal> = cond.value.iter().chain(cond.values.iter()).collect();
    if operator.arity() == Arity::Many && raw.len() == 1 {
        if let Literal::List(items) = raw[0] {
            raw = items.iter().collect();
        }
    }
    if matches!(raw.as_slice(), [Literal::Null]) {
        match operator {
            Operator::Eq => {
                operator = Operator::IsNull;
                raw.clear();
            }
            Operator::Ne => {
                operator = Operator::IsNotNull;
                raw.clear();
            }
            _ => {}
        }
    }

    if !operator.is_legal_for(&field.field_type) {
        return Err(OperatorIncompatibleError::IllegalForType {
            field: cond.field.clone(),
            operator,
            field_type: field.field_type.to_string(),
        }
        .into());
    }
    let arity = operator.arity();
    let arity_ok = match arity {
        Arity::None => raw.is_empty(),
        Arity::One => raw.len() == 1,
        Arity::Many => !raw.is_empty(),
    };
    if !arity_ok {
        return Err(OperatorIncompatibleError::Arity {
            field: cond.field.clone(),
            operator,
            expected: arity.describe(),
            found: raw.len(),
        }
        .into());
    }
    if arity == Arity::Many && raw.len() > limits.max_in_values {
        return Err(limit_error(
            ValidationCode::InListTooLarge,
            &format!("{context}.{}", cond.field),
            format!("{operator} exceeds {} operands", limits.max_in_values),
        ));
    }

    let mut operands = Vec::with_capacity(raw.len());
    let mut case_sensitive = true;
    if let Some(target) = operator.operand_type(&field.field_type) {
        gate.enter(Stage::Coerce)?;
        for literal in raw {
            let value = coerce(literal, &target, &cond.field)?;
            if value.is_null() {
                if arity == Arity::Many {
                    continue;
                }
                return Err(TypeCoercionError::NullNotAllowed {
                    field: cond.field.clone(),
                    operator,
                }
                .into());
            }
            operands.push(value);
        }
        if operands.is_empty() {
            return Err(OperatorIncompatibleError::EmptyOperandSet {
                field: cond.field.clone(),
                operator,
            }
            .into());
        }
        if operator.honours_case(&target) {
            case_sensitive = cond.case_sensitive;
        }
    }
    if arity == Arity::Many {
        operands.sort();
        operands.dedup();
    }
    if operator == Operator::Matches {
        if let Some(Value::String(pattern)) = operands.first() {
            RegexBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|err| TypeCoercionError::InvalidPattern {
                    field: cond.field.clone(),
                    pattern: pattern.clone(),
                    reason: err.to_string(),
                })?;
        }
    }

    Ok(Condition {
        field,
        operator,
        operands,
        case_sensitive,
    })
}
