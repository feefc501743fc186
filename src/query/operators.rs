//! Operator/type legality matrix and operand typing.
#![forbid(unsafe_code)]

use crate::query::ast::Operator;
use crate::query::schema::FieldType;

/// Number of operands an operator takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    /// No operand (`IS_NULL`, `IS_NOT_NULL`).
    None,
    /// Exactly one operand.
    One,
    /// One or more operands.
    Many,
}

impl Arity {
    /// Description used in arity errors.
    pub fn describe(self) -> &'static str {
        match self {
            Arity::None => "no",
            Arity::One => "exactly one",
            Arity::Many => "one or more",
        }
    }
}

/// Coarse operator classes shared by the legality matrix and selectivity table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorClass {
    /// `EQ`, `NE`.
    Equality,
    /// `LT`, `LTE`, `GT`, `GTE`.
    Range,
    /// `IN`, `NOT_IN`.
    Membership,
    /// `CONTAINS`, `STARTS_WITH`, `ENDS_WITH`, `MATCHES`.
    Text,
    /// `IS_NULL`, `IS_NOT_NULL`.
    Presence,
    /// `ARRAY_CONTAINS`, `ARRAY_CONTAINS_ANY`.
    Array,
}

impl Operator {
    /// Operand count accepted by the operator.
    pub fn arity(self) -> Arity {
        match self {
            Operator::IsNull | Operator::IsNotNull => Arity::None,
            Operator::In | Operator::NotIn | Operator::ArrayContainsAny => Arity::Many,
            _ => Arity::One,
        }
    }

    /// Operator class.
    pub fn class(self) -> OperatorClass {
        match self {
            Operator::Eq | Operator::Ne => OperatorClass::Equality,
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => OperatorClass::Range,
            Operator::In | Operator::NotIn => OperatorClass::Membership,
            Operator::Contains | Operator::StartsWith | Operator::EndsWith | Operator::Matches => {
                OperatorClass::Text
            }
            Operator::IsNull | Operator::IsNotNull => OperatorClass::Presence,
            Operator::ArrayContains | Operator::ArrayContainsAny => OperatorClass::Array,
        }
    }

    /// Whether the operator is defined for fields of `field_type`.
    pub fn is_legal_for(self, field_type: &FieldType) -> bool {
        self.operand_type(field_type).is_some()
            || (self.class() == OperatorClass::Presence)
    }

    /// Type operands must be coerced to, or `None` when the pairing is illegal.
    ///
    /// Presence operators take no operands and always return `None`.
    pub fn operand_type(self, field_type: &FieldType) -> Option<FieldType> {
        match (self.class(), field_type) {
            (OperatorClass::Presence, _) => None,
            (OperatorClass::Equality | OperatorClass::Membership, ty) if ty.is_scalar() => {
                Some(ty.clone())
            }
            (OperatorClass::Range, ty) if ty.is_orderable() => Some(ty.clone()),
            (OperatorClass::Text, FieldType::String) => Some(FieldType::String),
            (OperatorClass::Text, FieldType::List(inner)) if self == Operator::Contains => {
                Some((**inner).clone())
            }
            (OperatorClass::Array, FieldType::List(inner)) => Some((**inner).clone()),
            _ => None,
        }
    }

    /// Whether the `case_sensitive` flag changes the meaning of the condition.
    pub fn honours_case(self, operand_type: &FieldType) -> bool {
        *operand_type == FieldType::String
            && matches!(
                self.class(),
                OperatorClass::Equality | OperatorClass::Membership | OperatorClass::Text
            )
    }
}
