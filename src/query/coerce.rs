//! Literal-to-value coercion.
//!
//! Conversions are exact or they fail: nothing is rounded, truncated, or
//! guessed. The only widening applied implicitly is integer to float when the
//! integer is exactly representable.
#![forbid(unsafe_code)]

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::query::ast::Literal;
use crate::query::errors::TypeCoercionError;
use crate::query::schema::FieldType;
use crate::query::value::Value;

/// Largest magnitude an `f64` represents without gaps between integers.
const MAX_EXACT_FLOAT_INT: u64 = 1 << 53;

/// Coerces `literal` into the canonical value for `target`.
///
/// `field` is only used to label errors.
pub fn coerce(
    literal: &Literal,
    target: &FieldType,
    field: &str,
) -> Result<Value, TypeCoercionError> {
    match (literal, target) {
        (Literal::Null, _) => Ok(Value::Null),
        (Literal::String(s), FieldType::String) => Ok(Value::String(s.clone())),
        (Literal::Bool(b), FieldType::Boolean) => Ok(Value::Bool(*b)),
        (Literal::String(s), FieldType::Boolean) => match s.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(incompatible(literal, target, field)),
        },
        (Literal::Int(i), FieldType::Integer) => Ok(Value::Int(*i)),
        (Literal::Float(f), FieldType::Integer) => float_to_int(*f, field).map(Value::Int),
        (Literal::String(s), FieldType::Integer) => s
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| incompatible(literal, target, field)),
        (Literal::Float(f), FieldType::Float) => finite(*f, field).map(Value::Float),
        (Literal::Int(i), FieldType::Float) => int_to_float(*i, field).map(Value::Float),
        (Literal::String(s), FieldType::Float) => match s.parse::<f64>() {
            Ok(f) => finite(f, field).map(Value::Float),
            Err(_) => Err(incompatible(literal, target, field)),
        },
        (Literal::String(s), FieldType::Timestamp) => {
            parse_timestamp(s, field).map(Value::Timestamp)
        }
        (Literal::List(items), FieldType::List(element)) => items
            .iter()
            .map(|item| coerce(item, element, field))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        _ => Err(incompatible(literal, target, field)),
    }
}

/// Parses an RFC 3339 timestamp into UTC nanoseconds.
pub fn parse_timestamp(text: &str, field: &str) -> Result<i64, TypeCoercionError> {
    let parsed = OffsetDateTime::parse(text, &Rfc3339).map_err(|err| {
        TypeCoercionError::InvalidTimestamp {
            field: field.to_owned(),
            value: text.to_owned(),
            reason: err.to_string(),
        }
    })?;
    i64::try_from(parsed.unix_timestamp_nanos()).map_err(|_| TypeCoercionError::InvalidTimestamp {
        field: field.to_owned(),
        value: text.to_owned(),
        reason: "outside the signed 64-bit nanosecond range".to_owned(),
    })
}

fn finite(value: f64, field: &str) -> Result<f64, TypeCoercionError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TypeCoercionError::NonFiniteFloat {
            field: field.to_owned(),
        })
    }
}

fn float_to_int(value: f64, field: &str) -> Result<i64, TypeCoercionError> {
    let value = finite(value, field)?;
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    let in_range = value >= i64::MIN as f64 && value < i64::MAX as f64;
    if value.fract() == 0.0 && in_range {
        Ok(value as i64)
    } else {
        Err(TypeCoercionError::Lossy {
            field: field.to_owned(),
            value: format!("{value:?}"),
            expected: FieldType::Integer.to_string(),
        })
    }
}

fn int_to_float(value: i64, field: &str) -> Result<f64, TypeCoercionError> {
    if value.unsigned_abs() <= MAX_EXACT_FLOAT_INT {
        Ok(value as f64)
    } else {
        Err(TypeCoercionError::Lossy {
            field: field.to_owned(),
            value: value.to_string(),
            expected: FieldType::Float.to_string(),
        })
    }
}

fn incompatible(literal: &Literal, target: &FieldType, field: &str) -> TypeCoercionError {
    TypeCoercionError::Incompatible {
        field: field.to_owned(),
        expected: target.to_string(),
        found: literal.kind(),
    }
}
