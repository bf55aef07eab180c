//! Deterministic post-processing of extracted values
//!
//! Numbers are parsed from their textual JSON form straight into a decimal,
//! never through binary floating point, so identical source data always
//! normalizes to bit-identical values.

use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use std::str::FromStr;

use crate::error::FetchError;
use crate::models::{OracleValue, Transform, ValueKind};

pub fn normalize(raw: &Value, transform: &Transform) -> Result<OracleValue, FetchError> {
    match transform.kind {
        ValueKind::Numeric => {
            let mut value = match raw {
                Value::Number(number) => parse_decimal(&number.to_string())?,
                Value::String(text) => parse_decimal(text.trim())?,
                other => {
                    return Err(FetchError::MalformedResponse(format!(
                        "expected a number, found {}",
                        type_name(other)
                    )))
                }
            };

            if let Some(multiplier) = transform.multiplier {
                value = value.checked_mul(multiplier).ok_or_else(|| {
                    FetchError::MalformedResponse(format!(
                        "scaling {value} by {multiplier} overflows"
                    ))
                })?;
            }

            if let Some(decimals) = transform.decimals {
                value = value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointNearestEven);
            }

            Ok(OracleValue::Numeric(value.normalize()))
        }
        ValueKind::Text => match raw {
            Value::String(text) => Ok(OracleValue::Text(text.clone())),
            Value::Number(number) => Ok(OracleValue::Text(number.to_string())),
            Value::Bool(flag) => Ok(OracleValue::Text(flag.to_string())),
            other => Err(FetchError::MalformedResponse(format!(
                "expected a scalar, found {}",
                type_name(other)
            ))),
        },
        ValueKind::Boolean => match raw {
            Value::Bool(flag) => Ok(OracleValue::Boolean(*flag)),
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(OracleValue::Boolean(true)),
                "false" => Ok(OracleValue::Boolean(false)),
                other => Err(FetchError::MalformedResponse(format!(
                    "cannot read {other:?} as a boolean"
                ))),
            },
            Value::Number(number) => match number.as_u64() {
                Some(0) => Ok(OracleValue::Boolean(false)),
                Some(1) => Ok(OracleValue::Boolean(true)),
                _ => Err(FetchError::MalformedResponse(format!(
                    "cannot read {number} as a boolean"
                ))),
            },
            other => Err(FetchError::MalformedResponse(format!(
                "expected a boolean, found {}",
                type_name(other)
            ))),
        },
    }
}

fn parse_decimal(text: &str) -> Result<Decimal, FetchError> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|e| FetchError::MalformedResponse(format!("cannot read {text:?} as a number: {e}")))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn numeric(multiplier: Option<i64>, decimals: Option<u32>) -> Transform {
        Transform {
            kind: ValueKind::Numeric,
            multiplier: multiplier.map(Decimal::from),
            decimals,
        }
    }

    #[test]
    fn test_scaling_is_exact() {
        // 0.1 * 3 would drift in binary floating point
        let value = normalize(&json!(0.1), &numeric(Some(3), None)).unwrap();
        assert_eq!(value, OracleValue::Numeric(Decimal::from_str("0.3").unwrap()));

        let cents = normalize(&json!("1234.5678"), &numeric(Some(100), Some(0))).unwrap();
        assert_eq!(cents, OracleValue::Numeric(Decimal::from(123457)));
    }

    #[test]
    fn test_rounding_is_half_even() {
        let down = normalize(&json!(2.5), &numeric(None, Some(0))).unwrap();
        let up = normalize(&json!(3.5), &numeric(None, Some(0))).unwrap();
        assert_eq!(down, OracleValue::Numeric(Decimal::from(2)));
        assert_eq!(up, OracleValue::Numeric(Decimal::from(4)));
    }

    #[test]
    fn test_identical_sources_normalize_identically() {
        let transform = numeric(Some(1_000), Some(2));
        let a = normalize(&json!(19.123456), &transform).unwrap();
        let b = normalize(&json!("19.123456"), &transform).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_scientific_notation() {
        let value = normalize(&json!("1.5e3"), &numeric(None, None)).unwrap();
        assert_eq!(value, OracleValue::Numeric(Decimal::from(1500)));
    }

    #[test]
    fn test_type_coercion_failures() {
        assert!(matches!(
            normalize(&json!({ "a": 1 }), &numeric(None, None)),
            Err(FetchError::MalformedResponse(_))
        ));
        assert!(matches!(
            normalize(&json!("abc"), &numeric(None, None)),
            Err(FetchError::MalformedResponse(_))
        ));
        let boolean = Transform {
            kind: ValueKind::Boolean,
            ..Transform::default()
        };
        assert_eq!(normalize(&json!("TRUE"), &boolean).unwrap(), OracleValue::Boolean(true));
        assert_eq!(normalize(&json!(0), &boolean).unwrap(), OracleValue::Boolean(false));
        assert!(normalize(&json!(2), &boolean).is_err());
    }

    #[test]
    fn test_text_values() {
        let text = Transform {
            kind: ValueKind::Text,
            ..Transform::default()
        };
        assert_eq!(
            normalize(&json!("delivered"), &text).unwrap(),
            OracleValue::Text("delivered".to_string())
        );
        assert_eq!(normalize(&json!(7), &text).unwrap(), OracleValue::Text("7".to_string()));
        assert!(normalize(&json!([1]), &text).is_err());
    }
}
