use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fetched datum after extraction and post-processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OracleValue {
    Numeric(Decimal),
    Text(String),
    Boolean(bool),
}

impl OracleValue {
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            OracleValue::Numeric(value) => Some(*value),
            _ => None,
        }
    }

    /// Canonical textual form. Two values compare equal iff their
    /// canonical forms are equal, which is what signatures cover.
    pub fn canonical(&self) -> String {
        match self {
            OracleValue::Numeric(value) => value.normalize().to_string(),
            OracleValue::Text(text) => text.clone(),
            OracleValue::Boolean(flag) => flag.to_string(),
        }
    }
}

impl fmt::Display for OracleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<Decimal> for OracleValue {
    fn from(value: Decimal) -> Self {
        OracleValue::Numeric(value)
    }
}

impl From<i64> for OracleValue {
    fn from(value: i64) -> Self {
        OracleValue::Numeric(Decimal::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_canonical_numeric_ignores_trailing_zeros() {
        let a = OracleValue::Numeric(Decimal::from_str("101.500").unwrap());
        let b = OracleValue::Numeric(Decimal::from_str("101.5").unwrap());
        assert_eq!(a.canonical(), "101.5");
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(OracleValue::Boolean(true)).unwrap();
        assert_eq!(json["kind"], "boolean");
        assert_eq!(json["value"], true);
    }
}
