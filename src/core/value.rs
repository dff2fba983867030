use crate::core::{Result, ShardError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Typed field value of a document or query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Array(Vec<Value>),
}

impl Value {
    /// Compares two values of compatible kinds.
    ///
    /// Numbers compare across `Integer`/`Float`; any other kind mismatch is an error.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Ok(Ordering::Equal),
            (Value::Integer(a), Value::Integer(b)) => Ok(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Ok(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                // as_f64 is always Some for numeric values
                let a = a.as_f64().unwrap_or_default();
                let b = b.as_f64().unwrap_or_default();
                Ok(float_cmp(a, b))
            }
            (Value::Array(a), Value::Array(b)) => {
                for (left, right) in a.iter().zip(b.iter()) {
                    let ord = left.compare(right)?;
                    if ord != Ordering::Equal {
                        return Ok(ord);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => Err(ShardError::TypeMismatch(format!(
                "Cannot compare incompatible types: {} and {}",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    /// Total order used for sorting mixed-kind result sets:
    /// NULL < numbers < text < booleans < arrays.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        let rank = self.kind_rank().cmp(&other.kind_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => {
                for (left, right) in a.iter().zip(b.iter()) {
                    let ord = left.sort_cmp(right);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Integer(_) | Self::Float(_) => 1,
            Self::Text(_) => 2,
            Self::Boolean(_) => 3,
            Self::Array(_) => 4,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Integer(_) => "INTEGER",
            Self::Float(_) => "FLOAT",
            Self::Text(_) => "TEXT",
            Self::Boolean(_) => "BOOLEAN",
            Self::Array(_) => "ARRAY",
        }
    }

    /// String form fed to the shard-key hash.
    ///
    /// Text is used verbatim, numbers use their decimal rendering (`2.0` renders as `2`),
    /// booleans render as `true`/`false`, NULL as `null`, arrays as a bracketed list.
    pub fn key_string(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::Boolean(b) => b.to_string(),
            Self::Array(items) => format!(
                "[{}]",
                items
                    .iter()
                    .map(Value::key_string)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }

    /// Kind-qualified key, so `1` and `"1"` never collide in caches or group tables.
    pub fn canonical_key(&self) -> String {
        match self {
            Self::Integer(_) | Self::Float(_) => format!("n:{}", self.key_string()),
            other => format!("{}:{}", other.type_name(), other.key_string()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) => {
                if f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Float(_))
    }

    /// Numeric addition preserving integers where possible.
    pub fn add(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(
                a.checked_add(*b)
                    .map(Value::Integer)
                    .unwrap_or(Value::Float(*a as f64 + *b as f64)),
            ),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                Some(Value::Float(a.as_f64()? + b.as_f64()?))
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Text(s) => serde_json::Value::from(s.clone()),
            Self::Boolean(b) => serde_json::Value::from(*b),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }
}

fn float_cmp(a: f64, b: f64) -> Ordering {
    // NaN sorts after every other number
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => {
                if a.is_nan() && b.is_nan() {
                    return true;
                }
                (a - b).abs() < f64::EPSILON
            }
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(i), Self::Float(f)) | (Self::Float(f), Self::Integer(i)) => {
                (*i as f64 - f).abs() < f64::EPSILON
            }
            (Self::Array(a), Self::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "'{}'", s),
            other => write!(f, "{}", other.key_string()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        i64::try_from(v)
            .map(Value::Integer)
            .unwrap_or(Value::Float(v as f64))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = ShardError;

    fn try_from(json: serde_json::Value) -> Result<Self> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Boolean(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else {
                    n.as_f64().map(Value::Float).ok_or_else(|| {
                        ShardError::TypeMismatch(format!("unsupported JSON number {}", n))
                    })
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Value::try_from)
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            serde_json::Value::Object(_) => Err(ShardError::TypeMismatch(
                "nested objects are not supported as field values".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_across_integer_and_float() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Float(2.5)).unwrap(),
            Ordering::Less
        );
        assert_eq!(Value::Float(3.0), Value::Integer(3));
        assert!(Value::Text("a".into()).compare(&Value::Integer(1)).is_err());
    }

    #[test]
    fn sort_order_ranks_kinds() {
        let mut values = vec![
            Value::Boolean(false),
            Value::Text("b".into()),
            Value::Integer(7),
            Value::Null,
            Value::Float(1.5),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Float(1.5),
                Value::Integer(7),
                Value::Text("b".into()),
                Value::Boolean(false),
            ]
        );
    }

    #[test]
    fn key_strings_are_stable() {
        assert_eq!(Value::Integer(150).key_string(), "150");
        assert_eq!(Value::Float(2.0).key_string(), "2");
        assert_eq!(Value::Float(2.5).key_string(), "2.5");
        assert_eq!(Value::from("user-1").key_string(), "user-1");
        assert_ne!(
            Value::Integer(1).canonical_key(),
            Value::from("1").canonical_key()
        );
        assert_eq!(
            Value::Integer(2).canonical_key(),
            Value::Float(2.0).canonical_key()
        );
    }

    #[test]
    fn integer_addition_overflows_into_float() {
        assert_eq!(
            Value::Integer(2).add(&Value::Integer(3)),
            Some(Value::Integer(5))
        );
        assert!(matches!(
            Value::Integer(i64::MAX).add(&Value::Integer(1)),
            Some(Value::Float(_))
        ));
        assert_eq!(Value::from("x").add(&Value::Integer(1)), None);
    }

    #[test]
    fn json_conversion_rejects_nested_objects() {
        let value = Value::try_from(serde_json::json!([1, 2.5, "x", null])).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Integer(1),
                Value::Float(2.5),
                Value::from("x"),
                Value::Null
            ])
        );
        assert!(Value::try_from(serde_json::json!({"a": 1})).is_err());
    }
}
