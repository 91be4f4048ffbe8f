//! Parameter distributions and the concrete values sampled from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    /// Continuous uniform range [low, high].
    Float { low: f64, high: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogFloat { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    Int { low: i64, high: i64 },
    /// Categorical choices.
    Categorical { choices: Vec<serde_json::Value> },
}

impl Distribution {
    /// Whether `value` could have been drawn from this distribution.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (Self::Float { low, high } | Self::LogFloat { low, high }, ParamValue::Float(v)) => {
                *low <= *v && *v <= *high
            }
            (Self::Int { low, high }, ParamValue::Int(v)) => *low <= *v && *v <= *high,
            (Self::Categorical { choices }, ParamValue::Json(v)) => choices.contains(v),
            _ => false,
        }
    }

    /// A distribution with exactly one possible value.
    pub fn is_single(&self) -> bool {
        match self {
            Self::Float { low, high } | Self::LogFloat { low, high } => low == high,
            Self::Int { low, high } => low == high,
            Self::Categorical { choices } => choices.len() == 1,
        }
    }

    /// Reject empty or inverted ranges before anything is sampled.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Float { low, high } if !(low <= high) => {
                Err(format!("float range [{low}, {high}] is empty"))
            }
            Self::LogFloat { low, high } if !(*low > 0.0 && low <= high) => {
                Err(format!("log range [{low}, {high}] must be positive and non-empty"))
            }
            Self::Int { low, high } if low > high => {
                Err(format!("int range [{low}, {high}] is empty"))
            }
            Self::Categorical { choices } if choices.is_empty() => {
                Err("categorical distribution has no choices".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float { low, high } => write!(f, "float[{low}, {high}]"),
            Self::LogFloat { low, high } => write!(f, "log-float[{low}, {high}]"),
            Self::Int { low, high } => write!(f, "int[{low}, {high}]"),
            Self::Categorical { choices } => write!(f, "categorical({} choices)", choices.len()),
        }
    }
}

/// A concrete parameter value recorded for a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Json(serde_json::Value),
}

impl ParamValue {
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Json(v) => v.as_i64(),
            Self::Float(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contains_checks_kind_and_bounds() {
        let lr = Distribution::LogFloat { low: 1e-5, high: 1e-1 };
        assert!(lr.contains(&ParamValue::Float(1e-3)));
        assert!(!lr.contains(&ParamValue::Float(0.5)));
        assert!(!lr.contains(&ParamValue::Int(0)));

        let layers = Distribution::Int { low: 1, high: 4 };
        assert!(layers.contains(&ParamValue::Int(4)));
        assert!(!layers.contains(&ParamValue::Int(5)));

        let optimizer = Distribution::Categorical {
            choices: vec![json!("adam"), json!("sgd")],
        };
        assert!(optimizer.contains(&ParamValue::Json(json!("sgd"))));
        assert!(!optimizer.contains(&ParamValue::Json(json!("rmsprop"))));
    }

    #[test]
    fn validate_rejects_empty_ranges() {
        assert!(Distribution::Float { low: 1.0, high: 0.0 }.validate().is_err());
        assert!(Distribution::Float { low: f64::NAN, high: 1.0 }.validate().is_err());
        assert!(Distribution::LogFloat { low: 0.0, high: 1.0 }.validate().is_err());
        assert!(Distribution::Int { low: 3, high: 2 }.validate().is_err());
        assert!(Distribution::Categorical { choices: vec![] }.validate().is_err());
        assert!(Distribution::Int { low: 2, high: 2 }.validate().is_ok());
        assert!(Distribution::Int { low: 2, high: 2 }.is_single());
    }

    #[test]
    fn journal_encoding_keeps_int_and_float_apart() {
        let encoded = serde_json::to_string(&ParamValue::Int(3)).unwrap();
        let decoded: ParamValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, ParamValue::Int(3));

        let dist: Distribution =
            serde_json::from_value(json!({"kind": "float", "low": 0.0, "high": 1.0})).unwrap();
        assert_eq!(dist, Distribution::Float { low: 0.0, high: 1.0 });
    }

    #[test]
    fn value_accessors() {
        assert_eq!(ParamValue::Int(2).as_float(), Some(2.0));
        assert_eq!(ParamValue::Float(2.5).as_int(), None);
        assert_eq!(ParamValue::Json(json!(4)).as_int(), Some(4));
        assert_eq!(ParamValue::Json(json!("adam")).to_string(), "\"adam\"");
    }
}
