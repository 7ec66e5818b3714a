//! Validator - Per-cell Value Rules
//!
//! ## Responsibilities
//!
//! - Type check (one `ValueKind` per cell)
//! - Optional numeric range (inclusive)
//! - Optional enumeration of legal values
//! - Optional string length limit
//!
//! Pure functions only; the store looks up the rule for a key and calls
//! `validate` before any write is applied.

use crate::value::{Value, ValueKind};
use serde::{Deserialize, Serialize};

/// Value rule for a single cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub kind: ValueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<usize>,
}

impl Validator {
    /// Rule accepting any value of the given kind
    pub fn of(kind: ValueKind) -> Self {
        Self {
            kind,
            min: None,
            max: None,
            allowed: None,
            max_len: None,
        }
    }

    pub fn bool() -> Self {
        Self::of(ValueKind::Bool)
    }

    pub fn int() -> Self {
        Self::of(ValueKind::Int)
    }

    pub fn float() -> Self {
        Self::of(ValueKind::Float)
    }

    pub fn string() -> Self {
        Self::of(ValueKind::Str)
    }

    pub fn map() -> Self {
        Self::of(ValueKind::Map)
    }

    /// Integer within `[min, max]`
    pub fn int_range(min: i64, max: i64) -> Self {
        Self::int().with_range(min as f64, max as f64)
    }

    /// Float within `[min, max]`
    pub fn float_range(min: f64, max: f64) -> Self {
        Self::float().with_range(min, max)
    }

    /// String restricted to an enumerated set
    pub fn one_of(options: &[&str]) -> Self {
        Self {
            allowed: Some(options.iter().map(|o| Value::from(*o)).collect()),
            ..Self::string()
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Check a value against this rule.
    ///
    /// Returns a human-readable reason on failure.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if value.kind() != self.kind {
            return Err(format!("expected {}, got {}", self.kind, value.kind()));
        }

        if let Value::Float(f) = value {
            if !f.is_finite() {
                return Err("float must be finite".to_string());
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!("{} is below minimum {}", value, min));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!("{} is above maximum {}", value, max));
                }
            }
        }

        if let (Value::Str(s), Some(max_len)) = (value, self.max_len) {
            if s.chars().count() > max_len {
                return Err(format!("string longer than {} characters", max_len));
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed.iter().map(|a| a.to_string()).collect();
                return Err(format!("{} is not one of [{}]", value, options.join(", ")));
            }
        }

        Ok(())
    }
}
