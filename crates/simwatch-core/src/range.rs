use serde_json::Value;

/// A `[min, max]` pair that only ever widens.
///
/// Seeded with `[+inf, -inf]`, so the first sample defines it. An empty range
/// is never persisted: JSON has no representation for the infinities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl ValueRange {
    pub const EMPTY: Self = Self {
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
    };

    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    #[must_use]
    pub fn widen(self, sample_min: f64, sample_max: f64) -> Self {
        Self {
            min: self.min.min(sample_min),
            max: self.max.max(sample_max),
        }
    }

    #[must_use]
    pub fn widen_with(self, other: ValueRange) -> Self {
        self.widen(other.min, other.max)
    }

    /// Parses a stored `[min, max]`. `null` bounds (written by tools that
    /// could not encode infinities) fall back to the empty seed.
    pub fn from_json(value: &Value) -> Option<Self> {
        let pair = value.as_array()?;
        if pair.len() != 2 {
            return None;
        }
        let min = match &pair[0] {
            Value::Null => f64::INFINITY,
            v => v.as_f64()?,
        };
        let max = match &pair[1] {
            Value::Null => f64::NEG_INFINITY,
            v => v.as_f64()?,
        };
        Some(Self { min, max })
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!([self.min, self.max])
    }
}
