// estimate.rs

use serde::{Serialize, Serializer};
use std::fmt;

/// A statistic value, or the marker for a result that is mathematically
/// undefined on the given data (monomorphic locus, self-comparison, zero
/// variance).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Estimate {
    Value(f64),
    #[default]
    NotApplicable,
}

impl Estimate {
    /// `num / den`, not applicable when the denominator vanishes or either
    /// side is not finite.
    pub fn ratio(num: f64, den: f64) -> Self {
        if den == 0.0 || !num.is_finite() || !den.is_finite() {
            Estimate::NotApplicable
        } else {
            Estimate::from(num / den)
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Estimate::Value(v) => Some(*v),
            Estimate::NotApplicable => None,
        }
    }

    pub fn map<F: FnOnce(f64) -> Option<f64>>(self, f: F) -> Self {
        self.value().and_then(f).map_or(Estimate::NotApplicable, Estimate::from)
    }

    /// `1 / (1 - x)`.
    pub fn linearized(self) -> Self {
        self.map(linearize)
    }
}

impl From<f64> for Estimate {
    fn from(v: f64) -> Self {
        if v.is_finite() {
            Estimate::Value(v)
        } else {
            Estimate::NotApplicable
        }
    }
}

impl From<Option<f64>> for Estimate {
    fn from(v: Option<f64>) -> Self {
        v.map_or(Estimate::NotApplicable, Estimate::from)
    }
}

impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Estimate::Value(v) => match f.precision() {
                Some(p) => write!(f, "{:.*}", p, v),
                None => write!(f, "{}", v),
            },
            Estimate::NotApplicable => f.write_str("NA"),
        }
    }
}

impl Serialize for Estimate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Estimate::Value(v) => serializer.serialize_some(v),
            Estimate::NotApplicable => serializer.serialize_none(),
        }
    }
}

/// Linearized differentiation, `1 / (1 - x)`; undefined at `x = 1`.
pub fn linearize(x: f64) -> Option<f64> {
    let den = 1.0 - x;
    if den == 0.0 || !x.is_finite() {
        None
    } else {
        Some(1.0 / den)
    }
}

/// Inverse of [`linearize`], `1 - 1 / y`; undefined at `y = 0`.
pub fn inverse_linearize(y: f64) -> Option<f64> {
    if y == 0.0 || !y.is_finite() {
        None
    } else {
        Some(1.0 - 1.0 / y)
    }
}
