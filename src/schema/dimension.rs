//! Dimension schemas: generic (labels/scale) and time.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A regular affine mapping `start + step * i` describing a dimension's real axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    /// The value at index 0.
    pub start_value: f64,
    /// The value delta between consecutive indices; must be non-zero.
    pub step: f64,
}

/// Either an explicit UTC timestamp or a `$<attribute_name>` reference to a
/// datetime attribute on the same array.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeStart {
    /// An explicit timestamp, always carried in UTC.
    Explicit(DateTime<Utc>),
    /// A reference to an attribute of dtype `datetime`, by name (without the leading `$`).
    Ref(String),
}

/// A dimension's declared kind: either a generic index axis (optionally
/// labeled or scaled) or a time axis.
#[derive(Debug, Clone, PartialEq)]
pub enum DimensionSchema {
    /// A generic index axis.
    Generic {
        /// Non-blank dimension name, unique within its schema.
        name: String,
        /// Positive axis length.
        size: u64,
        /// Optional ordered unique string or float labels, `len == size`.
        labels: Option<Labels>,
        /// Optional affine float scale.
        scale: Option<Scale>,
    },
    /// A time axis.
    Time {
        /// Non-blank dimension name, unique within its schema.
        name: String,
        /// Positive axis length.
        size: u64,
        /// Non-zero signed step between consecutive indices.
        step: TimeDelta,
        /// The axis origin: an explicit timestamp, or a `$ref` to a datetime attribute.
        start_value: TimeStart,
    },
}

/// Labels for a generic dimension: either all-unique strings or all-unique floats.
#[derive(Debug, Clone, PartialEq)]
pub enum Labels {
    /// String labels, indexed by exact match.
    Strings(Vec<String>),
    /// Float labels, indexed by exact match (not to be confused with [`Scale`]'s affine mapping).
    Floats(Vec<f64>),
}

impl DimensionSchema {
    /// The dimension's name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Generic { name, .. } | Self::Time { name, .. } => name,
        }
    }

    /// The dimension's declared size.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Generic { size, .. } | Self::Time { size, .. } => *size,
        }
    }

    /// Construct and validate a generic dimension schema.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSchema`] if `name` is blank, `size` is zero,
    /// both `labels` and `scale` are given, labels have the wrong length or
    /// contain duplicates, or `scale.step` is zero.
    pub fn generic(
        name: impl Into<String>,
        size: u64,
        labels: Option<Labels>,
        scale: Option<Scale>,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        if size == 0 {
            return Err(Error::InvalidSchema(format!(
                "dimension {name}: size must be positive"
            )));
        }
        if labels.is_some() && scale.is_some() {
            return Err(Error::InvalidSchema(format!(
                "dimension {name}: labels and scale are mutually exclusive"
            )));
        }
        if let Some(labels) = &labels {
            validate_labels(&name, labels, size)?;
        }
        if let Some(scale) = &scale {
            if scale.step == 0.0 {
                return Err(Error::InvalidSchema(format!(
                    "dimension {name}: scale step must be non-zero"
                )));
            }
        }
        Ok(Self::Generic {
            name,
            size,
            labels,
            scale,
        })
    }

    /// Construct and validate a time dimension schema.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSchema`] if `name` is blank, `size` is zero,
    /// or `step` is zero.
    pub fn time(
        name: impl Into<String>,
        size: u64,
        step: TimeDelta,
        start_value: TimeStart,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        if size == 0 {
            return Err(Error::InvalidSchema(format!(
                "dimension {name}: size must be positive"
            )));
        }
        if step.is_zero() {
            return Err(Error::InvalidSchema(format!(
                "dimension {name}: time step must be non-zero"
            )));
        }
        Ok(Self::Time {
            name,
            size,
            step,
            start_value,
        })
    }

    /// If this is a time dimension whose start is a `$ref`, the referenced attribute name.
    #[must_use]
    pub fn time_ref(&self) -> Option<&str> {
        match self {
            Self::Time {
                start_value: TimeStart::Ref(name),
                ..
            } => Some(name),
            _ => None,
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidSchema("dimension name must be non-blank".into()));
    }
    Ok(())
}

fn validate_labels(dim_name: &str, labels: &Labels, size: u64) -> Result<()> {
    match labels {
        Labels::Strings(v) => {
            if v.len() as u64 != size {
                return Err(Error::InvalidSchema(format!(
                    "dimension {dim_name}: labels length {} != size {size}",
                    v.len()
                )));
            }
            let mut seen = std::collections::HashSet::new();
            if !v.iter().all(|s| seen.insert(s.as_str())) {
                return Err(Error::InvalidSchema(format!(
                    "dimension {dim_name}: labels must be unique"
                )));
            }
        }
        Labels::Floats(v) => {
            if v.len() as u64 != size {
                return Err(Error::InvalidSchema(format!(
                    "dimension {dim_name}: labels length {} != size {size}",
                    v.len()
                )));
            }
            let mut seen = std::collections::HashSet::new();
            if !v.iter().all(|f| seen.insert(f.to_bits())) {
                return Err(Error::InvalidSchema(format!(
                    "dimension {dim_name}: labels must be unique"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_name() {
        assert!(DimensionSchema::generic("  ", 4, None, None).is_err());
    }

    #[test]
    fn rejects_zero_size() {
        assert!(DimensionSchema::generic("x", 0, None, None).is_err());
    }

    #[test]
    fn rejects_mismatched_label_length() {
        let labels = Labels::Strings(vec!["a".into(), "b".into()]);
        assert!(DimensionSchema::generic("z", 3, Some(labels), None).is_err());
    }

    #[test]
    fn rejects_duplicate_labels() {
        let labels = Labels::Strings(vec!["a".into(), "a".into()]);
        assert!(DimensionSchema::generic("z", 2, Some(labels), None).is_err());
    }

    #[test]
    fn rejects_zero_step_scale() {
        let scale = Scale {
            start_value: 0.0,
            step: 0.0,
        };
        assert!(DimensionSchema::generic("y", 10, None, Some(scale)).is_err());
    }

    #[test]
    fn accepts_valid_scale() {
        let scale = Scale {
            start_value: 90.0,
            step: -0.5,
        };
        let dim = DimensionSchema::generic("y", 361, None, Some(scale)).unwrap();
        assert_eq!(dim.size(), 361);
    }
}
