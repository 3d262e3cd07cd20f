//! Addressing & Slicer (C2).
//!
//! Converts heterogeneous, human-friendly indexers into canonical integer
//! bounds. Per the design notes, every element kind implements [`IndexLike`]
//! and conversion to the canonical [`AxisIndex`] happens in exactly one
//! place: [`resolve_axis`].

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{Error, Result};
use crate::schema::DimensionSchema;

/// A single-axis indexer supplied by a caller, before resolution against a dimension.
#[derive(Debug, Clone)]
pub enum IndexLike {
    /// An explicit ordinal on any dimension.
    Int(i64),
    /// A string label, valid only on a labeled generic dimension.
    Label(String),
    /// A float coordinate, valid only on a scaled generic dimension.
    Scaled(f64),
    /// An absolute UTC timestamp, valid only on a time dimension.
    TimePoint(DateTime<Utc>),
    /// A duration, valid only on a time dimension (used as a slice bound or step).
    TimeSpan(TimeDelta),
    /// `start..stop` with optional `step`, each bound itself an [`IndexLike`] or omitted.
    Range {
        /// Inclusive lower bound, or `None` for the axis start.
        start: Option<Box<IndexLike>>,
        /// Exclusive upper bound, or `None` for the axis end.
        stop: Option<Box<IndexLike>>,
        /// Integer step; only `1` is supported for VArray slicing (see the VArray engine).
        step: i64,
    },
    /// Fills every remaining, unspecified axis (`...`).
    Ellipsis,
    /// An explicit full-axis `:` selection.
    Full,
}

/// A canonical, per-axis resolved index: either a point (drops the axis from
/// the result shape) or a half-open integer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisIndex {
    /// A single resolved ordinal; the corresponding axis is dropped from the result shape.
    Point(i64),
    /// A half-open `[start, stop)` range, contributing `stop - start` to the result shape.
    Range {
        /// Inclusive lower bound.
        start: i64,
        /// Exclusive upper bound.
        stop: i64,
    },
}

impl AxisIndex {
    /// The length this axis contributes to the result shape (`0` for a point).
    #[must_use]
    pub fn len(self) -> u64 {
        match self {
            Self::Point(_) => 0,
            Self::Range { start, stop } => stop.saturating_sub(start).max(0) as u64,
        }
    }
}

/// Expand a tuple of per-axis indexers (possibly containing at most one
/// [`IndexLike::Ellipsis`] and fewer elements than dimensions) against a
/// dimension list, resolving each element to an [`AxisIndex`].
///
/// # Errors
/// Returns [`Error::Index`] if more than one ellipsis is present, too many
/// indexers are given, or any element fails to resolve against its
/// dimension (see [`resolve_axis`]).
pub fn resolve(indexers: &[IndexLike], dimensions: &[DimensionSchema]) -> Result<Vec<AxisIndex>> {
    let ellipsis_count = indexers
        .iter()
        .filter(|i| matches!(i, IndexLike::Ellipsis))
        .count();
    if ellipsis_count > 1 {
        return Err(Error::Index("at most one ellipsis may appear".into()));
    }

    let explicit_count = indexers.len() - ellipsis_count;
    if explicit_count > dimensions.len() {
        return Err(Error::Index(format!(
            "too many indexers: {explicit_count} for {} dimensions",
            dimensions.len()
        )));
    }

    const FULL: IndexLike = IndexLike::Full;

    let mut expanded: Vec<&IndexLike> = Vec::with_capacity(dimensions.len());
    for indexer in indexers {
        if matches!(indexer, IndexLike::Ellipsis) {
            let missing = dimensions.len() - explicit_count;
            for _ in 0..missing {
                expanded.push(&FULL);
            }
        } else {
            expanded.push(indexer);
        }
    }
    while expanded.len() < dimensions.len() {
        expanded.push(&FULL);
    }

    expanded
        .into_iter()
        .zip(dimensions)
        .map(|(indexer, dim)| resolve_axis(indexer, dim))
        .collect()
}

/// Resolve a single indexer against a single dimension.
///
/// # Errors
/// Returns [`Error::Index`] if the indexer's kind does not match the
/// dimension's kind, an out-of-range ordinal or label is used, a scaled
/// float does not fall exactly on the dimension's scale, or a resolved
/// range is empty.
pub fn resolve_axis(indexer: &IndexLike, dim: &DimensionSchema) -> Result<AxisIndex> {
    let size = dim.size() as i64;
    match indexer {
        IndexLike::Full => Ok(AxisIndex::Range { start: 0, stop: size }),
        IndexLike::Int(i) => Ok(AxisIndex::Point(normalize_ordinal(*i, size)?)),
        IndexLike::Label(label) => {
            let DimensionSchema::Generic {
                labels: Some(crate::schema::dimension::Labels::Strings(labels)),
                ..
            } = dim
            else {
                return Err(Error::Index(format!(
                    "dimension {} is not string-labeled",
                    dim.name()
                )));
            };
            let idx = labels
                .iter()
                .position(|l| l == label)
                .ok_or_else(|| Error::Index(format!("unknown label {label:?}")))?;
            Ok(AxisIndex::Point(idx as i64))
        }
        IndexLike::Scaled(value) => {
            let DimensionSchema::Generic {
                scale: Some(scale), ..
            } = dim
            else {
                return Err(Error::Index(format!("dimension {} is not scaled", dim.name())));
            };
            let idx = scaled_to_index(*value, scale.start_value, scale.step, size)?;
            Ok(AxisIndex::Point(idx))
        }
        IndexLike::TimePoint(t) => {
            let DimensionSchema::Time { step, start_value, .. } = dim else {
                return Err(Error::Index(format!("dimension {} is not a time axis", dim.name())));
            };
            let crate::schema::dimension::TimeStart::Explicit(start) = start_value else {
                return Err(Error::Index(
                    "time dimension start is a $ref and must be resolved by the caller first".into(),
                ));
            };
            let idx = time_to_index(*t, *start, *step, size)?;
            Ok(AxisIndex::Point(idx))
        }
        IndexLike::TimeSpan(_) => Err(Error::Index(
            "a bare duration is only valid as a slice bound on a time dimension".into(),
        )),
        IndexLike::Range { start, stop, step } => {
            if *step != 1 {
                return Err(Error::Index("only unit step is supported".into()));
            }
            let start = match start {
                None => 0,
                Some(i) => point_or_err(resolve_axis(i, dim)?)?,
            };
            let stop = match stop {
                None => size,
                Some(i) => point_or_err(resolve_axis(i, dim)?)?,
            };
            Ok(AxisIndex::Range { start, stop })
        }
        IndexLike::Ellipsis => unreachable!("ellipsis is expanded before resolve_axis is called"),
    }
}

fn point_or_err(axis: AxisIndex) -> Result<i64> {
    match axis {
        AxisIndex::Point(i) => Ok(i),
        AxisIndex::Range { start, .. } => Ok(start),
    }
}

/// Rebind a possibly-negative ordinal to `[0, size)`.
///
/// # Errors
/// Returns [`Error::Index`] if `i` is out of range even after rebinding.
pub fn normalize_ordinal(i: i64, size: i64) -> Result<i64> {
    let normalized = if i < 0 { i + size } else { i };
    if normalized < 0 || normalized >= size {
        return Err(Error::Index(format!("index {i} out of range for size {size}")));
    }
    Ok(normalized)
}

fn scaled_to_index(value: f64, start: f64, step: f64, size: i64) -> Result<i64> {
    let offset = value - start;
    let steps = offset / step;
    let rounded = steps.round();
    if (steps - rounded).abs() > f64::EPSILON.max(steps.abs() * 1e-9) {
        return Err(Error::Index(format!(
            "value {value} does not fall on the dimension's scale"
        )));
    }
    let idx = rounded as i64;
    if idx < 0 || idx >= size {
        return Err(Error::Index(format!("scaled index {idx} out of range for size {size}")));
    }
    Ok(idx)
}

fn time_to_index(t: DateTime<Utc>, start: DateTime<Utc>, step: TimeDelta, size: i64) -> Result<i64> {
    let elapsed = t - start;
    let elapsed_us = elapsed.num_microseconds().ok_or_else(|| {
        Error::Index("elapsed duration too large to represent in microseconds".into())
    })?;
    let step_us = step
        .num_microseconds()
        .ok_or_else(|| Error::Index("time step too large to represent in microseconds".into()))?;
    if step_us == 0 || elapsed_us % step_us != 0 {
        return Err(Error::Index(format!(
            "timestamp {t} does not divide evenly by the dimension's step"
        )));
    }
    let idx = elapsed_us / step_us;
    if idx < 0 || idx >= size {
        return Err(Error::Index(format!("time index {idx} out of range for size {size}")));
    }
    Ok(idx)
}

/// Compute the result shape for a resolved indexer against a source shape.
///
/// # Errors
/// Returns [`Error::Index`] if any resolved range is empty (zero-length axes are rejected per §4.2).
pub fn result_shape(axes: &[AxisIndex]) -> Result<Vec<u64>> {
    let mut shape = Vec::new();
    for axis in axes {
        if let AxisIndex::Range { start, stop } = axis {
            if stop <= start {
                return Err(Error::Index("resolved subset has a zero-length axis".into()));
            }
            shape.push(axis.len());
        }
    }
    Ok(shape)
}

/// Flatten resolved axes into half-open `[start, stop)` ranges, collapsing a
/// [`AxisIndex::Point`] to a single-element range. Used by the storage
/// adapter, which addresses a payload purely in terms of byte offsets and
/// has no notion of a dropped axis.
#[must_use]
pub fn bounds_as_ranges(axes: &[AxisIndex]) -> Vec<(u64, u64)> {
    axes.iter()
        .map(|axis| match *axis {
            AxisIndex::Point(i) => (i as u64, i as u64 + 1),
            AxisIndex::Range { start, stop } => (start as u64, stop as u64),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::dimension::{Labels, Scale};

    #[test]
    fn resolves_negative_int() {
        let dim = DimensionSchema::generic("x", 10, None, None).unwrap();
        assert_eq!(
            resolve_axis(&IndexLike::Int(-1), &dim).unwrap(),
            AxisIndex::Point(9)
        );
    }

    #[test]
    fn resolves_label() {
        let labels = Labels::Strings(vec!["a".into(), "b".into(), "c".into()]);
        let dim = DimensionSchema::generic("z", 3, Some(labels), None).unwrap();
        assert_eq!(
            resolve_axis(&IndexLike::Label("b".into()), &dim).unwrap(),
            AxisIndex::Point(1)
        );
    }

    #[test]
    fn resolves_scaled_float() {
        let scale = Scale {
            start_value: 90.0,
            step: -0.5,
        };
        let dim = DimensionSchema::generic("y", 361, None, Some(scale)).unwrap();
        assert_eq!(
            resolve_axis(&IndexLike::Scaled(89.5), &dim).unwrap(),
            AxisIndex::Point(1)
        );
    }

    #[test]
    fn rejects_off_scale_value() {
        let scale = Scale {
            start_value: 0.0,
            step: 0.5,
        };
        let dim = DimensionSchema::generic("y", 10, None, Some(scale)).unwrap();
        assert!(resolve_axis(&IndexLike::Scaled(0.3), &dim).is_err());
    }

    #[test]
    fn expands_ellipsis_and_defaults_trailing_axes() {
        let dims = vec![
            DimensionSchema::generic("a", 4, None, None).unwrap(),
            DimensionSchema::generic("b", 5, None, None).unwrap(),
            DimensionSchema::generic("c", 6, None, None).unwrap(),
        ];
        let axes = resolve(&[IndexLike::Int(1)], &dims).unwrap();
        assert_eq!(axes.len(), 3);
        assert_eq!(axes[0], AxisIndex::Point(1));
        assert_eq!(axes[1], AxisIndex::Range { start: 0, stop: 5 });
        assert_eq!(axes[2], AxisIndex::Range { start: 0, stop: 6 });
    }
}
