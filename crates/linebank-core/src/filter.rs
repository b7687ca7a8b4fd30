//! Row predicates shared by every engine.
//!
//! A [`RowFilter`] is a conjunction of [`Predicate`]s. Engines that can push
//! filtering down (flat arrays, Parquet) evaluate it while reading; the
//! storage manager applies it in memory for engines that cannot. Either way
//! the same kernels run, which is what makes results identical across
//! engines.
//!
//! Comparison semantics:
//! - `Range` compares the column cast to `Float64`; both bounds inclusive.
//! - `InSet` compares the column cast to `Int64` (so `u8` codes and numeric
//!   strings work). Float columns are compared exactly: `2.7` is not `2`.
//! - A null value, or a value that fails the cast, never matches.

use std::{collections::BTreeSet, fmt, str::FromStr};

use arrow::{
    array::{Array, ArrayRef, AsArray, BooleanArray, Float64Array, RecordBatch, Scalar},
    compute::{
        cast, filter_record_batch,
        kernels::{boolean as boolean_kernels, cmp as cmp_kernels},
    },
    datatypes::{DataType, Float64Type, Int64Type},
    error::ArrowError,
};
use snafu::prelude::*;

/// Default name of the range (wavenumber-like) column.
pub const DEFAULT_RANGE_COLUMN: &str = "wav";
/// Default name of the categorical (isotope-like) column.
pub const DEFAULT_CATEGORY_COLUMN: &str = "iso";

/// A set of categorical codes to keep.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CategorySet(BTreeSet<i64>);

impl CategorySet {
    /// Returns true if `value` is a member.
    pub fn contains(&self, value: i64) -> bool {
        self.0.contains(&value)
    }

    /// Iterate members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.iter().copied()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<i64> for CategorySet {
    fn from(v: i64) -> Self {
        CategorySet(BTreeSet::from([v]))
    }
}

impl From<i32> for CategorySet {
    fn from(v: i32) -> Self {
        CategorySet::from(i64::from(v))
    }
}

impl From<Vec<i64>> for CategorySet {
    fn from(v: Vec<i64>) -> Self {
        CategorySet(v.into_iter().collect())
    }
}

impl From<&[i64]> for CategorySet {
    fn from(v: &[i64]) -> Self {
        CategorySet(v.iter().copied().collect())
    }
}

impl<const N: usize> From<[i64; N]> for CategorySet {
    fn from(v: [i64; N]) -> Self {
        CategorySet(v.into_iter().collect())
    }
}

/// Errors from parsing a [`CategorySet`] such as `"1,2"`.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseCategorySetError {
    /// The selector was empty or only whitespace.
    #[snafu(display("category selector is empty"))]
    EmptySelector,

    /// One comma-separated part is not an integer code.
    #[snafu(display("invalid category code {part:?} in {input:?}: {source}"))]
    InvalidCode {
        /// The whole selector.
        input: String,
        /// The offending part.
        part: String,
        /// Error from `i64::from_str`.
        source: std::num::ParseIntError,
    },
}

impl FromStr for CategorySet {
    type Err = ParseCategorySetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(!s.trim().is_empty(), EmptySelectorSnafu);
        let set = s
            .split(',')
            .map(|part| {
                let part = part.trim();
                part.parse::<i64>()
                    .context(InvalidCodeSnafu { input: s, part })
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(CategorySet(set))
    }
}

impl fmt::Display for CategorySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(i64::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

/// One row predicate over a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Keep rows with `min <= value <= max`; either bound may be absent.
    Range {
        /// Column to compare.
        column: String,
        /// Inclusive lower bound.
        min: Option<f64>,
        /// Inclusive upper bound.
        max: Option<f64>,
    },
    /// Keep rows whose value is a member of `values`.
    InSet {
        /// Column to compare.
        column: String,
        /// Accepted codes.
        values: CategorySet,
    },
}

impl Predicate {
    /// The column this predicate reads.
    pub fn column(&self) -> &str {
        match self {
            Predicate::Range { column, .. } | Predicate::InSet { column, .. } => column,
        }
    }

    fn evaluate(&self, column: &ArrayRef) -> Result<BooleanArray, ArrowError> {
        match self {
            Predicate::Range { min, max, .. } => {
                let values = cast(column, &DataType::Float64)?;
                let values = values.as_primitive::<Float64Type>();

                let lower = match min {
                    Some(min) => Some(cmp_kernels::gt_eq(
                        values,
                        &Scalar::new(Float64Array::from(vec![*min])),
                    )?),
                    None => None,
                };
                let upper = match max {
                    Some(max) => Some(cmp_kernels::lt_eq(
                        values,
                        &Scalar::new(Float64Array::from(vec![*max])),
                    )?),
                    None => None,
                };

                match (lower, upper) {
                    (Some(l), Some(u)) => boolean_kernels::and(&l, &u),
                    (Some(mask), None) | (None, Some(mask)) => Ok(mask),
                    (None, None) => Ok(non_null_mask(values)),
                }
            }
            Predicate::InSet { values: set, .. } if column.data_type().is_floating() => {
                // Float codes match only when integral.
                let codes = cast(column, &DataType::Float64)?;
                let codes = codes.as_primitive::<Float64Type>();
                Ok(codes
                    .iter()
                    .map(|v| v.map(|v| v.fract() == 0.0 && set.contains(v as i64)))
                    .collect())
            }
            Predicate::InSet { values: set, .. } => {
                let codes = cast(column, &DataType::Int64)?;
                let codes = codes.as_primitive::<Int64Type>();
                Ok(codes.iter().map(|v| v.map(|v| set.contains(v))).collect())
            }
        }
    }

    /// Decide whether any value in `[lo, hi]` could satisfy this predicate.
    pub(crate) fn on_interval(&self, lo: f64, hi: f64) -> IntervalTruth {
        use IntervalTruth::*;
        match self {
            Predicate::Range { min, max, .. } => {
                let below = min.is_some_and(|min| hi < min);
                let above = max.is_some_and(|max| lo > max);
                if below || above {
                    AlwaysFalse
                } else if min.is_none_or(|min| lo >= min) && max.is_none_or(|max| hi <= max) {
                    AlwaysTrue
                } else {
                    MaybeTrue
                }
            }
            Predicate::InSet { values, .. } => {
                if values.iter().any(|v| (v as f64) >= lo && (v as f64) <= hi) {
                    MaybeTrue
                } else {
                    AlwaysFalse
                }
            }
        }
    }
}

fn non_null_mask(values: &dyn Array) -> BooleanArray {
    (0..values.len()).map(|i| Some(values.is_valid(i))).collect()
}

/// Result of evaluating a predicate against every value of a closed interval
/// `[min, max]`, typically a Parquet row group's column statistics.
///
/// - `AlwaysFalse`: no value in the interval can match; safe to prune.
/// - `MaybeTrue`: some values may match; must read.
/// - `AlwaysTrue`: every non-null value matches; still read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntervalTruth {
    AlwaysTrue,
    MaybeTrue,
    AlwaysFalse,
}

impl IntervalTruth {
    pub(crate) fn and(self, other: IntervalTruth) -> IntervalTruth {
        use IntervalTruth::*;
        match (self, other) {
            (AlwaysFalse, _) | (_, AlwaysFalse) => AlwaysFalse,
            (AlwaysTrue, AlwaysTrue) => AlwaysTrue,
            _ => MaybeTrue,
        }
    }
}

/// Conjunction of row predicates. The empty filter keeps every row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowFilter {
    predicates: Vec<Predicate>,
}

impl RowFilter {
    /// A filter that keeps every row.
    pub fn none() -> Self {
        Self::default()
    }

    /// Add a predicate (logical AND with the existing ones).
    pub fn and(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Merge another filter into this one.
    pub fn and_all(mut self, other: RowFilter) -> Self {
        self.predicates.extend(other.predicates);
        self
    }

    /// Returns true if the filter keeps every row.
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Predicates in insertion order.
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Distinct columns read by the filter, in first-use order.
    pub fn columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for p in &self.predicates {
            if !out.contains(&p.column()) {
                out.push(p.column());
            }
        }
        out
    }

    /// Evaluate the filter on `batch`, which must contain every filter column.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray, ArrowError> {
        let mut mask: Option<BooleanArray> = None;
        for predicate in &self.predicates {
            let column = batch.column_by_name(predicate.column()).ok_or_else(|| {
                ArrowError::SchemaError(format!(
                    "filter column {:?} missing from batch",
                    predicate.column()
                ))
            })?;
            let next = predicate.evaluate(column)?;
            mask = Some(match mask {
                Some(prev) => boolean_kernels::and(&prev, &next)?,
                None => next,
            });
        }
        Ok(mask.unwrap_or_else(|| BooleanArray::from(vec![true; batch.num_rows()])))
    }

    /// Keep only the rows of `batch` that satisfy the filter.
    pub fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch, ArrowError> {
        if self.is_empty() {
            return Ok(batch.clone());
        }
        let mask = self.evaluate(batch)?;
        filter_record_batch(batch, &mask)
    }

    /// Combine every predicate's verdict for per-column intervals supplied by
    /// `bounds`. Columns without bounds are treated as `MaybeTrue`.
    pub(crate) fn on_intervals<F>(&self, mut bounds: F) -> IntervalTruth
    where
        F: FnMut(&str) -> Option<(f64, f64)>,
    {
        self.predicates
            .iter()
            .fold(IntervalTruth::AlwaysTrue, |acc, p| {
                let truth = match bounds(p.column()) {
                    Some((lo, hi)) => p.on_interval(lo, hi),
                    None => IntervalTruth::MaybeTrue,
                };
                acc.and(truth)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float32Array, Int64Array, StringArray, UInt8Array};
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("wav", DataType::Float64, true),
            Field::new("iso", DataType::UInt8, false),
            Field::new("int", DataType::Float32, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(vec![
                    Some(2000.0),
                    Some(2300.0),
                    None,
                    Some(2500.0),
                    Some(2600.0),
                ])),
                Arc::new(UInt8Array::from(vec![1, 2, 2, 1, 2])),
                Arc::new(Float32Array::from(vec![0.1, 0.2, 0.3, 0.4, 0.5])),
            ],
        )
        .expect("valid batch")
    }

    fn range(min: Option<f64>, max: Option<f64>) -> Predicate {
        Predicate::Range {
            column: "wav".into(),
            min,
            max,
        }
    }

    #[test]
    fn range_bounds_are_inclusive_and_drop_nulls() -> TestResult {
        let out = RowFilter::none()
            .and(range(Some(2300.0), Some(2500.0)))
            .apply(&batch())?;
        let wav = out.column(0).as_primitive::<Float64Type>();
        assert_eq!(wav.values().to_vec(), vec![2300.0, 2500.0]);
        Ok(())
    }

    #[test]
    fn one_sided_ranges() -> TestResult {
        let low = RowFilter::none().and(range(Some(2300.0), None)).apply(&batch())?;
        assert_eq!(low.num_rows(), 3);
        let high = RowFilter::none().and(range(None, Some(2300.0))).apply(&batch())?;
        assert_eq!(high.num_rows(), 2);
        let open = RowFilter::none().and(range(None, None)).apply(&batch())?;
        assert_eq!(open.num_rows(), 4);
        Ok(())
    }

    #[test]
    fn inverted_range_is_empty() -> TestResult {
        let out = RowFilter::none()
            .and(range(Some(2500.0), Some(2300.0)))
            .apply(&batch())?;
        assert_eq!(out.num_rows(), 0);
        Ok(())
    }

    #[test]
    fn category_set_combines_with_range() -> TestResult {
        let filter = RowFilter::none()
            .and(Predicate::InSet {
                column: "iso".into(),
                values: CategorySet::from(2),
            })
            .and(range(Some(2100.0), None));
        let out = filter.apply(&batch())?;
        assert_eq!(out.num_rows(), 2);
        let iso = out.column(1).as_primitive::<arrow::datatypes::UInt8Type>();
        assert!(iso.values().iter().all(|&v| v == 2));
        Ok(())
    }

    #[test]
    fn category_matching_on_string_codes() -> TestResult {
        let schema = Arc::new(Schema::new(vec![Field::new("iso", DataType::Utf8, false)]));
        let b = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec!["1", "2", "x", "2"]))],
        )?;
        let out = RowFilter::none()
            .and(Predicate::InSet {
                column: "iso".into(),
                values: "2".parse()?,
            })
            .apply(&b)?;
        assert_eq!(out.num_rows(), 2);
        Ok(())
    }

    #[test]
    fn missing_filter_column_is_an_error() {
        let filter = RowFilter::none().and(Predicate::InSet {
            column: "nope".into(),
            values: CategorySet::from(1),
        });
        assert!(filter.apply(&batch()).is_err());
    }

    #[test]
    fn parse_category_sets() -> TestResult {
        let set: CategorySet = "1, 2,2".parse()?;
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(set.to_string(), "1,2");
        assert_eq!(" ".parse::<CategorySet>(), Err(ParseCategorySetError::EmptySelector));
        assert!(matches!(
            "1,a".parse::<CategorySet>(),
            Err(ParseCategorySetError::InvalidCode { ref part, .. }) if part == "a"
        ));
        assert!(matches!(
            "1,,2".parse::<CategorySet>(),
            Err(ParseCategorySetError::InvalidCode { ref part, .. }) if part.is_empty()
        ));
        Ok(())
    }

    #[test]
    fn columns_are_deduplicated_in_order() {
        let filter = RowFilter::none()
            .and(range(Some(1.0), None))
            .and(Predicate::InSet {
                column: "iso".into(),
                values: CategorySet::from(1),
            })
            .and(range(None, Some(5.0)));
        assert_eq!(filter.columns(), vec!["wav", "iso"]);
    }

    #[test]
    fn interval_pruning_verdicts() {
        use IntervalTruth::*;
        let r = range(Some(2300.0), Some(2500.0));
        assert_eq!(r.on_interval(1000.0, 2000.0), AlwaysFalse);
        assert_eq!(r.on_interval(2600.0, 2700.0), AlwaysFalse);
        assert_eq!(r.on_interval(2200.0, 2400.0), MaybeTrue);
        assert_eq!(r.on_interval(2350.0, 2400.0), AlwaysTrue);

        let s = Predicate::InSet {
            column: "iso".into(),
            values: CategorySet::from([3, 4]),
        };
        assert_eq!(s.on_interval(1.0, 2.0), AlwaysFalse);
        assert_eq!(s.on_interval(1.0, 3.0), MaybeTrue);

        let filter = RowFilter::none().and(r).and(s);
        let verdict = filter.on_intervals(|c| match c {
            "wav" => Some((2350.0, 2400.0)),
            _ => Some((1.0, 2.0)),
        });
        assert_eq!(verdict, AlwaysFalse);
        assert_eq!(RowFilter::none().on_intervals(|_| None), AlwaysTrue);
    }

    #[test]
    fn fractional_float_codes_never_match() -> TestResult {
        let schema = Arc::new(Schema::new(vec![Field::new("iso", DataType::Float64, true)]));
        let b = RecordBatch::try_new(
            schema,
            vec![Arc::new(Float64Array::from(vec![
                Some(2.0),
                Some(2.5),
                Some(2.7),
                None,
                Some(f64::NAN),
                Some(3.0),
            ]))],
        )?;
        let filter = RowFilter::none().and(Predicate::InSet {
            column: "iso".into(),
            values: CategorySet::from(vec![2, 3]),
        });
        assert_eq!(
            filter.evaluate(&b)?,
            BooleanArray::from(vec![Some(true), Some(false), Some(false), None, Some(false), Some(true)])
        );
        // The pruning verdict agrees: [2.5, 2.7] holds no member.
        assert_eq!(
            filter.on_intervals(|_| Some((2.5, 2.7))),
            IntervalTruth::AlwaysFalse
        );
        Ok(())
    }

    #[test]
    fn int64_codes_cast_cleanly() -> TestResult {
        let schema = Arc::new(Schema::new(vec![Field::new("iso", DataType::Int64, false)]));
        let b = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3]))])?;
        let mask = RowFilter::none()
            .and(Predicate::InSet {
                column: "iso".into(),
                values: CategorySet::from(vec![1, 3]),
            })
            .evaluate(&b)?;
        assert_eq!(mask, BooleanArray::from(vec![true, false, true]));
        Ok(())
    }
}
