//! Output unfolding and per-instance aggregation.
//!
//! A solve produces one flat vector of scalar outputs per contribution.
//! The caller expects that vector partitioned into fixed-size sub-results
//! described by an [`OutputDimension`]. When several contributions are
//! computed for the same sample they are first combined into a single flat
//! vector of the same width, then unfolded.

use serde::{Deserialize, Serialize};

use crate::error::{WrapperError, WrapperResult};

/// Flat output of one executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawContribution {
    /// Scalar outputs, `number_qoi + number_combined_qoi` long.
    pub values: Vec<f64>,
    /// Wall-clock seconds spent producing the values.
    pub elapsed: f64,
}

impl RawContribution {
    /// Create a contribution, clamping negative elapsed time to zero.
    #[must_use]
    pub fn new(values: Vec<f64>, elapsed: f64) -> Self {
        Self {
            values,
            elapsed: elapsed.max(0.0),
        }
    }

    /// All-zero placeholder used for inactive levels.
    #[must_use]
    pub fn zeros(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
            elapsed: 0.0,
        }
    }

    /// Number of scalar outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the contribution carries no outputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Partition of the flat output vector into sub-results.
///
/// Always non-empty, entries strictly positive, and the sum equals the
/// declared number of scalar outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDimension(Vec<usize>);

impl OutputDimension {
    /// Derive the partition by chunking `total` into blocks of `batch_size`.
    ///
    /// The last block may be smaller: `total = 5`, `batch_size = 2` gives
    /// `[2, 2, 1]`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `batch_size` is zero or larger than
    /// `total`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mlmc_wrapper::unfold::OutputDimension;
    ///
    /// let dim = OutputDimension::derive(5, 2).unwrap();
    /// assert_eq!(dim.as_slice(), &[2, 2, 1]);
    /// ```
    pub fn derive(total: usize, batch_size: usize) -> WrapperResult<Self> {
        if batch_size == 0 {
            return Err(WrapperError::config("outputBatchSize must be positive, got 0"));
        }
        if total < batch_size {
            return Err(WrapperError::config(format!(
                "number of scalar outputs ({total}) is smaller than outputBatchSize \
                 ({batch_size}); set outputBatchSize smaller or equal to the number of \
                 scalar outputs"
            )));
        }

        let batches = total.div_ceil(batch_size);
        let sizes = (0..batches)
            .map(|i| batch_size.min(total - i * batch_size))
            .collect();

        Ok(Self(sizes))
    }

    /// Validate an explicitly supplied partition.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the partition is empty, has a zero
    /// entry, or does not sum to `total`.
    pub fn explicit(sizes: Vec<usize>, total: usize) -> WrapperResult<Self> {
        if sizes.is_empty() {
            return Err(WrapperError::config("outputDimension must not be empty"));
        }
        if let Some(pos) = sizes.iter().position(|&s| s == 0) {
            return Err(WrapperError::config(format!(
                "outputDimension {sizes:?} has a zero entry at position {pos}"
            )));
        }
        let sum: usize = sizes.iter().sum();
        if sum != total {
            return Err(WrapperError::config(format!(
                "outputDimension {sizes:?} sums to {sum}, expected {total} scalar outputs"
            )));
        }

        Ok(Self(sizes))
    }

    /// Sizes of the sub-results.
    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Number of sub-results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the partition is empty. Never true for a constructed value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of scalar outputs covered.
    #[must_use]
    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }
}

/// Shaped result handed back to the caller of `solve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult(Vec<Vec<f64>>);

impl AggregatedResult {
    /// Sub-results in declaration order.
    #[must_use]
    pub fn parts(&self) -> &[Vec<f64>] {
        &self.0
    }

    /// Number of sub-results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no sub-results.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Concatenate the sub-results back into a flat vector.
    #[must_use]
    pub fn flatten(&self) -> Vec<f64> {
        self.0.iter().flatten().copied().collect()
    }

    /// Consume into the inner list.
    #[must_use]
    pub fn into_inner(self) -> Vec<Vec<f64>> {
        self.0
    }
}

/// Splits raw contributions according to an [`OutputDimension`].
#[derive(Debug, Clone)]
pub struct Unfolder {
    dimension: OutputDimension,
}

impl Unfolder {
    /// Create an unfolder for the given partition.
    #[must_use]
    pub const fn new(dimension: OutputDimension) -> Self {
        Self { dimension }
    }

    /// The partition in use.
    #[must_use]
    pub const fn dimension(&self) -> &OutputDimension {
        &self.dimension
    }

    /// Partition `raw` into consecutive slices.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `raw` does not have exactly
    /// `dimension().total()` values.
    pub fn unfold(&self, raw: &RawContribution) -> WrapperResult<AggregatedResult> {
        self.check_len(0, raw)?;

        let mut parts = Vec::with_capacity(self.dimension.len());
        let mut offset = 0;
        for &size in self.dimension.as_slice() {
            parts.push(raw.values[offset..offset + size].to_vec());
            offset += size;
        }

        Ok(AggregatedResult(parts))
    }

    /// Combine several contributions of the same instance, then unfold.
    ///
    /// The first `number_qoi` components are ensemble-averaged; the next
    /// `number_combined_qoi` components are power-sum style accumulators and
    /// are summed. The combined elapsed time is the sum of all
    /// contributions.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `raw_list` is empty or if
    /// `number_qoi + number_combined_qoi` disagrees with the partition, and
    /// `ShapeMismatch` if any contribution has the wrong length.
    pub fn postprocess_contributions(
        &self,
        raw_list: &[RawContribution],
        number_qoi: usize,
        number_combined_qoi: usize,
    ) -> WrapperResult<AggregatedResult> {
        let combined = self.combine(raw_list, number_qoi, number_combined_qoi)?;
        self.unfold(&combined)
    }

    /// Combine contributions into a single flat contribution.
    ///
    /// # Errors
    ///
    /// See [`Unfolder::postprocess_contributions`].
    pub fn combine(
        &self,
        raw_list: &[RawContribution],
        number_qoi: usize,
        number_combined_qoi: usize,
    ) -> WrapperResult<RawContribution> {
        let total = self.dimension.total();
        if number_qoi + number_combined_qoi != total {
            return Err(WrapperError::config(format!(
                "numberQoI ({number_qoi}) + numberCombinedQoi ({number_combined_qoi}) \
                 does not match {total} scalar outputs"
            )));
        }
        if raw_list.is_empty() {
            return Err(WrapperError::config(
                "cannot combine an empty list of contributions",
            ));
        }
        for (index, raw) in raw_list.iter().enumerate() {
            self.check_len(index, raw)?;
        }

        let n = raw_list.len() as f64;
        let mut values = vec![0.0; total];
        let mut elapsed = 0.0;
        for raw in raw_list {
            for (acc, v) in values.iter_mut().zip(&raw.values) {
                *acc += v;
            }
            elapsed += raw.elapsed;
        }
        for v in &mut values[..number_qoi] {
            *v /= n;
        }

        Ok(RawContribution::new(values, elapsed))
    }

    fn check_len(&self, index: usize, raw: &RawContribution) -> WrapperResult<()> {
        let expected = self.dimension.total();
        if raw.len() == expected {
            Ok(())
        } else {
            Err(WrapperError::ShapeMismatch {
                index,
                expected,
                found: raw.len(),
            })
        }
    }
}
