// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are
// used in one file.

use ahash::AHashMap;
use itertools::Itertools;
use std::fmt;
use thiserror::Error;

/// The dataset-level result of one decomposition: separability plus its two
/// dispersion components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalStatistic {
    pub dsc: f64,
    pub db: f64,
    pub dw: f64,
}

impl GlobalStatistic {
    /// The value an output slot holds before any job has written it.
    pub const UNWRITTEN: Self = Self {
        dsc: f64::NAN,
        db: f64::NAN,
        dw: f64::NAN,
    };
}

impl fmt::Display for GlobalStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DSC={} DB={} DW={}", self.dsc, self.db, self.dw)
    }
}

/// One permutation trial. Jobs are minted only by the dispatcher's job counter and
/// are deliberately not `Clone`: holding a job is the proof that no other worker
/// owns the same output region.
#[derive(Debug, PartialEq, Eq)]
pub struct PermutationJob {
    index: usize,
}

impl PermutationJob {
    pub(crate) fn new(index: usize) -> Self {
        Self { index }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Seed for the job's shuffle. Zero is never produced.
    #[inline]
    pub fn seed(&self) -> u64 {
        permutation_seed(self.index)
    }
}

/// Maps a permutation index to its RNG seed (`index + 1`).
#[inline]
pub fn permutation_seed(job_index: usize) -> u64 {
    job_index as u64 + 1
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("The batch assignment is empty; at least one sample is required.")]
    EmptyAssignment,

    #[error(
        "The supplied unique batch list {:?} does not match the sorted distinct labels {:?} \
         of the assignment.",
        .supplied,
        .expected
    )]
    UniqueSetMismatch {
        supplied: Vec<String>,
        expected: Vec<String>,
    },
}

/// A batch assignment (one label per sample column) together with its sorted,
/// deduplicated label set and the member columns of every batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLayout {
    labels: Vec<String>,
    unique: Vec<String>,
    members: Vec<Vec<usize>>,
}

impl BatchLayout {
    /// Builds the layout from per-sample labels, deriving the unique set.
    pub fn new<S: AsRef<str>>(labels: &[S]) -> Result<Self, BatchError> {
        if labels.is_empty() {
            return Err(BatchError::EmptyAssignment);
        }
        let labels: Vec<String> = labels.iter().map(|l| l.as_ref().to_owned()).collect();
        let unique: Vec<String> = labels.iter().cloned().sorted().dedup().collect();

        let position: AHashMap<&str, usize> = unique
            .iter()
            .enumerate()
            .map(|(i, label)| (label.as_str(), i))
            .collect();
        let mut members = vec![Vec::new(); unique.len()];
        for (column, label) in labels.iter().enumerate() {
            members[position[label.as_str()]].push(column);
        }

        Ok(Self {
            labels,
            unique,
            members,
        })
    }

    /// Builds the layout and checks that `sorted_unique` is exactly the sorted
    /// distinct label set of `labels`.
    pub fn with_sorted_unique<S: AsRef<str>, U: AsRef<str>>(
        labels: &[S],
        sorted_unique: &[U],
    ) -> Result<Self, BatchError> {
        let layout = Self::new(labels)?;
        let matches = layout.unique.len() == sorted_unique.len()
            && layout
                .unique
                .iter()
                .zip(sorted_unique)
                .all(|(expected, supplied)| expected == supplied.as_ref());
        if !matches {
            return Err(BatchError::UniqueSetMismatch {
                supplied: sorted_unique
                    .iter()
                    .map(|s| s.as_ref().to_owned())
                    .collect(),
                expected: layout.unique,
            });
        }
        Ok(layout)
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn batch_count(&self) -> usize {
        self.unique.len()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Distinct labels in sort order.
    pub fn unique_batches(&self) -> &[String] {
        &self.unique
    }

    /// Column indices of the samples in the `batch`-th unique batch, ascending.
    #[inline]
    pub fn members(&self, batch: usize) -> &[usize] {
        &self.members[batch]
    }

    /// Number of samples assigned to the `batch`-th unique batch.
    #[inline]
    pub fn occurrences(&self, batch: usize) -> usize {
        self.members[batch].len()
    }

    /// Fewer than two groups leaves nothing to compare between batches.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.unique.len() < 2
    }
}
