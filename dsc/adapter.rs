// ========================================================================================
//                     Flat-array entry points for host environments
// ========================================================================================
//
// Hosts hand over a column-major value buffer, its dimensions and a string label per
// sample. Everything is validated and turned into semantic containers here, so the
// engine itself never sees a flat layout.

use crate::decompose::{DecomposeError, GeneSlotOrder, decompose};
use crate::dispatch::{DispatchError, DispatchPlan, run_permutations};
use crate::matrix::{ExpressionMatrix, MatrixDims, MatrixError};
use crate::progress::NoopPermutationProgress;
use crate::types::{BatchError, BatchLayout};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Invalid matrix: {0}")]
    Matrix(#[from] MatrixError),

    #[error("Invalid batch assignment: {0}")]
    Batch(#[from] BatchError),

    #[error("Decomposition failed: {0}")]
    Decompose(#[from] DecomposeError),

    #[error("Permutation run failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("The matrix has {samples} samples, but {labels} batch labels were supplied.")]
    SampleCountMismatch { samples: usize, labels: usize },
}

/// Observed dispersion of one matrix. Per-gene arrays follow the reference slot
/// order: `gene_db` holds the within-batch value and `gene_dw` the between-batch
/// value.
#[derive(Debug, Clone, PartialEq)]
pub struct DispersionResult {
    pub gene_dsc: Vec<f64>,
    pub gene_db: Vec<f64>,
    pub gene_dw: Vec<f64>,
    pub dsc: f64,
    pub db: f64,
    pub dw: f64,
}

/// Null distribution of a permutation test, flattened. Per-gene arrays hold
/// `permutations * genes` values, permutation-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PermutationTestResult {
    pub gene_dsc: Vec<f64>,
    pub gene_db: Vec<f64>,
    pub gene_dw: Vec<f64>,
    pub dsc: Vec<f64>,
    pub db: Vec<f64>,
    pub dw: Vec<f64>,
}

fn prepare<S: AsRef<str>, U: AsRef<str>>(
    values: &[f64],
    dims: MatrixDims,
    batch_ids: &[S],
    sorted_unique_batch_ids: &[U],
) -> Result<(ExpressionMatrix, BatchLayout), AdapterError> {
    let matrix = ExpressionMatrix::from_column_major(values, dims)?;
    if batch_ids.len() != matrix.sample_count() {
        return Err(AdapterError::SampleCountMismatch {
            samples: matrix.sample_count(),
            labels: batch_ids.len(),
        });
    }
    let layout = BatchLayout::with_sorted_unique(batch_ids, sorted_unique_batch_ids)?;
    Ok((matrix, layout))
}

/// Decomposes a column-major `values` buffer of shape `dims` under `batch_ids`.
pub fn compute_dispersion<S: AsRef<str>, U: AsRef<str>>(
    values: &[f64],
    dims: MatrixDims,
    batch_ids: &[S],
    sorted_unique_batch_ids: &[U],
) -> Result<DispersionResult, AdapterError> {
    let (matrix, layout) = prepare(values, dims, batch_ids, sorted_unique_batch_ids)?;
    let result = decompose(&matrix, &layout, GeneSlotOrder::Reference)?;
    Ok(DispersionResult {
        gene_dsc: result.gene_dsc,
        gene_db: result.gene_db,
        gene_dw: result.gene_dw,
        dsc: result.global.dsc,
        db: result.global.db,
        dw: result.global.dw,
    })
}

/// Runs `permutations` shuffled decompositions of the buffer on `threads` workers.
pub fn run_permutation_test<S: AsRef<str>, U: AsRef<str>>(
    values: &[f64],
    dims: MatrixDims,
    batch_ids: &[S],
    sorted_unique_batch_ids: &[U],
    permutations: usize,
    threads: usize,
) -> Result<PermutationTestResult, AdapterError> {
    let (matrix, layout) = prepare(values, dims, batch_ids, sorted_unique_batch_ids)?;
    let plan = DispatchPlan {
        permutations,
        threads,
        gene_slot_order: GeneSlotOrder::Reference,
    };
    let outputs = run_permutations(&matrix, &layout, &plan, &NoopPermutationProgress)?;
    Ok(PermutationTestResult {
        gene_dsc: outputs.gene_dsc,
        gene_db: outputs.gene_db,
        gene_dw: outputs.gene_dw,
        dsc: outputs.dsc,
        db: outputs.db,
        dw: outputs.dw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const DIMS: MatrixDims = MatrixDims {
        genes: 2,
        samples: 4,
    };
    // [[1, 2, 3, 4], [10, 20, 30, 40]] stored column by column.
    const VALUES: [f64; 8] = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0];

    #[test]
    fn golden_matrix_through_flat_buffers() {
        let result = compute_dispersion(&VALUES, DIMS, &["A", "A", "B", "B"], &["A", "B"]).unwrap();

        assert_abs_diff_eq!(result.gene_dsc[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.gene_dsc[1], 2.0, epsilon = 1e-12);
        // Reference slot order: within in DB, between in DW.
        assert_abs_diff_eq!(result.gene_db[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(result.gene_dw[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.dw, 25.25_f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(result.db, 101.0_f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(result.dsc, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn malformed_inputs_are_reported() {
        let short = compute_dispersion(&VALUES[..7], DIMS, &["A", "A", "B", "B"], &["A", "B"]);
        assert!(matches!(
            short,
            Err(AdapterError::Matrix(MatrixError::LengthMismatch { .. }))
        ));

        let labels = compute_dispersion(&VALUES, DIMS, &["A", "A", "B"], &["A", "B"]);
        assert!(matches!(
            labels,
            Err(AdapterError::SampleCountMismatch {
                samples: 4,
                labels: 3
            })
        ));

        let unique = compute_dispersion(&VALUES, DIMS, &["A", "A", "B", "B"], &["B", "A"]);
        assert!(matches!(
            unique,
            Err(AdapterError::Batch(BatchError::UniqueSetMismatch { .. }))
        ));

        let threads = run_permutation_test(&VALUES, DIMS, &["A", "A", "B", "B"], &["A", "B"], 3, 0);
        assert!(matches!(
            threads,
            Err(AdapterError::Dispatch(DispatchError::NoWorkers))
        ));
    }

    #[test]
    fn permutation_buffers_are_permutation_major() {
        let result =
            run_permutation_test(&VALUES, DIMS, &["A", "A", "B", "B"], &["A", "B"], 6, 2).unwrap();
        assert_eq!(result.dsc.len(), 6);
        assert_eq!(result.gene_dsc.len(), 12);
        assert!(result.dw.iter().all(|v| !v.is_nan()));

        let empty =
            run_permutation_test(&VALUES, DIMS, &["A", "A", "B", "B"], &["A", "B"], 0, 2).unwrap();
        assert!(empty.dsc.is_empty() && empty.gene_dw.is_empty());
    }
}
