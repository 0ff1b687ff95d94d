// ========================================================================================
//
//                         THE DISPERSION DECOMPOSITION ENGINE
//
// ========================================================================================
//
// Splits the spread of every gene into a within-batch part (DW) and a between-batch
// part (DB) and reports their ratio (DSC), per gene and for the whole matrix. The
// engine is single-threaded and deterministic; the permutation workers call
// `decompose_into` with their own scratch so no allocation happens per trial.

use crate::matrix::ExpressionMatrix;
use crate::numeric::{dispersion_ratio, floor_negligible, mean, retain_observed, sample_variance};
use crate::types::{BatchLayout, GlobalStatistic};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecomposeError {
    #[error("The batch assignment covers {layout} samples, but the matrix has {matrix}.")]
    SampleMismatch { layout: usize, matrix: usize },
}

/// Rejects a layout that does not label every matrix column exactly once.
pub fn check_layout(
    matrix: ArrayView2<'_, f64>,
    layout: &BatchLayout,
) -> Result<(), DecomposeError> {
    if layout.sample_count() != matrix.ncols() {
        return Err(DecomposeError::SampleMismatch {
            layout: layout.sample_count(),
            matrix: matrix.ncols(),
        });
    }
    Ok(())
}

/// Which per-gene output array receives which dispersion component.
///
/// `Reference` stores the *within*-batch value in the per-gene DB array and the
/// *between*-batch value in the per-gene DW array, while the global DB/DW scalars
/// are always stored the natural way round. Established DSC outputs carry this
/// asymmetry, so it is the default. `Conventional` labels the per-gene arrays like
/// the globals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeneSlotOrder {
    #[default]
    Reference,
    Conventional,
}

impl GeneSlotOrder {
    /// Returns the `(db_slot, dw_slot)` values for one gene.
    #[inline]
    fn arrange(self, between: f64, within: f64) -> (f64, f64) {
        match self {
            Self::Reference => (within, between),
            Self::Conventional => (between, within),
        }
    }
}

/// Mutable per-gene destination arrays for one decomposition.
pub struct GeneSlots<'a> {
    pub dsc: &'a mut [f64],
    pub db: &'a mut [f64],
    pub dw: &'a mut [f64],
}

/// Reusable per-batch buffers: the raw member values of a row and the same values
/// with missing entries dropped.
#[derive(Debug, Clone)]
pub struct DecompositionScratch {
    batch_values: Vec<Vec<f64>>,
    observed_values: Vec<Vec<f64>>,
}

impl DecompositionScratch {
    pub fn new(layout: &BatchLayout) -> Self {
        let sized = |b: usize| Vec::with_capacity(layout.occurrences(b));
        Self {
            batch_values: (0..layout.batch_count()).map(sized).collect(),
            observed_values: (0..layout.batch_count()).map(sized).collect(),
        }
    }
}

/// Owned result of a single decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub gene_dsc: Vec<f64>,
    pub gene_db: Vec<f64>,
    pub gene_dw: Vec<f64>,
    pub global: GlobalStatistic,
}

/// Decomposes `matrix` under `layout`, allocating the result arrays.
pub fn decompose(
    matrix: &ExpressionMatrix,
    layout: &BatchLayout,
    order: GeneSlotOrder,
) -> Result<Decomposition, DecomposeError> {
    check_layout(matrix.view(), layout)?;
    let genes = matrix.gene_count();
    let mut gene_dsc = vec![f64::NAN; genes];
    let mut gene_db = vec![f64::NAN; genes];
    let mut gene_dw = vec![f64::NAN; genes];
    let mut scratch = DecompositionScratch::new(layout);

    let global = decompose_into(
        matrix.view(),
        layout,
        order,
        &mut scratch,
        GeneSlots {
            dsc: &mut gene_dsc,
            db: &mut gene_db,
            dw: &mut gene_dw,
        },
    );

    Ok(Decomposition {
        gene_dsc,
        gene_db,
        gene_dw,
        global,
    })
}

/// Decomposes `matrix` into caller-provided per-gene slots and returns the global
/// statistic. Callers check the layout with `check_layout` first, and every slot
/// must hold one entry per row.
pub(crate) fn decompose_into(
    matrix: ArrayView2<'_, f64>,
    layout: &BatchLayout,
    order: GeneSlotOrder,
    scratch: &mut DecompositionScratch,
    slots: GeneSlots<'_>,
) -> GlobalStatistic {
    debug_assert_eq!(matrix.ncols(), layout.sample_count());
    debug_assert_eq!(slots.dsc.len(), matrix.nrows());
    debug_assert_eq!(slots.db.len(), matrix.nrows());
    debug_assert_eq!(slots.dw.len(), matrix.nrows());

    let sample_count = layout.sample_count() as f64;
    let degenerate = layout.is_degenerate();
    let mut within_total = 0.0;
    let mut between_total = 0.0;

    for (gene, row) in matrix.rows().into_iter().enumerate() {
        // NaNs are kept here on purpose: only the batch sub-samples are filtered.
        let grand_mean = row.mean().unwrap_or(f64::NAN);
        let mut gene_within = 0.0;
        let mut gene_between = 0.0;

        for batch in 0..layout.batch_count() {
            let values = &mut scratch.batch_values[batch];
            values.clear();
            values.extend(layout.members(batch).iter().map(|&column| row[column]));

            let observed = &mut scratch.observed_values[batch];
            retain_observed(values, observed);

            let occurrences = layout.occurrences(batch) as f64;
            let batch_mean = mean(observed);
            let batch_variance = sample_variance(observed);
            let deviation = batch_mean - grand_mean;

            gene_within += (occurrences - 1.0) / sample_count * batch_variance;
            gene_between += occurrences / sample_count * deviation * deviation;
        }

        within_total += gene_within;
        between_total += gene_between;

        let within = gene_within.sqrt();
        let (dsc, between) = if degenerate {
            (0.0, 0.0)
        } else {
            let between = gene_between.sqrt();
            (dispersion_ratio(between, within), between)
        };

        let (db_slot, dw_slot) = order.arrange(between, within);
        slots.dsc[gene] = floor_negligible(dsc);
        slots.db[gene] = db_slot;
        slots.dw[gene] = dw_slot;
    }

    let dw = within_total.sqrt();
    let (dsc, db) = if degenerate {
        (0.0, 0.0)
    } else {
        let db = between_total.sqrt();
        (dispersion_ratio(db, dw), db)
    };

    GlobalStatistic {
        dsc: floor_negligible(dsc),
        db,
        dw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn matrix(values: ndarray::Array2<f64>) -> ExpressionMatrix {
        ExpressionMatrix::from_array(values).unwrap()
    }

    #[test]
    fn golden_two_gene_example() {
        let m = matrix(array![[1.0, 2.0, 3.0, 4.0], [10.0, 20.0, 30.0, 40.0]]);
        let layout = BatchLayout::new(&["A", "A", "B", "B"]).unwrap();

        let result = decompose(&m, &layout, GeneSlotOrder::Conventional).unwrap();

        assert_abs_diff_eq!(result.gene_dw[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(result.gene_db[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.gene_dsc[0], 2.0, epsilon = 1e-12);

        assert_abs_diff_eq!(result.gene_dw[1], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.gene_db[1], 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.gene_dsc[1], 2.0, epsilon = 1e-12);

        assert_abs_diff_eq!(result.global.dw, 25.25_f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(result.global.db, 101.0_f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(result.global.dsc, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn reference_order_swaps_only_per_gene_slots() {
        let m = matrix(array![[1.0, 2.0, 3.0, 4.0], [10.0, 20.0, 30.0, 40.0]]);
        let layout = BatchLayout::new(&["A", "A", "B", "B"]).unwrap();

        let reference = decompose(&m, &layout, GeneSlotOrder::Reference).unwrap();
        let conventional = decompose(&m, &layout, GeneSlotOrder::Conventional).unwrap();

        assert_eq!(reference.gene_db, conventional.gene_dw);
        assert_eq!(reference.gene_dw, conventional.gene_db);
        assert_eq!(reference.gene_dsc, conventional.gene_dsc);
        assert_eq!(reference.global, conventional.global);
        assert_abs_diff_eq!(reference.gene_db[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(reference.global.db, 101.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn single_batch_forces_between_terms_to_zero() {
        let m = matrix(array![[1.0, 5.0, 2.0], [3.0, 3.5, 9.0]]);
        let layout = BatchLayout::new(&["only", "only", "only"]).unwrap();

        for order in [GeneSlotOrder::Reference, GeneSlotOrder::Conventional] {
            let result = decompose(&m, &layout, order).unwrap();
            let between = match order {
                GeneSlotOrder::Reference => &result.gene_dw,
                GeneSlotOrder::Conventional => &result.gene_db,
            };
            assert!(result.gene_dsc.iter().all(|&v| v == 0.0));
            assert!(between.iter().all(|&v| v == 0.0));
            assert_eq!(result.global.dsc, 0.0);
            assert_eq!(result.global.db, 0.0);
            assert!(result.global.dw > 0.0);
        }
    }

    #[test]
    fn single_sample_is_degenerate() {
        let m = matrix(array![[7.0], [8.0]]);
        let layout = BatchLayout::new(&["A"]).unwrap();
        let result = decompose(&m, &layout, GeneSlotOrder::Conventional).unwrap();

        assert_eq!(result.gene_dsc, vec![0.0, 0.0]);
        assert_eq!(result.gene_db, vec![0.0, 0.0]);
        assert_eq!(result.global.dsc, 0.0);
        assert_eq!(result.global.db, 0.0);
    }

    #[test]
    fn negligible_separation_is_floored_to_zero() {
        // Both batches share the same mean, so DB is zero up to rounding.
        let m = matrix(array![[1.0, 3.0, 1.0, 3.0]]);
        let layout = BatchLayout::new(&["A", "A", "B", "B"]).unwrap();
        let result = decompose(&m, &layout, GeneSlotOrder::Conventional).unwrap();

        assert_eq!(result.gene_dsc[0], 0.0);
        assert_eq!(result.global.dsc, 0.0);
        assert!(result.global.dw > 0.0);
    }

    #[test]
    fn zero_within_dispersion_gives_nan_ratio() {
        let m = matrix(array![[1.0, 1.0, 5.0, 5.0]]);
        let layout = BatchLayout::new(&["A", "A", "B", "B"]).unwrap();
        let result = decompose(&m, &layout, GeneSlotOrder::Conventional).unwrap();

        assert_eq!(result.gene_dw[0], 0.0);
        assert!(result.gene_dsc[0].is_nan());
        assert!(result.global.dsc.is_nan());
    }

    #[test]
    fn missing_value_stays_within_its_gene() {
        let clean = matrix(array![
            [1.0, 2.0, 3.0, 4.0, 2.5, 3.5],
            [10.0, 20.0, 30.0, 40.0, 25.0, 35.0]
        ]);
        let dirty = matrix(array![
            [1.0, 2.0, 3.0, 4.0, 2.5, 3.5],
            [10.0, f64::NAN, 30.0, 40.0, 25.0, 35.0]
        ]);
        let layout = BatchLayout::new(&["A", "A", "A", "B", "B", "B"]).unwrap();

        let clean_result = decompose(&clean, &layout, GeneSlotOrder::Conventional).unwrap();
        let dirty_result = decompose(&dirty, &layout, GeneSlotOrder::Conventional).unwrap();

        assert_eq!(clean_result.gene_dsc[0], dirty_result.gene_dsc[0]);
        assert_eq!(clean_result.gene_db[0], dirty_result.gene_db[0]);
        assert_eq!(clean_result.gene_dw[0], dirty_result.gene_dw[0]);

        // The grand mean of the row includes the NaN, so the between term is undefined,
        // while batch A's within term uses the two remaining values.
        assert!(dirty_result.gene_db[1].is_nan());
        assert!(dirty_result.gene_dw[1].is_finite());
        assert!(dirty_result.gene_dsc[1].is_nan());
    }

    #[test]
    fn batch_with_no_observed_values_propagates_nan() {
        let m = matrix(array![[f64::NAN, f64::NAN, 3.0, 4.0], [1.0, 2.0, 3.0, 4.0]]);
        let layout = BatchLayout::new(&["A", "A", "B", "B"]).unwrap();
        let result = decompose(&m, &layout, GeneSlotOrder::Conventional).unwrap();

        assert!(result.gene_dw[0].is_nan());
        assert!(result.gene_dsc[0].is_nan());
        assert_abs_diff_eq!(result.gene_dsc[1], 2.0, epsilon = 1e-12);
        assert!(result.global.dw.is_nan());
    }

    #[test]
    fn scratch_is_reusable_across_calls() {
        let m = matrix(array![[1.0, 2.0, 3.0, 4.0], [10.0, 20.0, 30.0, 40.0]]);
        let layout = BatchLayout::new(&["A", "B", "A", "B"]).unwrap();
        let mut scratch = DecompositionScratch::new(&layout);

        let mut first = [vec![0.0; 2], vec![0.0; 2], vec![0.0; 2]];
        let mut second = first.clone();
        let [dsc, db, dw] = &mut first;
        let g1 = decompose_into(
            m.view(),
            &layout,
            GeneSlotOrder::Reference,
            &mut scratch,
            GeneSlots { dsc, db, dw },
        );
        let [dsc, db, dw] = &mut second;
        let g2 = decompose_into(
            m.view(),
            &layout,
            GeneSlotOrder::Reference,
            &mut scratch,
            GeneSlots { dsc, db, dw },
        );

        assert_eq!(g1, g2);
        assert_eq!(first, second);
    }

    #[test]
    fn mismatched_layout_is_rejected() {
        let m = matrix(array![[1.0, 2.0, 3.0, 400.0]]);

        let short = BatchLayout::new(&["A", "A", "B"]).unwrap();
        assert_eq!(
            decompose(&m, &short, GeneSlotOrder::Reference),
            Err(DecomposeError::SampleMismatch {
                layout: 3,
                matrix: 4
            })
        );

        let long = BatchLayout::new(&["A", "A", "B", "B", "B"]).unwrap();
        assert!(matches!(
            decompose(&m, &long, GeneSlotOrder::Conventional),
            Err(DecomposeError::SampleMismatch {
                layout: 5,
                matrix: 4
            })
        ));
    }
}
