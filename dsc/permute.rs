// ========================================================================================
//                                 THE PERMUTATION STEP
// ========================================================================================
//
// One null trial: reload the untouched source values, shuffle every gene row on its
// own, then decompose the result against the original batch labels. Shuffling
// within rows keeps each gene's value multiset and only breaks the link between a
// sample and its batch.

use crate::decompose::{
    DecomposeError, DecompositionScratch, GeneSlotOrder, GeneSlots, check_layout, decompose_into,
};
use crate::matrix::ExpressionMatrix;
use crate::types::{BatchLayout, GlobalStatistic};
use ndarray::{Array2, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Shuffles each row of `matrix` independently, consuming `rng` row by row.
pub fn shuffle_rows(matrix: &mut Array2<f64>, row_buffer: &mut Vec<f64>, rng: &mut StdRng) {
    for mut row in matrix.rows_mut() {
        row_buffer.clear();
        row_buffer.extend(row.iter().copied());
        row_buffer.shuffle(rng);
        row.assign(&ArrayView1::from(row_buffer.as_slice()));
    }
}

/// Returns a row-wise shuffled copy of `source` for the given seed.
pub fn permute(source: &ExpressionMatrix, seed: u64) -> ExpressionMatrix {
    let mut permuted = source.clone();
    let mut row_buffer = Vec::with_capacity(source.sample_count());
    let mut rng = StdRng::seed_from_u64(seed);
    shuffle_rows(permuted.values_mut(), &mut row_buffer, &mut rng);
    permuted
}

/// Thread-private state for running permutation trials back to back. Everything
/// here is allocated once and reused by every job the owning worker claims.
pub struct PermutationWorker<'a> {
    source: &'a ExpressionMatrix,
    layout: &'a BatchLayout,
    order: GeneSlotOrder,
    working: Array2<f64>,
    row_buffer: Vec<f64>,
    scratch: DecompositionScratch,
    rng: StdRng,
}

impl<'a> PermutationWorker<'a> {
    /// Fails if `layout` does not label every column of `source`.
    pub fn new(
        source: &'a ExpressionMatrix,
        layout: &'a BatchLayout,
        order: GeneSlotOrder,
    ) -> Result<Self, DecomposeError> {
        check_layout(source.view(), layout)?;
        Ok(Self {
            source,
            layout,
            order,
            working: source.view().to_owned(),
            row_buffer: Vec::with_capacity(source.sample_count()),
            scratch: DecompositionScratch::new(layout),
            rng: StdRng::seed_from_u64(0),
        })
    }

    /// Runs one trial with `seed`, writing per-gene results into `slots` and
    /// returning the global statistic. Every slot holds one entry per gene.
    pub(crate) fn run(&mut self, seed: u64, slots: GeneSlots<'_>) -> GlobalStatistic {
        self.working.assign(&self.source.view());
        self.rng = StdRng::seed_from_u64(seed);
        shuffle_rows(&mut self.working, &mut self.row_buffer, &mut self.rng);
        decompose_into(
            self.working.view(),
            self.layout,
            self.order,
            &mut self.scratch,
            slots,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::decompose;
    use ndarray::array;
    use rand::Rng;

    fn random_matrix(genes: usize, samples: usize, seed: u64) -> ExpressionMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let values = Array2::from_shape_fn((genes, samples), |_| rng.gen_range(-5.0..5.0));
        ExpressionMatrix::from_array(values).unwrap()
    }

    fn sorted(mut values: Vec<f64>) -> Vec<f64> {
        values.sort_by(|a, b| a.total_cmp(b));
        values
    }

    #[test]
    fn shuffle_preserves_every_row_multiset() {
        let source = random_matrix(12, 9, 7);
        let permuted = permute(&source, 3);

        for gene in 0..source.gene_count() {
            assert_eq!(
                sorted(source.row(gene).to_vec()),
                sorted(permuted.row(gene).to_vec())
            );
        }
        assert_ne!(source, permuted, "nine columns should not survive a shuffle intact");
    }

    #[test]
    fn shuffle_keeps_missing_values() {
        let source =
            ExpressionMatrix::from_array(array![[1.0, f64::NAN, 3.0, 4.0, f64::NAN]]).unwrap();
        let permuted = permute(&source, 11);
        let nan_count = permuted.row(0).iter().filter(|v| v.is_nan()).count();
        assert_eq!(nan_count, 2);
    }

    #[test]
    fn identical_seeds_give_identical_shuffles() {
        let source = random_matrix(5, 20, 99);
        assert_eq!(permute(&source, 17), permute(&source, 17));
        assert_ne!(permute(&source, 17), permute(&source, 18));
    }

    #[test]
    fn worker_trials_do_not_chain() {
        let source = random_matrix(4, 10, 5);
        let labels = ["a", "a", "a", "b", "b", "b", "c", "c", "c", "c"];
        let layout = BatchLayout::new(&labels).unwrap();
        let mut worker =
            PermutationWorker::new(&source, &layout, GeneSlotOrder::Reference).unwrap();

        let mut run = |seed: u64| {
            let mut dsc = vec![0.0; 4];
            let mut db = vec![0.0; 4];
            let mut dw = vec![0.0; 4];
            let global = worker.run(
                seed,
                GeneSlots {
                    dsc: &mut dsc,
                    db: &mut db,
                    dw: &mut dw,
                },
            );
            (global, dsc, db, dw)
        };

        let first = run(2);
        let other = run(8);
        let again = run(2);
        assert_ne!(first.0, other.0);
        assert_eq!(first, again);
    }

    #[test]
    fn worker_matches_decomposing_a_permuted_copy() {
        let source = random_matrix(6, 8, 21);
        let layout = BatchLayout::new(&["x", "y", "x", "y", "x", "y", "x", "y"]).unwrap();
        let mut worker =
            PermutationWorker::new(&source, &layout, GeneSlotOrder::Conventional).unwrap();

        let mut dsc = vec![0.0; 6];
        let mut db = vec![0.0; 6];
        let mut dw = vec![0.0; 6];
        let global = worker.run(
            4,
            GeneSlots {
                dsc: &mut dsc,
                db: &mut db,
                dw: &mut dw,
            },
        );

        let expected =
            decompose(&permute(&source, 4), &layout, GeneSlotOrder::Conventional).unwrap();
        assert_eq!(global, expected.global);
        assert_eq!(dsc, expected.gene_dsc);
        assert_eq!(db, expected.gene_db);
        assert_eq!(dw, expected.gene_dw);
    }

    #[test]
    fn worker_rejects_layout_of_another_width() {
        let source = random_matrix(2, 4, 1);
        let layout = BatchLayout::new(&["a", "a", "b"]).unwrap();
        assert!(matches!(
            PermutationWorker::new(&source, &layout, GeneSlotOrder::Reference),
            Err(DecomposeError::SampleMismatch {
                layout: 3,
                matrix: 4
            })
        ));
    }
}
