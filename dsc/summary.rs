use crate::decompose::Decomposition;
use crate::dispatch::PermutationOutputs;
use log::warn;
use rayon::prelude::*;

/// Empirical p-values of the observed DSC values against the permutation null.
#[derive(Debug, Clone, PartialEq)]
pub struct PermutationSummary {
    pub observed_dsc: f64,
    pub global_pvalue: f64,
    pub gene_dsc: Vec<f64>,
    pub gene_pvalues: Vec<f64>,
}

/// Fraction of valid null values at least as large as `observed`. NaN null values
/// are left out of both counts; a NaN observation or an empty null gives NaN.
pub fn empirical_pvalue(observed: f64, null: impl Iterator<Item = f64>) -> f64 {
    if observed.is_nan() {
        return f64::NAN;
    }
    let (valid, extreme) = null
        .filter(|v| !v.is_nan())
        .fold((0usize, 0usize), |(valid, extreme), v| {
            (valid + 1, extreme + usize::from(v >= observed))
        });
    if valid == 0 {
        f64::NAN
    } else {
        extreme as f64 / valid as f64
    }
}

/// Scores the observed decomposition against the null in `outputs`.
pub fn summarize(observed: &Decomposition, outputs: &PermutationOutputs) -> PermutationSummary {
    let genes = outputs.gene_count();
    if observed.gene_dsc.len() != genes {
        warn!(
            "Observed decomposition has {} genes but the null has {}; unmatched genes get NaN.",
            observed.gene_dsc.len(),
            genes
        );
    }

    let null_gene_dsc = outputs.gene_dsc();
    let gene_pvalues = observed
        .gene_dsc
        .par_iter()
        .enumerate()
        .map(|(gene, &dsc)| {
            if gene >= genes {
                return f64::NAN;
            }
            let column = (0..outputs.permutations()).map(|j| null_gene_dsc[j * genes + gene]);
            empirical_pvalue(dsc, column)
        })
        .collect();

    PermutationSummary {
        observed_dsc: observed.global.dsc,
        global_pvalue: empirical_pvalue(
            observed.global.dsc,
            outputs.global_dsc().iter().copied(),
        ),
        gene_dsc: observed.gene_dsc.clone(),
        gene_pvalues,
    }
}
