use ndarray::{Array2, ArrayView1, ArrayView2, ShapeBuilder};
use thiserror::Error;

/// Shape of a genes × samples matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixDims {
    pub genes: usize,
    pub samples: usize,
}

impl MatrixDims {
    /// Number of values in the matrix, or `None` if it overflows `usize`.
    #[inline]
    pub fn checked_len(&self) -> Option<usize> {
        self.genes.checked_mul(self.samples)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.genes == 0 || self.samples == 0
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatrixError {
    #[error("Matrix must have at least one gene and one sample, but has {genes} × {samples}.")]
    EmptyDimension { genes: usize, samples: usize },

    #[error("Expected {expected} values for a {genes} × {samples} matrix, but found {found}.")]
    LengthMismatch {
        genes: usize,
        samples: usize,
        expected: usize,
        found: usize,
    },

    #[error("A {genes} × {samples} matrix has more values than can be addressed.")]
    TooLarge { genes: usize, samples: usize },
}

/// A genes × samples matrix of doubles, NaN marking a missing value. Rows are
/// genes and are stored contiguously.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionMatrix {
    values: Array2<f64>,
}

impl ExpressionMatrix {
    /// Wraps an existing array, re-laying it out row-major if necessary.
    pub fn from_array(values: Array2<f64>) -> Result<Self, MatrixError> {
        let (genes, samples) = values.dim();
        if genes == 0 || samples == 0 {
            return Err(MatrixError::EmptyDimension { genes, samples });
        }
        let values = if values.is_standard_layout() {
            values
        } else {
            values.as_standard_layout().into_owned()
        };
        Ok(Self { values })
    }

    /// Rebuilds a matrix from values stored column by column: the first `genes`
    /// values are sample 0, the next `genes` are sample 1, and so on.
    pub fn from_column_major(values: &[f64], dims: MatrixDims) -> Result<Self, MatrixError> {
        let expected = Self::check_flat(values, dims)?;
        let column_major = Array2::from_shape_vec((dims.genes, dims.samples).f(), values.to_vec())
            .map_err(|_| Self::length_error(values, dims, expected))?;
        Self::from_array(column_major)
    }

    /// Rebuilds a matrix from values stored gene by gene.
    pub fn from_row_major(values: &[f64], dims: MatrixDims) -> Result<Self, MatrixError> {
        let expected = Self::check_flat(values, dims)?;
        let row_major = Array2::from_shape_vec((dims.genes, dims.samples), values.to_vec())
            .map_err(|_| Self::length_error(values, dims, expected))?;
        Self::from_array(row_major)
    }

    /// Validates a flat buffer against `dims` and returns the value count.
    fn check_flat(values: &[f64], dims: MatrixDims) -> Result<usize, MatrixError> {
        if dims.is_empty() {
            return Err(MatrixError::EmptyDimension {
                genes: dims.genes,
                samples: dims.samples,
            });
        }
        let expected = dims.checked_len().ok_or(MatrixError::TooLarge {
            genes: dims.genes,
            samples: dims.samples,
        })?;
        if values.len() != expected {
            return Err(Self::length_error(values, dims, expected));
        }
        Ok(expected)
    }

    fn length_error(values: &[f64], dims: MatrixDims, expected: usize) -> MatrixError {
        MatrixError::LengthMismatch {
            genes: dims.genes,
            samples: dims.samples,
            expected,
            found: values.len(),
        }
    }

    #[inline]
    pub fn gene_count(&self) -> usize {
        self.values.nrows()
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.values.ncols()
    }

    #[inline]
    pub fn dims(&self) -> MatrixDims {
        MatrixDims {
            genes: self.gene_count(),
            samples: self.sample_count(),
        }
    }

    #[inline]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    #[inline]
    pub fn row(&self, gene: usize) -> ArrayView1<'_, f64> {
        self.values.row(gene)
    }

    pub fn into_array(self) -> Array2<f64> {
        self.values
    }

    /// Shape-preserving mutable access for in-crate transforms.
    pub(crate) fn values_mut(&mut self) -> &mut Array2<f64> {
        &mut self.values
    }
}
