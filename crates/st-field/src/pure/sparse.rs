// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{PureResult, TensorError, TensorField};
use ndarray::{Array2, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Compressed sparse row matrix used for mesh support operators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f32>,
}

impl SparseMatrix {
    /// Builds a matrix from `(row, col, value)` triplets. Duplicate
    /// coordinates are summed.
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        triplets: &[(usize, usize, f32)],
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::EmptyInput("sparse_matrix"));
        }
        let mut entries = triplets.to_vec();
        for &(r, c, _) in &entries {
            if r >= rows || c >= cols {
                return Err(TensorError::ShapeMismatch {
                    left: vec![r, c],
                    right: vec![rows, cols],
                });
            }
        }
        entries.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut indptr = vec![0usize; rows + 1];
        let mut indices = Vec::with_capacity(entries.len());
        let mut values: Vec<f32> = Vec::with_capacity(entries.len());
        let mut last: Option<(usize, usize)> = None;
        for (r, c, v) in entries {
            if last == Some((r, c)) {
                if let Some(slot) = values.last_mut() {
                    *slot += v;
                }
                continue;
            }
            indices.push(c);
            values.push(v);
            indptr[r + 1] += 1;
            last = Some((r, c));
        }
        for r in 0..rows {
            indptr[r + 1] += indptr[r];
        }
        Ok(Self {
            rows,
            cols,
            indptr,
            indices,
            values,
        })
    }

    pub fn identity(n: usize) -> PureResult<Self> {
        let triplets: Vec<(usize, usize, f32)> = (0..n).map(|i| (i, i, 1.0)).collect();
        Self::from_triplets(n, n, &triplets)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Stored `(col, value)` pairs of `row`.
    pub fn row_entries(&self, row: usize) -> impl Iterator<Item = (usize, f32)> + '_ {
        let (start, end) = if row < self.rows {
            (self.indptr[row], self.indptr[row + 1])
        } else {
            (0, 0)
        };
        self.indices[start..end]
            .iter()
            .copied()
            .zip(self.values[start..end].iter().copied())
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.row_entries(row)
            .find(|(c, _)| *c == col)
            .map(|(_, v)| v)
            .unwrap_or(0.0)
    }

    pub fn scale(&self, factor: f32) -> Self {
        let mut scaled = self.clone();
        for v in &mut scaled.values {
            *v *= factor;
        }
        scaled
    }

    /// Sparse-dense product contracting the leading axis of `dense`:
    /// `out[i, ..] = sum_j self[i, j] * dense[j, ..]`.
    pub fn spmm(&self, dense: &ArrayD<f32>) -> PureResult<ArrayD<f32>> {
        if dense.ndim() == 0 || dense.shape()[0] != self.cols {
            return Err(TensorError::ShapeMismatch {
                left: vec![self.rows, self.cols],
                right: dense.shape().to_vec(),
            });
        }
        let trailing = dense.shape()[1..].to_vec();
        let width: usize = trailing.iter().product();
        let flat = dense
            .as_standard_layout()
            .into_owned()
            .into_shape((self.cols, width))?;
        let mut out = Array2::<f32>::zeros((self.rows, width));
        for row in 0..self.rows {
            let mut target = out.row_mut(row);
            for idx in self.indptr[row]..self.indptr[row + 1] {
                target.scaled_add(self.values[idx], &flat.row(self.indices[idx]));
            }
        }
        let mut shape = Vec::with_capacity(trailing.len() + 1);
        shape.push(self.rows);
        shape.extend(trailing);
        Ok(out.into_shape(IxDyn(&shape))?)
    }

    /// [`SparseMatrix::spmm`] over the vertex axis of a field.
    pub fn spmm_field(&self, field: &TensorField) -> PureResult<TensorField> {
        TensorField::from_array(self.spmm(field.array())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn triplets_merge_duplicates() {
        let m = SparseMatrix::from_triplets(2, 2, &[(0, 1, 1.0), (1, 0, 2.0), (0, 1, 0.5)])
            .unwrap();
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.get(0, 1), 1.5);
        assert_eq!(m.get(1, 1), 0.0);
    }

    #[test]
    fn out_of_bounds_triplet_fails() {
        assert!(SparseMatrix::from_triplets(2, 2, &[(2, 0, 1.0)]).is_err());
    }

    #[test]
    fn spmm_matches_dense_product() {
        let dense = arr2(&[[0.0, 1.0, 0.0], [-1.0, 0.0, 2.0], [0.0, 0.0, 3.0]]);
        let triplets = [(0, 1, 1.0), (1, 0, -1.0), (1, 2, 2.0), (2, 2, 3.0)];
        let m = SparseMatrix::from_triplets(3, 3, &triplets).unwrap();
        let x = arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let got = m.spmm(&x.clone().into_dyn()).unwrap();
        let expected = dense.dot(&x).into_dyn();
        assert_eq!(got, expected);
    }

    #[test]
    fn spmm_keeps_trailing_axes() {
        let m = SparseMatrix::identity(2).unwrap().scale(2.0);
        let field = TensorField::from_fn(&[2, 3, 1], |idx| idx[1] as f32).unwrap();
        let out = m.spmm_field(&field).unwrap();
        assert_eq!(out.shape(), &[2, 3, 1]);
        assert_eq!(out.array()[[1, 2, 0]], 4.0);
    }
}
