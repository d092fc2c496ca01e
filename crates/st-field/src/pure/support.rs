// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::sparse::SparseMatrix;
use super::{PureResult, TensorError};
use std::sync::Arc;

/// Ordered directional operators over one mesh, one matrix per spatial
/// axis combination (`dim^support_tensor_rank` of them). Clones share the
/// underlying matrices.
#[derive(Clone, Debug, PartialEq)]
pub struct SupportSet {
    matrices: Arc<[SparseMatrix]>,
}

impl SupportSet {
    /// Wraps square matrices that all act on the same vertex count.
    pub fn new(matrices: Vec<SparseMatrix>) -> PureResult<Self> {
        let Some(first) = matrices.first() else {
            return Err(TensorError::EmptyInput("support_set"));
        };
        let shape = first.shape();
        for matrix in &matrices {
            if !matrix.is_square() || matrix.shape() != shape {
                return Err(TensorError::ShapeMismatch {
                    left: vec![shape.0, shape.1],
                    right: vec![matrix.shape().0, matrix.shape().1],
                });
            }
        }
        Ok(Self {
            matrices: matrices.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    pub fn n_vertices(&self) -> usize {
        self.matrices[0].shape().0
    }

    pub fn get(&self, index: usize) -> Option<&SparseMatrix> {
        self.matrices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SparseMatrix> {
        self.matrices.iter()
    }

    pub fn as_slice(&self) -> &[SparseMatrix] {
        &self.matrices
    }

    /// `dim^support_tensor_rank`.
    pub fn expected_len(dim: usize, support_tensor_rank: usize) -> usize {
        dim.pow(support_tensor_rank as u32)
    }

    /// Fails unless the set holds exactly `dim^support_tensor_rank` matrices.
    pub fn ensure_len(
        &self,
        dim: usize,
        support_tensor_rank: usize,
        context: &str,
    ) -> PureResult<()> {
        Self::ensure_count(self.len(), dim, support_tensor_rank, context)
    }

    /// Same check for a support count known ahead of the set itself.
    pub fn ensure_count(
        count: usize,
        dim: usize,
        support_tensor_rank: usize,
        context: &str,
    ) -> PureResult<()> {
        let expected = Self::expected_len(dim, support_tensor_rank);
        if count != expected {
            return Err(TensorError::SupportLength {
                expected,
                got: count,
                context: context.to_string(),
            });
        }
        Ok(())
    }
}
