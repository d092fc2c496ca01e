// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-vertex tensor fields over unstructured meshes.
//!
//! A [`TensorField`] stores one rank-`r` tensor per mesh vertex together with a
//! trailing feature axis, i.e. an array of shape
//! `[n_vertices, dim, ..., dim, n_features]` with `r` spatial axes. Rank is
//! implied by the shape, so a scalar field is two dimensional and a vector
//! field three dimensional. Everything is plain `ndarray` on the CPU; no
//! gradient tape is kept.

pub mod sparse;
pub mod support;

use ndarray::{Array2, ArrayD, ArrayView1, ArrayViewD, Axis, Dimension, IxDyn, Slice};
use serde::{Deserialize, Serialize};

/// Result alias used throughout the mesh stack.
pub type PureResult<T> = Result<T, TensorError>;

/// Coarse classification of [`TensorError`] variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Raised while building or validating a block; never recoverable.
    Configuration,
    /// Numeric input outside the domain of a transform.
    Domain,
    /// Unknown activation, operator or parameter name.
    Lookup,
    /// Incompatible array shapes.
    Shape,
    /// Persistence failures.
    Io,
}

/// Errors emitted by tensor fields, settings and propagation blocks.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TensorError {
    #[error("tensor field needs a vertex and a feature axis, got shape {shape:?}")]
    InvalidRank { shape: Vec<usize> },
    #[error("data length {got} does not match shape volume {expected}")]
    DataLength { expected: usize, got: usize },
    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },
    #[error("{0} received an empty input")]
    EmptyInput(&'static str),
    #[error("invalid value for {label}")]
    InvalidValue { label: &'static str },
    #[error("{operation} needs a tensor of rank >= {required}, got rank {rank}")]
    RankUnderflow {
        operation: &'static str,
        rank: usize,
        required: usize,
    },
    #[error("{label}: input range [{min}, {max}] not in [{lower}, {upper}]")]
    OutOfDomain {
        label: &'static str,
        min: f32,
        max: f32,
        lower: f32,
        upper: f32,
    },
    #[error("{expected} supports expected (actual: {got}) for {context}")]
    SupportLength {
        expected: usize,
        got: usize,
        context: String,
    },
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },
    #[error("missing option '{option}' for {context}")]
    MissingOption {
        option: &'static str,
        context: String,
    },
    #[error("can't convert {found} to {expected} for {field}")]
    TypeCoercion {
        field: String,
        expected: &'static str,
        found: String,
    },
    #[error("unknown activation: {0}")]
    UnknownActivation(String),
    #[error("unexpected propagation method: {0}")]
    UnknownPropagation(String),
    #[error("group shapes are keyed by input name; specify dict_key in the block options")]
    KeyedGroupShapes,
    #[error("parameter {name} missing from state dict")]
    MissingParameter { name: String },
    #[error("layout error: {message}")]
    Layout { message: String },
    #[error("i/o error: {message}")]
    IoError { message: String },
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl TensorError {
    /// Shorthand for [`TensorError::InvalidConfiguration`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfiguration { .. }
            | Self::MissingOption { .. }
            | Self::TypeCoercion { .. }
            | Self::SupportLength { .. }
            | Self::InvalidValue { .. } => ErrorKind::Configuration,
            Self::OutOfDomain { .. } | Self::RankUnderflow { .. } => ErrorKind::Domain,
            Self::UnknownActivation(_)
            | Self::UnknownPropagation(_)
            | Self::KeyedGroupShapes
            | Self::MissingParameter { .. } => ErrorKind::Lookup,
            Self::InvalidRank { .. }
            | Self::DataLength { .. }
            | Self::ShapeMismatch { .. }
            | Self::EmptyInput(_)
            | Self::Layout { .. } => ErrorKind::Shape,
            Self::IoError { .. } | Self::SerializationError { .. } => ErrorKind::Io,
        }
    }
}

impl From<ndarray::ShapeError> for TensorError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Layout {
            message: err.to_string(),
        }
    }
}

/// Rank-`r` tensor per vertex plus a feature axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorField {
    data: ArrayD<f32>,
}

impl TensorField {
    /// Wraps an array of shape `[n_vertices, dim.., n_features]`.
    pub fn from_array(data: ArrayD<f32>) -> PureResult<Self> {
        if data.ndim() < 2 {
            return Err(TensorError::InvalidRank {
                shape: data.shape().to_vec(),
            });
        }
        Ok(Self { data })
    }

    /// Builds a field from row-major data.
    pub fn from_shape_vec(shape: &[usize], data: Vec<f32>) -> PureResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Self::from_array(ArrayD::from_shape_vec(IxDyn(shape), data)?)
    }

    pub fn zeros(shape: &[usize]) -> PureResult<Self> {
        Self::from_array(ArrayD::zeros(IxDyn(shape)))
    }

    /// Builds a field by evaluating `f` at every multi-index.
    pub fn from_fn<F>(shape: &[usize], mut f: F) -> PureResult<Self>
    where
        F: FnMut(&[usize]) -> f32,
    {
        Self::from_array(ArrayD::from_shape_fn(IxDyn(shape), |idx| f(idx.slice())))
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of spatial axes.
    pub fn rank(&self) -> usize {
        self.data.ndim() - 2
    }

    pub fn n_vertices(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn n_features(&self) -> usize {
        self.data.shape()[self.data.ndim() - 1]
    }

    /// Common extent of the spatial axes, `None` for scalar fields.
    pub fn spatial_dim(&self) -> PureResult<Option<usize>> {
        let shape = self.shape();
        let spatial = &shape[1..shape.len() - 1];
        match spatial.first() {
            None => Ok(None),
            Some(&dim) if spatial.iter().all(|&d| d == dim) => Ok(Some(dim)),
            Some(_) => Err(TensorError::InvalidValue {
                label: "spatial_axes",
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn array(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn array_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.data
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.data.view()
    }

    pub fn into_array(self) -> ArrayD<f32> {
        self.data
    }

    /// Applies `f` elementwise.
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f32) -> f32,
    {
        Self {
            data: self.data.mapv(f),
        }
    }

    pub fn add(&self, other: &TensorField) -> PureResult<Self> {
        self.guard_same_shape(other)?;
        Ok(Self {
            data: &self.data + &other.data,
        })
    }

    pub fn sub(&self, other: &TensorField) -> PureResult<Self> {
        self.guard_same_shape(other)?;
        Ok(Self {
            data: &self.data - &other.data,
        })
    }

    pub fn hadamard(&self, other: &TensorField) -> PureResult<Self> {
        self.guard_same_shape(other)?;
        Ok(Self {
            data: &self.data * &other.data,
        })
    }

    pub fn scale(&self, value: f32) -> Self {
        Self {
            data: &self.data * value,
        }
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &TensorField, scale: f32) -> PureResult<()> {
        self.guard_same_shape(other)?;
        self.data.scaled_add(scale, &other.data);
        Ok(())
    }

    pub fn min_value(&self) -> Option<f32> {
        self.data.iter().copied().reduce(f32::min)
    }

    pub fn max_value(&self) -> Option<f32> {
        self.data.iter().copied().reduce(f32::max)
    }

    /// Applies `x W + b` along the feature axis, leaving the vertex and
    /// spatial axes untouched. `weight` is `(in_features, out_features)`.
    pub fn map_features(
        &self,
        weight: &Array2<f32>,
        bias: Option<ArrayView1<'_, f32>>,
    ) -> PureResult<Self> {
        let (in_features, out_features) = weight.dim();
        if self.n_features() != in_features {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: vec![in_features, out_features],
            });
        }
        let rows = self.len() / in_features.max(1);
        let flat = self
            .data
            .as_standard_layout()
            .into_owned()
            .into_shape((rows, in_features))?;
        let mut out = flat.dot(weight);
        if let Some(bias) = bias {
            if bias.len() != out_features {
                return Err(TensorError::ShapeMismatch {
                    left: vec![bias.len()],
                    right: vec![out_features],
                });
            }
            out += &bias;
        }
        let mut shape = self.shape().to_vec();
        let last = shape.len() - 1;
        shape[last] = out_features;
        Self::from_array(out.into_shape(IxDyn(&shape))?)
    }

    /// Multiplies every tensor component by a per-vertex, per-feature
    /// coefficient: `out[i, .., f] = self[i, .., f] * coeff[i, f]`.
    pub fn gate_features(&self, coeff: &Array2<f32>) -> PureResult<Self> {
        let (n, f) = coeff.dim();
        if n != self.n_vertices() || f != self.n_features() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: vec![n, f],
            });
        }
        let mut gate_shape = vec![1; self.data.ndim()];
        gate_shape[0] = n;
        gate_shape[self.data.ndim() - 1] = f;
        let gate = coeff
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&gate_shape))?;
        let Some(gate) = gate.broadcast(self.data.raw_dim()) else {
            return Err(TensorError::ShapeMismatch {
                left: gate_shape,
                right: self.shape().to_vec(),
            });
        };
        Ok(Self {
            data: &self.data * &gate,
        })
    }

    /// Swaps the two trailing spatial axes. Requires rank >= 2.
    pub fn transpose_trailing(&self) -> PureResult<Self> {
        let rank = self.rank();
        if rank < 2 {
            return Err(TensorError::RankUnderflow {
                operation: "transpose_trailing",
                rank,
                required: 2,
            });
        }
        let ndim = self.data.ndim();
        let mut view = self.data.view();
        view.swap_axes(ndim - 3, ndim - 2);
        Ok(Self {
            data: view.as_standard_layout().into_owned(),
        })
    }

    /// Selects `index` along `axis`, dropping that axis.
    pub fn index_axis(&self, axis: usize, index: usize) -> PureResult<Self> {
        self.guard_axis(axis)?;
        if index >= self.shape()[axis] {
            return Err(TensorError::InvalidValue { label: "axis_index" });
        }
        Self::from_array(self.data.index_axis(Axis(axis), index).to_owned())
    }

    /// Splits `axis` into contiguous runs of the given sizes.
    pub fn split_axis(&self, axis: usize, sizes: &[usize]) -> PureResult<Vec<Self>> {
        self.guard_axis(axis)?;
        let total: usize = sizes.iter().sum();
        if total != self.shape()[axis] {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: sizes.to_vec(),
            });
        }
        let mut start = 0usize;
        let mut parts = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let end = start + size;
            let part = self
                .data
                .slice_axis(Axis(axis), Slice::from(start..end))
                .to_owned();
            parts.push(Self { data: part });
            start = end;
        }
        Ok(parts)
    }

    /// Stacks fields along a new `axis`.
    pub fn stack(axis: usize, fields: &[TensorField]) -> PureResult<Self> {
        if fields.is_empty() {
            return Err(TensorError::EmptyInput("tensor_field_stack"));
        }
        let views: Vec<ArrayViewD<'_, f32>> = fields.iter().map(|f| f.data.view()).collect();
        Self::from_array(ndarray::stack(Axis(axis), &views)?)
    }

    /// Joins fields along an existing `axis`.
    pub fn concatenate(axis: usize, fields: &[TensorField]) -> PureResult<Self> {
        if fields.is_empty() {
            return Err(TensorError::EmptyInput("tensor_field_concatenate"));
        }
        let views: Vec<ArrayViewD<'_, f32>> = fields.iter().map(|f| f.data.view()).collect();
        Self::from_array(ndarray::concatenate(Axis(axis), &views)?)
    }

    fn guard_axis(&self, axis: usize) -> PureResult<()> {
        if axis >= self.data.ndim() {
            return Err(TensorError::InvalidValue { label: "axis" });
        }
        Ok(())
    }

    fn guard_same_shape(&self, other: &TensorField) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: other.shape().to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn rank_is_implied_by_shape() {
        let scalar = TensorField::zeros(&[4, 2]).unwrap();
        let vector = TensorField::zeros(&[4, 3, 2]).unwrap();
        let matrix = TensorField::zeros(&[4, 3, 3, 2]).unwrap();
        assert_eq!(scalar.rank(), 0);
        assert_eq!(vector.rank(), 1);
        assert_eq!(matrix.rank(), 2);
        assert_eq!(matrix.spatial_dim().unwrap(), Some(3));
        assert_eq!(scalar.spatial_dim().unwrap(), None);
        assert!(TensorField::zeros(&[4]).is_err());
    }

    #[test]
    fn from_shape_vec_checks_volume() {
        let err = TensorField::from_shape_vec(&[2, 2], vec![1.0; 3]).unwrap_err();
        assert_eq!(err, TensorError::DataLength { expected: 4, got: 3 });
    }

    #[test]
    fn map_features_acts_on_last_axis_only() {
        let field = TensorField::from_shape_vec(&[1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let weight = arr2(&[[1.0, 0.0, 1.0], [0.0, 1.0, 1.0]]);
        let bias = arr1(&[0.5, 0.0, 0.0]);
        let out = field.map_features(&weight, Some(bias.view())).unwrap();
        assert_eq!(out.shape(), &[1, 2, 3]);
        let values: Vec<f32> = out.array().iter().copied().collect();
        assert_eq!(values, vec![1.5, 2.0, 3.0, 3.5, 4.0, 7.0]);
    }

    #[test]
    fn gate_features_broadcasts_over_spatial_axes() {
        let field = TensorField::from_fn(&[2, 3, 1], |idx| (idx[0] * 3 + idx[1]) as f32).unwrap();
        let coeff = arr2(&[[2.0], [-1.0]]);
        let out = field.gate_features(&coeff).unwrap();
        let values: Vec<f32> = out.array().iter().copied().collect();
        assert_eq!(values, vec![0.0, 2.0, 4.0, -3.0, -4.0, -5.0]);
    }

    #[test]
    fn transpose_trailing_swaps_last_spatial_pair() {
        let field = TensorField::from_fn(&[1, 2, 2, 1], |idx| (idx[1] * 10 + idx[2]) as f32).unwrap();
        let t = field.transpose_trailing().unwrap();
        assert_eq!(t.array()[[0, 0, 1, 0]], 10.0);
        assert_eq!(t.array()[[0, 1, 0, 0]], 1.0);
        let vector = TensorField::zeros(&[1, 3, 1]).unwrap();
        assert!(matches!(
            vector.transpose_trailing(),
            Err(TensorError::RankUnderflow { .. })
        ));
    }

    #[test]
    fn split_then_concatenate_restores_field() {
        let field = TensorField::from_fn(&[5, 2], |idx| idx[0] as f32).unwrap();
        let parts = field.split_axis(0, &[2, 3]).unwrap();
        assert_eq!(parts[0].shape(), &[2, 2]);
        assert_eq!(parts[1].shape(), &[3, 2]);
        let joined = TensorField::concatenate(0, &parts).unwrap();
        assert_eq!(joined, field);
        assert!(field.split_axis(0, &[2, 2]).is_err());
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(
            TensorError::config("bad").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            TensorError::UnknownActivation("x".into()).kind(),
            ErrorKind::Lookup
        );
        let domain = TensorError::OutOfDomain {
            label: "atanh",
            min: -2.0,
            max: 0.0,
            lower: -1.0,
            upper: 1.0,
        };
        assert_eq!(domain.kind(), ErrorKind::Domain);
    }
}
