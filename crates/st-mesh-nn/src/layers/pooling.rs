// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Segment reductions over concatenated sub-meshes.
//!
//! When several graphs are concatenated into one field, the per-graph sizes
//! ("group shapes") say where each run starts. Shapes of length one split the
//! vertex axis; shapes of length two split axis 1 (time-series layouts).

use crate::{PureResult, TensorError, TensorField};
use ndarray::{ArrayD, ArrayViewD, Axis};
use std::collections::BTreeMap;

/// Original shapes of the concatenated groups.
#[derive(Clone, Debug, PartialEq)]
pub enum GroupShapes {
    Flat(Vec<Vec<usize>>),
    /// Shapes per named input; a key is needed to pick one list.
    Keyed(BTreeMap<String, Vec<Vec<usize>>>),
}

impl GroupShapes {
    /// Vertex-axis groups with the given sizes.
    pub fn vertex_groups(sizes: &[usize]) -> Self {
        Self::Flat(sizes.iter().map(|&s| vec![s]).collect())
    }

    /// Resolves the flat list, consulting `key` for keyed shapes.
    pub fn select(&self, key: Option<&str>) -> PureResult<&[Vec<usize>]> {
        match (self, key) {
            (Self::Flat(shapes), None) => Ok(shapes),
            (Self::Flat(_), Some(key)) => Err(TensorError::config(format!(
                "dict_key '{key}' given but group shapes are not keyed"
            ))),
            (Self::Keyed(_), None) => Err(TensorError::KeyedGroupShapes),
            (Self::Keyed(map), Some(key)) => {
                map.get(key).map(Vec::as_slice).ok_or_else(|| {
                    TensorError::config(format!("no group shapes recorded for '{key}'"))
                })
            }
        }
    }

    pub fn as_flat(&self) -> PureResult<&[Vec<usize>]> {
        self.select(None)
    }
}

/// Axis the groups are laid out along (`len(shape) - 1`).
pub fn group_axis(shapes: &[Vec<usize>]) -> PureResult<usize> {
    match shapes.first().map(Vec::len) {
        Some(1) => Ok(0),
        Some(2) => Ok(1),
        Some(_) => Err(TensorError::config(format!(
            "unexpected group shapes: {shapes:?}"
        ))),
        None => Err(TensorError::EmptyInput("group_shapes")),
    }
}

fn group_sizes(shapes: &[Vec<usize>], axis: usize) -> PureResult<Vec<usize>> {
    shapes
        .iter()
        .map(|shape| {
            if shape.len() != axis + 1 {
                return Err(TensorError::config(format!(
                    "unexpected group shapes: {shapes:?}"
                )));
            }
            Ok(shape[axis])
        })
        .collect()
}

/// Splits `x` into its groups. A single group returns the whole field.
pub fn split_groups(x: &TensorField, shapes: &[Vec<usize>]) -> PureResult<Vec<TensorField>> {
    if shapes.is_empty() {
        return Err(TensorError::EmptyInput("group_shapes"));
    }
    if shapes.len() == 1 {
        return Ok(vec![x.clone()]);
    }
    let axis = group_axis(shapes)?;
    let sizes = group_sizes(shapes, axis)?;
    x.split_axis(axis, &sizes)
}

/// [`split_groups`] for possibly keyed shapes; keyed shapes are rejected.
pub fn split(x: &TensorField, shapes: &GroupShapes) -> PureResult<Vec<TensorField>> {
    split_groups(x, shapes.as_flat()?)
}

/// Per-group reduction used by the pooling activations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reduction {
    Max,
    Mean,
    Min,
}

impl Reduction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::Mean => "mean",
            Self::Min => "min",
        }
    }

    fn reduce(&self, part: ArrayViewD<'_, f32>, axis: Axis) -> PureResult<ArrayD<f32>> {
        if part.len_of(axis) == 0 {
            return Err(TensorError::EmptyInput("segment_reduction"));
        }
        Ok(match self {
            Self::Max => part.fold_axis(axis, f32::NEG_INFINITY, |&acc, &v| acc.max(v)),
            Self::Min => part.fold_axis(axis, f32::INFINITY, |&acc, &v| acc.min(v)),
            Self::Mean => part
                .mean_axis(axis)
                .ok_or(TensorError::EmptyInput("segment_mean"))?,
        })
    }

    /// Reduces every group along the group axis and stacks the results in
    /// group order, so the output holds one row per group.
    pub fn apply_groups(&self, x: &TensorField, shapes: &[Vec<usize>]) -> PureResult<TensorField> {
        let axis = group_axis(shapes)?;
        let parts = split_groups(x, shapes)?;
        let reduced = parts
            .iter()
            .map(|part| self.reduce(part.view(), Axis(axis)))
            .collect::<PureResult<Vec<_>>>()?;
        let views: Vec<_> = reduced.iter().map(|r| r.view()).collect();
        TensorField::from_array(ndarray::stack(Axis(axis), &views)?)
    }

    pub fn apply(&self, x: &TensorField, shapes: &GroupShapes) -> PureResult<TensorField> {
        self.apply_groups(x, shapes.as_flat()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(values: &[f32]) -> TensorField {
        TensorField::from_shape_vec(&[values.len(), 1], values.to_vec()).unwrap()
    }

    #[test]
    fn max_over_three_groups() {
        let x = rows(&[1.0, 5.0, 2.0, -1.0, -3.0, 0.0, 7.0, 4.0, 4.0]);
        let shapes = GroupShapes::vertex_groups(&[3, 2, 4]);
        let out = Reduction::Max.apply(&x, &shapes).unwrap();
        assert_eq!(out.shape(), &[3, 1]);
        assert_eq!(out.array().iter().copied().collect::<Vec<_>>(), vec![5.0, -1.0, 7.0]);

        let out = Reduction::Min.apply(&x, &shapes).unwrap();
        assert_eq!(out.array().iter().copied().collect::<Vec<_>>(), vec![1.0, -3.0, 0.0]);
    }

    #[test]
    fn single_group_reduces_whole_field() {
        let x = rows(&[1.0, 2.0, 3.0]);
        let out = Reduction::Mean
            .apply(&x, &GroupShapes::vertex_groups(&[3]))
            .unwrap();
        assert_eq!(out.shape(), &[1, 1]);
        assert_eq!(out.array()[[0, 0]], 2.0);
    }

    #[test]
    fn second_axis_groups() {
        let x = TensorField::from_fn(&[2, 5, 1], |idx| (idx[0] * 10 + idx[1]) as f32).unwrap();
        let shapes = GroupShapes::Flat(vec![vec![2, 2], vec![2, 3]]);
        let out = Reduction::Max.apply(&x, &shapes).unwrap();
        assert_eq!(out.shape(), &[2, 2, 1]);
        assert_eq!(out.array()[[0, 0, 0]], 1.0);
        assert_eq!(out.array()[[1, 1, 0]], 14.0);
    }

    #[test]
    fn keyed_shapes_need_a_key() {
        let mut map = BTreeMap::new();
        map.insert("nodal".to_string(), vec![vec![2], vec![1]]);
        let shapes = GroupShapes::Keyed(map);
        let x = rows(&[1.0, 2.0, 3.0]);
        assert_eq!(split(&x, &shapes).unwrap_err(), TensorError::KeyedGroupShapes);
        assert_eq!(shapes.select(Some("nodal")).unwrap().len(), 2);
        assert!(shapes.select(Some("elemental")).is_err());
    }

    #[test]
    fn malformed_shapes_are_rejected() {
        let x = TensorField::zeros(&[4, 2, 2, 1]).unwrap();
        let shapes = GroupShapes::Flat(vec![vec![2, 1, 1], vec![2, 1, 1]]);
        assert!(split(&x, &shapes).is_err());
        let mixed = GroupShapes::Flat(vec![vec![2], vec![1, 1]]);
        assert!(split(&rows(&[1.0, 2.0, 3.0]), &mixed).is_err());
    }
}
