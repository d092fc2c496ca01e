// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Sparse tensor propagation over mesh supports.
//!
//! A support set holds one directional operator `G_k` per spatial axis (for
//! instance the components of a discrete gradient). With `x` a rank-`r`
//! field of shape `[n, dim.., f]`:
//!
//! * convolution: `h[i, k, a.., f] = sum_j G_k[i, j] x[j, a.., f]`, rank `r + 1`
//! * tensor product: same sum, new axis placed last, rank `r + 1`
//! * contraction: `h[i, a.., f] = sum_k sum_j G_k[i, j] x[j, k, a.., f]`, rank `r - 1`
//! * rotation: discrete curl on the leading spatial axis, rank `r`

use crate::{PureResult, SupportSet, TensorError, TensorField};
use ndarray::Axis;
use std::fmt;
use std::str::FromStr;

/// Operator applied by one propagation step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Propagation {
    Convolution,
    Contraction,
    TensorProduct,
    Rotation,
}

impl Propagation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Convolution => "convolution",
            Self::Contraction => "contraction",
            Self::TensorProduct => "tensor_product",
            Self::Rotation => "rotation",
        }
    }

    /// Rank after applying the step to a rank-`input_rank` field.
    pub fn output_rank(&self, input_rank: usize) -> PureResult<usize> {
        match self {
            Self::Convolution | Self::TensorProduct => Ok(input_rank + 1),
            Self::Rotation => require_rank("rotation", input_rank, 1).map(|_| input_rank),
            Self::Contraction => {
                require_rank("contraction", input_rank, 1).map(|_| input_rank - 1)
            }
        }
    }

    pub fn apply(&self, x: &TensorField, supports: &SupportSet) -> PureResult<TensorField> {
        match self {
            Self::Convolution => convolution(x, supports),
            Self::Contraction => contraction(x, supports),
            Self::TensorProduct => tensor_product(x, supports),
            Self::Rotation => rotation(x, supports),
        }
    }
}

impl FromStr for Propagation {
    type Err = TensorError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim() {
            "convolution" => Ok(Self::Convolution),
            "contraction" => Ok(Self::Contraction),
            "tensor_product" => Ok(Self::TensorProduct),
            "rotation" => Ok(Self::Rotation),
            other => Err(TensorError::UnknownPropagation(other.to_string())),
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn require_rank(operation: &'static str, rank: usize, required: usize) -> PureResult<()> {
    if rank < required {
        return Err(TensorError::RankUnderflow {
            operation,
            rank,
            required,
        });
    }
    Ok(())
}

fn guard_supports(x: &TensorField, supports: &SupportSet) -> PureResult<()> {
    if x.n_vertices() != supports.n_vertices() {
        return Err(TensorError::ShapeMismatch {
            left: x.shape().to_vec(),
            right: vec![supports.n_vertices(), supports.n_vertices()],
        });
    }
    if let Some(dim) = x.spatial_dim()? {
        if dim != supports.len() {
            return Err(TensorError::SupportLength {
                expected: dim,
                got: supports.len(),
                context: format!("rank-{} field", x.rank()),
            });
        }
    }
    Ok(())
}

fn propagate_each(x: &TensorField, supports: &SupportSet) -> PureResult<Vec<TensorField>> {
    supports.iter().map(|g| g.spmm_field(x)).collect()
}

/// Raises rank by one, inserting the support direction as the leading
/// spatial axis.
pub fn convolution(x: &TensorField, supports: &SupportSet) -> PureResult<TensorField> {
    guard_supports(x, supports)?;
    TensorField::stack(1, &propagate_each(x, supports)?)
}

/// Raises rank by one, appending the support direction as the trailing
/// spatial axis.
pub fn tensor_product(x: &TensorField, supports: &SupportSet) -> PureResult<TensorField> {
    guard_supports(x, supports)?;
    let axis = x.shape().len() - 1;
    TensorField::stack(axis, &propagate_each(x, supports)?)
}

/// Lowers rank by one, tracing the leading spatial axis against the
/// support direction (a discrete divergence for rank 1).
pub fn contraction(x: &TensorField, supports: &SupportSet) -> PureResult<TensorField> {
    require_rank("contraction", x.rank(), 1)?;
    guard_supports(x, supports)?;
    let mut acc: Option<TensorField> = None;
    for (k, g) in supports.iter().enumerate() {
        let term = g.spmm_field(&x.index_axis(1, k)?)?;
        match acc.as_mut() {
            Some(sum) => sum.add_scaled(&term, 1.0)?,
            None => acc = Some(term),
        }
    }
    acc.ok_or(TensorError::EmptyInput("contraction"))
}

/// Discrete curl over the leading spatial axis; needs three supports.
pub fn rotation(x: &TensorField, supports: &SupportSet) -> PureResult<TensorField> {
    require_rank("rotation", x.rank(), 1)?;
    if supports.len() != 3 {
        return Err(TensorError::SupportLength {
            expected: 3,
            got: supports.len(),
            context: "rotation".to_string(),
        });
    }
    guard_supports(x, supports)?;
    let g = supports.as_slice();
    let component = |m: usize| x.index_axis(1, m);
    let (x0, x1, x2) = (component(0)?, component(1)?, component(2)?);
    let curl = |gl: usize, xm: &TensorField, gm: usize, xl: &TensorField| {
        g[gl].spmm_field(xm)?.sub(&g[gm].spmm_field(xl)?)
    };
    let parts = [
        curl(1, &x2, 2, &x1)?,
        curl(2, &x0, 0, &x2)?,
        curl(0, &x1, 1, &x0)?,
    ];
    TensorField::stack(1, &parts)
}

/// Rank-0 invariant `c[i, f] = sum over spatial axes of x^2`. Scalars pass
/// through.
pub fn contract_self(x: &TensorField) -> PureResult<TensorField> {
    let mut squared = x.array().mapv(|v| v * v);
    for _ in 0..x.rank() {
        squared = squared.sum_axis(Axis(1));
    }
    TensorField::from_array(squared)
}

/// Ordered propagation steps and the scale applied after each one.
#[derive(Clone, Debug, PartialEq)]
pub struct PropagationPlan {
    steps: Vec<Propagation>,
    factor: f32,
}

impl PropagationPlan {
    pub fn new(steps: Vec<Propagation>, factor: f32) -> Self {
        Self { steps, factor }
    }

    pub fn steps(&self) -> &[Propagation] {
        &self.steps
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn n_contractions(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Propagation::Contraction))
            .count()
    }

    /// `input_rank - n_contractions + n_rank_raising`; may be negative.
    pub fn estimated_output_rank(&self, input_rank: usize) -> isize {
        let raising = self
            .steps
            .iter()
            .filter(|s| matches!(s, Propagation::Convolution | Propagation::TensorProduct))
            .count();
        input_rank as isize - self.n_contractions() as isize + raising as isize
    }

    /// Exact rank after every step, failing as soon as one would underflow.
    pub fn output_rank(&self, input_rank: usize) -> PureResult<usize> {
        self.steps
            .iter()
            .try_fold(input_rank, |rank, step| step.output_rank(rank))
    }

    pub fn apply(&self, x: &TensorField, supports: &SupportSet) -> PureResult<TensorField> {
        let mut h = x.clone();
        for step in &self.steps {
            h = step.apply(&h, supports)?.scale(self.factor);
        }
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SparseMatrix;
    use approx::assert_abs_diff_eq;

    // Path graph 0-1-2 with forward differences along each axis, scaled per
    // axis so the directions are distinguishable.
    fn supports() -> SupportSet {
        let diff = |scale: f32| {
            SparseMatrix::from_triplets(
                3,
                3,
                &[
                    (0, 0, -scale),
                    (0, 1, scale),
                    (1, 1, -scale),
                    (1, 2, scale),
                    (2, 2, 0.0),
                ],
            )
            .unwrap()
        };
        SupportSet::new(vec![diff(1.0), diff(2.0), diff(3.0)]).unwrap()
    }

    fn scalar() -> TensorField {
        TensorField::from_shape_vec(&[3, 1], vec![1.0, 4.0, 9.0]).unwrap()
    }

    #[test]
    fn convolution_adds_leading_axis() {
        let h = convolution(&scalar(), &supports()).unwrap();
        assert_eq!(h.shape(), &[3, 3, 1]);
        assert_eq!(h.array()[[0, 0, 0]], 3.0);
        assert_eq!(h.array()[[1, 2, 0]], 15.0);
    }

    #[test]
    fn tensor_product_appends_trailing_axis() {
        let v = convolution(&scalar(), &supports()).unwrap();
        let t = tensor_product(&v, &supports()).unwrap();
        assert_eq!(t.shape(), &[3, 3, 3, 1]);
        let c = convolution(&v, &supports()).unwrap();
        // the two differ only by the order of the spatial axes
        assert_eq!(t.transpose_trailing().unwrap(), c);
    }

    #[test]
    fn contraction_traces_leading_axis() {
        let v = convolution(&scalar(), &supports()).unwrap();
        let d = contraction(&v, &supports()).unwrap();
        assert_eq!(d.shape(), &[3, 1]);
        // sum_k G_k G_k x with G_k = k * D
        let dx = [3.0f32, 5.0, 0.0];
        let ddx = [dx[1] - dx[0], dx[2] - dx[1], 0.0];
        for i in 0..3 {
            assert_abs_diff_eq!(d.array()[[i, 0]], 14.0 * ddx[i], epsilon = 1e-5);
        }
        assert!(matches!(
            contraction(&scalar(), &supports()),
            Err(TensorError::RankUnderflow { .. })
        ));
    }

    #[test]
    fn rotation_of_a_gradient_vanishes() {
        let grad = convolution(&scalar(), &supports()).unwrap();
        let curl = rotation(&grad, &supports()).unwrap();
        assert_eq!(curl.shape(), grad.shape());
        assert!(curl.array().iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn plans_track_rank_and_scale() {
        let plan = PropagationPlan::new(
            vec![Propagation::Convolution, Propagation::Contraction],
            0.5,
        );
        assert_eq!(plan.output_rank(0).unwrap(), 0);
        assert_eq!(plan.estimated_output_rank(0), 0);
        let h = plan.apply(&scalar(), &supports()).unwrap();
        let unscaled = contraction(&convolution(&scalar(), &supports()).unwrap(), &supports())
            .unwrap();
        assert_eq!(h, unscaled.scale(0.25));

        let contractions = PropagationPlan::new(vec![Propagation::Contraction; 3], 1.0);
        assert_eq!(contractions.output_rank(3).unwrap(), 0);
        assert_eq!(contractions.estimated_output_rank(2), -1);
        assert!(contractions.output_rank(2).is_err());
    }

    #[test]
    fn mismatched_supports_fail() {
        let two = SupportSet::new(supports().as_slice()[..2].to_vec()).unwrap();
        let v = convolution(&scalar(), &supports()).unwrap();
        assert!(matches!(
            contraction(&v, &two),
            Err(TensorError::SupportLength { .. })
        ));
        assert!("divergence".parse::<Propagation>().is_err());
    }

    #[test]
    fn self_contraction_sums_squares() {
        let v = TensorField::from_shape_vec(&[1, 3, 1], vec![1.0, 2.0, 2.0]).unwrap();
        let c = contract_self(&v).unwrap();
        assert_eq!(c.shape(), &[1, 1]);
        assert_eq!(c.array()[[0, 0]], 9.0);
    }
}
