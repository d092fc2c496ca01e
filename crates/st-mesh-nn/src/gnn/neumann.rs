// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Neumann boundary injection for gradient-like blocks.
//!
//! Boundary vertices carry a directed flux `D` (shape of the propagated
//! field, before the feature map) and an inverted moment tensor `M` of shape
//! `[n, dim, dim, 1]`. The injected term is
//! `neumann[i, k, .., f] = sum_l M[i, k, l] * lin(D)[i, l, .., f] * factor`.

use crate::layers::Linear;
use crate::module::{Module, Parameter, Parameterised};
use crate::setting::BlockSetting;
use crate::{PureResult, TensorError, TensorField};
use ndarray::{s, Array2, Array3, IxDyn};
use tracing::info;

/// Extra inputs consumed by a block in boundary mode.
#[derive(Clone, Debug, PartialEq)]
pub struct NeumannContext {
    pub directed_neumann: TensorField,
    pub inversed_moment_tensors: TensorField,
}

impl NeumannContext {
    pub fn new(directed_neumann: TensorField, inversed_moment_tensors: TensorField) -> Self {
        Self {
            directed_neumann,
            inversed_moment_tensors,
        }
    }
}

/// Maps the directed flux into the block's feature space.
#[derive(Debug)]
enum NeumannLinear {
    /// Reuses the block's subchain weight (identity when there is none).
    Shared,
    Own(Linear),
}

#[derive(Debug)]
pub struct NeumannInjection {
    linear: NeumannLinear,
    factor: f32,
    ratio: Option<Parameter>,
}

impl NeumannInjection {
    /// `shared` is the block's subchain weight; it must be bias-free unless a
    /// dedicated linear map is requested.
    pub fn new(setting: &BlockSetting, shared: Option<&Linear>) -> PureResult<Self> {
        let options = &setting.optional;
        let linear = if options.create_neumann_linear {
            let nodes = setting.resolved_nodes()?;
            let (Some(&input), Some(&output)) = (nodes.first(), nodes.last()) else {
                return Err(TensorError::config(format!(
                    "{}: nodes is empty, cannot size the Neumann linear",
                    setting.name
                )));
            };
            NeumannLinear::Own(Linear::init(
                format!("{}::neumann_linear", setting.name),
                input,
                output,
                false,
            )?)
        } else {
            if shared.map_or(false, Linear::has_bias) {
                return Err(TensorError::config(format!(
                    "{}: blocks with Neumann injection should have no bias",
                    setting.name
                )));
            }
            NeumannLinear::Shared
        };
        let ratio = options.create_neumann_ratio.then(|| {
            Parameter::new(
                format!("{}::neumann_ratio", setting.name),
                Array2::zeros((1, 1)),
            )
        });
        info!(
            block = %setting.name,
            factor = options.neumann_factor,
            ratio = ratio.is_some(),
            "neumann injection enabled"
        );
        Ok(Self {
            linear,
            factor: options.neumann_factor,
            ratio,
        })
    }

    pub fn has_ratio(&self) -> bool {
        self.ratio.is_some()
    }

    /// Current `sigmoid(w)` mixing weight, if a ratio is learned.
    pub fn ratio(&self) -> Option<f32> {
        self.ratio
            .as_ref()
            .map(|w| 1.0 / (1.0 + (-w.value()[[0, 0]]).exp()))
    }

    fn project(&self, directed: &TensorField, shared: Option<&Linear>) -> PureResult<TensorField> {
        match (&self.linear, shared) {
            (NeumannLinear::Own(linear), _) => linear.forward(directed),
            (NeumannLinear::Shared, Some(linear)) => linear.forward(directed),
            (NeumannLinear::Shared, None) => Ok(directed.clone()),
        }
    }

    /// Boundary term for `ctx`, before it is mixed into the propagated field.
    pub fn neumann_term(
        &self,
        ctx: &NeumannContext,
        shared: Option<&Linear>,
    ) -> PureResult<TensorField> {
        let projected = self.project(&ctx.directed_neumann, shared)?;
        if projected.rank() < 1 {
            return Err(TensorError::RankUnderflow {
                operation: "neumann_injection",
                rank: projected.rank(),
                required: 1,
            });
        }
        let shape = projected.shape().to_vec();
        let (n, dim) = (shape[0], shape[1]);
        let moments = ctx.inversed_moment_tensors.array();
        if moments.shape() != [n, dim, dim, 1] {
            return Err(TensorError::ShapeMismatch {
                left: moments.shape().to_vec(),
                right: vec![n, dim, dim, 1],
            });
        }
        let width = projected.len() / (n * dim).max(1);
        let flat = projected
            .into_array()
            .as_standard_layout()
            .into_owned()
            .into_shape((n, dim, width))?;
        let mut out = Array3::<f32>::zeros((n, dim, width));
        for i in 0..n {
            for k in 0..dim {
                let mut row = out.slice_mut(s![i, k, ..]);
                for l in 0..dim {
                    row.scaled_add(moments[[i, k, l, 0]] * self.factor, &flat.slice(s![i, l, ..]));
                }
            }
        }
        TensorField::from_array(out.into_shape(IxDyn(&shape))?)
    }

    /// `h + neumann`, or `2 (s h + (1 - s) neumann)` with `s = sigmoid(w)`
    /// when a ratio is learned.
    pub fn inject(
        &self,
        h: &TensorField,
        ctx: &NeumannContext,
        shared: Option<&Linear>,
    ) -> PureResult<TensorField> {
        let neumann = self.neumann_term(ctx, shared)?;
        match self.ratio() {
            Some(sigma) => Ok(h.scale(2.0 * sigma).add(&neumann.scale(2.0 * (1.0 - sigma)))?),
            None => h.add(&neumann),
        }
    }
}

impl Parameterised for NeumannInjection {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let NeumannLinear::Own(linear) = &self.linear {
            linear.visit_parameters(visitor)?;
        }
        if let Some(ratio) = &self.ratio {
            visitor(ratio)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let NeumannLinear::Own(linear) = &mut self.linear {
            linear.visit_parameters_mut(visitor)?;
        }
        if let Some(ratio) = &mut self.ratio {
            visitor(ratio)?;
        }
        Ok(())
    }
}
