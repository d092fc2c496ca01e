// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::neumann::{NeumannContext, NeumannInjection};
use super::propagation::{contract_self, PropagationPlan};
use super::GraphModule;
use crate::layers::{Activation, Dropout, Identity, Linear, Mlp};
use crate::module::{Module, Parameter, Parameterised};
use crate::setting::{BlockSetting, EquivariantOptions};
use crate::{PureResult, SupportSet, TensorError, TensorField};
use ndarray::Ix2;
use std::cell::Cell;
use tracing::{debug, info};

/// Where a block is in its one-time validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockLifecycle {
    Uninitialized,
    /// Checked ahead of time against an expected input rank.
    Validated { input_rank: usize, output_rank: usize },
    /// At least one forward pass ran; no further checks.
    Ready { input_rank: usize, output_rank: usize },
}

/// Graph block that propagates rank-`r` tensor fields with sparse supports
/// while keeping rotational equivariance.
///
/// The feature map `W` is applied either before (`A (H W)`) or after
/// (`(A H) W`) the propagation plan. Bias terms and nonlinear activations
/// break equivariance for tensors of nonzero rank, so the combinations that
/// would do so are rejected when the block is validated.
pub struct EquivariantBlock {
    setting: BlockSetting,
    plan: PropagationPlan,
    weight: Option<Linear>,
    coefficient_network: Option<Mlp>,
    last_activation: Activation,
    shortcut: Option<Box<dyn Module>>,
    neumann: Option<NeumannInjection>,
    dropout: Dropout,
    lifecycle: Cell<BlockLifecycle>,
}

impl core::fmt::Debug for EquivariantBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EquivariantBlock")
            .field("name", &self.setting.name)
            .field("plan", &self.plan)
            .field("coefficient_network", &self.coefficient_network.is_some())
            .field("neumann", &self.neumann.is_some())
            .field("lifecycle", &self.lifecycle.get())
            .finish()
    }
}

impl EquivariantBlock {
    /// Builds the block. `setting.nodes` must be fully resolved (see
    /// [`BlockSetting::with_io_dims`]).
    pub fn new(setting: &BlockSetting) -> PureResult<Self> {
        setting.validate_equivariant()?;
        let name = setting.name.as_str();
        let options = &setting.optional;
        let nodes = setting.resolved_nodes()?;
        let (input_dim, output_dim) = (nodes[0], nodes[nodes.len() - 1]);

        let (weight, coefficient_network) = if options.create_subchain {
            match nodes.len() - 1 {
                0 => {
                    return Err(TensorError::config(format!(
                        "{name}: # of layers is zero"
                    )))
                }
                1 => (
                    Some(Linear::init(
                        format!("{name}::subchain"),
                        input_dim,
                        output_dim,
                        setting.bias,
                    )?),
                    None,
                ),
                _ => {
                    let weight =
                        Linear::init(format!("{name}::subchain"), input_dim, output_dim, false)?;
                    let network = Mlp::from_setting(&format!("{name}::coefficient"), setting, false)?;
                    info!(block = name, "coefficient network created");
                    (Some(weight), Some(network))
                }
            }
        } else {
            info!(block = name, "skip subchain creation");
            (None, None)
        };

        let last_activation = if coefficient_network.is_some() {
            Activation::Identity
        } else {
            setting
                .activations
                .last()
                .copied()
                .unwrap_or(Activation::Identity)
        };

        if options.symmetric {
            info!(block = name, "output symmetric matrix");
        }
        info!(block = name, factor = options.factor, "propagation factor");
        info!(
            block = name,
            mode = if options.ah_w { "(AH) W" } else { "A (HW)" },
            "matrix multiplication mode"
        );

        let shortcut: Option<Box<dyn Module>> = if !setting.residual {
            None
        } else if input_dim == output_dim {
            Some(Box::new(Identity::new()))
        } else {
            Some(Box::new(Linear::init(
                format!("{name}::shortcut"),
                input_dim,
                output_dim,
                false,
            )?))
        };

        let neumann = if setting.uses_neumann() {
            Some(NeumannInjection::new(setting, weight.as_ref())?)
        } else {
            None
        };

        let dropout = Dropout::labelled(
            setting.dropouts.first().copied().unwrap_or(0.0),
            &format!("{name}::dropout"),
        )?;

        let propagations = options.propagations.clone().unwrap_or_default();
        Ok(Self {
            setting: setting.clone(),
            plan: PropagationPlan::new(propagations, options.factor),
            weight,
            coefficient_network,
            last_activation,
            shortcut,
            neumann,
            dropout,
            lifecycle: Cell::new(BlockLifecycle::Uninitialized),
        })
    }

    /// Builder form of [`EquivariantBlock::validate`].
    pub fn validated(self, input_rank: usize, n_supports: usize) -> PureResult<Self> {
        self.validate(input_rank, n_supports)?;
        Ok(self)
    }

    /// Runs the rank, bias and activation checks for an input of
    /// `input_rank` with `n_supports` support matrices.
    pub fn validate(&self, input_rank: usize, n_supports: usize) -> PureResult<()> {
        let options = self.options();
        SupportSet::ensure_count(
            n_supports,
            options.dim,
            options.support_tensor_rank,
            &self.setting.name,
        )?;
        let output_rank = self.check(input_rank)?;
        if self.lifecycle.get() == BlockLifecycle::Uninitialized {
            self.lifecycle.set(BlockLifecycle::Validated {
                input_rank,
                output_rank,
            });
        }
        Ok(())
    }

    /// Rank, bias and activation rules; the support length is checked by the
    /// callers.
    fn check(&self, input_rank: usize) -> PureResult<usize> {
        let options = self.options();
        let output_rank = self.plan.output_rank(input_rank)?;
        debug!(
            block = %self.setting.name,
            input_rank,
            output_rank,
            "validating equivariant block"
        );
        if !options.create_subchain || self.coefficient_network.is_some() {
            return Ok(output_rank);
        }

        let last_identity = self
            .setting
            .activations
            .last()
            .map_or(true, Activation::is_identity);
        if output_rank > 0 && !last_identity {
            return Err(self.rule_violation(format!(
                "set identity activation for rank {output_rank} output"
            )));
        }
        let bias = self.setting.bias;
        if input_rank == 0 {
            if output_rank > 0 && bias && options.ah_w {
                return Err(self.rule_violation("set bias = false for rank 0 -> k with (AH) W"));
            }
        } else if output_rank == 0 {
            if bias && !options.ah_w {
                return Err(self.rule_violation("set bias = false for rank k -> 0 with A (HW)"));
            }
        } else if bias {
            return Err(self.rule_violation("set bias = false for rank k -> l"));
        }
        Ok(output_rank)
    }

    fn rule_violation(&self, message: impl AsRef<str>) -> TensorError {
        TensorError::config(format!("{}: {}", self.setting.name, message.as_ref()))
    }

    fn ensure_supports(&self, supports: &SupportSet) -> PureResult<()> {
        let options = self.options();
        supports.ensure_len(options.dim, options.support_tensor_rank, &self.setting.name)
    }

    fn ensure_ready(&self, x: &TensorField, supports: &SupportSet) -> PureResult<()> {
        match self.lifecycle.get() {
            BlockLifecycle::Ready { .. } => Ok(()),
            BlockLifecycle::Validated {
                input_rank,
                output_rank,
            } => {
                self.ensure_supports(supports)?;
                if x.rank() != input_rank {
                    return Err(TensorError::config(format!(
                        "{}: validated for rank {input_rank} input, received rank {}",
                        self.setting.name,
                        x.rank()
                    )));
                }
                self.lifecycle.set(BlockLifecycle::Ready {
                    input_rank,
                    output_rank,
                });
                Ok(())
            }
            BlockLifecycle::Uninitialized => {
                self.ensure_supports(supports)?;
                let output_rank = self.check(x.rank())?;
                self.lifecycle.set(BlockLifecycle::Ready {
                    input_rank: x.rank(),
                    output_rank,
                });
                Ok(())
            }
        }
    }

    /// Weighting around the propagation plan.
    fn propagate(&self, x: &TensorField, supports: &SupportSet) -> PureResult<TensorField> {
        let ah_w = self.options().ah_w;
        let h = match (&self.weight, ah_w) {
            (Some(weight), false) => self.plan.apply(&weight.forward(x)?, supports)?,
            _ => self.plan.apply(x, supports)?,
        };
        match (&self.weight, ah_w) {
            (Some(weight), true) => weight.forward(&h),
            _ => Ok(h),
        }
    }

    fn gate(&self, network: &Mlp, x: &TensorField, h: &TensorField) -> PureResult<TensorField> {
        let invariant = if x.rank() == 0 {
            network.forward(x)?
        } else {
            network.forward(&contract_self(x)?)?
        };
        let coeff = invariant.into_array().into_dimensionality::<Ix2>()?;
        h.gate_features(&coeff)
    }

    fn options(&self) -> &EquivariantOptions {
        &self.setting.optional
    }

    pub fn name(&self) -> &str {
        &self.setting.name
    }

    pub fn setting(&self) -> &BlockSetting {
        &self.setting
    }

    pub fn plan(&self) -> &PropagationPlan {
        &self.plan
    }

    pub fn state(&self) -> BlockLifecycle {
        self.lifecycle.get()
    }

    pub fn input_rank(&self) -> Option<usize> {
        match self.lifecycle.get() {
            BlockLifecycle::Uninitialized => None,
            BlockLifecycle::Validated { input_rank, .. }
            | BlockLifecycle::Ready { input_rank, .. } => Some(input_rank),
        }
    }

    pub fn output_rank(&self) -> Option<usize> {
        match self.lifecycle.get() {
            BlockLifecycle::Uninitialized => None,
            BlockLifecycle::Validated { output_rank, .. }
            | BlockLifecycle::Ready { output_rank, .. } => Some(output_rank),
        }
    }

    pub fn estimated_output_rank(&self, input_rank: usize) -> isize {
        self.plan.estimated_output_rank(input_rank)
    }

    pub fn has_coefficient_network(&self) -> bool {
        self.coefficient_network.is_some()
    }

    pub fn has_neumann(&self) -> bool {
        self.neumann.is_some()
    }

    pub fn last_activation(&self) -> Activation {
        self.last_activation
    }

    pub fn weight(&self) -> Option<&Linear> {
        self.weight.as_ref()
    }

    pub fn weight_mut(&mut self) -> Option<&mut Linear> {
        self.weight.as_mut()
    }
}

impl Parameterised for EquivariantBlock {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let Some(weight) = &self.weight {
            weight.visit_parameters(visitor)?;
        }
        if let Some(network) = &self.coefficient_network {
            network.visit_parameters(visitor)?;
        }
        if let Some(shortcut) = &self.shortcut {
            shortcut.visit_parameters(visitor)?;
        }
        if let Some(neumann) = &self.neumann {
            neumann.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let Some(weight) = &mut self.weight {
            weight.visit_parameters_mut(visitor)?;
        }
        if let Some(network) = &mut self.coefficient_network {
            network.visit_parameters_mut(visitor)?;
        }
        if let Some(shortcut) = &mut self.shortcut {
            shortcut.visit_parameters_mut(visitor)?;
        }
        if let Some(neumann) = &mut self.neumann {
            neumann.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
        if let Some(network) = &self.coefficient_network {
            network.set_training(training);
        }
    }
}

impl GraphModule for EquivariantBlock {
    fn forward_graph(
        &self,
        x: &TensorField,
        supports: &SupportSet,
        neumann: Option<&NeumannContext>,
    ) -> PureResult<TensorField> {
        self.ensure_ready(x, supports)?;

        let shortcut = match &self.shortcut {
            Some(layer) => Some(layer.forward(x)?),
            None => None,
        };

        let mut h = self.propagate(x, supports)?;

        if let Some(injection) = &self.neumann {
            let ctx = neumann.ok_or_else(|| TensorError::MissingOption {
                option: "neumann_inputs",
                context: self.setting.name.clone(),
            })?;
            h = injection.inject(&h, ctx, self.weight.as_ref())?;
        }

        if let Some(network) = &self.coefficient_network {
            h = self.gate(network, x, &h)?;
        }

        if self.options().symmetric {
            h = h.add(&h.transpose_trailing()?)?.scale(0.5);
        }

        h = self.dropout.forward(&h)?;

        match shortcut {
            Some(s) if self.setting.activation_after_residual => {
                self.last_activation.apply(&h.add(&s)?)
            }
            Some(s) => self.last_activation.apply(&h)?.add(&s),
            None => self.last_activation.apply(&h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnn::Propagation;
    use crate::SparseMatrix;

    fn setting(propagations: Vec<Propagation>, nodes: Vec<i64>) -> BlockSetting {
        let n_layer = nodes.len() - 1;
        BlockSetting {
            name: "iso".into(),
            nodes,
            activations: vec![Activation::Identity; n_layer],
            dropouts: vec![0.0; n_layer],
            bias: false,
            optional: EquivariantOptions {
                propagations: Some(propagations),
                ..EquivariantOptions::default()
            },
            ..BlockSetting::default()
        }
    }

    fn supports(n: usize, count: usize) -> SupportSet {
        SupportSet::new(
            (0..count)
                .map(|k| SparseMatrix::identity(n).unwrap().scale(k as f32 + 1.0))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn lifecycle_moves_forward_once() {
        let block = EquivariantBlock::new(&setting(vec![Propagation::Convolution], vec![2, 2]))
            .unwrap();
        assert_eq!(block.state(), BlockLifecycle::Uninitialized);
        assert_eq!(block.output_rank(), None);
        block.validate(0, 3).unwrap();
        assert_eq!(
            block.state(),
            BlockLifecycle::Validated {
                input_rank: 0,
                output_rank: 1
            }
        );
        let x = TensorField::zeros(&[4, 2]).unwrap();
        let out = block.forward_graph(&x, &supports(4, 3), None).unwrap();
        assert_eq!(out.shape(), &[4, 3, 2]);
        assert!(matches!(block.state(), BlockLifecycle::Ready { .. }));
    }

    #[test]
    fn validated_rank_must_match_first_input() {
        let block = EquivariantBlock::new(&setting(vec![Propagation::Convolution], vec![2, 2]))
            .unwrap()
            .validated(1, 3)
            .unwrap();
        let x = TensorField::zeros(&[4, 2]).unwrap();
        assert!(block.forward_graph(&x, &supports(4, 3), None).is_err());
    }

    #[test]
    fn validated_block_still_checks_first_support_set() {
        let block = EquivariantBlock::new(&setting(vec![Propagation::Convolution], vec![1, 1]))
            .unwrap()
            .validated(0, 3)
            .unwrap();
        let x = TensorField::zeros(&[4, 1]).unwrap();
        assert_eq!(
            block.forward_graph(&x, &supports(4, 2), None).unwrap_err(),
            TensorError::SupportLength {
                expected: 3,
                got: 2,
                context: "iso".into()
            }
        );
        assert!(matches!(block.state(), BlockLifecycle::Validated { .. }));
        let out = block.forward_graph(&x, &supports(4, 3), None).unwrap();
        assert_eq!(out.shape(), &[4, 3, 1]);
        assert!(matches!(block.state(), BlockLifecycle::Ready { .. }));
    }

    #[test]
    fn validate_rejects_support_count() {
        let block = EquivariantBlock::new(&setting(vec![Propagation::Convolution], vec![1, 1]))
            .unwrap();
        assert!(matches!(
            block.validate(0, 4),
            Err(TensorError::SupportLength { expected: 3, got: 4, .. })
        ));
        assert_eq!(block.state(), BlockLifecycle::Uninitialized);
    }

    #[test]
    fn coefficient_network_replaces_last_activation() {
        let mut s = setting(vec![Propagation::Convolution], vec![2, 4, 2]);
        s.activations = vec![Activation::Relu, Activation::Tanh];
        let block = EquivariantBlock::new(&s).unwrap();
        assert!(block.has_coefficient_network());
        assert_eq!(block.last_activation(), Activation::Identity);
        assert!(block.weight().map_or(false, |w| !w.has_bias()));
        // the coefficient network skips the rank checks
        block.validate(0, 3).unwrap();
    }

    #[test]
    fn missing_propagations_fail_at_construction() {
        let mut s = setting(vec![], vec![2, 2]);
        s.optional.propagations = None;
        assert!(matches!(
            EquivariantBlock::new(&s),
            Err(TensorError::MissingOption { option: "propagations", .. })
        ));
    }

    #[test]
    fn residual_projects_when_widths_differ() {
        let mut s = setting(vec![Propagation::Convolution, Propagation::Contraction], vec![2, 3]);
        s.residual = true;
        let block = EquivariantBlock::new(&s).unwrap();
        // subchain weight plus bias-free shortcut projection
        assert_eq!(block.parameter_count().unwrap(), 2 * 3 + 2 * 3);
        let x = TensorField::from_fn(&[4, 2], |idx| idx[0] as f32).unwrap();
        let out = block.forward_graph(&x, &supports(4, 3), None).unwrap();
        assert_eq!(out.shape(), &[4, 3]);
    }

    #[test]
    fn neumann_inputs_are_required_in_boundary_mode() {
        let mut s = setting(vec![Propagation::Convolution], vec![1, 1]);
        s.input_names = Some(vec!["phi".into(), "directed".into(), "moment".into()]);
        let block = EquivariantBlock::new(&s).unwrap();
        assert!(block.has_neumann());
        let x = TensorField::zeros(&[2, 1]).unwrap();
        assert!(matches!(
            block.forward_graph(&x, &supports(2, 3), None),
            Err(TensorError::MissingOption { .. })
        ));
    }
}
