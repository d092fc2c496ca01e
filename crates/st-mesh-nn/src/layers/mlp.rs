// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{Activation, Dropout, Linear};
use crate::module::{Module, Parameter, Parameterised};
use crate::setting::BlockSetting;
use crate::{PureResult, TensorError, TensorField};

struct Stage {
    linear: Linear,
    dropout: Dropout,
    activation: Activation,
}

/// Chain of `Linear -> dropout -> activation` stages.
pub struct Mlp {
    stages: Vec<Stage>,
}

impl core::fmt::Debug for Mlp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let widths: Vec<usize> = self
            .stages
            .first()
            .map(|s| s.linear.input_dim())
            .into_iter()
            .chain(self.stages.iter().map(|s| s.linear.output_dim()))
            .collect();
        write!(f, "Mlp(nodes={widths:?})")
    }
}

impl Mlp {
    /// `nodes` holds `n + 1` widths for `n` stages; `activations` and
    /// `dropouts` hold one entry per stage.
    pub fn new(
        name: &str,
        nodes: &[usize],
        activations: &[Activation],
        dropouts: &[f32],
        bias: bool,
    ) -> PureResult<Self> {
        let n_stages = nodes.len().saturating_sub(1);
        if n_stages == 0 || activations.len() != n_stages || dropouts.len() != n_stages {
            return Err(TensorError::config(format!(
                "{name}: MLP needs len(nodes) - 1 == len(activations) == len(dropouts) >= 1, \
                 got {}, {}, {}",
                nodes.len(),
                activations.len(),
                dropouts.len()
            )));
        }
        let stages = nodes
            .windows(2)
            .zip(activations.iter().zip(dropouts))
            .enumerate()
            .map(|(i, (pair, (&activation, &p)))| {
                let label = format!("{name}::{i}");
                Ok(Stage {
                    linear: Linear::init(label.as_str(), pair[0], pair[1], bias)?,
                    dropout: Dropout::labelled(p, &format!("{label}::dropout"))?,
                    activation,
                })
            })
            .collect::<PureResult<Vec<_>>>()?;
        Ok(Self { stages })
    }

    /// Builds the MLP described by a block setting. With `identity_last`
    /// the final activation is replaced by the identity.
    pub fn from_setting(name: &str, setting: &BlockSetting, identity_last: bool) -> PureResult<Self> {
        let nodes = setting.resolved_nodes()?;
        let mut activations = setting.activations.clone();
        if identity_last {
            if let Some(last) = activations.last_mut() {
                *last = Activation::Identity;
            }
        }
        Self::new(name, &nodes, &activations, &setting.dropouts, setting.bias)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn input_dim(&self) -> usize {
        self.stages.first().map_or(0, |s| s.linear.input_dim())
    }

    pub fn output_dim(&self) -> usize {
        self.stages.last().map_or(0, |s| s.linear.output_dim())
    }

    pub fn activations(&self) -> impl Iterator<Item = Activation> + '_ {
        self.stages.iter().map(|s| s.activation)
    }
}

impl Parameterised for Mlp {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for stage in &self.stages {
            stage.linear.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for stage in &mut self.stages {
            stage.linear.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        for stage in &self.stages {
            stage.dropout.set_training(training);
        }
    }
}

impl Module for Mlp {
    fn forward(&self, input: &TensorField) -> PureResult<TensorField> {
        let mut activ = input.clone();
        for stage in &self.stages {
            activ = stage.linear.forward(&activ)?;
            activ = stage.dropout.forward(&activ)?;
            activ = stage.activation.apply(&activ)?;
        }
        Ok(activ)
    }
}
