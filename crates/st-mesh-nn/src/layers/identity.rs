// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterised};
use crate::{PureResult, TensorField};

/// Stateless identity layer that forwards its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Identity {
    pub fn new() -> Self {
        Self
    }
}

impl Parameterised for Identity {
    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

impl Module for Identity {
    fn forward(&self, input: &TensorField) -> PureResult<TensorField> {
        Ok(input.clone())
    }
}
