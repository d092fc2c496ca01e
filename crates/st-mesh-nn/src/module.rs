// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, TensorError, TensorField};
use ndarray::Array2;
use std::collections::HashMap;

/// Named weight matrix owned by a layer.
#[derive(Clone, PartialEq)]
pub struct Parameter {
    name: String,
    value: Array2<f32>,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.dim();
        write!(f, "Parameter(name={},shape=({},{}))", self.name, rows, cols)
    }
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Array2<f32>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Array2<f32> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Array2<f32> {
        &mut self.value
    }

    pub fn shape(&self) -> (usize, usize) {
        self.value.dim()
    }

    /// Replaces the stored value, keeping the shape fixed.
    pub fn load_value(&mut self, value: &Array2<f32>) -> PureResult<()> {
        if value.dim() != self.value.dim() {
            let (rows, cols) = self.value.dim();
            let (got_rows, got_cols) = value.dim();
            return Err(TensorError::ShapeMismatch {
                left: vec![rows, cols],
                right: vec![got_rows, got_cols],
            });
        }
        self.value.assign(value);
        Ok(())
    }
}

/// Parameter traversal shared by every layer and block, independent of how
/// the forward pass is driven.
pub trait Parameterised {
    /// Visits every parameter owned by the module.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits every parameter mutably.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Switches dropout and similar stochastic pieces between training and
    /// evaluation mode.
    fn set_training(&self, _training: bool) {}

    fn parameter_count(&self) -> PureResult<usize> {
        let mut count = 0usize;
        self.visit_parameters(&mut |param| {
            count += param.value().len();
            Ok(())
        })?;
        Ok(count)
    }

    /// Captures a copy of every parameter keyed by name.
    fn state_dict(&self) -> PureResult<HashMap<String, Array2<f32>>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by
    /// [`Parameterised::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Array2<f32>>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

/// Layer applied to a single tensor field.
pub trait Module: Parameterised {
    fn forward(&self, input: &TensorField) -> PureResult<TensorField>;
}
