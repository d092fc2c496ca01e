// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterised};
use crate::{PureResult, TensorError, TensorField};
use ndarray::Array2;
use rand::Rng;
use spiral_config::determinism;

/// Fully-connected layer acting on the feature axis of a field of any rank.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Option<Parameter>,
}

impl Linear {
    /// Uniform `±1/sqrt(input_dim)` initialisation drawn from the RNG
    /// registered for `name` in [`spiral_config::determinism`].
    pub fn init(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
    ) -> PureResult<Self> {
        let name = name.into();
        guard_dims(input_dim, output_dim)?;
        let bound = 1.0 / (input_dim as f32).sqrt();
        let mut rng = determinism::rng_from_label(&name);
        let weights =
            Array2::from_shape_fn((input_dim, output_dim), |_| rng.gen_range(-bound..=bound));
        let bias = bias.then(|| {
            Array2::from_shape_fn((1, output_dim), |_| rng.gen_range(-bound..=bound))
        });
        Ok(Self::from_parts(&name, weights, bias))
    }

    /// Wraps explicit values; `weight` is `(input_dim, output_dim)` and `bias`
    /// a single row.
    pub fn from_arrays(
        name: impl Into<String>,
        weight: Array2<f32>,
        bias: Option<Array2<f32>>,
    ) -> PureResult<Self> {
        let name = name.into();
        let (input_dim, output_dim) = weight.dim();
        guard_dims(input_dim, output_dim)?;
        if let Some(bias) = &bias {
            if bias.dim() != (1, output_dim) {
                return Err(TensorError::ShapeMismatch {
                    left: vec![1, output_dim],
                    right: bias.shape().to_vec(),
                });
            }
        }
        Ok(Self::from_parts(&name, weight, bias))
    }

    fn from_parts(name: &str, weight: Array2<f32>, bias: Option<Array2<f32>>) -> Self {
        Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: bias.map(|b| Parameter::new(format!("{name}::bias"), b)),
        }
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut Parameter {
        &mut self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn input_dim(&self) -> usize {
        self.weight.shape().0
    }

    pub fn output_dim(&self) -> usize {
        self.weight.shape().1
    }
}

fn guard_dims(input_dim: usize, output_dim: usize) -> PureResult<()> {
    if input_dim == 0 || output_dim == 0 {
        return Err(TensorError::ShapeMismatch {
            left: vec![input_dim],
            right: vec![output_dim],
        });
    }
    Ok(())
}

impl Parameterised for Linear {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            visitor(bias)?;
        }
        Ok(())
    }
}

impl Module for Linear {
    fn forward(&self, input: &TensorField) -> PureResult<TensorField> {
        input.map_features(
            self.weight.value(),
            self.bias.as_ref().map(|b| b.value().row(0)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn linear_forward_matches_manual() {
        let weight = arr2(&[[0.01, 0.02], [0.03, 0.04], [0.05, 0.06]]);
        let layer = Linear::from_arrays("fc", weight, Some(arr2(&[[0.5, -0.5]]))).unwrap();
        let input = TensorField::from_shape_vec(&[1, 3], vec![1.0, -2.0, 0.5]).unwrap();
        let output = layer.forward(&input).unwrap();
        let expected = [
            1.0 * 0.01 - 2.0 * 0.03 + 0.5 * 0.05 + 0.5,
            1.0 * 0.02 - 2.0 * 0.04 + 0.5 * 0.06 - 0.5,
        ];
        for (got, want) in output.array().iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
        assert_eq!(layer.bias().map(Parameter::name), Some("fc::bias"));
    }

    #[test]
    fn bias_free_layers_are_linear_per_axis() {
        let layer = Linear::from_arrays("w", arr2(&[[2.0], [1.0]]), None).unwrap();
        let field = TensorField::from_fn(&[2, 3, 2], |idx| (idx[1] + idx[2]) as f32).unwrap();
        let out = layer.forward(&field).unwrap();
        assert_eq!(out.shape(), &[2, 3, 1]);
        assert_eq!(out.array()[[1, 2, 0]], 2.0 * 2.0 + 3.0);
        assert_eq!(layer.parameter_count().unwrap(), 2);
    }

    #[test]
    fn init_respects_bound_and_bias_flag() {
        let layer = Linear::init("block::subchain", 4, 3, false).unwrap();
        assert!(!layer.has_bias());
        assert!(layer.weight().value().iter().all(|v| v.abs() <= 0.5));
        assert_eq!(layer.weight().name(), "block::subchain::weight");
    }

    #[test]
    fn mismatched_bias_is_rejected() {
        let bias = arr2(&[[0.0, 0.0, 0.0]]);
        assert!(Linear::from_arrays("w", arr2(&[[1.0, 2.0]]), Some(bias)).is_err());
    }
}
