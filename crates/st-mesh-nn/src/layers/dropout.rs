// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterised};
use crate::{PureResult, TensorError, TensorField};
use ndarray::ArrayD;
use rand::{rngs::StdRng, Rng};
use spiral_config::determinism;
use std::cell::{Cell, RefCell};

/// Bernoulli dropout with inverse-keep scaling, active only while training.
pub struct Dropout {
    probability: f32,
    keep_scale: f32,
    train: Cell<bool>,
    rng: RefCell<StdRng>,
}

impl core::fmt::Debug for Dropout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .field("training", &self.train.get())
            .finish()
    }
}

impl Dropout {
    /// RNG derived from `label`, so each block draws its own stream.
    pub fn labelled(probability: f32, label: &str) -> PureResult<Self> {
        Self::seeded(probability, None, label)
    }

    /// An explicit `seed` replaces the label-derived stream.
    pub fn seeded(probability: f32, seed: Option<u64>, label: &str) -> PureResult<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(TensorError::InvalidValue {
                label: "dropout_probability",
            });
        }
        Ok(Self {
            probability,
            keep_scale: 1.0 / (1.0 - probability),
            train: Cell::new(true),
            rng: RefCell::new(determinism::rng_from_optional(seed, label)),
        })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn is_training(&self) -> bool {
        self.train.get()
    }

    fn sample_mask(&self, shape: &[usize]) -> ArrayD<f32> {
        let mut rng = self.rng.borrow_mut();
        ArrayD::from_shape_simple_fn(shape, || {
            if rng.gen::<f32>() >= self.probability {
                self.keep_scale
            } else {
                0.0
            }
        })
    }
}

impl Parameterised for Dropout {
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

    fn set_training(&self, training: bool) {
        self.train.set(training);
    }
}

impl Module for Dropout {
    fn forward(&self, input: &TensorField) -> PureResult<TensorField> {
        if !self.is_training() || self.probability == 0.0 {
            return Ok(input.clone());
        }
        let mask = TensorField::from_array(self.sample_mask(input.shape()))?;
        input.hadamard(&mask)
    }
}
