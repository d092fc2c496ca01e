// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::pooling::{group_axis, split_groups, GroupShapes, Reduction};
use super::{Activation, Mlp};
use crate::module::{Module, Parameter, Parameterised};
use crate::setting::BlockSetting;
use crate::{PureResult, TensorError, TensorField};
use ndarray::Axis;

/// Permutation-equivariant set layer (Zaheer et al., Deep Sets).
///
/// Each group `g` of the input becomes `act(lambda(x_g) + max(gamma(x_g)))`,
/// the max taken over the members of the group.
#[derive(Debug)]
pub struct DeepSets {
    name: String,
    lambda: Mlp,
    gamma: Mlp,
    last_activation: Activation,
    dict_key: Option<String>,
}

impl DeepSets {
    pub fn new(setting: &BlockSetting) -> PureResult<Self> {
        setting.validate()?;
        let name = setting.name.clone();
        Ok(Self {
            lambda: Mlp::from_setting(&format!("{name}::lambda"), setting, true)?,
            gamma: Mlp::from_setting(&format!("{name}::gamma"), setting, true)?,
            last_activation: setting
                .activations
                .last()
                .copied()
                .unwrap_or(Activation::Identity),
            dict_key: setting.optional.dict_key.clone(),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn forward_grouped(&self, x: &TensorField, shapes: &GroupShapes) -> PureResult<TensorField> {
        let shapes = shapes.select(self.dict_key.as_deref())?;
        let axis = group_axis(shapes)?;
        let split = split_groups(&self.lambda.forward(x)?, shapes)?;
        let reduced = Reduction::Max.apply_groups(&self.gamma.forward(x)?, shapes)?;

        let mut parts = Vec::with_capacity(split.len());
        for (g, part) in split.iter().enumerate() {
            let pooled = reduced
                .array()
                .index_axis(Axis(axis), g)
                .insert_axis(Axis(axis));
            let Some(pooled) = pooled.broadcast(part.array().raw_dim()) else {
                return Err(TensorError::ShapeMismatch {
                    left: part.shape().to_vec(),
                    right: reduced.shape().to_vec(),
                });
            };
            parts.push(TensorField::from_array(part.array() + &pooled)?);
        }
        self.last_activation
            .apply(&TensorField::concatenate(axis, &parts)?)
    }
}

impl Parameterised for DeepSets {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.lambda.visit_parameters(visitor)?;
        self.gamma.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.lambda.visit_parameters_mut(visitor)?;
        self.gamma.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.lambda.set_training(training);
        self.gamma.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(dict_key: Option<&str>) -> DeepSets {
        let mut setting = BlockSetting {
            name: "sets".into(),
            nodes: vec![2, 4, 3],
            activations: vec![Activation::Relu, Activation::Identity],
            dropouts: vec![0.0, 0.0],
            ..BlockSetting::default()
        };
        setting.optional.dict_key = dict_key.map(str::to_string);
        DeepSets::new(&setting).unwrap()
    }

    #[test]
    fn groups_are_permutation_equivariant() {
        let sets = block(None);
        let x = TensorField::from_fn(&[5, 2], |idx| (idx[0] * 2 + idx[1]) as f32 * 0.1).unwrap();
        let shapes = GroupShapes::vertex_groups(&[2, 3]);
        let out = sets.forward_grouped(&x, &shapes).unwrap();
        assert_eq!(out.shape(), &[5, 3]);

        // swapping two members of the second group swaps their outputs
        let swapped = TensorField::from_fn(&[5, 2], |idx| {
            let row = match idx[0] {
                2 => 4,
                4 => 2,
                r => r,
            };
            x.array()[[row, idx[1]]]
        })
        .unwrap();
        let out_swapped = sets.forward_grouped(&swapped, &shapes).unwrap();
        for f in 0..3 {
            assert!((out.array()[[2, f]] - out_swapped.array()[[4, f]]).abs() < 1e-6);
            assert!((out.array()[[0, f]] - out_swapped.array()[[0, f]]).abs() < 1e-6);
        }
    }

    #[test]
    fn dict_key_selects_shapes() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("nodal".to_string(), vec![vec![1], vec![2]]);
        let shapes = GroupShapes::Keyed(map);
        let x = TensorField::zeros(&[3, 2]).unwrap();
        assert_eq!(
            block(None).forward_grouped(&x, &shapes).unwrap_err(),
            TensorError::KeyedGroupShapes
        );
        let out = block(Some("nodal")).forward_grouped(&x, &shapes).unwrap();
        assert_eq!(out.shape(), &[3, 3]);
    }
}
