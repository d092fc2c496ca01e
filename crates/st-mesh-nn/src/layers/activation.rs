// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::pooling::{GroupShapes, Reduction};
use crate::{PureResult, TensorError, TensorField};
use ndarray::Axis;
use std::fmt;
use std::str::FromStr;

/// Negative slope shared by the leaky ReLU family.
pub const DEFAULT_NEGATIVE_SLOPE: f32 = 0.5;
/// Clipping margin used by [`Activation::Atanh`].
pub const ATANH_EPSILON: f32 = 1e-5;
const NORMALIZE_EPSILON: f32 = 1e-5;

/// Nonlinearities selectable by name in block settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Activation {
    Identity,
    /// Constant one, same shape as the input.
    One,
    Relu,
    Sigmoid,
    Tanh,
    Mish,
    /// Divides by the L2 norm over the feature axis.
    Normalize,
    Softplus,
    Sqrt,
    LeakyRelu { negative_slope: f32 },
    /// Leaky ReLU whose slope undoes [`Activation::LeakyRelu`].
    InversedLeakyRelu { negative_slope: f32 },
    DerivativeLeakyRelu { negative_slope: f32 },
    DerivativeTanh,
    Atanh { epsilon: f32 },
    /// Segment reduction; needs group shapes.
    Pool(Reduction),
}

impl Activation {
    /// Leaky ReLU that inverts one with `original_slope`.
    pub fn inversed_leaky_relu(original_slope: f32) -> PureResult<Self> {
        if original_slope <= 1e-5 {
            return Err(TensorError::config(format!(
                "too small original negative slope: {original_slope}"
            )));
        }
        Ok(Self::InversedLeakyRelu {
            negative_slope: 1.0 / original_slope,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::One => "one",
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Mish => "mish",
            Self::Normalize => "normalize",
            Self::Softplus => "softplus",
            Self::Sqrt => "sqrt",
            Self::LeakyRelu { .. } => "leaky_relu",
            Self::InversedLeakyRelu { .. } => "inversed_leaky_relu",
            Self::DerivativeLeakyRelu { .. } => "derivative_leaky_relu",
            Self::DerivativeTanh => "derivative_tanh",
            Self::Atanh { .. } => "atanh",
            Self::Pool(reduction) => reduction.name(),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    pub fn is_pooling(&self) -> bool {
        matches!(self, Self::Pool(_))
    }

    /// Applies the activation elementwise. Pooling variants need group shapes
    /// and fail here; use [`Activation::apply_grouped`].
    pub fn apply(&self, x: &TensorField) -> PureResult<TensorField> {
        Ok(match *self {
            Self::Identity => x.clone(),
            Self::One => x.map(|_| 1.0),
            Self::Relu => x.map(|v| v.max(0.0)),
            Self::Sigmoid => x.map(sigmoid),
            Self::Tanh => x.map(f32::tanh),
            Self::Mish => x.map(|v| v * softplus(v).tanh()),
            Self::Normalize => normalize(x)?,
            Self::Softplus => x.map(softplus),
            Self::Sqrt => x.map(f32::sqrt),
            Self::LeakyRelu { negative_slope } | Self::InversedLeakyRelu { negative_slope } => {
                x.map(|v| if v >= 0.0 { v } else { v * negative_slope })
            }
            Self::DerivativeLeakyRelu { negative_slope } => {
                let center = (1.0 + negative_slope) / 2.0;
                x.map(|v| heaviside(v, center) + heaviside(-v, center) * negative_slope)
            }
            Self::DerivativeTanh => x.map(|v| 1.0 / v.cosh().powi(2)),
            Self::Atanh { epsilon } => atanh(x, epsilon)?,
            Self::Pool(reduction) => {
                return Err(TensorError::config(format!(
                    "{} pooling needs group shapes",
                    reduction.name()
                )))
            }
        })
    }

    /// Like [`Activation::apply`] but feeds `shapes` to pooling variants.
    pub fn apply_grouped(&self, x: &TensorField, shapes: &GroupShapes) -> PureResult<TensorField> {
        match self {
            Self::Pool(reduction) => reduction.apply(x, shapes),
            other => other.apply(x),
        }
    }
}

impl FromStr for Activation {
    type Err = TensorError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Ok(match name.trim() {
            "identity" => Self::Identity,
            "one" => Self::One,
            "relu" => Self::Relu,
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "mish" => Self::Mish,
            "normalize" => Self::Normalize,
            "softplus" => Self::Softplus,
            "sqrt" => Self::Sqrt,
            "leaky_relu" => Self::LeakyRelu {
                negative_slope: DEFAULT_NEGATIVE_SLOPE,
            },
            "inversed_leaky_relu" => Self::inversed_leaky_relu(DEFAULT_NEGATIVE_SLOPE)?,
            "derivative_leaky_relu" => Self::DerivativeLeakyRelu {
                negative_slope: DEFAULT_NEGATIVE_SLOPE,
            },
            "derivative_tanh" => Self::DerivativeTanh,
            "atanh" => Self::Atanh {
                epsilon: ATANH_EPSILON,
            },
            "max_pool" | "max" => Self::Pool(Reduction::Max),
            "mean" => Self::Pool(Reduction::Mean),
            "min" => Self::Pool(Reduction::Min),
            other => return Err(TensorError::UnknownActivation(other.to_string())),
        })
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

// Linear above the usual threshold of 20 to avoid overflow.
fn softplus(v: f32) -> f32 {
    if v > 20.0 {
        v
    } else {
        v.exp().ln_1p()
    }
}

fn heaviside(v: f32, at_zero: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        0.0
    } else {
        at_zero
    }
}

fn normalize(x: &TensorField) -> PureResult<TensorField> {
    let data = x.array();
    let last = Axis(data.ndim() - 1);
    let norms = data
        .mapv(|v| v * v)
        .sum_axis(last)
        .mapv(|v| v.sqrt() + NORMALIZE_EPSILON)
        .insert_axis(last);
    let denom = norms
        .broadcast(data.raw_dim())
        .ok_or_else(|| TensorError::Layout {
            message: "normalize: norm broadcast failed".into(),
        })?;
    TensorField::from_array(data / &denom)
}

/// Inverse hyperbolic tangent with a tolerance band around ±1.
///
/// Non-finite inputs and inputs outside `[-1 - epsilon, 1 + epsilon]` are
/// rejected; the rest is clipped into `[-1 + epsilon, 1 - epsilon]` before taking `atanh`.
pub fn atanh(x: &TensorField, epsilon: f32) -> PureResult<TensorField> {
    let (lower, upper) = (-1.0 - epsilon, 1.0 + epsilon);
    // min/max folds skip NaN
    if let Some(bad) = x.array().iter().copied().find(|v| !v.is_finite()) {
        return Err(TensorError::OutOfDomain {
            label: "atanh",
            min: bad,
            max: bad,
            lower,
            upper,
        });
    }
    if let (Some(min), Some(max)) = (x.min_value(), x.max_value()) {
        if min < lower || max > upper {
            return Err(TensorError::OutOfDomain {
                label: "atanh",
                min,
                max,
                lower,
                upper,
            });
        }
    }
    Ok(x.map(|v| v.clamp(-1.0 + epsilon, 1.0 - epsilon).atanh()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn column(values: &[f32]) -> TensorField {
        TensorField::from_shape_vec(&[values.len(), 1], values.to_vec()).unwrap()
    }

    fn values(field: &TensorField) -> Vec<f32> {
        field.array().iter().copied().collect()
    }

    #[test]
    fn registry_resolves_every_name() {
        for name in [
            "identity",
            "one",
            "relu",
            "sigmoid",
            "tanh",
            "mish",
            "normalize",
            "softplus",
            "sqrt",
            "leaky_relu",
            "inversed_leaky_relu",
            "derivative_leaky_relu",
            "derivative_tanh",
            "atanh",
            "max_pool",
            "mean",
            "min",
        ] {
            let act: Activation = name.parse().unwrap();
            if name != "max_pool" {
                assert_eq!(act.name(), name);
            }
        }
        assert_eq!(
            "swish".parse::<Activation>().unwrap_err(),
            TensorError::UnknownActivation("swish".into())
        );
    }

    #[test]
    fn atanh_accepts_tolerance_band() {
        let out = atanh(&column(&[1.0, -1.0, 0.0]), ATANH_EPSILON).unwrap();
        let v = values(&out);
        assert!(v.iter().all(|x| x.is_finite()));
        assert!(v[0] > 0.0 && v[1] < 0.0);
        assert_eq!(v[2], 0.0);

        let err = atanh(&column(&[1.1, 0.0]), ATANH_EPSILON).unwrap_err();
        assert!(matches!(err, TensorError::OutOfDomain { max, .. } if max == 1.1));
    }

    #[test]
    fn atanh_rejects_non_finite_input() {
        let err = atanh(&column(&[0.5, f32::NAN, 0.0]), ATANH_EPSILON).unwrap_err();
        assert!(matches!(err, TensorError::OutOfDomain { min, .. } if min.is_nan()));
        assert_eq!(err.kind(), crate::ErrorKind::Domain);
        assert!(atanh(&column(&[f32::INFINITY]), ATANH_EPSILON).is_err());
    }

    #[test]
    fn leaky_family_matches_slopes() {
        let x = column(&[-2.0, 0.0, 3.0]);
        let leaky: Activation = "leaky_relu".parse().unwrap();
        assert_eq!(values(&leaky.apply(&x).unwrap()), vec![-1.0, 0.0, 3.0]);
        let inversed: Activation = "inversed_leaky_relu".parse().unwrap();
        assert_eq!(
            values(&inversed.apply(&leaky.apply(&x).unwrap()).unwrap()),
            vec![-2.0, 0.0, 3.0]
        );
        let derivative: Activation = "derivative_leaky_relu".parse().unwrap();
        assert_eq!(values(&derivative.apply(&x).unwrap()), vec![0.5, 1.125, 1.0]);
        assert!(Activation::inversed_leaky_relu(0.0).is_err());
    }

    #[test]
    fn smooth_activations_match_closed_forms() {
        let x = column(&[0.0, 1.0]);
        let sig = values(&Activation::Sigmoid.apply(&x).unwrap());
        assert_abs_diff_eq!(sig[0], 0.5, epsilon = 1e-6);
        let soft = values(&Activation::Softplus.apply(&x).unwrap());
        assert_abs_diff_eq!(soft[0], std::f32::consts::LN_2, epsilon = 1e-6);
        let dtanh = values(&Activation::DerivativeTanh.apply(&x).unwrap());
        assert_abs_diff_eq!(dtanh[1], 1.0 - 1.0f32.tanh().powi(2), epsilon = 1e-6);
        let mish = values(&Activation::Mish.apply(&x).unwrap());
        assert_abs_diff_eq!(mish[1], (1.0f32.exp().ln_1p()).tanh(), epsilon = 1e-6);
        assert_eq!(values(&Activation::One.apply(&x).unwrap()), vec![1.0, 1.0]);
    }

    #[test]
    fn normalize_divides_by_feature_norm() {
        let x = TensorField::from_shape_vec(&[1, 2], vec![3.0, 4.0]).unwrap();
        let out = values(&Activation::Normalize.apply(&x).unwrap());
        assert_abs_diff_eq!(out[0], 0.6, epsilon = 1e-5);
        assert_abs_diff_eq!(out[1], 0.8, epsilon = 1e-5);
    }

    #[test]
    fn pooling_requires_shapes() {
        let x = column(&[1.0, 2.0, 3.0]);
        let max: Activation = "max".parse().unwrap();
        assert!(max.apply(&x).is_err());
        let out = max
            .apply_grouped(&x, &GroupShapes::vertex_groups(&[1, 2]))
            .unwrap();
        assert_eq!(values(&out), vec![1.0, 3.0]);
    }
}
