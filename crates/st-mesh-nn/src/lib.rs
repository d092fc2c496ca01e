// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Equivariant graph propagation for mesh surrogates.
//!
//! Blocks in this crate move rank-`r` tensor fields (scalars, vectors,
//! 2-tensors per vertex) across sparse mesh supports with convolution,
//! contraction, tensor product and rotation steps. Settings are parsed from
//! YAML and checked so that rank transitions never combine a bias or a
//! nonlinear activation in a way that breaks rotational equivariance.

pub mod gnn;
pub mod io;
pub mod layers;
pub mod module;
pub mod setting;

pub use gnn::{
    BlockLifecycle, EquivariantBlock, GraphModule, NeumannContext, Propagation, PropagationPlan,
};
pub use io::{load_bincode, load_json, save_bincode, save_json};
pub use layers::{
    Activation, DeepSets, Dropout, GroupShapes, Identity, Linear, Mlp, Reduction,
};
pub use module::{Module, Parameter, Parameterised};
pub use setting::{
    read_settings_yaml, BlockSetting, DataSetting, EquivariantOptions, InputSelection,
    MainSetting, ModelSetting, SliceSpec,
};

pub use spiral_config::determinism::DeterminismConfig;
pub use spiral_config::tracing::init_tracing;
pub use st_field::{ErrorKind, PureResult, SparseMatrix, SupportSet, TensorError, TensorField};
