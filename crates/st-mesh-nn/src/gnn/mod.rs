// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod equivariant;
pub mod neumann;
pub mod propagation;

pub use equivariant::{BlockLifecycle, EquivariantBlock};
pub use neumann::{NeumannContext, NeumannInjection};
pub use propagation::{
    contract_self, contraction, convolution, rotation, tensor_product, Propagation,
    PropagationPlan,
};

use crate::module::Parameterised;
use crate::{PureResult, SupportSet, TensorField};

/// Block driven by a field plus the mesh supports it propagates over.
pub trait GraphModule: Parameterised {
    /// `neumann` carries the boundary inputs of blocks in boundary mode and
    /// is ignored otherwise.
    fn forward_graph(
        &self,
        x: &TensorField,
        supports: &SupportSet,
        neumann: Option<&NeumannContext>,
    ) -> PureResult<TensorField>;
}
