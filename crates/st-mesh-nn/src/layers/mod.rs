// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod deepsets;
pub mod dropout;
pub mod identity;
pub mod linear;
pub mod mlp;
pub mod pooling;

pub use activation::Activation;
pub use deepsets::DeepSets;
pub use dropout::Dropout;
pub use identity::Identity;
pub use linear::Linear;
pub use mlp::Mlp;
pub use pooling::{GroupShapes, Reduction};
