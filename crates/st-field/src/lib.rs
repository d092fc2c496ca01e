// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

// crates/st-field/src/lib.rs
pub mod pure;

pub use pure::{
    sparse::SparseMatrix, support::SupportSet, ErrorKind, PureResult, TensorError, TensorField,
};
