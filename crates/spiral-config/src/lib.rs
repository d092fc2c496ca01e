// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Runtime knobs shared by the mesh crates: deterministic seeding for weight
//! initialisation and dropout masks, and the global tracing subscriber.

pub mod determinism;
pub mod tracing;
