// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable holding the filter directives, e.g. `st_mesh_nn=debug`.
pub const LOG_ENV: &str = "SPIRAL_MESH_LOG";

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Installs the global fmt subscriber. The filter comes from [`LOG_ENV`],
/// falling back to `default_directive` (for instance `"info"`).
pub fn init_tracing(default_directive: &str) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let filter = match std::env::var(LOG_ENV) {
        Ok(raw) if !raw.trim().is_empty() => {
            EnvFilter::try_new(raw.trim()).map_err(|err| InitError::Filter(err.to_string()))?
        }
        Ok(_) | Err(std::env::VarError::NotPresent) => EnvFilter::new(default_directive),
        Err(err) => return Err(InitError::Env(err)),
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to read {LOG_ENV}: {0}")]
    Env(std::env::VarError),
    #[error("invalid filter directive: {0}")]
    Filter(String),
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialisation_is_rejected() {
        let _ = init_tracing("warn");
        assert!(matches!(
            init_tracing("warn"),
            Err(InitError::AlreadyInitialised)
        ));
    }
}
