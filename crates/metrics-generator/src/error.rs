// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::ConfigError;
use crate::remote_write::ExportError;
use crate::ring::RingError;

/// Errors that stop a generator from starting or running.
///
/// Per-span and per-batch failures never surface here; they are counted.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to join the ring: {0}")]
    Ring(#[from] RingError),

    #[error("failed to set up remote write: {0}")]
    Export(#[from] ExportError),

    #[error("generator has already been started")]
    AlreadyStarted,

    #[error("generator is shutting down")]
    ShuttingDown,
}
