//! Errors of the simulation loop.

use std::path::PathBuf;

use tandem_core::CoreError;
use thiserror::Error;

/// Errors that can occur while running the simulation loop.
#[derive(Error, Debug)]
pub enum SimError {
    /// The core thread engine reported an error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A config file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A config file is not valid TOML for [`SimLoopConfig`](crate::SimLoopConfig).
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl SimError {
    /// Returns whether the error is a core object leak at shutdown.
    ///
    /// A leak means shared state outlived the core thread; callers should
    /// treat it as fatal.
    #[must_use]
    pub fn is_leak(&self) -> bool {
        matches!(self, Self::Core(CoreError::LeakedObjects { .. }))
    }
}

/// Result type for simulation loop operations.
pub type SimResult<T> = Result<T, SimError>;
