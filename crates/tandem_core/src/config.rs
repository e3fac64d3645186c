//! # Engine Configuration
//!
//! Loaded once at startup, usually from a TOML file:
//!
//! ```toml
//! thread_name = "core"
//! frame_arena_bytes = 1048576
//! frame_buffer_count = 2
//! release_slot_when_idle = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Default size of each frame arena (1 MiB).
pub const DEFAULT_FRAME_ARENA_BYTES: usize = 1024 * 1024;

/// Default number of frame arenas.
///
/// Two buffers are enough as long as the simulation thread never runs more
/// than one frame ahead of the core thread.
pub const DEFAULT_FRAME_BUFFER_COUNT: usize = 2;

/// Configuration for the core thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreThreadConfig {
    /// Name given to the worker thread.
    pub thread_name: String,
    /// Size of each frame arena in bytes.
    pub frame_arena_bytes: usize,
    /// Number of frame arenas cycled by `update()`.
    pub frame_buffer_count: usize,
    /// Lend the worker's execution slot to the pool while it is idle.
    pub release_slot_when_idle: bool,
}

impl Default for CoreThreadConfig {
    fn default() -> Self {
        Self {
            thread_name: "core".to_string(),
            frame_arena_bytes: DEFAULT_FRAME_ARENA_BYTES,
            frame_buffer_count: DEFAULT_FRAME_BUFFER_COUNT,
            release_slot_when_idle: true,
        }
    }
}

impl CoreThreadConfig {
    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.thread_name.is_empty() {
            return Err(CoreError::InvalidConfig("thread_name is empty".into()));
        }
        if self.frame_arena_bytes == 0 {
            return Err(CoreError::InvalidConfig(
                "frame_arena_bytes must be greater than zero".into(),
            ));
        }
        if self.frame_buffer_count < 2 {
            return Err(CoreError::InvalidConfig(format!(
                "frame_buffer_count must be at least 2, got {}",
                self.frame_buffer_count
            )));
        }
        Ok(())
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> CoreResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            CoreError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }
}

/// Configuration for the thread pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Prefix for pooled thread names that have no explicit name.
    pub name_prefix: String,
    /// Idle threads kept around for reuse. Extra threads exit after their job.
    pub max_idle_threads: usize,
    /// Execution slots. At most this many jobs run at once.
    pub slots: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        let slots = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        Self {
            name_prefix: "pool".to_string(),
            max_idle_threads: 4,
            slots,
        }
    }
}

impl ThreadPoolConfig {
    /// Checks the configuration for values the pool cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.slots == 0 {
            return Err(CoreError::InvalidConfig("slots must be greater than zero".into()));
        }
        Ok(())
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> CoreResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
