//! # Simulation Loop
//!
//! ```text
//! Frame N:
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ 1. UPDATE                                                           │
//! │    └─ Advance the frame allocator (core arenas flip)                │
//! │                                                                     │
//! │ 2. LOGIC TICK (sim thread)                                          │
//! │    └─ Queue commands on the thread accessor                         │
//! │                                                                     │
//! │ 3. SUBMIT                                                           │
//! │    └─ submit_accessors(block): thread batches, then synced batch    │
//! │                                                                     │
//! │ 4. END FRAME                                                        │
//! │    └─ Record frame stats                                            │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tandem_core::{
    Accessor, CoreHandle, CoreThread, CoreThreadConfig, SyncedAccessor, ThreadPool,
    ThreadPoolConfig,
};

use crate::error::{SimError, SimResult};

/// Configuration for the simulation loop.
///
/// ```toml
/// block_on_submit = true
///
/// [core]
/// thread_name = "core"
/// frame_arena_bytes = 1048576
///
/// [pool]
/// slots = 4
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimLoopConfig {
    /// Core thread settings.
    pub core: CoreThreadConfig,
    /// Pool the core thread runs on.
    pub pool: ThreadPoolConfig,
    /// Wait for the core thread to finish each frame's batches.
    pub block_on_submit: bool,
}

impl Default for SimLoopConfig {
    fn default() -> Self {
        Self {
            core: CoreThreadConfig::default(),
            pool: ThreadPoolConfig::default(),
            block_on_submit: true,
        }
    }
}

impl SimLoopConfig {
    /// Checks every nested section.
    pub fn validate(&self) -> SimResult<()> {
        self.core.validate()?;
        self.pool.validate()?;
        Ok(())
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> SimResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| SimError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}

/// What [`SimLoop::run_frame`] observed for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameStats {
    /// Frame number after the update.
    pub frame: u64,
    /// Commands the loop's own accessors handed to the core thread.
    pub commands_submitted: usize,
    /// Wall time of the frame, including a blocking submission.
    pub elapsed: Duration,
}

/// What the logic tick gets to work with.
pub struct FrameContext<'a> {
    /// The sim thread's accessor.
    pub accessor: &'a Accessor,
    /// The accessor shared with helper threads.
    pub synced: &'a SyncedAccessor,
    /// Handle to the core thread.
    pub core: &'a CoreHandle,
    /// Current frame number.
    pub frame: u64,
}

/// The owning application loop.
///
/// Drives the per-frame `update()` hook and submits all accessors once per
/// frame. Must be driven from a single thread.
pub struct SimLoop {
    core: CoreThread,
    pool: ThreadPool,
    accessor: Accessor,
    synced: SyncedAccessor,
    config: SimLoopConfig,
    last_frame: Option<FrameStats>,
    commands_submitted: u64,
}

impl SimLoop {
    /// Starts the core thread and prepares the loop.
    pub fn new(config: SimLoopConfig) -> SimResult<Self> {
        config.validate()?;
        let pool = ThreadPool::new(config.pool.clone())?;
        let core = CoreThread::start(config.core.clone(), &pool)?;
        let accessor = core.handle().accessor();
        let synced = core.handle().synced_accessor();

        tracing::info!(
            core = %config.core.thread_name,
            block_on_submit = config.block_on_submit,
            "simulation loop started"
        );

        Ok(Self {
            core,
            pool,
            accessor,
            synced,
            config,
            last_frame: None,
            commands_submitted: 0,
        })
    }

    /// Runs one frame: update, logic tick `f`, submit.
    ///
    /// # Errors
    ///
    /// Any core thread error from `update()` or the submission. The logic
    /// tick's commands are dropped if the submission fails.
    pub fn run_frame<F, R>(&mut self, f: F) -> SimResult<R>
    where
        F: FnOnce(&FrameContext<'_>) -> R,
    {
        let start = Instant::now();
        let handle = self.core.handle();
        let frame = handle.update()?;

        let ctx = FrameContext {
            accessor: &self.accessor,
            synced: &self.synced,
            core: handle,
            frame,
        };
        let output = f(&ctx);

        let commands_submitted = self.accessor.pending() + self.synced.pending();
        handle.submit_accessors(self.config.block_on_submit)?;

        let stats = FrameStats {
            frame,
            commands_submitted,
            elapsed: start.elapsed(),
        };
        tracing::trace!(
            frame,
            commands = commands_submitted,
            elapsed_us = u64::try_from(stats.elapsed.as_micros()).unwrap_or(u64::MAX),
            "frame finished"
        );
        self.commands_submitted += commands_submitted as u64;
        self.last_frame = Some(stats);
        Ok(output)
    }

    /// Returns the handle to the core thread.
    #[must_use]
    pub fn core(&self) -> &CoreHandle {
        self.core.handle()
    }

    /// Returns the current frame number.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.core.handle().frame()
    }

    /// Returns what the last completed frame reported.
    #[must_use]
    pub fn last_frame_stats(&self) -> Option<FrameStats> {
        self.last_frame
    }

    /// Returns how many commands the loop's accessors submitted so far.
    #[must_use]
    pub fn commands_submitted(&self) -> u64 {
        self.commands_submitted
    }

    /// Submits outstanding work, then shuts the core thread down.
    ///
    /// # Errors
    ///
    /// A leak (see [`SimError::is_leak`]) or any error from the core thread.
    pub fn shutdown(self) -> SimResult<()> {
        let Self {
            mut core,
            pool,
            accessor,
            commands_submitted,
            ..
        } = self;

        let submitted = core.handle().submit_accessors(true);
        drop(accessor);
        tracing::info!(
            frames = core.handle().frame(),
            commands = commands_submitted,
            "simulation loop stopping"
        );
        let stopped = core.shutdown();
        pool.clear_idle();

        submitted?;
        stopped?;
        Ok(())
    }
}

impl std::fmt::Debug for SimLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimLoop")
            .field("core", &self.core)
            .field("pool", &self.pool)
            .field("last_frame", &self.last_frame)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn small_config() -> SimLoopConfig {
        SimLoopConfig {
            core: CoreThreadConfig {
                thread_name: "sim-test-core".to_string(),
                frame_arena_bytes: 4096,
                ..CoreThreadConfig::default()
            },
            pool: ThreadPoolConfig {
                name_prefix: "sim-test".to_string(),
                max_idle_threads: 1,
                slots: 2,
            },
            ..SimLoopConfig::default()
        }
    }

    #[test]
    fn test_frame_cycle() {
        let mut sim = SimLoop::new(small_config()).unwrap();
        let ran = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&ran);
        let frame = sim
            .run_frame(|ctx| {
                ctx.accessor.queue_command(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                ctx.frame
            })
            .unwrap();

        assert_eq!(frame, 1);
        assert_eq!(sim.frame_count(), 1);
        // Blocking submit by default.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let stats = sim.last_frame_stats().unwrap();
        assert_eq!(stats.frame, 1);
        assert_eq!(stats.commands_submitted, 1);

        sim.shutdown().unwrap();
    }

    #[test]
    fn test_non_blocking_submit_flushed_at_shutdown() {
        let config = SimLoopConfig {
            block_on_submit: false,
            ..small_config()
        };
        let mut sim = SimLoop::new(config).unwrap();
        let ran = Arc::new(AtomicU64::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&ran);
            sim.run_frame(|ctx| {
                ctx.synced.queue_command(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            })
            .unwrap();
        }

        sim.shutdown().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_leak_reported_on_shutdown() {
        let mut sim = SimLoop::new(small_config()).unwrap();
        sim.run_frame(|ctx| {
            let _ = ctx.core.register_object("orphan");
        })
        .unwrap();

        let err = sim.shutdown().unwrap_err();
        assert!(err.is_leak());
    }

    #[test]
    fn test_config_from_toml() {
        let config = SimLoopConfig::from_toml_str(
            r#"
            block_on_submit = false

            [core]
            thread_name = "render"
            frame_buffer_count = 3

            [pool]
            slots = 2
            "#,
        )
        .unwrap();

        assert!(!config.block_on_submit);
        assert_eq!(config.core.thread_name, "render");
        assert_eq!(config.core.frame_buffer_count, 3);
        assert_eq!(config.pool.slots, 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = SimLoopConfig::from_toml_str("[core]\nframe_buffer_count = 1\n").unwrap_err();
        assert!(matches!(
            err,
            SimError::Core(tandem_core::CoreError::InvalidConfig(_))
        ));

        let err = SimLoopConfig::from_toml_str("block_on_submit = 3").unwrap_err();
        assert!(matches!(err, SimError::ConfigParse(_)));
    }

    #[test]
    fn test_stats_count_both_accessors() {
        let mut sim = SimLoop::new(small_config()).unwrap();
        assert_eq!(sim.last_frame_stats(), None);

        for _ in 0..2 {
            sim.run_frame(|ctx| {
                ctx.accessor.queue_command(|_| {});
                ctx.accessor.queue_command(|_| {});
                ctx.synced.queue_command(|_| {});
            })
            .unwrap();
        }
        sim.run_frame(|_| {}).unwrap();

        let last = sim.last_frame_stats().unwrap();
        assert_eq!(last.frame, 3);
        assert_eq!(last.commands_submitted, 0);
        assert_eq!(sim.commands_submitted(), 6);
        sim.shutdown().unwrap();
    }
}
