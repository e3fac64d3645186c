//! # TANDEM
//!
//! The application side of the engine: a simulation loop that owns the core
//! thread and drives it once per frame.
//!
//! ```text
//! ┌────────────────────────┐   accessor batches   ┌────────────────────────┐
//! │      SIM THREAD        │ ───────────────────► │      CORE THREAD       │
//! │                        │                      │                        │
//! │  • update()            │                      │  • command playback    │
//! │  • logic tick          │ ◄─────────────────── │  • frame arenas        │
//! │  • submit_accessors()  │   AsyncOp results    │  • registry            │
//! └────────────────────────┘                      └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `sim_loop`: frame orchestration and timing
//! - `error`: loop-level errors

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod sim_loop;

// Re-export the engine
pub use tandem_core as core;

pub use error::{SimError, SimResult};
pub use sim_loop::{FrameContext, FrameStats, SimLoop, SimLoopConfig};
