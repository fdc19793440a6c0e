//! shotctl - Experiment cycle control
//!
//! Coordinates a physics experiment that repeats, once per shot, a precisely
//! timed program of analog and digital outputs on FPGA-backed boards:
//! - Kameo actors for the per-cycle parameter scheduler (conductor) and the
//!   board orchestrator (sequencer)
//! - A pure compile pipeline turning declarative ramp sequences into
//!   quantized, byte-packed board programs
//! - Figment configuration for board topology and default parameters
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kameo::Actor;
//! use shotctl::actors::conductor::{Advance, Conductor, ConductorArgs};
//! use shotctl::actors::sequencer::{Sequencer, SequencerArgs};
//! use shotctl::config::ShotctlConfig;
//! use shotctl::hardware::MockBus;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ShotctlConfig::load()?;
//!     let sequencer = Sequencer::spawn(SequencerArgs {
//!         boards: config.boards(),
//!         bus: Arc::new(MockBus::new()),
//!         timing_reference: config.sequencer.timing_reference.clone(),
//!     });
//!     let conductor = Conductor::spawn(ConductorArgs::new(
//!         config.conductor.clone(),
//!         Some(sequencer),
//!     ));
//!     let report = conductor.ask(Advance).await?;
//!     println!("shot {} done", report.shot);
//!     Ok(())
//! }
//! ```

pub mod actors;
pub mod compile;
pub mod config;
pub mod error;
pub mod hardware;
pub mod params;
pub mod sequence;
pub mod traits;

// Re-exports for convenience
pub use actors::{Conductor, ConductorArgs, ConductorEvent, ParameterCatalog, Sequencer, SequencerArgs};
pub use compile::{Board, Channel, ChannelMode, SequencerType};
pub use config::{ConfigError, ShotctlConfig};
pub use error::{CompileError, ParameterError, SequenceError};
pub use hardware::MockBus;
pub use params::{ParameterValue, ValueType};
pub use sequence::{ResolvedSequence, SequenceDef};
pub use traits::BoardBus;
