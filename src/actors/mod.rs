//! Kameo actors for the two schedulers.
//!
//! One actor per subsystem keeps a single logical writer over each piece of
//! shared state: the conductor serializes the per-cycle parameter updates,
//! the sequencer serializes board programming and the start-ordering state
//! machine.

pub mod conductor;
pub mod sequencer;

pub use self::conductor::{Conductor, ConductorArgs, ConductorEvent, ParameterCatalog};
pub use self::sequencer::{Sequencer, SequencerArgs};
