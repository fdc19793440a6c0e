//! The pure compilation pipeline: declarative ramps to board byte programs.
//!
//! Nothing in this module suspends or touches hardware; every function is
//! testable without an I/O stub. The sequencer actor drives it and ships the
//! resulting byte streams over the [`BoardBus`](crate::traits::BoardBus)
//! seam.

pub mod board;
pub mod channel;
pub mod ramp;

pub use board::{Board, Channel, ChannelMode, SequencerType};
pub use channel::{compile_channel, decode_ramp_rate, ramp_rate_word, time_to_ticks, QuantizedStep};
pub use ramp::{CompiledSegment, LogicStep, RampKind, RampSegment, Waveform};
