//! Board topology model and per-board program builders.
//!
//! Three board families share the trigger fabric but speak different load
//! formats:
//!
//! - **Analog** boards are delta-coded: every channel contributes
//!   (ramp-rate word, tick count) steps, flattened board-wide and sorted by
//!   `(start time, channel location)` so simultaneous updates always arrive
//!   lowest-location-first.
//! - **Digital** boards are state-coded: the union of all channels'
//!   transition times defines program rows, each row carrying the full
//!   64-channel output word and its duration.
//! - **Stable** boards (high-precision DACs) are setpoint-coded per channel,
//!   with consolidation and pacing passes that respect the DAC's minimum
//!   update interval and limited program RAM.
//!
//! All builders are pure functions: no I/O, byte-identical output for
//! identical input.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::compile::channel::{compile_channel, time_to_ticks};
use crate::compile::ramp::{decompose_all, LogicStep, RampKind, RampSegment};
use crate::error::CompileError;
use crate::sequence::ChannelSteps;

/// Safe-shutdown voltage every shot parks its outputs at.
pub const SHUTDOWN_V: f64 = 0.0;
/// Duration of the zeroing ramp appended to every analog channel.
pub const ZERO_RAMP_S: f64 = 10e-3;
/// Hold at the shutdown voltage after the zeroing ramp.
pub const ZERO_HOLD_S: f64 = 10.0;

/// Pre-trigger step prepended on the primary digital board, giving secondary
/// boards time to arm before the trigger edge.
pub const T_TRIG_S: f64 = 10e-6;
/// Trigger-channel tail so analog boards can finish their zeroing ramp.
pub const T_END_S: f64 = 1.0;

/// Trailing padding required by the board load protocol.
const TRAILER_PAD: usize = 24;

const STABLE_DAC_BITS: u32 = 20;
const STABLE_DT_BITS: u32 = 28;
/// Clock cycles the stable DAC needs per output update, padded from the
/// 31-cycle hardware floor.
const STABLE_MIN_UPDATE_TICKS: u32 = 40;
/// Output clamp of the stable DAC's analog stage.
const STABLE_OUT_CLAMP: (f64, f64) = (-2.6, 2.6);
/// Program RAM holds this many steps per channel.
const STABLE_MAX_STEPS: usize = ((1 << 10) - 1) / 3 - 1;
const STABLE_PAD: usize = 6;

/// Which start-ordering family a board belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequencerType {
    Stable,
    Analog,
    Digital,
}

/// Whether a channel follows the compiled sequence or its manual output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    #[default]
    Auto,
    Manual,
}

/// One physical output channel.
#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    /// Canonical identifier, `Name@Loc`.
    pub key: String,
    pub name: String,
    /// Physical location label, e.g. `A03` or `D15`.
    pub loc: String,
    /// Ordinal on the owning board; the tie-breaker for simultaneous writes
    /// and the bit position in digital output words.
    pub index: usize,
    pub mode: ChannelMode,
    pub manual_output: f64,
    /// Digital channels only: output is wired inverted.
    pub invert: bool,
}

/// One FPGA-driven output board.
#[derive(Debug, Clone)]
pub struct Board {
    pub id: String,
    pub sequencer_type: SequencerType,
    pub clock_hz: f64,
    /// The primary digital board supplies the master trigger releasing all
    /// other boards; it must be armed last.
    pub primary: bool,
    pub voltage_range: (f64, f64),
    pub channels: Vec<Channel>,
}

impl Board {
    /// Build this board's byte program from a resolved, default-filled
    /// sequence keyed by canonical channel keys.
    pub fn program(
        &self,
        sequence: &BTreeMap<String, ChannelSteps>,
        trigger_key: &str,
    ) -> Result<Vec<u8>, CompileError> {
        match self.sequencer_type {
            SequencerType::Analog => analog_program(self, sequence),
            SequencerType::Digital => digital_program(self, sequence, trigger_key),
            SequencerType::Stable => stable_program(self, sequence),
        }
    }
}

fn expect_analog<'a>(
    board: &Board,
    channel: &Channel,
    sequence: &'a BTreeMap<String, ChannelSteps>,
) -> Result<&'a [RampSegment], CompileError> {
    match sequence.get(&channel.key) {
        Some(ChannelSteps::Analog(steps)) => Ok(steps),
        Some(other) => Err(CompileError::WrongStepKind {
            channel: channel.key.clone(),
            board: board.id.clone(),
            expected: "analog ramp",
            found: other.kind_name(),
        }),
        None => Err(CompileError::InvalidRamp(format!(
            "channel '{}' missing from resolved sequence",
            channel.key
        ))),
    }
}

fn expect_digital<'a>(
    board: &Board,
    channel: &Channel,
    sequence: &'a BTreeMap<String, ChannelSteps>,
) -> Result<&'a [LogicStep], CompileError> {
    match sequence.get(&channel.key) {
        Some(ChannelSteps::Digital(steps)) => Ok(steps),
        Some(other) => Err(CompileError::WrongStepKind {
            channel: channel.key.clone(),
            board: board.id.clone(),
            expected: "digital logic",
            found: other.kind_name(),
        }),
        None => Err(CompileError::InvalidRamp(format!(
            "channel '{}' missing from resolved sequence",
            channel.key
        ))),
    }
}

// ============================================================================
// Analog boards
// ============================================================================

/// Delta-coded program: `(ramp-rate u16, ticks u32)` big-endian records in
/// `(start time, channel location)` order, then the load-protocol trailer.
pub fn analog_program(
    board: &Board,
    sequence: &BTreeMap<String, ChannelSteps>,
) -> Result<Vec<u8>, CompileError> {
    let mut tagged = Vec::new();
    for channel in &board.channels {
        let mut segments = expect_analog(board, channel, sequence)?.to_vec();
        segments.push(RampSegment::new(RampKind::Linear, ZERO_RAMP_S, SHUTDOWN_V));
        segments.push(RampSegment::new(RampKind::Linear, ZERO_HOLD_S, SHUTDOWN_V));

        let steps = compile_channel(
            &segments,
            SHUTDOWN_V,
            board.clock_hz,
            board.voltage_range,
        )?;
        let mut t = 0u64;
        for step in steps {
            tagged.push((t, channel.index, step));
            t += u64::from(step.ticks);
        }
    }

    // simultaneous updates land lowest-location-first; the hardware applies
    // writes in arrival order
    tagged.sort_by_key(|&(t, index, _)| (t, index));

    let mut bytes = Vec::with_capacity(tagged.len() * 6 + TRAILER_PAD);
    for (_, _, step) in &tagged {
        bytes.extend_from_slice(&step.ramp_rate.to_be_bytes());
        bytes.extend_from_slice(&step.ticks.to_be_bytes());
    }
    bytes.resize(bytes.len() + TRAILER_PAD, 0);
    Ok(bytes)
}

// ============================================================================
// Digital boards
// ============================================================================

fn logic_ticks(clock_hz: f64, dt: f64) -> u64 {
    (dt.abs() * clock_hz).round() as u64
}

/// State-coded program: one row per distinct transition time across all
/// channels, each row a big-endian `u64` output word (bit = channel index)
/// plus a big-endian `u32` duration, then the load-protocol trailer.
pub fn digital_program(
    board: &Board,
    sequence: &BTreeMap<String, ChannelSteps>,
    trigger_key: &str,
) -> Result<Vec<u8>, CompileError> {
    if board.channels.len() > 64 {
        return Err(CompileError::TooManyChannels {
            board: board.id.clone(),
            channels: board.channels.len(),
        });
    }

    let mut programs = Vec::with_capacity(board.channels.len());
    for channel in &board.channels {
        let mut steps = expect_digital(board, channel, sequence)?.to_vec();

        if board.primary {
            // hold the initial state for the pre-trigger interval so every
            // secondary board is armed before the edge
            let first = steps.first().map(|s| s.out).unwrap_or(false);
            steps.insert(
                0,
                LogicStep {
                    dt: T_TRIG_S,
                    out: first,
                },
            );
        }
        if board.primary && channel.key == trigger_key {
            // the trigger line is wired inverted: high for the pre-trigger
            // row only, then a long high tail while analog outputs zero
            for step in steps.iter_mut() {
                step.out = false;
            }
            if let Some(first) = steps.first_mut() {
                first.out = true;
            }
            steps.push(LogicStep {
                dt: T_END_S,
                out: true,
            });
        }
        programs.push(steps);
    }

    // transition times of every channel define the program rows; a channel
    // whose program ended holds its last state
    let mut starts: Vec<Vec<u64>> = Vec::with_capacity(programs.len());
    let mut times = BTreeSet::new();
    for steps in &programs {
        let mut t = 0u64;
        let mut channel_starts = Vec::with_capacity(steps.len());
        for step in steps {
            times.insert(t);
            channel_starts.push(t);
            t += logic_ticks(board.clock_hz, step.dt);
        }
        starts.push(channel_starts);
    }

    let times: Vec<u64> = times.into_iter().collect();
    let tail_ticks = logic_ticks(board.clock_hz, T_END_S);

    let mut bytes = Vec::with_capacity(times.len() * 12 + TRAILER_PAD);
    for (row, &t) in times.iter().enumerate() {
        let mut word = 0u64;
        for (channel, (steps, channel_starts)) in board
            .channels
            .iter()
            .zip(programs.iter().zip(starts.iter()))
        {
            if state_at(steps, channel_starts, t) {
                word |= 1 << channel.index;
            }
        }
        let duration = match times.get(row + 1) {
            Some(next) => next - t,
            None => tail_ticks,
        };
        bytes.extend_from_slice(&word.to_be_bytes());
        bytes.extend_from_slice(&(duration.min(u64::from(u32::MAX)) as u32).to_be_bytes());
    }
    bytes.resize(bytes.len() + TRAILER_PAD, 0);
    Ok(bytes)
}

fn state_at(steps: &[LogicStep], starts: &[u64], t: u64) -> bool {
    for (step, &start) in steps.iter().zip(starts).rev() {
        if start <= t {
            return step.out;
        }
    }
    false
}

// ============================================================================
// Stable boards
// ============================================================================

/// Setpoint-coded program for the high-precision DAC family: per channel,
/// 6-byte packed (20-bit two's-complement setpoint, 28-bit tick count) steps
/// followed by a 6-byte channel trailer, channels in location order.
pub fn stable_program(
    board: &Board,
    sequence: &BTreeMap<String, ChannelSteps>,
) -> Result<Vec<u8>, CompileError> {
    let min_time = f64::from(STABLE_MIN_UPDATE_TICKS) / board.clock_hz;
    let max_time = f64::from((1u32 << STABLE_DT_BITS) - 1) / board.clock_hz;

    let mut bytes = Vec::new();
    for channel in &board.channels {
        let segments = expect_analog(board, channel, sequence)?;
        let chords = decompose_all(segments, SHUTDOWN_V)?;
        let setpoints: Vec<(f64, f64)> = chords.iter().map(|c| (c.dt, c.vf)).collect();

        let steps = split_long_steps(
            enforce_min_update(consolidate_setpoints(setpoints), min_time),
            max_time,
        );
        if steps.len() > STABLE_MAX_STEPS {
            warn!(
                board_id = %board.id,
                channel = %channel.key,
                steps = steps.len(),
                limit = STABLE_MAX_STEPS,
                "program exceeds DAC RAM; truncating"
            );
        }
        for (dt, v) in steps.into_iter().take(STABLE_MAX_STEPS) {
            let ticks = time_to_ticks(board.clock_hz, dt);
            bytes.extend_from_slice(&pack_stable_step(ticks, v, board.voltage_range));
        }
        bytes.resize(bytes.len() + STABLE_PAD, 0);
    }
    Ok(bytes)
}

/// Fold runs of three-or-more equal setpoints into one long step; shorter
/// runs are left alone so the DAC still refreshes its output.
fn consolidate_setpoints(steps: Vec<(f64, f64)>) -> Vec<(f64, f64)> {
    let mut out: Vec<(f64, f64)> = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if i >= 2 && step.1 == steps[i - 1].1 && step.1 == steps[i - 2].1 {
            if let Some(last) = out.last_mut() {
                last.0 += step.0;
                continue;
            }
        }
        out.push(*step);
    }
    out
}

/// Steps faster than the DAC can update are stretched to the minimum
/// interval, borrowing the excess from following steps until the program
/// catches back up to the requested timeline.
fn enforce_min_update(steps: Vec<(f64, f64)>, min_time: f64) -> Vec<(f64, f64)> {
    let mut out = Vec::with_capacity(steps.len());
    let mut accumulated = 0.0;
    for (dt, v) in steps {
        accumulated += dt;
        if accumulated < min_time {
            out.push((min_time, v));
            accumulated -= min_time;
        } else {
            out.push((accumulated, v));
            accumulated = 0.0;
        }
    }
    out
}

/// Steps longer than the 28-bit tick field split into equal linear pieces.
fn split_long_steps(steps: Vec<(f64, f64)>, max_time: f64) -> Vec<(f64, f64)> {
    let mut out = Vec::with_capacity(steps.len());
    let mut last_v = SHUTDOWN_V;
    for (dt, v) in steps {
        if dt > max_time {
            let pieces = (dt / max_time).ceil() as usize;
            let piece_dt = dt / pieces as f64;
            for i in 0..pieces {
                let fraction = (i + 1) as f64 / pieces as f64;
                out.push((piece_dt, last_v + (v - last_v) * fraction));
            }
        } else {
            out.push((dt, v));
        }
        last_v = v;
    }
    out
}

/// 20-bit two's-complement DAC code against the board's reference range,
/// clamped to the analog output stage's limits.
fn stable_dac_code(v: f64, vref: (f64, f64)) -> u32 {
    let (vrefn, vrefp) = vref;
    let conv = f64::from((1u32 << STABLE_DAC_BITS) - 1);
    let span = vrefp - vrefn;
    let mut v = v.clamp(STABLE_OUT_CLAMP.0, STABLE_OUT_CLAMP.1);
    if v >= vrefp {
        v = vrefp - span / conv;
    } else if v < vrefn {
        v = vrefn;
    }
    if v >= 0.0 {
        (conv * v / span) as u32
    } else {
        (conv * (span + v) / span + 1.0) as u32
    }
}

/// Pack one step into the DAC's 6-byte load word: setpoint code in the low
/// 20 bits, tick count in the high 28, nibble-aligned the way the bitfile
/// unpacks them.
fn pack_stable_step(ticks: u32, v: f64, vref: (f64, f64)) -> [u8; 6] {
    let code = stable_dac_code(v, vref);
    let dt = u64::from(ticks) << 4;
    [
        code as u8,
        (code >> 8) as u8,
        (((code >> 16) & 0x0f) as u8) | ((dt & 0xf0) as u8),
        (dt >> 8) as u8,
        (dt >> 16) as u8,
        (dt >> 24) as u8,
    ]
}
