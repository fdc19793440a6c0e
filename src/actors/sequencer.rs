//! Sequencer Orchestrator Actor
//!
//! Owns the board/channel registry and turns resolved sequences into running
//! hardware: resolve channel keys, fill absent channels from their manual
//! outputs, compile every board's byte program, transmit them all, then arm
//! boards in the fixed dependency order.
//!
//! Start ordering is the correctness mechanism here. The primary digital
//! board supplies the master trigger that releases every other board from
//! its primed state, so it is always armed last:
//!
//! ```text
//! Idle -> ProgramAll -> StartStable -> StartAnalog
//!      -> StartDigitalSecondary -> StartDigitalPrimary -> Running
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use kameo::Actor;
//! use shotctl::actors::sequencer::{RunSequence, Sequencer, SequencerArgs};
//! use shotctl::hardware::MockBus;
//! use shotctl::sequence::SequenceDef;
//!
//! # async fn example(boards: Vec<shotctl::compile::Board>) -> anyhow::Result<()> {
//! let sequencer = Sequencer::spawn(SequencerArgs {
//!     boards,
//!     bus: Arc::new(MockBus::new()),
//!     timing_reference: "Trigger@D15".to_string(),
//! });
//!
//! let sequence = SequenceDef::from_value(serde_json::json!({
//!     "Trigger@D15": [{"dt": 0.5, "out": true}],
//! }))?
//! .parse()?;
//!
//! let duration = sequencer.ask(RunSequence { sequence }).await?;
//! println!("shot takes {duration} s");
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use kameo::actor::ActorRef;
use kameo::error::BoxSendError;
use kameo::message::{Context, Message};
use kameo::Actor;
use serde::Serialize;
use tracing::{debug, info};

use crate::compile::board::{Board, Channel, ChannelMode, SequencerType};
use crate::compile::ramp::{LogicStep, RampKind, RampSegment};
use crate::error::SequenceError;
use crate::sequence::{ChannelSteps, ResolvedSequence};
use crate::traits::BoardBus;

/// Arguments used to bootstrap the Sequencer actor.
pub struct SequencerArgs {
    /// Board topology, registered once for the process lifetime.
    pub boards: Vec<Board>,
    /// The device-service seam programs and starts travel over.
    pub bus: Arc<dyn BoardBus>,
    /// Canonical key of the timing-reference channel.
    pub timing_reference: String,
}

/// Sequencer orchestrator state.
pub struct Sequencer {
    boards: Vec<Board>,
    bus: Arc<dyn BoardBus>,
    timing_reference: String,
}

impl Actor for Sequencer {
    type Args = SequencerArgs;
    type Error = BoxSendError;

    async fn on_start(args: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let channels: usize = args.boards.iter().map(|b| b.channels.len()).sum();
        info!(
            boards = args.boards.len(),
            channels,
            timing_reference = %args.timing_reference,
            "Sequencer started"
        );
        Ok(Sequencer {
            boards: args.boards,
            bus: args.bus,
            timing_reference: args.timing_reference,
        })
    }
}

// ============================================================================
// Start-ordering state machine
// ============================================================================

/// Phases of one `RunSequence` call, terminal on completion or first fatal
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPhase {
    Idle,
    ProgramAll,
    StartStable,
    StartAnalog,
    StartDigitalSecondary,
    StartDigitalPrimary,
    Running,
}

impl StartPhase {
    /// The boards this phase arms. Stable DACs go first (longest settling),
    /// general analog next, secondary digital next, the trigger master last.
    pub fn selects(self, board: &Board) -> bool {
        match self {
            StartPhase::StartStable => board.sequencer_type == SequencerType::Stable,
            StartPhase::StartAnalog => board.sequencer_type == SequencerType::Analog,
            StartPhase::StartDigitalSecondary => {
                board.sequencer_type == SequencerType::Digital && !board.primary
            }
            StartPhase::StartDigitalPrimary => {
                board.sequencer_type == SequencerType::Digital && board.primary
            }
            _ => false,
        }
    }
}

/// Linear walk through the start phases. There is no way back to an earlier
/// phase; a failed call abandons the machine where it stands.
#[derive(Debug)]
pub struct StartOrder {
    phase: StartPhase,
}

impl StartOrder {
    pub fn new() -> Self {
        Self {
            phase: StartPhase::Idle,
        }
    }

    pub fn phase(&self) -> StartPhase {
        self.phase
    }

    /// Step to the next phase and return it; `Running` is terminal.
    pub fn advance(&mut self) -> StartPhase {
        self.phase = match self.phase {
            StartPhase::Idle => StartPhase::ProgramAll,
            StartPhase::ProgramAll => StartPhase::StartStable,
            StartPhase::StartStable => StartPhase::StartAnalog,
            StartPhase::StartAnalog => StartPhase::StartDigitalSecondary,
            StartPhase::StartDigitalSecondary => StartPhase::StartDigitalPrimary,
            StartPhase::StartDigitalPrimary | StartPhase::Running => StartPhase::Running,
        };
        self.phase
    }
}

impl Default for StartOrder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Core flow
// ============================================================================

impl Sequencer {
    /// Find a channel by `name@loc` id: name match first, then location.
    fn find_channel(&self, channel_id: &str) -> Option<&Channel> {
        let (name, loc) = match channel_id.split_once('@') {
            Some((name, loc)) => (name, loc),
            None => (channel_id, ""),
        };
        if !name.is_empty() {
            for board in &self.boards {
                for channel in &board.channels {
                    if channel.name == name {
                        return Some(channel);
                    }
                }
            }
        }
        if !loc.is_empty() {
            for board in &self.boards {
                for channel in &board.channels {
                    if channel.loc == loc {
                        return Some(channel);
                    }
                }
            }
        }
        None
    }

    fn locate(&self, channel_id: &str) -> Result<(usize, usize), SequenceError> {
        let key = self
            .find_channel(channel_id)
            .map(|c| c.key.clone())
            .ok_or_else(|| SequenceError::UnknownChannel(channel_id.to_string()))?;
        for (bi, board) in self.boards.iter().enumerate() {
            for (ci, channel) in board.channels.iter().enumerate() {
                if channel.key == key {
                    return Ok((bi, ci));
                }
            }
        }
        Err(SequenceError::UnknownChannel(channel_id.to_string()))
    }

    /// Re-key every input channel to its canonical `Name@Loc` key.
    fn resolve_keys(
        &self,
        sequence: ResolvedSequence,
    ) -> Result<BTreeMap<String, ChannelSteps>, SequenceError> {
        let mut resolved = BTreeMap::new();
        for (key, steps) in sequence.channels {
            let channel = self
                .find_channel(&key)
                .ok_or_else(|| SequenceError::UnknownChannel(key.clone()))?;
            resolved.insert(channel.key.clone(), steps);
        }
        Ok(resolved)
    }

    /// Give every registered channel absent from the sequence a flat program
    /// at its manual output, timed like the timing-reference channel, so all
    /// boards run for the same total duration.
    fn fill_defaults(
        &self,
        sequence: &mut BTreeMap<String, ChannelSteps>,
    ) -> Result<(), SequenceError> {
        let durations = sequence
            .get(&self.timing_reference)
            .ok_or_else(|| SequenceError::MissingTimingReference(self.timing_reference.clone()))?
            .durations();

        for board in &self.boards {
            for channel in &board.channels {
                if sequence.contains_key(&channel.key) {
                    continue;
                }
                let steps = match board.sequencer_type {
                    SequencerType::Analog | SequencerType::Stable => ChannelSteps::Analog(
                        durations
                            .iter()
                            .map(|&dt| RampSegment::new(RampKind::Step, dt, channel.manual_output))
                            .collect(),
                    ),
                    SequencerType::Digital => ChannelSteps::Digital(
                        durations
                            .iter()
                            .map(|&dt| LogicStep {
                                dt,
                                out: channel.manual_output > 0.0,
                            })
                            .collect(),
                    ),
                };
                sequence.insert(channel.key.clone(), steps);
            }
        }
        Ok(())
    }

    async fn run_sequence(&self, sequence: ResolvedSequence) -> Result<f64, SequenceError> {
        let mut resolved = self.resolve_keys(sequence)?;
        self.fill_defaults(&mut resolved)?;
        let duration = resolved
            .values()
            .map(ChannelSteps::duration)
            .fold(0.0, f64::max);

        let mut order = StartOrder::new();
        let phase = order.advance();
        debug_assert_eq!(phase, StartPhase::ProgramAll);

        // compile everything first so a bad ramp can never leave boards
        // partially programmed
        let mut programs = Vec::with_capacity(self.boards.len());
        for board in &self.boards {
            programs.push(board.program(&resolved, &self.timing_reference)?);
        }

        // program all boards before starting any
        for (board, program) in self.boards.iter().zip(&programs) {
            debug!(board_id = %board.id, bytes = program.len(), "programming board");
            self.bus
                .program_sequence(&board.id, program)
                .await
                .map_err(|source| SequenceError::BoardProgramming {
                    board: board.id.clone(),
                    source,
                })?;
        }

        while order.phase() != StartPhase::StartDigitalPrimary {
            let phase = order.advance();
            for board in self.boards.iter().filter(|b| phase.selects(b)) {
                debug!(board_id = %board.id, ?phase, "starting board");
                self.bus.start_sequence(&board.id).await.map_err(|source| {
                    SequenceError::BoardStart {
                        board: board.id.clone(),
                        source,
                    }
                })?;
            }
        }
        order.advance();
        debug_assert_eq!(order.phase(), StartPhase::Running);

        info!(duration_s = duration, "sequence running");
        Ok(duration)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Message: compile, program and start a resolved sequence. Replies with the
/// compiled total duration in seconds.
#[derive(Debug, Clone)]
pub struct RunSequence {
    pub sequence: ResolvedSequence,
}

impl Message<RunSequence> for Sequencer {
    type Reply = Result<f64>;

    async fn handle(
        &mut self,
        msg: RunSequence,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.run_sequence(msg.sequence).await?)
    }
}

/// Message: read, and optionally set, a channel's mode.
#[derive(Debug, Clone)]
pub struct ChannelModeRequest {
    pub channel_id: String,
    /// `Some` sets the mode before replying with the current value.
    pub mode: Option<ChannelMode>,
}

impl Message<ChannelModeRequest> for Sequencer {
    type Reply = Result<ChannelMode>;

    async fn handle(
        &mut self,
        msg: ChannelModeRequest,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let (bi, ci) = self.locate(&msg.channel_id)?;
        let channel = &mut self.boards[bi].channels[ci];
        if let Some(mode) = msg.mode {
            channel.mode = mode;
            debug!(channel = %channel.key, ?mode, "channel mode changed");
        }
        Ok(channel.mode)
    }
}

/// Message: read, and optionally set, a channel's manual output. Writes are
/// clamped to the owning board's voltage range.
#[derive(Debug, Clone)]
pub struct ManualOutputRequest {
    pub channel_id: String,
    pub output: Option<f64>,
}

impl Message<ManualOutputRequest> for Sequencer {
    type Reply = Result<f64>;

    async fn handle(
        &mut self,
        msg: ManualOutputRequest,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let (bi, ci) = self.locate(&msg.channel_id)?;
        let board = &mut self.boards[bi];
        let (lo, hi) = board.voltage_range;
        let channel = &mut board.channels[ci];
        if let Some(output) = msg.output {
            channel.manual_output = output.clamp(lo, hi);
            debug!(channel = %channel.key, output = channel.manual_output, "manual output changed");
        }
        Ok(channel.manual_output)
    }
}

/// Message: describe every registered channel, keyed by canonical key.
#[derive(Debug, Clone)]
pub struct GetChannels;

/// Wire-facing channel description.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelDescriptor {
    pub name: String,
    pub loc: String,
    pub board_id: String,
    pub sequencer_type: SequencerType,
    pub mode: ChannelMode,
    pub manual_output: f64,
    pub invert: bool,
}

impl Message<GetChannels> for Sequencer {
    type Reply = Result<BTreeMap<String, ChannelDescriptor>>;

    async fn handle(
        &mut self,
        _msg: GetChannels,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let mut channels = BTreeMap::new();
        for board in &self.boards {
            for channel in &board.channels {
                channels.insert(
                    channel.key.clone(),
                    ChannelDescriptor {
                        name: channel.name.clone(),
                        loc: channel.loc.clone(),
                        board_id: board.id.clone(),
                        sequencer_type: board.sequencer_type,
                        mode: channel.mode,
                        manual_output: channel.manual_output,
                        invert: channel.invert,
                    },
                );
            }
        }
        Ok(channels)
    }
}
