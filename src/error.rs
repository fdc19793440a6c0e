//! Error taxonomy for the compile pipeline and the two schedulers.
//!
//! Compilation errors are typed and surface to the caller before any hardware
//! call is made. Board programming/start failures wrap the underlying bus
//! error and are fatal to the running cycle. Per-parameter failures are
//! handled at the conductor boundary and never unwind past a single cycle.

use thiserror::Error;

/// Errors raised while turning declarative ramps into hardware programs.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Malformed physical parameters. Rejected before compilation; the
    /// compiler never clamps its way around bad input.
    #[error("invalid ramp: {0}")]
    InvalidRamp(String),

    /// A channel's step list does not match the owning board's family,
    /// e.g. TTL logic steps handed to an analog board.
    #[error("channel '{channel}' carries {found} steps but board '{board}' expects {expected}")]
    WrongStepKind {
        channel: String,
        board: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A digital board was given more channels than its output word holds.
    #[error("board '{board}' has {channels} channels; the output word holds at most 64")]
    TooManyChannels { board: String, channels: usize },
}

/// Errors raised while resolving and running a sequence.
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("could not find channel based on id '{0}'")]
    UnknownChannel(String),

    #[error("timing reference channel '{0}' missing from sequence")]
    MissingTimingReference(String),

    #[error("unresolved parameter reference '{0}'")]
    UnresolvedReference(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    /// The device service rejected or failed a board programming call.
    /// Boards may be left partially armed; the whole cycle is abandoned.
    #[error("programming board '{board}' failed")]
    BoardProgramming {
        board: String,
        #[source]
        source: anyhow::Error,
    },

    /// The device service rejected or failed a board start call. Never
    /// reported as success.
    #[error("starting board '{board}' failed")]
    BoardStart {
        board: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Registration- and scheduling-level parameter failures.
#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("parameter '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("parameter '{0}' is not registered")]
    NotRegistered(String),

    #[error("no parameter behavior registered for type '{0}'")]
    UnknownType(String),

    #[error("parameter '{name}' initialization failed")]
    InitFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A `critical` parameter failed its update; the cycle is aborted
    /// wholesale rather than continued with a partial update set.
    #[error("critical parameter '{0}' failed; cycle aborted")]
    CriticalFailure(String),
}
