//! Typed configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. shotctl.toml file (base configuration)
//! 2. Environment variables (prefixed with SHOTCTL_)
//!
//! Every component gets an explicit, validated struct here; nothing copies
//! arbitrary config keys onto live objects. Board and channel topology is
//! read once at startup and handed to the sequencer actor as built
//! [`Board`]s.
//!
//! # Example
//!
//! ```no_run
//! use shotctl::config::ShotctlConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ShotctlConfig::load()?;
//!     println!("boards: {}", config.sequencer.boards.len());
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::compile::board::{Board, Channel, ChannelMode, SequencerType};
use crate::params::ValueType;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShotctlConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Conductor (per-cycle scheduler) settings
    pub conductor: ConductorConfig,
    /// Sequencer (board orchestration) settings
    pub sequencer: SequencerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Conductor scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Dated sequence directory template; `{date}` expands to `YYYYMMDD`.
    #[serde(default = "default_sequence_dir")]
    pub sequence_dir: String,
    /// Cycle pace in seconds when no sequence ran to report a shot duration.
    #[serde(default = "default_pace")]
    pub default_pace_s: f64,
    /// Consecutive update failures before a parameter is removed from the
    /// active set.
    #[serde(default = "default_failure_limit")]
    pub update_failure_limit: u32,
    /// Self-pace cycles from reported shot durations. Off by default so
    /// tests and tools can drive `Advance` explicitly.
    #[serde(default)]
    pub auto_advance: bool,
    /// Parameters registered at startup.
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            sequence_dir: default_sequence_dir(),
            default_pace_s: default_pace(),
            update_failure_limit: default_failure_limit(),
            auto_advance: false,
            parameters: Vec::new(),
        }
    }
}

/// Parameter definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Unique parameter name
    pub name: String,
    /// Behavior type registered in the parameter catalog
    /// (generic, timestamp, sequence)
    pub r#type: String,
    /// Update order; higher runs first, `<= 0` never runs.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// A failing critical parameter aborts the whole cycle.
    #[serde(default)]
    pub critical: bool,
    /// Override the behavior's default read/advance policy.
    #[serde(default)]
    pub value_type: Option<ValueType>,
    /// Behavior-specific configuration
    #[serde(default)]
    pub config: ParameterSpecificConfig,
}

impl ParameterDefinition {
    pub fn new(name: impl Into<String>, r#type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            r#type: r#type.into(),
            priority: default_priority(),
            critical: false,
            value_type: None,
            config: ParameterSpecificConfig::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// Behavior-specific configuration, one optional section per builtin type
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParameterSpecificConfig {
    /// Sequence-driver configuration
    #[serde(default)]
    pub sequence: Option<SequenceParameterConfig>,
}

/// Sequence-driver parameter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceParameterConfig {
    /// Sequence file names run when no experiment queued anything else.
    pub default_sequence: Vec<String>,
    /// Override the conductor-wide dated sequence directory.
    #[serde(default)]
    pub sequence_dir: Option<String>,
}

/// Sequencer orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Canonical key of the channel whose step timing patterns default
    /// fills, normally the trigger line on the primary digital board.
    pub timing_reference: String,
    /// Board topology, registered once at startup.
    #[serde(default)]
    pub boards: Vec<BoardDefinition>,
}

/// Board definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardDefinition {
    /// Unique board identifier
    pub id: String,
    pub sequencer_type: SequencerType,
    /// Sequencer clock in Hz
    pub clock_hz: f64,
    /// Digital boards only: this board supplies the master trigger.
    #[serde(default)]
    pub primary: bool,
    /// DAC reference range in volts
    #[serde(default = "default_voltage_range")]
    pub voltage_range: (f64, f64),
    pub channels: Vec<ChannelDefinition>,
}

/// Channel definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDefinition {
    /// Channel name, e.g. "MOT coil"
    pub name: String,
    /// Physical location label, e.g. "A03"
    pub loc: String,
    #[serde(default)]
    pub mode: ChannelMode,
    #[serde(default)]
    pub manual_output: f64,
    /// Digital channels only: output wired inverted.
    #[serde(default)]
    pub invert: bool,
}

impl BoardDefinition {
    /// Build the runtime board, assigning channel ordinals in definition
    /// order and deriving canonical `Name@Loc` keys.
    pub fn build(&self) -> Board {
        Board {
            id: self.id.clone(),
            sequencer_type: self.sequencer_type,
            clock_hz: self.clock_hz,
            primary: self.primary,
            voltage_range: self.voltage_range,
            channels: self
                .channels
                .iter()
                .enumerate()
                .map(|(index, c)| Channel {
                    key: format!("{}@{}", c.name, c.loc),
                    name: c.name.clone(),
                    loc: c.loc.clone(),
                    index,
                    mode: c.mode,
                    manual_output: c.manual_output,
                    invert: c.invert,
                })
                .collect(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sequence_dir() -> String {
    "./data/{date}/sequences/".to_string()
}

fn default_pace() -> f64 {
    5.0
}

fn default_failure_limit() -> u32 {
    3
}

fn default_priority() -> i32 {
    1
}

fn default_voltage_range() -> (f64, f64) {
    (-10.0, 10.0)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ShotctlConfig {
    /// Load configuration from shotctl.toml and environment variables.
    ///
    /// Precedence (highest to lowest): `SHOTCTL_`-prefixed environment
    /// variables, then the TOML file. The result is validated before it is
    /// returned.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/shotctl.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SHOTCTL_").split("_"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Board ids, channel keys and parameter names are unique
    /// - Clocks are positive, digital boards fit their 64-bit output word
    /// - Exactly one primary digital board exists when any digital board does
    /// - The timing reference names a configured channel
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.conductor.default_pace_s <= 0.0 {
            return Err(ConfigError::ValidationError(
                "default_pace_s must be positive".to_string(),
            ));
        }

        let mut parameter_names = HashSet::new();
        for parameter in &self.conductor.parameters {
            if !parameter_names.insert(&parameter.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate parameter name '{}'",
                    parameter.name
                )));
            }
        }

        let mut board_ids = HashSet::new();
        let mut channel_keys = HashSet::new();
        let mut primaries = 0usize;
        let mut digital_boards = 0usize;
        for board in &self.sequencer.boards {
            if !board_ids.insert(&board.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate board id '{}'",
                    board.id
                )));
            }
            if board.clock_hz <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "Board '{}' clock_hz must be positive",
                    board.id
                )));
            }
            if board.sequencer_type == SequencerType::Digital {
                digital_boards += 1;
                if board.primary {
                    primaries += 1;
                }
                if board.channels.len() > 64 {
                    return Err(ConfigError::ValidationError(format!(
                        "Board '{}' has {} channels; digital boards hold at most 64",
                        board.id,
                        board.channels.len()
                    )));
                }
            } else if board.primary {
                return Err(ConfigError::ValidationError(format!(
                    "Board '{}' is marked primary but only digital boards trigger",
                    board.id
                )));
            }
            for channel in &board.channels {
                let key = format!("{}@{}", channel.name, channel.loc);
                if !channel_keys.insert(key.clone()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Duplicate channel key '{key}'"
                    )));
                }
            }
        }

        if digital_boards > 0 && primaries != 1 {
            return Err(ConfigError::ValidationError(format!(
                "Expected exactly one primary digital board, found {primaries}"
            )));
        }

        if !channel_keys.is_empty() && !channel_keys.contains(&self.sequencer.timing_reference) {
            return Err(ConfigError::ValidationError(format!(
                "Timing reference '{}' does not name a configured channel",
                self.sequencer.timing_reference
            )));
        }

        Ok(())
    }

    /// Build the runtime board registry from the definitions.
    pub fn boards(&self) -> Vec<Board> {
        self.sequencer
            .boards
            .iter()
            .map(BoardDefinition::build)
            .collect()
    }
}
