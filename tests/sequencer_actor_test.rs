//! Sequencer actor integration tests
//!
//! Spawns the orchestrator against a MockBus and verifies key resolution,
//! default fill, the program-all-before-start rule and the cross-board
//! start ordering.

use std::sync::Arc;

use kameo::Actor;
use serde_json::json;
use shotctl::actors::sequencer::{
    ChannelModeRequest, GetChannels, ManualOutputRequest, RunSequence, Sequencer, SequencerArgs,
};
use shotctl::compile::{Board, ChannelMode, SequencerType};
use shotctl::config::{BoardDefinition, ChannelDefinition};
use shotctl::hardware::{BusCall, MockBus};
use shotctl::sequence::{ResolvedSequence, SequenceDef};

fn channel(name: &str, loc: &str) -> ChannelDefinition {
    ChannelDefinition {
        name: name.to_string(),
        loc: loc.to_string(),
        mode: ChannelMode::Auto,
        manual_output: 0.0,
        invert: false,
    }
}

/// One board of every family, registered in a scrambled order on purpose.
fn boards() -> Vec<Board> {
    let definitions = vec![
        BoardDefinition {
            id: "digi0".to_string(),
            sequencer_type: SequencerType::Digital,
            clock_hz: 1000.0,
            primary: true,
            voltage_range: (0.0, 5.0),
            channels: vec![channel("TTL0", "D00"), channel("Trigger", "D15")],
        },
        BoardDefinition {
            id: "analog0".to_string(),
            sequencer_type: SequencerType::Analog,
            clock_hz: 1000.0,
            primary: false,
            voltage_range: (-10.0, 10.0),
            channels: vec![channel("DAC0", "A00"), channel("DAC1", "A01")],
        },
        BoardDefinition {
            id: "digi1".to_string(),
            sequencer_type: SequencerType::Digital,
            clock_hz: 1000.0,
            primary: false,
            voltage_range: (0.0, 5.0),
            channels: vec![channel("TTL16", "E00")],
        },
        BoardDefinition {
            id: "stable0".to_string(),
            sequencer_type: SequencerType::Stable,
            clock_hz: 1000.0,
            primary: false,
            voltage_range: (-5.0, 5.0),
            channels: vec![channel("SDAC0", "S00")],
        },
    ];
    definitions.iter().map(BoardDefinition::build).collect()
}

fn trigger_only_sequence() -> ResolvedSequence {
    SequenceDef::from_value(json!({
        "Trigger@D15": [{"dt": 0.25, "out": true}, {"dt": 0.25, "out": false}],
    }))
    .unwrap()
    .parse()
    .unwrap()
}

fn spawn_sequencer(bus: &MockBus) -> kameo::actor::ActorRef<Sequencer> {
    Sequencer::spawn(SequencerArgs {
        boards: boards(),
        bus: Arc::new(bus.clone()),
        timing_reference: "Trigger@D15".to_string(),
    })
}

#[tokio::test]
async fn boards_start_in_dependency_order() {
    let bus = MockBus::new();
    let sequencer = spawn_sequencer(&bus);

    let duration = sequencer
        .ask(RunSequence {
            sequence: trigger_only_sequence(),
        })
        .await
        .unwrap();
    assert!((duration - 0.5).abs() < 1e-12);

    // stable first, analog next, secondary digital, trigger master last
    assert_eq!(
        bus.started_boards(),
        vec!["stable0", "analog0", "digi1", "digi0"]
    );

    sequencer.kill();
    sequencer.wait_for_shutdown().await;
}

#[tokio::test]
async fn all_boards_program_before_any_board_starts() {
    let bus = MockBus::new();
    let sequencer = spawn_sequencer(&bus);

    sequencer
        .ask(RunSequence {
            sequence: trigger_only_sequence(),
        })
        .await
        .unwrap();

    let log = bus.call_log();
    let first_start = log
        .iter()
        .position(|c| matches!(c, BusCall::Start { .. }))
        .unwrap();
    assert_eq!(first_start, 4, "every program call precedes every start");
    assert_eq!(bus.programmed_boards().len(), 4);

    sequencer.kill();
    sequencer.wait_for_shutdown().await;
}

#[tokio::test]
async fn absent_channels_fill_from_manual_output() {
    let bus = MockBus::new();
    let sequencer = spawn_sequencer(&bus);

    sequencer
        .ask(RunSequence {
            sequence: trigger_only_sequence(),
        })
        .await
        .unwrap();

    // the analog board was never named in the sequence but still gets a
    // program of consistent duration
    let program = bus.program_for("analog0").unwrap();
    assert!(!program.is_empty());

    sequencer.kill();
    sequencer.wait_for_shutdown().await;
}

#[tokio::test]
async fn unknown_channel_is_fatal_before_any_hardware_call() {
    let bus = MockBus::new();
    let sequencer = spawn_sequencer(&bus);

    let sequence = SequenceDef::from_value(json!({
        "Trigger@D15": [{"dt": 0.25, "out": true}],
        "Nonesuch@Z99": [{"type": "lin", "dt": 0.25, "vf": 1.0}],
    }))
    .unwrap()
    .parse()
    .unwrap();

    let result = sequencer.ask(RunSequence { sequence }).await;
    assert!(result.is_err());
    assert!(bus.call_log().is_empty());

    sequencer.kill();
    sequencer.wait_for_shutdown().await;
}

#[tokio::test]
async fn programming_failure_leaves_every_board_unstarted() {
    let bus = MockBus::new();
    bus.fail_program_for("analog0");
    let sequencer = spawn_sequencer(&bus);

    let result = sequencer
        .ask(RunSequence {
            sequence: trigger_only_sequence(),
        })
        .await;
    assert!(result.is_err());
    assert!(bus.started_boards().is_empty());

    sequencer.kill();
    sequencer.wait_for_shutdown().await;
}

#[tokio::test]
async fn start_failure_stops_the_arming_walk() {
    let bus = MockBus::new();
    bus.fail_start_for("analog0");
    let sequencer = spawn_sequencer(&bus);

    let result = sequencer
        .ask(RunSequence {
            sequence: trigger_only_sequence(),
        })
        .await;
    assert!(result.is_err(), "a failed start is never reported as success");

    let started = bus.started_boards();
    // the trigger master was never armed after the failure
    assert!(!started.contains(&"digi0".to_string()));
    assert!(!started.contains(&"digi1".to_string()));

    sequencer.kill();
    sequencer.wait_for_shutdown().await;
}

#[tokio::test]
async fn channels_resolve_by_name_then_location() {
    let bus = MockBus::new();
    let sequencer = spawn_sequencer(&bus);

    // bare name
    let mode = sequencer
        .ask(ChannelModeRequest {
            channel_id: "DAC0".to_string(),
            mode: Some(ChannelMode::Manual),
        })
        .await
        .unwrap();
    assert_eq!(mode, ChannelMode::Manual);

    // location only
    let mode = sequencer
        .ask(ChannelModeRequest {
            channel_id: "@A00".to_string(),
            mode: None,
        })
        .await
        .unwrap();
    assert_eq!(mode, ChannelMode::Manual);

    let result = sequencer
        .ask(ChannelModeRequest {
            channel_id: "Nonesuch@Z99".to_string(),
            mode: None,
        })
        .await;
    assert!(result.is_err());

    sequencer.kill();
    sequencer.wait_for_shutdown().await;
}

#[tokio::test]
async fn manual_output_clamps_to_the_board_range() {
    let bus = MockBus::new();
    let sequencer = spawn_sequencer(&bus);

    let output = sequencer
        .ask(ManualOutputRequest {
            channel_id: "DAC0@A00".to_string(),
            output: Some(250.0),
        })
        .await
        .unwrap();
    assert_eq!(output, 10.0);

    // reads don't change state
    let output = sequencer
        .ask(ManualOutputRequest {
            channel_id: "DAC0@A00".to_string(),
            output: None,
        })
        .await
        .unwrap();
    assert_eq!(output, 10.0);

    sequencer.kill();
    sequencer.wait_for_shutdown().await;
}

#[tokio::test]
async fn get_channels_describes_the_whole_registry() {
    let bus = MockBus::new();
    let sequencer = spawn_sequencer(&bus);

    let channels = sequencer.ask(GetChannels).await.unwrap();
    assert_eq!(channels.len(), 6);
    let trigger = &channels["Trigger@D15"];
    assert_eq!(trigger.board_id, "digi0");
    assert_eq!(trigger.sequencer_type, SequencerType::Digital);

    sequencer.kill();
    sequencer.wait_for_shutdown().await;
}
