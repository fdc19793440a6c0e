//! Compile pipeline integration tests
//!
//! Drives the pure path end to end: raw sequence JSON -> reference
//! substitution -> typed steps -> per-board byte programs. No actors, no
//! I/O.

use std::collections::BTreeMap;

use serde_json::json;
use shotctl::compile::board::{Board, Channel, ChannelMode, SequencerType};
use shotctl::compile::{decode_ramp_rate, Waveform};
use shotctl::sequence::SequenceDef;

fn analog_board(channels: &[(&str, &str)]) -> Board {
    Board {
        id: "analog0".to_string(),
        sequencer_type: SequencerType::Analog,
        clock_hz: 1000.0,
        primary: false,
        voltage_range: (-10.0, 10.0),
        channels: channels
            .iter()
            .enumerate()
            .map(|(index, (name, loc))| Channel {
                key: format!("{name}@{loc}"),
                name: name.to_string(),
                loc: loc.to_string(),
                index,
                mode: ChannelMode::Auto,
                manual_output: 0.0,
                invert: false,
            })
            .collect(),
    }
}

/// The canonical scenario: a one-second linear ramp to 5 V at 1 kHz
/// compiles to 1000 ticks and a ramp-rate word reconstructing 5 V.
#[test]
fn one_second_ramp_compiles_to_1000_ticks() {
    let board = analog_board(&[("ch1", "A00")]);
    let sequence = SequenceDef::from_value(json!({
        "ch1@A00": [{"type": "lin", "dt": 1.0, "vf": 5.0}],
    }))
    .unwrap()
    .parse()
    .unwrap();

    let bytes = board.program(&sequence.channels, "none").unwrap();

    let word = u16::from_be_bytes([bytes[0], bytes[1]]);
    let ticks = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    assert_eq!(ticks, 1000);

    let dv = decode_ramp_rate(word, ticks, (-10.0, 10.0));
    let lsb = 20.0 / (f64::from(u16::MAX));
    assert!(
        (dv - 5.0).abs() < 4.0 * lsb,
        "decoded {dv} V, expected 5 V"
    );
}

#[test]
fn identical_input_produces_byte_identical_output() {
    let board = analog_board(&[("a", "A00"), ("b", "A01")]);
    let sequence = SequenceDef::from_value(json!({
        "a@A00": [
            {"type": "exp", "dt": 0.8, "vf": 5.0, "tau": 0.2, "pts": 10},
            {"type": "lin", "dt": 0.2, "vf": 0.0},
        ],
        "b@A01": [{"type": "scurve", "dt": 1.0, "vi": 0.0, "vf": -3.0, "k": 2.0}],
    }))
    .unwrap()
    .parse()
    .unwrap();

    let first = board.program(&sequence.channels, "none").unwrap();
    let second = board.program(&sequence.channels, "none").unwrap();
    assert_eq!(first, second);
}

#[test]
fn parameter_references_resolve_before_compilation() {
    let raw = SequenceDef::from_value(json!({
        "ch1@A00": [
            {"type": "lin", "dt": "*ramp_time", "vf": "*bias"},
        ],
    }))
    .unwrap();
    assert_eq!(raw.parameter_refs(), vec!["*ramp_time", "*bias"]);

    let mut values = BTreeMap::new();
    values.insert("*ramp_time".to_string(), json!(2.0));
    values.insert("*bias".to_string(), json!(-1.5));
    let resolved = raw.substitute(&values).unwrap().parse().unwrap();

    assert!((resolved.duration() - 2.0).abs() < 1e-12);

    let board = analog_board(&[("ch1", "A00")]);
    let bytes = board.program(&resolved.channels, "none").unwrap();
    let ticks = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    assert_eq!(ticks, 2000);
}

/// Decomposition never loses time: a mixed-shape channel's chords sum to
/// the declared durations, and the inspectable waveform agrees.
#[test]
fn waveform_duration_matches_declared_timing() {
    let sequence = SequenceDef::from_value(json!({
        "ch1@A00": [
            {"type": "s", "dt": 0.1, "vf": 2.0},
            {"type": "sexp", "dt": 0.9, "vi": 2.0, "vf": 0.5, "tau": 0.3, "pts": 15},
            {"type": "scurve", "dt": 1.0, "vi": 0.5, "vf": 8.0, "k": 1.0, "pts": 20},
        ],
    }))
    .unwrap()
    .parse()
    .unwrap();

    let steps = match &sequence.channels["ch1@A00"] {
        shotctl::sequence::ChannelSteps::Analog(steps) => steps.clone(),
        other => panic!("expected analog steps, got {:?}", other),
    };
    let waveform = Waveform::from_segments(&steps, 0.0).unwrap();
    assert!((waveform.duration() - 2.0).abs() < 1e-9);
    // endpoints are pinned exactly
    assert_eq!(waveform.sample(5.0), 8.0);
}

#[test]
fn malformed_ramps_are_rejected_not_clamped() {
    let board = analog_board(&[("ch1", "A00")]);
    let sequence = SequenceDef::from_value(json!({
        "ch1@A00": [{"type": "lin", "dt": -1.0, "vf": 5.0}],
    }))
    .unwrap()
    .parse()
    .unwrap();
    assert!(board.program(&sequence.channels, "none").is_err());
}

#[test]
fn unknown_ramp_tags_fail_at_parse() {
    let result = SequenceDef::from_value(json!({
        "ch1@A00": [{"type": "wiggle", "dt": 1.0, "vf": 5.0}],
    }))
    .unwrap()
    .parse();
    assert!(result.is_err());
}
