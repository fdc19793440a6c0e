//! Run the full conductor/sequencer stack against the mock bus.
//!
//! Builds a small board topology, writes a throwaway sequence file, queues a
//! two-point scan and lets the conductor pace itself through a few shots.
//!
//! ```bash
//! cargo run --example mock_cycle
//! ```

use std::sync::Arc;

use kameo::Actor;
use serde_json::json;
use shotctl::actors::conductor::{
    Advance, Conductor, ConductorArgs, Experiment, QueueExperiment, SetParameterValues,
    SubscribeEvents,
};
use shotctl::actors::sequencer::{Sequencer, SequencerArgs};
use shotctl::compile::{ChannelMode, SequencerType};
use shotctl::config::{
    BoardDefinition, ChannelDefinition, ConductorConfig, ParameterDefinition,
    ParameterSpecificConfig, SequenceParameterConfig,
};
use shotctl::hardware::MockBus;

fn channel(name: &str, loc: &str) -> ChannelDefinition {
    ChannelDefinition {
        name: name.to_string(),
        loc: loc.to_string(),
        mode: ChannelMode::Auto,
        manual_output: 0.0,
        invert: false,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shotctl=debug".into()),
        )
        .init();

    // throwaway dated sequence directory with one file
    let root = tempfile::tempdir()?;
    let template = format!("{}/{{date}}/sequences/", root.path().display());
    let today = chrono::Local::now().date_naive().format("%Y%m%d").to_string();
    let dir = root.path().join(today).join("sequences");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(
        dir.join("mot_load"),
        serde_json::to_string_pretty(&json!({
            "Trigger@D15": [{"dt": 0.2, "out": 1}, {"dt": 0.8, "out": 0}],
            "MOT coil@A00": [
                {"type": "lin", "dt": 0.3, "vf": "*mot_current"},
                {"type": "exp", "dt": 0.6, "vf": 0.0, "tau": 0.15, "pts": 20},
                {"type": "s", "dt": 0.1, "vf": 0.0},
            ],
        }))?,
    )?;

    let boards = vec![
        BoardDefinition {
            id: "Ana01".to_string(),
            sequencer_type: SequencerType::Analog,
            clock_hz: 48e6 / (8.0 * 2.0 + 2.0),
            primary: false,
            voltage_range: (-10.0, 10.0),
            channels: vec![channel("MOT coil", "A00"), channel("Bias", "A01")],
        },
        BoardDefinition {
            id: "Digi01".to_string(),
            sequencer_type: SequencerType::Digital,
            clock_hz: 50e6,
            primary: true,
            voltage_range: (0.0, 5.0),
            channels: vec![channel("Shutter", "D00"), channel("Trigger", "D15")],
        },
    ];

    let bus = MockBus::new().with_latency(5);
    let sequencer = Sequencer::spawn(SequencerArgs {
        boards: boards.iter().map(BoardDefinition::build).collect(),
        bus: Arc::new(bus.clone()),
        timing_reference: "Trigger@D15".to_string(),
    });

    let mut sequence_param = ParameterDefinition::new("sequence", "sequence").with_priority(10);
    sequence_param.config = ParameterSpecificConfig {
        sequence: Some(SequenceParameterConfig {
            default_sequence: vec!["mot_load".to_string()],
            sequence_dir: Some(template),
        }),
    };
    let conductor_config = ConductorConfig {
        parameters: vec![
            sequence_param,
            ParameterDefinition::new("shot_time", "timestamp").with_priority(2),
        ],
        ..Default::default()
    };

    let conductor = Conductor::spawn(ConductorArgs::new(
        conductor_config,
        Some(sequencer.clone()),
    ));
    conductor.wait_for_startup().await;

    let mut events = conductor.ask(SubscribeEvents).await?;
    conductor
        .ask(SetParameterValues {
            values: [("mot_current".to_string(), json!(0.0))].into(),
        })
        .await?;
    conductor
        .ask(QueueExperiment {
            experiment: Experiment {
                name: "mot_current_scan".to_string(),
                parameter_values: [("mot_current".to_string(), json!([2.0, 4.0]))].into(),
                loop_: false,
            },
            run_next: false,
        })
        .await?;

    for _ in 0..3 {
        let report = conductor.ask(Advance).await?;
        println!(
            "shot {} finished, duration {:?} s, boards started: {:?}",
            report.shot,
            report.shot_duration,
            bus.started_boards()
        );
        bus.clear_log();
    }

    while let Ok(event) = events.try_recv() {
        println!("event: {event:?}");
    }

    conductor.kill();
    conductor.wait_for_shutdown().await;
    sequencer.kill();
    sequencer.wait_for_shutdown().await;
    Ok(())
}
