//! Conductor Scheduler Actor
//!
//! Coordinates setting experiment parameters, one cycle per shot. Every
//! controllable quantity registers as a named parameter: a value state
//! machine ([`ParameterValue`]) plus a pluggable [`ParameterBehavior`] that
//! talks to whatever hardware realizes the quantity.
//!
//! Each cycle the conductor:
//! 1. pops the next queued experiment when no parameter has scan points left,
//! 2. updates every parameter with `priority > 0`, highest priority first
//!    (stable order, ties keep registration order), isolating per-parameter
//!    failures so one broken device never blocks the rest,
//! 3. advances every parameter's value queue for the next shot.
//!
//! The `sequence` behavior reports the compiled shot duration back from the
//! sequencer, and the conductor paces its own next cycle from it when
//! `auto_advance` is configured.
//!
//! Behaviors are registered through a [`ParameterCatalog`], so deployments
//! can add device-specific parameters without touching the scheduler.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate, Utc};
use kameo::actor::ActorRef;
use kameo::error::BoxSendError;
use kameo::message::{Context, Message};
use kameo::Actor;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::actors::sequencer::{RunSequence, Sequencer};
use crate::config::{ConductorConfig, ParameterDefinition};
use crate::error::ParameterError;
use crate::params::{ParameterValue, ValueType};
use crate::sequence::SequenceDef;

/// Capacity of the conductor's event fan-out channel.
const EVENT_CAPACITY: usize = 64;
/// Delay before the first self-paced cycle after startup.
const STARTUP_DELAY: Duration = Duration::from_millis(100);

/// Notifications published on the conductor's broadcast channel.
#[derive(Debug, Clone)]
pub enum ConductorEvent {
    /// A cycle completed and every parameter advanced.
    ParametersUpdated { shot: u64 },
    ExperimentStarted { name: String },
    ExperimentStopped,
    /// A parameter left the active set, at init or after repeated update
    /// failures.
    ParameterRemoved { name: String },
}

/// One queued unit of work: parameter values to iterate over, by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    #[serde(default)]
    pub parameter_values: BTreeMap<String, Value>,
    /// Re-queue at the front when popped, repeating until stopped.
    #[serde(default, rename = "loop")]
    pub loop_: bool,
}

/// What a behavior sees during `update`.
pub struct UpdateContext<'a> {
    /// Current values of every registered parameter, by name.
    pub values: &'a BTreeMap<String, Value>,
    /// The sequencer actor, when one is attached.
    pub sequencer: Option<&'a ActorRef<Sequencer>>,
    /// Dated sequence directory template.
    pub sequence_dir: &'a str,
    pub today: NaiveDate,
}

/// What a behavior reports back from `update`.
#[derive(Debug, Default)]
pub struct UpdateReport {
    /// Duration of the shot this update launched; paces the next cycle.
    pub shot_duration: Option<f64>,
}

/// Per-quantity behavior behind a conductor parameter. Implementations talk
/// to hardware; the conductor owns the value state machine and the failure
/// policy.
#[async_trait]
pub trait ParameterBehavior: Send + Sync {
    /// Read/advance policy when the definition does not override it.
    fn default_value_type(&self) -> ValueType {
        ValueType::Single
    }

    /// Value restored when an experiment is stopped, if any.
    fn reset_value(&self) -> Option<Value> {
        None
    }

    /// Called once, on loading the parameter into the conductor.
    async fn initialize(&mut self, _cx: &UpdateContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called at the beginning of every cycle.
    async fn update(
        &mut self,
        cx: &UpdateContext<'_>,
        value: &mut ParameterValue,
    ) -> Result<UpdateReport>;

    /// Close connections on removal.
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

type BehaviorBuilder =
    Arc<dyn Fn(&ParameterDefinition) -> Result<Box<dyn ParameterBehavior>> + Send + Sync>;

/// Factory registry mapping parameter `type` strings to behaviors.
#[derive(Clone)]
pub struct ParameterCatalog {
    builders: HashMap<String, BehaviorBuilder>,
}

impl ParameterCatalog {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// The builtin behaviors: `generic`, `timestamp`, `sequence`.
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register_factory("generic", Arc::new(|_| boxed(GenericParameter)));
        catalog.register_factory("timestamp", Arc::new(|_| boxed(TimestampParameter)));
        catalog.register_factory(
            "sequence",
            Arc::new(|definition| boxed(SequenceParameter::from_definition(definition))),
        );
        catalog
    }

    pub fn register_factory(&mut self, parameter_type: impl Into<String>, builder: BehaviorBuilder) {
        self.builders.insert(parameter_type.into(), builder);
    }

    pub fn build(&self, definition: &ParameterDefinition) -> Result<Box<dyn ParameterBehavior>> {
        let builder = self
            .builders
            .get(&definition.r#type)
            .ok_or_else(|| ParameterError::UnknownType(definition.r#type.clone()))?;
        builder(definition)
    }
}

impl Default for ParameterCatalog {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn boxed<B: ParameterBehavior + 'static>(behavior: B) -> Result<Box<dyn ParameterBehavior>> {
    Ok(Box::new(behavior))
}

// ============================================================================
// Builtin behaviors
// ============================================================================

/// Pure value holder with no hardware side; what ad-hoc `*scan` parameters
/// register as.
struct GenericParameter;

#[async_trait]
impl ParameterBehavior for GenericParameter {
    async fn update(
        &mut self,
        _cx: &UpdateContext<'_>,
        _value: &mut ParameterValue,
    ) -> Result<UpdateReport> {
        Ok(UpdateReport::default())
    }
}

/// Records when each shot ran. Data-typed: read-only for clients.
struct TimestampParameter;

#[async_trait]
impl ParameterBehavior for TimestampParameter {
    fn default_value_type(&self) -> ValueType {
        ValueType::Data
    }

    async fn update(
        &mut self,
        _cx: &UpdateContext<'_>,
        value: &mut ParameterValue,
    ) -> Result<UpdateReport> {
        value.set(json!(Utc::now().timestamp_micros() as f64 * 1e-6));
        Ok(UpdateReport::default())
    }
}

/// Drives the sequencer. The value is a list of sequence names (or inline
/// definitions) concatenated into one shot; `*name` references inside the
/// files resolve against current parameter values before compilation.
struct SequenceParameter {
    default_sequence: Vec<String>,
    sequence_dir: Option<String>,
}

impl SequenceParameter {
    fn from_definition(definition: &ParameterDefinition) -> Self {
        let config = definition.config.sequence.clone();
        Self {
            default_sequence: config
                .as_ref()
                .map(|c| c.default_sequence.clone())
                .unwrap_or_default(),
            sequence_dir: config.and_then(|c| c.sequence_dir),
        }
    }

    /// The startup/reset value: a queue holding the default sequence list.
    fn default_value(&self) -> Value {
        json!([self.default_sequence])
    }
}

#[async_trait]
impl ParameterBehavior for SequenceParameter {
    fn default_value_type(&self) -> ValueType {
        ValueType::List
    }

    fn reset_value(&self) -> Option<Value> {
        Some(self.default_value())
    }

    async fn update(
        &mut self,
        cx: &UpdateContext<'_>,
        value: &mut ParameterValue,
    ) -> Result<UpdateReport> {
        let entries = match value.current() {
            Value::Array(entries) if !entries.is_empty() => entries,
            _ => return Ok(UpdateReport::default()),
        };
        let sequencer = cx
            .sequencer
            .ok_or_else(|| anyhow!("no sequencer attached to the conductor"))?;
        let dir = self.sequence_dir.as_deref().unwrap_or(cx.sequence_dir);

        let mut parts = Vec::with_capacity(entries.len());
        for entry in &entries {
            let part = match entry {
                Value::String(name) => SequenceDef::load_named(dir, name, cx.today)
                    .with_context(|| format!("loading sequence '{name}'"))?,
                inline @ Value::Object(_) => SequenceDef::from_value(inline.clone())?,
                other => bail!("sequence entry must be a name or an inline definition, got {other}"),
            };
            parts.push(part);
        }
        let combined = SequenceDef::combine(parts)?;

        let mut substitutions = BTreeMap::new();
        for reference in combined.parameter_refs() {
            let name = reference.trim_start_matches('*');
            let value = cx
                .values
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("sequence references unknown parameter '{name}'"))?;
            substitutions.insert(reference, value);
        }
        let resolved = combined.substitute(&substitutions)?.parse()?;

        let duration = sequencer
            .ask(RunSequence { sequence: resolved })
            .await
            .context("sequencer rejected the shot")?;
        Ok(UpdateReport {
            shot_duration: Some(duration),
        })
    }
}

// ============================================================================
// The actor
// ============================================================================

struct ParameterSlot {
    name: String,
    priority: i32,
    critical: bool,
    value: ParameterValue,
    behavior: Box<dyn ParameterBehavior>,
    failures: u32,
}

/// Arguments used to bootstrap the Conductor actor.
pub struct ConductorArgs {
    pub config: ConductorConfig,
    pub catalog: ParameterCatalog,
    pub sequencer: Option<ActorRef<Sequencer>>,
}

impl ConductorArgs {
    pub fn new(config: ConductorConfig, sequencer: Option<ActorRef<Sequencer>>) -> Self {
        Self {
            config,
            catalog: ParameterCatalog::with_builtin(),
            sequencer,
        }
    }

    pub fn with_catalog(mut self, catalog: ParameterCatalog) -> Self {
        self.catalog = catalog;
        self
    }
}

/// Conductor scheduler state.
pub struct Conductor {
    config: ConductorConfig,
    catalog: ParameterCatalog,
    sequencer: Option<ActorRef<Sequencer>>,
    /// Registration order; the stable tie-breaker for equal priorities.
    parameters: Vec<ParameterSlot>,
    experiment_queue: VecDeque<Experiment>,
    events: broadcast::Sender<ConductorEvent>,
    shot: u64,
    actor_ref: ActorRef<Conductor>,
}

impl Actor for Conductor {
    type Args = ConductorArgs;
    type Error = BoxSendError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut conductor = Conductor {
            config: args.config,
            catalog: args.catalog,
            sequencer: args.sequencer,
            parameters: Vec::new(),
            experiment_queue: VecDeque::new(),
            events,
            shot: 0,
            actor_ref,
        };

        let definitions = conductor.config.parameters.clone();
        for definition in definitions {
            if let Err(err) = conductor.register_parameter(&definition).await {
                error!(parameter = %definition.name, ?err, "failed to register parameter");
            }
        }
        info!(
            parameters = conductor.parameters.len(),
            auto_advance = conductor.config.auto_advance,
            "Conductor started"
        );

        if conductor.config.auto_advance {
            conductor.schedule_advance(STARTUP_DELAY.as_secs_f64());
        }
        Ok(conductor)
    }
}

impl Conductor {
    fn slot_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|slot| slot.name == name)
    }

    fn snapshot_values(&self) -> BTreeMap<String, Value> {
        self.parameters
            .iter()
            .map(|slot| (slot.name.clone(), slot.value.current()))
            .collect()
    }

    /// Shots left before every scan queue runs dry, counting pending heads.
    fn remaining_points(&self) -> usize {
        self.parameters
            .iter()
            .filter(|slot| slot.priority > 0)
            .map(|slot| slot.value.pending_runs())
            .max()
            .unwrap_or(0)
    }

    async fn register_parameter(&mut self, definition: &ParameterDefinition) -> Result<()> {
        if self.slot_index(&definition.name).is_some() {
            return Err(ParameterError::AlreadyRegistered(definition.name.clone()).into());
        }
        let mut behavior = self.catalog.build(definition)?;
        let value_type = definition
            .value_type
            .unwrap_or_else(|| behavior.default_value_type());
        let mut value = ParameterValue::new(value_type);
        if let Some(initial) = behavior.reset_value() {
            value.set(initial);
        }

        let snapshot = self.snapshot_values();
        let cx = UpdateContext {
            values: &snapshot,
            sequencer: self.sequencer.as_ref(),
            sequence_dir: &self.config.sequence_dir,
            today: Local::now().date_naive(),
        };
        if let Err(source) = behavior.initialize(&cx).await {
            // degrade gracefully: the parameter never enters the active set
            let _ = self.events.send(ConductorEvent::ParameterRemoved {
                name: definition.name.clone(),
            });
            return Err(ParameterError::InitFailed {
                name: definition.name.clone(),
                source,
            }
            .into());
        }

        debug!(parameter = %definition.name, kind = %definition.r#type, "parameter registered");
        self.parameters.push(ParameterSlot {
            name: definition.name.clone(),
            priority: definition.priority,
            critical: definition.critical,
            value,
            behavior,
            failures: 0,
        });
        Ok(())
    }

    async fn remove_parameter(&mut self, name: &str) -> Result<()> {
        let index = self
            .slot_index(name)
            .ok_or_else(|| ParameterError::NotRegistered(name.to_string()))?;
        let mut slot = self.parameters.remove(index);
        if let Err(err) = slot.behavior.stop().await {
            warn!(parameter = %name, ?err, "parameter stop failed");
        }
        let _ = self.events.send(ConductorEvent::ParameterRemoved {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn set_parameter_value(&mut self, name: &str, value: Value) -> Result<()> {
        if self.slot_index(name).is_none() {
            // unknown names become plain value holders, so clients can stash
            // scan variables without pre-registration
            self.register_parameter(&ParameterDefinition::new(name, "generic"))
                .await?;
        }
        let index = self.slot_index(name).expect("registered above");
        self.parameters[index].value.set(value);
        Ok(())
    }

    async fn advance_experiment(&mut self) -> Result<bool> {
        let Some(experiment) = self.experiment_queue.pop_front() else {
            return Ok(false);
        };
        let _ = self.events.send(ConductorEvent::ExperimentStopped);
        if experiment.loop_ {
            // a looping experiment immediately re-queues itself
            self.experiment_queue.push_front(experiment.clone());
        }
        for (name, value) in &experiment.parameter_values {
            self.set_parameter_value(name, value.clone()).await?;
        }
        info!(experiment = %experiment.name, queued = self.experiment_queue.len(), "experiment started");
        let _ = self.events.send(ConductorEvent::ExperimentStarted {
            name: experiment.name,
        });
        Ok(true)
    }

    async fn run_cycle(&mut self) -> Result<CycleReport> {
        let pending = self.remaining_points();
        if pending == 0 {
            self.advance_experiment().await?;
        } else {
            debug!(remaining = pending, "scan points remaining");
        }

        // priority order: higher first, ties in registration order
        let mut order: Vec<usize> = (0..self.parameters.len())
            .filter(|&i| self.parameters[i].priority > 0)
            .collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.parameters[i].priority));

        let sequencer = self.sequencer.clone();
        let sequence_dir = self.config.sequence_dir.clone();
        let today = Local::now().date_naive();
        let limit = self.config.update_failure_limit;

        let mut shot_duration = None;
        let mut removals = Vec::new();
        for &index in &order {
            let snapshot = self.snapshot_values();
            let slot = &mut self.parameters[index];
            let cx = UpdateContext {
                values: &snapshot,
                sequencer: sequencer.as_ref(),
                sequence_dir: &sequence_dir,
                today,
            };
            match slot.behavior.update(&cx, &mut slot.value).await {
                Ok(report) => {
                    slot.failures = 0;
                    if report.shot_duration.is_some() {
                        shot_duration = report.shot_duration;
                    }
                }
                Err(err) if slot.critical => {
                    error!(parameter = %slot.name, ?err, "critical parameter failed; aborting cycle");
                    return Err(ParameterError::CriticalFailure(slot.name.clone()).into());
                }
                Err(err) => {
                    slot.failures += 1;
                    warn!(
                        parameter = %slot.name,
                        failures = slot.failures,
                        ?err,
                        "parameter update failed; cycle continues"
                    );
                    if slot.failures >= limit {
                        removals.push(slot.name.clone());
                    }
                }
            }
        }
        for name in removals {
            warn!(parameter = %name, "removing parameter after repeated update failures");
            self.remove_parameter(&name).await.ok();
        }

        // prepare next cycle's values
        for slot in &mut self.parameters {
            if slot.priority > 0 {
                slot.value.advance();
            }
        }

        self.shot += 1;
        let _ = self
            .events
            .send(ConductorEvent::ParametersUpdated { shot: self.shot });

        if self.config.auto_advance {
            self.schedule_advance(shot_duration.unwrap_or(self.config.default_pace_s));
        }
        Ok(CycleReport {
            shot: self.shot,
            shot_duration,
        })
    }

    fn schedule_advance(&self, delay_s: f64) {
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay_s)).await;
            if let Err(err) = actor_ref.tell(Advance).await {
                error!(?err, "failed to queue next cycle");
            }
        });
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Message: run one cycle now. Replies with the shot number and the shot
/// duration the sequence reported, if one ran.
#[derive(Debug, Clone)]
pub struct Advance;

/// Cycle summary returned from [`Advance`].
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub shot: u64,
    pub shot_duration: Option<f64>,
}

impl Message<Advance> for Conductor {
    type Reply = Result<CycleReport>;

    async fn handle(&mut self, _msg: Advance, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.run_cycle().await
    }
}

/// Message: load parameters into the conductor.
#[derive(Debug, Clone)]
pub struct RegisterParameters {
    pub definitions: Vec<ParameterDefinition>,
}

impl Message<RegisterParameters> for Conductor {
    type Reply = Result<()>;

    async fn handle(
        &mut self,
        msg: RegisterParameters,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        for definition in &msg.definitions {
            self.register_parameter(definition).await?;
        }
        Ok(())
    }
}

/// Message: remove parameters from the active set.
#[derive(Debug, Clone)]
pub struct RemoveParameters {
    pub names: Vec<String>,
}

impl Message<RemoveParameters> for Conductor {
    type Reply = Result<()>;

    async fn handle(
        &mut self,
        msg: RemoveParameters,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        for name in &msg.names {
            self.remove_parameter(name).await?;
        }
        Ok(())
    }
}

/// Message: assign parameter values; unknown names register as `generic`.
#[derive(Debug, Clone)]
pub struct SetParameterValues {
    pub values: BTreeMap<String, Value>,
}

impl Message<SetParameterValues> for Conductor {
    type Reply = Result<()>;

    async fn handle(
        &mut self,
        msg: SetParameterValues,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        for (name, value) in msg.values {
            self.set_parameter_value(&name, value).await?;
        }
        Ok(())
    }
}

/// Message: read current parameter values. `None` reads everything.
#[derive(Debug, Clone)]
pub struct GetParameterValues {
    pub names: Option<Vec<String>>,
}

impl Message<GetParameterValues> for Conductor {
    type Reply = Result<BTreeMap<String, Value>>;

    async fn handle(
        &mut self,
        msg: GetParameterValues,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match msg.names {
            None => Ok(self.snapshot_values()),
            Some(names) => {
                let mut values = BTreeMap::new();
                for name in names {
                    let index = self
                        .slot_index(&name)
                        .ok_or_else(|| ParameterError::NotRegistered(name.clone()))?;
                    values.insert(name, self.parameters[index].value.current());
                }
                Ok(values)
            }
        }
    }
}

/// Message: append an experiment to the work queue. Replies with the queue
/// length.
#[derive(Debug, Clone)]
pub struct QueueExperiment {
    pub experiment: Experiment,
    /// Jump the queue and run after the current experiment.
    pub run_next: bool,
}

impl Message<QueueExperiment> for Conductor {
    type Reply = Result<usize>;

    async fn handle(
        &mut self,
        msg: QueueExperiment,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.run_next {
            self.experiment_queue.push_front(msg.experiment);
        } else {
            self.experiment_queue.push_back(msg.experiment);
        }
        Ok(self.experiment_queue.len())
    }
}

/// Message: replace the whole experiment queue.
#[derive(Debug, Clone)]
pub struct SetExperimentQueue {
    pub experiments: Vec<Experiment>,
}

impl Message<SetExperimentQueue> for Conductor {
    type Reply = Result<usize>;

    async fn handle(
        &mut self,
        msg: SetExperimentQueue,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.experiment_queue = msg.experiments.into();
        Ok(self.experiment_queue.len())
    }
}

/// Message: stop scanning. Queued value lists collapse to their current
/// single value and behaviors restore their reset values (the sequence
/// parameter returns to its default sequence).
#[derive(Debug, Clone)]
pub struct StopExperiment;

impl Message<StopExperiment> for Conductor {
    type Reply = Result<()>;

    async fn handle(
        &mut self,
        _msg: StopExperiment,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        for slot in &mut self.parameters {
            slot.value.collapse();
            if let Some(reset) = slot.behavior.reset_value() {
                slot.value.set(reset);
            }
        }
        let _ = self.events.send(ConductorEvent::ExperimentStopped);
        Ok(())
    }
}

/// Message: how many shots remain before every scan queue runs dry.
#[derive(Debug, Clone)]
pub struct RemainingPoints;

impl Message<RemainingPoints> for Conductor {
    type Reply = Result<usize>;

    async fn handle(
        &mut self,
        _msg: RemainingPoints,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.remaining_points())
    }
}

/// Message: subscribe to conductor notifications.
#[derive(Debug, Clone)]
pub struct SubscribeEvents;

impl Message<SubscribeEvents> for Conductor {
    type Reply = Result<broadcast::Receiver<ConductorEvent>>;

    async fn handle(
        &mut self,
        _msg: SubscribeEvents,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.events.subscribe())
    }
}
