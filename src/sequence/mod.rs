//! Declarative sequence definitions.
//!
//! A sequence maps channel keys to ordered step lists: ramp segments on
//! analog channels, TTL logic steps on digital channels. Definitions are
//! loaded (never authored) from named JSON files in a dated directory tree,
//! may reference conductor parameters with `*name` strings anywhere a number
//! is expected, and stay untyped JSON until every reference has been
//! substituted. [`SequenceDef::parse`] then produces the typed
//! [`ResolvedSequence`] the compile pipeline consumes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{Days, NaiveDate};
use serde_json::Value;
use tracing::debug;

use crate::compile::ramp::{LogicStep, RampSegment};
use crate::error::{CompileError, SequenceError};

/// How many days back the dated directory search walks before giving up.
const SEQUENCE_SEARCH_DAYS: u64 = 365;

/// An unresolved sequence definition: channel key -> raw step list. Values
/// may still contain `*name` parameter references and `sub` groupings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceDef {
    pub channels: BTreeMap<String, Vec<Value>>,
}

/// A fully substituted, typed sequence ready for compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSequence {
    pub channels: BTreeMap<String, ChannelSteps>,
}

/// A channel's typed step list.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSteps {
    Analog(Vec<RampSegment>),
    Digital(Vec<LogicStep>),
}

impl ChannelSteps {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ChannelSteps::Analog(_) => "analog ramp",
            ChannelSteps::Digital(_) => "digital logic",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChannelSteps::Analog(steps) => steps.len(),
            ChannelSteps::Digital(steps) => steps.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-step durations in seconds.
    pub fn durations(&self) -> Vec<f64> {
        match self {
            ChannelSteps::Analog(steps) => steps.iter().map(|s| s.dt).collect(),
            ChannelSteps::Digital(steps) => steps.iter().map(|s| s.dt).collect(),
        }
    }

    pub fn duration(&self) -> f64 {
        self.durations().iter().sum()
    }
}

impl ResolvedSequence {
    /// Total duration: the maximum over channels of summed step durations.
    pub fn duration(&self) -> f64 {
        self.channels
            .values()
            .map(ChannelSteps::duration)
            .fold(0.0, f64::max)
    }
}

impl SequenceDef {
    /// Accept either a bare channel map or the archival `{"sequence": {...}}`
    /// wrapper written by the data system.
    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        let map = match value {
            Value::Object(mut object) => match object.remove("sequence") {
                Some(Value::Object(inner)) => inner,
                Some(other) => bail!("'sequence' entry is {}, expected an object", kind_of(&other)),
                None => object,
            },
            other => bail!("sequence definition is {}, expected an object", kind_of(&other)),
        };

        let mut channels = BTreeMap::new();
        for (key, steps) in map {
            match steps {
                Value::Array(steps) => {
                    channels.insert(key, steps);
                }
                other => bail!(
                    "channel '{}' carries {}, expected a step list",
                    key,
                    kind_of(&other)
                ),
            }
        }
        Ok(Self { channels })
    }

    /// Load a named sequence. An existing path is read directly; otherwise
    /// the dated directory tree is searched from `today` backwards, so
    /// yesterday's sequences keep working after midnight.
    pub fn load_named(dir_template: &str, name: &str, today: NaiveDate) -> anyhow::Result<Self> {
        let path = resolve_path(dir_template, name, today)
            .with_context(|| format!("sequence '{name}' not found"))?;
        debug!(sequence = %name, path = %path.display(), "loading sequence file");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading sequence file {}", path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing sequence file {}", path.display()))?;
        Self::from_value(value)
    }

    /// Concatenate several definitions channel-wise, in order.
    pub fn combine(sequences: Vec<SequenceDef>) -> anyhow::Result<Self> {
        let mut iter = sequences.into_iter();
        let mut combined = match iter.next() {
            Some(first) => first,
            None => return Ok(Self::default()),
        };
        for sequence in iter {
            if sequence.channels.keys().ne(combined.channels.keys()) {
                bail!("combined sequences do not agree on their channel sets");
            }
            for (key, steps) in sequence.channels {
                combined
                    .channels
                    .get_mut(&key)
                    .expect("key sets verified equal")
                    .extend(steps);
            }
        }
        Ok(combined)
    }

    /// Collect every `*name` parameter reference, at any nesting depth, in
    /// first-appearance order.
    pub fn parameter_refs(&self) -> Vec<String> {
        let mut refs = Vec::new();
        for steps in self.channels.values() {
            for step in steps {
                collect_refs(step, &mut refs);
            }
        }
        refs
    }

    /// Replace every `*name` reference with its concrete value. Substitution
    /// is total: a reference with no value is an error, never passed through.
    pub fn substitute(
        &self,
        values: &BTreeMap<String, Value>,
    ) -> Result<SequenceDef, SequenceError> {
        let mut channels = BTreeMap::new();
        for (key, steps) in &self.channels {
            let steps = steps
                .iter()
                .map(|step| substitute_value(step, values))
                .collect::<Result<Vec<_>, _>>()?;
            channels.insert(key.clone(), steps);
        }
        Ok(SequenceDef { channels })
    }

    /// Parse into typed steps. `sub` groupings are flattened in place; a
    /// channel is digital when its steps carry `out`, analog otherwise.
    pub fn parse(&self) -> Result<ResolvedSequence, CompileError> {
        let mut channels = BTreeMap::new();
        for (key, raw_steps) in &self.channels {
            let mut flat = Vec::new();
            for step in raw_steps {
                flatten_subs(step, &mut flat)?;
            }
            if flat.is_empty() {
                return Err(CompileError::InvalidRamp(format!(
                    "channel '{key}' has an empty sequence"
                )));
            }
            let digital = flat
                .first()
                .and_then(|s| s.as_object())
                .is_some_and(|o| o.contains_key("out"));
            let steps = if digital {
                ChannelSteps::Digital(parse_steps(key, &flat)?)
            } else {
                ChannelSteps::Analog(parse_steps(key, &flat)?)
            };
            channels.insert(key.clone(), steps);
        }
        Ok(ResolvedSequence { channels })
    }
}

fn parse_steps<T: serde::de::DeserializeOwned>(
    key: &str,
    raw: &[Value],
) -> Result<Vec<T>, CompileError> {
    raw.iter()
        .map(|step| {
            serde_json::from_value(step.clone()).map_err(|e| {
                CompileError::InvalidRamp(format!("channel '{key}': malformed step: {e}"))
            })
        })
        .collect()
}

fn flatten_subs(step: &Value, out: &mut Vec<Value>) -> Result<(), CompileError> {
    let is_sub = step
        .as_object()
        .and_then(|o| o.get("type"))
        .and_then(Value::as_str)
        == Some("sub");
    if is_sub {
        let inner = step
            .get("seq")
            .and_then(Value::as_array)
            .ok_or_else(|| CompileError::InvalidRamp("'sub' step without a 'seq' list".into()))?;
        for nested in inner {
            flatten_subs(nested, out)?;
        }
    } else {
        out.push(step.clone());
    }
    Ok(())
}

fn collect_refs(value: &Value, refs: &mut Vec<String>) {
    match value {
        Value::String(s) if s.starts_with('*') => {
            if !refs.iter().any(|r| r == s) {
                refs.push(s.clone());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, refs)),
        _ => {}
    }
}

fn substitute_value(
    value: &Value,
    values: &BTreeMap<String, Value>,
) -> Result<Value, SequenceError> {
    match value {
        Value::String(s) if s.starts_with('*') => values
            .get(s.as_str())
            .cloned()
            .ok_or_else(|| SequenceError::UnresolvedReference(s.clone())),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| substitute_value(v, values))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_value(v, values)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_path(dir_template: &str, name: &str, today: NaiveDate) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.exists() {
        return Some(direct.to_path_buf());
    }
    for back in 0..SEQUENCE_SEARCH_DAYS {
        let day = today.checked_sub_days(Days::new(back))?;
        let dir = dir_template.replace("{date}", &day.format("%Y%m%d").to_string());
        let path = Path::new(&dir).join(name);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(value: Value) -> SequenceDef {
        SequenceDef::from_value(value).unwrap()
    }

    #[test]
    fn accepts_bare_and_wrapped_maps() {
        let bare = def(json!({"ch@A00": [{"type": "lin", "dt": 1.0, "vf": 1.0}]}));
        let wrapped = def(json!({
            "sequence": {"ch@A00": [{"type": "lin", "dt": 1.0, "vf": 1.0}]},
            "meta": {"version": 3}
        }));
        assert_eq!(bare, wrapped);
    }

    #[test]
    fn refs_are_found_at_any_depth() {
        let sequence = def(json!({
            "a@A00": [{"type": "lin", "dt": "*t_mot", "vf": 1.0}],
            "b@A01": [{"type": "sub", "seq": [{"type": "lin", "dt": 1.0, "vf": "*v_bias"}]}],
        }));
        assert_eq!(sequence.parameter_refs(), vec!["*t_mot", "*v_bias"]);
    }

    #[test]
    fn substitution_is_total() {
        let sequence = def(json!({"a@A00": [{"type": "lin", "dt": "*t_mot", "vf": 1.0}]}));

        let missing = BTreeMap::new();
        assert!(matches!(
            sequence.substitute(&missing),
            Err(SequenceError::UnresolvedReference(name)) if name == "*t_mot"
        ));

        let mut values = BTreeMap::new();
        values.insert("*t_mot".to_string(), json!(0.25));
        let resolved = sequence.substitute(&values).unwrap().parse().unwrap();
        match &resolved.channels["a@A00"] {
            ChannelSteps::Analog(steps) => assert_eq!(steps[0].dt, 0.25),
            other => panic!("expected analog steps, got {}", other.kind_name()),
        }
    }

    #[test]
    fn sub_groups_flatten_in_place() {
        let sequence = def(json!({"a@A00": [
            {"type": "lin", "dt": 1.0, "vf": 1.0},
            {"type": "sub", "seq": [
                {"type": "lin", "dt": 2.0, "vf": 2.0},
                {"type": "s", "dt": 3.0, "vf": 0.0},
            ]},
        ]}));
        let resolved = sequence.parse().unwrap();
        assert_eq!(resolved.channels["a@A00"].len(), 3);
        assert!((resolved.channels["a@A00"].duration() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn digital_channels_are_classified_by_out() {
        let sequence = def(json!({
            "ttl@D03": [{"dt": 0.5, "out": true}, {"dt": 0.5, "out": 0}],
            "dac@A00": [{"type": "lin", "dt": 1.0, "vf": 1.0}],
        }));
        let resolved = sequence.parse().unwrap();
        assert!(matches!(
            resolved.channels["ttl@D03"],
            ChannelSteps::Digital(_)
        ));
        assert!(matches!(
            resolved.channels["dac@A00"],
            ChannelSteps::Analog(_)
        ));
    }

    #[test]
    fn duration_is_the_longest_channel() {
        let sequence = def(json!({
            "a@A00": [{"type": "lin", "dt": 1.0, "vf": 0.0}],
            "b@D00": [{"dt": 0.75, "out": true}, {"dt": 0.75, "out": false}],
        }));
        let resolved = sequence.parse().unwrap();
        assert!((resolved.duration() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn combine_concatenates_channelwise() {
        let first = def(json!({"a@A00": [{"type": "lin", "dt": 1.0, "vf": 1.0}]}));
        let second = def(json!({"a@A00": [{"type": "lin", "dt": 2.0, "vf": 0.0}]}));
        let combined = SequenceDef::combine(vec![first, second]).unwrap();
        assert_eq!(combined.channels["a@A00"].len(), 2);

        let mismatched = def(json!({"b@A01": [{"type": "lin", "dt": 1.0, "vf": 0.0}]}));
        let result = SequenceDef::combine(vec![
            def(json!({"a@A00": [{"type": "lin", "dt": 1.0, "vf": 1.0}]})),
            mismatched,
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn load_named_walks_the_dated_tree() {
        let root = tempfile::tempdir().unwrap();
        let template = format!("{}/{{date}}/sequences/", root.path().display());

        // sequence saved three days ago, nothing since
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let old_dir = root.path().join("20240307").join("sequences");
        std::fs::create_dir_all(&old_dir).unwrap();
        std::fs::write(
            old_dir.join("mot_load"),
            r#"{"a@A00": [{"type": "lin", "dt": 1.0, "vf": 1.0}]}"#,
        )
        .unwrap();

        let loaded = SequenceDef::load_named(&template, "mot_load", day).unwrap();
        assert!(loaded.channels.contains_key("a@A00"));

        let missing = SequenceDef::load_named(&template, "nope", day);
        assert!(missing.is_err());
    }
}
