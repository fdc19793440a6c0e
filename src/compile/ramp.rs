//! Declarative ramp model and segment decomposition.
//!
//! A channel's program is an ordered list of [`RampSegment`]s: timed voltage
//! transitions between two endpoints. Each segment's start voltage is the
//! previous segment's end voltage unless an explicit `vi` overrides it. The
//! decomposer turns every segment into fixed-duration linear chords, the only
//! shape the FPGA ramp accumulator can represent.
//!
//! Wire format (JSON, as found in sequence files):
//!
//! ```text
//! {"type": "lin",    "dt": 0.5, "vf": 2.0}
//! {"type": "s",      "dt": 0.1, "vf": 0.0}
//! {"type": "slin",   "dt": 0.5, "vi": 1.0, "vf": 2.0}
//! {"type": "exp",    "dt": 1.0, "vf": 0.0, "tau": 0.3, "pts": 20}
//! {"type": "sexp",   "dt": 1.0, "vi": 5.0, "vf": 0.0, "tau": 0.3}
//! {"type": "scurve", "dt": 1.0, "vi": 0.0, "vf": 8.0, "k": 1.0}
//! ```
//!
//! The `s`-prefixed tags carry an explicit start voltage, realized as a 1 us
//! jump chord charged against the segment's duration.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CompileError;

/// Duration of the jump chord used to realize "instantaneous" transitions.
/// This is the shortest interval the slowest supported board resolves.
pub const STEP_RISE_S: f64 = 1e-6;

/// Shape of a single timed voltage transition.
#[derive(Debug, Clone, PartialEq)]
pub enum RampKind {
    /// Jump to the target, then hold it for the rest of the segment.
    Step,
    /// Straight line to the target.
    Linear,
    /// Exponential approach `v(t) = a*e^(t/tau) + c`, sampled into `pts`
    /// linear chords.
    Exp { tau: f64, pts: u32 },
    /// Logistic s-curve with duration-normalized steepness `k`, sampled into
    /// `pts` linear chords.
    SCurve { k: f64, pts: u32 },
}

/// One declarative timed transition on an analog channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSegment", into = "RawSegment")]
pub struct RampSegment {
    pub kind: RampKind,
    /// Segment duration in seconds.
    pub dt: f64,
    /// Voltage at the end of the segment.
    pub vf: f64,
    /// Explicit start voltage; `None` continues from the previous segment.
    pub vi: Option<f64>,
}

/// One declarative timed TTL state on a digital channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicStep {
    /// Step duration in seconds.
    pub dt: f64,
    /// Output state. Numeric values parse as high when positive.
    #[serde(deserialize_with = "deserialize_out")]
    pub out: bool,
}

fn deserialize_out<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Out {
        Flag(bool),
        Level(f64),
    }
    Ok(match Out::deserialize(deserializer)? {
        Out::Flag(b) => b,
        Out::Level(v) => v > 0.0,
    })
}

/// A decomposed chord: always linear, ending at `vf` after `dt` seconds.
/// The start voltage is implicit (the previous chord's end).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompiledSegment {
    pub dt: f64,
    pub vf: f64,
}

impl RampSegment {
    pub fn new(kind: RampKind, dt: f64, vf: f64) -> Self {
        Self {
            kind,
            dt,
            vf,
            vi: None,
        }
    }

    pub fn with_vi(mut self, vi: f64) -> Self {
        self.vi = Some(vi);
        self
    }

    /// Reject physically meaningless segments before any compilation work.
    pub fn validate(&self) -> Result<(), CompileError> {
        if !self.dt.is_finite() || self.dt < 0.0 {
            return Err(CompileError::InvalidRamp(format!(
                "duration {} must be finite and non-negative",
                self.dt
            )));
        }
        if !self.vf.is_finite() {
            return Err(CompileError::InvalidRamp("non-finite target voltage".into()));
        }
        if let Some(vi) = self.vi {
            if !vi.is_finite() {
                return Err(CompileError::InvalidRamp("non-finite start voltage".into()));
            }
        }
        match self.kind {
            RampKind::Exp { tau, pts } => {
                if !tau.is_finite() {
                    return Err(CompileError::InvalidRamp("non-finite tau".into()));
                }
                if pts < 1 {
                    return Err(CompileError::InvalidRamp(
                        "exponential ramp needs at least one sample point".into(),
                    ));
                }
            }
            RampKind::SCurve { k, pts } => {
                if !k.is_finite() {
                    return Err(CompileError::InvalidRamp("non-finite steepness".into()));
                }
                if pts < 1 {
                    return Err(CompileError::InvalidRamp(
                        "s-curve ramp needs at least one sample point".into(),
                    ));
                }
            }
            RampKind::Step | RampKind::Linear => {}
        }
        Ok(())
    }

    /// Decompose into linear chords starting from `v_start`.
    ///
    /// The concatenated chord durations equal `dt`; an explicit `vi` override
    /// spends [`STEP_RISE_S`] of the segment on the jump chord.
    pub fn decompose(&self, v_start: f64) -> Result<Vec<CompiledSegment>, CompileError> {
        self.validate()?;

        let mut chords = Vec::new();
        let mut remaining = self.dt;
        let mut v0 = v_start;

        if let Some(vi) = self.vi {
            if vi != v0 {
                chords.push(jump(&mut remaining, vi));
            }
            v0 = vi;
        }

        match self.kind {
            RampKind::Step => {
                chords.push(jump(&mut remaining, self.vf));
                chords.push(CompiledSegment {
                    dt: remaining,
                    vf: self.vf,
                });
            }
            RampKind::Linear => chords.push(CompiledSegment {
                dt: remaining,
                vf: self.vf,
            }),
            RampKind::Exp { tau, pts } => {
                chords.extend(exp_chords(v0, self.vf, remaining, tau, pts));
            }
            RampKind::SCurve { k, pts } => {
                chords.extend(scurve_chords(v0, self.vf, remaining, k, pts));
            }
        }
        Ok(chords)
    }
}

fn jump(remaining: &mut f64, target: f64) -> CompiledSegment {
    let rise = STEP_RISE_S.min(*remaining);
    *remaining -= rise;
    CompiledSegment {
        dt: rise,
        vf: target,
    }
}

/// `v(t) = a*e^(t/tau) + c` solved so `v(0) = v0` and `v(dt) = vf`.
///
/// A degenerate rate constant (zero, or one that overflows the exponential)
/// falls back to a single linear chord spanning the whole segment. Downstream
/// sequences rely on this fallback; it is documented behavior, not a latent
/// bug.
fn exp_chords(v0: f64, vf: f64, dt: f64, tau: f64, pts: u32) -> Vec<CompiledSegment> {
    let fallback = vec![CompiledSegment { dt, vf }];
    if dt <= 0.0 || tau == 0.0 {
        return fallback;
    }
    let denom = (dt / tau).exp() - 1.0;
    if !denom.is_finite() || denom == 0.0 {
        return fallback;
    }
    let a = (vf - v0) / denom;
    let c = v0 - a;
    if !a.is_finite() || !c.is_finite() {
        return fallback;
    }
    sample_chords(|t| a * (t / tau).exp() + c, vf, dt, pts).unwrap_or(fallback)
}

/// Logistic curve centered at the segment midpoint. Steepness is scaled by
/// `12 / dt` so the shape depends only on `k`, not on the time interval.
fn scurve_chords(v0: f64, vf: f64, dt: f64, k: f64, pts: u32) -> Vec<CompiledSegment> {
    let fallback = vec![CompiledSegment { dt, vf }];
    if dt <= 0.0 {
        return fallback;
    }
    let steep = 12.0 * k / dt;
    let t0 = dt / 2.0;
    let a = vf - v0;
    sample_chords(
        |t| v0 + a / (1.0 + (-(t - t0) * steep).exp()),
        vf,
        dt,
        pts,
    )
    .unwrap_or(fallback)
}

/// Sample `v` at `pts + 1` evenly spaced times and emit `pts` chords. The
/// last chord's end is pinned exactly to `vf` so rounding never drifts the
/// segment boundary; the first chord's start is the caller's `v0` by
/// construction. Returns `None` if the curve produces a non-finite sample.
fn sample_chords<F: Fn(f64) -> f64>(
    v: F,
    vf: f64,
    dt: f64,
    pts: u32,
) -> Option<Vec<CompiledSegment>> {
    let chord_dt = dt / pts as f64;
    let mut chords = Vec::with_capacity(pts as usize);
    for j in 1..=pts {
        let sample = v(dt * j as f64 / pts as f64);
        if !sample.is_finite() {
            return None;
        }
        chords.push(CompiledSegment {
            dt: chord_dt,
            vf: sample,
        });
    }
    if let Some(last) = chords.last_mut() {
        last.vf = vf;
    }
    Some(chords)
}

/// Decompose a whole segment list, chaining start voltages.
pub fn decompose_all(
    segments: &[RampSegment],
    v_start: f64,
) -> Result<Vec<CompiledSegment>, CompileError> {
    let mut chords = Vec::new();
    let mut v = v_start;
    for segment in segments {
        let decomposed = segment.decompose(v)?;
        if let Some(last) = decomposed.last() {
            v = last.vf;
        }
        chords.extend(decomposed);
    }
    Ok(chords)
}

/// Continuous piecewise-linear view of a decomposed channel, for inspection
/// and plotting. Never programs hardware.
#[derive(Debug, Clone)]
pub struct Waveform {
    v_start: f64,
    chords: Vec<CompiledSegment>,
}

impl Waveform {
    pub fn from_segments(segments: &[RampSegment], v_start: f64) -> Result<Self, CompileError> {
        Ok(Self {
            v_start,
            chords: decompose_all(segments, v_start)?,
        })
    }

    pub fn duration(&self) -> f64 {
        self.chords.iter().map(|c| c.dt).sum()
    }

    /// Voltage at time `t`. Clamps to the first/last value outside the
    /// program's span.
    pub fn sample(&self, t: f64) -> f64 {
        let mut t_start = 0.0;
        let mut v = self.v_start;
        for chord in &self.chords {
            let t_end = t_start + chord.dt;
            if t < t_end {
                if chord.dt == 0.0 {
                    return chord.vf;
                }
                return v + (chord.vf - v) * (t - t_start) / chord.dt;
            }
            t_start = t_end;
            v = chord.vf;
        }
        v
    }

    /// Evenly sampled (t, v) points per chord, for plotting.
    pub fn points(&self, per_chord: usize) -> Vec<(f64, f64)> {
        let mut out = Vec::new();
        let mut t_start = 0.0;
        for chord in &self.chords {
            for j in 0..per_chord {
                let t = t_start + chord.dt * j as f64 / per_chord as f64;
                out.push((t, self.sample(t)));
            }
            t_start += chord.dt;
        }
        out.push((t_start, self.sample(t_start)));
        out
    }
}

// Wire representation; `type` selects the ramp family and the `s` prefix
// marks an explicit start voltage.
#[derive(Serialize, Deserialize)]
struct RawSegment {
    #[serde(rename = "type")]
    kind: String,
    dt: f64,
    vf: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tau: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    k: Option<f64>,
}

const DEFAULT_TAU: f64 = 1.0;
const DEFAULT_K: f64 = 1.0;
const DEFAULT_PTS: u32 = 20;

impl TryFrom<RawSegment> for RampSegment {
    type Error = CompileError;

    fn try_from(raw: RawSegment) -> Result<Self, Self::Error> {
        let tau = raw.tau.unwrap_or(DEFAULT_TAU);
        let k = raw.k.unwrap_or(DEFAULT_K);
        let pts = raw.pts.unwrap_or(DEFAULT_PTS);
        let (kind, vi) = match raw.kind.as_str() {
            "s" => (RampKind::Step, None),
            "lin" => (RampKind::Linear, None),
            "slin" => (RampKind::Linear, Some(raw.vi.unwrap_or(0.0))),
            "exp" => (RampKind::Exp { tau, pts }, None),
            "sexp" => (RampKind::Exp { tau, pts }, Some(raw.vi.unwrap_or(0.0))),
            "scurve" => (RampKind::SCurve { k, pts }, Some(raw.vi.unwrap_or(0.0))),
            other => {
                return Err(CompileError::InvalidRamp(format!(
                    "unknown ramp type '{other}'"
                )))
            }
        };
        Ok(RampSegment {
            kind,
            dt: raw.dt,
            vf: raw.vf,
            vi,
        })
    }
}

impl From<RampSegment> for RawSegment {
    fn from(segment: RampSegment) -> Self {
        let (kind, tau, pts, k) = match segment.kind {
            RampKind::Step => ("s", None, None, None),
            RampKind::Linear if segment.vi.is_some() => ("slin", None, None, None),
            RampKind::Linear => ("lin", None, None, None),
            RampKind::Exp { tau, pts } if segment.vi.is_some() => {
                ("sexp", Some(tau), Some(pts), None)
            }
            RampKind::Exp { tau, pts } => ("exp", Some(tau), Some(pts), None),
            RampKind::SCurve { k, pts } => ("scurve", None, Some(pts), Some(k)),
        };
        RawSegment {
            kind: kind.to_string(),
            dt: segment.dt,
            vf: segment.vf,
            vi: segment.vi,
            tau,
            pts,
            k,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(chords: &[CompiledSegment]) -> f64 {
        chords.iter().map(|c| c.dt).sum()
    }

    #[test]
    fn linear_is_one_chord() {
        let segment = RampSegment::new(RampKind::Linear, 1.0, 5.0);
        let chords = segment.decompose(0.0).unwrap();
        assert_eq!(chords, vec![CompiledSegment { dt: 1.0, vf: 5.0 }]);
    }

    #[test]
    fn step_is_jump_then_hold() {
        let segment = RampSegment::new(RampKind::Step, 0.1, 3.0);
        let chords = segment.decompose(0.0).unwrap();
        assert_eq!(chords.len(), 2);
        assert_eq!(chords[0].dt, STEP_RISE_S);
        assert_eq!(chords[0].vf, 3.0);
        assert_eq!(chords[1].vf, 3.0);
        assert!((total(&chords) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn explicit_vi_spends_a_jump_chord() {
        let segment = RampSegment::new(RampKind::Linear, 0.5, 2.0).with_vi(1.0);
        let chords = segment.decompose(0.0).unwrap();
        assert_eq!(chords[0].dt, STEP_RISE_S);
        assert_eq!(chords[0].vf, 1.0);
        assert!((total(&chords) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn matching_vi_skips_the_jump() {
        let segment = RampSegment::new(RampKind::Linear, 0.5, 2.0).with_vi(1.0);
        let chords = segment.decompose(1.0).unwrap();
        assert_eq!(chords.len(), 1);
        assert_eq!(chords[0].dt, 0.5);
    }

    #[test]
    fn exp_durations_sum_to_segment_duration() {
        let segment = RampSegment::new(RampKind::Exp { tau: 0.3, pts: 20 }, 1.0, 5.0);
        let chords = segment.decompose(0.0).unwrap();
        assert_eq!(chords.len(), 20);
        assert!((total(&chords) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn exp_endpoints_are_pinned_exactly() {
        let segment = RampSegment::new(RampKind::Exp { tau: -0.2, pts: 10 }, 0.5, -3.0);
        let chords = segment.decompose(2.0).unwrap();
        assert_eq!(chords.last().unwrap().vf, -3.0);
    }

    #[test]
    fn degenerate_tau_falls_back_to_linear() {
        let segment = RampSegment::new(RampKind::Exp { tau: 0.0, pts: 20 }, 1.0, 5.0);
        let chords = segment.decompose(0.0).unwrap();
        assert_eq!(chords, vec![CompiledSegment { dt: 1.0, vf: 5.0 }]);

        // tau small enough to overflow e^(dt/tau) also falls back
        let segment = RampSegment::new(RampKind::Exp { tau: 1e-320, pts: 20 }, 1.0, 5.0);
        let chords = segment.decompose(0.0).unwrap();
        assert_eq!(chords.len(), 1);
    }

    #[test]
    fn scurve_is_monotonic_and_pinned() {
        let segment = RampSegment::new(RampKind::SCurve { k: 1.0, pts: 20 }, 1.0, 8.0).with_vi(0.0);
        let chords = segment.decompose(0.0).unwrap();
        assert_eq!(chords.last().unwrap().vf, 8.0);
        for pair in chords.windows(2) {
            assert!(pair[1].vf >= pair[0].vf);
        }
    }

    #[test]
    fn negative_duration_is_rejected() {
        let segment = RampSegment::new(RampKind::Linear, -1.0, 0.0);
        assert!(matches!(
            segment.decompose(0.0),
            Err(CompileError::InvalidRamp(_))
        ));
    }

    #[test]
    fn zero_sample_points_is_rejected() {
        let segment = RampSegment::new(RampKind::Exp { tau: 1.0, pts: 0 }, 1.0, 0.0);
        assert!(matches!(
            segment.decompose(0.0),
            Err(CompileError::InvalidRamp(_))
        ));
    }

    #[test]
    fn waveform_samples_the_ideal_line() {
        let segments = vec![
            RampSegment::new(RampKind::Linear, 1.0, 10.0),
            RampSegment::new(RampKind::Linear, 1.0, 10.0),
        ];
        let waveform = Waveform::from_segments(&segments, 0.0).unwrap();
        assert!((waveform.sample(0.5) - 5.0).abs() < 1e-12);
        assert!((waveform.sample(1.5) - 10.0).abs() < 1e-12);
        assert_eq!(waveform.sample(99.0), 10.0);
        assert!((waveform.duration() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn wire_format_round_trips() {
        let json = r#"{"type": "sexp", "dt": 1.0, "vi": 5.0, "vf": 0.0, "tau": 0.3, "pts": 10}"#;
        let segment: RampSegment = serde_json::from_str(json).unwrap();
        assert_eq!(segment.vi, Some(5.0));
        assert!(matches!(segment.kind, RampKind::Exp { tau, pts: 10 } if tau == 0.3));

        let back = serde_json::to_value(&segment).unwrap();
        assert_eq!(back["type"], "sexp");
        assert_eq!(back["tau"], 0.3);
    }

    #[test]
    fn logic_step_accepts_numeric_levels() {
        let high: LogicStep = serde_json::from_str(r#"{"dt": 0.1, "out": 5.0}"#).unwrap();
        assert!(high.out);
        let low: LogicStep = serde_json::from_str(r#"{"dt": 0.1, "out": -1}"#).unwrap();
        assert!(!low.out);
        let flag: LogicStep = serde_json::from_str(r#"{"dt": 0.1, "out": true}"#).unwrap();
        assert!(flag.out);
    }
}
