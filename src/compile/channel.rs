//! Tick and DAC quantization for analog channel programs.
//!
//! Converts decomposed linear chords into the hardware's native program
//! representation: a signed fixed-point ramp-rate word plus a duration in
//! clock ticks. The power-of-two scaling in [`ramp_rate_word`] is the ramp
//! accumulator format of the deployed FPGA bitfiles and must be reproduced
//! bit-for-bit.

use serde::{Deserialize, Serialize};

use crate::compile::ramp::{decompose_all, RampSegment};
use crate::error::CompileError;

/// Width of the delta-coded DAC word.
pub const DAC_BITS: u32 = 16;

/// One hardware program step: ramp at `ramp_rate` for `ticks` clock periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizedStep {
    /// Signed ramp-rate word, wrapped into unsigned range for transmission.
    pub ramp_rate: u16,
    /// Duration in clock ticks; always at least 1.
    pub ticks: u32,
}

/// Seconds to clock ticks, flooring at 1 tick. The hardware cannot represent
/// a zero-length interval.
pub fn time_to_ticks(clock_hz: f64, dt: f64) -> u32 {
    ((dt.abs() * clock_hz).round() as u32).max(1)
}

/// Map a voltage delta onto the signed span of the DAC word. Deltas beyond
/// the full range saturate rather than wrap.
pub fn voltage_to_signed(dv: f64, voltage_range: (f64, f64)) -> i32 {
    let span = voltage_range.1 - voltage_range.0;
    let clamped = dv.clamp(-span, span);
    (clamped / span * (f64::from(2u32.pow(DAC_BITS)) - 1.0)).round() as i32
}

/// Encode a voltage delta over `ticks` as the accumulator's ramp-rate word.
///
/// `word = round(dv_dac * 2^(floor(log2 ticks) - 1) / ticks)`, with negative
/// results wrapped by `+2^16` for transmission.
pub fn ramp_rate_word(dv: f64, ticks: u32, voltage_range: (f64, f64)) -> u16 {
    let dv_dac = voltage_to_signed(dv, voltage_range);
    let scale = 2f64.powi((ticks as f64).log2().floor() as i32 - 1);
    let signed = (f64::from(dv_dac) * scale / f64::from(ticks)).round() as i32;
    // full-span deltas at power-of-two tick counts round to 2^15, one past
    // the signed word; pin to the representable span
    let signed = signed.clamp(-(1 << (DAC_BITS - 1)), (1 << (DAC_BITS - 1)) - 1);
    if signed >= 0 {
        signed as u16
    } else {
        (signed + (1 << DAC_BITS)) as u16
    }
}

/// Reverse of [`ramp_rate_word`]: recover the voltage delta a word and tick
/// count program. Used for verification; the reconstruction is exact to one
/// DAC least-significant bit.
pub fn decode_ramp_rate(word: u16, ticks: u32, voltage_range: (f64, f64)) -> f64 {
    let signed = if word >= 1u16 << (DAC_BITS - 1) {
        i32::from(word) - (1 << DAC_BITS)
    } else {
        i32::from(word)
    };
    let scale = 2f64.powi((ticks as f64).log2().floor() as i32 - 1);
    let dv_dac = f64::from(signed) * f64::from(ticks) / scale;
    let span = voltage_range.1 - voltage_range.0;
    dv_dac / (f64::from(2u32.pow(DAC_BITS)) - 1.0) * span
}

/// Compile one channel's segment list to quantized hardware steps, in time
/// order. `v_start` is the channel's voltage entering the shot (zero after a
/// normal shutdown tail).
pub fn compile_channel(
    segments: &[RampSegment],
    v_start: f64,
    clock_hz: f64,
    voltage_range: (f64, f64),
) -> Result<Vec<QuantizedStep>, CompileError> {
    let chords = decompose_all(segments, v_start)?;
    let mut steps = Vec::with_capacity(chords.len());
    let mut v = v_start;
    for chord in chords {
        let ticks = time_to_ticks(clock_hz, chord.dt);
        steps.push(QuantizedStep {
            ramp_rate: ramp_rate_word(chord.vf - v, ticks, voltage_range),
            ticks,
        });
        v = chord.vf;
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::ramp::RampKind;

    const RANGE: (f64, f64) = (-10.0, 10.0);

    #[test]
    fn ticks_floor_at_one() {
        assert_eq!(time_to_ticks(1000.0, 0.0), 1);
        assert_eq!(time_to_ticks(1000.0, 1e-9), 1);
        assert_eq!(time_to_ticks(1000.0, 1.0), 1000);
    }

    #[test]
    fn negative_words_wrap_to_unsigned() {
        let up = ramp_rate_word(5.0, 1000, RANGE);
        let down = ramp_rate_word(-5.0, 1000, RANGE);
        assert!(up < 1u16 << (DAC_BITS - 1));
        assert!(down >= 1u16 << (DAC_BITS - 1));
    }

    #[test]
    fn ramp_rate_round_trips_within_one_lsb() {
        let lsb = 20.0 / (f64::from(2u32.pow(DAC_BITS)) - 1.0);
        for &dv in &[5.0, -5.0, 0.013, -9.99, 20.0] {
            for &ticks in &[1u32, 3, 1000, 4095, 1 << 20] {
                let word = ramp_rate_word(dv, ticks, RANGE);
                let decoded = decode_ramp_rate(word, ticks, RANGE);
                // the accumulator loses up to one DAC unit per 2^(log2 t - 1)
                // accumulation window plus the encoding round-off
                let tolerance = lsb * (f64::from(ticks) / 2f64.powi((ticks as f64).log2().floor() as i32 - 1) / 2.0 + 1.0);
                assert!(
                    (decoded - dv.clamp(-20.0, 20.0)).abs() <= tolerance,
                    "dv {dv} ticks {ticks}: decoded {decoded}"
                );
            }
        }
    }

    #[test]
    fn out_of_range_deltas_saturate() {
        assert_eq!(
            ramp_rate_word(500.0, 1024, RANGE),
            ramp_rate_word(20.0, 1024, RANGE)
        );
    }

    #[test]
    fn one_second_linear_ramp_at_1khz() {
        let segments = vec![RampSegment::new(RampKind::Linear, 1.0, 5.0)];
        let steps = compile_channel(&segments, 0.0, 1000.0, RANGE).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].ticks, 1000);
        let decoded = decode_ramp_rate(steps[0].ramp_rate, steps[0].ticks, RANGE);
        assert!((decoded - 5.0).abs() < 0.01);
    }

    #[test]
    fn steps_preserve_time_order() {
        let segments = vec![
            RampSegment::new(RampKind::Linear, 0.5, 5.0),
            RampSegment::new(RampKind::Step, 0.25, 0.0),
        ];
        let steps = compile_channel(&segments, 0.0, 1000.0, RANGE).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].ticks, 500);
        // step decomposes to the 1 us jump (floored to 1 tick) plus the hold
        assert_eq!(steps[1].ticks, 1);
        assert_eq!(steps[2].ticks, 250);
    }
}
