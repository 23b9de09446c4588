//! Static configuration of the board: clocks, output spans, oscillator
//! descriptions and the tuning/correction/tick parameters.
//!
//! All of these are plain `Copy` structs whose `Default` matches the
//! reference board.

use crate::fixedmath::{OctaveMul, HALFSTEPS_PER_OCTAVE};
use crate::{Error, Result, MAX_LANDMARKS};
use num_traits::Float;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Frequency of the free-running capture counter, in Hz
pub const REFERENCE_CLOCK_HZ: u32 = 108_000_000;

/// A voltage span of a DAC or ADC channel.  Only the four spans the
/// converters support can be built, through the constants or `TryFrom`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "(i8, i8)", into = "(i8, i8)"))]
pub struct VoltSpan {
    low: i8,
    high: i8,
}

impl VoltSpan {
    /// 0V to 5V
    pub const UNIPOLAR_5: Self = Self { low: 0, high: 5 };
    /// 0V to 10V
    pub const UNIPOLAR_10: Self = Self { low: 0, high: 10 };
    /// -5V to 5V
    pub const BIPOLAR_5: Self = Self { low: -5, high: 5 };
    /// -10V to 10V
    pub const BIPOLAR_10: Self = Self { low: -10, high: 10 };

    /// Lowest voltage
    pub const fn low(&self) -> i8 {
        self.low
    }

    /// Highest voltage
    pub const fn high(&self) -> i8 {
        self.high
    }

    /// True for spans that start at 0V
    pub const fn unipolar(&self) -> bool {
        self.low == 0
    }

    /// True for the 10V wide spans (the converters' gain bit)
    pub const fn wide(&self) -> bool {
        self.high == 10
    }

    /// The span selection code of the LTC2668 DAC
    pub const fn code(&self) -> u8 {
        match (self.unipolar(), self.wide()) {
            (true, false) => 0,
            (true, true) => 1,
            (false, false) => 2,
            (false, true) => 3,
        }
    }
}

impl Default for VoltSpan {
    fn default() -> Self {
        Self::BIPOLAR_5
    }
}

impl TryFrom<(i8, i8)> for VoltSpan {
    type Error = Error;
    fn try_from(value: (i8, i8)) -> Result<Self> {
        match value {
            (0, 5) | (0, 10) | (-5, 5) | (-10, 10) => Ok(Self {
                low: value.0,
                high: value.1,
            }),
            (low, high) => Err(Error::UnsupportedSpan(low, high)),
        }
    }
}

impl From<VoltSpan> for (i8, i8) {
    fn from(span: VoltSpan) -> Self {
        (span.low, span.high)
    }
}

/// Description of one voltage-controlled oscillator and the DAC scale that
/// drives it.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OscillatorConfig {
    /// Frequency produced by DAC code 0, in Hz
    pub low_frequency: f32,
    /// Output voltage at DAC code 0
    pub low_volts: f32,
    /// Number of octaves the oscillator covers
    pub octaves: u8,
    /// DAC codes per volt
    pub dins_per_volt: u16,
    /// Octaves per volt (1 for a 1V/octave oscillator)
    pub octaves_per_volt: u8,
}

impl Default for OscillatorConfig {
    fn default() -> Self {
        Self {
            low_frequency: 13.75,
            low_volts: -5.0,
            octaves: 10,
            dins_per_volt: 6528,
            octaves_per_volt: 1,
        }
    }
}

impl OscillatorConfig {
    /// DAC codes per octave
    pub const fn dins_per_octave(&self) -> u32 {
        self.dins_per_volt as u32 / self.octaves_per_volt as u32
    }
    /// DAC codes per half step
    pub const fn dins_per_halfstep(&self) -> u32 {
        self.dins_per_octave() / HALFSTEPS_PER_OCTAVE
    }
    /// Number of calibration landmarks (two per octave plus the top boundary)
    pub const fn landmarks(&self) -> usize {
        self.octaves as usize * 2 + 1
    }
    /// The base frequency of `octave` as an [OctaveMul], or `None` if it
    /// doesn't fit.
    pub fn octave_multiplier(&self, octave: u8) -> Option<OctaveMul> {
        let value = Float::round(self.low_frequency * Float::powi(2f32, octave as i32) * 4.0);
        if value.is_finite() && value >= 1.0 && value <= u16::MAX as f32 {
            Some(OctaveMul::from_bits(value as u16))
        } else {
            None
        }
    }
    /// Check that this describes an oscillator the fixed-point conversions
    /// can represent.
    pub fn validate(&self) -> Result<()> {
        if !(self.low_frequency > 0.0) {
            return Err(Error::InvalidOscillator("low frequency must be positive"));
        }
        if self.octaves == 0 || self.octaves as usize * 2 + 1 > MAX_LANDMARKS {
            return Err(Error::InvalidOscillator("unsupported octave count"));
        }
        if self.octaves_per_volt == 0 || self.dins_per_halfstep() == 0 {
            return Err(Error::InvalidOscillator("DAC scale too coarse"));
        }
        if self.octave_multiplier(self.octaves).is_none() {
            return Err(Error::InvalidOscillator("top octave out of range"));
        }
        Ok(())
    }
}

/// Parameters of the landmark tuner
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TuneConfig {
    /// Time the oscillator is given to settle after each write, in µs
    pub settle_us: u32,
    /// How long to wait for a fresh width sample, in ms
    pub sample_timeout_ms: u32,
    /// First landmark tuned directly
    pub first_landmark: u8,
    /// Last landmark tuned directly (clamped to the oscillator's range)
    pub last_landmark: u8,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            settle_us: 20_000,
            sample_timeout_ms: 500,
            first_landmark: 4,
            last_landmark: 18,
        }
    }
}

/// Parameters of the closed-loop correction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CorrectionConfig {
    /// The hysteresis band is `target_width >> shift`
    pub shift: u8,
    /// The correction worker wakes at least this often, in ms.  A wake on
    /// timeout re-arms correction on a channel that had converged.
    pub worker_timeout_ms: u32,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            shift: 9,
            worker_timeout_ms: 5000,
        }
    }
}

/// Prescaler and auto-reload of the envelope tick timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TickConfig {
    /// The timer counts at `REFERENCE_CLOCK_HZ / (prescaler + 1)`
    pub prescaler: u16,
    /// The timer fires every `reload + 1` counts
    pub reload: u16,
}

impl Default for TickConfig {
    /// 1kHz
    fn default() -> Self {
        Self {
            prescaler: 107,
            reload: 999,
        }
    }
}

impl TickConfig {
    /// Tick rate in Hz
    pub const fn tick_hz(&self) -> u32 {
        REFERENCE_CLOCK_HZ / ((self.prescaler as u32 + 1) * (self.reload as u32 + 1))
    }
    /// Tick period in µs
    pub const fn period_us(&self) -> u32 {
        ((self.prescaler as u64 + 1) * (self.reload as u64 + 1) * 1_000_000
            / REFERENCE_CLOCK_HZ as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_conversion() {
        assert_eq!(VoltSpan::try_from((-5, 5)), Ok(VoltSpan::BIPOLAR_5));
        assert_eq!(VoltSpan::try_from((0, 10)).map(|s| s.code()), Ok(1));
        assert_eq!(VoltSpan::try_from((-10, 10)).map(|s| s.code()), Ok(3));
        assert_eq!(VoltSpan::UNIPOLAR_5.code(), 0);
        assert_eq!(VoltSpan::BIPOLAR_5.code(), 2);
        assert_eq!(VoltSpan::try_from((1, 2)), Err(Error::UnsupportedSpan(1, 2)));
        assert_eq!(<(i8, i8)>::from(VoltSpan::UNIPOLAR_10), (0, 10));
        assert_eq!(
            VoltSpan::try_from((-2, 2)),
            Err(Error::UnsupportedSpan(-2, 2))
        );
    }

    #[test]
    fn reference_oscillator() {
        let cfg = OscillatorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.dins_per_halfstep(), 544);
        assert_eq!(cfg.landmarks(), 21);
        assert_eq!(cfg.octave_multiplier(0).map(|m| m.to_bits()), Some(55));
        assert_eq!(cfg.octave_multiplier(10).map(|m| m.to_bits()), Some(56320));
    }

    #[test]
    fn oscillator_out_of_range() {
        let cfg = OscillatorConfig {
            octaves: 11,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = OscillatorConfig {
            low_frequency: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tick_rate() {
        let tick = TickConfig::default();
        assert_eq!(tick.tick_hz(), 1000);
        assert_eq!(tick.period_us(), 1000);
    }
}
