//! Pitch conversions for one oscillator.
//!
//! There are three coordinate systems: (octave, half step) for musical
//! input, (octave, xstep) with [XSTEPS_PER_HALFSTEP] xsteps per half step for
//! everything finer, and the DAC code (DIN).  The DAC scale is linear in
//! volts and the oscillators are exponential, so a code maps linearly to an
//! (octave, xstep) position and the position maps to a frequency through the
//! [XSTEP_MULS] table.
//!
//! The per-oscillator [CalibrationTable] holds one signed code offset per
//! tritone landmark; [PitchConverter::offset_for_code] interpolates it.

use crate::capture::width_to_frequency16;
use crate::config::{OscillatorConfig, REFERENCE_CLOCK_HZ};
use crate::fixedmath::{
    freq16, xstep_multiplier, Freq16, OctaveMul, HALFSTEPS_PER_OCTAVE, XSTEPS_PER_HALFSTEP,
    XSTEPS_PER_OCTAVE, XSTEPS_PER_TRITONE, XSTEP_BITS, XSTEP_MULS,
};
use crate::{Error, Result, MAX_LANDMARKS};
use arrayvec::ArrayVec;
use core::fmt;
use num_traits::Float;

/// A position on the pitch scale of an oscillator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OctaveXstep {
    /// Octave above the oscillator's lowest frequency
    pub octave: u8,
    /// xsteps above the start of the octave, `< XSTEPS_PER_OCTAVE`
    pub xstep: u16,
}

impl OctaveXstep {
    /// The position of a half step
    pub const fn halfstep(octave: u8, halfstep: u8) -> Self {
        Self {
            octave,
            xstep: (halfstep as u16) << XSTEP_BITS,
        }
    }
}

/// A timer width together with the frequency it was derived from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WidthFreq {
    /// Capture counter ticks per period
    pub width: u32,
    /// Frequency in whole Hz
    pub freq: u32,
    /// Frequency in Hz×16
    pub freq16: Freq16,
}

/// Calibration offsets, one per tritone landmark.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CalibrationTable {
    offsets: ArrayVec<i16, MAX_LANDMARKS>,
}

impl CalibrationTable {
    /// A table of `landmarks` zero offsets
    pub fn new(landmarks: usize) -> Self {
        let mut offsets = ArrayVec::new();
        for _ in 0..landmarks.min(MAX_LANDMARKS) {
            offsets.push(0);
        }
        Self { offsets }
    }
    /// Number of landmarks
    pub fn len(&self) -> usize {
        self.offsets.len()
    }
    /// True if there are no landmarks
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
    /// Offset of a landmark; out of range landmarks clamp to the last one
    pub fn get(&self, landmark: usize) -> i16 {
        let idx = landmark.min(self.offsets.len().saturating_sub(1));
        self.offsets.get(idx).copied().unwrap_or(0)
    }
    /// Set the offset of a landmark.  Out of range landmarks are ignored.
    pub fn set(&mut self, landmark: usize, offset: i16) {
        if let Some(o) = self.offsets.get_mut(landmark) {
            *o = offset;
        }
    }
    /// Zero every offset
    pub fn clear(&mut self) {
        self.offsets.iter_mut().for_each(|o| *o = 0);
    }
    /// All offsets, lowest landmark first
    pub fn offsets(&self) -> &[i16] {
        &self.offsets
    }
    /// Fill untuned (zero) landmarks outside `first..=last` from their
    /// nearest tuned neighbour, working outward.
    pub fn backfill(&mut self, first: usize, last: usize) {
        let top = self.offsets.len();
        for t in last..top.saturating_sub(1) {
            if self.offsets[t + 1] == 0 && self.offsets[t] != 0 {
                self.offsets[t + 1] = self.offsets[t];
            }
        }
        for t in (1..=first.min(top.saturating_sub(1))).rev() {
            if self.offsets[t - 1] == 0 && self.offsets[t] != 0 {
                self.offsets[t - 1] = self.offsets[t];
            }
        }
    }
}

impl fmt::Display for CalibrationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for o in &self.offsets {
            write!(f, "{:3} ", o)?;
        }
        f.write_str("]")
    }
}

/// Conversions for one oscillator, plus its calibration table.
#[derive(Clone, Debug)]
pub struct PitchConverter {
    config: OscillatorConfig,
    octave_muls: ArrayVec<OctaveMul, 17>,
    dins_per_octave: u32,
    dins_per_halfstep: u32,
    table: CalibrationTable,
}

impl PitchConverter {
    /// Build the converter for an oscillator.  Fails if the oscillator can't
    /// be represented.
    pub fn new(config: OscillatorConfig) -> Result<Self> {
        config.validate()?;
        let mut octave_muls = ArrayVec::new();
        for octave in 0..=config.octaves {
            let mul = config
                .octave_multiplier(octave)
                .ok_or(Error::InvalidOscillator("octave multiplier out of range"))?;
            octave_muls
                .try_push(mul)
                .map_err(|_| Error::InvalidOscillator("unsupported octave count"))?;
        }
        Ok(Self {
            config,
            octave_muls,
            dins_per_octave: config.dins_per_octave(),
            dins_per_halfstep: config.dins_per_halfstep(),
            table: CalibrationTable::new(config.landmarks()),
        })
    }

    /// The oscillator description
    pub fn config(&self) -> &OscillatorConfig {
        &self.config
    }
    /// DAC codes per octave
    pub fn dins_per_octave(&self) -> u32 {
        self.dins_per_octave
    }
    /// DAC codes per half step
    pub fn dins_per_halfstep(&self) -> u32 {
        self.dins_per_halfstep
    }
    /// The calibration table
    pub fn table(&self) -> &CalibrationTable {
        &self.table
    }
    /// The calibration table, for the tuner
    pub fn table_mut(&mut self) -> &mut CalibrationTable {
        &mut self.table
    }

    /// Code of a half step
    pub fn din_h(&self, octave: u8, halfstep: u8) -> u32 {
        octave as u32 * self.dins_per_octave + halfstep as u32 * self.dins_per_halfstep
    }
    /// Code of an xstep position
    pub fn din_x(&self, pos: OctaveXstep) -> u32 {
        pos.octave as u32 * self.dins_per_octave
            + ((pos.xstep as u32 * self.dins_per_halfstep) >> XSTEP_BITS)
    }

    fn octave_mul(&self, octave: u8) -> OctaveMul {
        let idx = (octave as usize).min(self.octave_muls.len() - 1);
        self.octave_muls[idx]
    }

    /// Nominal frequency of a position, Hz×16
    pub fn frequency16(&self, pos: OctaveXstep) -> Freq16 {
        freq16(self.octave_mul(pos.octave), xstep_multiplier(pos.xstep))
    }
    /// Nominal frequency of a position, whole Hz
    pub fn frequency(&self, pos: OctaveXstep) -> u32 {
        self.frequency16(pos).to_num::<u32>()
    }
    /// Nominal timer width of a position
    pub fn width(&self, pos: OctaveXstep) -> WidthFreq {
        let freq16 = self.frequency16(pos);
        WidthFreq {
            width: (REFERENCE_CLOCK_HZ << 4) / freq16.to_bits().max(1),
            freq: freq16.to_num::<u32>(),
            freq16,
        }
    }

    /// Position of a code.  Codes above the oscillator's range clamp to the
    /// top of its last octave.
    pub fn code_to_octave_step(&self, code: u32) -> OctaveXstep {
        let octave = code / self.dins_per_octave;
        if octave > self.config.octaves as u32 {
            return OctaveXstep {
                octave: self.config.octaves,
                xstep: (XSTEPS_PER_OCTAVE - 1) as u16,
            };
        }
        let xstep = ((code % self.dins_per_octave) << XSTEP_BITS) / self.dins_per_halfstep;
        OctaveXstep {
            octave: octave as u8,
            xstep: xstep.min(XSTEPS_PER_OCTAVE - 1) as u16,
        }
    }
    /// Nominal frequency of a code, Hz×16
    pub fn code_to_frequency16(&self, code: u32) -> Freq16 {
        self.frequency16(self.code_to_octave_step(code))
    }
    /// Nominal frequency of a code, whole Hz
    pub fn code_to_frequency(&self, code: u32) -> u32 {
        self.frequency(self.code_to_octave_step(code))
    }
    /// Nominal timer width of a code
    pub fn code_to_width(&self, code: u32) -> WidthFreq {
        self.width(self.code_to_octave_step(code))
    }
    /// Output voltage of a code
    pub fn volts(&self, code: u32) -> f32 {
        self.config.low_volts + code as f32 / self.config.dins_per_volt as f32
    }

    /// Landmark number of the tritone containing `pos`
    pub fn tritone_of(&self, pos: OctaveXstep) -> u8 {
        (pos.octave as u32 * 2 + pos.xstep as u32 / XSTEPS_PER_TRITONE) as u8
    }
    /// Position of a landmark
    pub fn tritone(&self, tritone: u8) -> OctaveXstep {
        let xsteps = tritone as u32 * XSTEPS_PER_TRITONE;
        OctaveXstep {
            octave: (xsteps / XSTEPS_PER_OCTAVE) as u8,
            xstep: (xsteps % XSTEPS_PER_OCTAVE) as u16,
        }
    }

    /// Calibration offset at a position, interpolated between the two
    /// landmarks around it
    pub fn offset_steps(&self, pos: OctaveXstep) -> i16 {
        let t = self.tritone_of(pos) as usize;
        let lo = self.table.get(t) as i32;
        let hi = self.table.get(t + 1) as i32;
        let within = (pos.xstep as u32 % XSTEPS_PER_TRITONE) as i32;
        (lo + (hi - lo) * within / XSTEPS_PER_TRITONE as i32) as i16
    }
    /// Calibration offset for a code
    pub fn offset_for_code(&self, code: u32) -> i16 {
        self.offset_steps(self.code_to_octave_step(code))
    }

    /// Code whose nominal frequency is `freq16`, rounded.  Tuning-time only.
    pub fn frequency16_to_code(&self, freq16: Freq16) -> u32 {
        let ratio = freq16.to_num::<f64>() / self.config.low_frequency as f64;
        if !(ratio > 0.0) {
            return 0;
        }
        (Float::log2(ratio) * self.dins_per_octave as f64 + 0.5) as u32
    }
    /// Position whose nominal frequency is `freq16`
    pub fn frequency16_to_octave_step(&self, freq16: Freq16) -> OctaveXstep {
        self.code_to_octave_step(self.frequency16_to_code(freq16))
    }
    /// Code of the pitch `ratio` times the base of `octave`.  A ratio of 3/2
    /// is a just fifth above the octave.
    pub fn code_for_ratio(&self, octave: u8, ratio: f32) -> u32 {
        let octaves = octave as f64 + Float::log2(ratio.max(f32::MIN_POSITIVE) as f64);
        (octaves * self.dins_per_octave as f64 + 0.5).max(0.0) as u32
    }
    /// The code the oscillator actually produced when asked for
    /// `target_code` (whose nominal width is `target_width`) and measured
    /// `measured_width`.  Tuning-time only.
    pub fn implied_code(&self, target_code: u32, target_width: u32, measured_width: u32) -> i32 {
        if measured_width == 0 || target_width == 0 {
            return target_code as i32;
        }
        let octaves = Float::log2(target_width as f64 / measured_width as f64);
        target_code as i32 + Float::round(octaves * self.dins_per_octave as f64) as i32
    }
    /// Frequency of a measured width, Hz×16
    pub fn measured_frequency16(&self, width: u32) -> Freq16 {
        width_to_frequency16(width)
    }

    /// Exact (floating point) frequency of a code, for diagnostics
    pub fn exact_frequency(&self, code: u32) -> f32 {
        self.config.low_frequency
            * Float::powf(2f32, code as f32 / self.dins_per_octave as f32)
    }
}

/// Landmark dump: one line per tritone with the values of every conversion
/// that passes through it.
impl fmt::Display for PitchConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "dins_per_octave {}, dins_per_halfstep {}, xsteps {}",
            self.dins_per_octave,
            self.dins_per_halfstep,
            XSTEP_MULS.len()
        )?;
        f.write_str("    [")?;
        for m in &self.octave_muls {
            write!(f, "{} ", m.to_bits())?;
        }
        writeln!(f, "]")?;
        writeln!(f, "Tritones:")?;
        for t in 0..self.config.landmarks() as u8 {
            let pos = self.tritone(t);
            let w = self.width(pos);
            let code = self.din_x(pos);
            let back = self.code_to_width(code);
            writeln!(
                f,
                "   ({:2} {:2}) ({:2} {:4}) ({:8} {:8}) ({:5} {:10.4}) ({:5} {:5}) {:6.2} {:4}",
                t,
                self.tritone_of(pos),
                pos.octave,
                pos.xstep,
                w.width,
                back.width,
                w.freq,
                w.freq16.to_num::<f32>(),
                code,
                self.frequency16_to_code(w.freq16),
                self.volts(code),
                self.table.get(t as usize),
            )?;
        }
        Ok(())
    }
}

/// Per landmark view of the interpolated offsets, one value per half step.
pub struct LandmarkOffsets<'c> {
    converter: &'c PitchConverter,
    tritone: u8,
}

impl PitchConverter {
    /// See [LandmarkOffsets]
    pub fn landmark_offsets(&self, tritone: u8) -> LandmarkOffsets<'_> {
        LandmarkOffsets {
            converter: self,
            tritone,
        }
    }
}

impl fmt::Display for LandmarkOffsets<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.tritone as usize;
        let table = self.converter.table();
        write!(f, "{:2} {:4} to {:4} --", t, table.get(t), table.get(t + 1))?;
        let start = self.converter.tritone(self.tritone);
        for h in 0..(XSTEPS_PER_TRITONE / XSTEPS_PER_HALFSTEP) as u16 {
            let pos = OctaveXstep {
                octave: start.octave,
                xstep: start.xstep + h * XSTEPS_PER_HALFSTEP as u16,
            };
            write!(f, " {:4}", self.converter.offset_steps(pos))?;
        }
        Ok(())
    }
}

/// Split a MIDI note number into (octave, half step) relative to the bottom
/// of the reference oscillator (A0 minus three octaves, note 9).  Lower notes
/// clamp to the bottom.
pub fn midi_to_octave_halfstep(note: u8) -> (u8, u8) {
    let n = note.max(9) - 9;
    (n / HALFSTEPS_PER_OCTAVE as u8, n % HALFSTEPS_PER_OCTAVE as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::calculate_cents;

    fn reference() -> PitchConverter {
        PitchConverter::new(OscillatorConfig::default()).unwrap()
    }

    #[test]
    fn halfstep_round_trip() {
        let conv = reference();
        for octave in 0..10u8 {
            for half in 0..12u8 {
                let code = conv.din_h(octave, half);
                assert_eq!(
                    conv.code_to_octave_step(code),
                    OctaveXstep::halfstep(octave, half)
                );
            }
        }
    }

    #[test]
    fn reference_frequencies() {
        let conv = reference();
        let a440 = conv.frequency16(OctaveXstep::halfstep(5, 0));
        assert!((a440.to_bits() as i32 - 7040).abs() <= 1);
        assert_eq!(conv.frequency(OctaveXstep::halfstep(0, 0)), 13);
        assert_eq!(conv.din_h(5, 0), 32640);
        assert_eq!(conv.volts(32640), 0.0);
        // below 110Hz the 1/16Hz resolution of Freq16 is worth more than a cent
        for code in (3 * 6528..65_000).step_by(997) {
            let nominal = conv.code_to_frequency16(code).to_num::<f32>();
            let exact = conv.exact_frequency(code);
            assert!(calculate_cents(exact, nominal).abs() < 2.0, "code {}", code);
        }
    }

    #[test]
    fn width_of_a440() {
        let conv = reference();
        let w = conv.width(OctaveXstep::halfstep(5, 0));
        assert_eq!(w.freq, 440);
        assert_eq!(w.width, 245_454);
        assert_eq!(conv.code_to_width(32640), w);
    }

    #[test]
    fn tritone_positions() {
        let conv = reference();
        assert_eq!(conv.tritone(0), OctaveXstep::default());
        assert_eq!(conv.tritone(5), OctaveXstep::halfstep(2, 6));
        assert_eq!(conv.tritone(20), OctaveXstep::halfstep(10, 0));
        for t in 0..21 {
            assert_eq!(conv.tritone_of(conv.tritone(t)), t);
            assert_eq!(conv.din_x(conv.tritone(t)), t as u32 * 3264);
        }
    }

    #[test]
    fn offsets_interpolate_between_landmarks() {
        let mut conv = reference();
        conv.table_mut().set(6, -40);
        conv.table_mut().set(7, 20);
        let lo = conv.din_x(conv.tritone(6));
        let hi = conv.din_x(conv.tritone(7));
        assert_eq!(conv.offset_for_code(lo), -40);
        assert_eq!(conv.offset_for_code(hi), 20);
        let mut last = -40;
        for code in lo..hi {
            let o = conv.offset_for_code(code);
            assert!(o >= last && o <= 20);
            last = o;
        }
        assert_eq!(conv.offset_for_code((lo + hi) / 2), -10);
    }

    #[test]
    fn offsets_above_range_use_top_landmark() {
        let mut conv = reference();
        conv.table_mut().set(20, 7);
        assert_eq!(conv.offset_for_code(u16::MAX as u32), 7);
    }

    #[test]
    fn backfill_from_tuned_neighbours() {
        let mut table = CalibrationTable::new(21);
        for t in 4..=18 {
            table.set(t, t as i16);
        }
        table.backfill(4, 18);
        assert_eq!(&table.offsets()[..5], &[4, 4, 4, 4, 4]);
        assert_eq!(&table.offsets()[18..], &[18, 18, 18]);
        table.clear();
        assert!(table.offsets().iter().all(|&o| o == 0));
    }

    #[test]
    fn frequency_to_code() {
        let conv = reference();
        assert_eq!(conv.frequency16_to_code(Freq16::from_num(440)), 32640);
        assert_eq!(
            conv.frequency16_to_octave_step(Freq16::from_num(880)),
            OctaveXstep::halfstep(6, 0)
        );
        assert_eq!(conv.frequency16_to_code(Freq16::ZERO), 0);
        // a just fifth is two cents above the tempered one
        let fifth = conv.code_for_ratio(5, 1.5);
        assert_eq!(fifth, 32640 + 3819);
    }

    #[test]
    fn implied_code_from_width() {
        let conv = reference();
        let target = conv.din_h(5, 0);
        let w = conv.code_to_width(target).width;
        assert_eq!(conv.implied_code(target, w, w), target as i32);
        // a width twice as long is an octave down
        assert_eq!(conv.implied_code(target, w, 2 * w), target as i32 - 6528);
    }

    #[test]
    fn midi_notes() {
        assert_eq!(midi_to_octave_halfstep(69), (5, 0));
        assert_eq!(midi_to_octave_halfstep(60), (4, 3));
        assert_eq!(midi_to_octave_halfstep(0), (0, 0));
    }
}
