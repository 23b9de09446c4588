//! Fixed-point types and lookup tables used by the pitch conversions.
//!
//! Everything on the per-tick path (code to frequency, code to timer width,
//! calibration interpolation) is integer or fixed-point math built on these
//! tables.  Floating point is reserved for tuning-time helpers.

pub use fixed::types::*;

/// A frequency in Hz with four fractional bits.  The raw bits of a `Freq16`
/// are "Hz times 16", which is the unit the capture hardware math is done in.
pub type Freq16 = U28F4;
/// Frequency of the bottom of an octave, in Hz, with two fractional bits.
/// 16 bits covers up to ~16kHz, enough for the top octave of a 10 octave
/// oscillator starting at 13.75Hz.
pub type OctaveMul = U14F2;
/// A multiplier in `[1, 2)` representing the pitch ratio of an xstep within
/// an octave, i.e. `2^(xstep / XSTEPS_PER_OCTAVE)`.
pub type XStepMul = U1F15;

/// log2 of the number of xsteps in a half step
pub const XSTEP_BITS: u32 = 9;
/// Half steps in an octave (12 tone equal temperament)
pub const HALFSTEPS_PER_OCTAVE: u32 = 12;
/// Half steps in a tritone (half an octave)
pub const HALFSTEPS_PER_TRITONE: u32 = 6;
/// xsteps in a half step
pub const XSTEPS_PER_HALFSTEP: u32 = 1 << XSTEP_BITS;
/// xsteps in a tritone (the spacing of the calibration landmarks)
pub const XSTEPS_PER_TRITONE: u32 = HALFSTEPS_PER_TRITONE << XSTEP_BITS;
/// xsteps in an octave
pub const XSTEPS_PER_OCTAVE: u32 = HALFSTEPS_PER_OCTAVE << XSTEP_BITS;

// e^x for small x, good to double precision for |x| < 1e-3
const fn exp_small(x: f64) -> f64 {
    let mut term = 1f64;
    let mut acc = 1f64;
    let mut n = 1u32;
    while n < 12 {
        term = term * x / (n as f64);
        acc += term;
        n += 1;
    }
    acc
}

const fn generate_xstep_muls() -> [XStepMul; XSTEPS_PER_OCTAVE as usize] {
    const LN_2: f64 = core::f64::consts::LN_2;
    const SCALE: f64 = (1u32 << 15) as f64;
    // ratio between two adjacent xsteps; the table is built as a running
    // product so the const evaluation stays cheap.
    let ratio = exp_small(LN_2 / XSTEPS_PER_OCTAVE as f64);
    let mut table = [XStepMul::ONE; XSTEPS_PER_OCTAVE as usize];
    let mut value = 1f64;
    let mut i = 0usize;
    while i < XSTEPS_PER_OCTAVE as usize {
        table[i] = XStepMul::from_bits((value * SCALE + 0.5) as u16);
        value *= ratio;
        i += 1;
    }
    table
}

/// `XSTEP_MULS[i] == round(2^(i / XSTEPS_PER_OCTAVE) * 2^15)`, stored as a
/// [XStepMul].
pub static XSTEP_MULS: [XStepMul; XSTEPS_PER_OCTAVE as usize] = generate_xstep_muls();

/// Look up the pitch ratio for an xstep.  Values past the end of the octave
/// are clamped to the last entry.
pub fn xstep_multiplier(xstep: u16) -> XStepMul {
    let idx = (xstep as usize).min(XSTEP_MULS.len() - 1);
    XSTEP_MULS[idx]
}

/// Multiply an octave base frequency by an xstep ratio, yielding a frequency
/// with four fractional bits.
pub fn freq16(octave_mul: OctaveMul, xstep_mul: XStepMul) -> Freq16 {
    // U14F2 * U1F15 -> U15F17, truncated down to 4 fractional bits
    Freq16::from_num(octave_mul.wide_mul(xstep_mul))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::calculate_cents;

    #[test]
    fn xstep_table_endpoints() {
        assert_eq!(XSTEP_MULS[0], XStepMul::ONE);
        // sqrt(2) * 32768 = 46340.95
        assert_eq!(XSTEP_MULS[XSTEPS_PER_TRITONE as usize].to_bits(), 46341);
        let last = XSTEP_MULS[XSTEPS_PER_OCTAVE as usize - 1].to_num::<f64>();
        assert!(last < 2.0 && last > 1.999);
    }

    #[test]
    fn xstep_table_matches_powf() {
        for (i, value) in XSTEP_MULS.iter().enumerate() {
            let expected = (f64::powf(2.0, i as f64 / XSTEPS_PER_OCTAVE as f64) * 32768.0).round();
            let diff = (value.to_bits() as f64 - expected).abs();
            assert!(diff <= 1.0, "entry {} off by {}", i, diff);
        }
    }

    #[test]
    fn xstep_table_is_monotonic() {
        for pair in XSTEP_MULS.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn freq16_of_reference_octave() {
        // 13.75Hz * 2^5 * 4 == 1760
        let omul = OctaveMul::from_bits(1760);
        assert_eq!(freq16(omul, xstep_multiplier(0)).to_bits(), 7040);
        assert_eq!(freq16(omul, xstep_multiplier(0)), Freq16::from_num(440));
    }

    #[test]
    fn freq16_half_steps_within_a_cent() {
        let omul = OctaveMul::from_bits(1760);
        for halfstep in 0..12u16 {
            let expected = 440.0 * f32::powf(2.0, halfstep as f32 / 12.0);
            let actual = freq16(omul, xstep_multiplier(halfstep << XSTEP_BITS)).to_num::<f32>();
            assert!(calculate_cents(expected, actual).abs() < 1.0);
        }
    }

    #[test]
    fn xstep_multiplier_clamps() {
        assert_eq!(xstep_multiplier(u16::MAX), XSTEP_MULS[XSTEP_MULS.len() - 1]);
    }
}
