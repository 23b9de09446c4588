//! Various utility functions

use core::fmt;

// currently the only users of this function are unit tests
/// Interval from `base` to `freq` in cents
#[cfg(test)]
pub fn calculate_cents(base: f32, freq: f32) -> f32 {
    1200.0 * f32::log2(freq / base)
}

/// Display adapter naming a half step relative to the lowest note an
/// oscillator can play, e.g. `C4` for octave 4, half step 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoteName(pub u8, pub u8);

impl fmt::Display for NoteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NOTES: [&str; 12] = [
            "A", "A#", "B", "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#",
        ];
        let NoteName(octave, half) = *self;
        let octave = octave as u16 + half as u16 / 12;
        write!(f, "{}{}", NOTES[(half % 12) as usize], octave)
    }
}
