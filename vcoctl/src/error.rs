//! Error type shared by the whole crate.

use core::fmt;

/// Everything that can go wrong while configuring or driving the oscillators.
///
/// Runtime "soft" failures (a tuning run that never got a stable reading, a
/// capture wait that timed out) are not errors: they are reported through
/// return values and logs so a single bad channel never takes the system down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requested output span is not one the converter supports
    UnsupportedSpan(i8, i8),
    /// An oscillator description does not describe a usable oscillator
    InvalidOscillator(&'static str),
    /// No DAC channel with this index is registered
    UnknownDac(u8),
    /// The ADC has no channel with this index
    UnknownAdc(u8),
    /// An ADC conversion on this channel never finished
    AdcTimeout(u8),
    /// No oscillator with this index is registered
    UnknownVco(u8),
    /// No envelope with this index is registered
    UnknownEnvelope(u8),
    /// The envelope has no segment with this index
    UnknownSegment(u8),
    /// The DAC channel has no oscillator attached
    NoOscillator(u8),
    /// A code that lies outside the attached oscillator's range
    CodeOutOfRange(u32),
    /// A fixed-capacity collection is full
    CapacityExceeded,
    /// A converter bus reported a transfer or pin failure
    Bus,
}

/// Crate-wide result alias
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedSpan(low, high) => {
                write!(f, "unsupported output span {}V..{}V", low, high)
            }
            Error::InvalidOscillator(why) => write!(f, "invalid oscillator: {}", why),
            Error::UnknownDac(id) => write!(f, "no DAC channel {}", id),
            Error::UnknownAdc(id) => write!(f, "no ADC channel {}", id),
            Error::AdcTimeout(id) => write!(f, "ADC channel {} conversion timed out", id),
            Error::UnknownVco(id) => write!(f, "no oscillator {}", id),
            Error::UnknownEnvelope(id) => write!(f, "no envelope {}", id),
            Error::UnknownSegment(id) => write!(f, "no envelope segment {}", id),
            Error::NoOscillator(id) => write!(f, "DAC channel {} has no oscillator", id),
            Error::CodeOutOfRange(code) => write!(f, "code {} out of range", code),
            Error::CapacityExceeded => f.write_str("capacity exceeded"),
            Error::Bus => f.write_str("converter bus transfer failed"),
        }
    }
}
