//! DAC output: the bus abstraction, the LTC2668 driver, and the per-channel
//! output state.

use crate::board::{DacId, VcoId};
use crate::config::VoltSpan;
use crate::correct::CorrectionState;
use crate::{Error, Result};
use core::fmt;
use embedded_hal::spi::SpiDevice;

/// Something that can put codes on DAC outputs.
///
/// Channels are numbered across the whole board; a driver for multi-channel
/// chips works out which chip a channel lives on.  `write_code` may be called
/// from interrupt context, so implementations must not block for longer than
/// one transfer.
pub trait DacBus {
    /// Write and update one channel
    fn write_code(&mut self, dac: u8, code: u16) -> Result<()>;
    /// Select the output span of one channel
    fn write_span(&mut self, dac: u8, span: VoltSpan) -> Result<()>;
    /// Write and update every channel of the chip that `dac` is on
    fn write_all(&mut self, dac: u8, code: u16) -> Result<()>;
}

/// True if `code` can be written to a 16 bit DAC
pub fn is_code_in_range(code: i32) -> bool {
    (0..=u16::MAX as i32).contains(&code)
}

const CMD_WRITE_UPDATE: u8 = 0x30;
const CMD_SPAN: u8 = 0x60;
const CMD_WRITE_ALL_UPDATE: u8 = 0xA0;

/// LTC2668 16 channel 16 bit DACs, one SPI device (chip select) per chip.
pub struct Ltc2668Bank<S, const CHIPS: usize> {
    devices: [S; CHIPS],
}

impl<S: SpiDevice, const CHIPS: usize> Ltc2668Bank<S, CHIPS> {
    /// Wrap one SPI device per chip; channel `n` is on chip `n >> 4`
    pub fn new(devices: [S; CHIPS]) -> Self {
        Self { devices }
    }

    fn send(&mut self, dac: u8, frame: [u8; 3]) -> Result<()> {
        let device = self
            .devices
            .get_mut((dac >> 4) as usize)
            .ok_or(Error::UnknownDac(dac))?;
        device.write(&frame).map_err(|_| Error::Bus)
    }

    /// Release the SPI devices
    pub fn release(self) -> [S; CHIPS] {
        self.devices
    }
}

impl<S: SpiDevice, const CHIPS: usize> DacBus for Ltc2668Bank<S, CHIPS> {
    fn write_code(&mut self, dac: u8, code: u16) -> Result<()> {
        let [hi, lo] = code.to_be_bytes();
        self.send(dac, [CMD_WRITE_UPDATE | (dac & 0x0f), hi, lo])
    }
    fn write_span(&mut self, dac: u8, span: VoltSpan) -> Result<()> {
        self.send(dac, [CMD_SPAN | (dac & 0x0f), 0, span.code()])
    }
    fn write_all(&mut self, dac: u8, code: u16) -> Result<()> {
        let [hi, lo] = code.to_be_bytes();
        self.send(dac, [CMD_WRITE_ALL_UPDATE, hi, lo])
    }
}

/// Output state of one DAC channel.
#[derive(Clone, Debug)]
pub struct DacChannel {
    id: DacId,
    span: VoltSpan,
    pub(crate) vco: Option<VcoId>,
    pub(crate) correction: CorrectionState,
    pub(crate) vout: u16,
    pub(crate) voct: (u8, u8),
    output: u16,
    writes: u32,
}

impl DacChannel {
    pub(crate) fn new(id: DacId, span: VoltSpan) -> Self {
        Self {
            id,
            span,
            vco: None,
            correction: CorrectionState::new(),
            vout: 0,
            voct: (0, 0),
            output: 0,
            writes: 0,
        }
    }

    /// The channel's number on the board
    pub fn id(&self) -> DacId {
        self.id
    }
    /// Current output span
    pub fn span(&self) -> VoltSpan {
        self.span
    }
    pub(crate) fn set_span<B: DacBus>(&mut self, bus: &mut B, span: VoltSpan) -> Result<()> {
        bus.write_span(self.id.0, span)?;
        self.span = span;
        Ok(())
    }
    /// The oscillator this channel drives, if any
    pub fn vco(&self) -> Option<VcoId> {
        self.vco
    }
    /// The last commanded code, before calibration
    pub fn vout(&self) -> u16 {
        self.vout
    }
    /// The last code actually written
    pub fn output(&self) -> u16 {
        self.output
    }
    /// The last (octave, half step) set through `voct` or `vmidi`
    pub fn voct(&self) -> (u8, u8) {
        self.voct
    }
    /// Number of commanded outputs
    pub fn writes(&self) -> u32 {
        self.writes
    }
    /// The closed-loop correction state
    pub fn correction(&self) -> &CorrectionState {
        &self.correction
    }

    pub(crate) fn count_command(&mut self) {
        self.writes = self.writes.wrapping_add(1);
    }

    /// Put a code on the output, bypassing calibration and correction
    pub(crate) fn send<B: DacBus>(&mut self, bus: &mut B, code: u16) -> Result<()> {
        bus.write_code(self.id.0, code)?;
        self.output = code;
        Ok(())
    }
}

impl fmt::Display for DacChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DAC {:2} span {}..{} vout {:5} out {:5} writes {}",
            self.id.0, self.span.low(), self.span.high(), self.vout, self.output, self.writes
        )?;
        if let Some(vco) = self.vco {
            write!(f, " vco {}", vco.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::spi::{ErrorType, Operation};

    #[derive(Default)]
    struct Recorder {
        frames: Vec<Vec<u8>>,
    }

    impl ErrorType for Recorder {
        type Error = core::convert::Infallible;
    }

    impl SpiDevice for Recorder {
        fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> core::result::Result<(), Self::Error> {
            for op in operations {
                if let Operation::Write(buf) = op {
                    self.frames.push(buf.to_vec());
                }
            }
            Ok(())
        }
    }

    #[test]
    fn ltc2668_frames() {
        let mut bank = Ltc2668Bank::new([Recorder::default(), Recorder::default()]);
        bank.write_code(0x13, 0xABCD).unwrap();
        bank.write_span(0x02, VoltSpan::BIPOLAR_5).unwrap();
        bank.write_all(0x1f, 0x8000).unwrap();
        assert_eq!(bank.write_code(0x20, 1), Err(Error::UnknownDac(0x20)));
        let [chip0, chip1] = bank.release();
        assert_eq!(chip0.frames, [[0x62, 0, 2]]);
        assert_eq!(chip1.frames, [[0x33, 0xAB, 0xCD], [0xA0, 0x80, 0x00]]);
    }

    #[test]
    fn code_range() {
        assert!(is_code_in_range(0));
        assert!(is_code_in_range(65535));
        assert!(!is_code_in_range(-1));
        assert!(!is_code_in_range(65536));
    }
}
