//! ADC input for diagnostics: the bus abstraction and the LTC1859 driver.
//!
//! Nothing in the tuning or correction loop reads the ADCs.  They read back
//! what a DAC channel or a control input actually carries.

use crate::config::VoltSpan;
use crate::{Error, Result};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::InputPin;
use embedded_hal::spi::SpiDevice;

/// Channels on one LTC1859
pub const ADC_CHANNELS: usize = 8;
/// Longest wait for a conversion, in µs
pub const CONVERSION_TIMEOUT_US: u32 = 100;

const SINGLE_ENDED: u8 = 0x80;
const ODD: u8 = 0x40;
const SELECT1: u8 = 0x20;
const SELECT0: u8 = 0x10;
const UNIPOLAR: u8 = 0x08;
const GAIN: u8 = 0x04;

/// Something that can read voltages.
pub trait AdcBus {
    /// Select the input span of one channel
    fn set_span(&mut self, channel: u8, span: VoltSpan) -> Result<()>;
    /// Convert one channel and return the result, signed for bipolar spans
    fn read(&mut self, channel: u8, delay: &mut impl DelayNs) -> Result<i32>;
}

/// The command word that converts `channel` single-ended in `span`
pub const fn command_word(channel: u8, span: VoltSpan) -> u8 {
    let mut word = SINGLE_ENDED;
    if channel & 1 != 0 {
        word |= ODD;
    }
    if channel & 4 != 0 {
        word |= SELECT1;
    }
    if channel & 2 != 0 {
        word |= SELECT0;
    }
    if span.unipolar() {
        word |= UNIPOLAR;
    }
    if span.wide() {
        word |= GAIN;
    }
    word
}

/// Interpret a conversion result: two's complement in bipolar spans
pub fn decode(raw: [u8; 2], span: VoltSpan) -> i32 {
    let value = u16::from_be_bytes(raw);
    if span.unipolar() {
        value as i32
    } else {
        value as i16 as i32
    }
}

/// One LTC1859 8 channel 16 bit ADC with its BUSY output.
///
/// Every transfer clocks out the result of the previous conversion while it
/// starts the next one, so a read takes two transfers with a wait on BUSY in
/// between.
pub struct Ltc1859<S, P> {
    spi: S,
    busy: P,
    spans: [VoltSpan; ADC_CHANNELS],
}

impl<S: SpiDevice, P: InputPin> Ltc1859<S, P> {
    /// Wrap the chip's SPI device and BUSY pin, every channel in `span`
    pub fn new(spi: S, busy: P, span: VoltSpan) -> Self {
        Self {
            spi,
            busy,
            spans: [span; ADC_CHANNELS],
        }
    }

    /// Span of one channel
    pub fn span(&self, channel: u8) -> Result<VoltSpan> {
        self.spans
            .get(channel as usize)
            .copied()
            .ok_or(Error::UnknownAdc(channel))
    }

    /// True while a conversion is running (BUSY is low)
    pub fn busy(&mut self) -> Result<bool> {
        self.busy.is_low().map_err(|_| Error::Bus)
    }

    /// Start a conversion of `channel`, returning the result of the previous
    /// one as if it had been taken in `channel`'s span
    pub fn exchange(&mut self, channel: u8) -> Result<i32> {
        let span = self.span(channel)?;
        let mut raw = [0; 2];
        self.spi
            .transfer(&mut raw, &[command_word(channel, span), 0])
            .map_err(|_| Error::Bus)?;
        Ok(decode(raw, span))
    }

    /// Release the SPI device and the pin
    pub fn release(self) -> (S, P) {
        (self.spi, self.busy)
    }
}

impl<S: SpiDevice, P: InputPin> AdcBus for Ltc1859<S, P> {
    fn set_span(&mut self, channel: u8, span: VoltSpan) -> Result<()> {
        let slot = self
            .spans
            .get_mut(channel as usize)
            .ok_or(Error::UnknownAdc(channel))?;
        *slot = span;
        Ok(())
    }

    fn read(&mut self, channel: u8, delay: &mut impl DelayNs) -> Result<i32> {
        self.exchange(channel)?;
        let mut waited = 0;
        while self.busy()? {
            if waited >= CONVERSION_TIMEOUT_US {
                log::warn!("ADC channel {} conversion timed out", channel);
                return Err(Error::AdcTimeout(channel));
            }
            delay.delay_us(1);
            waited += 1;
        }
        self.exchange(channel)
    }
}
