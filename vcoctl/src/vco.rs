//! A voltage-controlled oscillator: its pitch converter and calibration, the
//! capture channel measuring it, and the DAC channel driving it.

use crate::board::{DacId, VcoId};
use crate::capture::FreqChannel;
use crate::config::OscillatorConfig;
use crate::pitch::PitchConverter;
use crate::Result;
use core::fmt;

/// One oscillator on the board.
///
/// The oscillator owns its [PitchConverter] (and through it the calibration
/// table).  The DAC channel and capture channel are references resolved
/// through the [Board](crate::Board) and the capture timer respectively.
pub struct Vco<'a> {
    id: VcoId,
    dac: DacId,
    freq: &'a FreqChannel,
    converter: PitchConverter,
    tuned: bool,
}

impl<'a> Vco<'a> {
    pub(crate) fn new(
        id: VcoId,
        dac: DacId,
        freq: &'a FreqChannel,
        config: OscillatorConfig,
    ) -> Result<Self> {
        Ok(Self {
            id,
            dac,
            freq,
            converter: PitchConverter::new(config)?,
            tuned: false,
        })
    }

    /// Handle of this oscillator
    pub fn id(&self) -> VcoId {
        self.id
    }
    /// The DAC channel driving this oscillator
    pub fn dac(&self) -> DacId {
        self.dac
    }
    /// The capture channel measuring this oscillator
    pub fn freq(&self) -> &'a FreqChannel {
        self.freq
    }
    /// Conversions and calibration
    pub fn converter(&self) -> &PitchConverter {
        &self.converter
    }
    pub(crate) fn converter_mut(&mut self) -> &mut PitchConverter {
        &mut self.converter
    }
    /// True once a full tuning pass completed since the last clear
    pub fn tuned(&self) -> bool {
        self.tuned
    }
    pub(crate) fn set_tuned(&mut self, tuned: bool) {
        self.tuned = tuned;
    }
    /// Forget the calibration
    pub fn clear(&mut self) {
        self.tuned = false;
        self.converter.table_mut().clear();
    }
}

/// Compact status of an oscillator: the capture channel and calibration.
impl fmt::Display for Vco<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VCO {} dac {:2} {} {} {}",
            self.id.0,
            self.dac.0,
            if self.tuned { "tuned" } else { "untuned" },
            self.freq,
            self.converter.table()
        )
    }
}
