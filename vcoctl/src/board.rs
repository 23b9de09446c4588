//! The board: every DAC channel and oscillator, addressed by handle.
//!
//! A [Board] owns the DAC bus, the [DacChannel]s and the [Vco]s.  Channels
//! and oscillators refer to each other only by [DacId]/[VcoId]; lookups
//! through the board return a `Result` so a stale or unknown handle is an
//! error, never a dangling reference.

use crate::capture::FreqChannel;
use crate::config::{CorrectionConfig, OscillatorConfig, VoltSpan};
use crate::dac::{is_code_in_range, DacBus, DacChannel};
use crate::envelope::CodeSink;
use crate::pitch::{midi_to_octave_halfstep, PitchConverter};
use crate::vco::Vco;
use crate::{Error, Result, MAX_DACS, MAX_VCOS};
use arrayvec::ArrayVec;
use core::fmt;

/// A DAC channel number, `0..MAX_DACS`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DacId(pub u8);

/// An oscillator handle, issued by [Board::add_vco]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcoId(pub u8);

/// All DAC channels and oscillators of a board.
pub struct Board<'a, B: DacBus> {
    bus: B,
    dacs: ArrayVec<DacChannel, MAX_DACS>,
    vcos: ArrayVec<Vco<'a>, MAX_VCOS>,
    correction: CorrectionConfig,
}

impl<'a, B: DacBus> Board<'a, B> {
    /// An empty board on `bus`
    pub fn new(bus: B, correction: CorrectionConfig) -> Self {
        Self {
            bus,
            dacs: ArrayVec::new(),
            vcos: ArrayVec::new(),
            correction,
        }
    }

    /// The DAC bus
    pub fn bus(&self) -> &B {
        &self.bus
    }
    /// The DAC bus
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
    /// Correction parameters
    pub fn correction_config(&self) -> &CorrectionConfig {
        &self.correction
    }

    /// Register DAC channel `number` and set its span.  Registering a channel
    /// twice just changes its span.
    pub fn add_dac(&mut self, number: u8, span: VoltSpan) -> Result<DacId> {
        if number as usize >= MAX_DACS {
            log::error!("DAC channel {} does not exist", number);
            return Err(Error::UnknownDac(number));
        }
        let id = DacId(number);
        let idx = match self.dac_index(id) {
            Ok(idx) => idx,
            Err(_) => {
                self.dacs
                    .try_push(DacChannel::new(id, span))
                    .map_err(|_| Error::CapacityExceeded)?;
                self.dacs.len() - 1
            }
        };
        self.dacs[idx].set_span(&mut self.bus, span)?;
        log::debug!("DAC {} span {}..{}", number, span.low(), span.high());
        Ok(id)
    }

    /// Attach an oscillator to a registered DAC channel and capture channel.
    pub fn add_vco(
        &mut self,
        dac: DacId,
        freq: &'a FreqChannel,
        config: OscillatorConfig,
    ) -> Result<VcoId> {
        let didx = self.dac_index(dac)?;
        if self.vcos.is_full() {
            return Err(Error::CapacityExceeded);
        }
        let id = VcoId(self.vcos.len() as u8);
        let vco = Vco::new(id, dac, freq, config).inspect_err(|e| {
            log::error!("VCO on DAC {}: {}", dac.0, e);
        })?;
        self.vcos.push(vco);
        self.dacs[didx].vco = Some(id);
        Ok(id)
    }

    fn dac_index(&self, dac: DacId) -> Result<usize> {
        self.dacs
            .iter()
            .position(|d| d.id() == dac)
            .ok_or(Error::UnknownDac(dac.0))
    }

    /// Look up a DAC channel
    pub fn dac(&self, dac: DacId) -> Result<&DacChannel> {
        self.dac_index(dac).map(|i| &self.dacs[i])
    }
    /// Look up an oscillator
    pub fn vco(&self, vco: VcoId) -> Result<&Vco<'a>> {
        self.vcos
            .get(vco.0 as usize)
            .ok_or(Error::UnknownVco(vco.0))
    }
    /// Look up an oscillator
    pub fn vco_mut(&mut self, vco: VcoId) -> Result<&mut Vco<'a>> {
        self.vcos
            .get_mut(vco.0 as usize)
            .ok_or(Error::UnknownVco(vco.0))
    }
    /// Every registered DAC channel
    pub fn dacs(&self) -> impl Iterator<Item = &DacChannel> {
        self.dacs.iter()
    }
    /// Every oscillator
    pub fn vcos(&self) -> impl Iterator<Item = &Vco<'a>> {
        self.vcos.iter()
    }
    /// The oscillator driven by a DAC channel
    pub fn vco_of(&self, dac: DacId) -> Result<VcoId> {
        self.dac(dac)?.vco().ok_or(Error::NoOscillator(dac.0))
    }
    /// The pitch converter of the oscillator driven by a DAC channel
    pub fn converter(&self, dac: DacId) -> Result<&PitchConverter> {
        let vco = self.vco_of(dac)?;
        Ok(self.vco(vco)?.converter())
    }

    /// The oscillator, its DAC channel and the bus, borrowed together
    pub(crate) fn parts(&mut self, vco: VcoId) -> Result<(&mut Vco<'a>, &mut DacChannel, &mut B)> {
        let osc = self
            .vcos
            .get_mut(vco.0 as usize)
            .ok_or(Error::UnknownVco(vco.0))?;
        let dac = osc.dac();
        let ch = self
            .dacs
            .iter_mut()
            .find(|d| d.id() == dac)
            .ok_or(Error::UnknownDac(dac.0))?;
        Ok((osc, ch, &mut self.bus))
    }

    /// True if `code + offset` can be written to a channel that drives an
    /// oscillator
    pub fn is_code_in_range(&self, dac: DacId, code: i32, offset: i16) -> bool {
        self.vco_of(dac).is_ok() && is_code_in_range(code + offset as i32)
    }

    /// Command a code.
    ///
    /// If the channel drives a tuned oscillator the code is calibrated (when
    /// the calibrated code is in range) and the correction target is reset to
    /// the width the code should produce.  `adjust` enables closed-loop
    /// correction for this pitch.  Safe to call from the envelope tick.
    pub fn vout(&mut self, dac: DacId, code: u16, adjust: bool) -> Result<()> {
        let idx = self.dac_index(dac)?;
        let ch = &mut self.dacs[idx];
        ch.count_command();
        ch.vout = code;
        let mut out = code;
        match ch.vco.and_then(|v| self.vcos.get(v.0 as usize)) {
            Some(vco) if vco.tuned() => {
                let converter = vco.converter();
                let offset = converter.offset_for_code(code as u32);
                let calibrated = code as i32 + offset as i32;
                ch.correction.note_attempt(offset, calibrated);
                if is_code_in_range(calibrated) {
                    out = calibrated as u16;
                }
                let target = converter.code_to_width(code as u32).width;
                ch.correction
                    .retarget(target, self.correction.shift, out, adjust);
                ch.correction.mark_written(vco.freq().samples());
                vco.freq().set_hold_off(false);
                vco.freq().correction_ready().drain();
            }
            _ => ch.correction.set_code(out, adjust),
        }
        ch.send(&mut self.bus, out)
    }

    /// Write a code as is: no calibration, no correction target
    pub fn vout_raw(&mut self, dac: DacId, code: u16) -> Result<()> {
        let idx = self.dac_index(dac)?;
        let ch = &mut self.dacs[idx];
        if let Some(vco) = ch.vco.and_then(|v| self.vcos.get(v.0 as usize)) {
            ch.correction.mark_written(vco.freq().samples());
        }
        ch.send(&mut self.bus, code)
    }

    /// Command a half step, with correction enabled.  `clear` forgets the
    /// oscillator's calibration first.
    pub fn voct(&mut self, dac: DacId, octave: u8, halfstep: u8, clear: bool) -> Result<()> {
        let code = self.prepare_note(dac, octave, halfstep, clear)?;
        self.vout(dac, code, true)
    }

    /// Command a MIDI note, without correction.  Notes below the bottom of
    /// the oscillator clamp to it.
    pub fn vmidi(&mut self, dac: DacId, note: u8, clear: bool) -> Result<()> {
        let (octave, halfstep) = midi_to_octave_halfstep(note);
        let code = self.prepare_note(dac, octave, halfstep, clear)?;
        self.vout(dac, code, false)
    }

    fn prepare_note(&mut self, dac: DacId, octave: u8, halfstep: u8, clear: bool) -> Result<u16> {
        let vco = self.vco_of(dac)?;
        let osc = self.vco_mut(vco)?;
        if clear {
            osc.clear();
        }
        let code = osc.converter().din_h(octave, halfstep);
        let code = u16::try_from(code).map_err(|_| Error::CodeOutOfRange(code))?;
        let idx = self.dac_index(dac)?;
        self.dacs[idx].voct = (octave, halfstep);
        Ok(code)
    }

    /// Change the output span of a channel
    pub fn set_span(&mut self, dac: DacId, span: VoltSpan) -> Result<()> {
        let idx = self.dac_index(dac)?;
        self.dacs[idx].set_span(&mut self.bus, span)
    }

    /// Write a code to every channel on the same chip as `dac`
    pub fn write_all(&mut self, dac: DacId, code: u16) -> Result<()> {
        self.dac_index(dac)?;
        self.bus.write_all(dac.0, code)
    }

    /// Status line of one oscillator
    pub fn status(&self, vco: VcoId) -> Result<VcoStatus<'_, 'a>> {
        let osc = self.vco(vco)?;
        Ok(VcoStatus {
            vco: osc,
            dac: self.dac(osc.dac())?,
        })
    }
}

impl<B: DacBus> CodeSink for Board<'_, B> {
    fn vout(&mut self, dac: DacId, code: u16) -> Result<()> {
        Board::vout(self, dac, code, false)
    }
    fn vout_raw(&mut self, dac: DacId, code: u16) -> Result<()> {
        Board::vout_raw(self, dac, code)
    }
}

/// One line per oscillator: commanded code, measured and nominal pitch, and
/// the correction counters.
pub struct VcoStatus<'b, 'a> {
    vco: &'b Vco<'a>,
    dac: &'b DacChannel,
}

impl fmt::Display for VcoStatus<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let conv = self.vco.converter();
        let (octave, halfstep) = self.dac.voct();
        let code = conv.din_h(octave, halfstep);
        let nominal = conv.code_to_frequency16(code).to_num::<f32>();
        let measured = self.vco.freq().frequency16().to_num::<f32>();
        let pos = conv.code_to_octave_step(code);
        write!(
            f,
            "   VCO {} {:04x} {:5} {:6.2} {:8.2} {:9.4} {:2} {:4} {}",
            self.vco.id().0,
            code,
            code,
            measured - nominal,
            nominal,
            conv.volts(code),
            pos.octave,
            pos.xstep,
            self.dac.correction()
        )
    }
}

impl<B: DacBus> fmt::Display for Board<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for dac in &self.dacs {
            writeln!(f, "{}", dac)?;
        }
        for vco in &self.vcos {
            writeln!(f, "{}", vco)?;
            if let Ok(status) = self.status(vco.id()) {
                writeln!(f, "{}", status)?;
            }
        }
        Ok(())
    }
}
