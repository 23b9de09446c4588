//! The periodic tick that advances envelopes.
//!
//! [Dispatcher::on_tick] is called from the tick timer's interrupt.  It runs
//! every registered envelope that isn't stopped, then applies any raw DAC
//! writes queued since the last tick.  Envelopes are only ever appended or
//! cleared all at once; stopping one is a flag on its [EnvelopeControl]
//! (see [crate::envelope]), not a removal.

use crate::board::DacId;
use crate::config::TickConfig;
use crate::envelope::{CodeSink, Envelope};
use crate::{Error, Result, MAX_ENVELOPES};
use arrayvec::ArrayVec;
use core::fmt;

/// Raw writes that can wait for the next tick
pub const MAX_QUEUED: usize = 16;

/// An envelope handle, issued by [Dispatcher::add]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvelopeId(pub u8);

/// The envelopes advanced by the tick, and the tick's own state.
pub struct Dispatcher<'a> {
    envelopes: ArrayVec<Envelope<'a>, MAX_ENVELOPES>,
    queued: ArrayVec<(DacId, u16), MAX_QUEUED>,
    config: TickConfig,
    running: bool,
    ticks: u32,
    write_errors: u32,
}

impl<'a> Dispatcher<'a> {
    /// A stopped dispatcher with no envelopes
    pub fn new(config: TickConfig) -> Self {
        Self {
            envelopes: ArrayVec::new(),
            queued: ArrayVec::new(),
            config,
            running: false,
            ticks: 0,
            write_errors: 0,
        }
    }

    /// Register an envelope
    pub fn add(&mut self, envelope: Envelope<'a>) -> Result<EnvelopeId> {
        let id = EnvelopeId(self.envelopes.len() as u8);
        self.envelopes
            .try_push(envelope)
            .map_err(|_| Error::CapacityExceeded)?;
        Ok(id)
    }

    /// Forget every envelope
    pub fn clear(&mut self) {
        self.envelopes.clear();
    }

    /// Look up an envelope
    pub fn get(&self, id: EnvelopeId) -> Option<&Envelope<'a>> {
        self.envelopes.get(id.0 as usize)
    }

    /// Look up an envelope
    pub fn get_mut(&mut self, id: EnvelopeId) -> Option<&mut Envelope<'a>> {
        self.envelopes.get_mut(id.0 as usize)
    }

    /// Look up an envelope, failing on an unknown handle
    pub fn envelope_mut(&mut self, id: EnvelopeId) -> Result<&mut Envelope<'a>> {
        self.get_mut(id).ok_or(Error::UnknownEnvelope(id.0))
    }

    /// Every registered envelope
    pub fn envelopes(&self) -> impl Iterator<Item = &Envelope<'a>> {
        self.envelopes.iter()
    }

    /// Queue a raw write for the next tick
    pub fn schedule_write(&mut self, dac: DacId, code: u16) -> Result<()> {
        self.queued
            .try_push((dac, code))
            .map_err(|_| Error::CapacityExceeded)
    }

    /// Tick interrupt
    pub fn on_tick(&mut self, sink: &mut dyn CodeSink) {
        if !self.running {
            return;
        }
        self.ticks = self.ticks.wrapping_add(1);
        for env in self.envelopes.iter_mut() {
            if !env.control().stopped() {
                env.next(sink);
            }
        }
        for (dac, code) in self.queued.drain(..) {
            if sink.vout_raw(dac, code).is_err() {
                self.write_errors = self.write_errors.wrapping_add(1);
            }
        }
    }

    /// Let the tick run
    pub fn start(&mut self) {
        self.running = true;
    }
    /// Make the tick a no-op
    pub fn stop(&mut self) {
        self.running = false;
    }
    /// True while started
    pub fn running(&self) -> bool {
        self.running
    }
    /// Change the tick timer's auto-reload value.  Returns the new tick rate.
    pub fn set_reload(&mut self, reload: u16) -> u32 {
        self.config.reload = reload;
        self.config.tick_hz()
    }
    /// The tick timer settings
    pub fn tick_config(&self) -> &TickConfig {
        &self.config
    }
    /// Ticks run since creation
    pub fn ticks(&self) -> u32 {
        self.ticks
    }
    /// Queued writes the sink rejected
    pub fn write_errors(&self) -> u32 {
        self.write_errors
    }
}

impl fmt::Display for Dispatcher<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatcher {} ticks {} at {}Hz, envelopes {}, queued {}, errors {}",
            if self.running { "running" } else { "stopped" },
            self.ticks,
            self.config.tick_hz(),
            self.envelopes.len(),
            self.queued.len(),
            self.write_errors
        )?;
        for (i, env) in self.envelopes.iter().enumerate() {
            write!(f, "\nenvelope {} {}", i, env)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FreqChannel;
    use crate::config::{CorrectionConfig, OscillatorConfig, VoltSpan};
    use crate::envelope::{Callback, EnvelopeControl, EnvelopeKind, Segment};
    use crate::sim::{SimBus, SimCodes};
    use crate::Board;

    #[test]
    fn runs_only_while_started() {
        let codes = SimCodes::new();
        let mut board = Board::new(SimBus::new(&codes), CorrectionConfig::default());
        let dac = board.add_dac(7, VoltSpan::UNIPOLAR_10).unwrap();
        let control = EnvelopeControl::new();
        let mut env = Envelope::new(EnvelopeKind::Plain, Some(dac), false, &control);
        env.add(Segment::new(0, 1000, 10, 1, Callback::None), None).unwrap();
        let mut disp = Dispatcher::new(TickConfig::default());
        let id = disp.add(env).unwrap();
        assert_eq!(id, EnvelopeId(0));
        disp.on_tick(&mut board);
        assert_eq!(disp.ticks(), 0);
        assert_eq!(codes.get(7), 0);
        disp.start();
        for _ in 0..3 {
            disp.on_tick(&mut board);
        }
        assert_eq!(disp.ticks(), 3);
        assert_eq!(codes.get(7), 300);
        disp.stop();
        disp.on_tick(&mut board);
        assert_eq!(codes.get(7), 300);
    }

    #[test]
    fn stopped_envelopes_are_skipped() {
        let codes = SimCodes::new();
        let mut board = Board::new(SimBus::new(&codes), CorrectionConfig::default());
        let a = board.add_dac(0, VoltSpan::UNIPOLAR_10).unwrap();
        let b = board.add_dac(1, VoltSpan::UNIPOLAR_10).unwrap();
        let (ca, cb) = (EnvelopeControl::new(), EnvelopeControl::new());
        let mut disp = Dispatcher::new(TickConfig::default());
        for (dac, control) in [(a, &ca), (b, &cb)] {
            let mut env = Envelope::new(EnvelopeKind::Plain, Some(dac), true, control);
            env.add(Segment::new(100, 200, 4, 1, Callback::None), None).unwrap();
            disp.add(env).unwrap();
        }
        disp.start();
        disp.on_tick(&mut board);
        cb.stop();
        disp.on_tick(&mut board);
        assert_eq!(codes.get(0), 150);
        assert_eq!(codes.get(1), 125);
        disp.get_mut(EnvelopeId(1)).unwrap().start();
        disp.on_tick(&mut board);
        assert_eq!(codes.get(1), 125);
        assert!(disp.get(EnvelopeId(2)).is_none());
        assert_eq!(disp.envelope_mut(EnvelopeId(5)).err(), Some(Error::UnknownEnvelope(5)));
    }

    #[test]
    fn adsr_through_the_board() {
        let codes = SimCodes::new();
        let freq = FreqChannel::new(0);
        let mut board = Board::new(SimBus::new(&codes), CorrectionConfig::default());
        let dac = board.add_dac(2, VoltSpan::BIPOLAR_5).unwrap();
        let vco = board.add_vco(dac, &freq, OscillatorConfig::default()).unwrap();
        let control = EnvelopeControl::new();
        let mut env = Envelope::new(EnvelopeKind::Adsr, Some(dac), false, &control);
        let conv = board.converter(dac).unwrap();
        env.add_notes(conv, (4, 0), (5, 0), 4, 2, None, Callback::None).unwrap();
        env.add_notes(conv, (5, 0), (4, 7), 2, 1, None, Callback::None).unwrap();
        env.add_notes(conv, (4, 7), (4, 7), 1, 1, None, Callback::None).unwrap();
        env.add_notes(conv, (4, 7), (3, 0), 2, 1, None, Callback::None).unwrap();
        // a tuned oscillator has its envelope output calibrated
        let osc = board.vco_mut(vco).unwrap();
        osc.converter_mut().table_mut().set(8, 20);
        osc.converter_mut().table_mut().set(9, 20);
        osc.converter_mut().table_mut().set(10, 20);
        osc.set_tuned(true);

        let mut disp = Dispatcher::new(TickConfig::default());
        let id = disp.add(env).unwrap();
        disp.start();
        for _ in 0..50 {
            disp.on_tick(&mut board);
        }
        assert_eq!(control.segment(), 2);
        assert_eq!(codes.get(2), 4 * 6528 + 7 * 544 + 20);
        assert!(!board.dac(dac).unwrap().correction().adjust());
        control.release();
        for _ in 0..3 {
            disp.on_tick(&mut board);
        }
        assert_eq!(codes.get(2), 3 * 6528);
        assert!(disp.get(id).unwrap().finished());
    }

    #[test]
    fn queued_writes_apply_on_tick() {
        let codes = SimCodes::new();
        let mut board = Board::new(SimBus::new(&codes), CorrectionConfig::default());
        let dac = board.add_dac(9, VoltSpan::UNIPOLAR_5).unwrap();
        let mut disp = Dispatcher::new(TickConfig::default());
        disp.schedule_write(dac, 4242).unwrap();
        disp.schedule_write(DacId(40), 1).unwrap();
        assert_eq!(codes.get(9), 0);
        disp.start();
        disp.on_tick(&mut board);
        assert_eq!(codes.get(9), 4242);
        // channel 40 was never registered
        assert_eq!(disp.write_errors(), 1);
        for _ in 0..MAX_QUEUED {
            disp.schedule_write(dac, 0).unwrap();
        }
        assert_eq!(disp.schedule_write(dac, 0), Err(Error::CapacityExceeded));
    }

    #[test]
    fn reload_sets_rate() {
        let mut disp = Dispatcher::new(TickConfig::default());
        assert_eq!(disp.tick_config().tick_hz(), 1000);
        assert_eq!(disp.set_reload(499), 2000);
        assert!(disp.to_string().starts_with("dispatcher stopped ticks 0 at 2000Hz"));
    }
}
