//! Closed-loop correction of an oscillator's output code.
//!
//! Once an oscillator is tuned, every commanded pitch also records the timer
//! width it should produce.  Each correction step compares the measured width
//! with that target and nudges the code by a small fixed amount toward it,
//! until the difference falls inside a hysteresis band.  After that the
//! channel is left alone (its capture channel stops signalling the worker)
//! until a new pitch is commanded or the worker's periodic timeout re-arms it.
//!
//! Every write to the output, commanded or corrective, invalidates the widths
//! measured before it.  Correction waits for [FRESH_SAMPLES] new widths, so it
//! never steps twice on the same measurement.

use crate::board::{Board, VcoId};
use crate::dac::{is_code_in_range, DacBus};
use crate::Result;
use core::fmt;
use embedded_hal::delay::DelayNs;

/// Widths a channel must measure after a write before correction trusts
/// them.  The first one spans the write.
pub const FRESH_SAMPLES: u32 = 2;

/// Result of one correction attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Correction {
    /// Nothing to do: not tuned, correction disabled, or no measurement
    /// taken since the last write
    Idle,
    /// The measured width is within the hysteresis band of the target
    Converged,
    /// The code was moved to the contained value
    Step(u16),
    /// The next step would leave the DAC's range
    Blocked,
}

/// Per-channel correction bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CorrectionState {
    target_width: u32,
    threshold: u32,
    code: i32,
    adjust: bool,
    converged: bool,
    dadj: u32,
    pos_adj: u32,
    neg_adj: u32,
    pos: u32,
    neg: u32,
    new_offset: i16,
    new_code: i32,
    last_divergence: u32,
    written_at: u32,
}

impl CorrectionState {
    /// An idle state with no target
    pub const fn new() -> Self {
        Self {
            target_width: 0,
            threshold: 0,
            code: 0,
            adjust: false,
            converged: false,
            dadj: 0,
            pos_adj: 0,
            neg_adj: 0,
            pos: 0,
            neg: 0,
            new_offset: 0,
            new_code: 0,
            last_divergence: 0,
            written_at: 0,
        }
    }

    /// Clear the step counters and the converged flag
    pub fn reset(&mut self) {
        self.pos_adj = 0;
        self.neg_adj = 0;
        self.pos = 0;
        self.neg = 0;
        self.dadj = 0;
        self.converged = false;
    }

    /// Re-arm a converged channel without touching its target
    pub fn rearm(&mut self) {
        self.converged = false;
    }

    /// A new pitch was commanded: remember what it should measure as.
    pub fn retarget(&mut self, target_width: u32, shift: u8, code: u16, adjust: bool) {
        self.target_width = target_width;
        self.threshold = target_width >> shift;
        self.code = code as i32;
        self.adjust = adjust;
        self.reset();
    }

    /// The code was set without a target (untuned oscillator or raw write)
    pub fn set_code(&mut self, code: u16, adjust: bool) {
        self.code = code as i32;
        self.adjust = adjust;
    }

    /// Record that the output changed when the capture channel had counted
    /// `samples` widths
    pub fn mark_written(&mut self, samples: u32) {
        self.written_at = samples;
    }

    /// True if a channel that has counted `samples` widths has measured the
    /// current output
    pub fn is_fresh(&self, samples: u32) -> bool {
        samples.wrapping_sub(self.written_at) >= FRESH_SAMPLES
    }

    /// Record the calibrated code that was attempted for the last command
    pub fn note_attempt(&mut self, offset: i16, code: i32) {
        self.new_offset = offset;
        self.new_code = code;
    }

    /// One correction step against `measured`.
    ///
    /// Inside the band (`divergence < threshold`) the state becomes converged
    /// and stays so, whatever is measured, until [retarget](Self::retarget)
    /// or [rearm](Self::rearm).  Outside it the code moves by
    /// `max(threshold >> 5, 1)`: up if the measured period is too long (pitch
    /// too low), down otherwise.
    pub fn step(&mut self, measured: u32) -> Correction {
        if !self.adjust || self.target_width == 0 || measured == 0 {
            return Correction::Idle;
        }
        if self.converged {
            return Correction::Converged;
        }
        let divergence = measured.abs_diff(self.target_width);
        self.last_divergence = divergence;
        if divergence < self.threshold {
            self.converged = true;
            return Correction::Converged;
        }
        let dadj = (self.threshold >> 5).max(1);
        let up = measured > self.target_width;
        let next = if up {
            self.code + dadj as i32
        } else {
            self.code - dadj as i32
        };
        if !is_code_in_range(next) {
            return Correction::Blocked;
        }
        self.dadj = dadj;
        if up {
            self.pos_adj += 1;
            self.pos += dadj;
        } else {
            self.neg_adj += 1;
            self.neg += dadj;
        }
        self.code = next;
        Correction::Step(next as u16)
    }

    /// Width the current pitch should measure as
    pub fn target_width(&self) -> u32 {
        self.target_width
    }
    /// Half-width of the hysteresis band
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
    /// The code the corrector is currently holding
    pub fn code(&self) -> i32 {
        self.code
    }
    /// True if correction is enabled for the current pitch
    pub fn adjust(&self) -> bool {
        self.adjust
    }
    /// True once the measured width is inside the band
    pub fn converged(&self) -> bool {
        self.converged
    }
    /// Size of the last step
    pub fn dadj(&self) -> u32 {
        self.dadj
    }
    /// Number of steps up and down since the last target
    pub fn step_counts(&self) -> (u32, u32) {
        (self.pos_adj, self.neg_adj)
    }
    /// Total codes moved up and down since the last target
    pub fn step_totals(&self) -> (u32, u32) {
        (self.pos, self.neg)
    }
    /// Divergence seen by the last step
    pub fn last_divergence(&self) -> u32 {
        self.last_divergence
    }
    /// Calibration offset and code of the last command
    pub fn last_attempt(&self) -> (i16, i32) {
        (self.new_offset, self.new_code)
    }
}

impl fmt::Display for CorrectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:5} {:6} {:8} {:8} {:8} {:8} {:4}) twidth {} code {} {}",
            self.new_offset,
            self.new_code,
            self.pos_adj,
            self.neg_adj,
            self.pos,
            self.neg,
            self.dadj,
            self.target_width,
            self.code,
            if self.converged { "converged" } else { "" }
        )
    }
}

impl<'a, B: DacBus> Board<'a, B> {
    /// Run one correction step for `vco` against `width`, which the caller
    /// has measured since the last write.
    pub fn correct_with(&mut self, vco: VcoId, width: u32) -> Result<Correction> {
        let (osc, ch, bus) = self.parts(vco)?;
        if !osc.tuned() {
            return Ok(Correction::Idle);
        }
        let result = ch.correction.step(width);
        match result {
            Correction::Converged => osc.freq().set_hold_off(true),
            Correction::Step(code) => {
                ch.send(bus, code)?;
                // anything measured so far predates the new code
                ch.correction.mark_written(osc.freq().samples());
                osc.freq().correction_ready().drain();
            }
            Correction::Idle | Correction::Blocked => {}
        }
        Ok(result)
    }

    /// Run one correction step for `vco` against its last measured width.
    /// Idle until the channel has measured the current output, see
    /// [FRESH_SAMPLES].
    pub fn correct(&mut self, vco: VcoId) -> Result<Correction> {
        let osc = self.vco(vco)?;
        let samples = osc.freq().samples();
        let width = osc.freq().width();
        if !self.dac(osc.dac())?.correction().is_fresh(samples) {
            return Ok(Correction::Idle);
        }
        self.correct_with(vco, width)
    }

    /// One iteration of a correction worker: wait for the channel to signal a
    /// fresh width, then correct.  If nothing arrives within the configured
    /// timeout the channel is only re-armed, so a converged channel is
    /// re-checked on its next width and a silent one is left where it is.
    pub fn correction_step(&mut self, vco: VcoId, delay: &mut impl DelayNs) -> Result<Correction> {
        let freq = self.vco(vco)?.freq();
        let timeout = self.correction_config().worker_timeout_ms;
        if !freq.correction_ready().acquire_timeout(timeout, delay) {
            self.rearm(vco)?;
            return Ok(Correction::Idle);
        }
        self.correct(vco)
    }

    /// Let a converged channel be corrected again
    pub fn rearm(&mut self, vco: VcoId) -> Result<()> {
        let (osc, ch, _) = self.parts(vco)?;
        ch.correction.rearm();
        osc.freq().set_hold_off(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::DacId;
    use crate::capture::FreqChannel;
    use crate::config::{CorrectionConfig, OscillatorConfig, VoltSpan};
    use crate::sim::{SimBus, SimClock, SimCodes};

    fn targeted(width: u32) -> CorrectionState {
        let mut state = CorrectionState::new();
        state.retarget(width, 9, 30_000, true);
        state
    }

    #[test]
    fn steps_toward_target() {
        // threshold 480, dadj 15
        let mut state = targeted(245_760);
        assert_eq!(state.step(250_000), Correction::Step(30_015));
        assert_eq!(state.step(250_000), Correction::Step(30_030));
        assert_eq!(state.step(240_000), Correction::Step(30_015));
        assert_eq!(state.step_counts(), (2, 1));
        assert_eq!(state.step_totals(), (30, 15));
    }

    #[test]
    fn never_moves_more_than_one_step() {
        let mut state = targeted(100_000);
        let mut code = state.code();
        for measured in [1, 50_000, 99_000, 150_000, 4_000_000, 101_000] {
            state.step(measured);
            assert!((state.code() - code).abs() <= (100_000 >> 9 >> 5));
            code = state.code();
        }
    }

    #[test]
    fn hysteresis_boundary_is_exclusive() {
        let mut state = targeted(245_760);
        assert_eq!(state.threshold(), 480);
        assert_eq!(state.step(245_760 + 480), Correction::Step(30_015));
        assert_eq!(state.step(245_760 + 479), Correction::Converged);
    }

    #[test]
    fn converged_holds_until_retarget() {
        let mut state = targeted(245_760);
        assert_eq!(state.step(245_800), Correction::Converged);
        let code = state.code();
        assert_eq!(state.step(300_000), Correction::Converged);
        assert_eq!(state.code(), code);
        state.rearm();
        assert_eq!(state.step(300_000), Correction::Step(30_015));
        state.retarget(245_760, 9, 20_000, true);
        assert!(!state.converged());
        assert_eq!(state.step(200_000), Correction::Step(19_985));
    }

    #[test]
    fn idle_without_adjust_or_measurement() {
        let mut state = CorrectionState::new();
        assert_eq!(state.step(1000), Correction::Idle);
        state.retarget(245_760, 9, 30_000, false);
        assert_eq!(state.step(1000), Correction::Idle);
        state.retarget(245_760, 9, 30_000, true);
        assert_eq!(state.step(0), Correction::Idle);
    }

    #[test]
    fn freshness_survives_counter_wrap() {
        let mut state = targeted(245_760);
        state.mark_written(u32::MAX);
        assert!(!state.is_fresh(u32::MAX));
        assert!(!state.is_fresh(0));
        assert!(state.is_fresh(1));
    }

    #[test]
    fn small_widths_still_step() {
        // top of the range: threshold 29, threshold >> 5 == 0
        let mut state = targeted(15_340);
        assert_eq!(state.step(16_000), Correction::Step(30_001));
    }

    #[test]
    fn blocked_at_range_end() {
        let mut state = CorrectionState::new();
        state.retarget(245_760, 9, 5, true);
        assert_eq!(state.step(200_000), Correction::Blocked);
        assert_eq!(state.code(), 5);
    }

    fn tuned_board<'a>(
        codes: &'a SimCodes,
        freq: &'a FreqChannel,
        config: CorrectionConfig,
    ) -> (Board<'a, SimBus<'a>>, DacId, VcoId) {
        let mut board = Board::new(SimBus::new(codes), config);
        let dac = board.add_dac(0, VoltSpan::BIPOLAR_5).unwrap();
        let vco = board.add_vco(dac, freq, OscillatorConfig::default()).unwrap();
        board.vco_mut(vco).unwrap().set_tuned(true);
        (board, dac, vco)
    }

    #[test]
    fn widths_from_before_a_write_are_ignored() {
        let codes = SimCodes::new();
        let freq = FreqChannel::new(0);
        let (mut board, dac, vco) = tuned_board(&codes, &freq, CorrectionConfig::default());
        board.voct(dac, 5, 0, false).unwrap();
        let mut t = 1000;
        for _ in 0..4 {
            freq.on_edge(t);
            t += 245_454;
        }
        // an octave up, but the channel still reports the 440Hz period
        board.voct(dac, 6, 0, false).unwrap();
        assert_eq!(codes.get(0), 39168);
        assert_eq!(board.correct(vco), Ok(Correction::Idle));
        assert_eq!(codes.get(0), 39168);
        // this period started before the write
        t = t + 200_000 - 245_454;
        freq.on_edge(t);
        assert_eq!(board.correct(vco), Ok(Correction::Idle));
        freq.on_edge(t + 125_000);
        assert_eq!(board.correct(vco), Ok(Correction::Step(39175)));
        // and the step itself invalidates what came before it
        assert_eq!(board.correct(vco), Ok(Correction::Idle));
        assert_eq!(codes.get(0), 39175);
    }

    #[test]
    fn silent_channel_holds_its_code() {
        let codes = SimCodes::new();
        let freq = FreqChannel::new(0);
        let config = CorrectionConfig {
            worker_timeout_ms: 2,
            ..CorrectionConfig::default()
        };
        let (mut board, dac, vco) = tuned_board(&codes, &freq, config);
        // no oscillators: the clock only passes time
        let mut clock = SimClock::new(&codes);
        board.voct(dac, 5, 0, false).unwrap();
        for t in [1000, 251_000, 501_000] {
            freq.on_edge(t);
        }
        assert_eq!(board.correction_step(vco, &mut clock), Ok(Correction::Step(32654)));
        for _ in 0..10 {
            assert_eq!(board.correction_step(vco, &mut clock), Ok(Correction::Idle));
        }
        assert_eq!(codes.get(0), 32654);
        assert!(!freq.hold_off());
        // the signal comes back
        freq.on_edge(751_000);
        freq.on_edge(1_001_000);
        assert_eq!(board.correction_step(vco, &mut clock), Ok(Correction::Step(32668)));
    }

    #[test]
    fn raw_writes_invalidate_widths() {
        let codes = SimCodes::new();
        let freq = FreqChannel::new(0);
        let (mut board, dac, vco) = tuned_board(&codes, &freq, CorrectionConfig::default());
        board.voct(dac, 5, 0, false).unwrap();
        for t in [1000, 251_000, 501_000] {
            freq.on_edge(t);
        }
        board.vout_raw(dac, 30_000).unwrap();
        assert_eq!(board.correct(vco), Ok(Correction::Idle));
        assert!(board.dac(dac).unwrap().correction().is_fresh(freq.samples() + 2));
    }
}
