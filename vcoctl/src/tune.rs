//! Landmark auto-tuning.
//!
//! Each landmark (one per tritone) is tuned by writing its nominal code plus
//! the offset found so far, letting the oscillator settle, measuring it, and
//! moving the offset by however far the measurement says the oscillator is
//! from the target.  The offsets are then interpolated by
//! [PitchConverter::offset_for_code](crate::pitch::PitchConverter::offset_for_code)
//! for every code in between.

use crate::board::{Board, VcoId};
use crate::config::TuneConfig;
use crate::dac::{is_code_in_range, DacBus};
use crate::util::NoteName;
use crate::{Result, MAX_LANDMARKS};
use arrayvec::ArrayVec;
use core::fmt;
use embedded_hal::delay::DelayNs;

/// A sample implying an error larger than this (in codes) is an outlier
pub const OUTLIER_CODES: u32 = 3000;
/// Offsets recorded per landmark before giving up on convergence
pub const MAX_SAMPLES: usize = 7;
/// Consecutive outliers that abort a landmark
pub const MAX_OUTLIERS: u8 = 7;
/// Recorded offsets that must agree with the newest one
const MATCHES: usize = 2;

/// Why a landmark was abandoned early
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// The offset walked the code off the end of the DAC's range
    OutOfRange,
    /// No width was measured within the sample timeout
    NoSignal,
    /// Too many consecutive outliers
    Outliers,
}

/// How tuning a landmark ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LandmarkOutcome {
    /// Three recorded offsets agreed
    Converged,
    /// Every sample was used without three agreeing; the mean was stored
    Unsettled,
    /// Abandoned; the partial result was stored
    Aborted(AbortReason),
}

/// Result of tuning one landmark
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LandmarkReport {
    /// The landmark
    pub tritone: u8,
    /// Its nominal code
    pub target_code: u32,
    /// The offset stored in the calibration table
    pub offset: i16,
    /// Number of recorded offsets
    pub samples: u8,
    /// How it ended
    pub outcome: LandmarkOutcome,
}

impl fmt::Display for LandmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "landmark {:2} ({}) code {:5} offset {:5} samples {} {:?}",
            self.tritone,
            NoteName(self.tritone / 2, (self.tritone % 2) * 6),
            self.target_code,
            self.offset,
            self.samples,
            self.outcome
        )
    }
}

/// Result of tuning every landmark of an oscillator
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TuneReport {
    /// One report per tuned landmark
    pub landmarks: ArrayVec<LandmarkReport, MAX_LANDMARKS>,
}

impl TuneReport {
    /// True if every landmark converged
    pub fn converged(&self) -> bool {
        self.landmarks
            .iter()
            .all(|l| l.outcome == LandmarkOutcome::Converged)
    }
}

impl fmt::Display for TuneReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for l in &self.landmarks {
            writeln!(f, "{}", l)?;
        }
        Ok(())
    }
}

struct Samples {
    offsets: ArrayVec<i32, MAX_SAMPLES>,
}

impl Samples {
    /// Record an offset.  Returns true once the newest offset matches
    /// enough earlier ones.
    fn record(&mut self, offset: i32) -> bool {
        let matches = self.offsets.iter().filter(|&&o| o == offset).count();
        self.offsets.push(offset);
        matches >= MATCHES
    }
    fn full(&self) -> bool {
        self.offsets.is_full()
    }
    /// Rounded mean of the recorded offsets
    fn mean(&self) -> Option<i32> {
        if self.offsets.is_empty() {
            return None;
        }
        let n = self.offsets.len() as i32;
        let sum: i32 = self.offsets.iter().sum();
        Some((2 * sum + n * sum.signum()) / (2 * n))
    }
}

impl<'a, B: DacBus> Board<'a, B> {
    /// Tune one landmark of `vco`.
    ///
    /// The landmark's offset is zeroed first, and whatever the outcome the
    /// best estimate found is stored in the calibration table.  The DAC is
    /// written directly (no calibration, no correction target).  Only a bad
    /// handle or a bus failure is an error; measurement trouble is reported
    /// in the [LandmarkReport].
    pub fn tune_landmark(
        &mut self,
        vco: VcoId,
        tritone: u8,
        cfg: &TuneConfig,
        delay: &mut impl DelayNs,
    ) -> Result<LandmarkReport> {
        let (osc, ch, bus) = self.parts(vco)?;
        let freq = osc.freq();
        let conv = osc.converter_mut();
        let pos = conv.tritone(tritone);
        let target = conv.din_x(pos);
        let target_width = conv.width(pos).width;
        conv.table_mut().set(tritone as usize, 0);

        let mut samples = Samples {
            offsets: ArrayVec::new(),
        };
        let mut offset = 0i32;
        let mut warm = false;
        let mut outliers = 0u8;
        let outcome = loop {
            let code = target as i32 + offset;
            if !is_code_in_range(code) {
                break LandmarkOutcome::Aborted(AbortReason::OutOfRange);
            }
            ch.send(bus, code as u16)?;
            delay.delay_us(cfg.settle_us);
            let width = freq.sampled_width(cfg.sample_timeout_ms, delay);
            if width == 0 {
                break LandmarkOutcome::Aborted(AbortReason::NoSignal);
            }
            let implied = conv.implied_code(target, target_width, width);
            let divergence = target as i32 - implied;
            if divergence.unsigned_abs() > OUTLIER_CODES {
                outliers += 1;
                log::trace!(
                    "landmark {} outlier: width {} implies {}",
                    tritone,
                    width,
                    implied
                );
                if outliers > MAX_OUTLIERS {
                    break LandmarkOutcome::Aborted(AbortReason::Outliers);
                }
                continue;
            }
            outliers = 0;
            offset += divergence;
            if !warm {
                warm = true;
                continue;
            }
            if samples.record(offset) {
                break LandmarkOutcome::Converged;
            }
            if samples.full() {
                break LandmarkOutcome::Unsettled;
            }
        };

        let stored = samples
            .mean()
            .unwrap_or(offset)
            .clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        conv.table_mut().set(tritone as usize, stored);
        let report = LandmarkReport {
            tritone,
            target_code: target,
            offset: stored,
            samples: samples.offsets.len() as u8,
            outcome,
        };
        match outcome {
            LandmarkOutcome::Converged => log::debug!("VCO {} {}", vco.0, report),
            _ => log::warn!("VCO {} {}", vco.0, report),
        }
        Ok(report)
    }

    /// Tune every interior landmark of `vco` in `cfg`'s range, backfill the
    /// rest, mark the oscillator tuned and restore its last commanded code
    /// (now calibrated and corrected).
    pub fn tune_all(
        &mut self,
        vco: VcoId,
        cfg: &TuneConfig,
        delay: &mut impl DelayNs,
    ) -> Result<TuneReport> {
        let (osc, ch, _) = self.parts(vco)?;
        ch.correction.reset();
        let restore = ch.vout();
        let dac = ch.id();
        osc.clear();
        let landmarks = osc.converter().table().len();
        let first = cfg.first_landmark as usize;
        let last = (cfg.last_landmark as usize).min(landmarks.saturating_sub(2));
        log::info!("tuning VCO {} landmarks {}..={}", vco.0, first, last);

        let mut report = TuneReport::default();
        for t in first..=last {
            let landmark = self.tune_landmark(vco, t as u8, cfg, delay)?;
            report.landmarks.push(landmark);
        }

        let osc = self.vco_mut(vco)?;
        osc.converter_mut().table_mut().backfill(first, last);
        osc.set_tuned(true);
        log::info!("VCO {} {}", vco.0, osc.converter().table());
        self.vout(dac, restore, true)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FreqChannel, FreqTimer};
    use crate::config::{CorrectionConfig, OscillatorConfig, VoltSpan};
    use crate::correct::Correction;
    use crate::sim::{SimBus, SimClock, SimCodes, SimOscillator};
    use crate::DacId;

    /// A delay that makes the channel measure exactly `width` every time
    /// it is waited on.
    struct Exact<'c> {
        ch: &'c FreqChannel,
        width: u32,
        stamp: u32,
    }

    impl DelayNs for Exact<'_> {
        fn delay_ns(&mut self, _ns: u32) {
            self.ch.on_edge(self.stamp);
            self.stamp = self.stamp.wrapping_add(self.width);
        }
    }

    /// Short waits, for delays that don't model time
    fn fast() -> TuneConfig {
        TuneConfig {
            settle_us: 2_000,
            sample_timeout_ms: 100,
            ..Default::default()
        }
    }

    #[test]
    fn exact_width_converges_to_zero() {
        let codes = SimCodes::new();
        let ch = FreqChannel::new(0);
        let mut board = Board::new(SimBus::new(&codes), CorrectionConfig::default());
        let dac = board.add_dac(0, VoltSpan::BIPOLAR_5).unwrap();
        let vco = board.add_vco(dac, &ch, OscillatorConfig::default()).unwrap();
        board.vco_mut(vco).unwrap().converter_mut().table_mut().set(10, 99);
        let conv = board.converter(dac).unwrap();
        let width = conv.width(conv.tritone(10)).width;
        let mut delay = Exact { ch: &ch, width, stamp: 1000 };
        let report = board.tune_landmark(vco, 10, &fast(), &mut delay).unwrap();
        assert_eq!(report.outcome, LandmarkOutcome::Converged);
        assert_eq!(report.offset, 0);
        assert_eq!(report.samples, 3);
        assert_eq!(report.target_code, 32640);
        assert_eq!(board.converter(dac).unwrap().table().get(10), 0);
        assert_eq!(codes.get(0), 32640);
    }

    struct Rig {
        codes: SimCodes,
        ch: FreqChannel,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                codes: SimCodes::new(),
                ch: FreqChannel::new(0),
            }
        }
    }

    /// Tune every landmark of a simulated oscillator
    fn tune(rig: &Rig, osc: SimOscillator, jitter: Option<(u32, u64)>) -> (TuneReport, [i16; 21]) {
        let timer = FreqTimer::new(0, [Some(&rig.ch), None, None, None]);
        timer.start([true, false, false, false]);
        let mut clock = SimClock::new(&rig.codes);
        if let Some((ticks, seed)) = jitter {
            clock = clock.with_jitter(ticks, seed);
        }
        clock.add_oscillator(&timer, 0, 0, osc).unwrap();
        let mut board = Board::new(SimBus::new(&rig.codes), CorrectionConfig::default());
        let dac = board.add_dac(0, VoltSpan::BIPOLAR_5).unwrap();
        let vco = board.add_vco(dac, &rig.ch, OscillatorConfig::default()).unwrap();
        board.voct(dac, 5, 0, false).unwrap();
        let report = board.tune_all(vco, &TuneConfig::default(), &mut clock).unwrap();
        let mut offsets = [0; 21];
        offsets.copy_from_slice(board.converter(dac).unwrap().table().offsets());
        (report, offsets)
    }

    #[test]
    fn tuning_finds_the_pitch_error() {
        let (report, perfect) = tune(&Rig::new(), SimOscillator::default(), None);
        assert_eq!(report.landmarks.len(), 15);
        assert_eq!(report.landmarks[0].tritone, 4);
        assert!(report.converged(), "{}", report);
        // the nominal table is quantised to Hz/16, so a perfect oscillator
        // needs small offsets of its own
        assert!(perfect.iter().all(|o| o.abs() < 16), "{:?}", perfect);

        let osc = SimOscillator::with_error(-120.0, 15.0);
        let (report, offsets) = tune(&Rig::new(), osc, None);
        assert!(report.converged(), "{}", report);
        for t in 4..=18 {
            let expected = osc.error((t * 3264) as u16) + perfect[t] as f64;
            assert!(
                (offsets[t] as f64 - expected).abs() <= 3.0,
                "landmark {} offset {} expected {}",
                t,
                offsets[t],
                expected
            );
        }
        // backfilled from the nearest tuned landmark
        assert!(offsets[..4].iter().all(|&o| o == offsets[4]));
        assert!(offsets[19..].iter().all(|&o| o == offsets[18]));
    }

    #[test]
    fn tuning_survives_noise() {
        let osc = SimOscillator::with_error(80.0, 0.0);
        let (_, perfect) = tune(&Rig::new(), SimOscillator::default(), None);
        for seed in [1, 7, 42] {
            let (report, offsets) = tune(&Rig::new(), osc, Some((4, seed)));
            assert_eq!(report.landmarks.len(), 15);
            for l in &report.landmarks {
                assert!(l.samples as usize <= MAX_SAMPLES);
                assert!(!matches!(l.outcome, LandmarkOutcome::Aborted(_)), "{}", l);
            }
            for t in 4..=18 {
                let expected = 80.0 + perfect[t] as f64;
                assert!(
                    (offsets[t] as f64 - expected).abs() <= 12.0,
                    "seed {} landmark {} offset {}",
                    seed,
                    t,
                    offsets[t]
                );
            }
        }
    }

    #[test]
    fn tune_all_restores_corrected_output() {
        let rig = Rig::new();
        let timer = FreqTimer::new(0, [Some(&rig.ch), None, None, None]);
        timer.start([true, false, false, false]);
        let mut clock = SimClock::new(&rig.codes);
        let osc = SimOscillator::with_error(50.0, 0.0);
        clock.add_oscillator(&timer, 0, 0, osc).unwrap();
        let mut board = Board::new(SimBus::new(&rig.codes), CorrectionConfig::default());
        let dac = board.add_dac(0, VoltSpan::BIPOLAR_5).unwrap();
        let vco = board.add_vco(dac, &rig.ch, OscillatorConfig::default()).unwrap();
        board.voct(dac, 5, 0, false).unwrap();
        assert_eq!(rig.codes.get(0), 32640);
        board.tune_all(vco, &TuneConfig::default(), &mut clock).unwrap();
        assert!(board.vco(vco).unwrap().tuned());
        let out = rig.codes.get(0) as i32;
        assert!((out - 32690).abs() <= 16, "restored {}", out);
        let state = board.dac(DacId(0)).unwrap().correction();
        assert!(state.adjust());
        assert_eq!(state.target_width(), 245_454);
        // a calibrated oscillator lands inside the correction band
        clock.delay_ms(20);
        let mut result = board.correction_step(vco, &mut clock).unwrap();
        for _ in 0..20 {
            if result == Correction::Converged {
                break;
            }
            result = board.correction_step(vco, &mut clock).unwrap();
        }
        assert_eq!(result, Correction::Converged);
    }

    #[test]
    fn missing_signal_aborts() {
        let codes = SimCodes::new();
        let ch = FreqChannel::new(0);
        let mut clock = SimClock::new(&codes);
        let mut board = Board::new(SimBus::new(&codes), CorrectionConfig::default());
        let dac = board.add_dac(0, VoltSpan::BIPOLAR_5).unwrap();
        let vco = board.add_vco(dac, &ch, OscillatorConfig::default()).unwrap();
        let report = board.tune_landmark(vco, 8, &fast(), &mut clock).unwrap();
        assert_eq!(report.outcome, LandmarkOutcome::Aborted(AbortReason::NoSignal));
        assert_eq!(report.offset, 0);
    }

    #[test]
    fn wild_oscillator_aborts_on_outliers() {
        let rig = Rig::new();
        let timer = FreqTimer::new(0, [Some(&rig.ch), None, None, None]);
        timer.start([true, false, false, false]);
        let mut clock = SimClock::new(&rig.codes);
        clock
            .add_oscillator(&timer, 0, 0, SimOscillator::with_error(5000.0, 0.0))
            .unwrap();
        let mut board = Board::new(SimBus::new(&rig.codes), CorrectionConfig::default());
        let dac = board.add_dac(0, VoltSpan::BIPOLAR_5).unwrap();
        let vco = board.add_vco(dac, &rig.ch, OscillatorConfig::default()).unwrap();
        let report = board
            .tune_landmark(vco, 8, &TuneConfig::default(), &mut clock)
            .unwrap();
        assert_eq!(report.outcome, LandmarkOutcome::Aborted(AbortReason::Outliers));
        assert_eq!(report.samples, 0);
    }

    #[test]
    fn offset_past_the_top_aborts() {
        let rig = Rig::new();
        let timer = FreqTimer::new(0, [Some(&rig.ch), None, None, None]);
        timer.start([true, false, false, false]);
        let mut clock = SimClock::new(&rig.codes);
        clock
            .add_oscillator(&timer, 0, 0, SimOscillator::with_error(2000.0, 0.0))
            .unwrap();
        let mut board = Board::new(SimBus::new(&rig.codes), CorrectionConfig::default());
        let dac = board.add_dac(0, VoltSpan::BIPOLAR_5).unwrap();
        let vco = board.add_vco(dac, &rig.ch, OscillatorConfig::default()).unwrap();
        let report = board
            .tune_landmark(vco, 20, &TuneConfig::default(), &mut clock)
            .unwrap();
        assert_eq!(report.target_code, 65280);
        assert_eq!(report.outcome, LandmarkOutcome::Aborted(AbortReason::OutOfRange));
        assert!(report.offset > 1900);
    }

    #[test]
    fn mean_rounds_half_away_from_zero() {
        let mut s = Samples { offsets: ArrayVec::new() };
        assert_eq!(s.mean(), None);
        s.record(3);
        s.record(4);
        assert_eq!(s.mean(), Some(4));
        let mut s = Samples { offsets: ArrayVec::new() };
        s.record(-3);
        s.record(-4);
        s.record(-4);
        assert_eq!(s.mean(), Some(-4));
        assert!(!s.record(-5));
        assert!(s.record(-4));
    }
}
