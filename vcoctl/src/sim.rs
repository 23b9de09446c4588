//! A simulated board: DAC bus, analog oscillators and a virtual clock.
//!
//! [SimClock] implements [DelayNs], so any blocking call in the core (a
//! settle delay, a semaphore wait) advances virtual time instead of
//! sleeping.  As time passes the clock computes each simulated oscillator's
//! period from the code currently on its DAC channel and fires capture
//! interrupts on the oscillator's [FreqTimer], exactly as the hardware timer
//! would.

use crate::capture::FreqTimer;
use crate::config::{VoltSpan, REFERENCE_CLOCK_HZ};
use crate::dac::DacBus;
use crate::{Error, Result, MAX_DACS, MAX_VCOS};
use arrayvec::ArrayVec;
use core::fmt;
use core::sync::atomic::{AtomicU16, Ordering};
use embedded_hal::delay::DelayNs;
use num_traits::Float;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// The analog outputs of the simulated DACs.  Shared between the bus (which
/// writes them) and the clock (which reads them).
pub struct SimCodes {
    codes: [AtomicU16; MAX_DACS],
}

impl SimCodes {
    /// Every output at code 0
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU16 = AtomicU16::new(0);
        Self {
            codes: [ZERO; MAX_DACS],
        }
    }
    /// The code on output `dac`
    pub fn get(&self, dac: u8) -> u16 {
        self.codes
            .get(dac as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
    /// Set output `dac`
    pub fn set(&self, dac: u8, code: u16) {
        if let Some(c) = self.codes.get(dac as usize) {
            c.store(code, Ordering::Relaxed);
        }
    }
}

impl Default for SimCodes {
    fn default() -> Self {
        Self::new()
    }
}

/// A [DacBus] that records into [SimCodes].
pub struct SimBus<'a> {
    codes: &'a SimCodes,
    spans: [Option<VoltSpan>; MAX_DACS],
    writes: u32,
    failing: bool,
}

impl<'a> SimBus<'a> {
    /// A bus writing to `codes`
    pub fn new(codes: &'a SimCodes) -> Self {
        Self {
            codes,
            spans: [None; MAX_DACS],
            writes: 0,
            failing: false,
        }
    }
    /// The span last selected for `dac`
    pub fn span(&self, dac: u8) -> Option<VoltSpan> {
        self.spans.get(dac as usize).copied().flatten()
    }
    /// Number of successful transfers
    pub fn writes(&self) -> u32 {
        self.writes
    }
    /// Make every transfer fail (or succeed again)
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    fn check(&mut self, dac: u8) -> Result<()> {
        if dac as usize >= MAX_DACS {
            return Err(Error::UnknownDac(dac));
        }
        if self.failing {
            return Err(Error::Bus);
        }
        self.writes += 1;
        Ok(())
    }
}

impl DacBus for SimBus<'_> {
    fn write_code(&mut self, dac: u8, code: u16) -> Result<()> {
        self.check(dac)?;
        self.codes.set(dac, code);
        Ok(())
    }
    fn write_span(&mut self, dac: u8, span: VoltSpan) -> Result<()> {
        self.check(dac)?;
        self.spans[dac as usize] = Some(span);
        Ok(())
    }
    fn write_all(&mut self, dac: u8, code: u16) -> Result<()> {
        self.check(dac)?;
        let chip = dac & !0x0f;
        for ch in chip..chip + 16 {
            self.codes.set(ch, code);
        }
        Ok(())
    }
}

/// Transfer function of a simulated oscillator.
///
/// The oscillator behaves as if it had been sent `code - error(code)`, where
/// `error(code) = offset + offset_per_octave * octaves(code)`.  A perfect
/// tuner therefore calibrates it with offsets equal to the error.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimOscillator {
    /// Frequency at code 0, in Hz
    pub low_frequency: f64,
    /// Codes per octave
    pub dins_per_octave: f64,
    /// Pitch error in codes
    pub offset: f64,
    /// Additional pitch error in codes per octave above code 0
    pub offset_per_octave: f64,
}

impl Default for SimOscillator {
    fn default() -> Self {
        Self {
            low_frequency: 13.75,
            dins_per_octave: 6528.0,
            offset: 0.0,
            offset_per_octave: 0.0,
        }
    }
}

impl SimOscillator {
    /// A perfect oscillator with the given pitch error
    pub fn with_error(offset: f64, offset_per_octave: f64) -> Self {
        Self {
            offset,
            offset_per_octave,
            ..Default::default()
        }
    }
    /// Pitch error at `code`, in codes
    pub fn error(&self, code: u16) -> f64 {
        self.offset + self.offset_per_octave * code as f64 / self.dins_per_octave
    }
    /// Output frequency for `code`, in Hz
    pub fn frequency(&self, code: u16) -> f64 {
        let effective = code as f64 - self.error(code);
        self.low_frequency * Float::powf(2.0, effective / self.dins_per_octave)
    }
    /// Output period for `code`, in counter ticks
    pub fn period(&self, code: u16) -> f64 {
        REFERENCE_CLOCK_HZ as f64 / self.frequency(code)
    }
}

struct Voice<'a> {
    timer: &'a FreqTimer<'a>,
    slot: usize,
    dac: u8,
    osc: SimOscillator,
    next_edge: f64,
}

/// Virtual time for a simulated board.
pub struct SimClock<'a> {
    codes: &'a SimCodes,
    now: u64,
    voices: ArrayVec<Voice<'a>, MAX_VCOS>,
    timers: ArrayVec<&'a FreqTimer<'a>, MAX_VCOS>,
    rng: Option<SmallRng>,
    jitter: u32,
    edges: u64,
}

impl<'a> SimClock<'a> {
    /// A clock at counter value 0 with no oscillators
    pub fn new(codes: &'a SimCodes) -> Self {
        Self::starting_at(codes, 0)
    }

    /// A clock starting at counter value `now`
    pub fn starting_at(codes: &'a SimCodes, now: u64) -> Self {
        Self {
            codes,
            now,
            voices: ArrayVec::new(),
            timers: ArrayVec::new(),
            rng: None,
            jitter: 0,
            edges: 0,
        }
    }

    /// Randomly displace every captured edge by up to `ticks` counter ticks
    /// either way
    pub fn with_jitter(mut self, ticks: u32, seed: u64) -> Self {
        self.jitter = ticks;
        self.rng = Some(SmallRng::seed_from_u64(seed));
        self
    }

    /// Connect an oscillator driven by `dac` to capture `slot` of `timer`
    pub fn add_oscillator(
        &mut self,
        timer: &'a FreqTimer<'a>,
        slot: usize,
        dac: u8,
        osc: SimOscillator,
    ) -> Result<()> {
        let next_edge = self.now as f64 + osc.period(self.codes.get(dac));
        self.voices
            .try_push(Voice {
                timer,
                slot: slot.min(3),
                dac,
                osc,
                next_edge,
            })
            .map_err(|_| Error::CapacityExceeded)?;
        if !self.timers.iter().any(|t| core::ptr::eq(*t, timer)) {
            self.timers
                .try_push(timer)
                .map_err(|_| Error::CapacityExceeded)?;
        }
        Ok(())
    }

    /// Current counter value (not wrapped)
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Number of edges delivered
    pub fn edges(&self) -> u64 {
        self.edges
    }

    /// Advance by `ticks` counter ticks, delivering every edge and counter
    /// wrap on the way in time order.
    pub fn advance(&mut self, ticks: u64) {
        let end = self.now + ticks;
        loop {
            let next = self
                .voices
                .iter()
                .enumerate()
                .filter(|(_, v)| v.next_edge < end as f64)
                .min_by(|a, b| a.1.next_edge.total_cmp(&b.1.next_edge))
                .map(|(i, _)| i);
            let Some(i) = next else { break };
            let edge = self.voices[i].next_edge;
            self.wrap_to(edge as u64);
            let noise = match (&mut self.rng, self.jitter) {
                (Some(rng), j) if j > 0 => rng.gen_range(-(j as i64)..=j as i64),
                _ => 0,
            };
            let stamp = (Float::round(edge) as i64 + noise).max(0) as u64;
            let voice = &mut self.voices[i];
            let mut captures = [None; 4];
            captures[voice.slot] = Some(stamp as u32);
            voice.timer.on_interrupt(false, captures);
            voice.next_edge += voice.osc.period(self.codes.get(voice.dac));
            self.edges += 1;
        }
        self.wrap_to(end);
    }

    /// Move time to `to`, delivering the overflow interrupts in between
    fn wrap_to(&mut self, to: u64) {
        let wraps = (to >> 32).saturating_sub(self.now >> 32);
        for _ in 0..wraps {
            for timer in &self.timers {
                timer.on_interrupt(true, [None; 4]);
            }
        }
        self.now = self.now.max(to);
    }
}

impl DelayNs for SimClock<'_> {
    fn delay_ns(&mut self, ns: u32) {
        let ticks = ns as u64 * REFERENCE_CLOCK_HZ as u64 / 1_000_000_000;
        self.advance(ticks.max(1));
    }
}

impl fmt::Display for SimClock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sim clock {:.3}s, {} oscillators, {} edges",
            self.now as f64 / REFERENCE_CLOCK_HZ as f64,
            self.voices.len(),
            self.edges
        )
    }
}
