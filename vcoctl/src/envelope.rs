//! Piecewise-linear envelopes.
//!
//! A [Segment] ramps a DAC code from `begin` to `end` over a number of
//! intervals, advancing one interval every `hold` ticks.  An [Envelope] runs
//! its segments in order, once or repeating.  An ADSR envelope stops after
//! its first two segments (attack and decay) and holds there until released.
//!
//! Envelopes are advanced from the periodic tick (see
//! [Dispatcher](crate::dispatch::Dispatcher)), so nothing on the `next` path
//! blocks, allocates or logs.  The flags another context may flip while the
//! tick runs (stop, attack) and the segment position it may wait on live in
//! an [EnvelopeControl] shared by reference.

use crate::board::DacId;
use crate::pitch::PitchConverter;
use crate::{Error, Result, MAX_SEGMENTS};
use arrayvec::ArrayVec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use embedded_hal::delay::DelayNs;

const FRAC_BITS: u32 = 16;
const RELEASE_POLL_US: u32 = 50;

/// Destination of envelope output.
pub trait CodeSink {
    /// Command a code on a DAC channel (calibrated if the channel's
    /// oscillator is tuned, without closed-loop correction)
    fn vout(&mut self, dac: DacId, code: u16) -> Result<()>;
    /// Write a code to a DAC channel as is
    fn vout_raw(&mut self, dac: DacId, code: u16) -> Result<()>;
}

/// A hook run by an envelope or segment.
#[derive(Clone, Copy, Debug, Default)]
pub enum Callback {
    /// Do nothing
    #[default]
    None,
    /// Call a function
    Call(fn()),
    /// Increment a counter
    Count(&'static AtomicU32),
}

impl Callback {
    /// Run the hook
    pub fn invoke(&self) {
        match self {
            Callback::None => {}
            Callback::Call(f) => f(),
            Callback::Count(c) => {
                c.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// One linear ramp.
#[derive(Clone, Debug)]
pub struct Segment {
    callback: Callback,
    begin: i32,
    end: i32,
    intervals: u32,
    hold: u16,
    change: u32,
    rising: bool,
    count: u32,
    hold_count: u16,
    point: u16,
    last_point: Option<u16>,
    write_errors: u32,
}

impl Segment {
    /// A ramp from `begin` to `end` over `intervals` intervals of `hold`
    /// ticks each.  Zero intervals or hold are treated as one.
    pub fn new(begin: u16, end: u16, intervals: u16, hold: u16, callback: Callback) -> Self {
        let mut seg = Self {
            callback,
            begin: 0,
            end: 0,
            intervals: 1,
            hold: 1,
            change: 0,
            rising: true,
            count: 0,
            hold_count: 0,
            point: 0,
            last_point: None,
            write_errors: 0,
        };
        seg.calc(begin, end, intervals, hold);
        seg
    }

    /// Recompute the ramp in place
    pub fn calc(&mut self, begin: u16, end: u16, intervals: u16, hold: u16) {
        self.begin = begin as i32;
        self.end = end as i32;
        self.hold = hold.max(1);
        self.intervals = intervals.max(1) as u32;
        self.change = (self.end.abs_diff(self.begin) << FRAC_BITS) / self.intervals;
        self.rising = self.end >= self.begin;
        self.point = begin;
        self.last_point = None;
        self.start();
    }

    /// Rewind to the first interval
    pub fn start(&mut self) {
        self.count = 0;
        self.hold_count = 0;
    }

    /// The value for the interval after `count` whole intervals have passed.
    /// The last interval lands exactly on `end`.
    fn point_at(&self, count: u32) -> u16 {
        let elapsed = count + 1;
        if elapsed >= self.intervals {
            return self.end as u16;
        }
        let span = self.end.abs_diff(self.begin) as u64;
        let delta = ((elapsed as u64 * self.change as u64) >> FRAC_BITS).min(span) as i32;
        if self.rising {
            (self.begin + delta).min(self.end) as u16
        } else {
            (self.begin - delta).max(self.end) as u16
        }
    }

    /// Advance one tick, writing the value to `dac` through `sink` if it
    /// changed (and running the hook after each write).  Returns true when
    /// the segment has completed and rewound itself.
    pub fn next(&mut self, sink: &mut dyn CodeSink, dac: Option<DacId>) -> bool {
        self.point = self.point_at(self.count);
        let mut written = true;
        if let Some(dac) = dac {
            if self.last_point != Some(self.point) {
                if sink.vout(dac, self.point).is_err() {
                    self.write_errors = self.write_errors.wrapping_add(1);
                    written = false;
                }
                self.callback.invoke();
            }
        }
        self.last_point = if written { Some(self.point) } else { None };
        self.hold_count += 1;
        if self.hold_count >= self.hold {
            self.hold_count = 0;
            self.count += 1;
            if self.count >= self.intervals {
                self.count = 0;
                self.last_point = None;
                return true;
            }
        }
        false
    }

    /// The value last computed by `next`
    pub fn point(&self) -> u16 {
        self.point
    }
    /// Start and end values
    pub fn range(&self) -> (u16, u16) {
        (self.begin as u16, self.end as u16)
    }
    /// Number of intervals
    pub fn intervals(&self) -> u32 {
        self.intervals
    }
    /// Ticks per interval
    pub fn hold(&self) -> u16 {
        self.hold
    }
    /// Ticks for the whole ramp
    pub fn ticks(&self) -> u32 {
        self.intervals * self.hold as u32
    }
    /// Lengthen (or shorten) every interval by `inc` ticks
    pub fn inc_hold(&mut self, inc: i16) {
        self.hold = (self.hold as i32 + inc as i32).clamp(1, u16::MAX as i32) as u16;
    }
    /// Steepen the ramp.  The last interval still lands on `end`.
    pub fn inc_change(&mut self, inc: u32) {
        self.change = self.change.saturating_add(inc);
    }
    /// Replace the per-write hook
    pub fn set_callback(&mut self, callback: Callback) {
        self.callback = callback;
    }
    /// Every value one pass of the ramp produces, one per interval
    pub fn points(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.intervals).map(|c| self.point_at(c))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:2} ints from {} to {} at {}{:.2} hold {} hcnt {} cnt {} |",
            self.intervals,
            self.begin,
            self.end,
            if self.rising { "+" } else { "-" },
            self.change as f32 / (1u32 << FRAC_BITS) as f32,
            self.hold,
            self.hold_count,
            self.count,
        )?;
        for p in self.points() {
            write!(f, " {}", p)?;
        }
        Ok(())
    }
}

/// Flags and position of an envelope, shared with other contexts.
#[derive(Debug, Default)]
pub struct EnvelopeControl {
    stop: AtomicBool,
    attack: AtomicBool,
    segment: AtomicU32,
}

impl EnvelopeControl {
    /// Fresh flags
    pub const fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            attack: AtomicBool::new(false),
            segment: AtomicU32::new(0),
        }
    }
    /// Freeze the envelope where it is
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
    /// True if the envelope is frozen
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
    /// True while an ADSR holds after its decay segment
    pub fn in_attack(&self) -> bool {
        self.attack.load(Ordering::Acquire)
    }
    /// Index of the active segment
    pub fn segment(&self) -> u32 {
        self.segment.load(Ordering::Acquire)
    }
    /// Let an ADSR continue past its decay segment
    pub fn release(&self) {
        self.attack.store(false, Ordering::Release);
    }
    /// Wait (up to `timeout_us`) for an ADSR to reach the end of its decay
    /// segment, then release it.  Returns false if the wait timed out; the
    /// envelope is released either way.
    pub fn release_at_sustain(&self, delay: &mut impl DelayNs, timeout_us: u32) -> bool {
        let mut waited = 0;
        let reached = loop {
            if self.segment() == 2 {
                break true;
            }
            if waited >= timeout_us {
                break false;
            }
            delay.delay_us(RELEASE_POLL_US);
            waited += RELEASE_POLL_US;
        };
        self.release();
        reached
    }
}

/// Plain envelope or ADSR
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Runs every segment
    Plain,
    /// Holds after the second segment until released
    Adsr,
}

/// An ordered list of segments driving one DAC channel.
pub struct Envelope<'a> {
    kind: EnvelopeKind,
    target: Option<DacId>,
    repeat: bool,
    segments: ArrayVec<Segment, MAX_SEGMENTS>,
    control: &'a EnvelopeControl,
    on_begin: Callback,
    on_end: Callback,
    end_called: bool,
    repeats: u32,
}

impl<'a> Envelope<'a> {
    /// An empty envelope.  Without a `target` it runs but writes nothing.
    pub fn new(
        kind: EnvelopeKind,
        target: Option<DacId>,
        repeat: bool,
        control: &'a EnvelopeControl,
    ) -> Self {
        let mut env = Self {
            kind,
            target,
            repeat,
            segments: ArrayVec::new(),
            control,
            on_begin: Callback::None,
            on_end: Callback::None,
            end_called: false,
            repeats: 0,
        };
        env.start();
        env
    }

    /// Set the hooks run on every restart and once when a pass finishes
    pub fn set_callbacks(&mut self, on_begin: Callback, on_end: Callback) {
        self.on_begin = on_begin;
        self.on_end = on_end;
    }

    /// Add a segment at `index`, or at the end if `index` is `None`
    pub fn add(&mut self, segment: Segment, index: Option<usize>) -> Result<()> {
        if self.segments.is_full() {
            return Err(Error::CapacityExceeded);
        }
        match index {
            Some(i) if i <= self.segments.len() => self.segments.insert(i, segment),
            Some(i) => return Err(Error::UnknownSegment(i as u8)),
            None => self.segments.push(segment),
        }
        Ok(())
    }

    /// Add a segment between two half steps of the oscillator `converter`
    /// belongs to
    #[allow(clippy::too_many_arguments)]
    pub fn add_notes(
        &mut self,
        converter: &PitchConverter,
        from: (u8, u8),
        to: (u8, u8),
        intervals: u16,
        hold: u16,
        index: Option<usize>,
        callback: Callback,
    ) -> Result<()> {
        let (begin, end) = note_codes(converter, from, to)?;
        self.add(Segment::new(begin, end, intervals, hold, callback), index)
    }

    /// Re-initialise segment `index`.  Call [restart](Self::restart) after
    /// replacing segments of a running envelope.
    pub fn replace(
        &mut self,
        index: usize,
        begin: u16,
        end: u16,
        intervals: u16,
        hold: u16,
        callback: Callback,
    ) -> Result<()> {
        let seg = self
            .segments
            .get_mut(index)
            .ok_or(Error::UnknownSegment(index as u8))?;
        *seg = Segment::new(begin, end, intervals, hold, callback);
        Ok(())
    }

    /// [replace](Self::replace) with half steps
    #[allow(clippy::too_many_arguments)]
    pub fn replace_notes(
        &mut self,
        converter: &PitchConverter,
        index: usize,
        from: (u8, u8),
        to: (u8, u8),
        intervals: u16,
        hold: u16,
        callback: Callback,
    ) -> Result<()> {
        let (begin, end) = note_codes(converter, from, to)?;
        self.replace(index, begin, end, intervals, hold, callback)
    }

    /// Remove every segment
    pub fn clear(&mut self) {
        self.segments.clear();
        self.control.segment.store(0, Ordering::Release);
    }

    /// Set the hook of the last segment
    pub fn set_segment_callback(&mut self, callback: Callback) -> Result<()> {
        let seg = self.segments.last_mut().ok_or(Error::UnknownSegment(0))?;
        seg.set_callback(callback);
        Ok(())
    }

    /// [Segment::inc_hold] on every segment
    pub fn inc_hold(&mut self, inc: i16) {
        self.segments.iter_mut().for_each(|s| s.inc_hold(inc));
    }

    /// [Segment::inc_change] on every segment
    pub fn inc_change(&mut self, inc: u32) {
        self.segments.iter_mut().for_each(|s| s.inc_change(inc));
    }

    fn active(&self) -> usize {
        self.control.segment() as usize
    }

    fn set_active(&self, segment: usize) {
        self.control.segment.store(segment as u32, Ordering::Release);
    }

    /// True once the active segment is past the last one that may run
    pub fn finished(&self) -> bool {
        let limit = match self.kind {
            EnvelopeKind::Adsr if self.control.in_attack() => self.segments.len().min(2),
            _ => self.segments.len(),
        };
        self.active() >= limit
    }

    /// Reset to the first segment without running the begin hook
    pub fn start(&mut self) {
        self.segments.iter_mut().for_each(Segment::start);
        self.set_active(0);
        self.repeats = 0;
        self.end_called = false;
        self.control.stop.store(false, Ordering::Release);
        self.control
            .attack
            .store(self.kind == EnvelopeKind::Adsr, Ordering::Release);
    }

    /// Run the begin hook and go back to the first segment
    pub fn restart(&mut self) {
        self.on_begin.invoke();
        self.segments.iter_mut().for_each(Segment::start);
        self.set_active(0);
        self.repeats = self.repeats.wrapping_add(1);
        self.end_called = false;
        self.control.stop.store(false, Ordering::Release);
        if self.kind == EnvelopeKind::Adsr {
            self.control.attack.store(true, Ordering::Release);
        }
    }

    /// Advance one tick.  Returns true while the envelope is finished.
    pub fn next(&mut self, sink: &mut dyn CodeSink) -> bool {
        if self.control.stopped() {
            return false;
        }
        if !self.finished() {
            let active = self.active();
            if self.segments[active].next(sink, self.target) {
                self.set_active(active + 1);
            }
        }
        if self.finished() {
            if self.repeat {
                self.restart();
            } else if !self.end_called && !self.control.in_attack() {
                self.end_called = true;
                self.on_end.invoke();
            }
            return true;
        }
        false
    }

    /// The shared flags
    pub fn control(&self) -> &'a EnvelopeControl {
        self.control
    }
    /// Plain or ADSR
    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }
    /// The DAC channel written
    pub fn target(&self) -> Option<DacId> {
        self.target
    }
    /// The segments
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
    /// Number of restarts since the last start
    pub fn repeats(&self) -> u32 {
        self.repeats
    }
    /// Ticks for one pass over every segment
    pub fn ticks(&self) -> u32 {
        self.segments.iter().map(Segment::ticks).sum()
    }
    /// Number of writes the sink rejected
    pub fn write_errors(&self) -> u32 {
        self.segments.iter().map(|s| s.write_errors).sum()
    }
}

fn note_codes(converter: &PitchConverter, from: (u8, u8), to: (u8, u8)) -> Result<(u16, u16)> {
    let code = |(octave, half): (u8, u8)| {
        let c = converter.din_h(octave, half);
        u16::try_from(c).map_err(|_| Error::CodeOutOfRange(c))
    };
    Ok((code(from)?, code(to)?))
}

impl fmt::Display for Envelope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} DAC {}, segments {}, active {}, repeats {}, stop {}, repeat {}, finished {}",
            self.kind,
            self.target.map(|d| d.0 as i16).unwrap_or(-1),
            self.segments.len(),
            self.active(),
            self.repeats,
            self.control.stopped() as u8,
            self.repeat as u8,
            self.finished() as u8
        )?;
        for (i, seg) in self.segments.iter().enumerate() {
            write!(f, "\n  segment {} {}", i, seg)?;
        }
        Ok(())
    }
}
