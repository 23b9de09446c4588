//! Period measurement by input capture.
//!
//! A [FreqTimer] owns up to four capture channels of one free-running 32 bit
//! counter.  Its interrupt handler forwards each captured timestamp to the
//! matching [FreqChannel], which turns consecutive timestamps into a width
//! (counter ticks per period of the measured oscillator).
//!
//! Everything here is shared by `&` reference between the interrupt handler
//! and worker code, so all state is atomic and nothing here blocks except the
//! explicitly `sampled_*` accessors, which are for worker context only.

use crate::config::REFERENCE_CLOCK_HZ;
use crate::fixedmath::Freq16;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use embedded_hal::delay::DelayNs;

const POLL_US: u32 = 100;

/// A counting semaphore that an interrupt handler can release.
///
/// Waiting is done by polling with a [DelayNs], so a wait is bounded by its
/// timeout rather than by a scheduler.
#[derive(Default)]
pub struct Semaphore {
    count: AtomicU32,
}

impl Semaphore {
    /// Create a semaphore with no tokens
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }
    /// Add a token.  Safe to call from interrupt context.
    pub fn release(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::Release, Ordering::Relaxed, |c| {
                Some(c.saturating_add(1))
            });
    }
    /// Take a token if one is available
    pub fn try_acquire(&self) -> bool {
        self.count
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }
    /// Discard every pending token
    pub fn drain(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
    /// Number of pending tokens
    pub fn available(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
    /// Take a token, waiting up to `timeout_ms` for one to be released.
    /// Returns false on timeout.
    pub fn acquire_timeout(&self, timeout_ms: u32, delay: &mut impl DelayNs) -> bool {
        if self.try_acquire() {
            return true;
        }
        let polls = timeout_ms.saturating_mul(1000 / POLL_US);
        for _ in 0..polls {
            delay.delay_us(POLL_US);
            if self.try_acquire() {
                return true;
            }
        }
        false
    }
}

/// Convert a width in counter ticks to Hz×16.  Zero means "no measurement".
pub fn width_to_frequency16(width: u32) -> Freq16 {
    if width == 0 {
        Freq16::ZERO
    } else {
        Freq16::from_bits((REFERENCE_CLOCK_HZ << 4) / width)
    }
}

/// One capture input measuring the period of one oscillator.
pub struct FreqChannel {
    id: u8,
    step: AtomicBool,
    count0: AtomicU32,
    count1: AtomicU32,
    width: AtomicU32,
    samples: AtomicU32,
    edges: AtomicU32,
    dropped: AtomicU32,
    hold_off: AtomicBool,
    sample_ready: Semaphore,
    correction_ready: Semaphore,
}

impl FreqChannel {
    /// Create an idle channel
    pub const fn new(id: u8) -> Self {
        Self {
            id,
            step: AtomicBool::new(false),
            count0: AtomicU32::new(0),
            count1: AtomicU32::new(0),
            width: AtomicU32::new(0),
            samples: AtomicU32::new(0),
            edges: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
            hold_off: AtomicBool::new(false),
            sample_ready: Semaphore::new(),
            correction_ready: Semaphore::new(),
        }
    }

    /// The channel number
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Capture interrupt: record the counter value of a rising edge.
    ///
    /// The two capture registers are used alternately; the width is the
    /// difference to the other one.  A pair straddling a counter wrap is
    /// dropped and the next period fixes it up.
    pub fn on_edge(&self, timestamp: u32) {
        let step = self.step.load(Ordering::Relaxed);
        let (this, other) = if step {
            (&self.count1, &self.count0)
        } else {
            (&self.count0, &self.count1)
        };
        this.store(timestamp, Ordering::Relaxed);
        self.step.store(!step, Ordering::Relaxed);
        let previous = other.load(Ordering::Relaxed);
        if self.edges.fetch_add(1, Ordering::Relaxed) == 0 {
            return;
        }
        if timestamp > previous {
            self.width.store(timestamp - previous, Ordering::Relaxed);
            self.samples.fetch_add(1, Ordering::Release);
            self.sample_ready.release();
            if !self.hold_off.load(Ordering::Acquire) {
                self.correction_ready.release();
            }
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Last valid width, 0 if there hasn't been one
    pub fn width(&self) -> u32 {
        self.width.load(Ordering::Acquire)
    }

    /// Number of valid widths measured so far (wrapping).
    ///
    /// Load this before [width](Self::width): the width read afterwards is at
    /// least as new as the count.
    pub fn samples(&self) -> u32 {
        self.samples.load(Ordering::Acquire)
    }

    /// Wait for the next valid width.  Returns 0 on timeout.
    pub fn sampled_width(&self, timeout_ms: u32, delay: &mut impl DelayNs) -> u32 {
        self.sample_ready.drain();
        if self.sample_ready.acquire_timeout(timeout_ms, delay) {
            self.width()
        } else {
            0
        }
    }

    /// Frequency of the last valid width
    pub fn frequency16(&self) -> Freq16 {
        width_to_frequency16(self.width())
    }

    /// Frequency of the next valid width, 0 on timeout
    pub fn sampled_frequency16(&self, timeout_ms: u32, delay: &mut impl DelayNs) -> Freq16 {
        width_to_frequency16(self.sampled_width(timeout_ms, delay))
    }

    /// Frequency of the last valid width, in Hz
    pub fn frequency(&self) -> f32 {
        match self.width() {
            0 => 0.0,
            w => REFERENCE_CLOCK_HZ as f32 / w as f32,
        }
    }

    /// Frequency of the next valid width in Hz, 0 on timeout
    pub fn sampled_frequency(&self, timeout_ms: u32, delay: &mut impl DelayNs) -> f32 {
        match self.sampled_width(timeout_ms, delay) {
            0 => 0.0,
            w => REFERENCE_CLOCK_HZ as f32 / w as f32,
        }
    }

    /// Number of edge pairs dropped because the counter wrapped between them
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// While set, new widths don't signal the correction worker.
    pub fn set_hold_off(&self, hold_off: bool) {
        self.hold_off.store(hold_off, Ordering::Release);
    }

    /// See [FreqChannel::set_hold_off]
    pub fn hold_off(&self) -> bool {
        self.hold_off.load(Ordering::Acquire)
    }

    /// The signal the correction worker of this channel waits on
    pub fn correction_ready(&self) -> &Semaphore {
        &self.correction_ready
    }
}

impl fmt::Display for FreqChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:12} {:12} {:8.2} edges {} dropped {}",
            self.id,
            self.step.load(Ordering::Relaxed) as u8,
            self.count0.load(Ordering::Relaxed),
            self.count1.load(Ordering::Relaxed),
            self.frequency(),
            self.edges.load(Ordering::Relaxed),
            self.dropped()
        )
    }
}

/// A four channel capture timer.
pub struct FreqTimer<'a> {
    id: u8,
    channels: [Option<&'a FreqChannel>; 4],
    enabled: AtomicU8,
    overflow: AtomicU32,
    last_capture: AtomicU32,
}

impl<'a> FreqTimer<'a> {
    /// Create a timer with its channels wired up but not yet enabled
    pub const fn new(id: u8, channels: [Option<&'a FreqChannel>; 4]) -> Self {
        Self {
            id,
            channels,
            enabled: AtomicU8::new(0),
            overflow: AtomicU32::new(0),
            last_capture: AtomicU32::new(0),
        }
    }

    /// Enable capture interrupts for the selected channels
    pub fn start(&self, channels: [bool; 4]) {
        let mask = channels
            .iter()
            .enumerate()
            .fold(0u8, |m, (i, &on)| if on { m | (1 << i) } else { m });
        self.enabled.store(mask, Ordering::Release);
    }

    /// Disable all capture interrupts
    pub fn stop(&self) {
        self.enabled.store(0, Ordering::Release);
    }

    /// Timer interrupt.  `overflowed` is the update flag of the counter,
    /// `captures` holds the capture register of every channel whose capture
    /// flag was set.
    pub fn on_interrupt(&self, overflowed: bool, captures: [Option<u32>; 4]) {
        if overflowed {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        let enabled = self.enabled.load(Ordering::Acquire);
        for (i, capture) in captures.iter().enumerate() {
            if let (Some(ts), Some(channel)) = (capture, self.channels[i]) {
                if enabled & (1 << i) != 0 {
                    self.last_capture.store(*ts, Ordering::Relaxed);
                    channel.on_edge(*ts);
                }
            }
        }
    }

    /// Number of counter wraps seen
    pub fn overflow(&self) -> u32 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// The channel wired to `slot`
    pub fn channel(&self, slot: usize) -> Option<&'a FreqChannel> {
        self.channels.get(slot).copied().flatten()
    }
}

impl fmt::Display for FreqTimer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timer {} {:12} enabled {:04b} overflow {}",
            self.id,
            self.last_capture.load(Ordering::Relaxed),
            self.enabled.load(Ordering::Relaxed),
            self.overflow()
        )
    }
}
