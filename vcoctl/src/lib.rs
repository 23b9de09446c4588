//! This crate contains the control core for a bank of DAC-driven analog
//! oscillators.  It is designed to be `no_std` and heap-free: everything
//! that runs in interrupt context (edge capture, the envelope tick) is
//! integer/fixed-point math over fixed-capacity collections, and anything an
//! interrupt shares with a worker task is atomic.
//!
//! The pieces, leaf first:
//!
//! - [capture]: period measurement off a free-running 32 bit capture counter,
//!   and the counting [capture::Semaphore] used to wake workers.
//! - [pitch]: conversions between (octave, half step), (octave, xstep), DAC
//!   codes, frequencies and timer widths, plus the per-oscillator
//!   [pitch::CalibrationTable].
//! - [board]: the arena of DAC channels and oscillators, addressed by
//!   [DacId]/[VcoId] handles, with the output operations.
//! - [tune] and [correct]: the landmark auto-tuner and the closed-loop
//!   correction step, both implemented on [board::Board].
//! - [envelope] and [dispatch]: piecewise-linear envelopes and the periodic
//!   tick that advances them.
//!
//! Hardware is reached through the [dac::DacBus] trait (an LTC2668 driver
//! over `embedded_hal::spi::SpiDevice` is provided) and blocking waits take an
//! `embedded_hal::delay::DelayNs`.  The [adc] module reads voltages back
//! through an LTC1859 for diagnostics.  The [sim] module provides a simulated
//! board for tests and the console.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod adc;
pub mod board;
pub mod capture;
pub mod config;
pub mod correct;
pub mod dac;
pub mod dispatch;
pub mod envelope;
mod error;
pub mod fixedmath;
pub mod pitch;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod tune;
pub mod util;
pub mod vco;

pub use board::{Board, DacId, VcoId};
pub use error::{Error, Result};
pub use fixedmath::Freq16;

/// Maximum number of DAC channels on a board (four 16 channel chips)
pub const MAX_DACS: usize = 64;
/// Maximum number of oscillators on a board
pub const MAX_VCOS: usize = 6;
/// Maximum number of envelopes a dispatcher will advance
pub const MAX_ENVELOPES: usize = 16;
/// Maximum number of segments in one envelope
pub const MAX_SEGMENTS: usize = 16;
/// Maximum number of calibration landmarks (a 16 octave oscillator)
pub const MAX_LANDMARKS: usize = 33;
