// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), no_std)]

//! Arduino-style `millis`/`micros`/`delay` timekeeping for AVR firmware,
//! driven by the Timer/Counter0 overflow interrupt.
//!
//! Timer/Counter0 runs free behind a /64 prescaler and overflows every 256
//! ticks. That period is not a whole number of milliseconds, so the overflow
//! handler carries a sub-millisecond remainder between events and folds it
//! into the millisecond counter as it accumulates. Readers snapshot the
//! counters under a critical section and, for microsecond reads, compensate
//! for an overflow that has latched in hardware but not yet been handled.
//!
//! The firmware wires the clock up once at startup:
//!
//! ```ignore
//! static CLOCK: Clock = Clock::new(16_000_000);
//!
//! #[avr_device::interrupt(atmega2560)]
//! fn TIMER0_OVF() {
//!     CLOCK.on_overflow();
//! }
//!
//! fn main() -> ! {
//!     let dp = avr_device::atmega2560::Peripherals::take().unwrap();
//!     CLOCK.init(&dp.TC0);
//!     loop {
//!         CLOCK.delay(1000);
//!         let _uptime_ms = CLOCK.millis();
//!     }
//! }
//! ```
//!
//! A `critical-section` implementation must be provided by the binary, e.g.
//! via the `avr-device/critical-section-impl` feature.

mod clock;
pub use clock::Clock;
