// SPDX-License-Identifier: Apache-2.0

use core::cell::Cell;
use critical_section::Mutex;

#[cfg(test)]
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[cfg(all(not(test), feature = "avr"))]
use avr_device::atmega2560 as pac;

/// Hardware clock cycles per Timer/Counter0 tick (TCCR0B clock select /64).
const PRESCALER: u32 = 64;
/// Ticks per overflow of the 8-bit counter register.
const TICKS_PER_OVERFLOW: u32 = 256;
/// Upper bound of the sub-millisecond accumulator. The remainder is kept
/// right-shifted by 3 so it fits a byte.
const FRACT_MAX: u8 = (1000 >> 3) as u8;

fn yield_noop() {}

/// A millisecond/microsecond wall clock driven by Timer/Counter0 overflows.
///
/// The overflow period generally isn't a whole number of milliseconds, so
/// each overflow adds a whole-millisecond increment plus a fractional
/// remainder; when the remainder carries, the millisecond counter gains one
/// extra unit. Counters wrap silently at their integer width, matching
/// hardware counter semantics.
pub struct Clock {
    overflows: Mutex<Cell<u32>>, // Counts TIMER0_OVF interrupts
    millis: Mutex<Cell<u32>>,    // Whole-millisecond accumulator
    fract: Mutex<Cell<u8>>,      // Sub-millisecond remainder, < FRACT_MAX
    yield_hook: Mutex<Cell<fn()>>,
    millis_inc: u32,     // Whole milliseconds per overflow
    fract_inc: u8,       // Fractional remainder per overflow, pre-shifted
    micros_per_tick: u32,
    #[cfg(test)]
    raw_tcnt: AtomicU8, // emulated TCNT0
    #[cfg(test)]
    overflow_pending: AtomicBool, // emulated TIFR0.TOV0 latch
}

impl Clock {
    /// Creates a clock for the given CPU frequency.
    ///
    /// # Panics
    ///
    /// * If `cpu_hz` is 0 or not a whole number of MHz
    /// * If 64 is not divisible by the cycles-per-microsecond ratio (the
    ///   tick-to-microsecond scaling would lose precision; 8 MHz and 16 MHz
    ///   are the usual choices)
    ///
    /// # Examples
    ///
    /// ```
    /// # use timer0_clock::Clock;
    /// // 16 MHz CPU: one overflow every 1024 microseconds
    /// static CLOCK: Clock = Clock::new(16_000_000);
    /// ```
    pub const fn new(cpu_hz: u32) -> Self {
        if cpu_hz == 0 {
            panic!("cpu_hz cannot be 0");
        }
        if cpu_hz % 1_000_000 != 0 {
            panic!("cpu_hz must be a whole number of MHz");
        }
        let cycles_per_us = cpu_hz / 1_000_000;
        if PRESCALER % cycles_per_us != 0 {
            panic!("prescaler is not a multiple of cycles per microsecond");
        }

        let micros_per_overflow = PRESCALER * TICKS_PER_OVERFLOW / cycles_per_us;

        Clock {
            overflows: Mutex::new(Cell::new(0)),
            millis: Mutex::new(Cell::new(0)),
            fract: Mutex::new(Cell::new(0)),
            yield_hook: Mutex::new(Cell::new(yield_noop as fn())),
            millis_inc: micros_per_overflow / 1000,
            fract_inc: ((micros_per_overflow % 1000) >> 3) as u8,
            micros_per_tick: PRESCALER / cycles_per_us,
            #[cfg(test)]
            raw_tcnt: AtomicU8::new(0),
            #[cfg(test)]
            overflow_pending: AtomicBool::new(false),
        }
    }

    /// Overflow handler.
    ///
    /// Call this from the `TIMER0_OVF` interrupt handler. This is the only
    /// place the counters are mutated.
    pub fn on_overflow(&self) {
        critical_section::with(|cs| {
            let millis = self.millis.borrow(cs);
            let fract = self.fract.borrow(cs);

            // Work on local copies, write both back as a unit.
            let mut m = millis.get();
            let mut f = fract.get();

            m = m.wrapping_add(self.millis_inc);
            f += self.fract_inc;
            if f >= FRACT_MAX {
                f -= FRACT_MAX;
                m = m.wrapping_add(1);
            }

            fract.set(f);
            millis.set(m);

            let overflows = self.overflows.borrow(cs);
            overflows.set(overflows.get().wrapping_add(1));
        });
    }

    /// Returns the number of milliseconds since [`init`](Clock::init).
    ///
    /// Wraps after about 49.7 days.
    pub fn millis(&self) -> u32 {
        // Interrupts stay masked for the copy so the overflow handler can
        // never leave the reader with a half-written value.
        critical_section::with(|cs| self.millis.borrow(cs).get())
    }

    /// Returns the number of microseconds since [`init`](Clock::init).
    ///
    /// Resolution is one timer tick (4 µs at 16 MHz); wraps after about
    /// 71.6 minutes.
    pub fn micros(&self) -> u32 {
        let (overflows, raw) = critical_section::with(|cs| {
            let mut overflows = self.overflows.borrow(cs).get();
            let raw = self.timer_count();

            // The hardware latches TOV0 at the wrap even while interrupts
            // are masked. If the flag is up and the register has already
            // wrapped past zero, the handler hasn't run yet for that wrap;
            // count it here or time would jump backward. The flag is checked
            // on every read, whatever the caller's interrupt state.
            if self.overflow_pending() && raw < u8::MAX {
                overflows = overflows.wrapping_add(1);
            }

            (overflows, raw)
        });

        overflows
            .wrapping_shl(8)
            .wrapping_add(raw as u32)
            .wrapping_mul(self.micros_per_tick)
    }

    /// Blocks for at least `ms` milliseconds, measured via [`micros`](Clock::micros).
    ///
    /// The yield hook runs once per outer poll iteration, so a cooperative
    /// scheduler layered on top can do other work during the wait. There is
    /// no cancellation; the full duration always elapses.
    pub fn delay(&self, mut ms: u32) {
        let mut start = self.micros();

        while ms > 0 {
            (self.hook())();
            // Consume every whole millisecond that elapsed since the last
            // poll. wrapping_sub keeps the comparison correct across the
            // u32 wrap of micros().
            while ms > 0 && self.micros().wrapping_sub(start) >= 1000 {
                ms -= 1;
                start = start.wrapping_add(1000);
            }
        }
    }

    /// Replaces the delay yield hook. Defaults to a no-op.
    ///
    /// Set this once during system bring-up, before the first `delay` call.
    pub fn set_yield_hook(&self, hook: fn()) {
        critical_section::with(|cs| self.yield_hook.borrow(cs).set(hook));
    }

    fn hook(&self) -> fn() {
        critical_section::with(|cs| self.yield_hook.borrow(cs).get())
    }

    /// One-time hardware setup: enables interrupt delivery globally, selects
    /// the /64 prescaler and enables the Timer/Counter0 overflow interrupt.
    ///
    /// Call exactly once before using any of the time operations. The
    /// downstream binary must also route the `TIMER0_OVF` vector to
    /// [`on_overflow`](Clock::on_overflow) and provide a `critical-section`
    /// implementation (e.g. the `avr-device/critical-section-impl` feature).
    #[cfg(all(not(test), feature = "avr"))]
    pub fn init(&self, tc0: &pac::TC0) {
        // # Safety
        // Interrupt delivery is what drives the clock; the overflow handler
        // only touches state behind critical sections.
        unsafe { avr_device::interrupt::enable() };

        tc0.tccr0b().write(|w| w.cs0().prescale_64());
        tc0.timsk0().write(|w| w.toie0().set_bit());

        #[cfg(feature = "defmt")]
        defmt::trace!("timer0 clock running");
    }

    /// Returns the raw TCNT0 counter value.
    fn timer_count(&self) -> u8 {
        #[cfg(test)]
        return self.raw_tcnt.load(Ordering::SeqCst);

        #[cfg(all(not(test), feature = "avr"))]
        // TCNT0 is only read here, never written.
        return unsafe { (*pac::TC0::ptr()).tcnt0().read().bits() };

        #[cfg(all(not(test), not(feature = "avr")))]
        panic!("This module requires the avr-device crate to be available");
    }

    /// Returns whether an overflow is latched in TIFR0 but not yet handled.
    fn overflow_pending(&self) -> bool {
        #[cfg(test)]
        return self.overflow_pending.load(Ordering::SeqCst);

        #[cfg(all(not(test), feature = "avr"))]
        return unsafe { (*pac::TC0::ptr()).tifr0().read().tov0().bit_is_set() };

        #[cfg(all(not(test), not(feature = "avr")))]
        panic!("This module requires the avr-device crate to be available");
    }
}

impl Clock {
    // -------- test-only helpers ----------
    #[cfg(test)]
    fn set_timer_count(&self, value: u8) {
        self.raw_tcnt.store(value, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn set_overflow_pending(&self, value: bool) {
        self.overflow_pending.store(value, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn set_millis(&self, value: u32) {
        critical_section::with(|cs| self.millis.borrow(cs).set(value));
    }

    #[cfg(test)]
    fn set_overflows(&self, value: u32) {
        critical_section::with(|cs| self.overflows.borrow(cs).set(value));
    }

    #[cfg(test)]
    fn fract_value(&self) -> u8 {
        critical_section::with(|cs| self.fract.borrow(cs).get())
    }

    #[cfg(test)]
    fn overflows_value(&self) -> u32 {
        critical_section::with(|cs| self.overflows.borrow(cs).get())
    }

    /// Steps the emulated hardware forward by `us` microseconds, running the
    /// overflow handler at each wrap (as if the interrupt fires promptly).
    #[cfg(test)]
    fn advance_micros(&self, us: u32) {
        assert_eq!(us % self.micros_per_tick, 0);
        let mut ticks = us / self.micros_per_tick;
        while ticks > 0 {
            let raw = self.raw_tcnt.load(Ordering::SeqCst) as u32;
            let step = (TICKS_PER_OVERFLOW - raw).min(ticks);
            if raw + step == TICKS_PER_OVERFLOW {
                self.raw_tcnt.store(0, Ordering::SeqCst);
                self.on_overflow();
            } else {
                self.raw_tcnt.store((raw + step) as u8, Ordering::SeqCst);
            }
            ticks -= step;
        }
    }
}


#[cfg(test)]
mod stress_test;
