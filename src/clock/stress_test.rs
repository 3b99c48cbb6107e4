// SPDX-License-Identifier: Apache-2.0

use super::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const TEST_DURATION_MS: u64 = 2000; // 2 seconds

#[test]
fn monotonicity_stress_test() {
    // The clock is the central piece of state, shared across all threads.
    // A Mutex stands in for the single-core guarantee: the "ISR" can never
    // preempt the "Application" in the middle of a micros() call.
    let clock = Arc::new(Mutex::new(Clock::new(16_000_000)));

    // A shared flag to signal all threads to stop.
    let stop_signal = Arc::new(AtomicBool::new(false));

    // --- Thread 1: The "Hardware Counter" Simulator ---
    // Ticks TCNT0 upward and latches TOV0 at each wrap, like the timer
    // peripheral does.
    let clock_hw = clock.clone();
    let stop_hw = stop_signal.clone();
    let hw_thread = thread::spawn(move || {
        while !stop_hw.load(Ordering::Relaxed) {
            let clock_guard = clock_hw.lock().unwrap();
            let raw = clock_guard.raw_tcnt.load(Ordering::SeqCst);
            let pending = clock_guard.overflow_pending.load(Ordering::SeqCst);
            if raw == u8::MAX && !pending {
                // Wrap to zero and latch the overflow flag for the ISR.
                clock_guard.raw_tcnt.store(0, Ordering::SeqCst);
                clock_guard.overflow_pending.store(true, Ordering::SeqCst);
            } else if raw < u8::MAX - 1 || !pending {
                // Hold one tick short of a second wrap while the previous
                // overflow is still unhandled; the reader compensates for
                // exactly one latched wrap, and a real handler is never
                // starved for a full 1024 us period.
                clock_guard.raw_tcnt.store(raw + 1, Ordering::SeqCst);
            }
            drop(clock_guard);
            // Sleep for a tiny duration to simulate the tick rate.
            thread::sleep(Duration::from_nanos(100));
        }
    });

    // --- Thread 2: The "ISR" Simulator ---
    let clock_isr = clock.clone();
    let stop_isr = stop_signal.clone();
    let isr_thread = thread::spawn(move || {
        while !stop_isr.load(Ordering::Relaxed) {
            let clock_guard = clock_isr.lock().unwrap();
            if clock_guard.overflow_pending.load(Ordering::SeqCst) {
                // Hardware clears TOV0 when the vector executes.
                clock_guard.overflow_pending.store(false, Ordering::SeqCst);
                clock_guard.on_overflow();
            }
            drop(clock_guard);
            // Sleep for a tiny, slightly variable duration to make the timing unpredictable.
            thread::sleep(Duration::from_micros(1));
        }
    });

    // --- Thread 3: The "Application" / Monotonicity Checker ---
    let clock_app = clock.clone();
    let stop_app = stop_signal.clone();
    let app_thread = thread::spawn(move || {
        let mut last_seen_time = 0;
        let mut iterations = 0;
        while !stop_app.load(Ordering::Relaxed) {
            let current_time = clock_app.lock().unwrap().micros();
            assert!(
                current_time >= last_seen_time,
                "Monotonicity failed! current: {}, last: {}",
                current_time,
                last_seen_time
            );
            last_seen_time = current_time;
            iterations += 1;
        }
        println!("Checker thread completed {} iterations.", iterations);
    });

    // Let the threads run for the specified duration.
    println!("Running stress test for {}ms...", TEST_DURATION_MS);
    thread::sleep(Duration::from_millis(TEST_DURATION_MS));

    // Signal all threads to stop and wait for them to finish.
    stop_signal.store(true, Ordering::Relaxed);
    hw_thread.join().unwrap();
    isr_thread.join().unwrap();
    app_thread.join().unwrap();

    println!("Stress test passed.");
}
