//! Adaptive Spin/Yield/Sleep Waiter
//!
//! Waits for a 64-bit atomic sequence to move, trading CPU for latency in
//! three phases:
//! 1. Busy spin with a CPU pause hint  (~100 ns latency, one core pegged)
//! 2. Cooperative yield               (~µs latency, moderate CPU)
//! 3. Timed sleep, repeated           (~ms latency, near-zero CPU)
//!
//! Any observed change resets the waiter to phase 1, so a bursty writer is
//! always met at spin latency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Waiter tuning.
#[derive(Debug, Clone)]
pub struct WaiterConfig {
    /// Phase 1 spin iterations
    pub spin_iterations: u32,

    /// Phase 2 yield iterations
    pub yield_iterations: u32,

    /// Phase 3 sleep quantum
    pub sleep: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        WaiterConfig {
            spin_iterations: 10_000,
            yield_iterations: 1_000,
            sleep: Duration::from_micros(100),
        }
    }
}

/// Three-phase waiter over an atomic sequence counter.
#[derive(Debug)]
pub struct AdaptiveWaiter {
    config: WaiterConfig,
    phase: u8,
    iteration: u32,
}

impl AdaptiveWaiter {
    /// Create a waiter in phase 1.
    pub fn new(config: WaiterConfig) -> Self {
        AdaptiveWaiter {
            config,
            phase: 1,
            iteration: 0,
        }
    }

    /// Block until `sequence` differs from `last` or the deadline passes.
    ///
    /// Returns the new sequence value, or `None` on deadline. Either way the
    /// waiter resets to phase 1 for the next call.
    pub fn wait_for_change(
        &mut self,
        sequence: &AtomicU64,
        last: u64,
        deadline: Option<Instant>,
    ) -> Option<u64> {
        self.reset();

        loop {
            let current = sequence.load(Ordering::Acquire);
            if current != last {
                self.reset();
                return Some(current);
            }

            // Deadline checks are kept off the spin fast path: phase 1 only
            // looks at the clock every 1024 iterations.
            if let Some(deadline) = deadline {
                let check = self.phase > 1 || self.iteration % 1024 == 0;
                if check && Instant::now() >= deadline {
                    self.reset();
                    return None;
                }
            }

            self.step();
        }
    }

    /// Current phase (1, 2 or 3).
    pub fn current_phase(&self) -> u8 {
        self.phase
    }

    /// Rough CPU share of the current phase, for operator sizing.
    pub fn estimated_cpu_percent(&self) -> f64 {
        match self.phase {
            1 => 100.0,
            2 => 50.0,
            _ => 5.0,
        }
    }

    fn reset(&mut self) {
        self.phase = 1;
        self.iteration = 0;
    }

    fn step(&mut self) {
        self.iteration += 1;
        match self.phase {
            1 => {
                std::hint::spin_loop();
                if self.iteration >= self.config.spin_iterations {
                    self.phase = 2;
                    self.iteration = 0;
                }
            }
            2 => {
                std::thread::yield_now();
                if self.iteration >= self.config.yield_iterations {
                    self.phase = 3;
                    self.iteration = 0;
                }
            }
            _ => {
                std::thread::sleep(self.config.sleep);
            }
        }
    }
}
