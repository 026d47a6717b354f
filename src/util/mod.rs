use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Convenient (arguably) function for reporting times of operations
pub fn trace_time<T, E>(
    body: impl FnOnce() -> Result<T, E>,
    result: impl FnOnce(Duration, &T),
) -> Result<T, E> {
    let start = Instant::now();

    let res = body()?;
    result(Instant::now().duration_since(start), &res);

    Ok(res)
}

/// `e` with its whole `source()` chain, for log lines
pub fn display_chain(e: &dyn std::error::Error) -> String {
    let mut msg = e.to_string();
    let mut src = e.source();
    while let Some(c) = src {
        msg.push_str("; caused by: ");
        msg.push_str(&c.to_string());
        src = c.source();
    }
    msg
}

/// Bounded exponential backoff
///
/// `delay(n)` is the pause after the `n`-th failed attempt: `initial * 2^(n-1)`,
/// capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial,
            max,
        }
    }

    /// No waiting between attempts
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Run-level cancellation signal
///
/// Cloned into the Ctrl-C handler; the driver polls it between units of work.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on shutdown.
    ///
    /// Returns `false` if shutdown was triggered.
    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(200);

        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = Instant::now();
            if deadline <= now {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLICE));
        }
    }
}
