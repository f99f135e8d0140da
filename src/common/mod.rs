//! Shared primitives used across the engine.
//!
//! - Fixed-delay retry (deterministic, no exponential growth)
//! - Cooperative cancellation token
//! - Monotonic timing helpers

use std::future::Future;
use std::time::{Duration, Instant};

pub use tokio_util::sync::CancellationToken;

/// Outcome of a retried operation, carrying the number of attempts made.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Runs `op` up to `1 + retries` times, sleeping a fixed `delay` between
/// attempts. The first `Ok` wins; the last `Err` is returned otherwise.
///
/// The closure receives the 1-based attempt number.
pub async fn retry_with_delay<T, E, F, Fut>(retries: u32, delay: Duration, mut op: F) -> Retried<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => {
                if attempt > retries {
                    return Retried {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Monotonic stopwatch for `duration_ms` fields.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
