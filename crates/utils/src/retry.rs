// This file is part of opbundler.
//
// opbundler is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// opbundler is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with opbundler.
// If not, see https://www.gnu.org/licenses/.

//! Bounded retries with exponential backoff.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time;
use tracing::warn;

/// Options for retrying an operation using exponential backoff
/// with jitter.
#[derive(Clone, Copy, Debug)]
pub struct RetryOpts {
    /// Maximum number of attempts to make, including the first one.
    pub max_attempts: u64,
    /// The first retry is immediately after the first failure (plus jitter).
    /// The next retry after that will wait this long.
    pub min_nonzero_wait: Duration,
    /// The maximum amount of time to wait between retries.
    pub max_wait: Duration,
    /// The maximum amount of jitter to add to the wait time.
    pub max_jitter: Duration,
}

impl Default for RetryOpts {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_nonzero_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
            max_jitter: Duration::from_millis(250),
        }
    }
}

/// Retry a function using exponential backoff with jitter.
///
/// Gives up after `opts.max_attempts` attempts and returns the last error.
/// An attempt count of zero is treated as one.
pub async fn with_retries<Func, Fut, Out, Err>(
    description: &str,
    func: Func,
    opts: RetryOpts,
) -> Result<Out, Err>
where
    Func: Fn() -> Fut,
    Fut: Future<Output = Result<Out, Err>>,
{
    let max_attempts = opts.max_attempts.max(1);
    let mut next_wait = Duration::ZERO;
    let mut attempt_number = 1;
    loop {
        let error = match func().await {
            Ok(out) => return Ok(out),
            Err(error) => error,
        };
        warn!("Failed to {description} (attempt {attempt_number})");
        if attempt_number >= max_attempts {
            return Err(error);
        }
        attempt_number += 1;

        // Grab a new rng each iteration because we can't hold it across awaits.
        let jitter = if opts.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..opts.max_jitter)
        };
        time::sleep(next_wait + jitter).await;
        next_wait = (2 * next_wait).clamp(opts.min_nonzero_wait, opts.max_wait);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn opts(max_attempts: u64) -> RetryOpts {
        RetryOpts {
            max_attempts,
            min_nonzero_wait: Duration::from_millis(10),
            max_wait: Duration::from_millis(40),
            max_jitter: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU64::new(0);
        let out = with_retries(
            "count",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            },
            opts(5),
        )
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_last_error() {
        let calls = AtomicU64::new(0);
        let out: Result<(), u64> = with_retries(
            "fail",
            || async { Err(calls.fetch_add(1, Ordering::SeqCst)) },
            opts(3),
        )
        .await;
        assert_eq!(out, Err(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_runs_once() {
        let calls = AtomicU64::new(0);
        let _: Result<(), ()> = with_retries(
            "once",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(())
            },
            opts(0),
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
