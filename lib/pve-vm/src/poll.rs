// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded, fixed-interval polling.

use std::future::Future;
use std::time::Instant;

use backoff::exponential::ExponentialBackoff;
use backoff::Clock;
use pve_vm_config::PollPolicy;
use slog::{debug, Logger};

use crate::Error;

/// Measures poll budgets on the tokio clock, so paused-time tests advance
/// it along with their sleeps.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

enum PollError {
    Pending,
    Failed(Error),
}

fn fixed_interval(policy: &PollPolicy) -> ExponentialBackoff<TokioClock> {
    let clock = TokioClock;
    ExponentialBackoff {
        current_interval: policy.interval(),
        initial_interval: policy.interval(),
        randomization_factor: 0.0,
        multiplier: 1.0,
        max_interval: policy.interval(),
        start_time: clock.now(),
        max_elapsed_time: Some(policy.timeout()),
        clock,
    }
}

/// Calls `check` every `policy.interval()` until it yields a value, fails,
/// or `policy.timeout()` has elapsed. `Ok(None)` means "not yet".
///
/// Only the condition is retried: an error from `check` ends the wait.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    what: &str,
    log: &Logger,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let res = backoff::future::retry(fixed_interval(policy), || {
        debug!(log, "polling"; "for" => what);
        let fut = check();
        async move {
            match fut.await {
                Ok(Some(v)) => Ok(v),
                Ok(None) => Err(backoff::Error::transient(PollError::Pending)),
                Err(e) => Err(backoff::Error::permanent(PollError::Failed(e))),
            }
        }
    })
    .await;

    match res {
        Ok(v) => Ok(v),
        Err(PollError::Pending) => {
            Err(Error::Timeout {
                what: what.to_string(),
                after: policy.timeout(),
            })
        }
        Err(PollError::Failed(e)) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_once_ready() {
        let calls = AtomicUsize::new(0);
        let start = tokio::time::Instant::now();
        let v = poll_until(&PollPolicy::new(60, 5), "three calls", &log(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok((n == 3).then_some(n)) }
        })
        .await
        .unwrap();
        assert_eq!(v, 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let start = tokio::time::Instant::now();
        let res: Result<(), _> =
            poll_until(&PollPolicy::new(30, 5), "never", &log(), || async {
                Ok(None)
            })
            .await;
        match res {
            Err(Error::Timeout { what, after }) => {
                assert_eq!(what, "never");
                assert_eq!(after, Duration::from_secs(30));
            }
            other => panic!("unexpected result {:?}", other),
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(25));
        assert!(elapsed <= Duration::from_secs(36));
    }

    #[tokio::test(start_paused = true)]
    async fn errors_end_the_wait() {
        let calls = AtomicUsize::new(0);
        let res: Result<(), _> =
            poll_until(&PollPolicy::new(30, 5), "failure", &log(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::MissingId) }
            })
            .await;
        assert!(matches!(res, Err(Error::MissingId)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
