//! Fan-in of concurrent sub-request outcomes
//!
//! A `ResultAggregator` expects N completions (successes and failures alike)
//! and delivers exactly one terminal result once the N-th completion lands:
//! - Every completion bumps an atomic counter after recording its payload;
//!   the call that moves the counter to N (or beyond, for N = 0) finishes.
//! - The terminal listener is taken out of its slot when fired, so it can
//!   never run twice however completions race.
//! - With `return_on_partial_results`, or when nothing failed, successes are
//!   merged; zero successes is a "no response" failure. Otherwise one failure
//!   lists every collected error.

use parking_lot::Mutex;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::error;

/// Associative, order-independent reduction over partial results
pub trait Mergeable: Sized {
    fn merge(self, other: Self) -> Self;
}

#[derive(Debug, Error)]
pub enum AggregateError<E> {
    #[error("No response collected")]
    NoResponse { errors: Vec<E> },
    #[error("{message}")]
    Failed { message: String, errors: Vec<E> },
}

impl<E> AggregateError<E> {
    pub fn errors(&self) -> &[E] {
        match self {
            Self::NoResponse { errors } | Self::Failed { errors, .. } => errors,
        }
    }

    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::NoResponse { .. })
    }
}

pub type AggregateResult<T, E> = Result<T, AggregateError<E>>;

type Listener<T, E> = Box<dyn FnOnce(AggregateResult<T, E>) + Send>;

pub struct ResultAggregator<T, E> {
    expected: usize,
    collected: AtomicUsize,
    successes: Mutex<Vec<T>>,
    errors: Mutex<Vec<E>>,
    final_error_msg: String,
    return_on_partial_results: bool,
    listener: Mutex<Option<Listener<T, E>>>,
}

impl<T, E> ResultAggregator<T, E>
where
    T: Mergeable + Send + 'static,
    E: Display + Send + 'static,
{
    pub fn new<F>(
        expected: usize,
        final_error_msg: impl Into<String>,
        return_on_partial_results: bool,
        listener: F,
    ) -> Self
    where
        F: FnOnce(AggregateResult<T, E>) + Send + 'static,
    {
        Self {
            expected,
            collected: AtomicUsize::new(0),
            successes: Mutex::new(Vec::with_capacity(expected)),
            errors: Mutex::new(Vec::new()),
            final_error_msg: final_error_msg.into(),
            return_on_partial_results,
            listener: Mutex::new(Some(Box::new(listener))),
        }
    }

    /// Aggregator whose terminal result is delivered on a oneshot channel
    pub fn with_channel(
        expected: usize,
        final_error_msg: impl Into<String>,
        return_on_partial_results: bool,
    ) -> (Self, oneshot::Receiver<AggregateResult<T, E>>) {
        let (tx, rx) = oneshot::channel();
        let aggregator =
            Self::new(expected, final_error_msg, return_on_partial_results, move |result| {
                let _ = tx.send(result);
            });
        (aggregator, rx)
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Completions seen so far
    pub fn collected(&self) -> usize {
        self.collected.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.listener.lock().is_none()
    }

    pub fn on_response(&self, response: T) {
        self.successes.lock().push(response);
        self.complete();
    }

    pub fn on_failure(&self, error: E) {
        self.errors.lock().push(error);
        self.complete();
    }

    fn complete(&self) {
        let seen = self.collected.fetch_add(1, Ordering::AcqRel) + 1;
        if seen >= self.expected {
            self.finish();
        }
    }

    fn finish(&self) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        let successes = std::mem::take(&mut *self.successes.lock());
        let errors = std::mem::take(&mut *self.errors.lock());
        listener(self.decide(successes, errors));
    }

    fn decide(&self, successes: Vec<T>, errors: Vec<E>) -> AggregateResult<T, E> {
        if self.return_on_partial_results || errors.is_empty() {
            if !errors.is_empty() {
                error!(
                    errors = %ErrorList(&errors),
                    "Although returning result, there exist exceptions"
                );
            }
            match successes.into_iter().reduce(Mergeable::merge) {
                Some(merged) => Ok(merged),
                None => Err(AggregateError::NoResponse { errors }),
            }
        } else {
            let message = format!("{} Exceptions: {}", self.final_error_msg, ErrorList(&errors));
            error!(%message, "Aggregated sub-request failures");
            Err(AggregateError::Failed { message, errors })
        }
    }
}

/// Renders as `[a, b, c]`
struct ErrorList<'a, E>(&'a [E]);

impl<E: Display> Display for ErrorList<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", e)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NO_RESPONSE;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct Sum(u64);

    impl Mergeable for Sum {
        fn merge(self, other: Self) -> Self {
            Sum(self.0 + other.0)
        }
    }

    fn run(partial: bool, successes: &[u64], failures: &[&str]) -> AggregateResult<Sum, String> {
        let n = successes.len() + failures.len();
        let (aggregator, mut rx) =
            ResultAggregator::with_channel(n, "Failed to score entities.", partial);
        for s in successes {
            aggregator.on_response(Sum(*s));
        }
        for f in failures {
            aggregator.on_failure(f.to_string());
        }
        rx.try_recv().expect("terminal result delivered")
    }

    #[test]
    fn test_partial_results_merge_successes() {
        let result = run(true, &[1, 2, 3], &["timeout", "refused"]);
        assert_eq!(result.unwrap(), Sum(6));
    }

    #[test]
    fn test_strict_mode_lists_every_error() {
        let err = run(false, &[1, 2, 3], &["timeout", "refused"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to score entities. Exceptions: [timeout, refused]"
        );
        assert_eq!(err.errors().len(), 2);
    }

    #[test]
    fn test_single_failure_is_no_response() {
        let err = run(true, &[], &["boom"]).unwrap_err();
        assert!(err.is_no_response());
        assert_eq!(err.to_string(), NO_RESPONSE);
    }

    #[test]
    fn test_all_success_in_strict_mode() {
        assert_eq!(run(false, &[4, 5], &[]).unwrap(), Sum(9));
    }

    #[test]
    fn test_zero_expected_finishes_on_first_completion() {
        let (aggregator, mut rx) = ResultAggregator::<Sum, String>::with_channel(0, "x", true);
        assert!(!aggregator.is_finished());
        aggregator.on_response(Sum(7));
        assert_eq!(rx.try_recv().unwrap().unwrap(), Sum(7));
        aggregator.on_response(Sum(1));
        assert_eq!(aggregator.collected(), 2);
    }

    #[test]
    fn test_nothing_delivered_before_n() {
        let (aggregator, mut rx) = ResultAggregator::<Sum, String>::with_channel(3, "x", true);
        aggregator.on_response(Sum(1));
        aggregator.on_failure("e".into());
        assert!(rx.try_recv().is_err());
        aggregator.on_response(Sum(1));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_concurrent_completions_deliver_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let (f, t) = (fired.clone(), total.clone());
        let aggregator = ResultAggregator::<Sum, String>::new(64, "x", true, move |result| {
            f.fetch_add(1, Ordering::SeqCst);
            t.store(result.map(|s| s.0 as usize).unwrap_or(0), Ordering::SeqCst);
        });
        let aggregator = Arc::new(aggregator);

        let threads: Vec<_> = (0..64)
            .map(|i| {
                let aggregator = aggregator.clone();
                std::thread::spawn(move || {
                    if i % 4 == 0 {
                        aggregator.on_failure(format!("e{}", i));
                    } else {
                        aggregator.on_response(Sum(1));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(total.load(Ordering::SeqCst), 48);
    }
}
