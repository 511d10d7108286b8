//! Escalating retry timers.
//!
//! A sequence waits `delays[i]`, invokes `step(i, total)`, and moves on to the
//! next delay. Once every delay has elapsed it invokes `abort()` exactly once.
//! Cancelling through the [`RetryHandle`] stops the pending timer without
//! invoking either callback. The handle exposes the cursor so a sequence built
//! from recomputed delays can resume where the old one stood.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryHandle {
    token: CancellationToken,
    cursor: Arc<AtomicUsize>,
    total: usize,
}

impl RetryHandle {
    /// Idempotent; safe to call after the sequence finished.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Index of the next delay to wait on, i.e. the number of steps fired.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

pub fn start_sequence<S, A>(
    delays: Vec<Duration>,
    resume_from: usize,
    mut step: S,
    abort: A,
) -> RetryHandle
where
    S: FnMut(usize, usize) + Send + 'static,
    A: FnOnce() + Send + 'static,
{
    let total = delays.len();
    let start = resume_from.min(total);
    let token = CancellationToken::new();
    let cursor = Arc::new(AtomicUsize::new(start));

    let task_token = token.clone();
    let task_cursor = Arc::clone(&cursor);
    tokio::spawn(async move {
        for (index, delay) in delays.into_iter().enumerate().skip(start) {
            tokio::select! {
                _ = task_token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if task_token.is_cancelled() {
                return;
            }
            step(index, total);
            task_cursor.store(index + 1, Ordering::SeqCst);
        }
        if !task_token.is_cancelled() {
            abort();
        }
    });

    RetryHandle {
        token,
        cursor,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn steps_in_order_then_aborts_once() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let aborts = Arc::new(AtomicUsize::new(0));
        let started = tokio::time::Instant::now();

        let handle = {
            let steps = Arc::clone(&steps);
            let aborts = Arc::clone(&aborts);
            start_sequence(
                ms(&[100, 200, 400]),
                0,
                move |index, total| steps.lock().push((index, total, started.elapsed())),
                move || {
                    aborts.fetch_add(1, Ordering::SeqCst);
                },
            )
        };

        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(aborts.load(Ordering::SeqCst), 0, "abort fired before last delay");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = steps.lock().clone();
        assert_eq!(
            seen.iter().map(|(i, t, _)| (*i, *t)).collect::<Vec<_>>(),
            vec![(0, 3), (1, 3), (2, 3)]
        );
        assert!(seen[0].2 >= Duration::from_millis(100));
        assert!(seen[2].2 >= Duration::from_millis(700));
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
        assert_eq!(handle.cursor(), 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_silent_and_idempotent() {
        let fired = Arc::new(AtomicBool::new(false));
        let handle = {
            let on_step = Arc::clone(&fired);
            let on_abort = Arc::clone(&fired);
            start_sequence(
                ms(&[100, 100]),
                0,
                move |_, _| on_step.store(true, Ordering::SeqCst),
                move || on_abort.store(true, Ordering::SeqCst),
            )
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_cursor() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let old = {
            let steps = Arc::clone(&steps);
            start_sequence(ms(&[10, 10, 10, 10, 10]), 0, move |i, _| steps.lock().push(i), || {})
        };
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(old.cursor(), 2);
        old.cancel();

        let resumed = {
            let steps = Arc::clone(&steps);
            start_sequence(
                ms(&[50, 50, 50, 50, 50]),
                old.cursor(),
                move |i, _| steps.lock().push(i),
                || {},
            )
        };
        assert_eq!(resumed.cursor(), 2);
        tokio::time::sleep(Duration::from_millis(55)).await;
        assert_eq!(steps.lock().clone(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn resuming_past_the_end_aborts_immediately() {
        let aborted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&aborted);
        start_sequence(ms(&[10]), 4, |_, _| {}, move || flag.store(true, Ordering::SeqCst));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(aborted.load(Ordering::SeqCst));
    }
}
