//! Wake signals for polling loops
//!
//! A [`Waker`] either ticks on an interval or, in tests, fires only when the
//! paired [`TestWaker`] says so. Loops call [`Waker::wait`] between polls.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
struct State {
    generation: u64,
    /// Loops currently parked in `wait`
    waiting: usize,
    /// Total number of calls to `wait`
    entries: u64,
}

#[derive(Debug, Clone)]
enum Inner {
    Timed(Duration),
    Test(Arc<watch::Sender<State>>),
}

#[derive(Debug, Clone)]
pub struct Waker {
    inner: Inner,
}

impl Waker {
    /// Wake every `interval`
    pub fn timed(interval: Duration) -> Self {
        Waker {
            inner: Inner::Timed(interval),
        }
    }

    /// A waker driven by hand, and the handle that drives it
    pub fn test() -> (Waker, TestWaker) {
        let (tx, _) = watch::channel(State::default());
        let shared = Arc::new(tx);
        (
            Waker {
                inner: Inner::Test(Arc::clone(&shared)),
            },
            TestWaker { shared },
        )
    }

    /// Block until the next wake up
    pub async fn wait(&self) {
        match &self.inner {
            Inner::Timed(interval) => tokio::time::sleep(*interval).await,
            Inner::Test(shared) => {
                let mut rx = shared.subscribe();
                let mut seen = 0;
                shared.send_modify(|s| {
                    s.waiting += 1;
                    s.entries += 1;
                    seen = s.generation;
                });
                let _parked = Parked(shared);
                // the sender lives as long as `shared`, so this only returns on a wake
                let _ = rx.wait_for(|s| s.generation != seen).await;
            }
        }
    }
}

/// Decrements the parked count even when the wait is cancelled
struct Parked<'a>(&'a watch::Sender<State>);

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|s| s.waiting = s.waiting.saturating_sub(1));
    }
}

/// Handle that fires a test [`Waker`]
#[derive(Debug, Clone)]
pub struct TestWaker {
    shared: Arc<watch::Sender<State>>,
}

impl TestWaker {
    /// Release everything currently waiting
    pub fn wake(&self) {
        self.shared.send_modify(|s| s.generation += 1);
    }

    /// Wait for `n` loops to be parked, wake them, and return once all `n`
    /// have finished their iteration and parked again.
    pub async fn awaken(&self, n: usize) {
        let mut rx = self.shared.subscribe();
        let _ = rx.wait_for(|s| s.waiting >= n).await;

        let mut target = 0;
        self.shared.send_modify(|s| {
            s.generation += 1;
            target = s.entries + n as u64;
        });
        let _ = rx.wait_for(|s| s.entries >= target).await;
    }

    /// Loops currently parked
    pub fn waiting(&self) -> usize {
        self.shared.borrow().waiting
    }
}
