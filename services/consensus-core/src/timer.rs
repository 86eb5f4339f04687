use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;

use crate::node::Event;

/// Single-shot request timer. Expiry is posted to the replica's event queue
/// as `Event::RequestTimeout`; every start or stop bumps the generation so an
/// expiry that was already queued can be recognised as stale.
#[derive(Debug)]
pub struct RequestTimer {
    timeout: Duration,
    events: WeakUnboundedSender<Event>,
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl RequestTimer {
    pub fn new(timeout: Duration, events: WeakUnboundedSender<Event>) -> Self {
        Self { timeout, events, handle: None, generation: 0 }
    }

    /// True from `start` until the expiry is consumed by `fire` or cancelled by
    /// `stop`, including while a posted expiry waits in the queue.
    pub fn is_running(&self) -> bool { self.handle.is_some() }

    /// Arm the timer. Without `override_existing` a running timer is left alone.
    pub fn start(&mut self, override_existing: bool) {
        if self.is_running() && !override_existing {
            return;
        }
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let timeout = self.timeout;
        let events = self.events.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(Event::RequestTimeout { generation });
            }
        }));
        tracing::debug!(generation, timeout_ms = timeout.as_millis() as u64, "request_timer_started");
    }

    /// Safe to call when nothing is armed.
    pub fn stop(&mut self) {
        if self.cancel() {
            self.generation += 1;
            tracing::debug!(generation = self.generation, "request_timer_stopped");
        }
    }

    /// Consume an expiry. Returns false when it was superseded by a later start or stop.
    pub fn fire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        true
    }

    fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(h) => {
                h.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) { self.cancel(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn expect_timeout(event: Option<Event>) -> u64 {
        match event {
            Some(Event::RequestTimeout { generation }) => generation,
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_posted_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RequestTimer::new(Duration::from_secs(5), tx.downgrade());
        timer.start(false);
        assert!(timer.is_running());
        let generation = expect_timeout(rx.recv().await);
        assert!(timer.fire(generation));
        assert!(!timer.fire(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn non_overriding_start_keeps_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RequestTimer::new(Duration::from_secs(5), tx.downgrade());
        timer.start(false);
        tokio::time::advance(Duration::from_secs(3)).await;
        timer.start(false);
        let started = tokio::time::Instant::now();
        let generation = expect_timeout(rx.recv().await);
        assert!(started.elapsed() <= Duration::from_secs(2));
        assert!(timer.fire(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_invalidates_queued_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RequestTimer::new(Duration::from_millis(10), tx.downgrade());
        timer.start(false);
        let generation = expect_timeout(rx.recv().await);
        timer.stop();
        assert!(!timer.fire(generation));
        timer.stop();
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_expiry_survives_non_overriding_start() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RequestTimer::new(Duration::from_millis(10), tx.downgrade());
        timer.start(false);
        let generation = expect_timeout(rx.recv().await);
        assert!(timer.is_running());
        timer.start(false);
        assert_eq!(timer.generation, generation);
        assert!(timer.fire(generation));
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn override_restarts_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RequestTimer::new(Duration::from_secs(1), tx.downgrade());
        timer.start(false);
        let first = timer.generation;
        timer.start(true);
        assert_eq!(timer.generation, first + 1);
        let generation = expect_timeout(rx.recv().await);
        assert_eq!(generation, first + 1);
        assert!(timer.fire(generation));
    }
}
