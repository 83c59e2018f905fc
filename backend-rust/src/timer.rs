use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// A one-shot scheduled callback owned by the entity it acts on.
///
/// The callback receives the timer's nonce and must confirm that the entity
/// still holds a timer with that nonce before acting: aborting a task that is
/// already past its sleep does not stop it.
#[derive(Debug)]
pub struct Timer {
    pub nonce: Uuid,
    pub deadline: Instant,
    handle: JoinHandle<()>,
}

impl Timer {
    pub fn spawn<F, Fut>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce(Uuid) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let nonce = Uuid::new_v4();
        let deadline = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            callback(nonce).await;
        });
        Self {
            nonce,
            deadline,
            handle,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = Timer::spawn(Duration::from_secs(5), move |_| async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!timer.is_due(Instant::now()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timer.is_due(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = Timer::spawn(Duration::from_secs(5), move |_| async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
