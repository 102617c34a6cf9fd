use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Clock is the replica's only source of time, so role logic can run against a mocked clock.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep_until(&self, deadline: Instant);
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// A clock that only moves when its controller says so.
pub fn mocked_clock() -> (MockClock, MockClockController) {
    let now = Instant::now();
    let (tx, rx) = watch::channel(now);
    let sleeper = MockClock { current_time: rx };
    let controller = MockClockController {
        current_time: tx,
        time_of_instantiation: now,
    };

    (sleeper, controller)
}

#[derive(Clone)]
pub struct MockClock {
    current_time: watch::Receiver<Instant>,
}

#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.current_time.borrow()
    }

    async fn sleep_until(&self, deadline: Instant) {
        let mut current_time = self.current_time.clone();
        loop {
            if *current_time.borrow() >= deadline {
                return;
            }

            if current_time.changed().await.is_err() {
                // Controller dropped, time will never move again.
                std::future::pending::<()>().await;
            }
        }
    }
}

pub struct MockClockController {
    current_time: watch::Sender<Instant>,
    time_of_instantiation: Instant,
}

impl MockClockController {
    pub fn current_time(&self) -> Instant {
        *self.current_time.borrow()
    }

    pub fn elapsed_time(&self) -> Duration {
        self.current_time() - self.time_of_instantiation
    }

    /// Advancing by large steps of time can cause surprising behavior in `sleep_until()` usage.
    /// The only promise of mock `sleep_until` is that it will return when `now` is at or past
    /// the `deadline`. In general, advance the mock clock at much smaller increments than the
    /// granularity at which you wish to observe things. Much like a real clock.
    pub fn advance(&mut self, duration: Duration) {
        let new_now = *self.current_time.borrow() + duration;
        // Receivers may all be gone; time still moves for `current_time()`.
        let _ = self.current_time.send(new_now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn clones_share_the_controllers_time() {
        let (clock, mut controller) = mocked_clock();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let start = clock.now();

        controller.advance(Duration::from_millis(250));

        assert_eq!(shared.now(), start + Duration::from_millis(250));
        assert_eq!(clock.now(), controller.current_time());
        assert_eq!(controller.elapsed_time(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn sleeper_wakes_only_once_deadline_passes() {
        // -- setup --
        let (clock, mut controller) = mocked_clock();
        let deadline = clock.now() + Duration::from_millis(100);
        let sleeper = tokio::spawn(async move { clock.sleep_until(deadline).await });

        // -- execute & verify --
        controller.advance(Duration::from_millis(60));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        controller.advance(Duration::from_millis(60));
        tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("Sleeper should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_controller_never_wakes_sleeper() {
        let (clock, controller) = mocked_clock();
        let deadline = clock.now() + Duration::from_millis(1);
        drop(controller);

        tokio::time::timeout(Duration::from_millis(50), clock.sleep_until(deadline))
            .await
            .expect_err("Expected timeout");
    }
}
