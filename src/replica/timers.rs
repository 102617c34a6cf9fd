use rand::Rng;
use tokio::time::{Duration, Instant};

/// A uniformly random duration in `[base, base + jitter)`.
pub(crate) fn random_timeout(base: Duration, jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }

    base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

/// RandomizedTimeout is a one-shot deadline, re-randomized every time it is armed.
#[derive(Debug)]
pub(crate) struct RandomizedTimeout {
    base: Duration,
    jitter: Duration,
    deadline: Option<Instant>,
}

impl RandomizedTimeout {
    pub(crate) fn new(base: Duration, jitter: Duration) -> Self {
        RandomizedTimeout {
            base,
            jitter,
            deadline: None,
        }
    }

    pub(crate) fn arm(&mut self, now: Instant) -> Duration {
        let timeout = random_timeout(self.base, self.jitter);
        self.deadline = Some(now + timeout);
        timeout
    }

    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |deadline| now >= deadline)
    }
}
