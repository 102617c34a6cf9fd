use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct ReplicaOptions {
    /// Base of the follower's randomized heartbeat timeout.
    pub heartbeat_timeout: Option<Duration>,
    pub heartbeat_jitter: Option<Duration>,
    /// Base of the randomized election (and pre-vote round) timeout.
    pub election_timeout: Option<Duration>,
    pub election_jitter: Option<Duration>,
    /// Buffered entries are flushed at least this often.
    pub flush_interval: Option<Duration>,
    pub log_buffer_capacity: Option<usize>,
    /// How often the event loop drives the replica.
    pub tick_interval: Option<Duration>,
    /// Upper bound on committed entries published per tick.
    pub max_entries_per_tick: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct ReplicaOptionsValidated {
    pub heartbeat_timeout: Duration,
    pub heartbeat_jitter: Duration,
    pub election_timeout: Duration,
    pub election_jitter: Duration,
    pub flush_interval: Duration,
    pub log_buffer_capacity: usize,
    pub tick_interval: Duration,
    pub max_entries_per_tick: usize,
}

impl ReplicaOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heartbeat_jitter == Duration::from_millis(0) || self.election_jitter == Duration::from_millis(0) {
            return Err("Timeout jitter must be non-zero, or replicas will time out in lock step");
        }
        if self.heartbeat_jitter > self.heartbeat_timeout || self.election_jitter > self.election_timeout {
            return Err("Timeout jitter must not exceed its base timeout");
        }
        if self.tick_interval >= self.heartbeat_timeout || self.tick_interval >= self.election_timeout {
            return Err("Tick interval must be less than the heartbeat and election timeouts");
        }
        if self.log_buffer_capacity == 0 {
            return Err("Log buffer capacity must be non-zero");
        }
        if self.max_entries_per_tick == 0 {
            return Err("Max entries per tick must be non-zero");
        }

        Ok(())
    }
}

impl TryFrom<ReplicaOptions> for ReplicaOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ReplicaOptions) -> Result<Self, Self::Error> {
        let values = ReplicaOptionsValidated {
            heartbeat_timeout: options.heartbeat_timeout.unwrap_or(Duration::from_millis(350)),
            heartbeat_jitter: options.heartbeat_jitter.unwrap_or(Duration::from_millis(150)),
            election_timeout: options.election_timeout.unwrap_or(Duration::from_millis(350)),
            election_jitter: options.election_jitter.unwrap_or(Duration::from_millis(150)),
            flush_interval: options.flush_interval.unwrap_or(Duration::from_secs(2)),
            log_buffer_capacity: options.log_buffer_capacity.unwrap_or(64 * 1024),
            tick_interval: options.tick_interval.unwrap_or(Duration::from_millis(10)),
            max_entries_per_tick: options.max_entries_per_tick.unwrap_or(64),
        };

        values.validate()?;
        Ok(values)
    }
}
