use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs for a cluster client. All optional; `None` means "use the
/// default".
#[derive(Clone, Default)]
pub struct CoherenceOptions {
    /// Cadence of presence announcements on the discovery channel.
    pub heartbeat_interval: Option<Duration>,
    /// How long a peer may stay silent before it is evicted. Must exceed the
    /// heartbeat interval.
    pub staleness_timeout: Option<Duration>,
    /// Flush cadence of each async cache's replication queue.
    pub async_batch_interval: Option<Duration>,
    /// Per-cache async queue bound; overflow sheds oldest messages.
    pub async_queue_capacity: Option<usize>,
    /// Pause between failed store-creation attempts during rejoin.
    pub rejoin_retry_delay: Option<Duration>,
    /// Minimum spacing of rejoin failure log lines.
    pub rejoin_log_interval: Option<Duration>,
    /// How long the Timeout NonStop policy blocks for recovery.
    pub nonstop_timeout: Option<Duration>,
    /// Bound on one peer RPC call, connect included.
    pub rpc_call_timeout: Option<Duration>,
    /// Target byte size of one bootstrap page.
    pub bootstrap_chunk_target_bytes: Option<usize>,
    /// How long store disposal may run before it is abandoned.
    pub dispose_grace: Option<Duration>,
}

pub(super) struct CoherenceOptionsValidated {
    pub heartbeat_interval: Duration,
    pub staleness_timeout: Duration,
    pub async_batch_interval: Duration,
    pub async_queue_capacity: usize,
    pub rejoin_retry_delay: Duration,
    pub rejoin_log_interval: Duration,
    pub nonstop_timeout: Duration,
    pub rpc_call_timeout: Duration,
    pub bootstrap_chunk_target_bytes: usize,
    pub dispose_grace: Duration,
}

impl CoherenceOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.staleness_timeout <= self.heartbeat_interval {
            return Err("Staleness timeout must be greater than the heartbeat interval");
        }
        let durations = [
            self.heartbeat_interval,
            self.async_batch_interval,
            self.rejoin_retry_delay,
            self.rejoin_log_interval,
            self.nonstop_timeout,
            self.rpc_call_timeout,
            self.dispose_grace,
        ];
        if durations.iter().any(|d| d.as_nanos() == 0) {
            return Err("Durations must be non-zero");
        }
        if self.async_queue_capacity == 0 {
            return Err("Async queue capacity must be non-zero");
        }
        if self.bootstrap_chunk_target_bytes == 0 {
            return Err("Bootstrap chunk target must be non-zero");
        }

        Ok(())
    }
}

impl TryFrom<CoherenceOptions> for CoherenceOptionsValidated {
    type Error = &'static str;

    fn try_from(options: CoherenceOptions) -> Result<Self, Self::Error> {
        let heartbeat_interval = options.heartbeat_interval.unwrap_or(Duration::from_secs(1));
        let values = CoherenceOptionsValidated {
            heartbeat_interval,
            staleness_timeout: options.staleness_timeout.unwrap_or(heartbeat_interval * 5),
            async_batch_interval: options.async_batch_interval.unwrap_or(Duration::from_secs(1)),
            async_queue_capacity: options.async_queue_capacity.unwrap_or(10_000),
            rejoin_retry_delay: options.rejoin_retry_delay.unwrap_or(Duration::from_secs(5)),
            rejoin_log_interval: options.rejoin_log_interval.unwrap_or(Duration::from_secs(30)),
            nonstop_timeout: options.nonstop_timeout.unwrap_or(Duration::from_secs(5)),
            rpc_call_timeout: options.rpc_call_timeout.unwrap_or(Duration::from_secs(10)),
            bootstrap_chunk_target_bytes: options
                .bootstrap_chunk_target_bytes
                .unwrap_or(5 * 1024 * 1024),
            dispose_grace: options.dispose_grace.unwrap_or(Duration::from_secs(5)),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = CoherenceOptionsValidated::try_from(CoherenceOptions::default()).unwrap();
        assert_eq!(validated.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(validated.staleness_timeout, Duration::from_secs(5));
        assert_eq!(validated.async_queue_capacity, 10_000);
    }

    #[test]
    fn staleness_must_exceed_heartbeat() {
        let options = CoherenceOptions {
            heartbeat_interval: Some(Duration::from_secs(2)),
            staleness_timeout: Some(Duration::from_secs(2)),
            ..CoherenceOptions::default()
        };
        assert!(CoherenceOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn zero_duration_is_rejected() {
        let options = CoherenceOptions {
            nonstop_timeout: Some(Duration::from_secs(0)),
            ..CoherenceOptions::default()
        };
        assert!(CoherenceOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn staleness_defaults_to_five_heartbeats() {
        let options = CoherenceOptions {
            heartbeat_interval: Some(Duration::from_millis(200)),
            ..CoherenceOptions::default()
        };
        let validated = CoherenceOptionsValidated::try_from(options).unwrap();
        assert_eq!(validated.staleness_timeout, Duration::from_secs(1));
    }
}
