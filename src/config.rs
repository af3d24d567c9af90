use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::models::WorkerId;
use crate::scheduler::NothingToDequeueBehavior;

/// Durations are written as (fractional) seconds in configuration files.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Settings of a [`QueueServer`](crate::server::QueueServer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueServerConfig {
    /// How many times a failed test entry is re-run. An entry is attempted at most
    /// `number_of_retries + 1` times.
    pub number_of_retries: u32,

    /// How often workers are expected to report that they are alive.
    #[serde(with = "duration_secs")]
    pub report_alive_interval: Duration,

    /// Grace on top of `report_alive_interval` before a worker counts as silent.
    #[serde(with = "duration_secs")]
    pub additional_time_to_perform_worker_is_alive_report: Duration,

    pub nothing_to_dequeue_behavior: NothingToDequeueBehavior,

    /// Period of the background sweep that re-enqueues buckets of dead workers.
    #[serde(with = "duration_secs")]
    pub stuck_bucket_poll_interval: Duration,

    /// Workers expected to exist; reported as not registered until they register.
    pub known_worker_ids: Vec<WorkerId>,

    /// Dashboard is not started when unset.
    pub dashboard_addr: Option<SocketAddr>,
}

impl Default for QueueServerConfig {
    fn default() -> Self {
        Self {
            number_of_retries: 0,
            report_alive_interval: Duration::from_secs(30),
            additional_time_to_perform_worker_is_alive_report: Duration::from_secs(30),
            nothing_to_dequeue_behavior: NothingToDequeueBehavior::default(),
            stuck_bucket_poll_interval: Duration::from_secs(5),
            known_worker_ids: Vec::new(),
            dashboard_addr: None,
        }
    }
}

impl QueueServerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            QueueError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            QueueError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stuck_bucket_poll_interval.is_zero() {
            return Err(QueueError::InvalidConfig(
                "stuck_bucket_poll_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// `None` when the sum overflows, in which case workers never become silent.
    pub fn maximum_silence_duration(&self) -> Option<Duration> {
        self.report_alive_interval
            .checked_add(self.additional_time_to_perform_worker_is_alive_report)
    }

    pub fn with_number_of_retries(mut self, number_of_retries: u32) -> Self {
        self.number_of_retries = number_of_retries;
        self
    }

    pub fn with_report_alive_interval(mut self, interval: Duration) -> Self {
        self.report_alive_interval = interval;
        self
    }

    pub fn with_additional_time_to_perform_worker_is_alive_report(
        mut self,
        additional: Duration,
    ) -> Self {
        self.additional_time_to_perform_worker_is_alive_report = additional;
        self
    }

    pub fn with_nothing_to_dequeue_behavior(mut self, behavior: NothingToDequeueBehavior) -> Self {
        self.nothing_to_dequeue_behavior = behavior;
        self
    }

    pub fn with_stuck_bucket_poll_interval(mut self, interval: Duration) -> Self {
        self.stuck_bucket_poll_interval = interval;
        self
    }

    pub fn with_known_worker(mut self, worker_id: impl Into<WorkerId>) -> Self {
        self.known_worker_ids.push(worker_id.into());
        self
    }

    pub fn with_dashboard_addr(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }
}
