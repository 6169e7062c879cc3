//! Runtime configuration for an [`ActorSystem`](crate::system::ActorSystem).
//!
//! [`SystemConfig`] derives serde's traits so it can be embedded in an application's own
//! configuration file. Durations are written as integer milliseconds, except the supervision
//! window, which is written in seconds.
//!
//! ```
//! use kestrel::config::SystemConfig;
//!
//! let config: SystemConfig = serde_json::from_str(r#"{ "call_timeout_ms": 250 }"#).unwrap();
//! assert_eq!(config.call_timeout.as_millis(), 250);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{mailbox::MailboxConfig, supervision::SupervisorSpec};

/// The default timeout applied to calls that don't set one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// The default period between metrics events.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(1);
/// The default capacity of the system event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
/// The default queue capacity of pub/sub subscribers.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Configuration for an actor system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Mailbox used for actors spawned without an explicit one.
    pub mailbox: MailboxConfig,
    /// Timeout applied to calls that don't set one.
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
    /// Period between [`SystemEvent::Metrics`](crate::event::SystemEvent::Metrics) events, or
    /// `None` to disable the ticker.
    #[serde(rename = "metrics_interval_ms", with = "opt_millis")]
    pub metrics_interval: Option<Duration>,
    /// Capacity of the system event channel. Slow event subscribers skip events beyond this.
    pub event_capacity: usize,
    /// Queue capacity of subscribers created by [`PubSub`](crate::pubsub::PubSub) buses
    /// obtained from the system.
    pub subscriber_capacity: usize,
    /// Supervision strategy used by actors that supervise children without specifying one.
    pub supervisor: SupervisorSpec,
}

impl SystemConfig {
    /// Sets the default mailbox.
    pub fn with_mailbox(mut self, mailbox: MailboxConfig) -> Self {
        self.mailbox = mailbox;
        self
    }

    /// Sets the default call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the metrics period. `None` disables the metrics ticker.
    pub fn with_metrics_interval(mut self, interval: Option<Duration>) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Sets the system event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets the pub/sub subscriber capacity.
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    /// Sets the default supervision strategy.
    pub fn with_supervisor(mut self, supervisor: SupervisorSpec) -> Self {
        self.supervisor = supervisor;
        self
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            mailbox: MailboxConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            metrics_interval: Some(DEFAULT_METRICS_INTERVAL),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            supervisor: SupervisorSpec::default(),
        }
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => super::millis::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
