//! Scheduler configuration.
//!
//! ```
//! use std::time::Duration;
//! use tether_core::scheduler::SchedulerConfig;
//!
//! let cfg = SchedulerConfig::from_json(r#"{ "idle_interval_ms": 5 }"#).unwrap();
//! assert_eq!(cfg.idle_interval, Duration::from_millis(5));
//! assert_eq!(cfg.thread_name, "tether-scheduler");
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long the worker sleeps when the queue is empty. A new task wakes it early.
    #[serde(rename = "idle_interval_ms", with = "millis")]
    pub idle_interval: Duration,
    /// Name given to the worker thread.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    /// - `idle_interval = 10ms`
    /// - `thread_name = "tether-scheduler"`
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(10),
            thread_name: "tether-scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
