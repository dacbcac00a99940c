//! Controller configuration. The binary fills this from flags and `CORRAL_*` env vars.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Restrict watches to one namespace; `None` watches all.
    pub namespace: Option<String>,
    /// Initial value of the per-pass "updates allowed" policy.
    pub updates_allowed: bool,
    pub dns_servers: Vec<String>,
    pub ntp_servers: Vec<String>,
    /// Image running the compute unit.
    pub vm_image: String,
    pub resync_secs: u64,
    pub queue_cap: usize,
    pub retry: RetrySettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            updates_allowed: true,
            dns_servers: vec!["8.8.8.8".into(), "8.8.4.4".into()],
            ntp_servers: vec!["0.pool.ntp.org".into(), "1.pool.ntp.org".into()],
            vm_image: "quay.io/corral/k8s-vm:1.0.0".into(),
            resync_secs: 300,
            queue_cap: 2048,
            retry: RetrySettings::default(),
        }
    }
}

impl ControllerConfig {
    pub fn resync(&self) -> Duration { Duration::from_secs(self.resync_secs.max(1)) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self { Self { max_attempts: 3, initial_delay_ms: 100, max_delay_ms: 5_000 } }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ControllerConfig = serde_json::from_str(r#"{"updates_allowed": false, "retry": {"max_attempts": 5}}"#).unwrap();
        assert!(!cfg.updates_allowed);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.initial_delay_ms, 100);
        assert_eq!(cfg.queue_cap, 2048);
        assert_eq!(cfg.resync(), Duration::from_secs(300));
    }
}
