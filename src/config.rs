// Copyright 2025 Cowboy AI, LLC.

//! Engine configuration

use crate::errors::{DeltaError, DeltaResult};
use crate::lock::KvLockConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for a [`DeltaEngine`](crate::DeltaEngine) and its NATS adapters
///
/// Missing fields take their default when loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a command waits for its workflow lock, in milliseconds
    pub lock_timeout_ms: u64,

    /// Subject prefix for client notifications; the workflow ID is appended
    pub notification_subject_prefix: String,

    /// JetStream subject receiving recompute requests
    pub recompute_subject: String,

    /// Key-value bucket used by the cross-process lock
    pub lock_bucket: String,

    /// Lifetime of a lock abandoned by a crashed holder, in seconds; held
    /// locks are renewed every third of it
    pub lock_ttl_secs: u64,

    /// Delay between attempts on a contended cross-process lock, in milliseconds
    pub lock_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            notification_subject_prefix: "workflows.deltas".to_string(),
            recompute_subject: "workflows.render".to_string(),
            lock_bucket: "workflow-locks".to_string(),
            lock_ttl_secs: 30,
            lock_poll_interval_ms: 25,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document, validating the result
    pub fn from_json_str(json: &str) -> DeltaResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> DeltaResult<()> {
        if self.lock_timeout_ms == 0 {
            return Err(DeltaError::validation("lock_timeout_ms must be positive"));
        }
        if self.lock_ttl_secs == 0 {
            return Err(DeltaError::validation("lock_ttl_secs must be positive"));
        }
        if self.notification_subject_prefix.is_empty() || self.recompute_subject.is_empty() {
            return Err(DeltaError::validation("NATS subjects must not be empty"));
        }
        if self.lock_ttl_secs.saturating_mul(1_000) <= self.lock_timeout_ms {
            return Err(DeltaError::validation(
                "lock_ttl_secs must outlast lock_timeout_ms",
            ));
        }
        Ok(())
    }

    /// Set the lock wait timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the notification subject prefix
    pub fn with_notification_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.notification_subject_prefix = prefix.into();
        self
    }

    /// Set the recompute subject
    pub fn with_recompute_subject(mut self, subject: impl Into<String>) -> Self {
        self.recompute_subject = subject.into();
        self
    }

    /// Set the lock bucket name
    pub fn with_lock_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.lock_bucket = bucket.into();
        self
    }

    /// Lock wait timeout
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Settings for [`NatsKvLockManager`](crate::lock::NatsKvLockManager)
    pub fn kv_lock_config(&self) -> KvLockConfig {
        KvLockConfig {
            bucket: self.lock_bucket.clone(),
            ttl: Duration::from_secs(self.lock_ttl_secs),
            poll_interval: Duration::from_millis(self.lock_poll_interval_ms),
        }
    }
}
