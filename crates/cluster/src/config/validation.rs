use super::types::ClusterConfig;
use crate::error::ClusterError;

/// Upper bound for any single wait: one week.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

impl ClusterConfig {
    /// Validate the config: every wait must be non-zero and at most
    /// [`MAX_TIMEOUT_SECS`], and a sub must dial at least once.
    pub fn validate(&self) -> Result<(), ClusterError> {
        self.validate_timeouts()?;
        self.validate_connect_attempts()?;
        Ok(())
    }

    fn validate_timeouts(&self) -> Result<(), ClusterError> {
        let timeouts = [
            ("accept_timeout_secs", self.accept_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("assignment_timeout_secs", self.assignment_timeout_secs),
            ("dispatch_timeout_secs", self.dispatch_timeout_secs),
            ("collect_timeout_secs", self.collect_timeout_secs),
            ("report_timeout_secs", self.report_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ClusterError::Config(format!(
                    "cluster.{name} must be greater than 0"
                )));
            }
            if value > MAX_TIMEOUT_SECS {
                return Err(ClusterError::Config(format!(
                    "cluster.{name} = {value} exceeds the {MAX_TIMEOUT_SECS}s limit"
                )));
            }
        }
        Ok(())
    }

    fn validate_connect_attempts(&self) -> Result<(), ClusterError> {
        if self.connect_attempts == 0 {
            return Err(ClusterError::Config(
                "cluster.connect_attempts must be at least 1".into(),
            ));
        }
        if self.connect_backoff_ms > MAX_TIMEOUT_SECS * 1000 {
            return Err(ClusterError::Config(format!(
                "cluster.connect_backoff_ms = {} exceeds the {MAX_TIMEOUT_SECS}s limit",
                self.connect_backoff_ms
            )));
        }
        Ok(())
    }
}
