//! Utility module
//!
//! Logging setup and time helpers shared by the binary and device hosts.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing_subscriber::EnvFilter;

use crate::core::{Error, Result};

/// Installs the global `tracing` subscriber
///
/// `RUST_LOG` wins over `level` when set. Calling this again after a
/// subscriber is installed is a no-op.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| Error::config(format!("Invalid log level '{}': {}", level, e)))?,
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
    Ok(())
}

/// Converts a duration to a floating-point number of seconds
pub fn duration_to_secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Seconds since the epoch, the payload of time values
pub fn unix_time(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(duration_to_secs)
        .unwrap_or(0.0)
}

pub fn unix_now() -> f64 {
    unix_time(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_time() {
        let time = UNIX_EPOCH + Duration::from_millis(1500);
        assert_eq!(unix_time(time), 1.5);
        assert_eq!(unix_time(UNIX_EPOCH - Duration::from_secs(1)), 0.0);
        assert!(unix_now() > 1.0e9);
    }

    #[test]
    fn test_init_logging() {
        assert!(init_logging("debug").is_ok());
        // second call keeps the installed subscriber
        assert!(init_logging("info").is_ok());
    }
}
