//! Error types for turnpool.

use nix::sys::signal::Signal;
use thiserror::Error;

/// Main error type for turnpool.
///
/// Every variant here is a setup or syscall fault. Protocol-level oddities
/// (unmatched PIDs, stale acknowledgments) are logged and scored as missing
/// results instead of being raised as errors, and worker task anomalies are
/// counted outcomes, not errors at all.
#[derive(Error, Debug)]
pub enum TurnpoolError {
    #[error("Failed to install handler for {signal:?}: {source}")]
    HandlerInstall { signal: Signal, source: nix::Error },

    #[error("Failed to adjust the signal mask: {0}")]
    Mask(#[source] nix::Error),

    #[error("Failed to spawn worker {ordinal}: {source}")]
    Spawn { ordinal: usize, source: std::io::Error },

    #[error("Failed to signal pid {pid} with {signal:?}: {source}")]
    Notify {
        pid: i32,
        signal: Signal,
        source: nix::Error,
    },

    #[error("Failed to reap children: {0}")]
    Reap(#[source] nix::Error),
}

/// Result type alias for turnpool operations.
pub type Result<T> = std::result::Result<T, TurnpoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn test_handler_install_error_message() {
        let err = TurnpoolError::HandlerInstall {
            signal: Signal::SIGUSR1,
            source: Errno::EINVAL,
        };
        let msg = err.to_string();
        assert!(msg.contains("SIGUSR1"));
        assert!(msg.contains("install"));
    }

    #[test]
    fn test_spawn_error_message() {
        let err = TurnpoolError::Spawn {
            ordinal: 3,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary"),
        };
        let msg = err.to_string();
        assert!(msg.contains("worker 3"));
        assert!(msg.contains("no such binary"));
    }

    #[test]
    fn test_notify_error_message() {
        let err = TurnpoolError::Notify {
            pid: 4242,
            signal: Signal::SIGUSR2,
            source: Errno::EPERM,
        };
        let msg = err.to_string();
        assert!(msg.contains("4242"));
        assert!(msg.contains("SIGUSR2"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(7)
        }
        assert_eq!(returns_ok().unwrap(), 7);
    }
}
