//! Transport-level failures, convertible into the run-wide taxonomy.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("failed to spawn service process: {0}")]
    Spawn(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout { operation: String, timeout: Duration },

    #[error("invocation failed: {0}")]
    Invocation(String),

    #[error("channel closed")]
    Closed,
}

impl TransportError {
    /// Attach the service name and lift into [`dayline_core::Error`].
    pub fn for_service(self, service: &str) -> dayline_core::Error {
        let service = service.to_string();
        match self {
            Self::Spawn(reason) => dayline_core::Error::Spawn { service, reason },
            Self::Handshake(reason) => dayline_core::Error::Handshake { service, reason },
            Self::Timeout { operation, timeout } => dayline_core::Error::Timeout {
                service,
                operation,
                timeout_ms: timeout.as_millis() as u64,
            },
            Self::Invocation(reason) => dayline_core::Error::Invocation { service, reason },
            Self::Closed => dayline_core::Error::Invocation {
                service,
                reason: "channel closed".into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_service_maps_taxonomy() {
        let err = TransportError::Timeout {
            operation: "caption_image".into(),
            timeout: Duration::from_millis(1500),
        }
        .for_service("caption");
        match err {
            dayline_core::Error::Timeout {
                service,
                timeout_ms,
                ..
            } => {
                assert_eq!(service, "caption");
                assert_eq!(timeout_ms, 1500);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            TransportError::Closed.for_service("exif"),
            dayline_core::Error::Invocation { .. }
        ));
    }
}
