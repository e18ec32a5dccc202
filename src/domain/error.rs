//! Error taxonomy for detection sessions
//!
//! Only `StreamUnavailable` ends a session. Everything else is absorbed by
//! the session loop with a log line and a short backoff.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectionError {
    /// Camera could not be opened `attempts` times in a row
    #[error("stream unavailable: {endpoint} failed to open {attempts} consecutive times")]
    StreamUnavailable { endpoint: String, attempts: u32 },

    /// Camera could not be opened, below the fatal threshold
    #[error("stream connect failed (attempt {attempt}/{max_attempts}): {reason}")]
    ConnectFailed { attempt: u32, max_attempts: u32, reason: String },

    /// Stream opened but yielded no usable frame
    #[error("no frame: {0}")]
    NoFrame(String),

    #[error("detector failure: {0}")]
    DetectorFailure(String),

    #[error("resolver failure: {0}")]
    ResolverFailure(String),

    #[error("geometry unavailable: {0}")]
    GeometryUnavailable(String),

    #[error("subscriber {subscriber} failed: {reason}")]
    SubscriberFailure { subscriber: String, reason: String },

    #[error("invalid canvas size {width}x{height}")]
    InvalidCanvas { width: u32, height: u32 },

    /// Session task died unexpectedly (panic)
    #[error("internal error: {0}")]
    Internal(String),

    #[error("cancelled")]
    Cancelled,
}

impl DetectionError {
    /// True when the session must terminate
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectionError::StreamUnavailable { .. })
    }

    /// Short machine-readable kind, used in logs and status payloads
    pub fn kind(&self) -> &'static str {
        match self {
            DetectionError::StreamUnavailable { .. } => "stream_unavailable",
            DetectionError::ConnectFailed { .. } => "connect_failed",
            DetectionError::NoFrame(_) => "no_frame",
            DetectionError::DetectorFailure(_) => "detector_failure",
            DetectionError::ResolverFailure(_) => "resolver_failure",
            DetectionError::GeometryUnavailable(_) => "geometry_unavailable",
            DetectionError::SubscriberFailure { .. } => "subscriber_failure",
            DetectionError::InvalidCanvas { .. } => "invalid_canvas",
            DetectionError::Internal(_) => "internal",
            DetectionError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_stream_unavailable_is_fatal() {
        let fatal = DetectionError::StreamUnavailable { endpoint: "rtsp://cam".into(), attempts: 5 };
        assert!(fatal.is_fatal());

        let transient = [
            DetectionError::ConnectFailed { attempt: 1, max_attempts: 5, reason: "refused".into() },
            DetectionError::NoFrame("empty".into()),
            DetectionError::DetectorFailure("503".into()),
            DetectionError::ResolverFailure("nan".into()),
            DetectionError::GeometryUnavailable("db down".into()),
        ];
        for err in transient {
            assert!(!err.is_fatal(), "{} should be transient", err.kind());
        }
    }

    #[test]
    fn test_display_mentions_endpoint() {
        let err = DetectionError::StreamUnavailable { endpoint: "rtsp://cam/1".into(), attempts: 5 };
        let msg = err.to_string();
        assert!(msg.contains("rtsp://cam/1"));
        assert!(msg.contains('5'));
        assert_eq!(err.kind(), "stream_unavailable");
    }
}
