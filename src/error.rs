use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for a single job.
///
/// Everything except the broker variants is caught at the dispatcher boundary
/// and turned into either a rejection or a published result. Broker variants
/// end the consume loop.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("malformed job message: {0}")]
    MalformedJobMessage(String),

    #[error("unknown job type '{0}'")]
    UnknownJobType(String),

    #[error("failed to load model for '{job_type}': {reason}")]
    ModelLoad { job_type: String, reason: String },

    #[error("stream connect failed: {0}")]
    StreamConnect(String),

    #[error("frame decode failed: {0}")]
    FrameDecode(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("job expired after {}s", .0.as_secs_f32())]
    DeadlineExceeded(Duration),

    #[error("broker publish failed: {0}")]
    BrokerPublish(String),

    #[error("broker connection closed: {0}")]
    BrokerConnectionClosed(String),
}

impl JobError {
    /// Rejections are decided before any model load or stream connection.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::MalformedJobMessage(_) | Self::UnknownJobType(_))
    }

    /// Broker failures are the only errors allowed out of the dispatcher.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BrokerPublish(_) | Self::BrokerConnectionClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rejections_and_fatal_errors() {
        assert!(JobError::MalformedJobMessage("x".into()).is_rejection());
        assert!(JobError::UnknownJobType("x".into()).is_rejection());
        assert!(!JobError::StreamConnect("x".into()).is_rejection());
        assert!(JobError::BrokerPublish("x".into()).is_fatal());
        assert!(JobError::BrokerConnectionClosed("x".into()).is_fatal());
        assert!(!JobError::Inference("x".into()).is_fatal());
    }

    #[test]
    fn deadline_message_reports_seconds() {
        let err = JobError::DeadlineExceeded(Duration::from_secs(5));
        assert_eq!(err.to_string(), "job expired after 5s");
    }
}
