//! Job messages and terminal session results.
//!
//! A job arrives as one JSON body on the input queue:
//! `{ "source": "<stream URI>", "job_type": "<registry key>" }`.
//! Exactly one `ResultMessage` goes out on the output queue per accepted job.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::JobError;

/// One request to watch a stream source for a detection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub job_type: String,
    pub source: String,
}

#[derive(Debug, Deserialize)]
struct JobMessage {
    source: String,
    job_type: String,
}

impl Job {
    /// Parse a queue message body.
    ///
    /// Registry membership is checked by the caller; this only validates shape.
    pub fn parse(payload: &[u8]) -> Result<Self, JobError> {
        let body = std::str::from_utf8(payload)
            .map_err(|e| JobError::MalformedJobMessage(format!("body is not utf-8: {}", e)))?;
        let msg: JobMessage = serde_json::from_str(body)
            .map_err(|e| JobError::MalformedJobMessage(e.to_string()))?;

        let job_type = msg.job_type.trim();
        if job_type.is_empty() {
            return Err(JobError::MalformedJobMessage("empty job_type".to_string()));
        }
        let source = msg.source.trim();
        Url::parse(source).map_err(|e| {
            JobError::MalformedJobMessage(format!("invalid source '{}': {}", source, e))
        })?;

        Ok(Self {
            job_type: job_type.to_string(),
            source: source.to_string(),
        })
    }
}

/// Terminal outcome of a stream session. One per job.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionResult {
    Found { file: Option<PathBuf> },
    Timeout(String),
    InterpreterError(String),
    Exception(String),
    None,
}

impl SessionResult {
    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Found { .. } => "FOUND",
            Self::Timeout(_) => "TIMEOUT",
            Self::InterpreterError(_) => "INTERPRETER_ERROR",
            Self::Exception(_) => "EXCEPTION",
            Self::None => "NONE",
        }
    }

    fn message_text(&self) -> String {
        match self {
            Self::Found { .. } | Self::None => self.kind().to_string(),
            Self::Timeout(reason) | Self::InterpreterError(reason) | Self::Exception(reason) => {
                format!("{}: {}", self.kind(), reason)
            }
        }
    }

    pub fn to_message(&self, job_type: &str) -> ResultMessage {
        let file = match self {
            Self::Found { file: Some(path) } => Some(path.display().to_string()),
            _ => None,
        };
        ResultMessage {
            job_type: job_type.to_string(),
            message: self.message_text(),
            file,
        }
    }
}

/// Output queue payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub job_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Dead-letter payload for rejected messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RejectedMessage {
    pub reason: String,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_job() {
        let job =
            Job::parse(br#"{"source":"ws://cam1/stream","job_type":"person_detection"}"#).unwrap();
        assert_eq!(job.job_type, "person_detection");
        assert_eq!(job.source, "ws://cam1/stream");
    }

    #[test]
    fn rejects_invalid_json() {
        let err = Job::parse(b"not valid json").unwrap_err();
        assert!(matches!(err, JobError::MalformedJobMessage(_)));
    }

    #[test]
    fn rejects_missing_fields() {
        let err = Job::parse(br#"{"source":"ws://cam1/stream"}"#).unwrap_err();
        assert!(err.to_string().contains("job_type"));
        let err = Job::parse(br#"{"job_type":"person_detection"}"#).unwrap_err();
        assert!(err.to_string().contains("source"));
    }

    #[test]
    fn rejects_unparseable_source() {
        let err = Job::parse(br#"{"source":"cam1 stream","job_type":"person_detection"}"#)
            .unwrap_err();
        assert!(matches!(err, JobError::MalformedJobMessage(_)));
    }

    #[test]
    fn found_result_serializes_file() {
        let result = SessionResult::Found {
            file: Some(PathBuf::from("/images/person_detection-1.jpg")),
        };
        let json = serde_json::to_value(result.to_message("person_detection")).unwrap();
        assert_eq!(json["message"], "FOUND");
        assert_eq!(json["file"], "/images/person_detection-1.jpg");
    }

    #[test]
    fn failure_results_carry_reason_and_omit_file() {
        let json = serde_json::to_value(
            SessionResult::Timeout("job expired after 5s".into()).to_message("person_detection"),
        )
        .unwrap();
        assert_eq!(json["job_type"], "person_detection");
        assert_eq!(json["message"], "TIMEOUT: job expired after 5s");
        assert!(json.get("file").is_none());

        let none = SessionResult::None.to_message("person_detection");
        assert_eq!(none.message, "NONE");
    }
}
