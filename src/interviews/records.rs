//! Interview record types shared by the store, the background worker, and
//! the HTTP handlers.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of an uploaded recording.
///
/// Records are created `Pending`, moved to `Processing` by the background
/// worker, and end up `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterviewStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl InterviewStatus {
    /// Stable string form used in the database and in API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            InterviewStatus::Pending => "pending",
            InterviewStatus::Processing => "processing",
            InterviewStatus::Completed => "completed",
            InterviewStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InterviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InterviewStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InterviewStatus::Pending),
            "processing" => Ok(InterviewStatus::Processing),
            "completed" => Ok(InterviewStatus::Completed),
            "failed" => Ok(InterviewStatus::Failed),
            other => Err(AppError::Storage(format!(
                "unknown interview status: {}",
                other
            ))),
        }
    }
}

/// One uploaded interview recording and its transcription state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewRecord {
    /// Identifier, also the key for stored transcript artifacts.
    pub id: String,

    /// Original filename as uploaded by the client.
    pub filename: String,

    /// Where the recording was persisted on disk.
    pub filepath: String,

    pub interviewee: String,

    pub project_name: String,

    /// When the interview took place. Defaults to the upload time.
    pub date: DateTime<Utc>,

    pub status: InterviewStatus,

    /// Path of the plain-text transcript, set on completion.
    pub transcript_path: Option<String>,

    /// Path of the segment-level JSON transcript, set on completion.
    pub segments_path: Option<String>,

    /// Failure message, set when the background transcription fails.
    pub error: Option<String>,
}

impl InterviewRecord {
    /// Fresh record for a just-uploaded recording, pending transcription.
    pub fn new(id: String, filename: String, filepath: String) -> Self {
        Self {
            id,
            filename,
            filepath,
            interviewee: "Unknown".to_string(),
            project_name: "Default Project".to_string(),
            date: Utc::now(),
            status: InterviewStatus::Pending,
            transcript_path: None,
            segments_path: None,
            error: None,
        }
    }

    pub fn with_interviewee(mut self, interviewee: Option<String>) -> Self {
        if let Some(interviewee) = interviewee {
            self.interviewee = interviewee;
        }
        self
    }

    pub fn with_project_name(mut self, project_name: Option<String>) -> Self {
        if let Some(project_name) = project_name {
            self.project_name = project_name;
        }
        self
    }

    pub fn with_date(mut self, date: Option<DateTime<Utc>>) -> Self {
        if let Some(date) = date {
            self.date = date;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            InterviewStatus::Pending,
            InterviewStatus::Processing,
            InterviewStatus::Completed,
            InterviewStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<InterviewStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        assert!("archived".parse::<InterviewStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&InterviewStatus::Processing).unwrap();
        assert_eq!(json, r#""processing""#);
    }

    #[test]
    fn test_new_record_defaults() {
        let record = InterviewRecord::new(
            "abc".to_string(),
            "standup.wav".to_string(),
            "data/uploads/abc_standup.wav".to_string(),
        );

        assert_eq!(record.interviewee, "Unknown");
        assert_eq!(record.project_name, "Default Project");
        assert_eq!(record.status, InterviewStatus::Pending);
        assert_eq!(record.transcript_path, None);
        assert_eq!(record.error, None);
    }

    #[test]
    fn test_builders_override_defaults() {
        let record = InterviewRecord::new(
            "abc".to_string(),
            "standup.wav".to_string(),
            "data/uploads/abc_standup.wav".to_string(),
        )
        .with_interviewee(Some("Ada".to_string()))
        .with_project_name(None);

        assert_eq!(record.interviewee, "Ada");
        assert_eq!(record.project_name, "Default Project");
    }
}
