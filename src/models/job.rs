use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a prediction job, without its payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl JobStatus {
    /// `Done` and `Failed` never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// Lifecycle state of a job. The result exists only in `Done` and the error
/// only in `Failed`, so a record can never carry both or neither by mistake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status")]
pub enum JobState {
    Pending,
    InProgress,
    Done { result: f64 },
    Failed { error: String },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Pending => JobStatus::Pending,
            JobState::InProgress => JobStatus::InProgress,
            JobState::Done { .. } => JobStatus::Done,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn result(&self) -> Option<f64> {
        match self {
            JobState::Done { result } => Some(*result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobState::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// Rebuild a state from its flattened storage columns.
    pub fn from_columns(
        status: JobStatus,
        result: Option<f64>,
        error: Option<String>,
    ) -> Result<Self, InvalidState> {
        match (status, result, error) {
            (JobStatus::Pending, None, None) => Ok(JobState::Pending),
            (JobStatus::InProgress, None, None) => Ok(JobState::InProgress),
            (JobStatus::Done, Some(result), None) => Ok(JobState::Done { result }),
            (JobStatus::Failed, None, Some(error)) => Ok(JobState::Failed { error }),
            (status, result, error) => Err(InvalidState {
                status,
                has_result: result.is_some(),
                has_error: error.is_some(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("inconsistent job state: status {status} with result={has_result} error={has_error}")]
pub struct InvalidState {
    pub status: JobStatus,
    pub has_result: bool,
    pub has_error: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("job {id} is already {status} and cannot transition")]
pub struct TerminalStateError {
    pub id: Uuid,
    pub status: JobStatus,
}

/// A prediction job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    #[serde(flatten)]
    pub state: JobState,
    /// Validated feature payload, written once at intake.
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh `Pending` job with a new random id.
    pub fn new_pending(params: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: JobState::Pending,
            params,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn mark_in_progress(&self) -> Result<Job, TerminalStateError> {
        self.transition(JobState::InProgress)
    }

    pub fn complete(&self, result: f64) -> Result<Job, TerminalStateError> {
        self.transition(JobState::Done { result })
    }

    pub fn fail(&self, error: impl Into<String>) -> Result<Job, TerminalStateError> {
        self.transition(JobState::Failed {
            error: error.into(),
        })
    }

    fn transition(&self, next: JobState) -> Result<Job, TerminalStateError> {
        if self.is_terminal() {
            return Err(TerminalStateError {
                id: self.id,
                status: self.status(),
            });
        }

        Ok(Job {
            state: next,
            updated_at: Utc::now(),
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new_pending(serde_json::json!({"rooms": 3}));
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.state.result().is_none());
        assert!(job.state.error().is_none());
    }

    #[test]
    fn test_terminal_jobs_reject_transitions() {
        let job = Job::new_pending(serde_json::json!({}));
        let done = job.complete(250_000.0).unwrap();
        assert_eq!(done.state.result(), Some(250_000.0));

        let err = done.fail("late failure").unwrap_err();
        assert_eq!(err.status, JobStatus::Done);
        assert!(done.complete(1.0).is_err());
        assert!(done.mark_in_progress().is_err());

        let failed = job.fail("bad input").unwrap();
        assert!(failed.complete(1.0).is_err());
        assert_eq!(failed.state.error(), Some("bad input"));
    }

    #[test]
    fn test_in_progress_can_finish() {
        let job = Job::new_pending(serde_json::json!({}));
        let running = job.mark_in_progress().unwrap();
        assert_eq!(running.status(), JobStatus::InProgress);
        assert!(running.complete(10.0).is_ok());
    }

    #[test]
    fn test_state_serializes_with_status_tag() {
        let json = serde_json::to_value(JobState::Done { result: 250000.0 }).unwrap();
        assert_eq!(json, serde_json::json!({"status": "Done", "result": 250000.0}));

        let json = serde_json::to_value(JobState::Pending).unwrap();
        assert_eq!(json, serde_json::json!({"status": "Pending"}));
    }

    #[test]
    fn test_from_columns_rejects_inconsistent_rows() {
        assert!(JobState::from_columns(JobStatus::Done, None, None).is_err());
        assert!(JobState::from_columns(JobStatus::Pending, Some(1.0), None).is_err());
        assert!(
            JobState::from_columns(JobStatus::Failed, Some(1.0), Some("x".into())).is_err()
        );
        assert_eq!(
            JobState::from_columns(JobStatus::Failed, None, Some("x".into())).unwrap(),
            JobState::Failed { error: "x".into() }
        );
    }

    #[test]
    fn test_status_string_roundtrip() {
        assert_eq!(JobStatus::InProgress.to_string(), "InProgress");
        assert_eq!(JobStatus::from_str("Done").unwrap(), JobStatus::Done);
        assert!(JobStatus::from_str("done").is_err());
    }
}
