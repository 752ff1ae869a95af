use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{Job, JobState};

/// Feature payload accepted by the price model.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Features {
    #[garde(range(min = 1, max = 100))]
    pub rooms: u32,

    /// Floor area in square metres.
    #[garde(range(min = 1.0, max = 100_000.0))]
    pub area: f64,

    #[garde(range(min = -10, max = 300))]
    pub floor: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("payload does not match the feature schema: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("payload failed validation: {0}")]
    Invalid(#[from] garde::Report),
}

impl Features {
    /// Parse and validate a raw client payload.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, ValidationError> {
        if !payload.is_object() {
            return Err(ValidationError::Schema(serde::de::Error::custom(
                "expected a JSON object",
            )));
        }
        let features: Features = serde_json::from_value(payload.clone())?;
        features.validate()?;
        Ok(features)
    }
}

/// Response after submitting a prediction request.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// Response for polling a job.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub state: JobState,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
        }
    }
}

/// Error body for every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}
