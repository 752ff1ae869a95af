//! Test helper utilities for E2E testing

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Response from POST /api/v1/predictions
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// Response from GET /api/v1/predictions/{job_id}
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub result: Option<f64>,
    pub error: Option<String>,
}

/// Get base URL from env or default to localhost
pub fn base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

/// Submit a features payload; returns the raw response so callers can assert on rejections.
pub async fn submit_features(
    client: &reqwest::Client,
    base_url: &str,
    features: &serde_json::Value,
) -> Result<reqwest::Response, reqwest::Error> {
    client
        .post(format!("{}/api/v1/predictions", base_url))
        .json(features)
        .send()
        .await
}

/// Submit a payload that is expected to be accepted.
pub async fn submit_accepted(
    client: &reqwest::Client,
    base_url: &str,
    features: &serde_json::Value,
) -> Result<SubmitResponse, Box<dyn std::error::Error>> {
    let response = submit_features(client, base_url, features).await?;

    let status = response.status();
    if status != reqwest::StatusCode::ACCEPTED {
        let error_text = response.text().await?;
        return Err(format!("Submit failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<SubmitResponse>().await?)
}

/// Poll job status until Done or Failed (with timeout)
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
    timeout_secs: u64,
) -> Result<JobStatusResponse, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 4; // Poll every 250ms

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/predictions/{}", base_url, job_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let status_response = response.json::<JobStatusResponse>().await?;

        match status_response.status.as_str() {
            "Done" | "Failed" => return Ok(status_response),
            "Pending" | "InProgress" => {
                if attempt % 20 == 0 && attempt > 0 {
                    println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
                }
                sleep(Duration::from_millis(250)).await;
            }
            _ => {
                return Err(format!("Unknown job status: {}", status_response.status).into());
            }
        }
    }

    Err(format!("Job did not finish within {} seconds", timeout_secs).into())
}

/// Wait for the worker to finalize a job
pub async fn wait_for_job_completion(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
) -> Result<JobStatusResponse, Box<dyn std::error::Error>> {
    poll_job_status(client, base_url, job_id, 60).await
}
