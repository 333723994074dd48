//! Typed row structs for the four persisted entities.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::prelude::*;

/// A registered user. The tasker never mutates or deletes these; only the
/// admin seeder and the (out-of-scope) HTTP registration path create them.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub login: String,
    pub email: String,
    pub password_hash: String,
    pub is_admin: bool,
}

/// A stored test prompt plus its evaluation contract.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Test {
    pub id: i64,
    pub model: String,
    pub payload: String,
    pub is_active: bool,
    pub total_tokens: Option<i64>,
}

/// The `{task, options, correct_answer}` triple encoded in `Test::payload`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TestCase {
    pub task: String,
    pub options: Vec<String>,
    pub correct_answer: String,
}

impl TestCase {
    /// Parse the canonical JSON payload of a `Test` row.
    pub fn from_payload(payload: &str) -> Result<Self> {
        let parsed: Self =
            serde_json::from_str(payload).context("invalid test payload JSON")?;
        if parsed.options.is_empty() {
            return Err(anyhow!("test case options must be non-empty"));
        }
        if !parsed.options.contains(&parsed.correct_answer) {
            return Err(anyhow!(
                "correct_answer {:?} is not one of the options {:?}",
                parsed.correct_answer,
                parsed.options
            ));
        }
        Ok(parsed)
    }

    /// Encode this test case as the canonical JSON payload stored in
    /// `Test::payload`.
    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize test case")
    }
}

/// A user-submitted (compressing_prompt, compression_model) pair.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Attempt {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub compressing_prompt: String,
    pub model: String,
    pub login: String,
    pub average_compression_ratio: Option<f64>,
}

/// Status of a `TestResult`. `PENDING` is the claim marker; `VALID` and
/// `FAILED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "test_result_status", rename_all = "UPPERCASE")]
pub enum TestResultStatus {
    Pending,
    Valid,
    Failed,
}

/// The outcome of running one attempt against one test.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TestResult {
    pub attempt_id: i64,
    pub test_id: i64,
    pub status: TestResultStatus,
    pub compressed_prompt: Option<String>,
    pub compression_ratio: Option<f64>,
    pub request_json: Option<String>,
    pub last_modified: DateTime<Utc>,
}
