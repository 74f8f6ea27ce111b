//! Job intake validation.
//!
//! Everything here runs before a queue slot or workspace is allocated, so a
//! rejected submission costs nothing but the check itself.

use crate::languages::{LanguageConfig, LanguageRegistry};
use gavel_common::config::LimitPolicy;
use gavel_common::error::{JudgeError, JudgeResult};
use gavel_common::types::{Exercise, Limits, TestCase};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Submission against a catalogued exercise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub exercise_id: String,
    pub source_code: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Test case as received from a caller; the expected output may be missing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseSpec {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<TestCase> for TestCaseSpec {
    fn from(tc: TestCase) -> Self {
        Self {
            input: tc.input,
            expected_output: Some(tc.expected_output),
            description: tc.description,
        }
    }
}

/// Submission carrying its own tests and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub source_code: String,
    pub language: String,
    pub test_cases: Vec<TestCaseSpec>,
    #[serde(default)]
    pub time_limit_secs: Option<u32>,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_id: Option<String>,
}

impl JobSpec {
    /// Inline job for an exercise definition
    pub fn for_exercise(request: SubmitRequest, exercise: Exercise) -> Self {
        Self {
            source_code: request.source_code,
            language: request.language,
            test_cases: exercise.test_cases.into_iter().map(Into::into).collect(),
            time_limit_secs: Some(exercise.time_limit_secs),
            memory_limit_mb: Some(exercise.memory_limit_mb),
            owner: request.owner,
            exercise_id: Some(exercise.id),
        }
    }
}

/// A job that passed every intake check
#[derive(Debug, Clone)]
pub struct ValidatedJob {
    pub language: Arc<LanguageConfig>,
    pub source_code: String,
    pub limits: Limits,
    pub test_cases: Vec<TestCase>,
    pub owner: Option<String>,
    pub exercise_id: Option<String>,
}

/// Validate a job, collecting every problem rather than stopping at the first
pub fn validate_job(
    spec: JobSpec,
    registry: &LanguageRegistry,
    policy: &LimitPolicy,
) -> JudgeResult<ValidatedJob> {
    let mut problems = Vec::new();

    let language = registry.resolve(&spec.language);
    if language.is_none() {
        problems.push(format!(
            "unsupported language '{}' (supported: {})",
            spec.language,
            registry.list_languages().join(", ")
        ));
    }

    if spec.source_code.trim().is_empty() {
        problems.push("source code cannot be empty".to_string());
    } else if spec.source_code.len() > policy.max_source_bytes {
        problems.push(format!(
            "source code exceeds {} bytes",
            policy.max_source_bytes
        ));
    }

    let time_limit_secs = spec.time_limit_secs.unwrap_or(policy.default_time_secs);
    if !(policy.min_time_secs..=policy.max_time_secs).contains(&time_limit_secs) {
        problems.push(format!(
            "time limit must be between {} and {} seconds",
            policy.min_time_secs, policy.max_time_secs
        ));
    }

    let memory_limit_mb = spec.memory_limit_mb.unwrap_or(policy.default_memory_mb);
    if !(policy.min_memory_mb..=policy.max_memory_mb).contains(&memory_limit_mb) {
        problems.push(format!(
            "memory limit must be between {} and {} MB",
            policy.min_memory_mb, policy.max_memory_mb
        ));
    }

    if spec.test_cases.is_empty() {
        problems.push("at least one test case is required".to_string());
    }

    let mut test_cases = Vec::with_capacity(spec.test_cases.len());
    for (i, tc) in spec.test_cases.into_iter().enumerate() {
        if tc.input.len() > policy.max_test_input_bytes {
            problems.push(format!(
                "test case {} input exceeds {} bytes",
                i + 1,
                policy.max_test_input_bytes
            ));
        }
        match tc.expected_output {
            Some(expected_output) => test_cases.push(TestCase {
                input: tc.input,
                expected_output,
                description: tc.description,
            }),
            None => problems.push(format!("test case {} has no expected output", i + 1)),
        }
    }

    match language {
        Some(language) if problems.is_empty() => Ok(ValidatedJob {
            language,
            source_code: spec.source_code,
            limits: Limits {
                time_limit_secs,
                memory_limit_mb,
            },
            test_cases,
            owner: spec.owner,
            exercise_id: spec.exercise_id,
        }),
        _ => Err(JudgeError::Validation(problems)),
    }
}
