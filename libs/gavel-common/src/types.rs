use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a submission.
///
/// `Pending → Compiling → Running → {terminal}`, with `Cancelled` reachable
/// from every non-terminal state. Once terminal, a status never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Compiling,
    Running,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    RuntimeError,
    CompileError,
    Cancelled,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            SubmissionStatus::Pending | SubmissionStatus::Compiling | SubmissionStatus::Running
        )
    }

    fn stage(self) -> u8 {
        match self {
            SubmissionStatus::Pending => 0,
            SubmissionStatus::Compiling => 1,
            SubmissionStatus::Running => 2,
            _ => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Staying in the same non-terminal stage is allowed (progress updates
    /// while running). Nothing leaves a terminal state.
    pub fn can_transition_to(self, next: SubmissionStatus) -> bool {
        !self.is_terminal() && next.stage() >= self.stage()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Compiling => "compiling",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Accepted => "accepted",
            SubmissionStatus::WrongAnswer => "wrong_answer",
            SubmissionStatus::TimeLimitExceeded => "time_limit_exceeded",
            SubmissionStatus::RuntimeError => "runtime_error",
            SubmissionStatus::CompileError => "compile_error",
            SubmissionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubmissionStatus::Pending),
            "compiling" => Ok(SubmissionStatus::Compiling),
            "running" => Ok(SubmissionStatus::Running),
            "accepted" => Ok(SubmissionStatus::Accepted),
            "wrong_answer" => Ok(SubmissionStatus::WrongAnswer),
            "time_limit_exceeded" => Ok(SubmissionStatus::TimeLimitExceeded),
            "runtime_error" => Ok(SubmissionStatus::RuntimeError),
            "compile_error" => Ok(SubmissionStatus::CompileError),
            "cancelled" => Ok(SubmissionStatus::Cancelled),
            other => Err(format!("unknown submission status: {}", other)),
        }
    }
}

/// Outcome of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    RuntimeError,
}

impl TestStatus {
    /// Aggregation precedence, higher wins.
    pub fn precedence(self) -> u8 {
        match self {
            TestStatus::Accepted => 0,
            TestStatus::WrongAnswer => 1,
            TestStatus::TimeLimitExceeded => 2,
            TestStatus::RuntimeError => 3,
        }
    }

    pub fn as_submission_status(self) -> SubmissionStatus {
        match self {
            TestStatus::Accepted => SubmissionStatus::Accepted,
            TestStatus::WrongAnswer => SubmissionStatus::WrongAnswer,
            TestStatus::TimeLimitExceeded => SubmissionStatus::TimeLimitExceeded,
            TestStatus::RuntimeError => SubmissionStatus::RuntimeError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Per-submission resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub time_limit_secs: u32,
    pub memory_limit_mb: u32,
}

/// Result of running one test case. `test` is the 1-based test index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub test: usize,
    pub status: TestStatus,
    pub output: String,
    #[serde(default)]
    pub output_truncated: bool,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub percentage: u32,
}

impl Summary {
    /// Derive the summary from per-test results; only Accepted tests count as passed.
    pub fn from_results(results: &[ExecutionResult]) -> Self {
        let total = results.len();
        let passed = results
            .iter()
            .filter(|r| r.status == TestStatus::Accepted)
            .count();
        let percentage = if total > 0 {
            ((passed as f64 / total as f64) * 100.0).round() as u32
        } else {
            0
        };

        Self {
            total,
            passed,
            failed: total - passed,
            percentage,
        }
    }
}

/// Terminal classification of a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: SubmissionStatus,
    pub summary: Summary,
}

/// The persisted record of one submission.
///
/// `revision` increases by one on every stored update and is what store
/// backends compare-and-swap on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_id: Option<String>,
    pub language: String,
    pub source_code: String,
    pub limits: Limits,
    pub test_cases: Vec<TestCase>,
    pub status: SubmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_test: Option<usize>,
    pub results: Vec<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionRecord {
    pub fn new(
        id: Uuid,
        owner: Option<String>,
        exercise_id: Option<String>,
        language: String,
        source_code: String,
        limits: Limits,
        test_cases: Vec<TestCase>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            exercise_id,
            language,
            source_code,
            limits,
            test_cases,
            status: SubmissionStatus::Pending,
            current_test: None,
            results: Vec::new(),
            compile_output: None,
            execution_time_ms: 0,
            summary: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            submission_id: self.id,
            status: self.status,
            current_test: self.current_test,
            total_tests: self.test_cases.len(),
            results: self.results.clone(),
            execution_time_ms: self.execution_time_ms,
            summary: self.summary,
            compile_output: self.compile_output.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn listing(&self) -> SubmissionListing {
        SubmissionListing {
            submission_id: self.id,
            owner: self.owner.clone(),
            exercise_id: self.exercise_id.clone(),
            language: self.language.clone(),
            status: self.status,
            execution_time_ms: self.execution_time_ms,
            created_at: self.created_at,
        }
    }
}

/// What `getStatus` returns: the latest consistent view of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_test: Option<usize>,
    pub total_tests: usize,
    pub results: Vec<ExecutionResult>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionListing {
    pub submission_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_id: Option<String>,
    pub language: String,
    pub status: SubmissionStatus,
    pub execution_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Pushed to subscribers whenever a submission's stored status changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_test: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(format!("unknown difficulty: {}", other)),
        }
    }
}

fn default_exercise_time() -> u32 {
    5
}

fn default_exercise_memory() -> u32 {
    128
}

/// Exercise definition as provided by the content collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Template shown to submitters before they write anything
    #[serde(default)]
    pub starter_code: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default = "default_exercise_time")]
    pub time_limit_secs: u32,
    #[serde(default = "default_exercise_memory")]
    pub memory_limit_mb: u32,
    #[serde(default)]
    pub difficulty: Difficulty,
}

impl Exercise {
    pub fn limits(&self) -> Limits {
        Limits {
            time_limit_secs: self.time_limit_secs,
            memory_limit_mb: self.memory_limit_mb,
        }
    }

    /// View safe to show to submitters: expected outputs are never included.
    pub fn public_view(&self) -> ExerciseView {
        ExerciseView {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            starter_code: self.starter_code.clone(),
            difficulty: self.difficulty,
            time_limit_secs: self.time_limit_secs,
            memory_limit_mb: self.memory_limit_mb,
            test_cases: self
                .test_cases
                .iter()
                .map(|tc| PublicTestCase {
                    input: tc.input.clone(),
                    description: tc
                        .description
                        .clone()
                        .unwrap_or_else(|| "Test case".to_string()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicTestCase {
    pub input: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseView {
    pub id: String,
    pub title: String,
    pub description: String,
    pub starter_code: String,
    pub difficulty: Difficulty,
    pub time_limit_secs: u32,
    pub memory_limit_mb: u32,
    pub test_cases: Vec<PublicTestCase>,
}
