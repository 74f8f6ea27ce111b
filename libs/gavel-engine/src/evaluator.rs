/// Verdict Evaluator - Language-Agnostic Scoring Logic
///
/// **Core Responsibility:**
/// Compare raw execution outputs against expected outputs and classify them.
///
/// **Critical Properties:**
/// - Knows nothing about processes or sandboxes
/// - Knows nothing about language runtimes
/// - Knows nothing about the result store
/// - Pure function: (execution outputs, expected outputs) → verdict
///
/// **Classification Order (per test):**
/// RuntimeError, then TimeLimitExceeded, then output comparison.
///
/// **Aggregation:**
/// Overall status is the highest-precedence non-Accepted test status:
/// CompileError > RuntimeError > TimeLimitExceeded > WrongAnswer > Accepted.
/// CompileError never reaches this module per test; it short-circuits in the
/// executor with an empty result list.

use gavel_common::config::ComparisonPolicy;
use gavel_common::types::{
    ExecutionResult, SubmissionStatus, Summary, TestCase, TestStatus, Verdict,
};
use std::borrow::Cow;
use tracing::info;

/// Raw execution output for a single test case
/// Produced by the engine, consumed by the evaluator
#[derive(Debug, Clone)]
pub struct TestExecutionOutput {
    pub test: usize,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub runtime_error: Option<String>,
}

/// Normalize output string for comparison
///
/// `Trim` removes leading and trailing whitespace only; internal whitespace
/// and case are preserved. `TrimLines` additionally folds CRLF into LF and
/// drops trailing whitespace on every line.
pub fn normalize_output(output: &str, policy: ComparisonPolicy) -> Cow<'_, str> {
    match policy {
        ComparisonPolicy::Trim => Cow::Borrowed(output.trim()),
        ComparisonPolicy::TrimLines => {
            let unified = output.replace("\r\n", "\n");
            let lines: Vec<&str> = unified.split('\n').map(str::trim_end).collect();
            Cow::Owned(lines.join("\n").trim().to_string())
        }
    }
}

/// Evaluate a single test case execution output
pub fn evaluate_test(
    output: &TestExecutionOutput,
    test_case: &TestCase,
    policy: ComparisonPolicy,
) -> ExecutionResult {
    let (status, error) = if let Some(reason) = &output.runtime_error {
        let detail = output.stderr.trim();
        let error = if detail.is_empty() {
            reason.clone()
        } else {
            format!("{}\n{}", reason, detail)
        };
        (TestStatus::RuntimeError, Some(error))
    } else if output.timed_out {
        (
            TestStatus::TimeLimitExceeded,
            Some("Time limit exceeded".to_string()),
        )
    } else {
        let actual = normalize_output(&output.stdout, policy);
        let expected = normalize_output(&test_case.expected_output, policy);

        if actual == expected {
            (TestStatus::Accepted, None)
        } else {
            (TestStatus::WrongAnswer, None)
        }
    };

    ExecutionResult {
        test: output.test,
        status,
        output: output.stdout.clone(),
        output_truncated: output.stdout_truncated,
        execution_time_ms: output.execution_time_ms,
        error,
    }
}

/// Result recorded for a test the judge itself failed to run
pub fn internal_error_result(test: usize) -> ExecutionResult {
    ExecutionResult {
        test,
        status: TestStatus::RuntimeError,
        output: String::new(),
        output_truncated: false,
        execution_time_ms: 0,
        error: Some("Internal judge error".to_string()),
    }
}

/// Overall status for a complete set of per-test results
pub fn aggregate_status(results: &[ExecutionResult]) -> SubmissionStatus {
    results
        .iter()
        .map(|r| r.status)
        .max_by_key(|s| s.precedence())
        .unwrap_or(TestStatus::Accepted)
        .as_submission_status()
}

/// Final verdict once every test has run
pub fn evaluate(results: &[ExecutionResult]) -> Verdict {
    let verdict = Verdict {
        status: aggregate_status(results),
        summary: Summary::from_results(results),
    };

    info!(
        status = %verdict.status,
        passed = verdict.summary.passed,
        total = verdict.summary.total,
        percentage = verdict.summary.percentage,
        "Evaluation complete"
    );

    verdict
}

/// Verdict for a submission that never compiled
pub fn compile_error_verdict() -> Verdict {
    Verdict {
        status: SubmissionStatus::CompileError,
        summary: Summary::from_results(&[]),
    }
}
