/// Execution Engine - Compile Once, Run Every Test
///
/// **Core Responsibility:**
/// Prepare an exclusive workspace, compile the submission once, then run the
/// artifact against test inputs one at a time and capture raw outputs.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (adapters, sandbox, limits)
/// - Engine does NOT know scoring rules
/// - Engine does NOT touch the result store
/// - Engine returns raw outputs for the Evaluator to judge
///
/// **Workspace Lifetime:**
/// The workspace is a `TempDir` guard. It is removed when dropped, on every
/// path including panics; the executor closes it explicitly before the
/// terminal status is stored.

use crate::evaluator::TestExecutionOutput;
use crate::languages::LanguageConfig;
use crate::sandbox::{
    effective_uid, run_confined, signal_name, ProcessLimits, ProcessOutcome, SandboxCommand, SandboxPolicy,
    Termination,
};
use anyhow::{Context, Result};
use gavel_common::config::{LimitPolicy, SandboxConfig};
use gavel_common::types::{Limits, TestCase};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INPUT_FILE: &str = "input.txt";

/// Diagnostics kept from a failing compile or a crashing run
const STDERR_CAP: usize = 64 * 1024;

/// Compilers write object files and binaries; user programs get the configured cap
const COMPILE_FILE_SIZE_BYTES: u64 = 256 * 1024 * 1024;
const COMPILE_OPEN_FILES: u64 = 256;

/// Everything one job needs, threaded scheduler → engine → evaluator.
/// No execution state is shared between jobs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub submission_id: Uuid,
    pub language: Arc<LanguageConfig>,
    pub source_code: String,
    pub limits: Limits,
    pub test_cases: Vec<TestCase>,
    pub cancel: CancellationToken,
}

/// Exclusive, ephemeral directory for one submission
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory now, reporting failures instead of ignoring them
    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }

    /// Strip the workspace prefix so diagnostics never reveal host paths
    fn sanitize(&self, text: &str) -> String {
        let prefix = format!("{}/", self.path().display());
        text.replace(&prefix, "")
            .replace(&self.path().display().to_string(), ".")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Success,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(TestExecutionOutput),
    Cancelled,
}

/// Native sandbox engine configured once per judge
#[derive(Debug, Clone)]
pub struct SandboxEngine {
    sandbox: SandboxConfig,
    policy: LimitPolicy,
    confinement: SandboxPolicy,
}

impl SandboxEngine {
    pub fn new(sandbox: SandboxConfig, policy: LimitPolicy) -> Self {
        let run_as = sandbox.effective_run_as(effective_uid());
        if run_as.is_some() && sandbox.run_as_uid.is_none() {
            info!(run_as = ?run_as, "Judge runs as root, submissions drop to an unprivileged user");
        }
        let confinement = SandboxPolicy {
            isolate_network: sandbox.isolate_network,
            run_as,
        };
        Self {
            sandbox,
            policy,
            confinement,
        }
    }

    /// Isolation every sandboxed process of this engine runs under
    pub fn confinement(&self) -> &SandboxPolicy {
        &self.confinement
    }

    /// Create a fresh workspace and write the source file into it
    pub fn prepare(&self, ctx: &JobContext) -> Result<Workspace> {
        fs::create_dir_all(&self.sandbox.workspace_root).with_context(|| {
            format!(
                "Failed to create workspace root {}",
                self.sandbox.workspace_root.display()
            )
        })?;

        let dir = tempfile::Builder::new()
            .prefix("gavel-")
            .tempdir_in(&self.sandbox.workspace_root)
            .context("Failed to create workspace")?;

        let source_path = dir.path().join(&ctx.language.source_file);
        fs::write(&source_path, &ctx.source_code).context("Failed to write source file")?;

        if let Some((uid, gid)) = self.confinement.run_as {
            let owner = (
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(nix::unistd::Gid::from_raw(gid)),
            );
            nix::unistd::chown(dir.path(), owner.0, owner.1)
                .context("Failed to hand workspace to sandbox user")?;
            nix::unistd::chown(&source_path, owner.0, owner.1)
                .context("Failed to hand source file to sandbox user")?;
        }

        debug!(submission_id = %ctx.submission_id, workspace = %dir.path().display(), "workspace prepared");
        Ok(Workspace { dir })
    }

    /// Run the adapter's compile step once. Languages without one succeed trivially.
    #[tracing::instrument(skip_all, fields(submission_id = %ctx.submission_id, language = %ctx.language.name))]
    pub async fn compile(&self, workspace: &Workspace, ctx: &JobContext) -> Result<CompileOutcome> {
        let Some(command) = ctx.language.compile_command(ctx.limits.memory_limit_mb) else {
            return Ok(CompileOutcome::Success);
        };

        info!("Compiling submission");
        let timeout_secs = self.policy.compile_timeout_secs;
        let cmd = SandboxCommand {
            program: &command.program,
            args: &command.args,
            workdir: workspace.path(),
            stdin: b"",
            limits: ProcessLimits {
                address_space_bytes: Some(
                    ctx.language.address_space_bytes(self.policy.compile_memory_mb),
                ),
                cpu_time_secs: timeout_secs + 1,
                file_size_bytes: COMPILE_FILE_SIZE_BYTES,
                open_files: COMPILE_OPEN_FILES.max(self.sandbox.max_open_files),
                processes: None,
            },
            wall_timeout: Duration::from_secs(timeout_secs),
            stdout_cap: STDERR_CAP,
            stderr_cap: STDERR_CAP,
        };

        let outcome = run_confined(&cmd, &self.confinement, &ctx.cancel)
            .await
            .context("Failed to run compiler")?;

        let result = match outcome.termination {
            Termination::Exited(0) => CompileOutcome::Success,
            Termination::Cancelled => CompileOutcome::Cancelled,
            Termination::TimedOut => CompileOutcome::Failed(format!(
                "Compilation timed out after {} s",
                timeout_secs
            )),
            Termination::CpuLimitExceeded => CompileOutcome::Failed(format!(
                "Compilation timed out after {} s",
                timeout_secs
            )),
            _ => CompileOutcome::Failed(workspace.sanitize(&compiler_diagnostics(&outcome))),
        };

        match &result {
            CompileOutcome::Success => info!(wall_ms = outcome.wall_time.as_millis() as u64, "Compilation succeeded"),
            CompileOutcome::Failed(_) => info!("Compilation failed"),
            CompileOutcome::Cancelled => info!("Compilation cancelled"),
        }
        Ok(result)
    }

    /// Execute the compiled artifact against one test input
    #[tracing::instrument(skip_all, fields(submission_id = %ctx.submission_id, test = index))]
    pub async fn run_test(
        &self,
        workspace: &Workspace,
        ctx: &JobContext,
        index: usize,
        test_case: &TestCase,
    ) -> Result<RunOutcome> {
        let input_path = workspace.path().join(INPUT_FILE);
        fs::write(&input_path, &test_case.input).context("Failed to write test input")?;

        let command = ctx.language.run_command(ctx.limits.memory_limit_mb);
        let time_limit = u64::from(ctx.limits.time_limit_secs);
        let cmd = SandboxCommand {
            program: &command.program,
            args: &command.args,
            workdir: workspace.path(),
            stdin: test_case.input.as_bytes(),
            limits: ProcessLimits {
                address_space_bytes: Some(
                    ctx.language
                        .address_space_bytes(u64::from(ctx.limits.memory_limit_mb)),
                ),
                cpu_time_secs: time_limit + 1,
                file_size_bytes: self.sandbox.max_file_size_bytes,
                open_files: self.sandbox.max_open_files,
                processes: self.sandbox.max_processes,
            },
            wall_timeout: Duration::from_secs(time_limit),
            stdout_cap: self.policy.max_output_bytes,
            stderr_cap: STDERR_CAP,
        };

        let outcome = run_confined(&cmd, &self.confinement, &ctx.cancel)
            .await
            .context("Failed to run submission")?;

        let mut output = TestExecutionOutput {
            test: index,
            stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
            stdout_truncated: outcome.stdout_truncated,
            stderr: workspace.sanitize(&String::from_utf8_lossy(&outcome.stderr)),
            execution_time_ms: outcome.wall_time.as_millis() as u64,
            timed_out: false,
            runtime_error: None,
        };

        if outcome.termination == Termination::Cancelled {
            return Ok(RunOutcome::Cancelled);
        }
        (output.timed_out, output.runtime_error) = run_verdict(outcome.termination);

        if output.timed_out {
            output.execution_time_ms = time_limit * 1000;
            warn!(time_limit_secs = time_limit, "Test exceeded time limit");
        }

        info!(
            execution_ms = output.execution_time_ms,
            timed_out = output.timed_out,
            runtime_error = output.runtime_error.is_some(),
            "Test executed"
        );
        Ok(RunOutcome::Completed(output))
    }
}

/// Split a finished run into (timed out, runtime error message)
fn run_verdict(termination: Termination) -> (bool, Option<String>) {
    match termination {
        Termination::Exited(0) | Termination::Cancelled => (false, None),
        Termination::TimedOut | Termination::CpuLimitExceeded => (true, None),
        Termination::Exited(code) => (false, Some(format!("Process exited with code {}", code))),
        Termination::Signaled(sig) => (false, Some(format!("Process killed by {}", signal_name(sig)))),
    }
}

fn compiler_diagnostics(outcome: &ProcessOutcome) -> String {
    let stderr = String::from_utf8_lossy(&outcome.stderr);
    let stdout = String::from_utf8_lossy(&outcome.stdout);
    let combined = match (stderr.trim().is_empty(), stdout.trim().is_empty()) {
        (false, true) => stderr.into_owned(),
        (true, false) => stdout.into_owned(),
        (false, false) => format!("{}\n{}", stderr, stdout),
        (true, true) => match outcome.termination {
            Termination::Exited(code) => format!("Compiler exited with code {}", code),
            Termination::Signaled(sig) => format!("Compiler killed by {}", signal_name(sig)),
            _ => "Compilation failed".to_string(),
        },
    };
    combined.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::CommandSpec;

    fn sh_language() -> Arc<LanguageConfig> {
        Arc::new(LanguageConfig {
            name: "sh".to_string(),
            aliases: vec![],
            version: String::new(),
            source_file: "solution.sh".to_string(),
            binary: None,
            compile: Some(CommandSpec {
                program: "sh".to_string(),
                args: vec!["-n".to_string(), "{source}".to_string()],
            }),
            run: CommandSpec {
                program: "sh".to_string(),
                args: vec!["{source}".to_string()],
            },
            address_space_limit: true,
            runtime_overhead_mb: 0,
        })
    }

    fn engine(root: &Path) -> SandboxEngine {
        let sandbox = SandboxConfig {
            workspace_root: root.to_path_buf(),
            isolate_network: false,
            ..SandboxConfig::default()
        };
        SandboxEngine::new(sandbox, LimitPolicy::default())
    }

    fn context(source: &str) -> JobContext {
        JobContext {
            submission_id: Uuid::new_v4(),
            language: sh_language(),
            source_code: source.to_string(),
            limits: Limits {
                time_limit_secs: 2,
                memory_limit_mb: 64,
            },
            test_cases: vec![],
            cancel: CancellationToken::new(),
        }
    }

    fn test_case(input: &str) -> TestCase {
        TestCase {
            input: input.to_string(),
            expected_output: String::new(),
            description: None,
        }
    }

    #[tokio::test]
    async fn test_workspace_is_fresh_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let ctx = context("echo hi");

        let first = engine.prepare(&ctx).unwrap();
        let second = engine.prepare(&ctx).unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.path().join("solution.sh").exists());
        assert!(first
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("gavel-"));

        first.close().unwrap();
        drop(second);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_compile_failure_strips_workspace_path() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let ctx = context("if then fi (");
        let ws = engine.prepare(&ctx).unwrap();

        match engine.compile(&ws, &ctx).await.unwrap() {
            CompileOutcome::Failed(diagnostics) => {
                assert!(!diagnostics.is_empty());
                assert!(!diagnostics.contains(&root.path().display().to_string()));
            }
            other => panic!("expected compile failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_reads_stdin() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let ctx = context("read a b; echo $((a + b))");
        let ws = engine.prepare(&ctx).unwrap();
        assert_eq!(engine.compile(&ws, &ctx).await.unwrap(), CompileOutcome::Success);

        match engine.run_test(&ws, &ctx, 1, &test_case("2 3\n")).await.unwrap() {
            RunOutcome::Completed(output) => {
                assert_eq!(output.stdout.trim(), "5");
                assert!(!output.timed_out);
                assert!(output.runtime_error.is_none());
                assert!(ws.path().join(INPUT_FILE).exists());
            }
            RunOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_runtime_error() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let ctx = context("exit 7");
        let ws = engine.prepare(&ctx).unwrap();

        match engine.run_test(&ws, &ctx, 1, &test_case("")).await.unwrap() {
            RunOutcome::Completed(output) => {
                assert_eq!(
                    output.runtime_error.as_deref(),
                    Some("Process exited with code 7")
                );
            }
            RunOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn test_timeout_reports_time_limit() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let mut ctx = context("while :; do :; done");
        ctx.limits.time_limit_secs = 1;
        let ws = engine.prepare(&ctx).unwrap();

        match engine.run_test(&ws, &ctx, 1, &test_case("")).await.unwrap() {
            RunOutcome::Completed(output) => {
                assert!(output.timed_out);
                assert_eq!(output.execution_time_ms, 1000);
            }
            RunOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[test]
    fn test_cpu_backstop_reads_as_time_limit() {
        assert_eq!(run_verdict(Termination::CpuLimitExceeded), (true, None));
        assert_eq!(run_verdict(Termination::TimedOut), (true, None));
        assert_eq!(
            run_verdict(Termination::Signaled(libc::SIGKILL)),
            (false, Some("Process killed by SIGKILL".to_string()))
        );
        assert_eq!(
            run_verdict(Termination::Exited(2)),
            (false, Some("Process exited with code 2".to_string()))
        );
    }

    #[test]
    fn test_diagnostics_fall_back_to_exit_code() {
        let outcome = ProcessOutcome {
            termination: Termination::Exited(1),
            stdout: vec![],
            stdout_truncated: false,
            stderr: vec![],
            wall_time: Duration::from_millis(5),
            cpu_time: Duration::from_millis(1),
        };
        assert_eq!(compiler_diagnostics(&outcome), "Compiler exited with code 1");
    }
}
