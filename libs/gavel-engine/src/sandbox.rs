/// Sandbox - Confined Process Execution
///
/// **Core Responsibility:**
/// Spawn one untrusted process under OS-level limits and report how it ended.
///
/// **Confinement (applied in the child between fork and exec):**
/// - New session and process group, so the whole tree can be killed at once
/// - rlimits: AS, CPU, FSIZE, NOFILE, CORE=0, optional NPROC
/// - Optional network namespace and optional uid/gid drop
/// - Cleared environment with a minimal fixed set of variables
///
/// **Watchdog:**
/// A wall-clock timeout and a cancellation token race the child. Whichever
/// fires first kills the process group. The child is reaped with `wait4` so
/// its CPU usage tells a CPU-limit kill apart from other SIGKILLs. The group is also killed after a
/// normal exit so that background strays never outlive their test.
///
/// Knows nothing about languages, test cases or scoring.

use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setgid, setgroups, setuid, Gid, Pid, Uid};
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wait4::{ResUse, Wait4};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Pipes held open by an escaped grandchild must not stall the judge
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8192;

/// Resource ceilings for one process tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLimits {
    pub address_space_bytes: Option<u64>,
    pub cpu_time_secs: u64,
    pub file_size_bytes: u64,
    pub open_files: u64,
    pub processes: Option<u64>,
}

/// Isolation applied to every sandboxed process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub isolate_network: bool,
    pub run_as: Option<(u32, u32)>,
}

#[derive(Debug)]
pub struct SandboxCommand<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub workdir: &'a Path,
    pub stdin: &'a [u8],
    pub limits: ProcessLimits,
    pub wall_timeout: Duration,
    pub stdout_cap: usize,
    pub stderr_cap: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    /// Wall-clock watchdog fired
    TimedOut,
    /// Killed by the RLIMIT_CPU backstop
    CpuLimitExceeded,
    Cancelled,
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr: Vec<u8>,
    pub wall_time: Duration,
    pub cpu_time: Duration,
}

impl ProcessOutcome {
    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited(0)
    }
}

/// Kills the process group when dropped, covering early returns and panics
struct ProcessGroupGuard {
    pgid: Pid,
}

impl ProcessGroupGuard {
    fn kill(&self) {
        // ESRCH just means the group is already gone
        let _ = killpg(self.pgid, Signal::SIGKILL);
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

fn set_limit(resource: Resource, value: u64) -> io::Result<()> {
    setrlimit(resource, value, value)?;
    Ok(())
}

/// Runs in the forked child. Only async-signal-safe calls belong here.
fn confine(limits: &ProcessLimits, policy: &SandboxPolicy) -> io::Result<()> {
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    if policy.isolate_network {
        nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNET)?;
    }

    set_limit(Resource::RLIMIT_CORE, 0)?;
    if let Some(bytes) = limits.address_space_bytes {
        set_limit(Resource::RLIMIT_AS, bytes)?;
    }
    // SIGXCPU at the soft limit, SIGKILL one second later
    setrlimit(
        Resource::RLIMIT_CPU,
        limits.cpu_time_secs,
        limits.cpu_time_secs + 1,
    )?;
    set_limit(Resource::RLIMIT_FSIZE, limits.file_size_bytes)?;
    set_limit(Resource::RLIMIT_NOFILE, limits.open_files)?;
    if let Some(processes) = limits.processes {
        set_limit(Resource::RLIMIT_NPROC, processes)?;
    }

    // Credentials last: unshare and setgroups need the judge's privileges
    if let Some((uid, gid)) = policy.run_as {
        setgroups(&[Gid::from_raw(gid)])?;
        setgid(Gid::from_raw(gid))?;
        setuid(Uid::from_raw(uid))?;
    }

    Ok(())
}

/// Read at most `cap` bytes, then keep draining so the writer never blocks
async fn read_capped<R>(mut reader: R, cap: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(captured.len());
                if n > room {
                    captured.extend_from_slice(&chunk[..room]);
                    truncated = true;
                } else {
                    captured.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    (captured, truncated)
}

async fn join_reader(handle: tokio::task::JoinHandle<(Vec<u8>, bool)>) -> (Vec<u8>, bool) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_GRACE, handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_)) => (Vec::new(), false),
        Err(_) => {
            warn!("Output pipe still open after process group kill, abandoning reader");
            abort.abort();
            (Vec::new(), false)
        }
    }
}

fn async_reader(fd: impl Into<OwnedFd>) -> io::Result<pipe::Receiver> {
    pipe::Receiver::from_file(File::from(fd.into()))
}

/// Map a reaped wait status onto a [`Termination`].
///
/// RLIMIT_CPU sends SIGXCPU at the soft limit and SIGKILL at the hard one.
/// A SIGKILL only counts as the CPU backstop when the process actually used
/// its CPU budget; anything else (OOM killer, self-kill) stays a signal.
fn classify_exit(status: ExitStatus, cpu_time: Duration, limits: &ProcessLimits) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited(code),
        (None, Some(signal)) if signal == libc::SIGXCPU => Termination::CpuLimitExceeded,
        (None, Some(signal))
            if signal == libc::SIGKILL
                && cpu_time >= Duration::from_secs(limits.cpu_time_secs) =>
        {
            Termination::CpuLimitExceeded
        }
        (None, Some(signal)) => Termination::Signaled(signal),
        (None, None) => Termination::Signaled(0),
    }
}

/// Spawn `cmd` confined by `policy` and wait for it under the watchdog.
///
/// Errors are judge-side failures (spawn, confinement, wait). Anything the
/// untrusted program does is reported through [`Termination`].
pub async fn run_confined(
    cmd: &SandboxCommand<'_>,
    policy: &SandboxPolicy,
    cancel: &CancellationToken,
) -> io::Result<ProcessOutcome> {
    let program = if cmd.program.contains('/') && !cmd.program.starts_with('/') {
        cmd.workdir.join(cmd.program)
    } else {
        Path::new(cmd.program).to_path_buf()
    };

    let mut command = Command::new(&program);
    command
        .args(cmd.args)
        .current_dir(cmd.workdir)
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", cmd.workdir)
        .env("LANG", "C.UTF-8")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let limits = cmd.limits.clone();
    let child_policy = policy.clone();
    // SAFETY: `confine` only issues raw syscalls on data moved into the closure
    unsafe {
        command.pre_exec(move || confine(&limits, &child_policy));
    }

    let started = Instant::now();
    let mut child = command.spawn()?;
    let group = ProcessGroupGuard {
        pgid: Pid::from_raw(child.id() as i32),
    };
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // wait4 reaps the child and reports its own CPU usage; the blocking task
    // owns the handle so the zombie is collected even if this future is dropped
    let mut waiter = tokio::task::spawn_blocking(move || {
        let mut child = child;
        child.wait4()
    });

    let stdin_task = match stdin {
        Some(stdin) => {
            let mut stdin = pipe::Sender::from_file(File::from(OwnedFd::from(stdin)))?;
            let input = cmd.stdin.to_vec();
            Some(tokio::spawn(async move {
                // A program that ignores its input closes the pipe early
                if let Err(e) = stdin.write_all(&input).await {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        debug!("stdin write failed: {}", e);
                    }
                }
            }))
        }
        None => None,
    };

    let stdout_task = match stdout {
        Some(out) => Some(tokio::spawn(read_capped(async_reader(out)?, cmd.stdout_cap))),
        None => None,
    };
    let stderr_task = match stderr {
        Some(err) => Some(tokio::spawn(read_capped(async_reader(err)?, cmd.stderr_cap))),
        None => None,
    };

    let (fired, joined) = tokio::select! {
        joined = tokio::time::timeout(cmd.wall_timeout, &mut waiter) => match joined {
            Ok(joined) => (None, Some(joined)),
            Err(_) => (Some(Termination::TimedOut), None),
        },
        _ = cancel.cancelled() => (Some(Termination::Cancelled), None),
    };
    let wall_time = started.elapsed();

    group.kill();
    let joined = match joined {
        Some(joined) => joined,
        None => waiter.await,
    };
    let ResUse { status, rusage } = joined.map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    let cpu_time = rusage.utime + rusage.stime;
    let termination = fired.unwrap_or_else(|| classify_exit(status, cpu_time, &cmd.limits));

    if let Some(task) = stdin_task {
        task.abort();
    }
    let (stdout, stdout_truncated) = match stdout_task {
        Some(task) => join_reader(task).await,
        None => (Vec::new(), false),
    };
    let (stderr, _) = match stderr_task {
        Some(task) => join_reader(task).await,
        None => (Vec::new(), false),
    };

    debug!(
        program = %cmd.program,
        ?termination,
        wall_ms = wall_time.as_millis() as u64,
        cpu_ms = cpu_time.as_millis() as u64,
        maxrss = rusage.maxrss,
        "sandboxed process finished"
    );

    Ok(ProcessOutcome {
        termination,
        stdout,
        stdout_truncated,
        stderr,
        wall_time,
        cpu_time,
    })
}

/// Effective uid of the judge process itself
pub fn effective_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

/// Human-readable name for a signal number, e.g. `SIGSEGV`
pub fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", signal))
}
