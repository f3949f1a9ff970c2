//! Emulator session: launch, timed wait, group kill and output capture.
//!
//! The emulator collaborator is spawned as the leader of a fresh process
//! group so that anything it forks (the emulator proper, helper daemons) is
//! killed with it. A session moves through
//! `Launched -> AwaitingBoot -> Draining -> Terminated` and is fully torn
//! down before the next one is started.

use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::CommandSpec;
use crate::error::{HarnessError, Result};

/// Granularity of the timed waits. Pipes are emptied once per slice so a
/// chatty emulator never blocks on a full pipe while we sleep.
const PUMP_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Launched,
    AwaitingBoot,
    Draining,
    Terminated,
}

/// Everything captured from one session.
#[derive(Debug)]
pub struct SessionOutcome {
    pub exit_status: Option<ExitStatus>,
    pub output: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes dropped from the front of `output` to stay within the capture
    /// limit.
    pub discarded: usize,
    pub duration: Duration,
}

impl SessionOutcome {
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// One live emulator process group.
pub struct EmulatorSession {
    child: Child,
    pgid: libc::pid_t,
    // Held open for the whole session, never written.
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    output: Vec<u8>,
    errors: Vec<u8>,
    capture_limit: Option<usize>,
    discarded: usize,
    state: SessionState,
    started: Instant,
}

impl EmulatorSession {
    /// Spawn `command` (plus `target`, if any) as a new process-group leader
    /// with all three stdio streams piped to the session.
    pub fn launch(command: &CommandSpec, cwd: &Path, target: Option<&str>) -> Result<Self> {
        let mut cmd = command.command(cwd);
        if let Some(target) = target {
            cmd.arg(target);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        debug!("spawning {:?}", cmd);
        let mut child = cmd.spawn().map_err(|source| HarnessError::Launch {
            command: command.to_string(),
            source,
        })?;

        let session = EmulatorSession {
            pgid: child.id() as libc::pid_t,
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            output: Vec::new(),
            errors: Vec::new(),
            capture_limit: None,
            discarded: 0,
            state: SessionState::Launched,
            started: Instant::now(),
        };

        // On failure the session is dropped here, which kills the group.
        if let Some(stdout) = &session.stdout {
            set_nonblocking(stdout).map_err(|e| HarnessError::io("stdout pipe", e))?;
        }
        if let Some(stderr) = &session.stderr {
            set_nonblocking(stderr).map_err(|e| HarnessError::io("stderr pipe", e))?;
        }

        debug!("session launched, pgid {}", session.pgid);
        Ok(session)
    }

    /// Keep at most `limit` bytes of each stream, discarding the oldest.
    pub fn set_capture_limit(&mut self, limit: Option<usize>) {
        self.capture_limit = limit;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Process-group id (equal to the leader's pid).
    pub fn pgid(&self) -> libc::pid_t {
        self.pgid
    }

    /// Fixed warm-up. There is no readiness handshake with the booted system.
    pub fn await_boot(&mut self, delay: Duration) -> Result<()> {
        self.state = SessionState::AwaitingBoot;
        debug!("waiting {:?} for boot", delay);
        self.pump_for(delay)
    }

    /// Let the system run for its whole budget. Never returns early, even if
    /// the expected output has already appeared.
    pub fn await_budget(&mut self, budget: Duration) -> Result<()> {
        debug!("running for {:?}", budget);
        self.pump_for(budget)
    }

    /// SIGKILL the whole process group. Safe to call repeatedly; a group that
    /// is already gone is not an error.
    ///
    /// Some kernels (Darwin) answer EPERM rather than ESRCH when the only
    /// members left are unreaped zombies. That is accepted once the leader
    /// is known to have exited; it is reaped here.
    pub fn terminate(&mut self) -> Result<()> {
        if let Err(e) = kill_group(self.pgid) {
            let leader_exited = matches!(self.child.try_wait(), Ok(Some(_)));
            if !group_already_dead(&e, leader_exited) {
                return Err(HarnessError::io("failed to kill process group", e));
            }
            debug!("process group {} has only exited members: {}", self.pgid, e);
        }
        self.state = SessionState::Draining;
        Ok(())
    }

    /// Collect whatever is buffered in the pipes, close them and reap the
    /// leader.
    ///
    /// Reads are non-blocking. Polling stops at EOF on both pipes or once
    /// `grace` has passed, whichever is first; a killed group reaches EOF
    /// almost immediately, so `grace` only matters for descendants that
    /// escaped the group and still hold a pipe open.
    pub fn drain(mut self, grace: Duration) -> Result<SessionOutcome> {
        if self.state != SessionState::Draining {
            self.terminate()?;
        }

        let deadline = Instant::now() + grace;
        loop {
            let (out_eof, err_eof) = self.pump()?;
            if (out_eof && err_eof) || Instant::now() >= deadline {
                break;
            }
            thread::sleep(DRAIN_POLL);
        }

        self.close_pipes();
        let exit_status = match self.child.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("failed to reap emulator (pid {}): {}", self.pgid, e);
                None
            }
        };
        self.state = SessionState::Terminated;

        let duration = self.started.elapsed();
        debug!(
            "session ended after {:?}, captured {} bytes ({} discarded)",
            duration,
            self.output.len(),
            self.discarded
        );

        Ok(SessionOutcome {
            exit_status,
            output: std::mem::take(&mut self.output),
            stderr: std::mem::take(&mut self.errors),
            discarded: self.discarded,
            duration,
        })
    }

    /// Move whatever is readable into the buffers. Returns the EOF flags of
    /// stdout and stderr.
    fn pump(&mut self) -> Result<(bool, bool)> {
        let out_eof = read_available(&mut self.stdout, &mut self.output)
            .map_err(|e| HarnessError::io("reading emulator stdout", e))?;
        let err_eof = read_available(&mut self.stderr, &mut self.errors)
            .map_err(|e| HarnessError::io("reading emulator stderr", e))?;
        if let Some(limit) = self.capture_limit {
            self.discarded += keep_tail(&mut self.output, limit);
            keep_tail(&mut self.errors, limit);
        }
        Ok((out_eof, err_eof))
    }

    fn pump_for(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.pump()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(PUMP_INTERVAL.min(deadline - now));
        }
    }

    fn close_pipes(&mut self) {
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();
    }
}

impl Drop for EmulatorSession {
    fn drop(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        if let Err(e) = kill_group(self.pgid) {
            warn!("failed to kill process group {}: {}", self.pgid, e);
        }
        self.close_pipes();
        let _ = self.child.wait();
    }
}

/// Send SIGKILL to every member of process group `pgid`. ESRCH (nothing left
/// to signal) counts as success.
pub fn kill_group(pgid: libc::pid_t) -> io::Result<()> {
    // SAFETY: kill(2) takes plain integers and has no memory-safety
    // requirements; the negative pid addresses the group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!("process group {} already gone", pgid);
        Ok(())
    } else {
        Err(err)
    }
}

/// Whether a failed group kill only means there is nothing left to kill.
fn group_already_dead(err: &io::Error, leader_exited: bool) -> bool {
    match err.raw_os_error() {
        Some(libc::ESRCH) => true,
        Some(libc::EPERM) => leader_exited,
        _ => false,
    }
}

/// Drop the oldest bytes of `buf` beyond `limit`. Returns how many went.
fn keep_tail(buf: &mut Vec<u8>, limit: usize) -> usize {
    let excess = buf.len().saturating_sub(limit);
    if excess > 0 {
        buf.drain(..excess);
    }
    excess
}

/// Switch a pipe to non-blocking reads.
fn set_nonblocking(pipe: &impl AsRawFd) -> io::Result<()> {
    let fd = pipe.as_raw_fd();
    // SAFETY: `fd` is an open descriptor owned by the caller for the
    // duration of both calls.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Append everything currently readable from `pipe` to `buf`.
///
/// Returns `true` once the pipe has hit EOF (it is closed and set to `None`).
fn read_available<R: Read>(pipe: &mut Option<R>, buf: &mut Vec<u8>) -> io::Result<bool> {
    let mut chunk = [0u8; 4096];
    loop {
        let Some(reader) = pipe.as_mut() else {
            return Ok(true);
        };
        match reader.read(&mut chunk) {
            Ok(0) => *pipe = None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Launch, wait out the warm-up and the budget, kill the group and drain it.
pub fn run_session(
    command: &CommandSpec,
    cwd: &Path,
    target: Option<&str>,
    boot_delay: Duration,
    budget: Duration,
    grace: Duration,
    capture_limit: Option<usize>,
) -> Result<SessionOutcome> {
    let mut session = EmulatorSession::launch(command, cwd, target)?;
    session.set_capture_limit(capture_limit);
    session.await_boot(boot_delay)?;
    session.await_budget(budget)?;
    session.terminate()?;
    session.drain(grace)
}
