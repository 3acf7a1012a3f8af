use std::process::ExitStatus;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::exec::error::{ExecError, ExecErrorCode, ExecResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// Nothing to do: the process had already exited or the session was terminal.
    Noop,
    /// Exited within the grace window after the polite signal.
    Graceful,
    /// Needed the forceful kill.
    Forced,
}

impl TerminationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Graceful => "graceful",
            Self::Forced => "forced",
        }
    }
}

/// Escalating stop of a session child: SIGTERM to its process group, wait
/// `grace`, then SIGKILL to the group. The child was spawned as its own group
/// leader so pid == pgid.
pub async fn terminate_child(
    child: &mut Child,
    grace: Duration,
) -> ExecResult<(TerminationOutcome, Option<ExitStatus>)> {
    let Some(pid) = child.id() else {
        return Ok((TerminationOutcome::Noop, child.try_wait().ok().flatten()));
    };

    if !signal_group(pid, GroupSignal::Terminate)? {
        let status = child.wait().await.ok();
        return Ok((TerminationOutcome::Noop, status));
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return Ok((TerminationOutcome::Graceful, Some(status))),
        Ok(Err(err)) => warn!("wait after SIGTERM failed for pid {pid}: {err}"),
        Err(_) => debug!(
            "pid {pid} ignored SIGTERM for {}ms, escalating",
            grace.as_millis()
        ),
    }

    signal_group(pid, GroupSignal::Kill)?;
    let _ = child.start_kill();
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Ok((TerminationOutcome::Forced, Some(status))),
        Ok(Err(err)) => Err(ExecError::new(
            ExecErrorCode::TerminationFailure,
            format!("failed reaping pid {pid} after SIGKILL: {err}"),
        )),
        Err(_) => Err(ExecError::new(
            ExecErrorCode::TerminationFailure,
            format!("pid {pid} still alive after SIGKILL"),
        )),
    }
}

/// SIGKILLs whatever is left of a session's process group after its leader
/// has exited. Returns false when the group is already empty.
pub fn kill_orphaned_group(pid: u32) -> ExecResult<bool> {
    signal_group(pid, GroupSignal::Kill)
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Returns false when the group no longer exists.
#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> ExecResult<bool> {
    let raw = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    let pgid = libc::pid_t::try_from(pid).map_err(|_| {
        ExecError::new(
            ExecErrorCode::Internal,
            format!("pid {pid} does not fit pid_t"),
        )
    })?;
    // SAFETY: killpg only reads its arguments; pgid > 0 targets one group.
    if unsafe { libc::killpg(pgid, raw) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(false);
        }
        return Err(ExecError::new(
            ExecErrorCode::TerminationFailure,
            format!("failed signalling process group {pid}: {err}"),
        ));
    }
    Ok(true)
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) -> ExecResult<bool> {
    // no process groups here; the caller falls back to Child::start_kill
    Ok(true)
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    use tokio::process::Command;

    use super::{terminate_child, TerminationOutcome};

    fn spawn_group(script: &str) -> tokio::process::Child {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        cmd.spawn().expect("spawn sh")
    }

    #[tokio::test]
    async fn sleeping_child_stops_within_grace() {
        let mut child = spawn_group("sleep 30");
        let started = Instant::now();
        let (outcome, status) = terminate_child(&mut child, Duration::from_secs(2))
            .await
            .expect("terminate");
        assert_eq!(outcome, TerminationOutcome::Graceful);
        assert!(status.is_some_and(|status| !status.success()));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn sigterm_ignoring_child_is_force_killed() {
        let mut child = spawn_group("trap '' TERM; while true; do sleep 0.05; done");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (outcome, _) = terminate_child(&mut child, Duration::from_millis(200))
            .await
            .expect("terminate");
        assert_eq!(outcome, TerminationOutcome::Forced);
    }

    #[tokio::test]
    async fn reaped_child_is_noop() {
        let mut child = spawn_group("exit 0");
        let _ = child.wait().await;
        let (outcome, _) = terminate_child(&mut child, Duration::from_millis(100))
            .await
            .expect("terminate");
        assert_eq!(outcome, TerminationOutcome::Noop);
    }
}
