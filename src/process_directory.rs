use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

use crate::exec::error::{ExecError, ExecErrorCode, ExecResult};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillOutcome {
    pub pid: u32,
    pub success: bool,
    /// The process was already gone when the signal was sent.
    pub already_exited: bool,
}

/// OS-wide, read-only process snapshot ordered by pid. Unrelated to the
/// session registry.
pub async fn list_processes() -> ExecResult<Vec<ProcessEntry>> {
    tokio::task::spawn_blocking(snapshot_processes)
        .await
        .map_err(|err| {
            ExecError::new(
                ExecErrorCode::Internal,
                format!("process listing task failed: {err}"),
            )
        })
}

fn snapshot_processes() -> Vec<ProcessEntry> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let mut rows = system
        .processes()
        .iter()
        .map(|(pid, process)| {
            let cmdline = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                cmdline,
                cpu_percent: process.cpu_usage(),
                memory_bytes: process.memory(),
            }
        })
        .collect::<Vec<_>>();
    rows.sort_by_key(|row| row.pid);
    rows
}

/// Sends SIGTERM to an arbitrary pid. A pid that no longer exists counts as
/// success since the end state is what the caller asked for.
#[cfg(unix)]
pub fn kill_process(pid: u32) -> ExecResult<KillOutcome> {
    let raw = validate_pid(pid)?;
    // SAFETY: kill only reads its arguments; raw > 0 targets exactly one process.
    if unsafe { libc::kill(raw, libc::SIGTERM) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(KillOutcome {
                pid,
                success: true,
                already_exited: true,
            });
        }
        return Err(ExecError::new(
            ExecErrorCode::TerminationFailure,
            format!("failed signalling pid {pid}: {err}"),
        ));
    }
    Ok(KillOutcome {
        pid,
        success: true,
        already_exited: false,
    })
}

#[cfg(not(unix))]
pub fn kill_process(pid: u32) -> ExecResult<KillOutcome> {
    validate_pid(pid)?;
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    let Some(process) = system.process(target) else {
        return Ok(KillOutcome {
            pid,
            success: true,
            already_exited: true,
        });
    };
    if !process.kill() {
        return Err(ExecError::new(
            ExecErrorCode::TerminationFailure,
            format!("failed terminating pid {pid}"),
        ));
    }
    Ok(KillOutcome {
        pid,
        success: true,
        already_exited: false,
    })
}

#[cfg(unix)]
fn validate_pid(pid: u32) -> ExecResult<libc::pid_t> {
    // 0 and anything that wraps negative would address process groups
    match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => Err(invalid_pid(pid)),
    }
}

#[cfg(not(unix))]
fn validate_pid(pid: u32) -> ExecResult<u32> {
    if pid == 0 {
        return Err(invalid_pid(pid));
    }
    Ok(pid)
}

fn invalid_pid(pid: u32) -> ExecError {
    ExecError::new(
        ExecErrorCode::InvalidArgs,
        format!("pid {pid} is not a valid process id"),
    )
}
