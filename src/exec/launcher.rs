use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::exec::error::{ExecError, ExecErrorCode, ExecResult};
use crate::exec::session::{SessionHandle, SessionState, TerminationReply};
use crate::exec::termination::{kill_orphaned_group, terminate_child};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Starts `command` through the configured shell. Output pipes are left on
/// the child for [`supervise`] to take over.
pub fn spawn_shell(shell: &str, command: &str, cwd: &Path) -> ExecResult<Child> {
    let mut cmd = if cfg!(windows) {
        let mut command_builder = Command::new("cmd");
        command_builder.arg("/C").arg(command);
        command_builder
    } else {
        let mut command_builder = Command::new(shell);
        command_builder.arg("-c").arg(command);
        command_builder
    };
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn().map_err(|err| {
        ExecError::new(
            ExecErrorCode::SpawnFailure,
            format!("failed spawning `{command}` in {}: {err}", cwd.display()),
        )
    })
}

pub struct SupervisorSettings {
    pub termination_grace: Duration,
    pub output_settle: Duration,
}

/// Wires the child's pipes into the session buffer and runs the detached
/// supervisor that owns the child until it exits or is terminated.
pub fn supervise(
    mut child: Child,
    session: Arc<SessionHandle>,
    finished_tx: watch::Sender<bool>,
    terminate_rx: mpsc::Receiver<TerminationReply>,
    settings: SupervisorSettings,
) -> JoinHandle<()> {
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_output(stdout, session.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_output(stderr, session.clone())));
    }
    tokio::spawn(run_supervisor(
        child,
        session,
        readers,
        finished_tx,
        terminate_rx,
        settings,
    ))
}

async fn pump_output<R>(mut reader: R, session: Arc<SessionHandle>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => {
                if !session.append_output(&chunk[..read]).await {
                    break;
                }
            }
            Err(err) => {
                debug!("output pipe for {} closed with error: {err}", session.id);
                break;
            }
        }
    }
}

async fn run_supervisor(
    mut child: Child,
    session: Arc<SessionHandle>,
    mut readers: Vec<JoinHandle<()>>,
    finished_tx: watch::Sender<bool>,
    mut terminate_rx: mpsc::Receiver<TerminationReply>,
    settings: SupervisorSettings,
) {
    let pid = child.id();
    loop {
        tokio::select! {
            status = child.wait() => {
                let exit_code = match status {
                    Ok(status) => status.code(),
                    Err(err) => {
                        warn!("wait failed for session {}: {err}", session.id);
                        None
                    }
                };
                // pipes can outlive the child when it leaves background descendants
                let mut orphaned = false;
                for reader in readers.iter_mut() {
                    if timeout(settings.output_settle, &mut *reader).await.is_err() {
                        reader.abort();
                        orphaned = true;
                    }
                }
                if let Some(pid) = pid.filter(|_| orphaned) {
                    match kill_orphaned_group(pid) {
                        Ok(true) => {
                            debug!("session {} killed leftover process group {pid}", session.id)
                        }
                        Ok(false) => {}
                        Err(err) => {
                            warn!("session {} left processes behind: {}", session.id, err.message)
                        }
                    }
                }
                {
                    let mut inner = session.inner.lock().await;
                    inner.buffer.seal();
                    inner.exit_code = exit_code;
                    inner.state = SessionState::CompletedNotDrained;
                }
                info!(
                    "session {} completed (exit_code={})",
                    session.id,
                    exit_code.map(|code| code.to_string()).unwrap_or_else(|| "none".to_owned())
                );
                break;
            }
            Some(reply) = terminate_rx.recv() => {
                session.inner.lock().await.buffer.seal();
                match terminate_child(&mut child, settings.termination_grace).await {
                    Ok((outcome, status)) => {
                        for reader in &readers {
                            reader.abort();
                        }
                        {
                            let mut inner = session.inner.lock().await;
                            inner.exit_code = status.and_then(|status| status.code());
                            inner.state = SessionState::Terminated;
                        }
                        info!("session {} terminated ({})", session.id, outcome.as_str());
                        let _ = reply.send(Ok(outcome));
                        break;
                    }
                    Err(err) => {
                        warn!("session {} termination failed: {}", session.id, err.message);
                        let _ = reply.send(Err(err));
                    }
                }
            }
        }
    }
    let _ = finished_tx.send(true);
}
